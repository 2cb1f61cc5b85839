//! Wire-protocol serving: request correlation, the wire tool host, and the
//! WebSocket endpoint.

pub mod host;
pub mod pending;
pub mod ws;

pub use host::WireToolHost;
pub use pending::PendingRequests;
pub use ws::router;
