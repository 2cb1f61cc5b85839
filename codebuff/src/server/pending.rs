//! Correlation table for request-shaped wire actions.
//!
//! Each outgoing request places a one-shot sender keyed by its
//! `requestId`; the matching response (or a timeout/cancel eviction)
//! consumes it. Both maps are mutex-guarded: they are the only wire-protocol
//! state shared across tasks.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;
use tracing::debug;

use crate::message::ToolResultPart;

type FileMap = HashMap<String, Option<String>>;

/// In-memory `requestId -> resolver` table.
#[derive(Debug, Default)]
pub struct PendingRequests {
    tools: Mutex<HashMap<String, oneshot::Sender<Vec<ToolResultPart>>>>,
    files: Mutex<HashMap<String, oneshot::Sender<FileMap>>>,
}

impl PendingRequests {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool-call request and receive its resolver.
    pub fn register_tool(&self, request_id: &str) -> oneshot::Receiver<Vec<ToolResultPart>> {
        let (tx, rx) = oneshot::channel();
        if let Ok(mut tools) = self.tools.lock() {
            tools.insert(request_id.to_owned(), tx);
        }
        rx
    }

    /// Resolve a tool-call request; `false` when the entry was already
    /// evicted or never existed.
    pub fn resolve_tool(&self, request_id: &str, output: Vec<ToolResultPart>) -> bool {
        let sender = self
            .tools
            .lock()
            .ok()
            .and_then(|mut tools| tools.remove(request_id));
        match sender {
            Some(sender) => sender.send(output).is_ok(),
            None => {
                debug!(request_id, "tool-call response without a waiter");
                false
            }
        }
    }

    /// Register a read-files request and receive its resolver.
    pub fn register_files(&self, request_id: &str) -> oneshot::Receiver<FileMap> {
        let (tx, rx) = oneshot::channel();
        if let Ok(mut files) = self.files.lock() {
            files.insert(request_id.to_owned(), tx);
        }
        rx
    }

    /// Resolve a read-files request.
    pub fn resolve_files(&self, request_id: &str, files: FileMap) -> bool {
        let sender = self
            .files
            .lock()
            .ok()
            .and_then(|mut pending| pending.remove(request_id));
        match sender {
            Some(sender) => sender.send(files).is_ok(),
            None => {
                debug!(request_id, "read-files response without a waiter");
                false
            }
        }
    }

    /// Drop a request on timeout or cancellation.
    pub fn evict(&self, request_id: &str) {
        if let Ok(mut tools) = self.tools.lock() {
            tools.remove(request_id);
        }
        if let Ok(mut files) = self.files.lock() {
            files.remove(request_id);
        }
    }

    /// Number of in-flight requests.
    #[must_use]
    pub fn len(&self) -> usize {
        let tools = self.tools.lock().map(|t| t.len()).unwrap_or(0);
        let files = self.files.lock().map(|f| f.len()).unwrap_or(0);
        tools + files
    }

    /// `true` when nothing is in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_by_request_id() {
        let pending = PendingRequests::new();
        let rx = pending.register_tool("r1");
        assert_eq!(pending.len(), 1);

        assert!(pending.resolve_tool("r1", vec![ToolResultPart::text("ok")]));
        let parts = rx.await.expect("resolved");
        assert_eq!(parts, vec![ToolResultPart::text("ok")]);
        assert!(pending.is_empty());
    }

    #[test]
    fn unknown_ids_do_not_resolve() {
        let pending = PendingRequests::new();
        assert!(!pending.resolve_tool("ghost", Vec::new()));
    }

    #[tokio::test]
    async fn eviction_drops_the_waiter() {
        let pending = PendingRequests::new();
        let rx = pending.register_tool("r2");
        pending.evict("r2");
        assert!(pending.is_empty());
        assert!(rx.await.is_err());
        // A late response after eviction is a no-op.
        assert!(!pending.resolve_tool("r2", Vec::new()));
    }
}
