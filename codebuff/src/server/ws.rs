//! WebSocket endpoint wiring the engine to real sockets.

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::{any, get};
use futures::{SinkExt as _, StreamExt as _};
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::protocol::{ClientAction, ServerAction};

/// Build the server router: `/ws` for the protocol, `/healthz` for probes.
#[must_use]
pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/ws", any(ws_handler))
        .route("/healthz", get(healthz))
        .with_state(engine)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn ws_handler(
    State(engine): State<Arc<Engine>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, engine))
}

/// Serve one client connection: fan outbound actions into the socket and
/// dispatch inbound actions to the engine.
pub async fn handle_socket(socket: WebSocket, engine: Arc<Engine>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<ServerAction>();

    let writer = tokio::spawn(async move {
        while let Some(action) = rx.recv().await {
            match serde_json::to_string(&action) {
                Ok(text) => {
                    if sink.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "failed to serialize outbound action"),
            }
        }
    });

    info!("client connected");
    while let Some(Ok(message)) = stream.next().await {
        let text = match message {
            WsMessage::Text(text) => text,
            WsMessage::Close(_) => break,
            _ => continue,
        };
        let action: ClientAction = match serde_json::from_str(text.as_str()) {
            Ok(action) => action,
            Err(e) => {
                warn!(error = %e, "unparseable client action");
                continue;
            }
        };
        dispatch(&engine, &tx, action);
    }
    info!("client disconnected");
    writer.abort();
}

fn dispatch(
    engine: &Arc<Engine>,
    tx: &tokio::sync::mpsc::UnboundedSender<ServerAction>,
    action: ClientAction,
) {
    match action {
        ClientAction::Prompt(payload) => {
            let engine = Arc::clone(engine);
            let tx = tx.clone();
            tokio::spawn(async move {
                engine.handle_prompt(payload, tx).await;
            });
        }
        ClientAction::CancelUserInput { prompt_id, .. } => {
            engine.cancel(&prompt_id);
        }
        ClientAction::ToolCallResponse { request_id, output } => {
            engine.resolve_tool_call(&request_id, output);
        }
        ClientAction::ReadFilesResponse { request_id, files } => {
            engine.resolve_read_files(&request_id, files);
        }
        ClientAction::Init { fingerprint_id, .. } => {
            debug!(fingerprint_id, "client init");
            let _ = tx.send(ServerAction::UsageResponse { credits_used: 0.0 });
        }
        ClientAction::McpToolData { request_id, tools } => {
            debug!(request_id, tools = tools.len(), "mcp tool data received");
        }
    }
}
