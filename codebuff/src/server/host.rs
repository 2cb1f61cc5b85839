//! Wire-backed tool host: delegates calls to the connected client.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use super::pending::PendingRequests;
use crate::bridge::ToolHost;
use crate::engine::{CancelSignal, Outbound};
use crate::message::ToolResultPart;
use crate::protocol::ServerAction;
use crate::tools::{ReadFilesInput, names};

/// Server-side half of the client tool bridge: serializes each call into a
/// `tool-call-request` (or `read-files`) action and awaits the correlated
/// response, with timeout and cancellation eviction.
#[derive(Debug)]
pub struct WireToolHost {
    pending: Arc<PendingRequests>,
    outbound: Outbound,
    user_input_id: String,
    cancel: CancelSignal,
}

impl WireToolHost {
    /// Create a host bound to one prompt's outbound channel.
    #[must_use]
    pub fn new(
        pending: Arc<PendingRequests>,
        outbound: Outbound,
        user_input_id: String,
        cancel: CancelSignal,
    ) -> Self {
        Self {
            pending,
            outbound,
            user_input_id,
            cancel,
        }
    }

    async fn read_files(&self, input: &Value) -> Vec<ToolResultPart> {
        let parsed: ReadFilesInput = match serde_json::from_value(input.clone()) {
            Ok(parsed) => parsed,
            Err(e) => return vec![ToolResultPart::error(format!("invalid input: {e}"))],
        };

        let request_id = uuid::Uuid::new_v4().to_string();
        let mut rx = self.pending.register_files(&request_id);
        self.outbound.send(ServerAction::ReadFiles {
            request_id: request_id.clone(),
            file_paths: parsed.paths,
        });

        let outcome = tokio::select! {
            response = &mut rx => response.ok(),
            () = self.cancel.cancelled() => None,
            () = tokio::time::sleep(crate::bridge::DEFAULT_TOOL_TIMEOUT) => None,
        };
        match outcome {
            Some(files) => vec![ToolResultPart::json(serde_json::json!({ "files": files }))],
            None => {
                self.pending.evict(&request_id);
                vec![ToolResultPart::error(
                    "timed out waiting for the client to read files",
                )]
            }
        }
    }
}

#[async_trait]
impl ToolHost for WireToolHost {
    async fn call(
        &self,
        tool_name: &str,
        input: &Value,
        timeout: Option<Duration>,
        mcp_config: Option<&Value>,
    ) -> Vec<ToolResultPart> {
        if tool_name == names::READ_FILES {
            return self.read_files(input).await;
        }

        let request_id = uuid::Uuid::new_v4().to_string();
        let mut rx = self.pending.register_tool(&request_id);
        debug!(tool = tool_name, request_id = %request_id, "delegating tool call to client");
        self.outbound.send(ServerAction::ToolCallRequest {
            request_id: request_id.clone(),
            user_input_id: self.user_input_id.clone(),
            tool_name: tool_name.to_owned(),
            input: input.clone(),
            timeout: timeout.map(|t| t.as_secs_f64()),
            mcp_config: mcp_config.cloned(),
        });

        enum Waited {
            Resolved(Vec<ToolResultPart>),
            Cancelled,
            TimedOut,
        }

        let outcome = match timeout {
            Some(limit) => tokio::select! {
                response = &mut rx => response.map_or(Waited::TimedOut, Waited::Resolved),
                () = self.cancel.cancelled() => Waited::Cancelled,
                () = tokio::time::sleep(limit) => Waited::TimedOut,
            },
            None => tokio::select! {
                response = &mut rx => response.map_or(Waited::TimedOut, Waited::Resolved),
                () = self.cancel.cancelled() => Waited::Cancelled,
            },
        };

        match outcome {
            Waited::Resolved(parts) => parts,
            Waited::Cancelled => {
                self.pending.evict(&request_id);
                vec![ToolResultPart::error("Run cancelled by user")]
            }
            Waited::TimedOut => {
                warn!(tool = tool_name, request_id = %request_id, "client tool call timed out");
                self.pending.evict(&request_id);
                vec![ToolResultPart::error(format!(
                    "timed out waiting for the client to run {tool_name}"
                ))]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> (
        WireToolHost,
        tokio::sync::mpsc::UnboundedReceiver<ServerAction>,
        Arc<PendingRequests>,
        CancelSignal,
    ) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let pending = Arc::new(PendingRequests::new());
        let cancel = CancelSignal::new();
        let host = WireToolHost::new(
            Arc::clone(&pending),
            Outbound::new(tx),
            "p1".to_owned(),
            cancel.clone(),
        );
        (host, rx, pending, cancel)
    }

    #[tokio::test]
    async fn round_trips_a_tool_call() {
        let (host, mut rx, pending, _cancel) = host();
        let call = tokio::spawn(async move {
            host.call(
                "run_terminal_command",
                &serde_json::json!({"command": "ls"}),
                Some(Duration::from_secs(5)),
                None,
            )
            .await
        });

        let action = rx.recv().await.expect("request emitted");
        let ServerAction::ToolCallRequest {
            request_id,
            tool_name,
            ..
        } = action
        else {
            panic!("expected tool-call-request");
        };
        assert_eq!(tool_name, "run_terminal_command");
        assert!(pending.resolve_tool(&request_id, vec![ToolResultPart::text("done")]));

        let parts = call.await.expect("join");
        assert_eq!(parts, vec![ToolResultPart::text("done")]);
    }

    #[tokio::test]
    async fn timeout_evicts_and_errors() {
        let (host, _rx, pending, _cancel) = host();
        let parts = host
            .call(
                "run_terminal_command",
                &serde_json::json!({"command": "ls"}),
                Some(Duration::from_millis(20)),
                None,
            )
            .await;
        assert!(parts[0].is_error());
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn cancellation_resolves_promptly() {
        let (host, _rx, _pending, cancel) = host();
        let call = tokio::spawn(async move {
            host.call(
                "run_terminal_command",
                &serde_json::json!({"command": "sleep 100"}),
                None,
                None,
            )
            .await
        });
        tokio::task::yield_now().await;
        cancel.cancel();
        let parts = call.await.expect("join");
        assert_eq!(
            parts[0].error_message(),
            Some("Run cancelled by user")
        );
    }
}
