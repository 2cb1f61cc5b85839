//! Wire-protocol payload shapes.
//!
//! All messages are JSON objects discriminated by a `type` field, carried
//! over an ordered bidirectional channel (a WebSocket in practice). Request
//! shaped actions carry a `requestId` echoed back by their response; the
//! pending-request table correlates them.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::state::AgentOutput;
use crate::agent::template::AgentTemplate;
use crate::message::{ToolCall, ToolResult, ToolResultPart};
use crate::session::SessionState;
use crate::tools::CustomToolDefinition;

/// Cost mode requested by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CostMode {
    /// Cheapest models.
    Lite,
    /// Default models.
    #[default]
    Normal,
    /// Most capable models.
    Max,
}

/// A `prompt` action: one user input to run through the main agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptPayload {
    /// Id identifying this input; used for chunk routing and cancellation.
    pub prompt_id: String,
    /// The user's prompt text.
    pub prompt: String,
    /// Device fingerprint.
    #[serde(default)]
    pub fingerprint_id: String,
    /// Authentication token.
    #[serde(default)]
    pub auth_token: String,
    /// Requested cost mode.
    #[serde(default)]
    pub cost_mode: CostMode,
    /// Prior session snapshot; a fresh session is created when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_state: Option<Box<SessionState>>,
    /// Results for tool calls left pending by a previous response.
    #[serde(default)]
    pub tool_results: Vec<ToolResult>,
    /// Agent template overrides, merged by id.
    #[serde(default)]
    pub agent_definitions: Vec<AgentTemplate>,
    /// Custom tool overrides, merged by name.
    #[serde(default)]
    pub custom_tool_definitions: Vec<CustomToolDefinition>,
    /// Replacement project file set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_files: Option<BTreeMap<String, String>>,
    /// Replacement knowledge file set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub knowledge_files: Option<HashMap<String, String>>,
    /// Step budget for the main agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_agent_steps: Option<u32>,
}

/// Actions the client sends to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientAction {
    /// Run a prompt.
    #[serde(rename = "prompt")]
    Prompt(PromptPayload),

    /// Announce a client session.
    #[serde(rename = "init", rename_all = "camelCase")]
    Init {
        /// Device fingerprint.
        #[serde(default)]
        fingerprint_id: String,
        /// Authentication token.
        #[serde(default)]
        auth_token: String,
    },

    /// Cancel a running prompt.
    #[serde(rename = "cancel-user-input", rename_all = "camelCase")]
    CancelUserInput {
        /// Id of the prompt to cancel.
        prompt_id: String,
        /// Authentication token.
        #[serde(default)]
        auth_token: String,
    },

    /// Answer to a `read-files` request.
    #[serde(rename = "read-files-response", rename_all = "camelCase")]
    ReadFilesResponse {
        /// Correlation id.
        request_id: String,
        /// File contents by path; `null` for unreadable files.
        files: HashMap<String, Option<String>>,
    },

    /// Answer to a `tool-call-request`.
    #[serde(rename = "tool-call-response", rename_all = "camelCase")]
    ToolCallResponse {
        /// Correlation id.
        request_id: String,
        /// The result parts.
        output: Vec<ToolResultPart>,
    },

    /// Answer to a `request-mcp-tool-data`.
    #[serde(rename = "mcp-tool-data", rename_all = "camelCase")]
    McpToolData {
        /// Correlation id.
        request_id: String,
        /// Tool definitions discovered on the client.
        #[serde(default)]
        tools: Vec<CustomToolDefinition>,
    },
}

/// One streaming chunk inside a `response-chunk` action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PrintChunk {
    /// An agent run started.
    #[serde(rename_all = "camelCase")]
    Start {
        /// Agent the chunk belongs to.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
        /// History length at run start.
        message_history_length: usize,
    },
    /// Plain output text.
    #[serde(rename_all = "camelCase")]
    Text {
        /// The text delta.
        text: String,
        /// Agent the chunk belongs to.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
    },
    /// Reasoning text.
    #[serde(rename_all = "camelCase")]
    Reasoning {
        /// The reasoning delta.
        text: String,
        /// Agent the chunk belongs to.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
    },
    /// A tool call is about to dispatch.
    #[serde(rename_all = "camelCase")]
    ToolCall {
        /// Call id.
        tool_call_id: String,
        /// Tool name.
        tool_name: String,
        /// Call input.
        input: Value,
        /// Agent the call belongs to.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
        /// Nearest ancestor agent id, for child agents.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_agent_id: Option<String>,
    },
    /// A tool call completed.
    #[serde(rename_all = "camelCase")]
    ToolResult {
        /// Call id.
        tool_call_id: String,
        /// Result parts.
        output: Vec<ToolResultPart>,
        /// Agent the result belongs to.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
        /// Nearest ancestor agent id, for child agents.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_agent_id: Option<String>,
    },
    /// A child agent started.
    #[serde(rename_all = "camelCase")]
    SubagentStart {
        /// The child's agent id.
        agent_id: String,
        /// The child's template id.
        agent_type: String,
        /// The spawning agent's id.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_agent_id: Option<String>,
    },
    /// A child agent reached terminal state.
    #[serde(rename_all = "camelCase")]
    SubagentFinish {
        /// The child's agent id.
        agent_id: String,
        /// The spawning agent's id.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_agent_id: Option<String>,
    },
    /// The prompt finished.
    #[serde(rename_all = "camelCase")]
    Finish {
        /// Agent the chunk belongs to.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
        /// Total credits consumed by the run tree.
        total_cost: f64,
    },
}

/// Actions the server sends to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerAction {
    /// A streaming chunk for the main agent.
    #[serde(rename = "response-chunk", rename_all = "camelCase")]
    ResponseChunk {
        /// The prompt this chunk belongs to.
        user_input_id: String,
        /// The chunk.
        chunk: PrintChunk,
    },

    /// A streaming chunk from a child agent.
    #[serde(rename = "subagent-response-chunk", rename_all = "camelCase")]
    SubagentResponseChunk {
        /// The prompt this chunk belongs to.
        user_input_id: String,
        /// The emitting agent's id.
        agent_id: String,
        /// The emitting agent's template id.
        agent_type: String,
        /// The chunk.
        chunk: PrintChunk,
        /// Prompt the child was spawned with, on its first chunk.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompt: Option<String>,
        /// Whether the client should fold this into the main transcript.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        forward_to_prompt: Option<bool>,
    },

    /// Ask the client for file contents.
    #[serde(rename = "read-files", rename_all = "camelCase")]
    ReadFiles {
        /// Correlation id.
        request_id: String,
        /// Paths to read.
        file_paths: Vec<String>,
    },

    /// Ask the client to execute a tool.
    #[serde(rename = "tool-call-request", rename_all = "camelCase")]
    ToolCallRequest {
        /// Correlation id.
        request_id: String,
        /// The prompt this call belongs to.
        user_input_id: String,
        /// Tool name.
        tool_name: String,
        /// Call input.
        input: Value,
        /// Seconds before the server gives up; absent means no timeout.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout: Option<f64>,
        /// Custom-tool configuration forwarded verbatim.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mcp_config: Option<Value>,
    },

    /// Ask the client for its MCP tool definitions.
    #[serde(rename = "request-mcp-tool-data", rename_all = "camelCase")]
    RequestMcpToolData {
        /// Correlation id.
        request_id: String,
        /// Which MCP configuration to enumerate.
        mcp_config: Value,
    },

    /// Final answer for a prompt.
    #[serde(rename = "prompt-response", rename_all = "camelCase")]
    PromptResponse {
        /// The prompt this answers.
        prompt_id: String,
        /// Updated session snapshot.
        session_state: Box<SessionState>,
        /// Tool calls issued by the main agent.
        tool_calls: Vec<ToolCall>,
        /// Their results.
        tool_results: Vec<ToolResult>,
        /// The main agent's output.
        output: AgentOutput,
    },

    /// A prompt failed before producing a response.
    #[serde(rename = "prompt-error", rename_all = "camelCase")]
    PromptError {
        /// The prompt that failed.
        user_input_id: String,
        /// Failure description.
        message: String,
    },

    /// Usage counters after a prompt.
    #[serde(rename = "usage-response", rename_all = "camelCase")]
    UsageResponse {
        /// Credits consumed by the last prompt.
        credits_used: f64,
    },

    /// A log line from sandboxed `handleSteps` code.
    #[serde(rename = "handlesteps-log-chunk", rename_all = "camelCase")]
    HandlestepsLogChunk {
        /// The prompt this log belongs to.
        user_input_id: String,
        /// The agent whose sandbox logged.
        agent_id: String,
        /// Log level.
        level: String,
        /// Rendered message.
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actions_use_kebab_case_type_tags() {
        let action = ServerAction::PromptError {
            user_input_id: "p1".into(),
            message: "nope".into(),
        };
        let json = serde_json::to_value(&action).expect("serialize");
        assert_eq!(json["type"], "prompt-error");
        assert_eq!(json["userInputId"], "p1");
    }

    #[test]
    fn prompt_action_round_trips() {
        let raw = serde_json::json!({
            "type": "prompt",
            "promptId": "p1",
            "prompt": "ls -la",
            "fingerprintId": "dev-1",
            "authToken": "",
            "costMode": "normal",
            "toolResults": [],
        });
        let action: ClientAction = serde_json::from_value(raw).expect("deserialize");
        match action {
            ClientAction::Prompt(payload) => {
                assert_eq!(payload.prompt_id, "p1");
                assert_eq!(payload.cost_mode, CostMode::Normal);
                assert!(payload.session_state.is_none());
            }
            other => panic!("expected prompt, got {other:?}"),
        }
    }

    #[test]
    fn chunks_use_snake_case_type_tags() {
        let chunk = PrintChunk::SubagentStart {
            agent_id: "child".into(),
            agent_type: "reviewer".into(),
            parent_agent_id: Some("parent".into()),
        };
        let json = serde_json::to_value(&chunk).expect("serialize");
        assert_eq!(json["type"], "subagent_start");
        assert_eq!(json["parentAgentId"], "parent");

        let chunk = PrintChunk::Finish {
            agent_id: None,
            total_cost: 0.25,
        };
        let json = serde_json::to_value(&chunk).expect("serialize");
        assert_eq!(json["type"], "finish");
        assert_eq!(json["totalCost"], 0.25);
        assert!(json.get("agentId").is_none());
    }

    #[test]
    fn tool_call_request_omits_absent_timeout() {
        let action = ServerAction::ToolCallRequest {
            request_id: "r1".into(),
            user_input_id: "p1".into(),
            tool_name: "run_terminal_command".into(),
            input: serde_json::json!({"command": "ls"}),
            timeout: None,
            mcp_config: None,
        };
        let json = serde_json::to_value(&action).expect("serialize");
        assert_eq!(json["type"], "tool-call-request");
        assert!(json.get("timeout").is_none());
        assert!(json.get("mcpConfig").is_none());
    }
}
