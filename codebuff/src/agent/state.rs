//! Per-run agent bookkeeping and run outputs.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::Message;

/// Mutable per-run state of one agent instance.
///
/// Created when the agent is spawned, mutated only by its own loop, and
/// persisted into the session snapshot when the run ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentState {
    /// Stable agent identifier inside the tree.
    pub agent_id: String,
    /// Identifier of this run of the agent.
    pub run_id: String,
    /// Template id this agent was instantiated from.
    pub agent_type: String,
    /// Parent agent id; absent for the main agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Conversation history.
    #[serde(default)]
    pub message_history: Vec<Message>,
    /// Structured output accumulated via `set_output`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// LLM turns still allowed; decreases monotonically, never negative.
    pub steps_remaining: u32,
    /// Credits consumed directly by this agent's own LLM turns.
    #[serde(default)]
    pub direct_credits_used: f64,
    /// Run ids of every direct child, in spawn order.
    #[serde(default)]
    pub child_run_ids: Vec<String>,
    /// Free-form scratchpad shared with `handleSteps` code.
    #[serde(default)]
    pub agent_context: HashMap<String, Value>,
}

impl AgentState {
    /// Create the state for a freshly spawned agent.
    #[must_use]
    pub fn new(agent_type: impl Into<String>, parent_id: Option<String>, steps: u32) -> Self {
        Self {
            agent_id: uuid::Uuid::new_v4().to_string(),
            run_id: uuid::Uuid::new_v4().to_string(),
            agent_type: agent_type.into(),
            parent_id,
            message_history: Vec::new(),
            output: None,
            steps_remaining: steps,
            direct_credits_used: 0.0,
            child_run_ids: Vec::new(),
            agent_context: HashMap::new(),
        }
    }

    /// The redacted view handed to `handleSteps` generators.
    #[must_use]
    pub fn public_view(&self) -> PublicAgentState {
        PublicAgentState {
            agent_id: self.agent_id.clone(),
            run_id: self.run_id.clone(),
            parent_id: self.parent_id.clone(),
            message_history: self.message_history.clone(),
            output: self.output.clone(),
        }
    }

    /// Text of the last assistant message, if any.
    #[must_use]
    pub fn last_assistant_text(&self) -> Option<&str> {
        self.message_history
            .iter()
            .rev()
            .find(|m| m.role == crate::message::Role::Assistant)
            .and_then(Message::text)
    }
}

/// Redacted agent state passed into each generator step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicAgentState {
    /// Agent id.
    pub agent_id: String,
    /// Run id.
    pub run_id: String,
    /// Parent agent id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Current conversation history.
    #[serde(default)]
    pub message_history: Vec<Message>,
    /// Current structured output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

/// Final output of one agent run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AgentOutput {
    /// Structured value conforming to the template's output schema.
    StructuredOutput {
        /// The structured value.
        value: Value,
    },
    /// Text of the last assistant message.
    LastMessage {
        /// The message text.
        value: String,
    },
    /// Every message appended after the run's boundary marker.
    AllMessages {
        /// The messages.
        value: Vec<Message>,
    },
    /// The run failed.
    Error {
        /// Failure description.
        message: String,
    },
}

impl AgentOutput {
    /// Create an error output.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Returns `true` for error outputs.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    /// The output as a JSON value, the shape child results take inside a
    /// parent's tool result.
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl PartialEq for AgentState {
    fn eq(&self, other: &Self) -> bool {
        self.agent_id == other.agent_id && self.run_id == other.run_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_view_redacts_bookkeeping() {
        let mut state = AgentState::new("base", None, 10);
        state.agent_context.insert("secret".into(), Value::Bool(true));
        state.message_history.push(Message::user("hi"));

        let view = state.public_view();
        assert_eq!(view.agent_id, state.agent_id);
        assert_eq!(view.message_history.len(), 1);
        let json = serde_json::to_value(&view).expect("serialize");
        assert!(json.get("agentContext").is_none());
        assert!(json.get("stepsRemaining").is_none());
    }

    #[test]
    fn output_serializes_with_type_tag() {
        let output = AgentOutput::LastMessage {
            value: "done".into(),
        };
        let json = serde_json::to_value(&output).expect("serialize");
        assert_eq!(json["type"], "lastMessage");
        assert_eq!(json["value"], "done");

        let err = AgentOutput::error("boom");
        let json = err.to_value();
        assert_eq!(json["type"], "error");
        assert_eq!(json["message"], "boom");
    }

    #[test]
    fn last_assistant_text_skips_tool_messages() {
        let mut state = AgentState::new("base", None, 5);
        state.message_history.push(Message::assistant("first"));
        state.message_history.push(Message::tool(
            crate::message::ToolResult::new("id", "read_files", vec![]),
        ));
        assert_eq!(state.last_assistant_text(), Some("first"));
    }
}
