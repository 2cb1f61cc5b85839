//! Message and tool-call types shared across the runtime.
//!
//! A conversation is an ordered list of [`Message`]s. Tool invocations move
//! through the system as [`ToolCall`]s and come back as [`ToolResult`]s whose
//! output is an ordered list of [`ToolResultPart`]s. The `timeToLive` and
//! `keepDuringTruncation` markers are carried verbatim for later history
//! compaction; the runtime itself never drops messages based on them.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Role of a message in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System message providing instructions.
    System,
    /// User message.
    User,
    /// Assistant (model) message.
    Assistant,
    /// Tool result message.
    Tool,
}

/// Expiry marker for injected prompt messages.
///
/// Consumed by history compaction, which is outside this runtime; the loop
/// only tags messages and preserves existing tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum TimeToLive {
    /// Lives until the next user prompt.
    UserPrompt,
    /// Lives until the next agent step.
    AgentStep,
}

/// A tool invocation, produced either by the stream parser from LLM output
/// or yielded by a `handleSteps` generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    /// Unique identifier for this call.
    pub tool_call_id: String,
    /// Name of the tool being invoked.
    pub tool_name: String,
    /// Structured input value.
    pub input: Value,
    /// Id of the agent that owns this call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

impl ToolCall {
    /// Create a call with a freshly generated id.
    #[must_use]
    pub fn new(tool_name: impl Into<String>, input: Value) -> Self {
        Self {
            tool_call_id: uuid::Uuid::new_v4().to_string(),
            tool_name: tool_name.into(),
            input,
            agent_id: None,
        }
    }

    /// Attach the owning agent id.
    #[must_use]
    pub fn with_agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }
}

/// One element of a tool result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolResultPart {
    /// Structured JSON output.
    Json {
        /// The output value.
        value: Value,
    },
    /// Plain text output.
    Text {
        /// The output text.
        text: String,
    },
}

impl ToolResultPart {
    /// Create a json part.
    #[must_use]
    pub const fn json(value: Value) -> Self {
        Self::Json { value }
    }

    /// Create a text part.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Create an error part carrying `{errorMessage}`.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Json {
            value: serde_json::json!({ "errorMessage": message.into() }),
        }
    }

    /// Returns the error message if this part carries one.
    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Json { value } => value.get("errorMessage").and_then(Value::as_str),
            Self::Text { .. } => None,
        }
    }

    /// Returns `true` if this part carries an `{errorMessage}`.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error_message().is_some()
    }
}

/// The completed result of one tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    /// Id of the call this result answers.
    pub tool_call_id: String,
    /// Name of the tool that produced it.
    pub tool_name: String,
    /// Ordered result parts.
    pub output: Vec<ToolResultPart>,
}

impl ToolResult {
    /// Create a result from parts.
    #[must_use]
    pub fn new(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        output: Vec<ToolResultPart>,
    ) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            output,
        }
    }

    /// Create a single-part error result for a call.
    #[must_use]
    pub fn error(call: &ToolCall, message: impl Into<String>) -> Self {
        Self::new(
            call.tool_call_id.clone(),
            call.tool_name.clone(),
            vec![ToolResultPart::error(message)],
        )
    }

    /// Returns `true` if any part carries an error.
    #[must_use]
    pub fn has_error(&self) -> bool {
        self.output.iter().any(ToolResultPart::is_error)
    }
}

/// Content of a message: plain text or a structured tool result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    /// Text content.
    Text {
        /// The text.
        text: String,
    },
    /// A structured tool result.
    ToolResult {
        /// The result payload.
        result: ToolResult,
    },
}

impl MessageContent {
    /// Returns the text if this is a text content.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            Self::ToolResult { .. } => None,
        }
    }
}

/// A single message in an agent's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Role of the sender.
    pub role: Role,
    /// Content of the message.
    pub content: MessageContent,
    /// Optional expiry marker, preserved verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_to_live: Option<TimeToLive>,
    /// Protects the message from later history truncation.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub keep_during_truncation: bool,
}

impl Message {
    fn text_message(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: MessageContent::Text { text: text.into() },
            time_to_live: None,
            keep_during_truncation: false,
        }
    }

    /// Create a system message.
    #[must_use]
    pub fn system(text: impl Into<String>) -> Self {
        Self::text_message(Role::System, text)
    }

    /// Create a user message.
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self::text_message(Role::User, text)
    }

    /// Create an assistant message.
    #[must_use]
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::text_message(Role::Assistant, text)
    }

    /// Create a tool message carrying a structured result.
    #[must_use]
    pub const fn tool(result: ToolResult) -> Self {
        Self {
            role: Role::Tool,
            content: MessageContent::ToolResult { result },
            time_to_live: None,
            keep_during_truncation: false,
        }
    }

    /// Tag the message with an expiry marker.
    #[must_use]
    pub const fn with_ttl(mut self, ttl: TimeToLive) -> Self {
        self.time_to_live = Some(ttl);
        self
    }

    /// Protect the message from truncation.
    #[must_use]
    pub const fn kept(mut self) -> Self {
        self.keep_during_truncation = true;
        self
    }

    /// Returns the message text, if it is a text message.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        self.content.as_text()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_part_round_trips() {
        let part = ToolResultPart::error("boom");
        assert!(part.is_error());
        assert_eq!(part.error_message(), Some("boom"));

        let json = serde_json::to_value(&part).expect("serialize");
        assert_eq!(json["type"], "json");
        assert_eq!(json["value"]["errorMessage"], "boom");
    }

    #[test]
    fn message_flags_serialize_camel_case() {
        let msg = Message::user("hi")
            .with_ttl(TimeToLive::UserPrompt)
            .kept();
        let json = serde_json::to_value(&msg).expect("serialize");
        assert_eq!(json["timeToLive"], "userPrompt");
        assert_eq!(json["keepDuringTruncation"], true);
        assert_eq!(json["content"]["type"], "text");

        // Default flags are omitted from the wire form.
        let plain = serde_json::to_value(Message::assistant("ok")).expect("serialize");
        assert!(plain.get("timeToLive").is_none());
        assert!(plain.get("keepDuringTruncation").is_none());
    }

    #[test]
    fn tool_message_carries_result() {
        let call = ToolCall::new("read_files", serde_json::json!({"paths": ["a.txt"]}));
        let result = ToolResult::error(&call, "no such file");
        let msg = Message::tool(result.clone());
        assert_eq!(msg.role, Role::Tool);
        assert!(msg.text().is_none());
        match msg.content {
            MessageContent::ToolResult { result: r } => assert_eq!(r, result),
            MessageContent::Text { .. } => panic!("expected tool result content"),
        }
    }
}
