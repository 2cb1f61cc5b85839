//! Canonical text rendering of tool calls and results.
//!
//! The LLM emits tool invocations inside a `<codebuff_tool_call>` envelope
//! whose body is a single JSON object carrying the tool name under
//! `cb_tool_name` next to the input fields. The same form is used when a
//! call is written back into an assistant message, so history and stream
//! stay consistent. Results echo into the conversation inside a
//! `<tool_result>` envelope, which the stream parser strips from outbound
//! text when a model repeats them.

use serde_json::{Map, Value};

use crate::message::{ToolCall, ToolResult};

/// Opening delimiter of a tool-call envelope.
pub const TOOL_CALL_OPEN: &str = "<codebuff_tool_call>";
/// Closing delimiter of a tool-call envelope.
pub const TOOL_CALL_CLOSE: &str = "</codebuff_tool_call>";
/// Opening delimiter of an echoed tool-result envelope.
pub const TOOL_RESULT_OPEN: &str = "<tool_result>";
/// Closing delimiter of an echoed tool-result envelope.
pub const TOOL_RESULT_CLOSE: &str = "</tool_result>";
/// Key carrying the tool name inside the envelope body.
pub const TOOL_NAME_KEY: &str = "cb_tool_name";

/// Render a call into its canonical envelope form.
///
/// The tool name is serialized first so the rendered body reads the same way
/// the model writes it. Non-object inputs are nested under an `input` key.
#[must_use]
pub fn render_tool_call(call: &ToolCall) -> String {
    let mut body = Map::new();
    body.insert(
        TOOL_NAME_KEY.to_owned(),
        Value::String(call.tool_name.clone()),
    );
    match &call.input {
        Value::Object(fields) => {
            for (key, value) in fields {
                body.insert(key.clone(), value.clone());
            }
        }
        Value::Null => {}
        other => {
            body.insert("input".to_owned(), other.clone());
        }
    }
    let json = serde_json::to_string(&Value::Object(body)).unwrap_or_default();
    format!("{TOOL_CALL_OPEN}\n{json}\n{TOOL_CALL_CLOSE}")
}

/// Render a result into its `<tool_result>` envelope form.
#[must_use]
pub fn render_tool_result(result: &ToolResult) -> String {
    let json = serde_json::to_string(result).unwrap_or_default();
    format!("{TOOL_RESULT_OPEN}\n{json}\n{TOOL_RESULT_CLOSE}")
}

/// Undo `&amp;` escaping in terminal command inputs before dispatch.
#[must_use]
pub fn unescape_command(command: &str) -> String {
    command.replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_puts_tool_name_first() {
        let call = ToolCall::new("write_file", serde_json::json!({"path": "a.txt"}));
        let rendered = render_tool_call(&call);
        assert!(rendered.starts_with(TOOL_CALL_OPEN));
        assert!(rendered.ends_with(TOOL_CALL_CLOSE));
        assert!(rendered.contains(r#""cb_tool_name":"write_file""#));
        assert!(rendered.contains(r#""path":"a.txt""#));
    }

    #[test]
    fn render_wraps_non_object_input() {
        let call = ToolCall::new("end_turn", Value::Null);
        let rendered = render_tool_call(&call);
        assert!(rendered.contains(r#"{"cb_tool_name":"end_turn"}"#));

        let call = ToolCall::new("odd", Value::String("x".into()));
        assert!(render_tool_call(&call).contains(r#""input":"x""#));
    }

    #[test]
    fn unescape_only_touches_ampersands() {
        assert_eq!(unescape_command("a &amp;&amp; b"), "a && b");
        assert_eq!(unescape_command("plain"), "plain");
    }
}
