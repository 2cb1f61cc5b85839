//! Streaming tool-call parser.
//!
//! Consumes the lazy chunk sequence of one LLM turn and splits it into
//! plain-text deltas and fully-formed tool calls. Text emission is
//! prefix-monotonic: every emitted delta is appended verbatim to what was
//! already emitted, and any buffer suffix that could still turn into an
//! envelope delimiter is withheld until the ambiguity resolves. Echoed
//! `<tool_result>` envelopes are stripped from outbound text.

use std::sync::Arc;

use serde_json::Value;

use crate::llm::LlmChunk;
use crate::message::ToolCall;
use crate::tools::render::{
    TOOL_CALL_CLOSE, TOOL_CALL_OPEN, TOOL_NAME_KEY, TOOL_RESULT_CLOSE, TOOL_RESULT_OPEN,
};
use crate::tools::ToolRegistry;

/// One event produced by the parser.
#[derive(Debug, Clone, PartialEq)]
pub enum ParserEvent {
    /// Plain-text delta outside any envelope.
    Text(String),
    /// Reasoning delta, passed through.
    Reasoning(String),
    /// A complete, validated tool call.
    ToolCall(ToolCall),
    /// A malformed invocation.
    ToolCallError {
        /// The raw envelope body.
        raw: String,
        /// Why it was rejected.
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Text,
    InToolCall,
    InToolResult,
}

/// Incremental parser for one LLM turn.
#[derive(Debug)]
pub struct StreamParser {
    registry: Arc<ToolRegistry>,
    buf: String,
    state: State,
    ended: bool,
}

impl StreamParser {
    /// Create a parser validating against the given registry.
    #[must_use]
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            buf: String::new(),
            state: State::Text,
            ended: false,
        }
    }

    /// `true` once a step-ending tool call has been parsed; no further text
    /// or reasoning is emitted after that point.
    #[must_use]
    pub const fn ended(&self) -> bool {
        self.ended
    }

    /// Feed one chunk and collect the events it completes.
    ///
    /// Provider error chunks terminate the turn at the scheduler level and
    /// must not be fed here.
    pub fn push(&mut self, chunk: &LlmChunk) -> Vec<ParserEvent> {
        match chunk {
            LlmChunk::Text { text } => {
                self.buf.push_str(text);
                self.process()
            }
            LlmChunk::Reasoning { text } => {
                if self.ended || text.is_empty() {
                    Vec::new()
                } else {
                    vec![ParserEvent::Reasoning(text.clone())]
                }
            }
            LlmChunk::Error { .. } => Vec::new(),
        }
    }

    /// Flush the parser at end of stream.
    ///
    /// Withheld text that never became a delimiter is released; an
    /// unterminated tool-call envelope becomes a structured error.
    pub fn finish(&mut self) -> Vec<ParserEvent> {
        let mut events = Vec::new();
        match self.state {
            State::Text => {
                let rest = std::mem::take(&mut self.buf);
                self.emit_text(rest, &mut events);
            }
            State::InToolCall => {
                let raw = std::mem::take(&mut self.buf);
                events.push(ParserEvent::ToolCallError {
                    raw,
                    reason: "Unterminated tool call".to_owned(),
                });
            }
            State::InToolResult => {
                self.buf.clear();
            }
        }
        self.state = State::Text;
        events
    }

    fn emit_text(&self, text: String, events: &mut Vec<ParserEvent>) {
        if !text.is_empty() && !self.ended {
            events.push(ParserEvent::Text(text));
        }
    }

    fn process(&mut self) -> Vec<ParserEvent> {
        let mut events = Vec::new();
        loop {
            match self.state {
                State::Text => {
                    if !self.scan_text(&mut events) {
                        break;
                    }
                }
                State::InToolCall => {
                    let Some(idx) = self.buf.find(TOOL_CALL_CLOSE) else {
                        break;
                    };
                    let tail = self.buf.split_off(idx);
                    let body = std::mem::replace(&mut self.buf, tail);
                    self.buf.drain(..TOOL_CALL_CLOSE.len());
                    events.push(self.finish_call(body));
                    self.state = State::Text;
                }
                State::InToolResult => {
                    let Some(idx) = self.buf.find(TOOL_RESULT_CLOSE) else {
                        break;
                    };
                    self.buf.drain(..idx + TOOL_RESULT_CLOSE.len());
                    self.state = State::Text;
                }
            }
        }
        events
    }

    /// Scan the buffer in text mode. Returns `true` if a delimiter was
    /// consumed and processing should continue.
    fn scan_text(&mut self, events: &mut Vec<ParserEvent>) -> bool {
        let open_call = self.buf.find(TOOL_CALL_OPEN);
        let open_result = self.buf.find(TOOL_RESULT_OPEN);

        let earliest = match (open_call, open_result) {
            (Some(a), Some(b)) if a <= b => Some((a, State::InToolCall, TOOL_CALL_OPEN.len())),
            (Some(a), None) => Some((a, State::InToolCall, TOOL_CALL_OPEN.len())),
            (_, Some(b)) => Some((b, State::InToolResult, TOOL_RESULT_OPEN.len())),
            (None, None) => None,
        };

        match earliest {
            Some((idx, next_state, tag_len)) => {
                let tail = self.buf.split_off(idx);
                let text = std::mem::replace(&mut self.buf, tail);
                self.emit_text(text, events);
                self.buf.drain(..tag_len);
                self.state = next_state;
                true
            }
            None => {
                // Withhold any suffix that could still be a delimiter prefix.
                let keep = self.tag_prefix_suffix();
                let emit_len = self.buf.len() - keep;
                if emit_len > 0 {
                    let tail = self.buf.split_off(emit_len);
                    let text = std::mem::replace(&mut self.buf, tail);
                    self.emit_text(text, events);
                }
                false
            }
        }
    }

    /// Length of the longest buffer suffix that is a proper prefix of one
    /// of the recognized opening delimiters.
    fn tag_prefix_suffix(&self) -> usize {
        let max = TOOL_CALL_OPEN.len().max(TOOL_RESULT_OPEN.len()) - 1;
        let mut longest = 0;
        for k in 1..=self.buf.len().min(max) {
            let start = self.buf.len() - k;
            if !self.buf.is_char_boundary(start) {
                continue;
            }
            let suffix = &self.buf[start..];
            if TOOL_CALL_OPEN.starts_with(suffix) || TOOL_RESULT_OPEN.starts_with(suffix) {
                longest = k;
            }
        }
        longest
    }

    fn finish_call(&mut self, raw: String) -> ParserEvent {
        let value: Value = match serde_json::from_str(raw.trim()) {
            Ok(value) => value,
            Err(e) => {
                return ParserEvent::ToolCallError {
                    raw,
                    reason: format!("Invalid JSON: {e}"),
                };
            }
        };
        let Value::Object(mut fields) = value else {
            return ParserEvent::ToolCallError {
                raw,
                reason: "Invalid JSON: tool call body must be an object".to_owned(),
            };
        };
        let name = match fields.remove(TOOL_NAME_KEY) {
            Some(Value::String(name)) => name,
            _ => {
                return ParserEvent::ToolCallError {
                    raw,
                    reason: format!("Missing {TOOL_NAME_KEY}"),
                };
            }
        };
        let input = Value::Object(fields);
        if let Err(reason) = self.registry.validate_input(&name, &input) {
            return ParserEvent::ToolCallError { raw, reason };
        }
        if self.registry.ends_step(&name) {
            self.ended = true;
        }
        ParserEvent::ToolCall(ToolCall::new(name, input))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> StreamParser {
        StreamParser::new(Arc::new(ToolRegistry::new()))
    }

    fn feed(parser: &mut StreamParser, pieces: &[&str]) -> Vec<ParserEvent> {
        let mut events = Vec::new();
        for piece in pieces {
            events.extend(parser.push(&LlmChunk::text(*piece)));
        }
        events.extend(parser.finish());
        events
    }

    fn collected_text(events: &[ParserEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                ParserEvent::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    fn tool_calls(events: &[ParserEvent]) -> Vec<&ToolCall> {
        events
            .iter()
            .filter_map(|e| match e {
                ParserEvent::ToolCall(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    const WRITE_CALL: &str = concat!(
        "<codebuff_tool_call>\n",
        r#"{"cb_tool_name":"write_file","path":"a.txt","content":"hi"}"#,
        "\n</codebuff_tool_call>"
    );

    #[test]
    fn plain_text_passes_through() {
        let mut p = parser();
        let events = feed(&mut p, &["hello ", "world"]);
        assert_eq!(collected_text(&events), "hello world");
        assert!(tool_calls(&events).is_empty());
    }

    #[test]
    fn whole_envelope_in_one_chunk() {
        let mut p = parser();
        let events = feed(&mut p, &[&format!("before {WRITE_CALL}")]);
        assert_eq!(collected_text(&events), "before ");
        let calls = tool_calls(&events);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].tool_name, "write_file");
        assert_eq!(calls[0].input["path"], "a.txt");
        assert_eq!(calls[0].input["content"], "hi");
    }

    #[test]
    fn split_pattern_does_not_change_the_parse() {
        let stream = format!("alpha {WRITE_CALL} omega");
        let reference = feed(&mut parser(), &[&stream]);

        // Split at every byte boundary that is a char boundary.
        for split in 1..stream.len() {
            if !stream.is_char_boundary(split) {
                continue;
            }
            let mut p = parser();
            let events = feed(&mut p, &[&stream[..split], &stream[split..]]);
            let ref_calls: Vec<_> = tool_calls(&reference)
                .iter()
                .map(|c| (c.tool_name.clone(), c.input.clone()))
                .collect();
            let got_calls: Vec<_> = tool_calls(&events)
                .iter()
                .map(|c| (c.tool_name.clone(), c.input.clone()))
                .collect();
            assert_eq!(ref_calls, got_calls, "split at {split}");
            // write_file ends the step, so trailing text is suppressed in
            // every split pattern alike.
            assert_eq!(collected_text(&events), "alpha ", "split at {split}");
        }
    }

    #[test]
    fn withholds_possible_delimiter_prefix() {
        let mut p = parser();
        let events = p.push(&LlmChunk::text("text <codebuff_t"));
        assert_eq!(collected_text(&events), "text ");

        // The suffix turned out not to be a delimiter after all.
        let events = p.push(&LlmChunk::text("rap"));
        let mut all = events;
        all.extend(p.finish());
        assert_eq!(collected_text(&all), "<codebuff_trap");
    }

    #[test]
    fn invalid_json_yields_one_error() {
        let mut p = parser();
        let stream =
            "<codebuff_tool_call>\n{ \"cb_tool_name\":\"read_files\", invalid }\n</codebuff_tool_call>";
        let events = feed(&mut p, &[stream]);
        let errors: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ParserEvent::ToolCallError { reason, .. } => Some(reason.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("Invalid JSON"));
        assert!(tool_calls(&events).is_empty());
    }

    #[test]
    fn unknown_tool_is_reported() {
        let mut p = parser();
        let stream = "<codebuff_tool_call>\n{\"cb_tool_name\":\"frobnicate\"}\n</codebuff_tool_call>";
        let events = feed(&mut p, &[stream]);
        match &events[0] {
            ParserEvent::ToolCallError { reason, .. } => {
                assert_eq!(reason, "Tool frobnicate not found");
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn schema_mismatch_is_reported() {
        let mut p = parser();
        let stream =
            "<codebuff_tool_call>\n{\"cb_tool_name\":\"read_files\",\"paths\":\"a\"}\n</codebuff_tool_call>";
        let events = feed(&mut p, &[stream]);
        assert!(matches!(events[0], ParserEvent::ToolCallError { .. }));
    }

    #[test]
    fn echoed_tool_results_are_stripped() {
        let mut p = parser();
        let events = feed(
            &mut p,
            &["before <tool_result>\n{\"anything\": 1}\n</tool_result> after"],
        );
        assert_eq!(collected_text(&events), "before  after");
    }

    #[test]
    fn text_stops_after_end_turn() {
        let mut p = parser();
        let stream =
            "done<codebuff_tool_call>\n{\"cb_tool_name\":\"end_turn\"}\n</codebuff_tool_call>ignored";
        let events = feed(&mut p, &[stream]);
        assert_eq!(collected_text(&events), "done");
        assert_eq!(tool_calls(&events).len(), 1);
        assert!(p.ended());
    }

    #[test]
    fn reasoning_passes_through() {
        let mut p = parser();
        let events = p.push(&LlmChunk::reasoning("thinking"));
        assert_eq!(events, vec![ParserEvent::Reasoning("thinking".into())]);
    }

    #[test]
    fn unterminated_envelope_errors_at_finish() {
        let mut p = parser();
        let _ = p.push(&LlmChunk::text("<codebuff_tool_call>\n{\"cb_tool_name\":"));
        let events = p.finish();
        assert!(matches!(
            events.as_slice(),
            [ParserEvent::ToolCallError { reason, .. }] if reason == "Unterminated tool call"
        ));
    }

    #[test]
    fn duplicate_envelopes_parse_as_two_calls() {
        // No deduplication: a model that streams the same call twice gets
        // two executions, each with its own id.
        let stream = format!(
            "<codebuff_tool_call>\n{{\"cb_tool_name\":\"read_files\",\"paths\":[\"a\"]}}\n</codebuff_tool_call>\
             <codebuff_tool_call>\n{{\"cb_tool_name\":\"read_files\",\"paths\":[\"a\"]}}\n</codebuff_tool_call>"
        );
        let events = feed(&mut parser(), &[&stream]);
        let calls = tool_calls(&events);
        assert_eq!(calls.len(), 2);
        assert_ne!(calls[0].tool_call_id, calls[1].tool_call_id);
    }
}
