//! End-to-end scenarios driven through the engine with a scripted provider
//! and a recording tool host.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use codebuff::agent::{AgentTemplate, NativeSteps, OutputMode};
use codebuff::bridge::ToolHost;
use codebuff::engine::{Engine, EngineConfig};
use codebuff::llm::LlmChunk;
use codebuff::llm::mock::ScriptedProvider;
use codebuff::message::{Role, ToolResultPart};
use codebuff::protocol::{PrintChunk, PromptPayload, ServerAction};
use codebuff::scheduler::{ScriptedSteps, StepYield};
use codebuff::session::SessionState;
use codebuff::agent::AgentOutput;

/// Tool host that records every delegated call and replays canned parts.
#[derive(Debug, Default)]
struct RecordingToolHost {
    calls: Mutex<Vec<(String, Value)>>,
    responses: Mutex<HashMap<String, Vec<ToolResultPart>>>,
}

impl RecordingToolHost {
    fn respond_with(&self, tool_name: &str, parts: Vec<ToolResultPart>) {
        self.responses
            .lock()
            .expect("lock")
            .insert(tool_name.to_owned(), parts);
    }

    fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().expect("lock").clone()
    }
}

#[async_trait]
impl ToolHost for RecordingToolHost {
    async fn call(
        &self,
        tool_name: &str,
        input: &Value,
        _timeout: Option<Duration>,
        _mcp_config: Option<&Value>,
    ) -> Vec<ToolResultPart> {
        self.calls
            .lock()
            .expect("lock")
            .push((tool_name.to_owned(), input.clone()));
        self.responses
            .lock()
            .expect("lock")
            .get(tool_name)
            .cloned()
            .unwrap_or_else(|| vec![ToolResultPart::json(json!({"ok": true}))])
    }
}

fn envelope(mut body: serde_json::Map<String, Value>, tool_name: &str) -> String {
    let mut full = serde_json::Map::new();
    full.insert("cb_tool_name".to_owned(), Value::String(tool_name.into()));
    full.append(&mut body);
    format!(
        "<codebuff_tool_call>\n{}\n</codebuff_tool_call>",
        Value::Object(full)
    )
}

fn end_turn_envelope() -> String {
    envelope(serde_json::Map::new(), "end_turn")
}

struct Harness {
    engine: Engine,
    provider: Arc<ScriptedProvider>,
    host: Arc<RecordingToolHost>,
}

fn harness() -> Harness {
    let provider = Arc::new(ScriptedProvider::new());
    let host = Arc::new(RecordingToolHost::default());
    let engine = Engine::new(
        Arc::clone(&provider) as Arc<dyn codebuff::llm::LlmProvider>,
        EngineConfig {
            model: "mock".to_owned(),
            ..EngineConfig::default()
        },
    )
    .with_tool_host(Arc::clone(&host) as Arc<dyn ToolHost>);
    Harness {
        engine,
        provider,
        host,
    }
}

async fn run_prompt(harness: &Harness, payload: PromptPayload) -> Vec<ServerAction> {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    harness.engine.handle_prompt(payload, tx).await;
    let mut actions = Vec::new();
    while let Ok(action) = rx.try_recv() {
        actions.push(action);
    }
    actions
}

fn payload(prompt: &str) -> PromptPayload {
    PromptPayload {
        prompt_id: "p1".to_owned(),
        prompt: prompt.to_owned(),
        fingerprint_id: "test".to_owned(),
        auth_token: String::new(),
        cost_mode: codebuff::protocol::CostMode::Normal,
        session_state: None,
        tool_results: Vec::new(),
        agent_definitions: Vec::new(),
        custom_tool_definitions: Vec::new(),
        project_files: None,
        knowledge_files: None,
        max_agent_steps: None,
    }
}

fn response(actions: &[ServerAction]) -> (&SessionState, &AgentOutput) {
    for action in actions {
        if let ServerAction::PromptResponse {
            session_state,
            output,
            ..
        } = action
        {
            return (session_state.as_ref(), output);
        }
    }
    panic!("no prompt-response in {actions:?}");
}

fn chunks(actions: &[ServerAction]) -> Vec<&PrintChunk> {
    actions
        .iter()
        .filter_map(|action| match action {
            ServerAction::ResponseChunk { chunk, .. }
            | ServerAction::SubagentResponseChunk { chunk, .. } => Some(chunk),
            _ => None,
        })
        .collect()
}

// --- Scenario: direct terminal shortcut ---------------------------------

#[tokio::test]
async fn direct_terminal_shortcut_skips_the_llm() {
    let h = harness();
    h.host.respond_with(
        "run_terminal_command",
        vec![ToolResultPart::json(json!({
            "command": "ls -la",
            "stdout": "total 0\n",
            "exitCode": 0,
        }))],
    );

    let actions = run_prompt(&h, payload("ls -la")).await;

    let calls = h.host.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "run_terminal_command");
    assert_eq!(calls[0].1["command"], "ls -la");
    assert_eq!(h.provider.turns_taken(), 0);

    let (_session, output) = response(&actions);
    let AgentOutput::AllMessages { value } = output else {
        panic!("expected allMessages, got {output:?}");
    };
    let embedded = serde_json::to_string(value).expect("serialize");
    assert!(embedded.contains("total 0"));
}

// --- Scenario: write file from LLM --------------------------------------

#[tokio::test]
async fn write_file_from_llm_round_trips() {
    let h = harness();
    let mut body = serde_json::Map::new();
    body.insert("path".to_owned(), json!("a.txt"));
    body.insert("content".to_owned(), json!("hi"));
    h.provider.push_turn_text(format!(
        "Writing the file now.{}{}",
        envelope(body, "write_file"),
        end_turn_envelope()
    ));

    let actions = run_prompt(&h, payload("write hi into a.txt")).await;

    let calls = h.host.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "write_file");
    assert_eq!(calls[0].1["path"], "a.txt");
    assert_eq!(calls[0].1["content"], "hi");

    let (session, output) = response(&actions);
    assert!(matches!(output, AgentOutput::LastMessage { .. }));

    let history = &session.main_agent_state.message_history;
    let assistants: Vec<_> = history.iter().filter(|m| m.role == Role::Assistant).collect();
    assert_eq!(assistants.len(), 1);
    assert!(
        assistants[0]
            .text()
            .expect("assistant text")
            .contains("\"cb_tool_name\":\"write_file\"")
    );
    let tool_messages: Vec<_> = history.iter().filter(|m| m.role == Role::Tool).collect();
    assert_eq!(tool_messages.len(), 1);
}

// --- Scenario: malformed tool call ---------------------------------------

#[tokio::test]
async fn malformed_tool_call_yields_one_error_part() {
    let h = harness();
    h.provider.push_turn_text(format!(
        "<codebuff_tool_call>\n{{ \"cb_tool_name\":\"read_files\", invalid }}\n</codebuff_tool_call>{}",
        end_turn_envelope()
    ));

    let actions = run_prompt(&h, payload("read something")).await;

    // No client request was issued for the malformed call.
    assert!(h.host.calls().is_empty());

    let error_results: Vec<_> = chunks(&actions)
        .into_iter()
        .filter_map(|chunk| match chunk {
            PrintChunk::ToolResult { output, .. } => output
                .iter()
                .find_map(|part| part.error_message().map(str::to_owned)),
            _ => None,
        })
        .collect();
    assert_eq!(error_results.len(), 1);
    assert!(error_results[0].contains("Invalid JSON"));

    // The run still ends normally.
    let (_session, output) = response(&actions);
    assert!(!output.is_error());
}

// --- Scenario: STEP handshake --------------------------------------------

#[tokio::test]
async fn step_handshake_interleaves_generator_and_llm() {
    let mut h = harness();
    let mut template = AgentTemplate::new("stepper", "mock");
    template.native_steps = Some(NativeSteps::new(|| {
        Box::new(ScriptedSteps::new([
            ScriptedSteps::call("read_files", json!({"paths": ["a.txt"]})),
            StepYield::Step,
            ScriptedSteps::call("write_file", json!({"path": "a.txt", "content": "x"})),
            ScriptedSteps::call("end_turn", json!({})),
        ]))
    }));
    h.engine.register_template(template);

    h.provider.push_turn_text(end_turn_envelope());

    let mut session = SessionState::default();
    session.main_agent_state.agent_type = "stepper".to_owned();
    let mut p = payload("run the pipeline");
    p.session_state = Some(Box::new(session));

    let _actions = run_prompt(&h, p).await;

    assert_eq!(h.provider.turns_taken(), 1, "exactly one LLM turn");
    let calls = h.host.calls();
    assert_eq!(
        calls.iter().map(|(name, _)| name.as_str()).collect::<Vec<_>>(),
        vec!["read_files", "write_file"],
    );
}

// --- Scenario: output-schema retry ---------------------------------------

#[tokio::test]
async fn output_schema_retry_injects_reminder() {
    let mut h = harness();
    let mut template = AgentTemplate::new("structured", "mock");
    template.output_mode = OutputMode::StructuredOutput;
    template.output_schema = Some(json!({
        "type": "object",
        "properties": { "result": { "type": "string" } },
        "required": ["result"],
    }));
    h.engine.register_template(template);

    // Turn 1 forgets set_output; turn 2 complies.
    h.provider.push_turn_text(end_turn_envelope());
    let mut body = serde_json::Map::new();
    body.insert("result".to_owned(), json!("ok"));
    h.provider.push_turn_text(format!(
        "{}{}",
        envelope(body, "set_output"),
        end_turn_envelope()
    ));

    let mut session = SessionState::default();
    session.main_agent_state.agent_type = "structured".to_owned();
    let mut p = payload("produce the result");
    p.session_state = Some(Box::new(session));

    let actions = run_prompt(&h, p).await;

    assert_eq!(h.provider.turns_taken(), 2);
    let (session, output) = response(&actions);
    assert_eq!(
        output,
        &AgentOutput::StructuredOutput {
            value: json!({"result": "ok"})
        }
    );
    let reminder = session
        .main_agent_state
        .message_history
        .iter()
        .filter(|m| m.role == Role::User)
        .filter_map(|m| m.text())
        .find(|text| text.contains("<system_reminder>") && text.contains("set_output"));
    assert!(reminder.is_some(), "reminder message missing");
}

// --- Scenario: parallel subagents ----------------------------------------

#[tokio::test]
async fn parallel_subagents_preserve_input_order() {
    let mut h = harness();
    h.engine.register_template(AgentTemplate::new("echo", "mock"));

    let mut body = serde_json::Map::new();
    body.insert(
        "agents".to_owned(),
        json!([
            { "agent_type": "echo", "prompt": "task A" },
            { "agent_type": "echo", "prompt": "task B" },
        ]),
    );
    h.provider
        .push_turn_text(envelope(body, "spawn_agents"));
    // Both children answer with plain text and end their turns.
    h.provider.push_turn_chunks(vec![LlmChunk::text("done")]);
    h.provider.push_turn_chunks(vec![LlmChunk::text("done")]);

    let actions = run_prompt(&h, payload("fan out")).await;

    // The spawn_agents tool result carries one entry per child, in order.
    let spawn_results: Vec<_> = chunks(&actions)
        .into_iter()
        .filter_map(|chunk| match chunk {
            PrintChunk::ToolResult { output, .. } if output.len() == 2 => Some(output.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(spawn_results.len(), 1);
    for part in &spawn_results[0] {
        let ToolResultPart::Json { value } = part else {
            panic!("expected json parts");
        };
        assert_eq!(value["type"], "lastMessage");
        assert_eq!(value["value"], "done");
    }

    // subagent_start / subagent_finish are tagged with the parent id.
    let (session, _output) = response(&actions);
    let parent_id = session.main_agent_state.agent_id.clone();
    let starts: Vec<_> = chunks(&actions)
        .into_iter()
        .filter(|chunk| {
            matches!(
                chunk,
                PrintChunk::SubagentStart { parent_agent_id: Some(p), .. } if *p == parent_id
            )
        })
        .collect();
    let finishes: Vec<_> = chunks(&actions)
        .into_iter()
        .filter(|chunk| {
            matches!(
                chunk,
                PrintChunk::SubagentFinish { parent_agent_id: Some(p), .. } if *p == parent_id
            )
        })
        .collect();
    assert_eq!(starts.len(), 2);
    assert_eq!(finishes.len(), 2);
}

// --- Sandboxed handleSteps end to end ------------------------------------

#[tokio::test]
async fn sandboxed_handle_steps_drives_tools_and_logs() {
    let mut h = harness();
    let mut template = AgentTemplate::new("scripted", "mock");
    template.handle_steps = Some(
        r#"
function* handleSteps({ agentState, prompt, params, logger }) {
    logger.log("inspecting", prompt);
    const result = yield { toolName: "read_files", input: { paths: ["a.txt"] } };
    logger.log("got", result.toolName);
    yield { toolName: "end_turn", input: {} };
}
"#
        .to_owned(),
    );
    h.engine.register_template(template);

    let mut session = SessionState::default();
    session.main_agent_state.agent_type = "scripted".to_owned();
    let mut p = payload("inspect the file");
    p.session_state = Some(Box::new(session));

    let actions = run_prompt(&h, p).await;

    assert_eq!(h.provider.turns_taken(), 0, "generator never yielded STEP");
    let calls = h.host.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "read_files");

    let logs: Vec<_> = actions
        .iter()
        .filter_map(|action| match action {
            ServerAction::HandlestepsLogChunk { message, .. } => Some(message.clone()),
            _ => None,
        })
        .collect();
    assert!(logs.iter().any(|m| m.contains("inspecting")), "logs: {logs:?}");
}

// --- Determinism ----------------------------------------------------------

#[tokio::test]
async fn same_prompt_and_stub_produce_the_same_output() {
    let mut outputs = Vec::new();
    let mut role_sequences = Vec::new();
    for _ in 0..2 {
        let h = harness();
        let mut body = serde_json::Map::new();
        body.insert("path".to_owned(), json!("a.txt"));
        body.insert("content".to_owned(), json!("hi"));
        h.provider.push_turn_text(format!(
            "ok{}{}",
            envelope(body, "write_file"),
            end_turn_envelope()
        ));
        let actions = run_prompt(&h, payload("write the file")).await;
        let (session, output) = response(&actions);
        outputs.push(output.clone());
        role_sequences.push(
            session
                .main_agent_state
                .message_history
                .iter()
                .map(|m| m.role)
                .collect::<Vec<_>>(),
        );
    }
    assert_eq!(outputs[0], outputs[1]);
    assert_eq!(role_sequences[0], role_sequences[1]);
}

// --- Unknown spawn target -------------------------------------------------

#[tokio::test]
async fn unknown_child_template_fails_the_spawn_call() {
    let h = harness();
    let mut body = serde_json::Map::new();
    body.insert(
        "agents".to_owned(),
        json!([{ "agent_type": "ghost", "prompt": "boo" }]),
    );
    h.provider.push_turn_text(format!(
        "{}{}",
        envelope(body, "spawn_agents"),
        end_turn_envelope()
    ));

    let actions = run_prompt(&h, payload("fan out")).await;
    let errors: Vec<_> = chunks(&actions)
        .into_iter()
        .filter_map(|chunk| match chunk {
            PrintChunk::ToolResult { output, .. } => output
                .iter()
                .find_map(|part| part.error_message().map(str::to_owned)),
            _ => None,
        })
        .collect();
    assert!(
        errors.iter().any(|e| e.contains("ghost")),
        "expected a descriptive spawn error, got {errors:?}"
    );
}
