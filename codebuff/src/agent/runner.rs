//! Agent loop: runs one agent to completion.
//!
//! Seeds the history, drives the step scheduler (programmatic steps
//! interleaved with streamed LLM turns), enforces the step budget and the
//! output-schema restart rule, and produces the final
//! [`AgentOutput`] from the template's output mode. Child runs recurse
//! through the orchestrator; the returned future is boxed to close the
//! cycle.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt as _;
use serde_json::Value;
use tracing::{Instrument as _, debug, error, info, info_span};

use super::prompts::{self, PromptContext};
use super::state::{AgentOutput, AgentState, PublicAgentState};
use super::template::{AgentTemplate, OutputMode};
use crate::engine::RunEnv;
use crate::error::Error;
use crate::executor::{self, CallSource, validate_against_schema};
use crate::llm::{LlmChunk, LlmRequest, RenderedMessage};
use crate::message::{Message, MessageContent, TimeToLive, ToolCall, ToolResult};
use crate::parser::{ParserEvent, StreamParser};
use crate::protocol::{PrintChunk, ServerAction};
use crate::sandbox::SandboxRegistry;
use crate::scheduler::{
    HandleSteps, ProgrammaticCall, ProgrammaticExec, ProgrammaticHost, ProgrammaticOutcome,
    SandboxSteps, StepLoop,
};
use crate::tools::render::{TOOL_CALL_CLOSE, TOOL_CALL_OPEN, render_tool_call, render_tool_result};

/// Restart cap for runs that end without their required structured output.
const MAX_OUTPUT_RESTARTS: u32 = 3;

/// Identity override for inline children streaming as their parent.
#[derive(Debug, Clone)]
pub(crate) struct StreamIdentity {
    /// Agent id chunks are tagged with.
    pub agent_id: String,
    /// Parent id chunks are tagged with.
    pub parent_agent_id: Option<String>,
    /// Whether chunks travel on the main response stream.
    pub as_main: bool,
}

/// Everything needed to start one agent run.
pub(crate) struct ChildSpawn {
    /// Template the agent is instantiated from.
    pub template: Arc<AgentTemplate>,
    /// Initial state (fresh for children, carried for the main agent).
    pub state: AgentState,
    /// The user prompt (main) or spawner prompt (children).
    pub prompt: String,
    /// Spawn params validated against the template's input schema.
    pub params: Option<Value>,
    /// Parent system prompt, present iff the template inherits it.
    pub parent_system_prompt: Option<String>,
    /// Parent template id, for `parentInstructions` lookup.
    pub parent_type: Option<String>,
    /// Inline-stream identity override.
    pub stream_as: Option<StreamIdentity>,
}

/// What one run hands back to its caller.
#[derive(Debug)]
pub struct RunArtifacts {
    /// Final agent state, persisted into the session snapshot.
    pub state: AgentState,
    /// The agent's output.
    pub output: AgentOutput,
    /// Every tool call the agent issued.
    pub tool_calls: Vec<ToolCall>,
    /// Every result produced for them.
    pub tool_results: Vec<ToolResult>,
}

/// Live state of one agent run, threaded through scheduler and executor.
pub(crate) struct AgentRun<'e> {
    /// Shared prompt environment.
    pub env: &'e RunEnv,
    /// The agent's template.
    pub template: Arc<AgentTemplate>,
    /// The agent's mutable state.
    pub state: AgentState,
    /// STEP / STEP_ALL handshake state.
    pub step_loop: StepLoop,
    /// Agent id used on emitted chunks.
    pub emit_agent_id: String,
    /// Parent id used on emitted chunks.
    pub emit_parent_id: Option<String>,
    /// Rendered system prompt, inherited by children that ask for it.
    pub rendered_system_prompt: String,
    /// Index of the run's boundary marker in the history.
    pub boundary_index: usize,
    /// Calls collected for the prompt response.
    pub collected_calls: Vec<ToolCall>,
    /// Results collected for the prompt response.
    pub collected_results: Vec<ToolResult>,
    emit_as_main: bool,
}

impl AgentRun<'_> {
    /// Whether chunks travel on the main response stream.
    pub fn is_main_stream(&self) -> bool {
        self.emit_as_main
    }

    /// Emit one streaming chunk, routed by the agent's stream identity.
    pub fn emit(&self, chunk: PrintChunk) {
        let action = if self.emit_as_main {
            ServerAction::ResponseChunk {
                user_input_id: self.env.user_input_id.clone(),
                chunk,
            }
        } else {
            ServerAction::SubagentResponseChunk {
                user_input_id: self.env.user_input_id.clone(),
                agent_id: self.emit_agent_id.clone(),
                agent_type: self.state.agent_type.clone(),
                chunk,
                prompt: None,
                forward_to_prompt: None,
            }
        };
        self.env.outbound.send(action);
    }

    /// Placeholder-substitution context for this agent's prompts.
    pub fn prompt_context(&self) -> PromptContext {
        let tool_names = if self.template.tool_names.is_empty() {
            self.env.registry.tool_names()
        } else {
            self.template.tool_names.clone()
        };
        PromptContext {
            file_tree: self.env.prompt_sources.file_tree.clone(),
            git_changes: self.env.prompt_sources.git_changes.clone(),
            system_info: self.env.prompt_sources.system_info.clone(),
            remaining_steps: self.state.steps_remaining,
            tool_names,
        }
    }
}

#[async_trait]
impl ProgrammaticHost for AgentRun<'_> {
    async fn execute(&mut self, call: ProgrammaticCall) -> crate::Result<ProgrammaticExec> {
        let tool_call = ToolCall::new(call.tool_name, call.input);
        let executed = executor::execute_tool_call(
            self,
            tool_call,
            CallSource::Programmatic {
                include_tool_call: call.include_tool_call,
            },
        )
        .await?;
        Ok(ProgrammaticExec {
            result: executed.result,
            end_turn: executed.end_turn,
        })
    }

    fn state_view(&self) -> PublicAgentState {
        self.state.public_view()
    }
}

/// Disposes the run's sandbox on every termination path.
struct SandboxGuard<'a> {
    registry: &'a SandboxRegistry,
    run_id: String,
    armed: bool,
}

impl Drop for SandboxGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.registry.remove(&self.run_id);
        }
    }
}

/// Run one agent to completion.
///
/// Boxed because child spawns recurse back into this function, exactly the
/// shape the orchestrator needs for parallel siblings.
pub(crate) fn run_agent<'e>(
    env: &'e RunEnv,
    spawn: ChildSpawn,
) -> Pin<Box<dyn Future<Output = RunArtifacts> + Send + 'e>> {
    let span = info_span!(
        "agent",
        agent.id = %spawn.state.agent_id,
        agent.template = %spawn.template.id,
        agent.steps = spawn.state.steps_remaining,
    );
    Box::pin(run_inner(env, spawn).instrument(span))
}

async fn run_inner(env: &RunEnv, spawn: ChildSpawn) -> RunArtifacts {
    let ChildSpawn {
        template,
        mut state,
        prompt,
        params,
        parent_system_prompt,
        parent_type,
        stream_as,
    } = spawn;

    let inline = stream_as.is_some();
    let (emit_agent_id, emit_parent_id, emit_as_main) = match stream_as {
        Some(identity) => (identity.agent_id, identity.parent_agent_id, identity.as_main),
        None => (
            state.agent_id.clone(),
            state.parent_id.clone(),
            state.parent_id.is_none(),
        ),
    };

    // Seed the run boundary: the prompt message is the boundary marker,
    // protected from truncation; the instructions message expires at the
    // next user prompt.
    let boundary_index = state.message_history.len();
    state.message_history.push(Message::user(prompt.clone()).kept());

    let mut run = AgentRun {
        env,
        template: Arc::clone(&template),
        state,
        step_loop: StepLoop::new(None),
        emit_agent_id,
        emit_parent_id,
        rendered_system_prompt: String::new(),
        boundary_index,
        collected_calls: Vec::new(),
        collected_results: Vec::new(),
        emit_as_main,
    };

    let ctx = run.prompt_context();
    run.rendered_system_prompt = match &parent_system_prompt {
        Some(parent) => format!("{parent}\n\n{}", prompts::render(&template.system_prompt, &ctx)),
        None => prompts::render(&template.system_prompt, &ctx),
    };

    if !template.instructions_prompt.is_empty() {
        let mut instructions = prompts::render(&template.instructions_prompt, &ctx);
        if let Some(parent_type) = &parent_type
            && let Some(guidance) = template.parent_instructions.get(parent_type)
        {
            instructions.push('\n');
            instructions.push_str(guidance);
        }
        run.state
            .message_history
            .push(Message::user(instructions).with_ttl(TimeToLive::UserPrompt));
    }

    // An inline child continues the parent's stream, so no fresh start
    // chunk.
    if !inline {
        run.emit(PrintChunk::Start {
            agent_id: Some(run.emit_agent_id.clone()),
            message_history_length: run.state.message_history.len(),
        });
    }

    // Attach the programmatic generator, if the template declares one.
    let mut sandbox_guard = SandboxGuard {
        registry: &env.sandboxes,
        run_id: run.state.run_id.clone(),
        armed: false,
    };
    let generator: Option<Box<dyn HandleSteps>> = if let Some(native) = &template.native_steps {
        Some(native.instantiate())
    } else if let Some(source) = &template.handle_steps {
        let (log_tx, mut log_rx) = tokio::sync::mpsc::unbounded_channel::<crate::sandbox::SandboxLog>();
        let outbound = env.outbound.clone();
        let user_input_id = env.user_input_id.clone();
        let agent_id = run.state.agent_id.clone();
        tokio::spawn(async move {
            while let Some(log) = log_rx.recv().await {
                outbound.send(ServerAction::HandlestepsLogChunk {
                    user_input_id: user_input_id.clone(),
                    agent_id: agent_id.clone(),
                    level: log.level,
                    message: log.message,
                });
            }
        });

        let init = serde_json::json!({
            "agentState": run.state.public_view(),
            "prompt": prompt,
            "params": params,
        });
        match env
            .sandboxes
            .get_or_create(&run.state.run_id, source, init.to_string(), log_tx)
        {
            Ok(handle) => {
                sandbox_guard.armed = true;
                Some(Box::new(SandboxSteps::new(handle)))
            }
            Err(e) => {
                let output = sandbox_failure(&run.state, &e);
                return finish_run(run, output);
            }
        }
    } else {
        None
    };
    run.step_loop = StepLoop::new(generator);

    let output = drive(&mut run).await;
    drop(sandbox_guard);
    finish_run(run, output)
}

/// The outer run loop plus the output-schema restart rule.
async fn drive(run: &mut AgentRun<'_>) -> AgentOutput {
    let mut restarts = 0u32;
    loop {
        match drive_steps(run).await {
            StepsEnd::Finished => {}
            StepsEnd::Cancelled => return cancelled_output(run),
            StepsEnd::Fatal(message) => return AgentOutput::error(message),
        }

        if let Some(schema) = &run.template.output_schema
            && run.state.output.is_none()
        {
            if restarts < MAX_OUTPUT_RESTARTS {
                restarts += 1;
                debug!(restarts, "output schema unmet; injecting reminder");
                run.state
                    .message_history
                    .push(Message::user(prompts::output_schema_reminder(schema)));
                continue;
            }
            return AgentOutput::error(
                "agent ended without the structured output its template requires",
            );
        }
        return make_output(run);
    }
}

enum StepsEnd {
    Finished,
    Cancelled,
    Fatal(String),
}

async fn drive_steps(run: &mut AgentRun<'_>) -> StepsEnd {
    let mut steps_complete = false;
    loop {
        if run.env.cancel.is_cancelled() {
            return StepsEnd::Cancelled;
        }
        if run.env.outbound.is_closed() {
            return StepsEnd::Fatal(Error::transport("client connection closed").to_string());
        }

        // Programmatic step. The step loop is detached while it borrows the
        // run as its host.
        let mut step_loop = std::mem::replace(&mut run.step_loop, StepLoop::new(None));
        let programmatic = step_loop.run_programmatic_step(steps_complete, run).await;
        run.step_loop = step_loop;

        match programmatic {
            Ok(ProgrammaticOutcome::EndTurn) => return StepsEnd::Finished,
            Ok(ProgrammaticOutcome::Continue) => {}
            Err(Error::Cancelled) => return StepsEnd::Cancelled,
            Err(e) => return StepsEnd::Fatal(sandbox_failure_message(&run.state, &e)),
        }

        if run.state.steps_remaining == 0 {
            info!(agent = %run.state.agent_id, "step budget exhausted");
            return StepsEnd::Finished;
        }

        match run_llm_turn(run).await {
            TurnResult::Completed { should_end_turn } => {
                steps_complete = should_end_turn;
                if should_end_turn && !run.step_loop.has_generator() {
                    return StepsEnd::Finished;
                }
            }
            TurnResult::Cancelled => return StepsEnd::Cancelled,
            TurnResult::Fatal(message) => return StepsEnd::Fatal(message),
        }
    }
}

enum TurnResult {
    Completed { should_end_turn: bool },
    Cancelled,
    Fatal(String),
}

/// Run one streamed LLM turn: parse, execute, transcribe.
async fn run_llm_turn(run: &mut AgentRun<'_>) -> TurnResult {
    refresh_step_prompt(run);

    // The system prompt lives outside the carried history so repeated
    // prompts against the same session do not accumulate copies.
    let mut messages = Vec::with_capacity(run.state.message_history.len() + 1);
    if !run.rendered_system_prompt.is_empty() {
        messages.push(RenderedMessage {
            role: "system".to_owned(),
            content: run.rendered_system_prompt.clone(),
        });
    }
    messages.extend(render_messages(&run.state.message_history));
    let request = LlmRequest {
        model: run.template.model.clone(),
        messages,
    };
    let provider = Arc::clone(&run.env.provider);
    let mut stream = match provider.stream_turn(request).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(error = %e, "LLM call failed");
            return TurnResult::Fatal(e.to_string());
        }
    };

    run.state.steps_remaining = run.state.steps_remaining.saturating_sub(1);
    let credits = provider.credits_per_turn();
    run.state.direct_credits_used += credits;
    run.env.add_credits(credits);

    let mut parser = StreamParser::new(Arc::clone(&run.env.registry));
    let mut full_response = String::new();
    let mut turn_results: Vec<(ToolResult, bool)> = Vec::new();
    let mut turn_call_count = 0usize;
    let mut saw_end_turn = false;
    let mut ended_step = false;

    while let Some(chunk) = stream.next().await {
        if run.env.cancel.is_cancelled() {
            return TurnResult::Cancelled;
        }
        if let LlmChunk::Error { message } = &chunk {
            return TurnResult::Fatal(message.clone());
        }
        let events = parser.push(&chunk);
        match handle_events(
            run,
            events,
            &mut full_response,
            &mut turn_results,
            &mut turn_call_count,
            &mut saw_end_turn,
            &mut ended_step,
        )
        .await
        {
            Ok(()) => {}
            Err(Error::Cancelled) => return TurnResult::Cancelled,
            Err(e) => return TurnResult::Fatal(e.to_string()),
        }
        if ended_step {
            break;
        }
    }
    if !ended_step {
        let events = parser.finish();
        match handle_events(
            run,
            events,
            &mut full_response,
            &mut turn_results,
            &mut turn_call_count,
            &mut saw_end_turn,
            &mut ended_step,
        )
        .await
        {
            Ok(()) => {}
            Err(Error::Cancelled) => return TurnResult::Cancelled,
            Err(e) => return TurnResult::Fatal(e.to_string()),
        }
    }

    // One assistant message per turn carries the whole transcript; the tool
    // messages follow it in parse order.
    if !full_response.is_empty() {
        run.state
            .message_history
            .push(Message::assistant(full_response));
    }
    for (result, in_history) in &turn_results {
        if *in_history {
            run.state.message_history.push(Message::tool(result.clone()));
        }
    }
    // A turn with results updates what a resuming generator sees; a turn
    // without leaves the previous programmatic result in place.
    if let Some((result, _)) = turn_results.last() {
        run.step_loop.set_last_result(Some(result.clone()));
    }

    let should_end_turn = (turn_call_count == 0 && turn_results.is_empty()) || saw_end_turn;
    TurnResult::Completed { should_end_turn }
}

#[allow(clippy::too_many_arguments)]
async fn handle_events(
    run: &mut AgentRun<'_>,
    events: Vec<ParserEvent>,
    full_response: &mut String,
    turn_results: &mut Vec<(ToolResult, bool)>,
    turn_call_count: &mut usize,
    saw_end_turn: &mut bool,
    ended_step: &mut bool,
) -> crate::Result<()> {
    for event in events {
        match event {
            ParserEvent::Text(text) => {
                full_response.push_str(&text);
                run.emit(PrintChunk::Text {
                    text,
                    agent_id: Some(run.emit_agent_id.clone()),
                });
            }
            ParserEvent::Reasoning(text) => {
                run.emit(PrintChunk::Reasoning {
                    text,
                    agent_id: Some(run.emit_agent_id.clone()),
                });
            }
            ParserEvent::ToolCall(call) => {
                *turn_call_count += 1;
                full_response.push_str(&render_tool_call(&call));
                let executed = executor::execute_tool_call(run, call, CallSource::Llm).await?;
                if executed.end_turn {
                    *saw_end_turn = true;
                }
                if executed.ends_step {
                    *ended_step = true;
                }
                if let Some(result) = executed.result {
                    turn_results.push((result, executed.in_history));
                }
            }
            ParserEvent::ToolCallError { raw, reason } => {
                full_response.push_str(TOOL_CALL_OPEN);
                full_response.push_str(&raw);
                full_response.push_str(TOOL_CALL_CLOSE);
                let result = ToolResult::new(
                    uuid::Uuid::new_v4().to_string(),
                    "invalid_tool_call",
                    vec![crate::message::ToolResultPart::error(reason)],
                );
                run.emit(PrintChunk::ToolResult {
                    tool_call_id: result.tool_call_id.clone(),
                    output: result.output.clone(),
                    agent_id: Some(run.emit_agent_id.clone()),
                    parent_agent_id: run.emit_parent_id.clone(),
                });
                run.collected_results.push(result.clone());
                turn_results.push((result, true));
            }
        }
    }
    Ok(())
}

/// Replace last iteration's step prompt and inject this iteration's.
fn refresh_step_prompt(run: &mut AgentRun<'_>) {
    run.state
        .message_history
        .retain(|message| message.time_to_live != Some(TimeToLive::AgentStep));
    if run.template.step_prompt.is_empty() {
        return;
    }
    let rendered = prompts::render(&run.template.step_prompt, &run.prompt_context());
    let text = if run.state.parent_id.is_some() {
        prompts::system_reminder(&rendered)
    } else {
        rendered
    };
    run.state
        .message_history
        .push(Message::user(text).with_ttl(TimeToLive::AgentStep));
}

/// Flatten history into the provider-facing form.
fn render_messages(history: &[Message]) -> Vec<RenderedMessage> {
    history
        .iter()
        .map(|message| {
            let role = match message.role {
                crate::message::Role::System => "system",
                crate::message::Role::User => "user",
                crate::message::Role::Assistant => "assistant",
                crate::message::Role::Tool => "tool",
            };
            let content = match &message.content {
                MessageContent::Text { text } => text.clone(),
                MessageContent::ToolResult { result } => render_tool_result(result),
            };
            RenderedMessage {
                role: role.to_owned(),
                content,
            }
        })
        .collect()
}

fn make_output(run: &AgentRun<'_>) -> AgentOutput {
    match run.template.output_mode {
        OutputMode::StructuredOutput => match &run.state.output {
            Some(value) => {
                if let Some(schema) = &run.template.output_schema
                    && let Err(reason) = validate_against_schema(schema, value)
                {
                    return AgentOutput::error(format!(
                        "structured output does not match the output schema: {reason}"
                    ));
                }
                AgentOutput::StructuredOutput {
                    value: value.clone(),
                }
            }
            None => AgentOutput::StructuredOutput {
                value: Value::Null,
            },
        },
        OutputMode::LastMessage => AgentOutput::LastMessage {
            value: run
                .state
                .last_assistant_text()
                .unwrap_or_default()
                .to_owned(),
        },
        OutputMode::AllMessages => AgentOutput::AllMessages {
            value: run
                .state
                .message_history
                .get(run.boundary_index + 1..)
                .map(<[Message]>::to_vec)
                .unwrap_or_default(),
        },
    }
}

fn cancelled_output(run: &AgentRun<'_>) -> AgentOutput {
    if run.state.output.is_some() {
        make_output(run)
    } else {
        AgentOutput::error("Run cancelled by user")
    }
}

fn sandbox_failure_message(state: &AgentState, error: &Error) -> String {
    let reason = match error {
        Error::Sandbox(reason) => reason.clone(),
        other => other.to_string(),
    };
    format!(
        "Error executing handleSteps for agent {}: {reason}",
        state.agent_id
    )
}

fn sandbox_failure(state: &AgentState, error: &Error) -> AgentOutput {
    AgentOutput::error(sandbox_failure_message(state, error))
}

fn finish_run(run: AgentRun<'_>, output: AgentOutput) -> RunArtifacts {
    if output.is_error() {
        debug!(agent = %run.state.agent_id, "run ended with error output");
    }
    let AgentRun {
        mut state,
        collected_calls,
        collected_results,
        ..
    } = run;
    state.output = match &output {
        AgentOutput::StructuredOutput { value } => Some(value.clone()),
        _ => state.output,
    };
    RunArtifacts {
        state,
        output,
        tool_calls: collected_calls,
        tool_results: collected_results,
    }
}
