//! Tool executor: dispatches one validated call to its owner.
//!
//! Dispatch order, first match wins: control tools (`end_turn`,
//! `set_output`, `set_messages`), agent spawns, host-registered overrides,
//! host-bound built-ins, the server-local `web_search`, then custom tools.
//! Handler failures never propagate: every error becomes an
//! `{errorMessage}` result part folded into the conversation.

use serde_json::Value;
use tracing::{Instrument as _, debug, info_span, warn};

use crate::agent::orchestrator;
use crate::agent::runner::AgentRun;
use crate::bridge::delegation_timeout;
use crate::error::{Error, Result};
use crate::message::{Message, ToolCall, ToolResult, ToolResultPart};
use crate::protocol::PrintChunk;
use crate::tools::render::{render_tool_call, unescape_command};
use crate::tools::{ResolvedTool, SetMessagesInput, ToolBinding, names};

/// Where a call came from; programmatic calls control their own history
/// rendering, LLM calls are rendered by the turn transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallSource {
    /// Parsed out of an LLM turn.
    Llm,
    /// Yielded by a `handleSteps` generator.
    Programmatic {
        /// Whether the rendered call is appended to history.
        include_tool_call: bool,
    },
}

/// Outcome of executing one call.
#[derive(Debug)]
pub struct ExecutedCall {
    /// The produced result; `None` for silently-consumed control tools.
    pub result: Option<ToolResult>,
    /// Whether the result belongs in message history.
    pub in_history: bool,
    /// Whether the LLM turn must stop emitting after this call.
    pub ends_step: bool,
    /// Whether this call was `end_turn`.
    pub end_turn: bool,
}

impl ExecutedCall {
    fn control(ends_step: bool, end_turn: bool) -> Self {
        Self {
            result: None,
            in_history: false,
            ends_step,
            end_turn,
        }
    }
}

/// Execute one tool call against the current run.
///
/// Returns `Err` only on cancellation; every handler failure is folded
/// into the result parts.
pub(crate) async fn execute_tool_call(
    run: &mut AgentRun<'_>,
    mut call: ToolCall,
    source: CallSource,
) -> Result<ExecutedCall> {
    if run.env.cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    call.agent_id = Some(run.state.agent_id.clone());

    let span = info_span!(
        "tool",
        tool.name = %call.tool_name,
        tool.id = %call.tool_call_id,
    );
    execute_inner(run, call, source).instrument(span).await
}

async fn execute_inner(
    run: &mut AgentRun<'_>,
    call: ToolCall,
    source: CallSource,
) -> Result<ExecutedCall> {
    // Programmatic inputs have not been through the stream parser, so
    // validate here; validation failures never reach a handler.
    if matches!(source, CallSource::Programmatic { .. })
        && let Err(reason) = run.env.registry.validate_input(&call.tool_name, &call.input)
    {
        record_call_start(run, &call, source);
        return Ok(fail_call(run, &call, source, false, reason));
    }

    let Some(resolved) = run.env.registry.resolve(&call.tool_name) else {
        record_call_start(run, &call, source);
        return Ok(fail_call(
            run,
            &call,
            source,
            false,
            format!("Tool {} not found", call.tool_name),
        ));
    };
    let ends_step = resolved.ends_step();
    let returns_result = resolved.returns_result();
    let binding = resolved.binding();
    let mcp_config = match resolved {
        ResolvedTool::Custom(definition) => definition.mcp_config.clone(),
        ResolvedTool::Builtin(_) => None,
    };

    record_call_start(run, &call, source);

    // Control tools first: they mutate run state and never produce a
    // history tool message.
    match call.tool_name.as_str() {
        names::END_TURN => {
            debug!("end_turn");
            return Ok(ExecutedCall::control(true, true));
        }
        names::SET_OUTPUT => return Ok(apply_set_output(run, &call, source)),
        names::SET_MESSAGES => return Ok(apply_set_messages(run, &call, source)),
        _ => {}
    }

    let parts = match binding {
        ToolBinding::Spawn => orchestrator::dispatch_spawn(run, &call).await?,
        ToolBinding::Local => dispatch_web_search(run, &call).await,
        ToolBinding::Host | ToolBinding::Control => dispatch_host(run, &call, mcp_config).await,
    };

    let result = ToolResult::new(call.tool_call_id.clone(), call.tool_name.clone(), parts);
    finish_call(run, source, result.clone(), returns_result);
    Ok(ExecutedCall {
        result: Some(result),
        in_history: returns_result,
        ends_step,
        end_turn: false,
    })
}

/// Host-registered overrides win over the built-in host path.
async fn dispatch_host(
    run: &mut AgentRun<'_>,
    call: &ToolCall,
    mcp_config: Option<Value>,
) -> Vec<ToolResultPart> {
    if let Some(handler) = run.env.overrides.get(&call.tool_name) {
        return handler.handle(&call.input).await;
    }

    let input = if call.tool_name == names::RUN_TERMINAL_COMMAND {
        unescape_terminal_input(&call.input)
    } else {
        call.input.clone()
    };
    let host = std::sync::Arc::clone(&run.env.tool_host);
    host.call(
        &call.tool_name,
        &input,
        delegation_timeout(&input),
        mcp_config.as_ref(),
    )
    .await
}

async fn dispatch_web_search(run: &mut AgentRun<'_>, call: &ToolCall) -> Vec<ToolResultPart> {
    if let Some(handler) = run.env.overrides.get(&call.tool_name) {
        return handler.handle(&call.input).await;
    }
    match serde_json::from_value(call.input.clone()) {
        Ok(input) => {
            let searcher = std::sync::Arc::clone(&run.env.searcher);
            searcher.search(&input).await
        }
        Err(e) => vec![ToolResultPart::error(format!("invalid input: {e}"))],
    }
}

/// Merge `set_output` input into the agent's structured output, validating
/// the merged value against the template's output schema when declared.
fn apply_set_output(run: &mut AgentRun<'_>, call: &ToolCall, source: CallSource) -> ExecutedCall {
    let Value::Object(fields) = &call.input else {
        return fail_call(run, call, source, true, "set_output input must be an object");
    };

    let mut merged = match &run.state.output {
        Some(Value::Object(existing)) => existing.clone(),
        _ => serde_json::Map::new(),
    };
    for (key, value) in fields {
        merged.insert(key.clone(), value.clone());
    }
    let merged = Value::Object(merged);

    if let Some(schema) = &run.template.output_schema
        && let Err(reason) = validate_against_schema(schema, &merged)
    {
        return fail_call(
            run,
            call,
            source,
            true,
            format!("set_output value does not match the output schema: {reason}"),
        );
    }

    run.state.output = Some(merged);
    ExecutedCall::control(true, false)
}

fn apply_set_messages(
    run: &mut AgentRun<'_>,
    call: &ToolCall,
    source: CallSource,
) -> ExecutedCall {
    match serde_json::from_value::<SetMessagesInput>(call.input.clone()) {
        Ok(input) => {
            run.state.message_history = input.messages;
            ExecutedCall::control(true, false)
        }
        Err(e) => fail_call(run, call, source, true, format!("invalid input: {e}")),
    }
}

/// Validate a value against a JSON Schema, reporting the first violation.
pub(crate) fn validate_against_schema(
    schema: &Value,
    value: &Value,
) -> std::result::Result<(), String> {
    match jsonschema::validator_for(schema) {
        Ok(validator) => validator.validate(value).map_err(|e| e.to_string()),
        Err(e) => Err(format!("invalid schema: {e}")),
    }
}

/// Stream the call, render it into history for programmatic sources, and
/// record it for the prompt response. Called exactly once per call.
fn record_call_start(run: &mut AgentRun<'_>, call: &ToolCall, source: CallSource) {
    run.emit(PrintChunk::ToolCall {
        tool_call_id: call.tool_call_id.clone(),
        tool_name: call.tool_name.clone(),
        input: call.input.clone(),
        agent_id: Some(run.emit_agent_id.clone()),
        parent_agent_id: run.emit_parent_id.clone(),
    });
    if let CallSource::Programmatic {
        include_tool_call: true,
    } = source
    {
        run.state
            .message_history
            .push(Message::assistant(render_tool_call(call)));
    }
    run.collected_calls.push(call.clone());
}

/// Produce an error result for an already-recorded call.
fn fail_call(
    run: &mut AgentRun<'_>,
    call: &ToolCall,
    source: CallSource,
    ends_step: bool,
    reason: impl Into<String>,
) -> ExecutedCall {
    let reason = reason.into();
    warn!(tool = %call.tool_name, reason = %reason, "tool call failed");
    let result = ToolResult::error(call, reason);
    finish_call(run, source, result.clone(), true);
    ExecutedCall {
        result: Some(result),
        in_history: true,
        ends_step,
        end_turn: false,
    }
}

/// Record a completed result: stream chunk, collection, and (for
/// programmatic calls) the history tool message.
fn finish_call(run: &mut AgentRun<'_>, source: CallSource, result: ToolResult, in_history: bool) {
    run.emit(PrintChunk::ToolResult {
        tool_call_id: result.tool_call_id.clone(),
        output: result.output.clone(),
        agent_id: Some(run.emit_agent_id.clone()),
        parent_agent_id: run.emit_parent_id.clone(),
    });
    if in_history && matches!(source, CallSource::Programmatic { .. }) {
        run.state.message_history.push(Message::tool(result.clone()));
    }
    run.collected_results.push(result);
}

/// Normalize `&amp;` escapes inside terminal command inputs.
fn unescape_terminal_input(input: &Value) -> Value {
    let mut input = input.clone();
    if let Some(command) = input.get("command").and_then(Value::as_str) {
        let unescaped = unescape_command(command);
        if let Some(object) = input.as_object_mut() {
            object.insert("command".to_owned(), Value::String(unescaped));
        }
    }
    input
}
