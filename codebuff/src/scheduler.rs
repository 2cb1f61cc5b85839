//! Step scheduling: the STEP / STEP_ALL handshake.
//!
//! Two producers of tool calls cooperate per run: a programmatic
//! `handleSteps` generator and the LLM turn. The generator is modeled as an
//! iterator object ([`HandleSteps`]) yielding tool calls or control
//! signals; this module owns the handshake state machine. The agent runner
//! drives the outer loop (one programmatic step, then at most one LLM turn,
//! repeat) and implements [`ProgrammaticHost`] to execute the yielded calls.

use std::collections::VecDeque;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::state::PublicAgentState;
use crate::error::{Error, Result};
use crate::message::ToolResult;
use crate::sandbox::SandboxHandle;

/// A tool call yielded by a generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgrammaticCall {
    /// Name of the tool to invoke.
    pub tool_name: String,
    /// Structured input.
    #[serde(default)]
    pub input: Value,
    /// When `false`, the rendered call is excluded from message history.
    #[serde(default = "default_true")]
    pub include_tool_call: bool,
}

const fn default_true() -> bool {
    true
}

/// What a generator produced on one advance.
#[derive(Debug, Clone, PartialEq)]
pub enum StepYield {
    /// Execute this tool call, then advance again.
    Call(ProgrammaticCall),
    /// Let exactly one LLM turn run, then resume.
    Step,
    /// Let LLM turns run until one ends the step, then resume.
    StepAll,
    /// The generator returned; the agent's turn is over.
    Done,
}

/// The value passed back into the generator on each advance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepInput {
    /// Result of the preceding tool call, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<ToolResult>,
    /// Redacted view of the owning agent's state.
    pub agent_state: PublicAgentState,
    /// Whether the last LLM turn ended the step.
    pub steps_complete: bool,
}

/// A stepwise iterator over generator yields.
///
/// Exactly one instance exists per run; it is destroyed with the run.
#[async_trait]
pub trait HandleSteps: Send {
    /// Advance the generator once.
    async fn next(&mut self, input: StepInput) -> Result<StepYield>;
}

/// Outcome of executing one programmatic call.
#[derive(Debug)]
pub struct ProgrammaticExec {
    /// The result fed back into the generator on its next advance.
    pub result: Option<ToolResult>,
    /// `true` when the call was `end_turn`.
    pub end_turn: bool,
}

/// The runner-side surface the scheduler needs while advancing a generator.
#[async_trait]
pub trait ProgrammaticHost: Send {
    /// Execute one yielded call, including its history side effects.
    async fn execute(&mut self, call: ProgrammaticCall) -> Result<ProgrammaticExec>;

    /// Fresh redacted state view for the next generator input.
    fn state_view(&self) -> PublicAgentState;
}

/// Result of one programmatic step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgrammaticOutcome {
    /// Run (or keep running) the LLM.
    Continue,
    /// The generator ended the agent's turn.
    EndTurn,
}

/// Per-run handshake state between the generator and LLM turns.
pub struct StepLoop {
    generator: Option<Box<dyn HandleSteps>>,
    step_all: bool,
    last_result: Option<ToolResult>,
}

impl std::fmt::Debug for StepLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepLoop")
            .field("has_generator", &self.generator.is_some())
            .field("step_all", &self.step_all)
            .finish()
    }
}

impl StepLoop {
    /// Create the handshake state for a run.
    #[must_use]
    pub fn new(generator: Option<Box<dyn HandleSteps>>) -> Self {
        Self {
            generator,
            step_all: false,
            last_result: None,
        }
    }

    /// Whether a generator is attached.
    #[must_use]
    pub const fn has_generator(&self) -> bool {
        self.generator.is_some()
    }

    /// Record the most recent tool result so the generator sees it when it
    /// resumes after a `STEP` / `STEP_ALL` hand-off.
    pub fn set_last_result(&mut self, result: Option<ToolResult>) {
        self.last_result = result;
    }

    /// Run one programmatic step.
    ///
    /// `steps_complete` is `true` iff the last LLM turn ended the step.
    /// Yielded calls execute one at a time, each awaited before the next
    /// advance. `STEP` returns control for exactly one LLM turn; `STEP_ALL`
    /// suppresses further generator advances until a turn completes the
    /// step.
    pub async fn run_programmatic_step(
        &mut self,
        steps_complete: bool,
        host: &mut dyn ProgrammaticHost,
    ) -> Result<ProgrammaticOutcome> {
        let Some(generator) = self.generator.as_mut() else {
            return Ok(ProgrammaticOutcome::Continue);
        };
        if self.step_all {
            if !steps_complete {
                return Ok(ProgrammaticOutcome::Continue);
            }
            self.step_all = false;
        }

        loop {
            let input = StepInput {
                tool_result: self.last_result.take(),
                agent_state: host.state_view(),
                steps_complete,
            };
            match generator.next(input).await? {
                StepYield::Done => return Ok(ProgrammaticOutcome::EndTurn),
                StepYield::Step => return Ok(ProgrammaticOutcome::Continue),
                StepYield::StepAll => {
                    self.step_all = true;
                    return Ok(ProgrammaticOutcome::Continue);
                }
                StepYield::Call(call) => {
                    let exec = host.execute(call).await?;
                    if exec.end_turn {
                        return Ok(ProgrammaticOutcome::EndTurn);
                    }
                    self.last_result = exec.result;
                }
            }
        }
    }
}

/// Adapter exposing a sandboxed generator as a [`HandleSteps`] iterator.
#[derive(Debug)]
pub struct SandboxSteps {
    handle: SandboxHandle,
}

impl SandboxSteps {
    /// Wrap a sandbox handle.
    #[must_use]
    pub const fn new(handle: SandboxHandle) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl HandleSteps for SandboxSteps {
    async fn next(&mut self, input: StepInput) -> Result<StepYield> {
        let input_json = serde_json::to_string(&input)?;
        let step = self.handle.step(input_json).await?;
        if step.done {
            return Ok(StepYield::Done);
        }
        let Some(raw) = step.value.as_deref() else {
            return Err(Error::sandbox("handleSteps yielded an unsupported value"));
        };
        parse_yield(raw)
    }
}

fn parse_yield(raw: &str) -> Result<StepYield> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| Error::sandbox(format!("handleSteps yielded invalid JSON: {e}")))?;
    match value {
        Value::String(signal) if signal == "STEP" => Ok(StepYield::Step),
        Value::String(signal) if signal == "STEP_ALL" => Ok(StepYield::StepAll),
        Value::Object(_) => {
            let call: ProgrammaticCall = serde_json::from_value(value)
                .map_err(|e| Error::sandbox(format!("handleSteps yielded a malformed call: {e}")))?;
            Ok(StepYield::Call(call))
        }
        other => Err(Error::sandbox(format!(
            "handleSteps yielded an unsupported value: {other}"
        ))),
    }
}

/// A queue-backed [`HandleSteps`] for trusted in-process generators.
///
/// Native templates and tests describe their programmatic behavior as a
/// yield list instead of real coroutines.
#[derive(Debug, Default)]
pub struct ScriptedSteps {
    yields: VecDeque<StepYield>,
    inputs: Vec<StepInput>,
}

impl ScriptedSteps {
    /// Create from a yield list.
    #[must_use]
    pub fn new(yields: impl IntoIterator<Item = StepYield>) -> Self {
        Self {
            yields: yields.into_iter().collect(),
            inputs: Vec::new(),
        }
    }

    /// A call yield with `includeToolCall = true`.
    #[must_use]
    pub fn call(tool_name: impl Into<String>, input: Value) -> StepYield {
        StepYield::Call(ProgrammaticCall {
            tool_name: tool_name.into(),
            input,
            include_tool_call: true,
        })
    }

    /// Inputs observed so far (test introspection).
    #[must_use]
    pub fn seen_inputs(&self) -> &[StepInput] {
        &self.inputs
    }
}

#[async_trait]
impl HandleSteps for ScriptedSteps {
    async fn next(&mut self, input: StepInput) -> Result<StepYield> {
        self.inputs.push(input);
        Ok(self.yields.pop_front().unwrap_or(StepYield::Done))
    }
}

/// A [`HandleSteps`] built from a trusted closure.
pub struct FnSteps(Box<dyn FnMut(StepInput) -> StepYield + Send>);

impl std::fmt::Debug for FnSteps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnSteps").finish_non_exhaustive()
    }
}

impl FnSteps {
    /// Wrap a closure as a generator.
    #[must_use]
    pub fn new(step: impl FnMut(StepInput) -> StepYield + Send + 'static) -> Self {
        Self(Box::new(step))
    }
}

#[async_trait]
impl HandleSteps for FnSteps {
    async fn next(&mut self, input: StepInput) -> Result<StepYield> {
        Ok((self.0)(input))
    }
}
