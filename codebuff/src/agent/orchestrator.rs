//! Orchestrator: spawning and supervising child agents.
//!
//! `spawn_agents` runs children concurrently as sibling tasks and assembles
//! their outputs in input order once every child reaches terminal state.
//! `spawn_agent_inline` runs one child whose stream is stitched into the
//! parent's as if it were one continuous turn.

use futures::future::join_all;
use tracing::{info, warn};

use super::runner::{self, AgentRun, ChildSpawn, StreamIdentity};
use super::state::{AgentOutput, AgentState};
use crate::error::Result;
use crate::executor::validate_against_schema;
use crate::message::{ToolCall, ToolResultPart};
use crate::protocol::{PrintChunk, ServerAction};
use crate::tools::{SpawnAgentsInput, SpawnSpec, names};

/// Route a spawn tool call.
pub(crate) async fn dispatch_spawn(
    run: &mut AgentRun<'_>,
    call: &ToolCall,
) -> Result<Vec<ToolResultPart>> {
    if call.tool_name == names::SPAWN_AGENT_INLINE {
        let spec: SpawnSpec = match serde_json::from_value(call.input.clone()) {
            Ok(spec) => spec,
            Err(e) => return Ok(vec![ToolResultPart::error(format!("invalid input: {e}"))]),
        };
        return Ok(spawn_agent_inline(run, spec).await);
    }

    let input: SpawnAgentsInput = match serde_json::from_value(call.input.clone()) {
        Ok(input) => input,
        Err(e) => return Ok(vec![ToolResultPart::error(format!("invalid input: {e}"))]),
    };
    Ok(spawn_agents(run, input).await)
}

/// Run a batch of children concurrently; the aggregate result carries one
/// part per child, in input order.
async fn spawn_agents(run: &mut AgentRun<'_>, input: SpawnAgentsInput) -> Vec<ToolResultPart> {
    let mut prepared = Vec::with_capacity(input.agents.len());
    for spec in &input.agents {
        match prepare_child(run, spec) {
            Ok(child) => prepared.push(child),
            Err(reason) => return vec![ToolResultPart::error(reason)],
        }
    }

    // Copy the env reference out so the child futures do not borrow `run`.
    let env = run.env;
    let parent_agent_id = run.emit_agent_id.clone();
    let futures: Vec<_> = prepared
        .into_iter()
        .map(|child| {
            let parent_agent_id = parent_agent_id.clone();
            async move {
                let child_agent_id = child.state.agent_id.clone();
                let child_type = child.state.agent_type.clone();
                env.outbound.send(ServerAction::ResponseChunk {
                    user_input_id: env.user_input_id.clone(),
                    chunk: PrintChunk::SubagentStart {
                        agent_id: child_agent_id.clone(),
                        agent_type: child_type,
                        parent_agent_id: Some(parent_agent_id.clone()),
                    },
                });

                let artifacts = runner::run_agent(env, child).await;

                env.outbound.send(ServerAction::ResponseChunk {
                    user_input_id: env.user_input_id.clone(),
                    chunk: PrintChunk::SubagentFinish {
                        agent_id: child_agent_id,
                        parent_agent_id: Some(parent_agent_id),
                    },
                });
                artifacts.output
            }
        })
        .collect();

    // Completion order is unconstrained; join_all restores input order.
    let outputs: Vec<AgentOutput> = join_all(futures).await;
    info!(children = outputs.len(), "spawn_agents complete");
    outputs
        .into_iter()
        .map(|output| ToolResultPart::json(output.to_value()))
        .collect()
}

/// Run one child inline: its chunks are forwarded under the parent's
/// identity so the client sees one continuous turn.
async fn spawn_agent_inline(run: &mut AgentRun<'_>, spec: SpawnSpec) -> Vec<ToolResultPart> {
    let mut child = match prepare_child(run, &spec) {
        Ok(child) => child,
        Err(reason) => return vec![ToolResultPart::error(reason)],
    };
    child.stream_as = Some(StreamIdentity {
        agent_id: run.emit_agent_id.clone(),
        parent_agent_id: run.emit_parent_id.clone(),
        as_main: run.is_main_stream(),
    });

    let env = run.env;
    let artifacts = runner::run_agent(env, child).await;
    vec![ToolResultPart::json(artifacts.output.to_value())]
}

/// Resolve a child template and build its initial state.
///
/// Fails with a descriptive reason for unknown template ids, spawns not
/// allowed by the parent template, and params that violate the child's
/// input schema.
fn prepare_child(run: &mut AgentRun<'_>, spec: &SpawnSpec) -> std::result::Result<ChildSpawn, String> {
    let template = run
        .env
        .templates
        .get(&spec.agent_type)
        .cloned()
        .ok_or_else(|| format!("Agent template {} not found", spec.agent_type))?;

    let allowed = &run.template.spawnable_agents;
    if !allowed.is_empty() && !allowed.contains(&spec.agent_type) {
        return Err(format!(
            "Agent {} may not spawn {}",
            run.template.id, spec.agent_type
        ));
    }

    if let Some(schema) = &template.input_schema {
        let params = spec.params.clone().unwrap_or(serde_json::Value::Null);
        if let Err(reason) = validate_against_schema(schema, &params) {
            warn!(child = %spec.agent_type, reason = %reason, "spawn params rejected");
            return Err(format!(
                "params for {} do not match its input schema: {reason}",
                spec.agent_type
            ));
        }
    }

    let mut state = AgentState::new(
        spec.agent_type.clone(),
        Some(run.state.agent_id.clone()),
        run.env.child_steps,
    );
    if template.include_message_history {
        state.message_history = run.state.message_history.clone();
    }
    run.state.child_run_ids.push(state.run_id.clone());

    let parent_system_prompt = template
        .inherit_parent_system_prompt
        .then(|| run.rendered_system_prompt.clone());

    Ok(ChildSpawn {
        template,
        state,
        prompt: spec.prompt.clone(),
        params: spec.params.clone(),
        parent_system_prompt,
        parent_type: Some(run.template.id.clone()),
        stream_as: None,
    })
}
