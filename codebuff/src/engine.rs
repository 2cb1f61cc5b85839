//! Engine facade: process-wide state and the per-prompt run environment.
//!
//! The [`Engine`] owns everything that outlives a single prompt — the
//! injected capabilities, engine-registered templates, the sandbox
//! registry, the pending-request table, and the live-input cancellation
//! set. [`Engine::handle_prompt`] assembles a [`RunEnv`] per prompt and
//! drives the whole flow — session sanitation, overrides, the direct
//! terminal shortcut, the main agent run, and the final response — sending
//! every wire action through the caller-provided outbound channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{info, info_span, warn};
use tracing::Instrument as _;

use crate::agent::runner::{self, ChildSpawn, RunArtifacts};
use crate::agent::state::{AgentOutput, AgentState};
use crate::agent::template::{AgentTemplate, base_template};
use crate::agent::{direct, prompts};
use crate::bridge::{LocalToolHost, ToolHost, WebSearcher, delegation_timeout};
use crate::bridge::search::NoopWebSearcher;
use crate::llm::LlmProvider;
use crate::message::{Message, ToolCall, ToolResult, ToolResultPart};
use crate::protocol::{PrintChunk, PromptPayload, ServerAction};
use crate::sandbox::SandboxRegistry;
use crate::server::host::WireToolHost;
use crate::server::pending::PendingRequests;
use crate::session::{SessionOverrides, SessionState};
use crate::tools::{ToolRegistry, names};

/// Cooperative cancellation flag for one prompt and all its descendants.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelSignal {
    /// Create an unset signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the prompt cancelled and wake every waiter.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
        self.notify.notify_waiters();
    }

    /// Check the flag; every suspend point in the scheduler does.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Wait until the prompt is cancelled.
    pub async fn cancelled(&self) {
        loop {
            // Register interest before re-checking the flag so a cancel
            // landing in between is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// A host-registered override for one tool name.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Execute the call; failures are returned as error parts.
    async fn handle(&self, input: &Value) -> Vec<ToolResultPart>;
}

/// Outbound half of the wire channel.
///
/// Chunk emission is fire-and-forget: a dropped receiver means the client
/// is gone, and the cancellation path tears the run down.
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: tokio::sync::mpsc::UnboundedSender<ServerAction>,
}

impl Outbound {
    /// Wrap a channel sender.
    #[must_use]
    pub const fn new(tx: tokio::sync::mpsc::UnboundedSender<ServerAction>) -> Self {
        Self { tx }
    }

    /// Send an action, ignoring a closed channel.
    pub fn send(&self, action: ServerAction) {
        if self.tx.send(action).is_err() {
            warn!("outbound channel closed; dropping action");
        }
    }

    /// `true` once the client side of the channel is gone.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Prompt-substitution sources snapshotted from the session.
#[derive(Debug, Clone, Default)]
pub struct PromptSources {
    /// Rendered file tree.
    pub file_tree: String,
    /// Rendered git snapshot.
    pub git_changes: String,
    /// Rendered host facts.
    pub system_info: String,
}

/// Everything one prompt run (main agent plus descendants) shares.
pub struct RunEnv {
    /// Tool registry including session custom tools.
    pub registry: Arc<ToolRegistry>,
    /// Injected model capability.
    pub provider: Arc<dyn LlmProvider>,
    /// Host for client-delegated built-ins and custom tools.
    pub tool_host: Arc<dyn ToolHost>,
    /// Injected web-search capability.
    pub searcher: Arc<dyn WebSearcher>,
    /// Host-registered tool overrides.
    pub overrides: Arc<HashMap<String, Arc<dyn ToolHandler>>>,
    /// Sandbox registry shared across runs.
    pub sandboxes: Arc<SandboxRegistry>,
    /// Resolvable agent templates (engine defaults plus session overrides).
    pub templates: Arc<HashMap<String, Arc<AgentTemplate>>>,
    /// The prompt id chunks are tagged with.
    pub user_input_id: String,
    /// Outbound wire channel.
    pub outbound: Outbound,
    /// Cancellation signal for the whole prompt.
    pub cancel: CancelSignal,
    /// Step budget granted to spawned children.
    pub child_steps: u32,
    /// Prompt-substitution sources.
    pub prompt_sources: PromptSources,
    credits: Mutex<f64>,
}

impl std::fmt::Debug for RunEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunEnv")
            .field("user_input_id", &self.user_input_id)
            .finish_non_exhaustive()
    }
}

impl RunEnv {
    /// Fold one turn's credits into the prompt total.
    pub fn add_credits(&self, credits: f64) {
        if let Ok(mut total) = self.credits.lock() {
            *total += credits;
        }
    }

    /// Total credits consumed by the run tree so far.
    #[must_use]
    pub fn total_credits(&self) -> f64 {
        self.credits.lock().map(|total| *total).unwrap_or(0.0)
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Model id for the built-in `base` template.
    pub model: String,
    /// Step budget for fresh main agents and spawned children.
    pub max_agent_steps: u32,
    /// Expected auth token; `None` disables authentication.
    pub api_key: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model: "codebuff-base".to_owned(),
            max_agent_steps: crate::session::DEFAULT_MAX_AGENT_STEPS,
            api_key: None,
        }
    }
}

/// The stateless-per-request prompt executor.
pub struct Engine {
    provider: Arc<dyn LlmProvider>,
    tool_host: Option<Arc<dyn ToolHost>>,
    searcher: Arc<dyn WebSearcher>,
    overrides: HashMap<String, Arc<dyn ToolHandler>>,
    templates: HashMap<String, AgentTemplate>,
    sandboxes: Arc<SandboxRegistry>,
    pending: Arc<PendingRequests>,
    live: Mutex<HashMap<String, CancelSignal>>,
    config: EngineConfig,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("templates", &self.templates.keys().collect::<Vec<_>>())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Create an engine around an injected provider.
    ///
    /// Without a tool host, host-bound tools are delegated to the client
    /// over the wire; see [`Engine::with_tool_host`] for single-process
    /// deployments.
    #[must_use]
    pub fn new(provider: Arc<dyn LlmProvider>, config: EngineConfig) -> Self {
        let mut templates = HashMap::new();
        let base = base_template(&config.model);
        templates.insert(base.id.clone(), base);
        Self {
            provider,
            tool_host: None,
            searcher: Arc::new(NoopWebSearcher),
            overrides: HashMap::new(),
            templates,
            sandboxes: Arc::new(SandboxRegistry::new()),
            pending: Arc::new(PendingRequests::new()),
            live: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Execute host-bound tools in-process instead of delegating them.
    #[must_use]
    pub fn with_tool_host(mut self, host: Arc<dyn ToolHost>) -> Self {
        self.tool_host = Some(host);
        self
    }

    /// Execute host-bound tools against a local project directory.
    #[must_use]
    pub fn with_local_tools(self, root: impl Into<std::path::PathBuf>) -> Self {
        self.with_tool_host(Arc::new(LocalToolHost::new(root)))
    }

    /// Inject the web-search capability.
    #[must_use]
    pub fn with_searcher(mut self, searcher: Arc<dyn WebSearcher>) -> Self {
        self.searcher = searcher;
        self
    }

    /// Register an engine-owned agent template (may carry native
    /// `handleSteps`); session templates with the same id win.
    pub fn register_template(&mut self, template: AgentTemplate) {
        self.templates.insert(template.id.clone(), template);
    }

    /// Register a host override for one tool name.
    pub fn register_override(&mut self, name: impl Into<String>, handler: Arc<dyn ToolHandler>) {
        self.overrides.insert(name.into(), handler);
    }

    /// Route a `tool-call-response` to its waiting request.
    pub fn resolve_tool_call(&self, request_id: &str, output: Vec<ToolResultPart>) -> bool {
        self.pending.resolve_tool(request_id, output)
    }

    /// Route a `read-files-response` to its waiting request.
    pub fn resolve_read_files(
        &self,
        request_id: &str,
        files: HashMap<String, Option<String>>,
    ) -> bool {
        self.pending.resolve_files(request_id, files)
    }

    /// Cancel a running prompt; cascades to all of its children.
    pub fn cancel(&self, prompt_id: &str) {
        let signal = self
            .live
            .lock()
            .ok()
            .and_then(|live| live.get(prompt_id).cloned());
        if let Some(signal) = signal {
            info!(prompt_id, "cancelling prompt");
            signal.cancel();
        }
    }

    /// Run one prompt to completion, streaming chunks and the final
    /// response through `outbound`.
    pub async fn handle_prompt(
        &self,
        payload: PromptPayload,
        outbound: tokio::sync::mpsc::UnboundedSender<ServerAction>,
    ) {
        let outbound = Outbound::new(outbound);
        let prompt_id = payload.prompt_id.clone();
        let span = info_span!("prompt", prompt_id = %prompt_id);

        if let Some(expected) = &self.config.api_key
            && payload.auth_token != *expected
        {
            outbound.send(ServerAction::PromptError {
                user_input_id: prompt_id,
                message: "authentication failed".to_owned(),
            });
            return;
        }

        let cancel = CancelSignal::new();
        if let Ok(mut live) = self.live.lock() {
            live.insert(prompt_id.clone(), cancel.clone());
        }

        self.run_prompt(payload, &outbound, cancel)
            .instrument(span)
            .await;

        if let Ok(mut live) = self.live.lock() {
            live.remove(&prompt_id);
        }
    }

    async fn run_prompt(&self, payload: PromptPayload, outbound: &Outbound, cancel: CancelSignal) {
        let prompt_id = payload.prompt_id.clone();

        // The session blob is deep-cloned by deserialization; reset the
        // server-authoritative counters and fold in client overrides.
        let mut session = payload
            .session_state
            .map_or_else(SessionState::default, |boxed| *boxed);
        session.sanitize();
        // Each prompt gets a fresh step budget; a client override below may
        // still replace it.
        session.main_agent_state.steps_remaining = self.config.max_agent_steps;
        session.apply_overrides(SessionOverrides {
            agent_definitions: payload.agent_definitions,
            custom_tool_definitions: payload.custom_tool_definitions,
            project_files: payload.project_files,
            knowledge_files: payload.knowledge_files,
            max_agent_steps: payload.max_agent_steps,
        });

        let mut registry = ToolRegistry::new();
        for definition in session.custom_tool_definitions.values() {
            if let Err(e) = registry.register_custom(definition.clone()) {
                warn!(tool = %definition.name, error = %e, "skipping custom tool");
            }
        }

        let mut templates: HashMap<String, Arc<AgentTemplate>> = self
            .templates
            .iter()
            .map(|(id, template)| (id.clone(), Arc::new(template.clone())))
            .collect();
        for (id, template) in &session.agent_templates {
            templates.insert(id.clone(), Arc::new(template.clone()));
        }

        let tool_host: Arc<dyn ToolHost> = match &self.tool_host {
            Some(host) => Arc::clone(host),
            None => Arc::new(WireToolHost::new(
                Arc::clone(&self.pending),
                outbound.clone(),
                prompt_id.clone(),
                cancel.clone(),
            )),
        };

        let env = RunEnv {
            registry: Arc::new(registry),
            provider: Arc::clone(&self.provider),
            tool_host,
            searcher: Arc::clone(&self.searcher),
            overrides: Arc::new(self.overrides.clone()),
            sandboxes: Arc::clone(&self.sandboxes),
            templates: Arc::new(templates),
            user_input_id: prompt_id.clone(),
            outbound: outbound.clone(),
            cancel,
            child_steps: self.config.max_agent_steps,
            prompt_sources: PromptSources {
                file_tree: session.file_context.file_tree.clone(),
                git_changes: prompts::format_git_changes(&session.git_changes),
                system_info: prompts::format_system_info(&session.system_info),
            },
            credits: Mutex::new(0.0),
        };

        let mut state = session.main_agent_state.clone();
        for result in payload.tool_results {
            state.message_history.push(Message::tool(result));
        }

        let Some(template) = env
            .templates
            .get(&state.agent_type)
            .or_else(|| env.templates.get("base"))
            .cloned()
        else {
            outbound.send(ServerAction::PromptError {
                user_input_id: prompt_id,
                message: format!("agent template {} not found", state.agent_type),
            });
            return;
        };

        // Direct terminal shortcut: main agent only, before any LLM turn.
        let artifacts = match direct::resolve(&payload.prompt, &*env.provider, &template.model)
            .await
        {
            Some(command) => run_direct_command(&env, state, &payload.prompt, command).await,
            None => {
                runner::run_agent(
                    &env,
                    ChildSpawn {
                        template,
                        state,
                        prompt: payload.prompt.clone(),
                        params: None,
                        parent_system_prompt: None,
                        parent_type: None,
                        stream_as: None,
                    },
                )
                .await
            }
        };

        let total = env.total_credits();
        session.credits_used = total;
        let main_agent_id = artifacts.state.agent_id.clone();
        session.main_agent_state = artifacts.state;

        outbound.send(ServerAction::ResponseChunk {
            user_input_id: prompt_id.clone(),
            chunk: PrintChunk::Finish {
                agent_id: Some(main_agent_id),
                total_cost: total,
            },
        });
        outbound.send(ServerAction::PromptResponse {
            prompt_id,
            session_state: Box::new(session),
            tool_calls: artifacts.tool_calls,
            tool_results: artifacts.tool_results,
            output: artifacts.output,
        });
        outbound.send(ServerAction::UsageResponse {
            credits_used: total,
        });
    }
}

/// Dispatch a raw shell command without taking an LLM turn.
async fn run_direct_command(
    env: &RunEnv,
    mut state: AgentState,
    prompt: &str,
    command: String,
) -> RunArtifacts {
    let agent_id = state.agent_id.clone();
    env.outbound.send(ServerAction::ResponseChunk {
        user_input_id: env.user_input_id.clone(),
        chunk: PrintChunk::Start {
            agent_id: Some(agent_id.clone()),
            message_history_length: state.message_history.len(),
        },
    });

    let boundary = state.message_history.len();
    state.message_history.push(Message::user(prompt).kept());

    let input = serde_json::json!({ "command": command });
    let call =
        ToolCall::new(names::RUN_TERMINAL_COMMAND, input.clone()).with_agent_id(agent_id.clone());

    env.outbound.send(ServerAction::ResponseChunk {
        user_input_id: env.user_input_id.clone(),
        chunk: PrintChunk::ToolCall {
            tool_call_id: call.tool_call_id.clone(),
            tool_name: call.tool_name.clone(),
            input: call.input.clone(),
            agent_id: Some(agent_id.clone()),
            parent_agent_id: None,
        },
    });

    let parts = env
        .tool_host
        .call(
            names::RUN_TERMINAL_COMMAND,
            &call.input,
            delegation_timeout(&call.input),
            None,
        )
        .await;
    let result = ToolResult::new(
        call.tool_call_id.clone(),
        call.tool_name.clone(),
        parts.clone(),
    );

    env.outbound.send(ServerAction::ResponseChunk {
        user_input_id: env.user_input_id.clone(),
        chunk: PrintChunk::ToolResult {
            tool_call_id: call.tool_call_id.clone(),
            output: parts,
            agent_id: Some(agent_id),
            parent_agent_id: None,
        },
    });

    state
        .message_history
        .push(Message::assistant(crate::tools::render::render_tool_call(
            &call,
        )));
    state.message_history.push(Message::tool(result.clone()));

    let output = AgentOutput::AllMessages {
        value: state.message_history[boundary + 1..].to_vec(),
    };
    RunArtifacts {
        state,
        output,
        tool_calls: vec![call],
        tool_results: vec![result],
    }
}
