//! JS sandbox manager for user-supplied `handleSteps` source.
//!
//! Each run gets at most one sandbox: a QuickJS runtime on a dedicated
//! thread, driven over a command channel so the interpreter never crosses an
//! await point. The hosted code is a single generator function; the sandbox
//! exposes it as a stepwise iterator. Sandbox code has no filesystem,
//! network, or environment access; its only I/O is the yielded values and
//! the injected logger, whose calls stream out as log chunks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};

use rquickjs::{CatchResultExt, Context, Function, Object, Persistent, Runtime, function::This};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Memory ceiling per sandbox.
const MEMORY_LIMIT: usize = 20 * 1024 * 1024;
/// Stack bound per sandbox.
const STACK_LIMIT: usize = 256 * 1024;

/// One log line emitted by sandboxed code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxLog {
    /// Log level (`info`, `warn`, `error`, `debug`).
    pub level: String,
    /// Rendered message.
    pub message: String,
}

/// Result of advancing the generator once.
#[derive(Debug, Clone)]
pub struct SandboxStep {
    /// JSON-serialized yielded value, absent for `undefined`/`null`.
    pub value: Option<String>,
    /// `true` when the generator returned.
    pub done: bool,
}

enum Command {
    Step {
        input_json: String,
        reply: tokio::sync::oneshot::Sender<std::result::Result<SandboxStep, String>>,
    },
    Dispose,
}

/// Handle to one sandbox thread.
#[derive(Clone)]
pub struct SandboxHandle {
    commands: mpsc::Sender<Command>,
    interrupt: Arc<AtomicBool>,
}

impl std::fmt::Debug for SandboxHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxHandle").finish_non_exhaustive()
    }
}

impl SandboxHandle {
    /// Advance the generator with the given JSON input.
    ///
    /// The input carries the preceding tool result and the public agent
    /// state view; the return value is the raw yielded JSON.
    pub async fn step(&self, input_json: String) -> Result<SandboxStep> {
        let (reply, rx) = tokio::sync::oneshot::channel();
        self.commands
            .send(Command::Step { input_json, reply })
            .map_err(|_| Error::sandbox("sandbox thread is gone"))?;
        let outcome = rx
            .await
            .map_err(|_| Error::sandbox("sandbox thread dropped its reply"))?;
        outcome.map_err(Error::Sandbox)
    }

    /// Request interruption of any JS currently executing.
    pub fn interrupt(&self) {
        self.interrupt.store(true, Ordering::Relaxed);
    }

    fn dispose(&self) {
        self.interrupt();
        let _ = self.commands.send(Command::Dispose);
    }
}

/// Process-wide registry of sandboxes keyed by `runId`.
///
/// Each entry is accessed only by its owning task; create/remove are the
/// only cross-task mutations and are mutex-guarded.
#[derive(Debug, Default)]
pub struct SandboxRegistry {
    entries: Mutex<HashMap<String, SandboxHandle>>,
}

impl SandboxRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the sandbox for a run, creating it on first use.
    ///
    /// `init_json` is the argument object handed to the generator function
    /// (`{ agentState, prompt, params }`); the logger is injected on top of
    /// it inside the sandbox.
    pub fn get_or_create(
        &self,
        run_id: &str,
        source: &str,
        init_json: String,
        logs: tokio::sync::mpsc::UnboundedSender<SandboxLog>,
    ) -> Result<SandboxHandle> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| Error::internal("sandbox registry poisoned"))?;
        if let Some(handle) = entries.get(run_id) {
            return Ok(handle.clone());
        }

        let (commands, receiver) = mpsc::channel();
        let interrupt = Arc::new(AtomicBool::new(false));
        let handle = SandboxHandle {
            commands,
            interrupt: Arc::clone(&interrupt),
        };

        let source = source.to_owned();
        let thread_run_id = run_id.to_owned();
        std::thread::Builder::new()
            .name(format!("codebuff-sandbox-{run_id}"))
            .spawn(move || {
                sandbox_thread(&thread_run_id, &source, init_json, &logs, interrupt, &receiver);
            })
            .map_err(|e| Error::sandbox(format!("failed to spawn sandbox thread: {e}")))?;

        entries.insert(run_id.to_owned(), handle.clone());
        Ok(handle)
    }

    /// Dispose the sandbox for a run, if any. Safe to call on every run
    /// termination path.
    pub fn remove(&self, run_id: &str) {
        let handle = self
            .entries
            .lock()
            .ok()
            .and_then(|mut entries| entries.remove(run_id));
        if let Some(handle) = handle {
            debug!(run_id, "disposing sandbox");
            handle.dispose();
        }
    }

    /// Number of live sandboxes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    /// `true` when no sandboxes are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Cell {
    // The runtime must outlive the context; both die with the thread.
    _runtime: Runtime,
    context: Context,
    generator: Persistent<Object<'static>>,
}

/// Wraps the raw logger channel into a `console`-shaped object so only
/// strings cross the host boundary.
const LOGGER_BOOTSTRAP: &str = r#"
(function (hostLog) {
    const render = (args) =>
        args.map((x) => (typeof x === "string" ? x : JSON.stringify(x))).join(" ");
    return {
        log: (...a) => hostLog("info", render(a)),
        info: (...a) => hostLog("info", render(a)),
        debug: (...a) => hostLog("debug", render(a)),
        warn: (...a) => hostLog("warn", render(a)),
        error: (...a) => hostLog("error", render(a)),
    };
})
"#;

fn sandbox_thread(
    run_id: &str,
    source: &str,
    init_json: String,
    logs: &tokio::sync::mpsc::UnboundedSender<SandboxLog>,
    interrupt: Arc<AtomicBool>,
    receiver: &mpsc::Receiver<Command>,
) {
    let mut cell: Option<Cell> = None;
    let mut init_error: Option<String> = None;

    while let Ok(command) = receiver.recv() {
        match command {
            Command::Step { input_json, reply } => {
                interrupt.store(false, Ordering::Relaxed);
                if cell.is_none() && init_error.is_none() {
                    match build_cell(source, &init_json, logs, &interrupt) {
                        Ok(built) => cell = Some(built),
                        Err(e) => init_error = Some(e),
                    }
                }
                let outcome = match (&cell, &init_error) {
                    (_, Some(e)) => Err(e.clone()),
                    (Some(cell), None) => step_cell(cell, &input_json),
                    (None, None) => Err("sandbox initialization failed".to_owned()),
                };
                let _ = reply.send(outcome);
            }
            Command::Dispose => break,
        }
    }
    debug!(run_id, "sandbox thread exiting");
}

fn build_cell(
    source: &str,
    init_json: &str,
    logs: &tokio::sync::mpsc::UnboundedSender<SandboxLog>,
    interrupt: &Arc<AtomicBool>,
) -> std::result::Result<Cell, String> {
    let runtime = Runtime::new().map_err(|e| e.to_string())?;
    runtime.set_memory_limit(MEMORY_LIMIT);
    runtime.set_max_stack_size(STACK_LIMIT);
    let flag = Arc::clone(interrupt);
    runtime.set_interrupt_handler(Some(Box::new(move || flag.load(Ordering::Relaxed))));

    let context = Context::full(&runtime).map_err(|e| e.to_string())?;
    let logs = logs.clone();
    let generator = context.with(|ctx| -> std::result::Result<_, String> {
        let factory: Function = ctx
            .eval(format!("({source})"))
            .catch(&ctx)
            .map_err(|e| e.to_string())?;

        let host_log = Function::new(ctx.clone(), move |level: String, message: String| {
            if logs.send(SandboxLog { level, message }).is_err() {
                warn!("sandbox log receiver dropped");
            }
        })
        .catch(&ctx)
        .map_err(|e| e.to_string())?;
        let bootstrap: Function = ctx
            .eval(LOGGER_BOOTSTRAP)
            .catch(&ctx)
            .map_err(|e| e.to_string())?;
        let logger: Object = bootstrap
            .call((host_log,))
            .catch(&ctx)
            .map_err(|e| e.to_string())?;

        let init: rquickjs::Value = ctx
            .json_parse(init_json.to_owned())
            .catch(&ctx)
            .map_err(|e| e.to_string())?;
        if let Some(init_obj) = init.as_object() {
            init_obj
                .set("logger", logger)
                .catch(&ctx)
                .map_err(|e| e.to_string())?;
        }

        let generator: Object = factory
            .call((init,))
            .catch(&ctx)
            .map_err(|e| e.to_string())?;
        Ok(Persistent::save(&ctx, generator))
    })?;

    Ok(Cell {
        _runtime: runtime,
        context,
        generator,
    })
}

fn step_cell(cell: &Cell, input_json: &str) -> std::result::Result<SandboxStep, String> {
    cell.context.with(|ctx| {
        let generator: Object = cell
            .generator
            .clone()
            .restore(&ctx)
            .map_err(|e| e.to_string())?;
        let next: Function = generator
            .get("next")
            .catch(&ctx)
            .map_err(|e| e.to_string())?;
        let input: rquickjs::Value = ctx
            .json_parse(input_json.to_owned())
            .catch(&ctx)
            .map_err(|e| e.to_string())?;
        let outcome: Object = next
            .call((This(generator), input))
            .catch(&ctx)
            .map_err(|e| e.to_string())?;

        let done: bool = outcome
            .get::<_, Option<bool>>("done")
            .catch(&ctx)
            .map_err(|e| e.to_string())?
            .unwrap_or(false);
        let value: rquickjs::Value = outcome
            .get("value")
            .catch(&ctx)
            .map_err(|e| e.to_string())?;
        let value = if value.is_undefined() || value.is_null() {
            None
        } else {
            match ctx
                .json_stringify(value)
                .catch(&ctx)
                .map_err(|e| e.to_string())?
            {
                Some(text) => Some(text.to_string().map_err(|e| e.to_string())?),
                None => None,
            }
        };

        Ok(SandboxStep { value, done })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logs_channel() -> (
        tokio::sync::mpsc::UnboundedSender<SandboxLog>,
        tokio::sync::mpsc::UnboundedReceiver<SandboxLog>,
    ) {
        tokio::sync::mpsc::unbounded_channel()
    }

    const GENERATOR: &str = r#"
function* handleSteps({ agentState, prompt, params, logger }) {
    logger.log("starting", prompt);
    const result = yield { toolName: "read_files", input: { paths: ["a.txt"] } };
    yield "STEP";
    yield { toolName: "end_turn", input: {} };
}
"#;

    #[tokio::test]
    async fn generator_yields_in_order() {
        let registry = SandboxRegistry::new();
        let (tx, mut rx) = logs_channel();
        let init = serde_json::json!({
            "agentState": { "agentId": "a1" },
            "prompt": "do it",
            "params": null,
        });
        let handle = registry
            .get_or_create("run-1", GENERATOR, init.to_string(), tx)
            .expect("create");

        let step = handle.step("{}".to_owned()).await.expect("step 1");
        assert!(!step.done);
        let value: serde_json::Value =
            serde_json::from_str(step.value.as_deref().expect("value")).expect("json");
        assert_eq!(value["toolName"], "read_files");

        let step = handle.step("{}".to_owned()).await.expect("step 2");
        let value: serde_json::Value =
            serde_json::from_str(step.value.as_deref().expect("value")).expect("json");
        assert_eq!(value, serde_json::json!("STEP"));

        let step = handle.step("{}".to_owned()).await.expect("step 3");
        let value: serde_json::Value =
            serde_json::from_str(step.value.as_deref().expect("value")).expect("json");
        assert_eq!(value["toolName"], "end_turn");

        let step = handle.step("{}".to_owned()).await.expect("step 4");
        assert!(step.done);
        assert!(step.value.is_none());

        let log = rx.recv().await.expect("log line");
        assert_eq!(log.level, "info");
        assert_eq!(log.message, "starting do it");

        registry.remove("run-1");
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn syntax_errors_surface_on_first_step() {
        let registry = SandboxRegistry::new();
        let (tx, _rx) = logs_channel();
        let handle = registry
            .get_or_create("run-bad", "function* broken( {", "{}".to_owned(), tx)
            .expect("create");
        let err = handle.step("{}".to_owned()).await.expect_err("syntax error");
        assert!(matches!(err, Error::Sandbox(_)));
    }

    #[tokio::test]
    async fn uncaught_exception_is_a_sandbox_error() {
        let registry = SandboxRegistry::new();
        let (tx, _rx) = logs_channel();
        let source = r#"function* handleSteps() { throw new Error("kaboom"); }"#;
        let handle = registry
            .get_or_create("run-throw", source, "{}".to_owned(), tx)
            .expect("create");
        let err = handle.step("{}".to_owned()).await.expect_err("throw");
        assert!(err.to_string().contains("kaboom"));
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent_per_run() {
        let registry = SandboxRegistry::new();
        let (tx, _rx) = logs_channel();
        let a = registry
            .get_or_create("run-2", GENERATOR, "{}".to_owned(), tx.clone())
            .expect("create");
        let _b = registry
            .get_or_create("run-2", GENERATOR, "{}".to_owned(), tx)
            .expect("reuse");
        assert_eq!(registry.len(), 1);
        // The first handle still drives the same generator.
        let step = a.step("{}".to_owned()).await.expect("step");
        assert!(!step.done);
        registry.remove("run-2");
    }
}
