#![cfg_attr(docsrs, feature(doc_cfg))]
//! Codebuff agent runtime.
//!
//! A server-side engine that advances LLM-driven agents through reasoning
//! steps, interleaving model-generated tool calls with programmatic
//! (`handleSteps`) and client-delegated tool executions. One prompt spawns
//! a main agent that may recursively spawn subagents; every agent streams
//! chunks to its caller while the executor dispatches tools and folds their
//! results back into the conversation.
//!
//! The crate is organized around the runtime's moving parts:
//!
//! - [`tools`] — the tool registry, input schemas, and envelope rendering
//! - [`parser`] — the streaming tool-call parser
//! - [`executor`] — tool dispatch with asynchronous result plumbing
//! - [`sandbox`] — the QuickJS sandbox hosting untrusted `handleSteps`
//! - [`scheduler`] — the STEP / STEP_ALL handshake state machine
//! - [`agent`] — templates, per-run state, the run loop, orchestration
//! - [`session`] — the opaque round-trippable session snapshot
//! - [`protocol`] / [`server`] — the WebSocket wire protocol
//! - [`bridge`] — the client tool bridge and its local implementations
//! - [`llm`] — the injected model-provider seam (with a scripted mock)
//! - [`engine`] — the facade tying one prompt run together

pub mod agent;
pub mod bridge;
pub mod engine;
pub mod error;
pub mod executor;
pub mod llm;
pub mod message;
pub mod parser;
pub mod protocol;
pub mod sandbox;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod tools;

pub use agent::{AgentOutput, AgentState, AgentTemplate, NativeSteps, OutputMode};
pub use engine::{Engine, EngineConfig, Outbound, RunEnv, ToolHandler};
pub use error::{Error, Result};
pub use message::{Message, Role, ToolCall, ToolResult, ToolResultPart};
pub use protocol::{ClientAction, PrintChunk, PromptPayload, ServerAction};
pub use session::SessionState;
