//! Agents: templates, per-run state, the run loop, and orchestration.

pub mod direct;
pub mod orchestrator;
pub mod prompts;
pub mod runner;
pub mod state;
pub mod template;

pub use runner::RunArtifacts;
pub use state::{AgentOutput, AgentState, PublicAgentState};
pub use template::{AgentTemplate, NativeSteps, OutputMode, base_template};
