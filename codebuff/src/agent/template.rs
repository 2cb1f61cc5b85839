//! Declarative agent templates.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::scheduler::HandleSteps;
use crate::tools::names;

/// Shape of the [`AgentOutput`](crate::agent::state::AgentOutput) a
/// template produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// The text of the last assistant message.
    #[default]
    LastMessage,
    /// Every message appended since the run boundary.
    AllMessages,
    /// The structured value accumulated via `set_output`.
    StructuredOutput,
}

/// Factory producing one trusted in-process generator per run.
///
/// Registered on engine-owned templates only; templates arriving over the
/// wire can carry sandboxed source but never native code.
#[derive(Clone)]
pub struct NativeSteps(pub Arc<dyn Fn() -> Box<dyn HandleSteps> + Send + Sync>);

impl NativeSteps {
    /// Wrap a factory closure.
    #[must_use]
    pub fn new(factory: impl Fn() -> Box<dyn HandleSteps> + Send + Sync + 'static) -> Self {
        Self(Arc::new(factory))
    }

    /// Instantiate a generator for one run.
    #[must_use]
    pub fn instantiate(&self) -> Box<dyn HandleSteps> {
        (self.0)()
    }
}

impl std::fmt::Debug for NativeSteps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeSteps").finish_non_exhaustive()
    }
}

/// Declarative definition of one agent kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTemplate {
    /// Unique template id.
    pub id: String,
    /// Human-readable name.
    #[serde(default)]
    pub display_name: String,
    /// Model identifier used for this agent's LLM turns.
    pub model: String,
    /// Guidance shown to parents deciding whether to spawn this agent.
    #[serde(default)]
    pub spawner_prompt: String,
    /// Schema the spawn `params` must conform to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
    /// Schema the structured output must conform to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    /// Output shape.
    #[serde(default)]
    pub output_mode: OutputMode,
    /// Tools callable from this agent's LLM output.
    #[serde(default)]
    pub tool_names: Vec<String>,
    /// Template ids this agent may spawn.
    #[serde(default)]
    pub spawnable_agents: Vec<String>,
    /// System prompt template.
    #[serde(default)]
    pub system_prompt: String,
    /// Instructions prompt template, injected with the user prompt.
    #[serde(default)]
    pub instructions_prompt: String,
    /// Step prompt template, refreshed each iteration.
    #[serde(default)]
    pub step_prompt: String,
    /// Whether the parent's history is copied into the child.
    #[serde(default)]
    pub include_message_history: bool,
    /// Whether the child prepends the parent's system prompt to its own.
    #[serde(default)]
    pub inherit_parent_system_prompt: bool,
    /// Sandboxed `handleSteps` generator source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle_steps: Option<String>,
    /// Trusted in-process generator factory; wins over `handle_steps`.
    #[serde(skip)]
    pub native_steps: Option<NativeSteps>,
    /// Per-parent guidance, keyed by parent template id.
    #[serde(default)]
    pub parent_instructions: HashMap<String, String>,
}

impl AgentTemplate {
    /// Minimal template with the given id and model.
    #[must_use]
    pub fn new(id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: String::new(),
            model: model.into(),
            spawner_prompt: String::new(),
            input_schema: None,
            output_schema: None,
            output_mode: OutputMode::default(),
            tool_names: Vec::new(),
            spawnable_agents: Vec::new(),
            system_prompt: String::new(),
            instructions_prompt: String::new(),
            step_prompt: String::new(),
            include_message_history: false,
            inherit_parent_system_prompt: false,
            handle_steps: None,
            native_steps: None,
            parent_instructions: HashMap::new(),
        }
    }

    /// Whether this template declares any programmatic step source.
    #[must_use]
    pub const fn has_handle_steps(&self) -> bool {
        self.native_steps.is_some() || self.handle_steps.is_some()
    }
}

/// The engine's built-in main-agent template.
///
/// Sessions may shadow it by supplying their own template with the same id.
#[must_use]
pub fn base_template(model: &str) -> AgentTemplate {
    let mut template = AgentTemplate::new("base", model);
    template.display_name = "Codebuff".to_owned();
    template.tool_names = vec![
        names::READ_FILES.to_owned(),
        names::WRITE_FILE.to_owned(),
        names::STR_REPLACE.to_owned(),
        names::RUN_TERMINAL_COMMAND.to_owned(),
        names::CODE_SEARCH.to_owned(),
        names::GLOB.to_owned(),
        names::LIST_DIRECTORY.to_owned(),
        names::WEB_SEARCH.to_owned(),
        names::RUN_FILE_CHANGE_HOOKS.to_owned(),
        names::SPAWN_AGENTS.to_owned(),
        names::SPAWN_AGENT_INLINE.to_owned(),
        names::END_TURN.to_owned(),
        names::SET_OUTPUT.to_owned(),
        names::SET_MESSAGES.to_owned(),
    ];
    template.system_prompt = "You are Codebuff, a coding agent working inside the user's \
                              project.\n\nProject file tree:\n{{FILE_TREE}}\n\nSystem: \
                              {{SYSTEM_INFO}}"
        .to_owned();
    template.instructions_prompt =
        "Work on the user's request using the available tools: {{TOOL_NAMES}}. Call end_turn \
         when you are finished."
            .to_owned();
    template.step_prompt =
        "Git changes:\n{{GIT_CHANGES}}\nYou have {{REMAINING_STEPS}} steps remaining."
            .to_owned();
    template
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_templates_round_trip_without_native_steps() {
        let mut template = AgentTemplate::new("reviewer", "gpt-test");
        template.handle_steps = Some("function* () {}".to_owned());
        template.output_mode = OutputMode::StructuredOutput;

        let json = serde_json::to_value(&template).expect("serialize");
        assert_eq!(json["outputMode"], "structured_output");
        assert_eq!(json["handleSteps"], "function* () {}");

        let back: AgentTemplate = serde_json::from_value(json).expect("deserialize");
        assert!(back.native_steps.is_none());
        assert!(back.has_handle_steps());
    }

    #[test]
    fn base_template_allows_the_builtin_set() {
        let template = base_template("gpt-test");
        assert!(template.tool_names.contains(&"end_turn".to_owned()));
        assert!(template.tool_names.contains(&"spawn_agents".to_owned()));
        assert!(!template.has_handle_steps());
    }
}
