//! Tool registry and input validation.
//!
//! The registry declares the closed built-in set plus the per-session open
//! set of custom tools. Resolution answers the executor's questions: does
//! this tool end the LLM step, does its result flow back to the model, and
//! which dispatch path owns it. Validation failures never invoke a handler;
//! they become tool-result error parts upstream.

pub mod builtin;
pub mod render;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use builtin::{
    CodeSearchInput, GlobInput, ListDirectoryInput, ReadFilesInput, RunFileChangeHooksInput,
    RunTerminalCommandInput, SetMessagesInput, SpawnAgentsInput, SpawnSpec, StrReplaceInput,
    WebSearchInput, WriteFileInput,
};

/// Built-in tool names.
pub mod names {
    /// Ends the current turn.
    pub const END_TURN: &str = "end_turn";
    /// Merges fields into the agent's structured output.
    pub const SET_OUTPUT: &str = "set_output";
    /// Replaces the agent's message history.
    pub const SET_MESSAGES: &str = "set_messages";
    /// Spawns parallel child agents.
    pub const SPAWN_AGENTS: &str = "spawn_agents";
    /// Spawns one inline child agent.
    pub const SPAWN_AGENT_INLINE: &str = "spawn_agent_inline";
    /// Reads project files.
    pub const READ_FILES: &str = "read_files";
    /// Writes a project file.
    pub const WRITE_FILE: &str = "write_file";
    /// Replaces a text span in a project file.
    pub const STR_REPLACE: &str = "str_replace";
    /// Runs a shell command.
    pub const RUN_TERMINAL_COMMAND: &str = "run_terminal_command";
    /// Searches project files with ripgrep.
    pub const CODE_SEARCH: &str = "code_search";
    /// Matches a glob pattern against the file tree.
    pub const GLOB: &str = "glob";
    /// Lists a project directory.
    pub const LIST_DIRECTORY: &str = "list_directory";
    /// Searches the web.
    pub const WEB_SEARCH: &str = "web_search";
    /// Runs configured file-change hooks.
    pub const RUN_FILE_CHANGE_HOOKS: &str = "run_file_change_hooks";
}

/// Which dispatch path owns a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolBinding {
    /// Handled inside the scheduler/executor (`end_turn`, `set_output`,
    /// `set_messages`); never produces a history tool message.
    Control,
    /// Delegated to the orchestrator (`spawn_agents`, `spawn_agent_inline`).
    Spawn,
    /// Executed by the tool host (client-delegated in production, local in
    /// tests and single-process deployments).
    Host,
    /// Executed by a server-local capability (`web_search`).
    Local,
}

/// Static declaration of one built-in tool.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    /// Unique tool name.
    pub name: &'static str,
    /// Human-readable description shown to models.
    pub description: &'static str,
    /// The LLM turn stops emitting after this tool.
    pub ends_step: bool,
    /// The result is appended to history and returned to the model.
    pub returns_result: bool,
    /// Dispatch path.
    pub binding: ToolBinding,
    /// JSON Schema of the input.
    pub schema: fn() -> Value,
    /// Structural validation of an input value.
    pub validate: fn(&Value) -> Result<(), String>,
}

/// A per-session custom tool whose handler lives on the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomToolDefinition {
    /// Unique tool name; must not collide with a built-in.
    pub name: String,
    /// Human-readable description shown to models.
    #[serde(default)]
    pub description: String,
    /// JSON Schema the input must conform to.
    pub input_schema: Value,
    /// Whether the LLM turn stops emitting after this tool.
    #[serde(default)]
    pub ends_step: bool,
    /// Opaque configuration forwarded to the client with each call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_config: Option<Value>,
}

/// A resolved tool: either a built-in spec or a custom definition.
#[derive(Debug)]
pub enum ResolvedTool<'a> {
    /// A built-in tool.
    Builtin(&'a ToolSpec),
    /// A session-registered custom tool.
    Custom(&'a CustomToolDefinition),
}

impl ResolvedTool<'_> {
    /// Whether the LLM turn stops emitting after this tool.
    #[must_use]
    pub const fn ends_step(&self) -> bool {
        match self {
            Self::Builtin(spec) => spec.ends_step,
            Self::Custom(def) => def.ends_step,
        }
    }

    /// Whether the result flows back to the model via history.
    #[must_use]
    pub const fn returns_result(&self) -> bool {
        match self {
            Self::Builtin(spec) => spec.returns_result,
            Self::Custom(_) => true,
        }
    }

    /// Dispatch path for the executor.
    #[must_use]
    pub const fn binding(&self) -> ToolBinding {
        match self {
            Self::Builtin(spec) => spec.binding,
            // Custom handlers always live on the client.
            Self::Custom(_) => ToolBinding::Host,
        }
    }
}

/// The per-session tool registry.
pub struct ToolRegistry {
    builtins: Vec<ToolSpec>,
    custom: HashMap<String, CustomToolDefinition>,
    custom_validators: HashMap<String, jsonschema::Validator>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("builtins", &self.builtins.len())
            .field("custom", &self.custom.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    /// Create a registry containing the built-in set only.
    #[must_use]
    pub fn new() -> Self {
        Self {
            builtins: builtin::specs(),
            custom: HashMap::new(),
            custom_validators: HashMap::new(),
        }
    }

    /// Register a custom tool, replacing any previous definition of the
    /// same name. Built-in names cannot be shadowed.
    pub fn register_custom(&mut self, def: CustomToolDefinition) -> crate::Result<()> {
        if self.builtins.iter().any(|spec| spec.name == def.name) {
            return Err(crate::Error::session(format!(
                "custom tool '{}' shadows a built-in tool",
                def.name
            )));
        }
        match jsonschema::validator_for(&def.input_schema) {
            Ok(validator) => {
                self.custom_validators.insert(def.name.clone(), validator);
            }
            Err(e) => {
                return Err(crate::Error::session(format!(
                    "custom tool '{}' has an invalid input schema: {e}",
                    def.name
                )));
            }
        }
        self.custom.insert(def.name.clone(), def);
        Ok(())
    }

    /// Look up a tool by name.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<ResolvedTool<'_>> {
        if let Some(spec) = self.builtins.iter().find(|spec| spec.name == name) {
            return Some(ResolvedTool::Builtin(spec));
        }
        self.custom.get(name).map(ResolvedTool::Custom)
    }

    /// Whether the named tool ends the LLM step. Unknown names do not.
    #[must_use]
    pub fn ends_step(&self, name: &str) -> bool {
        self.resolve(name).is_some_and(|tool| tool.ends_step())
    }

    /// Validate an input value against the named tool's schema.
    ///
    /// Returns the reason string used verbatim in tool-result errors.
    pub fn validate_input(&self, name: &str, input: &Value) -> Result<(), String> {
        match self.resolve(name) {
            None => Err(format!("Tool {name} not found")),
            Some(ResolvedTool::Builtin(spec)) => (spec.validate)(input),
            Some(ResolvedTool::Custom(_)) => match self.custom_validators.get(name) {
                Some(validator) => validator
                    .validate(input)
                    .map_err(|e| format!("input does not match schema: {e}")),
                None => Ok(()),
            },
        }
    }

    /// Names of every registered tool, built-ins first.
    #[must_use]
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .builtins
            .iter()
            .map(|spec| spec.name.to_owned())
            .collect();
        let mut custom: Vec<String> = self.custom.keys().cloned().collect();
        custom.sort();
        names.append(&mut custom);
        names
    }

    /// The registered custom tool definitions.
    #[must_use]
    pub const fn custom_tools(&self) -> &HashMap<String, CustomToolDefinition> {
        &self.custom
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_builtins() {
        let registry = ToolRegistry::new();
        let tool = registry.resolve(names::WRITE_FILE).expect("resolved");
        assert!(tool.ends_step());
        assert!(tool.returns_result());
        assert_eq!(tool.binding(), ToolBinding::Host);

        let end_turn = registry.resolve(names::END_TURN).expect("resolved");
        assert!(end_turn.ends_step());
        assert!(!end_turn.returns_result());
    }

    #[test]
    fn unknown_tool_reports_not_found() {
        let registry = ToolRegistry::new();
        assert!(registry.resolve("nope").is_none());
        let err = registry
            .validate_input("nope", &serde_json::json!({}))
            .expect_err("unknown");
        assert_eq!(err, "Tool nope not found");
    }

    #[test]
    fn builtin_validation_rejects_bad_shapes() {
        let registry = ToolRegistry::new();
        let err = registry
            .validate_input(names::READ_FILES, &serde_json::json!({"paths": "a.txt"}))
            .expect_err("paths must be a list");
        assert!(err.contains("expected a sequence"), "got: {err}");

        assert!(
            registry
                .validate_input(names::READ_FILES, &serde_json::json!({"paths": ["a.txt"]}))
                .is_ok()
        );
    }

    #[test]
    fn custom_tools_validate_against_their_schema() {
        let mut registry = ToolRegistry::new();
        registry
            .register_custom(CustomToolDefinition {
                name: "lint".into(),
                description: "Run the linter".into(),
                input_schema: serde_json::json!({
                    "type": "object",
                    "properties": { "fix": { "type": "boolean" } },
                    "required": ["fix"],
                }),
                ends_step: false,
                mcp_config: None,
            })
            .expect("register");

        assert!(
            registry
                .validate_input("lint", &serde_json::json!({"fix": true}))
                .is_ok()
        );
        assert!(
            registry
                .validate_input("lint", &serde_json::json!({"fix": "yes"}))
                .is_err()
        );
    }

    #[test]
    fn custom_tool_cannot_shadow_builtin() {
        let mut registry = ToolRegistry::new();
        let err = registry
            .register_custom(CustomToolDefinition {
                name: names::END_TURN.into(),
                description: String::new(),
                input_schema: serde_json::json!({"type": "object"}),
                ends_step: false,
                mcp_config: None,
            })
            .expect_err("shadowing");
        assert!(err.to_string().contains("shadows"));
    }
}
