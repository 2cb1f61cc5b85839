//! The closed built-in tool set: input shapes and registry entries.
//!
//! Each input is a plain serde struct; validation is deserialization into
//! that struct, so a schema mismatch surfaces as a serde error string. The
//! JSON Schemas derived from the same structs are what gets shown to models
//! and clients.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ToolBinding, ToolSpec, names};
use crate::message::Message;

/// Input for `read_files`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ReadFilesInput {
    /// Project-relative paths to read.
    pub paths: Vec<String>,
}

/// Input for `write_file`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WriteFileInput {
    /// Project-relative path to write.
    pub path: String,
    /// Full new contents of the file.
    pub content: String,
}

/// Input for `str_replace`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StrReplaceInput {
    /// Project-relative path to edit.
    pub path: String,
    /// Exact text to replace.
    pub old: String,
    /// Replacement text.
    pub new: String,
    /// Replace every occurrence instead of requiring a unique match.
    #[serde(default)]
    pub replace_all: bool,
}

/// Input for `run_terminal_command`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunTerminalCommandInput {
    /// Shell command line to run.
    pub command: String,
    /// Working directory, relative to the project root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Seconds before the command is killed; negative disables the timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<f64>,
}

/// Input for `code_search`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CodeSearchInput {
    /// Regex pattern handed to ripgrep.
    pub pattern: String,
    /// Extra ripgrep flags, whitespace separated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<String>,
    /// Directory to search, relative to the project root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

/// Input for `glob`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GlobInput {
    /// Glob pattern matched against the project file tree.
    pub pattern: String,
}

/// Input for `list_directory`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ListDirectoryInput {
    /// Directory path relative to the project root.
    pub path: String,
}

/// Input for `web_search`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WebSearchInput {
    /// Search query.
    pub query: String,
    /// Maximum number of results to return.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_results: Option<usize>,
}

/// Input for `run_file_change_hooks`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunFileChangeHooksInput {
    /// Files whose change hooks should run.
    pub files: Vec<String>,
}

/// Input for `set_messages`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SetMessagesInput {
    /// Replacement message history.
    pub messages: Vec<Message>,
}

/// One child spec inside `spawn_agents`, and the whole input of
/// `spawn_agent_inline`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SpawnSpec {
    /// Template id of the child agent.
    pub agent_type: String,
    /// Prompt handed to the child.
    pub prompt: String,
    /// Structured params validated against the child's input schema.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Input for `spawn_agents`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SpawnAgentsInput {
    /// Children to spawn, in result order.
    pub agents: Vec<SpawnSpec>,
}

fn schema_of<T: JsonSchema>() -> Value {
    serde_json::to_value(schemars::schema_for!(T)).unwrap_or(Value::Null)
}

fn validate_as<T: for<'de> Deserialize<'de>>(input: &Value) -> Result<(), String> {
    serde_json::from_value::<T>(input.clone())
        .map(drop)
        .map_err(|e| e.to_string())
}

/// `end_turn` and `set_output` accept any JSON object (including empty).
fn validate_object(input: &Value) -> Result<(), String> {
    match input {
        Value::Object(_) | Value::Null => Ok(()),
        other => Err(format!("expected an object, got {other}")),
    }
}

fn object_schema() -> Value {
    serde_json::json!({ "type": "object" })
}

/// The closed built-in tool table.
///
/// `ends_step` marks the tools after which the LLM turn must stop emitting
/// and yield back to the scheduler; `returns_result` is `false` for the
/// control tools whose results are silently consumed.
pub(super) fn specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: names::END_TURN,
            description: "End the current turn.",
            ends_step: true,
            returns_result: false,
            binding: ToolBinding::Control,
            schema: object_schema,
            validate: validate_object,
        },
        ToolSpec {
            name: names::SET_OUTPUT,
            description: "Merge the given fields into the agent's structured output.",
            ends_step: true,
            returns_result: false,
            binding: ToolBinding::Control,
            schema: object_schema,
            validate: validate_object,
        },
        ToolSpec {
            name: names::SET_MESSAGES,
            description: "Replace the agent's message history.",
            ends_step: true,
            returns_result: false,
            binding: ToolBinding::Control,
            schema: schema_of::<SetMessagesInput>,
            validate: validate_as::<SetMessagesInput>,
        },
        ToolSpec {
            name: names::SPAWN_AGENTS,
            description: "Spawn child agents in parallel and collect their outputs in order.",
            ends_step: true,
            returns_result: true,
            binding: ToolBinding::Spawn,
            schema: schema_of::<SpawnAgentsInput>,
            validate: validate_as::<SpawnAgentsInput>,
        },
        ToolSpec {
            name: names::SPAWN_AGENT_INLINE,
            description: "Spawn one child agent whose activity streams inline with this turn.",
            ends_step: true,
            returns_result: true,
            binding: ToolBinding::Spawn,
            schema: schema_of::<SpawnSpec>,
            validate: validate_as::<SpawnSpec>,
        },
        ToolSpec {
            name: names::READ_FILES,
            description: "Read the contents of project files.",
            ends_step: false,
            returns_result: true,
            binding: ToolBinding::Host,
            schema: schema_of::<ReadFilesInput>,
            validate: validate_as::<ReadFilesInput>,
        },
        ToolSpec {
            name: names::WRITE_FILE,
            description: "Create or overwrite a project file.",
            ends_step: true,
            returns_result: true,
            binding: ToolBinding::Host,
            schema: schema_of::<WriteFileInput>,
            validate: validate_as::<WriteFileInput>,
        },
        ToolSpec {
            name: names::STR_REPLACE,
            description: "Replace an exact text span inside a project file.",
            ends_step: true,
            returns_result: true,
            binding: ToolBinding::Host,
            schema: schema_of::<StrReplaceInput>,
            validate: validate_as::<StrReplaceInput>,
        },
        ToolSpec {
            name: names::RUN_TERMINAL_COMMAND,
            description: "Run a shell command and return its output.",
            ends_step: true,
            returns_result: true,
            binding: ToolBinding::Host,
            schema: schema_of::<RunTerminalCommandInput>,
            validate: validate_as::<RunTerminalCommandInput>,
        },
        ToolSpec {
            name: names::CODE_SEARCH,
            description: "Search project files with ripgrep.",
            ends_step: false,
            returns_result: true,
            binding: ToolBinding::Host,
            schema: schema_of::<CodeSearchInput>,
            validate: validate_as::<CodeSearchInput>,
        },
        ToolSpec {
            name: names::GLOB,
            description: "Match a glob pattern against the project file tree.",
            ends_step: false,
            returns_result: true,
            binding: ToolBinding::Host,
            schema: schema_of::<GlobInput>,
            validate: validate_as::<GlobInput>,
        },
        ToolSpec {
            name: names::LIST_DIRECTORY,
            description: "List the entries of a project directory.",
            ends_step: false,
            returns_result: true,
            binding: ToolBinding::Host,
            schema: schema_of::<ListDirectoryInput>,
            validate: validate_as::<ListDirectoryInput>,
        },
        ToolSpec {
            name: names::WEB_SEARCH,
            description: "Search the web and return result snippets.",
            ends_step: false,
            returns_result: true,
            binding: ToolBinding::Local,
            schema: schema_of::<WebSearchInput>,
            validate: validate_as::<WebSearchInput>,
        },
        ToolSpec {
            name: names::RUN_FILE_CHANGE_HOOKS,
            description: "Run the project's configured file-change hooks.",
            ends_step: false,
            returns_result: true,
            binding: ToolBinding::Host,
            schema: schema_of::<RunFileChangeHooksInput>,
            validate: validate_as::<RunFileChangeHooksInput>,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_input_validates() {
        let ok = serde_json::json!({
            "agents": [{ "agent_type": "reviewer", "prompt": "check this" }]
        });
        assert!(validate_as::<SpawnAgentsInput>(&ok).is_ok());

        let missing_prompt = serde_json::json!({ "agents": [{ "agent_type": "reviewer" }] });
        assert!(validate_as::<SpawnAgentsInput>(&missing_prompt).is_err());
    }

    #[test]
    fn terminal_input_accepts_negative_timeout() {
        let input = serde_json::json!({ "command": "sleep 5", "timeout_seconds": -1 });
        let parsed: RunTerminalCommandInput =
            serde_json::from_value(input).expect("deserialize");
        assert_eq!(parsed.timeout_seconds, Some(-1.0));
    }

    #[test]
    fn every_spec_has_a_schema() {
        for spec in specs() {
            let schema = (spec.schema)();
            assert!(schema.is_object(), "schema for {} missing", spec.name);
        }
    }
}
