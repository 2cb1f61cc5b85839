//! Session state: the opaque, round-trippable snapshot the client owns.
//!
//! The server deep-clones the blob on entry, resets the cost counters it is
//! authoritative for, applies client overrides, mutates the agent tree while
//! executing, and hands the whole thing back. Nothing here is persisted
//! server-side.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::agent::state::AgentState;
use crate::agent::template::AgentTemplate;
use crate::tools::CustomToolDefinition;

/// Default LLM-step budget for a fresh main agent.
pub const DEFAULT_MAX_AGENT_STEPS: u32 = 12;

/// Host machine facts substituted into prompts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemInfo {
    /// Operating system name.
    #[serde(default)]
    pub platform: String,
    /// User shell.
    #[serde(default)]
    pub shell: String,
    /// Home directory.
    #[serde(default)]
    pub home_dir: String,
}

/// Snapshot of the project's git state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitChanges {
    /// `git status` output.
    #[serde(default)]
    pub status: String,
    /// Unstaged diff.
    #[serde(default)]
    pub diff: String,
    /// Staged diff.
    #[serde(default)]
    pub diff_cached: String,
    /// Recent commit subjects.
    #[serde(default)]
    pub last_commit_messages: String,
}

/// Project file knowledge carried with the session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileContext {
    /// Known project files and their contents.
    #[serde(default)]
    pub project_files: BTreeMap<String, String>,
    /// Rendered directory tree, recomputed when project files change.
    #[serde(default)]
    pub file_tree: String,
    /// Rough per-file token weights, recomputed with the tree.
    #[serde(default)]
    pub file_token_scores: BTreeMap<String, u32>,
}

impl FileContext {
    /// Recompute the rendered tree and token scores from `project_files`.
    pub fn recompute(&mut self) {
        self.file_tree = render_file_tree(self.project_files.keys().map(String::as_str));
        self.file_token_scores = self
            .project_files
            .iter()
            .map(|(path, contents)| {
                let score = u32::try_from(contents.len() / 4).unwrap_or(u32::MAX).max(1);
                (path.clone(), score)
            })
            .collect();
    }
}

/// Render a sorted, indented directory tree from a path list.
#[must_use]
pub fn render_file_tree<'a>(paths: impl Iterator<Item = &'a str>) -> String {
    let mut sorted: Vec<&str> = paths.collect();
    sorted.sort_unstable();

    let mut out = String::new();
    let mut printed_dirs: Vec<String> = Vec::new();
    for path in sorted {
        let components: Vec<&str> = path.split('/').collect();
        for depth in 0..components.len().saturating_sub(1) {
            let prefix = components[..=depth].join("/");
            if !printed_dirs.contains(&prefix) {
                out.push_str(&"  ".repeat(depth));
                out.push_str(components[depth]);
                out.push_str("/\n");
                printed_dirs.push(prefix);
            }
        }
        out.push_str(&"  ".repeat(components.len() - 1));
        out.push_str(components[components.len() - 1]);
        out.push('\n');
    }
    out
}

/// Client overrides applied on top of a provided session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionOverrides {
    /// Agent templates merged by id, last write wins.
    #[serde(default)]
    pub agent_definitions: Vec<AgentTemplate>,
    /// Custom tool definitions merged by name.
    #[serde(default)]
    pub custom_tool_definitions: Vec<CustomToolDefinition>,
    /// Replacement project file set; triggers file-context recompute.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_files: Option<BTreeMap<String, String>>,
    /// Replacement knowledge file set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub knowledge_files: Option<HashMap<String, String>>,
    /// Step budget for the main agent only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_agent_steps: Option<u32>,
}

/// The whole round-trippable session snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    /// State of the main agent, carried across prompts.
    pub main_agent_state: AgentState,
    /// Project file knowledge.
    #[serde(default)]
    pub file_context: FileContext,
    /// Session-registered agent templates by id.
    #[serde(default)]
    pub agent_templates: HashMap<String, AgentTemplate>,
    /// Session-registered custom tools by name.
    #[serde(default)]
    pub custom_tool_definitions: HashMap<String, CustomToolDefinition>,
    /// Summary of edits since the previous chat.
    #[serde(default)]
    pub changes_since_last_chat: String,
    /// Shell configuration files by path.
    #[serde(default)]
    pub shell_config_files: HashMap<String, String>,
    /// Host machine facts.
    #[serde(default)]
    pub system_info: SystemInfo,
    /// Git snapshot.
    #[serde(default)]
    pub git_changes: GitChanges,
    /// Knowledge files by path.
    #[serde(default)]
    pub knowledge_files: HashMap<String, String>,
    /// Total credits consumed; server-authoritative, reset on entry.
    #[serde(default)]
    pub credits_used: f64,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            main_agent_state: AgentState::new("base", None, DEFAULT_MAX_AGENT_STEPS),
            file_context: FileContext::default(),
            agent_templates: HashMap::new(),
            custom_tool_definitions: HashMap::new(),
            changes_since_last_chat: String::new(),
            shell_config_files: HashMap::new(),
            system_info: SystemInfo::default(),
            git_changes: GitChanges::default(),
            knowledge_files: HashMap::new(),
            credits_used: 0.0,
        }
    }
}

impl SessionState {
    /// Enforce the server-authoritative invariants on entry.
    pub fn sanitize(&mut self) {
        self.credits_used = 0.0;
        self.main_agent_state.direct_credits_used = 0.0;
    }

    /// Apply client overrides.
    ///
    /// Templates merge by id and custom tools by name (last write wins);
    /// a project-file override replaces the set and recomputes the file
    /// tree and token scores; `max_agent_steps` resets the main agent's
    /// remaining budget only.
    pub fn apply_overrides(&mut self, overrides: SessionOverrides) {
        for template in overrides.agent_definitions {
            debug!(template = %template.id, "session template override");
            self.agent_templates.insert(template.id.clone(), template);
        }
        for tool in overrides.custom_tool_definitions {
            self.custom_tool_definitions.insert(tool.name.clone(), tool);
        }
        if let Some(project_files) = overrides.project_files {
            self.file_context.project_files = project_files;
            self.file_context.recompute();
        }
        if let Some(knowledge_files) = overrides.knowledge_files {
            self.knowledge_files = knowledge_files;
        }
        if let Some(max_steps) = overrides.max_agent_steps {
            self.main_agent_state.steps_remaining = max_steps;
        }
    }
}
