//! Prompt assembly: placeholder substitution and reminder envelopes.
//!
//! Templates carry `{{NAME}}` placeholders replaced at assembly time with
//! dynamic session content. The supported set is fixed; unknown
//! placeholders are left untouched so template bugs stay visible.

use crate::session::{GitChanges, SystemInfo};

/// Dynamic values substituted into prompt templates.
#[derive(Debug, Clone, Default)]
pub struct PromptContext {
    /// Rendered project file tree.
    pub file_tree: String,
    /// Rendered git snapshot.
    pub git_changes: String,
    /// Rendered host facts.
    pub system_info: String,
    /// LLM steps the agent has left.
    pub remaining_steps: u32,
    /// Names of the tools the agent may call.
    pub tool_names: Vec<String>,
}

/// Substitute the fixed placeholder set into a template string.
#[must_use]
pub fn render(template: &str, ctx: &PromptContext) -> String {
    template
        .replace("{{FILE_TREE}}", &ctx.file_tree)
        .replace("{{GIT_CHANGES}}", &ctx.git_changes)
        .replace("{{SYSTEM_INFO}}", &ctx.system_info)
        .replace("{{REMAINING_STEPS}}", &ctx.remaining_steps.to_string())
        .replace("{{TOOL_NAMES}}", &ctx.tool_names.join(", "))
}

/// Wrap injected guidance in the reminder envelope models are trained to
/// treat as non-user text.
#[must_use]
pub fn system_reminder(text: &str) -> String {
    format!("<system_reminder>\n{text}\n</system_reminder>")
}

/// The reminder injected when a template declares an output schema but the
/// run ended without calling `set_output`.
#[must_use]
pub fn output_schema_reminder(schema: &serde_json::Value) -> String {
    system_reminder(&format!(
        "You must call set_output with a value matching this schema before \
         ending your turn:\n{schema}"
    ))
}

/// Render host facts for the `{{SYSTEM_INFO}}` placeholder.
#[must_use]
pub fn format_system_info(info: &SystemInfo) -> String {
    format!(
        "platform: {} | shell: {}",
        if info.platform.is_empty() { "unknown" } else { &info.platform },
        if info.shell.is_empty() { "unknown" } else { &info.shell },
    )
}

/// Render the git snapshot for the `{{GIT_CHANGES}}` placeholder.
#[must_use]
pub fn format_git_changes(git: &GitChanges) -> String {
    if git.status.is_empty() && git.diff.is_empty() && git.diff_cached.is_empty() {
        return "(clean)".to_owned();
    }
    let mut out = String::new();
    if !git.status.is_empty() {
        out.push_str(&git.status);
        out.push('\n');
    }
    if !git.diff.is_empty() {
        out.push_str(&git.diff);
        out.push('\n');
    }
    if !git.diff_cached.is_empty() {
        out.push_str(&git.diff_cached);
        out.push('\n');
    }
    out
}
