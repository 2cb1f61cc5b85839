//! Direct terminal-command shortcut.
//!
//! Before the main agent's first LLM turn, inputs that look like raw shell
//! commands bypass the model entirely and dispatch a single
//! `run_terminal_command` call. Heuristics decide the obvious cases; a
//! low-cost classifier breaks ties, and any classifier failure falls
//! through to normal LLM processing.

use std::time::Duration;

use tracing::debug;

use crate::llm::{LlmProvider, LlmRequest, RenderedMessage};

/// Commands never run directly, regardless of how command-like they look.
const BLOCKED: &[&str] = &["halt", "reboot", "shutdown", "poweroff", "yes"];

/// First tokens that mark an input as a shell command.
const COMMAND_PREFIXES: &[&str] = &[
    "git", "npm", "pnpm", "yarn", "bun", "node", "python", "python3", "pip", "cargo", "rustc",
    "go", "make", "ls", "cat", "cd", "pwd", "grep", "rg", "find", "echo", "mkdir", "rm", "cp",
    "mv", "touch", "head", "tail", "which", "curl", "wget", "docker", "kubectl", "tsc",
];

/// Single-token inputs that are complete commands on their own.
const SOLO_COMMANDS: &[&str] = &["ls", "pwd", "whoami", "date", "df", "ps", "env"];

/// How long the tie-breaking classifier may take.
pub const CLASSIFIER_TIMEOUT: Duration = Duration::from_secs(30);

/// What the heuristics decided about an input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectDecision {
    /// Definitely a shell command; run it without an LLM turn.
    Run(String),
    /// Command-shaped but inconclusive; ask the classifier.
    Ambiguous(String),
    /// Ordinary prompt; take the normal LLM path.
    Prompt,
}

/// Classify an input with heuristics only.
#[must_use]
pub fn classify(input: &str) -> DirectDecision {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return DirectDecision::Prompt;
    }

    if let Some(rest) = trimmed.strip_prefix('!') {
        return DirectDecision::Run(rest.trim().to_owned());
    }
    if let Some(rest) = trimmed.strip_prefix("/run ") {
        return DirectDecision::Run(rest.trim().to_owned());
    }

    let mut tokens = trimmed.split_whitespace();
    let Some(first) = tokens.next() else {
        return DirectDecision::Prompt;
    };
    if BLOCKED.contains(&first) {
        return DirectDecision::Prompt;
    }
    if !COMMAND_PREFIXES.contains(&first) {
        return DirectDecision::Prompt;
    }

    let has_args = tokens.next().is_some();
    if has_args || SOLO_COMMANDS.contains(&first) {
        // Prose that happens to start with a command word usually reads as a
        // sentence; commands do not carry sentence punctuation.
        if trimmed.ends_with('?') || trimmed.split_whitespace().count() > 8 {
            return DirectDecision::Ambiguous(trimmed.to_owned());
        }
        return DirectDecision::Run(trimmed.to_owned());
    }
    DirectDecision::Ambiguous(trimmed.to_owned())
}

/// Resolve an input to a command to run directly, consulting the classifier
/// for ambiguous cases.
pub async fn resolve(
    input: &str,
    provider: &dyn LlmProvider,
    model: &str,
) -> Option<String> {
    match classify(input) {
        DirectDecision::Run(command) => Some(command),
        DirectDecision::Prompt => None,
        DirectDecision::Ambiguous(candidate) => {
            let request = LlmRequest {
                model: model.to_owned(),
                messages: vec![RenderedMessage {
                    role: "user".to_owned(),
                    content: format!(
                        "Is the following user input a shell command to execute verbatim, \
                         rather than a request in natural language? Answer YES or NO \
                         only.\n\n{candidate}"
                    ),
                }],
            };
            match tokio::time::timeout(CLASSIFIER_TIMEOUT, provider.complete(request)).await {
                Ok(Ok(answer)) if answer.trim().eq_ignore_ascii_case("yes") => Some(candidate),
                Ok(Ok(_)) => None,
                Ok(Err(e)) => {
                    debug!(error = %e, "direct-command classifier failed");
                    None
                }
                Err(_) => {
                    debug!("direct-command classifier timed out");
                    None
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bang_and_run_prefixes_always_run() {
        assert_eq!(classify("!make test"), DirectDecision::Run("make test".into()));
        assert_eq!(classify("/run cargo check"), DirectDecision::Run("cargo check".into()));
    }

    #[test]
    fn obvious_commands_run() {
        assert_eq!(classify("ls -la"), DirectDecision::Run("ls -la".into()));
        assert_eq!(classify("git status"), DirectDecision::Run("git status".into()));
        assert_eq!(classify("ls"), DirectDecision::Run("ls".into()));
    }

    #[test]
    fn blocked_commands_never_run() {
        assert_eq!(classify("reboot"), DirectDecision::Prompt);
        assert_eq!(classify("yes | rm -rf /"), DirectDecision::Prompt);
    }

    #[test]
    fn prose_is_a_prompt() {
        assert_eq!(classify("please refactor the parser"), DirectDecision::Prompt);
        assert_eq!(classify(""), DirectDecision::Prompt);
    }

    #[test]
    fn questionable_inputs_are_ambiguous() {
        assert!(matches!(classify("git"), DirectDecision::Ambiguous(_)));
        assert!(matches!(
            classify("git log shows weird merge commits, can you explain them?"),
            DirectDecision::Ambiguous(_)
        ));
    }

    #[tokio::test]
    async fn classifier_yes_runs_the_command() {
        let provider = crate::llm::mock::ScriptedProvider::new();
        provider.push_completion("YES");
        let resolved = resolve("git", &provider, "mock").await;
        assert_eq!(resolved.as_deref(), Some("git"));
    }

    #[tokio::test]
    async fn classifier_failure_falls_through() {
        let provider = crate::llm::mock::ScriptedProvider::new();
        // No scripted completion: the classifier errors and we fall through.
        let resolved = resolve("git", &provider, "mock").await;
        assert_eq!(resolved, None);
    }
}
