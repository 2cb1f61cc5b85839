//! Code search via ripgrep, and the web-search capability seam.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::process::Command;
use tracing::{debug, warn};

use super::terminal::truncate_output;
use crate::message::ToolResultPart;
use crate::tools::{CodeSearchInput, WebSearchInput};

/// How long a ripgrep invocation may run.
const SEARCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Outer timeout for web searches.
pub const WEB_SEARCH_TIMEOUT: Duration = Duration::from_secs(100);

/// Search project files by delegating to the bundled ripgrep binary.
pub async fn code_search(root: &Path, input: &CodeSearchInput) -> Vec<ToolResultPart> {
    let cwd = match &input.cwd {
        Some(relative) => root.join(relative),
        None => root.to_path_buf(),
    };

    let mut command = Command::new("rg");
    command
        .args(["--line-number", "--no-heading", "--color", "never"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .current_dir(&cwd);
    if let Some(flags) = &input.flags {
        command.args(flags.split_whitespace());
    }
    command.arg("--").arg(&input.pattern);

    debug!(pattern = %input.pattern, cwd = %cwd.display(), "code search");

    let child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            return vec![ToolResultPart::error(format!(
                "could not run ripgrep: {e}"
            ))];
        }
    };
    let output = match tokio::time::timeout(SEARCH_TIMEOUT, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return vec![ToolResultPart::error(format!("ripgrep failed: {e}"))];
        }
        Err(_) => {
            return vec![ToolResultPart::error("code search timed out")];
        }
    };

    // Exit code 1 is ripgrep's "no matches"; 2+ is a real failure.
    match output.status.code() {
        Some(0) => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let (matches, truncated) = truncate_output(&stdout);
            vec![ToolResultPart::json(json!({
                "pattern": input.pattern,
                "matches": matches,
                "truncated": truncated,
            }))]
        }
        Some(1) => vec![ToolResultPart::text("No matches found")],
        _ => {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            vec![ToolResultPart::error(format!("ripgrep failed: {stderr}"))]
        }
    }
}

/// The injected web-search capability.
#[async_trait]
pub trait WebSearcher: Send + Sync {
    /// Run one search and return result parts; failures become error parts.
    async fn search(&self, input: &WebSearchInput) -> Vec<ToolResultPart>;
}

/// Searcher used when no endpoint is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopWebSearcher;

#[async_trait]
impl WebSearcher for NoopWebSearcher {
    async fn search(&self, _input: &WebSearchInput) -> Vec<ToolResultPart> {
        vec![ToolResultPart::error("web search is not configured")]
    }
}

/// Searcher backed by an HTTP search endpoint.
#[derive(Debug, Clone)]
pub struct HttpWebSearcher {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpWebSearcher {
    /// Create a searcher hitting the given endpoint with a `q` query param.
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl WebSearcher for HttpWebSearcher {
    async fn search(&self, input: &WebSearchInput) -> Vec<ToolResultPart> {
        let request = self
            .client
            .get(&self.endpoint)
            .query(&[("q", input.query.as_str())])
            .timeout(WEB_SEARCH_TIMEOUT);
        let request = match input.max_results {
            Some(max) => request.query(&[("max_results", max.to_string())]),
            None => request,
        };

        match request.send().await {
            Ok(response) if response.status().is_success() => match response.text().await {
                Ok(body) => {
                    let (body, _truncated) = truncate_output(&body);
                    vec![ToolResultPart::text(body)]
                }
                Err(e) => vec![ToolResultPart::error(format!("web search failed: {e}"))],
            },
            Ok(response) => {
                warn!(status = %response.status(), "web search returned an error status");
                vec![ToolResultPart::error(format!(
                    "web search failed with status {}",
                    response.status()
                ))]
            }
            Err(e) => vec![ToolResultPart::error(format!("web search failed: {e}"))],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_searcher_reports_unconfigured() {
        let parts = NoopWebSearcher
            .search(&WebSearchInput {
                query: "rust".into(),
                max_results: None,
            })
            .await;
        assert!(parts[0].is_error());
    }

    #[tokio::test]
    async fn code_search_finds_matches() {
        let dir = tempfile::tempdir().expect("tempdir");
        tokio::fs::write(dir.path().join("a.rs"), "fn needle() {}\n")
            .await
            .expect("write");

        let parts = code_search(
            dir.path(),
            &CodeSearchInput {
                pattern: "needle".into(),
                flags: None,
                cwd: None,
            },
        )
        .await;
        if parts[0].is_error() {
            // Machines without ripgrep installed surface a spawn error.
            return;
        }
        match &parts[0] {
            ToolResultPart::Json { value } => {
                assert!(value["matches"].as_str().expect("matches").contains("needle"));
            }
            ToolResultPart::Text { .. } => panic!("expected json matches"),
        }
    }

    #[tokio::test]
    async fn code_search_reports_no_matches() {
        let dir = tempfile::tempdir().expect("tempdir");
        tokio::fs::write(dir.path().join("a.rs"), "nothing here\n")
            .await
            .expect("write");

        let parts = code_search(
            dir.path(),
            &CodeSearchInput {
                pattern: "zzz_absent_zzz".into(),
                flags: None,
                cwd: None,
            },
        )
        .await;
        // Either "No matches found" or a spawn error if rg is missing.
        assert_eq!(parts.len(), 1);
    }
}
