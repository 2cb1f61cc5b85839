//! Tool host seam and the local built-in tool implementations.
//!
//! The executor dispatches host-bound tools through the [`ToolHost`] trait.
//! In production the host is the wire bridge, which serializes each call to
//! the client and awaits the correlated response; [`LocalToolHost`] is the
//! client-side implementation of those built-ins (file reads and edits,
//! terminal, ripgrep, glob, directory listing), also used directly by
//! single-process deployments and tests.

pub mod files;
pub mod search;
pub mod terminal;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::message::ToolResultPart;
use crate::tools::names;

pub use search::{HttpWebSearcher, NoopWebSearcher, WebSearcher};

/// Default wait for a delegated tool call.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// Executes host-bound tool calls.
///
/// Implementations never fail: every error is wrapped as an
/// `{errorMessage}` result part.
#[async_trait]
pub trait ToolHost: Send + Sync {
    /// Execute one call and return its result parts.
    async fn call(
        &self,
        tool_name: &str,
        input: &Value,
        timeout: Option<Duration>,
        mcp_config: Option<&Value>,
    ) -> Vec<ToolResultPart>;
}

/// Resolve the delegation timeout from a call input.
///
/// `timeout_seconds < 0` disables the timeout; absent means the default.
#[must_use]
pub fn delegation_timeout(input: &Value) -> Option<Duration> {
    match input.get("timeout_seconds").and_then(Value::as_f64) {
        Some(secs) if secs < 0.0 => None,
        Some(secs) => Some(Duration::from_secs_f64(secs)),
        None => Some(DEFAULT_TOOL_TIMEOUT),
    }
}

/// A host that executes the built-in tools against the local filesystem and
/// shell, rooted at a project directory.
#[derive(Debug, Clone)]
pub struct LocalToolHost {
    root: PathBuf,
}

impl LocalToolHost {
    /// Create a host rooted at the given project directory.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn parse<T: for<'de> serde::Deserialize<'de>>(
        input: &Value,
    ) -> Result<T, Vec<ToolResultPart>> {
        serde_json::from_value(input.clone())
            .map_err(|e| vec![ToolResultPart::error(format!("invalid input: {e}"))])
    }
}

#[async_trait]
impl ToolHost for LocalToolHost {
    async fn call(
        &self,
        tool_name: &str,
        input: &Value,
        _timeout: Option<Duration>,
        _mcp_config: Option<&Value>,
    ) -> Vec<ToolResultPart> {
        match tool_name {
            names::READ_FILES => match Self::parse(input) {
                Ok(parsed) => files::read_files(&self.root, &parsed).await,
                Err(parts) => parts,
            },
            names::WRITE_FILE => match Self::parse(input) {
                Ok(parsed) => files::write_file(&self.root, &parsed).await,
                Err(parts) => parts,
            },
            names::STR_REPLACE => match Self::parse(input) {
                Ok(parsed) => files::str_replace(&self.root, &parsed).await,
                Err(parts) => parts,
            },
            names::LIST_DIRECTORY => match Self::parse(input) {
                Ok(parsed) => files::list_directory(&self.root, &parsed).await,
                Err(parts) => parts,
            },
            names::GLOB => match Self::parse(input) {
                Ok(parsed) => files::glob_files(&self.root, &parsed).await,
                Err(parts) => parts,
            },
            names::RUN_TERMINAL_COMMAND => match Self::parse(input) {
                Ok(parsed) => terminal::run_command(&self.root, &parsed).await,
                Err(parts) => parts,
            },
            names::CODE_SEARCH => match Self::parse(input) {
                Ok(parsed) => search::code_search(&self.root, &parsed).await,
                Err(parts) => parts,
            },
            names::RUN_FILE_CHANGE_HOOKS => vec![ToolResultPart::json(serde_json::json!({
                "message": "No file change hooks configured",
            }))],
            other => {
                warn!(tool = other, "local tool host cannot execute tool");
                vec![ToolResultPart::error(format!(
                    "Tool {other} is not available on the local tool host"
                ))]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delegation_timeout_honours_negative_values() {
        let none = delegation_timeout(&serde_json::json!({"timeout_seconds": -1}));
        assert!(none.is_none());

        let custom = delegation_timeout(&serde_json::json!({"timeout_seconds": 2.5}));
        assert_eq!(custom, Some(Duration::from_millis(2500)));

        let default = delegation_timeout(&serde_json::json!({}));
        assert_eq!(default, Some(DEFAULT_TOOL_TIMEOUT));
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error_part() {
        let host = LocalToolHost::new(std::env::temp_dir());
        let parts = host
            .call("custom_thing", &serde_json::json!({}), None, None)
            .await;
        assert_eq!(parts.len(), 1);
        assert!(parts[0].is_error());
    }
}
