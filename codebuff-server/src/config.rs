//! Server configuration: TOML file with CLI overrides.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// `[server]` table.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ServerSection {
    /// Listen address.
    pub listen: Option<String>,
}

/// `[model]` table.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ModelSection {
    /// Chat-completions endpoint of the model provider.
    pub endpoint: Option<String>,
    /// Model id handed to the provider and the base template.
    pub id: Option<String>,
}

/// `[limits]` table.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LimitsSection {
    /// LLM-step budget per agent.
    pub max_agent_steps: Option<u32>,
}

/// `[search]` table.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SearchSection {
    /// Web-search endpoint; absent disables web search.
    pub endpoint: Option<String>,
}

/// `[tools]` table.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ToolsSection {
    /// Execute built-in tools against this directory instead of
    /// delegating them to the client.
    pub local_root: Option<PathBuf>,
}

/// The whole configuration file.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// `[server]` table.
    pub server: ServerSection,
    /// `[model]` table.
    pub model: ModelSection,
    /// `[limits]` table.
    pub limits: LimitsSection,
    /// `[search]` table.
    pub search: SearchSection,
    /// `[tools]` table.
    pub tools: ToolsSection,
}

impl Config {
    /// Load a configuration file; a missing path yields the defaults.
    pub fn load(path: Option<&Path>) -> codebuff::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .map_err(|e| codebuff::Error::config(format!("could not read {}: {e}", path.display())))?;
        toml::from_str(&raw)
            .map_err(|e| codebuff::Error::config(format!("could not parse {}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_partial_config() {
        let config: Config = toml::from_str(
            r#"
[server]
listen = "0.0.0.0:9000"

[model]
endpoint = "http://localhost:1234/v1/chat/completions"
id = "qwen2.5-32b-instruct"

[limits]
max_agent_steps = 20
"#,
        )
        .expect("parse");
        assert_eq!(config.server.listen.as_deref(), Some("0.0.0.0:9000"));
        assert_eq!(config.limits.max_agent_steps, Some(20));
        assert!(config.search.endpoint.is_none());
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = Config::load(Some(Path::new("/nonexistent/config.toml")))
            .expect_err("missing file");
        assert!(err.to_string().contains("could not read"));
    }
}
