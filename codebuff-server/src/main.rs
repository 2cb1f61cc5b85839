//! Codebuff runtime server: engine + WebSocket endpoint.

mod config;
mod provider;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use codebuff::bridge::HttpWebSearcher;
use codebuff::engine::{Engine, EngineConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::provider::HttpProvider;

/// Command-line arguments; every flag overrides the config file.
#[derive(Debug, Parser)]
#[command(name = "codebuff-server", version, about)]
struct Args {
    /// Listen address.
    #[arg(long)]
    listen: Option<String>,

    /// Path to a TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Chat-completions endpoint of the model provider.
    #[arg(long)]
    model_endpoint: Option<String>,

    /// Model id handed to the provider.
    #[arg(long)]
    model: Option<String>,

    /// Execute built-in tools against this directory instead of
    /// delegating them to connected clients.
    #[arg(long)]
    local_tools: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;

    let listen = args
        .listen
        .or(config.server.listen)
        .unwrap_or_else(|| "127.0.0.1:4242".to_owned());
    let endpoint = args
        .model_endpoint
        .or(config.model.endpoint)
        .or_else(|| std::env::var("CODEBUFF_MODEL_ENDPOINT").ok())
        .ok_or("no model endpoint configured; set [model].endpoint or --model-endpoint")?;
    let model = args
        .model
        .or(config.model.id)
        .unwrap_or_else(|| "default".to_owned());

    let engine_config = EngineConfig {
        model,
        max_agent_steps: config
            .limits
            .max_agent_steps
            .unwrap_or(codebuff::session::DEFAULT_MAX_AGENT_STEPS),
        api_key: std::env::var("CODEBUFF_API_KEY").ok(),
    };

    let mut engine = Engine::new(Arc::new(HttpProvider::new(endpoint)), engine_config);
    if let Some(endpoint) = config.search.endpoint {
        engine = engine.with_searcher(Arc::new(HttpWebSearcher::new(endpoint)));
    }
    if let Some(root) = args.local_tools.or(config.tools.local_root) {
        info!(root = %root.display(), "built-in tools run locally");
        engine = engine.with_local_tools(root);
    }

    let router = codebuff::server::router(Arc::new(engine));
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    info!(listen = %listen, "codebuff server ready");
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
