//! The injected LLM provider seam.
//!
//! The runtime never talks to a model API directly: hosts inject an
//! [`LlmProvider`] that turns a rendered request into a lazy stream of
//! [`LlmChunk`]s. Cost tracking, retries, and provider selection all live
//! behind this trait. [`mock::ScriptedProvider`] replays canned streams for
//! deterministic tests.

pub mod mock;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One chunk of a streamed model turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum LlmChunk {
    /// Plain output text.
    Text {
        /// The text delta.
        text: String,
    },
    /// Reasoning text, passed through to the client.
    Reasoning {
        /// The reasoning delta.
        text: String,
    },
    /// Provider-reported stream failure; terminates the turn.
    Error {
        /// The failure message.
        message: String,
    },
}

impl LlmChunk {
    /// Create a text chunk.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Create a reasoning chunk.
    #[must_use]
    pub fn reasoning(text: impl Into<String>) -> Self {
        Self::Reasoning { text: text.into() }
    }

    /// Create an error chunk.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// A provider-facing view of one history message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedMessage {
    /// Role string (`system` / `user` / `assistant` / `tool`).
    pub role: String,
    /// Flattened text content, with tool results in their envelope form.
    pub content: String,
}

/// A rendered request for one model turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmRequest {
    /// Model identifier from the agent template.
    pub model: String,
    /// Rendered conversation.
    pub messages: Vec<RenderedMessage>,
}

/// A lazy, finite stream of model chunks.
pub type LlmStream = Pin<Box<dyn Stream<Item = LlmChunk> + Send>>;

/// The injected model capability.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Start one streamed model turn.
    async fn stream_turn(&self, request: LlmRequest) -> Result<LlmStream>;

    /// Small non-streaming completion used by the direct-command
    /// classifier. Providers without a cheap model may leave the default,
    /// which makes the classifier fall through to normal processing.
    async fn complete(&self, request: LlmRequest) -> Result<String> {
        let _ = request;
        Err(Error::model("completion not supported by this provider"))
    }

    /// Credits charged per streamed turn, folded into usage accounting.
    fn credits_per_turn(&self) -> f64 {
        0.0
    }
}
