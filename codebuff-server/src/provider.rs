//! Minimal chat-completions provider for OpenAI-compatible endpoints.
//!
//! The runtime treats the provider as an injected capability; this adapter
//! is just enough to point the server at a local model host (LM Studio,
//! Ollama, llama.cpp, vLLM). Responses are delivered as a single text
//! chunk; streaming transports belong to richer provider integrations.

use async_trait::async_trait;
use codebuff::error::{Error, Result};
use codebuff::llm::{LlmChunk, LlmProvider, LlmRequest, LlmStream};
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

/// Provider hitting one chat-completions endpoint.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpProvider {
    /// Create a provider for the given endpoint.
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }

    async fn chat(&self, request: &LlmRequest) -> Result<String> {
        let body = json!({
            "model": request.model,
            "messages": request
                .messages
                .iter()
                .map(|m| json!({ "role": m.role, "content": m.content }))
                .collect::<Vec<_>>(),
        });
        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::model(format!("model request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::model(format!(
                "model endpoint returned {}",
                response.status()
            )));
        }
        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| Error::model(format!("unparseable model response: {e}")))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| Error::model("model response had no content"))
    }
}

#[async_trait]
impl LlmProvider for HttpProvider {
    async fn stream_turn(&self, request: LlmRequest) -> Result<LlmStream> {
        let text = self.chat(&request).await?;
        Ok(Box::pin(futures::stream::iter(vec![LlmChunk::text(text)])))
    }

    async fn complete(&self, request: LlmRequest) -> Result<String> {
        self.chat(&request).await
    }
}
