//! Scripted provider for deterministic tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream;

use super::{LlmChunk, LlmProvider, LlmRequest, LlmStream};
use crate::error::{Error, Result};

/// A provider that replays canned chunk scripts, one per turn, and records
/// every request it saw.
///
/// When the script queue runs dry, further turns yield an empty stream,
/// which the scheduler treats as a turn with no tool calls.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    turns: Mutex<VecDeque<Vec<LlmChunk>>>,
    completions: Mutex<VecDeque<String>>,
    requests: Mutex<Vec<LlmRequest>>,
}

impl ScriptedProvider {
    /// Create a provider with no scripted turns.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one streamed turn built from raw text split into single-chunk
    /// pieces. Splitting the text differently must not change parse results,
    /// so tests use [`Self::push_turn_chunks`] to exercise split patterns.
    pub fn push_turn_text(&self, text: impl Into<String>) {
        self.push_turn_chunks(vec![LlmChunk::text(text)]);
    }

    /// Queue one streamed turn from explicit chunks.
    pub fn push_turn_chunks(&self, chunks: Vec<LlmChunk>) {
        if let Ok(mut turns) = self.turns.lock() {
            turns.push_back(chunks);
        }
    }

    /// Queue a classifier completion.
    pub fn push_completion(&self, text: impl Into<String>) {
        if let Ok(mut completions) = self.completions.lock() {
            completions.push_back(text.into());
        }
    }

    /// Requests seen so far, in call order.
    #[must_use]
    pub fn seen_requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Number of streamed turns taken so far.
    #[must_use]
    pub fn turns_taken(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn stream_turn(&self, request: LlmRequest) -> Result<LlmStream> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
        let chunks = self
            .turns
            .lock()
            .map_err(|_| Error::internal("scripted provider poisoned"))?
            .pop_front()
            .unwrap_or_default();
        Ok(Box::pin(stream::iter(chunks)))
    }

    async fn complete(&self, _request: LlmRequest) -> Result<String> {
        self.completions
            .lock()
            .map_err(|_| Error::internal("scripted provider poisoned"))?
            .pop_front()
            .ok_or_else(|| Error::model("no scripted completion"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt as _;

    #[tokio::test]
    async fn replays_turns_in_order() {
        let provider = ScriptedProvider::new();
        provider.push_turn_text("first");
        provider.push_turn_chunks(vec![LlmChunk::text("sec"), LlmChunk::text("ond")]);

        let request = LlmRequest {
            model: "mock".into(),
            messages: Vec::new(),
        };

        let chunks: Vec<LlmChunk> = provider
            .stream_turn(request.clone())
            .await
            .expect("stream")
            .collect()
            .await;
        assert_eq!(chunks, vec![LlmChunk::text("first")]);

        let chunks: Vec<LlmChunk> = provider
            .stream_turn(request.clone())
            .await
            .expect("stream")
            .collect()
            .await;
        assert_eq!(chunks.len(), 2);

        // Exhausted script yields an empty turn.
        let chunks: Vec<LlmChunk> = provider
            .stream_turn(request)
            .await
            .expect("stream")
            .collect()
            .await;
        assert!(chunks.is_empty());
        assert_eq!(provider.turns_taken(), 3);
    }
}
