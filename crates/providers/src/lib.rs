//! The abstract chat-completion capability consumed by the engine.
//!
//! Wire adapters (OpenAI-compatible, Anthropic, …) live outside the core;
//! the engine only needs `complete` / `stream_complete` plus a way to
//! tell a retryable truncated stream apart from a hard provider failure.

use std::pin::Pin;

use serde::{Deserialize, Serialize};

use relay_domain::chat::{Message, Usage};
use relay_domain::config::LlmModelConfig;

/// A boxed async stream, used for streaming completions.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// Errors surfaced by an LLM client.
#[derive(thiserror::Error, Debug)]
pub enum LlmError {
    /// The stream ended before the provider finished the response.
    /// Retryable with backoff.
    #[error("incomplete stream: {0}")]
    IncompleteStream(String),

    #[error("timeout after {0}s")]
    Timeout(u64),

    #[error("provider: {0}")]
    Provider(String),
}

impl LlmError {
    /// Whether the streaming loop may retry this failure.
    pub fn is_retryable_stream(&self) -> bool {
        matches!(self, LlmError::IncompleteStream(_))
    }
}

pub type LlmResult<T> = std::result::Result<T, LlmError>;

/// A fully-assembled completion.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub content: String,
    pub reasoning: String,
    pub usage: Option<Usage>,
}

/// One streamed chunk. `usage` arrives at most once, at stream end.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamChunk {
    #[serde(default)]
    pub content_delta: Option<String>,
    #[serde(default)]
    pub reasoning_delta: Option<String>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

/// A completion request carrying the resolved model config.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub model: LlmModelConfig,
    /// Overrides the model's `max_output` (compaction and memory digests
    /// lower it).
    pub max_output: Option<u64>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<Message>, model: LlmModelConfig) -> Self {
        Self {
            messages,
            model,
            max_output: None,
        }
    }
}

/// The chat-completion capability. Stateless from the engine's point of
/// view; implementations may pool connections internally.
#[async_trait::async_trait]
pub trait LlmClient: Send + Sync {
    /// Unary completion.
    async fn complete(&self, req: CompletionRequest) -> LlmResult<Completion>;

    /// Streaming completion. The stream yields chunks until the provider
    /// finishes; a truncated stream surfaces as
    /// [`LlmError::IncompleteStream`] so the caller can retry.
    async fn stream_complete(
        &self,
        req: CompletionRequest,
    ) -> LlmResult<BoxStream<'static, LlmResult<StreamChunk>>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_marker() {
        assert!(LlmError::IncompleteStream("cut".into()).is_retryable_stream());
        assert!(!LlmError::Provider("500".into()).is_retryable_stream());
        assert!(!LlmError::Timeout(60).is_retryable_stream());
    }

    #[test]
    fn stream_chunk_deserializes_sparse() {
        let chunk: StreamChunk =
            serde_json::from_str(r#"{"content_delta":"hi"}"#).unwrap();
        assert_eq!(chunk.content_delta.as_deref(), Some("hi"));
        assert!(chunk.usage.is_none());
    }
}
