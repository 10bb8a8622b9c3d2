//! Generative chat provider client and shared provider-call policy.
//!
//! All outbound AI calls (chat, vision, embeddings, transcription) share one
//! error taxonomy, one retry policy, and bounded per-request timeouts.

mod openai;
pub mod retry;

pub use openai::{ChatMessage, ContentBlock, ImageUrl, MessageContent, OpenAiClient};
pub use retry::RetryPolicy;

use async_trait::async_trait;

/// Error from any external AI provider call.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// API key was never configured. Detected at the call site; callers
    /// short-circuit instead of retrying every message.
    #[error("provider not configured: {0}")]
    Unconfigured(&'static str),
    #[error("provider request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("provider api error: {0}")]
    Api(String),
    /// Local preprocessing (scratch files, transcoding) failed before the
    /// provider was reached.
    #[error("media preprocessing failed: {0}")]
    Io(#[from] std::io::Error),
    /// Caller passed empty/whitespace input; no request was made.
    #[error("empty input")]
    EmptyInput,
}

impl ProviderError {
    /// True when the failure came from missing configuration rather than the
    /// provider itself.
    pub fn is_unconfigured(&self) -> bool {
        matches!(self, ProviderError::Unconfigured(_))
    }
}

/// Chat-completion backend: messages in, one assistant text out.
/// Seam for tests and alternative providers.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Single completion call returning the assistant message text.
    async fn complete(&self, messages: Vec<ChatMessage>) -> Result<String, ProviderError>;

    /// Vision completion: caption text plus an image URL content block.
    async fn complete_vision(
        &self,
        caption: &str,
        image_url: &str,
    ) -> Result<String, ProviderError>;
}
