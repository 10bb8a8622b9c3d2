//! Text embedding provider client.
//!
//! Wire contract: POST `{base}/embeddings` with `{model, input}`; the vector
//! is read from `data[0].embedding`. Vectors are only comparable to vectors
//! produced by the same model.

use crate::llm::retry::{self, RetryPolicy};
use crate::llm::ProviderError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Turns a string into a fixed-length vector. Seam for tests and the FAQ index.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError>;
}

/// Client for an OpenAI-style embeddings endpoint.
#[derive(Clone)]
pub struct EmbeddingClient {
    base_url: String,
    api_key: Option<String>,
    model: String,
    timeout: Duration,
    retry: RetryPolicy,
    client: reqwest::Client,
    missing_key_logged: Arc<AtomicBool>,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Option<Vec<EmbeddingObject>>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingObject {
    embedding: Vec<f32>,
}

impl EmbeddingClient {
    pub fn new(api_key: Option<String>, base_url: Option<String>, model: impl Into<String>) -> Self {
        let base_url = base_url
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self {
            base_url,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            model: model.into(),
            timeout: Duration::from_secs(120),
            retry: RetryPolicy::default(),
            client: reqwest::Client::new(),
            missing_key_logged: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_policy(mut self, timeout: Duration, retry: RetryPolicy) -> Self {
        self.timeout = timeout;
        self.retry = retry;
        self
    }
}

#[async_trait]
impl Embedder for EmbeddingClient {
    /// Embed one text. Empty/whitespace input is a caller bug and fails
    /// before any network attempt.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        if text.trim().is_empty() {
            return Err(ProviderError::EmptyInput);
        }
        let key = match self.api_key.as_deref() {
            Some(k) => k.to_string(),
            None => {
                if !self.missing_key_logged.swap(true, Ordering::SeqCst) {
                    log::warn!("OPENAI_API_KEY not configured; embeddings unavailable");
                }
                return Err(ProviderError::Unconfigured("OPENAI_API_KEY"));
            }
        };
        let url = format!("{}/embeddings", self.base_url);
        let body = EmbeddingRequest {
            model: &self.model,
            input: text,
        };
        let mut attempt: u32 = 0;
        loop {
            let sent = self
                .client
                .post(&url)
                .bearer_auth(&key)
                .timeout(self.timeout)
                .json(&body)
                .send()
                .await;
            let err: ProviderError = match sent {
                Ok(res) if res.status().is_success() => {
                    let data: EmbeddingResponse = res.json().await?;
                    let vector = data
                        .data
                        .and_then(|d| d.into_iter().next())
                        .map(|o| o.embedding)
                        .unwrap_or_default();
                    if vector.is_empty() {
                        return Err(ProviderError::Api("empty embedding in response".to_string()));
                    }
                    return Ok(vector);
                }
                Ok(res) => {
                    let status = res.status();
                    let text = res.text().await.unwrap_or_default();
                    if !retry::is_recoverable_status(status.as_u16()) {
                        return Err(ProviderError::Api(format!("{} {}", status, text)));
                    }
                    ProviderError::Api(format!("{} {}", status, text))
                }
                Err(e) => ProviderError::Request(e),
            };
            if attempt >= self.retry.max_retries {
                return Err(err);
            }
            let delay = retry::delay_for_attempt(&self.retry, attempt);
            log::debug!(
                "embedding attempt {} failed ({}), retrying in {:?}",
                attempt + 1,
                err,
                delay
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_input_is_rejected_before_any_request() {
        let client = EmbeddingClient::new(
            Some("key".to_string()),
            // Unroutable base URL: a network attempt would fail differently.
            Some("http://127.0.0.1:1".to_string()),
            "text-embedding-ada-002",
        );
        assert!(matches!(
            client.embed("   ").await,
            Err(ProviderError::EmptyInput)
        ));
    }

    #[tokio::test]
    async fn missing_key_short_circuits() {
        let client = EmbeddingClient::new(None, None, "text-embedding-ada-002");
        assert!(client.embed("hello").await.unwrap_err().is_unconfigured());
    }
}
