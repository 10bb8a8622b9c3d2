//! OpenAI-compatible chat completions client (plain text and vision).
//!
//! Wire contract: POST `{base}/chat/completions` with
//! `{model, messages, max_tokens, temperature}`; the reply is read from
//! `choices[0].message.content`. Vision requests put the user content in an
//! array of `text` / `image_url` blocks.

use crate::llm::retry::{self, RetryPolicy};
use crate::llm::{ChatBackend, ProviderError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MAX_TOKENS: u32 = 1600;
const DEFAULT_TEMPERATURE: f32 = 0.7;

/// Client for an OpenAI-style chat completions endpoint.
#[derive(Clone)]
pub struct OpenAiClient {
    base_url: String,
    api_key: Option<String>,
    chat_model: String,
    vision_model: String,
    text_timeout: Duration,
    media_timeout: Duration,
    retry: RetryPolicy,
    client: reqwest::Client,
    /// Missing-key warning is logged once, then calls short-circuit silently.
    missing_key_logged: Arc<AtomicBool>,
}

/// One chat message on the wire. Content is either a plain string or a list
/// of typed blocks (vision).
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: MessageContent::Text(content.into()),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: MessageContent::Text(content.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Option<Vec<Choice>>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<ResponseMessage>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

impl OpenAiClient {
    /// `api_key: None` builds a client whose calls short-circuit to
    /// `ProviderError::Unconfigured` (logged once) instead of hitting the
    /// network on every message.
    pub fn new(
        api_key: Option<String>,
        base_url: Option<String>,
        chat_model: impl Into<String>,
        vision_model: impl Into<String>,
    ) -> Self {
        let base_url = base_url
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self {
            base_url,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            chat_model: chat_model.into(),
            vision_model: vision_model.into(),
            text_timeout: Duration::from_secs(30),
            media_timeout: Duration::from_secs(120),
            retry: RetryPolicy::default(),
            client: reqwest::Client::new(),
            missing_key_logged: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Override timeouts (text calls, media/vision calls) and retry policy.
    pub fn with_policy(
        mut self,
        text_timeout: Duration,
        media_timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        self.text_timeout = text_timeout;
        self.media_timeout = media_timeout;
        self.retry = retry;
        self
    }

    fn require_key(&self) -> Result<&str, ProviderError> {
        match self.api_key.as_deref() {
            Some(k) => Ok(k),
            None => {
                if !self.missing_key_logged.swap(true, Ordering::SeqCst) {
                    log::warn!("OPENAI_API_KEY not configured; chat completions unavailable");
                }
                Err(ProviderError::Unconfigured("OPENAI_API_KEY"))
            }
        }
    }

    /// POST /chat/completions with the shared retry policy. Retries only
    /// transport errors, 429 and 5xx.
    async fn post_chat(
        &self,
        body: &ChatRequest,
        timeout: Duration,
    ) -> Result<String, ProviderError> {
        let key = self.require_key()?.to_string();
        let url = format!("{}/chat/completions", self.base_url);
        let mut attempt: u32 = 0;
        loop {
            let sent = self
                .client
                .post(&url)
                .bearer_auth(&key)
                .timeout(timeout)
                .json(body)
                .send()
                .await;
            let err: ProviderError = match sent {
                Ok(res) if res.status().is_success() => {
                    let data: ChatResponse = res.json().await?;
                    let content = data
                        .choices
                        .and_then(|c| c.into_iter().next())
                        .and_then(|c| c.message)
                        .and_then(|m| m.content)
                        .unwrap_or_default();
                    return Ok(content.trim().to_string());
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
                "chat completion attempt {} failed ({}), retrying in {:?}",
                attempt + 1,
                err,
                delay
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl ChatBackend for OpenAiClient {
    async fn complete(&self, messages: Vec<ChatMessage>) -> Result<String, ProviderError> {
        let body = ChatRequest {
            model: self.chat_model.clone(),
            messages,
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
        };
        self.post_chat(&body, self.text_timeout).await
    }

    async fn complete_vision(
        &self,
        caption: &str,
        image_url: &str,
    ) -> Result<String, ProviderError> {
        let messages = vec![
            ChatMessage::system("Analyze the following images."),
            ChatMessage {
                role: "user".to_string(),
                content: MessageContent::Blocks(vec![
                    ContentBlock::Text {
                        text: caption.to_string(),
                    },
                    ContentBlock::ImageUrl {
                        image_url: ImageUrl {
                            url: image_url.to_string(),
                        },
                    },
                ]),
            },
        ];
        let body = ChatRequest {
            model: self.vision_model.clone(),
            messages,
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
        };
        self.post_chat(&body, self.media_timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vision_content_serializes_as_blocks() {
        let msg = ChatMessage {
            role: "user".to_string(),
            content: MessageContent::Blocks(vec![
                ContentBlock::Text {
                    text: "what is this?".to_string(),
                },
                ContentBlock::ImageUrl {
                    image_url: ImageUrl {
                        url: "https://example.com/media/1.jpg".to_string(),
                    },
                },
            ]),
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["content"][0]["type"], "text");
        assert_eq!(v["content"][1]["type"], "image_url");
        assert_eq!(
            v["content"][1]["image_url"]["url"],
            "https://example.com/media/1.jpg"
        );
    }

    #[tokio::test]
    async fn missing_key_short_circuits() {
        let client = OpenAiClient::new(None, None, "gpt-4o-2024-08-06", "gpt-4o-mini");
        let err = client
            .complete(vec![ChatMessage::user("hello")])
            .await
            .unwrap_err();
        assert!(err.is_unconfigured());
    }
}
