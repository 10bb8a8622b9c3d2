//! Language detection and translation over the chat backend.
//!
//! Both operations are best-effort: detection falls back to the configured
//! default language, translation falls back to the original text. Neither
//! surfaces an error to the reply pipeline.

use crate::llm::{ChatBackend, ChatMessage, ProviderError};
use std::sync::Arc;

/// Detects message language and translates between languages using the chat
/// backend. Stateless apart from its configuration.
#[derive(Clone)]
pub struct LanguageService {
    backend: Arc<dyn ChatBackend>,
    /// Fallback when detection fails (ISO 639-1).
    default_language: String,
}

impl LanguageService {
    pub fn new(backend: Arc<dyn ChatBackend>, default_language: impl Into<String>) -> Self {
        Self {
            backend,
            default_language: default_language.into(),
        }
    }

    /// ISO 639-1 code of `text`'s language. Any failure, or an implausible
    /// reply from the model, falls back to the configured default.
    pub async fn detect_language(&self, text: &str) -> String {
        let messages = vec![
            ChatMessage::system(
                "Detect the language of the user message. \
                 Reply with only the ISO 639-1 language code, nothing else.",
            ),
            ChatMessage::user(text),
        ];
        match self.backend.complete(messages).await {
            Ok(code) => {
                let code = code.trim().to_lowercase();
                // Models occasionally reply with prose; accept codes only.
                if (2..=3).contains(&code.len()) && code.chars().all(|c| c.is_ascii_alphabetic()) {
                    code
                } else {
                    log::warn!("implausible language code {:?}, using default", code);
                    self.default_language.clone()
                }
            }
            Err(e) => {
                self.log_failure("language detection", &e);
                self.default_language.clone()
            }
        }
    }

    /// Translate `text` into `target` (ISO 639-1). Empty input and failures
    /// return the input unchanged; this never errors.
    pub async fn translate(&self, text: &str, target: &str) -> String {
        if text.trim().is_empty() {
            return text.to_string();
        }
        let messages = vec![
            ChatMessage::system(format!(
                "Translate the user message into the language with ISO 639-1 \
                 code {:?}. Reply with only the translation.",
                target
            )),
            ChatMessage::user(text),
        ];
        match self.backend.complete(messages).await {
            Ok(translated) if !translated.trim().is_empty() => translated,
            Ok(_) => {
                log::warn!("empty translation result, keeping original text");
                text.to_string()
            }
            Err(e) => {
                self.log_failure("translation", &e);
                text.to_string()
            }
        }
    }

    fn log_failure(&self, what: &str, err: &ProviderError) {
        if err.is_unconfigured() {
            log::debug!("{} skipped: {}", what, err);
        } else {
            log::warn!("{} failed: {}", what, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// Backend returning a canned reply, or a canned error.
    struct CannedBackend {
        reply: Result<String, ()>,
    }

    #[async_trait]
    impl ChatBackend for CannedBackend {
        async fn complete(&self, _messages: Vec<ChatMessage>) -> Result<String, ProviderError> {
            self.reply
                .clone()
                .map_err(|_| ProviderError::Api("boom".to_string()))
        }

        async fn complete_vision(
            &self,
            _caption: &str,
            _image_url: &str,
        ) -> Result<String, ProviderError> {
            unreachable!("language service never issues vision calls")
        }
    }

    fn service(reply: Result<&str, ()>) -> LanguageService {
        LanguageService::new(
            Arc::new(CannedBackend {
                reply: reply.map(str::to_string),
            }),
            "tr",
        )
    }

    #[tokio::test]
    async fn detection_normalizes_the_code() {
        assert_eq!(service(Ok(" EN ")).detect_language("hello").await, "en");
    }

    #[tokio::test]
    async fn detection_falls_back_on_error_and_on_prose() {
        assert_eq!(service(Err(())).detect_language("hello").await, "tr");
        assert_eq!(
            service(Ok("This text is written in English."))
                .detect_language("hello")
                .await,
            "tr"
        );
    }

    #[tokio::test]
    async fn translation_failure_keeps_original_text() {
        assert_eq!(service(Err(())).translate("merhaba", "en").await, "merhaba");
    }

    #[tokio::test]
    async fn empty_input_is_not_sent_for_translation() {
        // CannedBackend would reply "x"; the early return must win.
        assert_eq!(service(Ok("x")).translate("   ", "en").await, "   ");
    }
}
