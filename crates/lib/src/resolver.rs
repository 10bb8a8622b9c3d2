//! Reply resolution: one inbound message in, at most one reply out.
//!
//! Order of precedence: dedup and direction checks, media normalization
//! (voice → transcript, image → public URL), language pivot, semantic FAQ
//! lookup, then the generative fallbacks. Every failure mode resolves to
//! silence, never to an error surfaced at the conversation.

use crate::channels::InboundMessage;
use crate::dedup::AnsweredSet;
use crate::faq::FaqIndex;
use crate::language::LanguageService;
use crate::llm::{ChatBackend, ChatMessage};
use crate::media::{MediaStore, Transcriber};
use std::sync::Arc;

/// Default persona for the generative fallback.
pub const DEFAULT_ASSISTANT_PROMPT: &str = "Sen deneyimli bir satış asistanısın. \
    Müşterilere kibar, kısa ve net yanıtlar ver. Emin olmadığın konularda \
    müşteriyi mağaza ekibiyle iletişime geçmeye yönlendir ve yanıtını gelen \
    mesajın dilinde yaz.";

/// Where a reply came from. Reported on dashboard events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplySource {
    Faq,
    Vision,
    Generative,
}

impl ReplySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplySource::Faq => "faq",
            ReplySource::Vision => "vision",
            ReplySource::Generative => "generative",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedReply {
    pub text: String,
    pub source: ReplySource,
}

/// The reply pipeline. Cheap to clone; all parts are shared.
#[derive(Clone)]
pub struct ReplyResolver {
    answered: Arc<AnsweredSet>,
    faq: Arc<FaqIndex>,
    language: LanguageService,
    chat: Arc<dyn ChatBackend>,
    transcriber: Arc<dyn Transcriber>,
    media: MediaStore,
    /// Language the FAQ store is written in (ISO 639-1).
    pivot_language: String,
    assistant_prompt: String,
}

impl ReplyResolver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        answered: Arc<AnsweredSet>,
        faq: Arc<FaqIndex>,
        language: LanguageService,
        chat: Arc<dyn ChatBackend>,
        transcriber: Arc<dyn Transcriber>,
        media: MediaStore,
        pivot_language: impl Into<String>,
        assistant_prompt: Option<String>,
    ) -> Self {
        Self {
            answered,
            faq,
            language,
            chat,
            transcriber,
            media,
            pivot_language: pivot_language.into(),
            assistant_prompt: assistant_prompt
                .unwrap_or_else(|| DEFAULT_ASSISTANT_PROMPT.to_string()),
        }
    }

    /// The FAQ index behind this resolver, for startup warming.
    pub fn faq(&self) -> &Arc<FaqIndex> {
        &self.faq
    }

    /// Resolve a reply for one inbound message. `None` means stay silent:
    /// the message was outgoing, already answered, empty, or a provider
    /// failed. Claims that produced no reply are released so the unread
    /// sweep can retry transient failures.
    pub async fn resolve(&self, msg: &InboundMessage) -> Option<ResolvedReply> {
        if msg.is_outgoing || msg.has_reply {
            return None;
        }
        if !self.answered.claim(&msg.message_id).await {
            log::debug!("message {} already answered", msg.message_id);
            return None;
        }

        match self.resolve_claimed(msg).await {
            Some(reply) => Some(reply),
            None => {
                self.answered.release(&msg.message_id).await;
                None
            }
        }
    }

    async fn resolve_claimed(&self, msg: &InboundMessage) -> Option<ResolvedReply> {
        let mut text = msg.body.clone().filter(|b| !b.trim().is_empty());
        let mut image_url = None;

        if let Some(media) = &msg.media {
            if media.is_voice() {
                match self.transcriber.transcribe(&media.bytes).await {
                    Ok(transcript) if !transcript.trim().is_empty() => {
                        log::debug!("message {} transcribed", msg.message_id);
                        text = Some(transcript);
                    }
                    Ok(_) => {
                        log::warn!("message {}: empty transcript, dropping", msg.message_id);
                        return None;
                    }
                    Err(e) => {
                        log::warn!("message {}: transcription failed: {}", msg.message_id, e);
                        return None;
                    }
                }
            } else if media.is_image() {
                image_url = self
                    .media
                    .persist_image(&media.bytes, &media.mime_type, &msg.message_id, msg.received_at)
                    .await;
            }
        }

        if text.is_none() && image_url.is_none() {
            return None;
        }

        if let Err(e) = self.faq.refresh_if_stale().await {
            log::warn!("faq refresh failed, continuing without it: {}", e);
        }

        // Everything downstream works in the pivot language: the FAQ store,
        // the vision caption, and the generative prompt. FAQ answers are
        // translated back into the sender's language.
        let mut pivot_text: Option<String> = None;
        if let Some(text) = &text {
            let detected = self.language.detect_language(text).await;
            let translated = if detected == self.pivot_language {
                text.clone()
            } else {
                self.language.translate(text, &self.pivot_language).await
            };
            match self.faq.best_match(&translated).await {
                Ok(Some((entry, score))) => {
                    log::info!(
                        "message {}: faq hit {:.3} on {:?}",
                        msg.message_id,
                        score,
                        entry.question
                    );
                    let answer = if detected == self.pivot_language {
                        entry.answer
                    } else {
                        self.language.translate(&entry.answer, &detected).await
                    };
                    return Some(ResolvedReply {
                        text: answer,
                        source: ReplySource::Faq,
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    log::warn!("message {}: faq lookup failed: {}", msg.message_id, e);
                }
            }
            pivot_text = Some(translated);
        }

        if let Some(url) = image_url {
            let caption = pivot_text.as_deref().unwrap_or("");
            return match self.chat.complete_vision(caption, &url).await {
                Ok(reply) if !reply.trim().is_empty() => Some(ResolvedReply {
                    text: reply,
                    source: ReplySource::Vision,
                }),
                Ok(_) => None,
                Err(e) => {
                    log::warn!("message {}: vision call failed: {}", msg.message_id, e);
                    None
                }
            };
        }

        let messages = vec![
            ChatMessage::system(self.assistant_prompt.clone()),
            ChatMessage::user(pivot_text.unwrap_or_default()),
        ];
        match self.chat.complete(messages).await {
            Ok(reply) if !reply.trim().is_empty() => Some(ResolvedReply {
                text: reply,
                source: ReplySource::Generative,
            }),
            Ok(_) => {
                log::warn!("message {}: empty completion, dropping", msg.message_id);
                None
            }
            Err(e) => {
                log::warn!("message {}: completion failed: {}", msg.message_id, e);
                None
            }
        }
    }
}
