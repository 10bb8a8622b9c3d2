//! Unread sweep: a safety net behind the live reply path. On an interval it
//! walks every ready account's unread conversations and answers whatever the
//! live path missed (restarts, messages that arrived while disconnected).

use crate::accounts::AccountRegistry;
use crate::channels::{ChannelHandle, ChannelRegistry};
use crate::gateway::protocol::DashboardEvent;
use crate::resolver::ReplyResolver;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

/// Sweep one account once. Returns the number of replies sent. Messages are
/// resolved sequentially; the dedup set keeps this from racing the live path.
pub async fn sweep_account(
    handle: &Arc<dyn ChannelHandle>,
    resolver: &ReplyResolver,
    events: &broadcast::Sender<String>,
) -> usize {
    let conversations = match handle.unread_conversations().await {
        Ok(c) => c,
        Err(e) => {
            log::debug!("{}: sweep skipped: {}", handle.id(), e);
            return 0;
        }
    };
    let mut sent = 0;
    for conversation in conversations {
        let messages = match handle
            .recent_messages(&conversation.conversation_id, conversation.unread_count)
            .await
        {
            Ok(m) => m,
            Err(e) => {
                log::warn!(
                    "{}: fetching {} failed: {}",
                    handle.id(),
                    conversation.conversation_id,
                    e
                );
                continue;
            }
        };
        for message in messages {
            if message.is_outgoing || message.has_reply {
                continue;
            }
            let Some(reply) = resolver.resolve(&message).await else {
                continue;
            };
            match handle
                .send_message(&message.conversation_id, &reply.text)
                .await
            {
                Ok(()) => {
                    sent += 1;
                    DashboardEvent::Reply {
                        account_id: message.account_id.clone(),
                        conversation_id: message.conversation_id.clone(),
                        body: reply.text.clone(),
                        source: reply.source.as_str().to_string(),
                    }
                    .emit(events);
                }
                Err(e) => {
                    log::warn!("{}: sending sweep reply failed: {}", handle.id(), e);
                }
            }
        }
    }
    sent
}

/// Spawn the periodic sweep over all accounts. Accounts that have not
/// finished their initial sync are skipped until they are ready. Each
/// account sweeps in its own task, so one account's slow platform calls
/// never hold up the others; an account whose previous sweep is still
/// running is skipped for the tick.
pub fn spawn(
    accounts: AccountRegistry,
    channels: ChannelRegistry,
    resolver: ReplyResolver,
    events: broadcast::Sender<String>,
    interval: Duration,
) -> JoinHandle<()> {
    let sweeping: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            for state in accounts.list().await {
                if !state.is_ready() {
                    log::debug!("account {} not ready, sweep skipped", state.id);
                    continue;
                }
                let Some(handle) = channels.get(&state.id).await else {
                    continue;
                };
                if !sweeping.lock().await.insert(state.id.clone()) {
                    log::debug!("account {} still sweeping, tick skipped", state.id);
                    continue;
                }
                let resolver = resolver.clone();
                let events = events.clone();
                let sweeping = sweeping.clone();
                let account_id = state.id.clone();
                tokio::spawn(async move {
                    let sent = sweep_account(&handle, &resolver, &events).await;
                    if sent > 0 {
                        log::info!("account {}: sweep answered {} messages", account_id, sent);
                    }
                    sweeping.lock().await.remove(&account_id);
                });
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{InboundMessage, Platform, UnreadConversation};
    use crate::dedup::AnsweredSet;
    use crate::embedding::Embedder;
    use crate::faq::{FaqIndex, DEFAULT_SIMILARITY_THRESHOLD};
    use crate::language::LanguageService;
    use crate::llm::{ChatBackend, ChatMessage, ProviderError};
    use crate::media::{MediaStore, Transcriber};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    struct ScriptedBackend {
        replies: Mutex<VecDeque<String>>,
    }

    #[async_trait]
    impl ChatBackend for ScriptedBackend {
        async fn complete(&self, _messages: Vec<ChatMessage>) -> Result<String, ProviderError> {
            self.replies
                .lock()
                .await
                .pop_front()
                .ok_or_else(|| ProviderError::Api("script exhausted".to_string()))
        }

        async fn complete_vision(
            &self,
            _caption: &str,
            _image_url: &str,
        ) -> Result<String, ProviderError> {
            Err(ProviderError::Api("no vision in this test".to_string()))
        }
    }

    struct NoEmbedder;

    #[async_trait]
    impl Embedder for NoEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, ProviderError> {
            Err(ProviderError::Api("no embeddings in this test".to_string()))
        }
    }

    struct NoTranscriber;

    #[async_trait]
    impl Transcriber for NoTranscriber {
        async fn transcribe(&self, _audio: &[u8]) -> Result<String, ProviderError> {
            Err(ProviderError::Api("no voice in this test".to_string()))
        }
    }

    struct SweepableHandle {
        messages: Vec<InboundMessage>,
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl ChannelHandle for SweepableHandle {
        fn id(&self) -> &str {
            "acct"
        }

        fn platform(&self) -> Platform {
            Platform::WhatsApp
        }

        async fn send_message(&self, conversation_id: &str, text: &str) -> Result<(), String> {
            self.sent
                .lock()
                .await
                .push((conversation_id.to_string(), text.to_string()));
            Ok(())
        }

        async fn stop(&self) -> Result<(), String> {
            Ok(())
        }

        async fn unread_conversations(&self) -> Result<Vec<UnreadConversation>, String> {
            Ok(vec![UnreadConversation {
                conversation_id: "c1".to_string(),
                unread_count: self.messages.len(),
            }])
        }

        async fn recent_messages(
            &self,
            _conversation_id: &str,
            limit: usize,
        ) -> Result<Vec<InboundMessage>, String> {
            Ok(self.messages.iter().take(limit).cloned().collect())
        }
    }

    fn unread(id: &str, body: &str, has_reply: bool) -> InboundMessage {
        InboundMessage {
            platform: Platform::WhatsApp,
            account_id: "acct".to_string(),
            conversation_id: "c1".to_string(),
            sender_id: "s1".to_string(),
            message_id: id.to_string(),
            body: Some(body.to_string()),
            media: None,
            is_outgoing: false,
            has_reply,
            received_at: 1_700_000_000,
        }
    }

    fn resolver(dir: &std::path::Path, replies: &[&str]) -> ReplyResolver {
        let cache_path = dir.join("faq.json");
        std::fs::write(&cache_path, b"{}").unwrap();
        let backend = Arc::new(ScriptedBackend {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
        });
        ReplyResolver::new(
            Arc::new(AnsweredSet::new()),
            Arc::new(FaqIndex::new(
                "http://127.0.0.1:1/faq.json",
                cache_path,
                DEFAULT_SIMILARITY_THRESHOLD,
                Duration::from_millis(200),
                Arc::new(NoEmbedder),
            )),
            LanguageService::new(backend.clone(), "tr"),
            backend,
            Arc::new(NoTranscriber),
            MediaStore::new(dir.join("media"), "https://media.example.com"),
            "tr",
            None,
        )
    }

    #[tokio::test]
    async fn sweep_answers_only_unanswered_inbound_messages() {
        let dir = tempfile::tempdir().unwrap();
        // Two answerable messages: detect + completion each.
        let resolver = resolver(dir.path(), &["tr", "yanıt bir", "tr", "yanıt iki"]);
        let handle: Arc<dyn ChannelHandle> = Arc::new(SweepableHandle {
            messages: vec![
                unread("m1", "soru bir", false),
                unread("m2", "soru iki", true),
                unread("m3", "soru üç", false),
            ],
            sent: Mutex::new(Vec::new()),
        });
        let (events, mut rx) = broadcast::channel(16);

        let sent = sweep_account(&handle, &resolver, &events).await;
        assert_eq!(sent, 2);
        let event = rx.try_recv().unwrap();
        assert!(event.contains("\"type\":\"reply\""));
        assert!(event.contains("yanıt bir"));
    }

    #[tokio::test]
    async fn a_stalled_account_does_not_block_the_others() {
        use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
        use tokio::sync::Notify;

        struct StuckHandle {
            entered: AtomicBool,
            gate: Notify,
        }

        #[async_trait]
        impl ChannelHandle for StuckHandle {
            fn id(&self) -> &str {
                "stuck"
            }

            fn platform(&self) -> Platform {
                Platform::WhatsApp
            }

            async fn send_message(&self, _c: &str, _t: &str) -> Result<(), String> {
                Ok(())
            }

            async fn stop(&self) -> Result<(), String> {
                Ok(())
            }

            async fn unread_conversations(&self) -> Result<Vec<UnreadConversation>, String> {
                self.entered.store(true, Ordering::SeqCst);
                // Hangs until notified, which never happens here.
                self.gate.notified().await;
                Ok(Vec::new())
            }
        }

        struct FreshHandle {
            served: AtomicUsize,
            sent: Mutex<Vec<String>>,
        }

        #[async_trait]
        impl ChannelHandle for FreshHandle {
            fn id(&self) -> &str {
                "fresh"
            }

            fn platform(&self) -> Platform {
                Platform::WhatsApp
            }

            async fn send_message(&self, _c: &str, text: &str) -> Result<(), String> {
                self.sent.lock().await.push(text.to_string());
                Ok(())
            }

            async fn stop(&self) -> Result<(), String> {
                Ok(())
            }

            async fn unread_conversations(&self) -> Result<Vec<UnreadConversation>, String> {
                Ok(vec![UnreadConversation {
                    conversation_id: "c1".to_string(),
                    unread_count: 1,
                }])
            }

            async fn recent_messages(
                &self,
                _conversation_id: &str,
                _limit: usize,
            ) -> Result<Vec<InboundMessage>, String> {
                // A new unread message every sweep, so two replies require
                // two completed sweep passes.
                let n = self.served.fetch_add(1, Ordering::SeqCst);
                Ok(vec![unread(&format!("m{}", n), "soru", false)])
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let resolver = resolver(dir.path(), &["tr", "yanıt bir", "tr", "yanıt iki"]);
        let accounts = AccountRegistry::new();
        accounts
            .register("stuck", Platform::WhatsApp)
            .await
            .mark_ready();
        accounts
            .register("fresh", Platform::WhatsApp)
            .await
            .mark_ready();
        let channels = ChannelRegistry::new();
        let stuck = Arc::new(StuckHandle {
            entered: AtomicBool::new(false),
            gate: Notify::new(),
        });
        let fresh = Arc::new(FreshHandle {
            served: AtomicUsize::new(1),
            sent: Mutex::new(Vec::new()),
        });
        channels.register(stuck.clone()).await;
        channels.register(fresh.clone()).await;
        let (events, _rx) = broadcast::channel(16);

        let task = spawn(
            accounts,
            channels,
            resolver,
            events,
            Duration::from_millis(20),
        );

        let mut replied = 0;
        for _ in 0..200 {
            replied = fresh.sent.lock().await.len();
            if replied >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        task.abort();
        assert!(
            replied >= 2,
            "fresh account completed {} sweeps while another account stalled",
            replied
        );
        assert!(stuck.entered.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn unsupported_platforms_are_skipped_quietly() {
        struct NoSweepHandle;

        #[async_trait]
        impl ChannelHandle for NoSweepHandle {
            fn id(&self) -> &str {
                "tg"
            }

            fn platform(&self) -> Platform {
                Platform::Telegram
            }

            async fn send_message(&self, _c: &str, _t: &str) -> Result<(), String> {
                Ok(())
            }

            async fn stop(&self) -> Result<(), String> {
                Ok(())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let resolver = resolver(dir.path(), &[]);
        let handle: Arc<dyn ChannelHandle> = Arc::new(NoSweepHandle);
        let (events, _rx) = broadcast::channel(16);
        assert_eq!(sweep_account(&handle, &resolver, &events).await, 0);
    }
}
