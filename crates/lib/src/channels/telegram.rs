//! Telegram Bot API adapter: long-polls `getUpdates` (or accepts webhook
//! updates), downloads attached media, and normalizes everything into
//! [`InboundMessage`].

use crate::channels::{ChannelHandle, InboundMessage, MediaRef, Platform};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

const API_BASE: &str = "https://api.telegram.org";
const POLL_TIMEOUT_SECS: u64 = 30;

/// One Telegram update, as delivered by `getUpdates` or a webhook POST.
#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub date: i64,
    pub chat: Chat,
    pub from: Option<User>,
    pub text: Option<String>,
    pub caption: Option<String>,
    pub voice: Option<Voice>,
    pub photo: Option<Vec<PhotoSize>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Voice {
    pub file_id: String,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PhotoSize {
    pub file_id: String,
    pub file_size: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileInfo {
    file_path: Option<String>,
}

/// Bot API client shared by the poller and the handle.
#[derive(Clone)]
struct TelegramApi {
    token: String,
    client: reqwest::Client,
}

impl TelegramApi {
    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", API_BASE, self.token, method)
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<T, String> {
        let res = self
            .client
            .post(self.method_url(method))
            .json(&body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let parsed: ApiResponse<T> = res.json().await.map_err(|e| e.to_string())?;
        if !parsed.ok {
            return Err(parsed
                .description
                .unwrap_or_else(|| format!("{} failed", method)));
        }
        parsed.result.ok_or_else(|| format!("{}: empty result", method))
    }

    /// Resolve a file id and download its bytes.
    async fn download_file(&self, file_id: &str) -> Result<Vec<u8>, String> {
        let info: FileInfo = self
            .call("getFile", json!({ "file_id": file_id }))
            .await?;
        let path = info.file_path.ok_or("getFile returned no path")?;
        let url = format!("{}/file/bot{}/{}", API_BASE, self.token, path);
        let res = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !res.status().is_success() {
            return Err(format!("file download failed: {}", res.status()));
        }
        res.bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| e.to_string())
    }
}

/// Running Telegram adapter for one bot account.
pub struct TelegramHandle {
    account_id: String,
    api: TelegramApi,
    inbound: mpsc::Sender<InboundMessage>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl TelegramHandle {
    /// Build a handle and start the long-poll loop. Webhook deployments can
    /// pass `poll: false` and feed updates through [`TelegramHandle::ingest`].
    pub fn start(
        account_id: impl Into<String>,
        token: impl Into<String>,
        inbound: mpsc::Sender<InboundMessage>,
        poll: bool,
    ) -> Arc<Self> {
        let handle = Arc::new(Self {
            account_id: account_id.into(),
            api: TelegramApi {
                token: token.into(),
                client: reqwest::Client::new(),
            },
            inbound,
            poller: Mutex::new(None),
        });
        if poll {
            let poll_handle = handle.clone();
            let task = tokio::spawn(async move { poll_handle.poll_loop().await });
            // The lock is uncontended here; the poller slot is only written
            // once before the handle escapes.
            if let Ok(mut slot) = handle.poller.try_lock() {
                *slot = Some(task);
            }
        }
        handle
    }

    async fn poll_loop(&self) {
        let mut offset: i64 = 0;
        loop {
            let body = json!({
                "offset": offset,
                "timeout": POLL_TIMEOUT_SECS,
                "allowed_updates": ["message"],
            });
            let updates: Vec<Update> = match self.api.call("getUpdates", body).await {
                Ok(u) => u,
                Err(e) => {
                    log::warn!("{}: getUpdates failed: {}", self.account_id, e);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };
            for update in updates {
                offset = offset.max(update.update_id + 1);
                self.ingest(update).await;
            }
        }
    }

    /// Normalize one update and push it onto the inbound queue. Updates
    /// without a message body worth answering are still forwarded; filtering
    /// is the resolver's job.
    pub async fn ingest(&self, update: Update) {
        let Some(message) = update.message else {
            return;
        };
        let Some(inbound) = self.normalize(message).await else {
            return;
        };
        if self.inbound.send(inbound).await.is_err() {
            log::warn!("{}: inbound queue closed, dropping update", self.account_id);
        }
    }

    async fn normalize(&self, message: Message) -> Option<InboundMessage> {
        let is_outgoing = message.from.as_ref().map_or(false, |u| u.is_bot);
        let mut body = message.text.clone().or_else(|| message.caption.clone());
        if let Some(b) = &body {
            if b.trim().is_empty() {
                body = None;
            }
        }

        let media = if let Some(voice) = &message.voice {
            match self.api.download_file(&voice.file_id).await {
                Ok(bytes) => Some(MediaRef {
                    mime_type: voice
                        .mime_type
                        .clone()
                        .unwrap_or_else(|| "audio/ogg".to_string()),
                    bytes,
                }),
                Err(e) => {
                    log::warn!("{}: voice download failed: {}", self.account_id, e);
                    None
                }
            }
        } else if let Some(photo) = &message.photo {
            // Telegram sends several sizes of the same photo; keep the largest.
            let largest = photo.iter().max_by_key(|p| p.file_size.unwrap_or(0));
            match largest {
                Some(size) => match self.api.download_file(&size.file_id).await {
                    Ok(bytes) => Some(MediaRef {
                        mime_type: "image/jpeg".to_string(),
                        bytes,
                    }),
                    Err(e) => {
                        log::warn!("{}: photo download failed: {}", self.account_id, e);
                        None
                    }
                },
                None => None,
            }
        } else {
            None
        };

        if body.is_none() && media.is_none() && !is_outgoing {
            // Service updates (joins, pins) carry nothing to answer.
            return None;
        }

        Some(InboundMessage {
            platform: Platform::Telegram,
            account_id: self.account_id.clone(),
            conversation_id: message.chat.id.to_string(),
            sender_id: message
                .from
                .as_ref()
                .map(|u| u.id.to_string())
                .unwrap_or_default(),
            message_id: format!("{}:{}", message.chat.id, message.message_id),
            body,
            media,
            is_outgoing,
            has_reply: false,
            received_at: message.date,
        })
    }
}

#[async_trait]
impl ChannelHandle for TelegramHandle {
    fn id(&self) -> &str {
        &self.account_id
    }

    fn platform(&self) -> Platform {
        Platform::Telegram
    }

    async fn send_message(&self, conversation_id: &str, text: &str) -> Result<(), String> {
        let chat_id: i64 = conversation_id
            .parse()
            .map_err(|_| format!("bad chat id {:?}", conversation_id))?;
        let _: Message = self
            .api
            .call("sendMessage", json!({ "chat_id": chat_id, "text": text }))
            .await?;
        Ok(())
    }

    async fn stop(&self) -> Result<(), String> {
        if let Some(task) = self.poller.lock().await.take() {
            task.abort();
        }
        Ok(())
    }
}
