//! Messaging channel adapters and the shared inbound message shape.
//!
//! Every adapter normalizes its platform's updates into [`InboundMessage`]
//! and pushes them onto the gateway's inbound queue. Outbound replies go
//! through the adapter's [`ChannelHandle`].

mod registry;
pub mod telegram;

pub use registry::ChannelRegistry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Messaging platform a message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    WhatsApp,
    Telegram,
    Instagram,
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Platform::WhatsApp => write!(f, "whatsapp"),
            Platform::Telegram => write!(f, "telegram"),
            Platform::Instagram => write!(f, "instagram"),
        }
    }
}

/// Media payload attached to a message, already downloaded by the adapter.
#[derive(Debug, Clone)]
pub struct MediaRef {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl MediaRef {
    pub fn is_voice(&self) -> bool {
        self.mime_type.starts_with("audio/")
    }

    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }
}

/// Platform-agnostic inbound message, as normalized by a channel adapter.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub platform: Platform,
    /// Account the message arrived on.
    pub account_id: String,
    /// Conversation (chat) the reply must go back to.
    pub conversation_id: String,
    pub sender_id: String,
    /// Platform-unique message id; the dedup key.
    pub message_id: String,
    pub body: Option<String>,
    pub media: Option<MediaRef>,
    /// Sent by the account itself; never answered.
    pub is_outgoing: bool,
    /// The account already replied in-thread (sweep skips these).
    pub has_reply: bool,
    /// Unix seconds.
    pub received_at: i64,
}

/// Conversation with messages the account has not read yet.
#[derive(Debug, Clone)]
pub struct UnreadConversation {
    pub conversation_id: String,
    pub unread_count: usize,
}

/// Handle to a running channel adapter.
///
/// The unread-sweep methods have defaults that report the capability as
/// unsupported; adapters whose platform cannot enumerate unread state keep
/// the defaults and the sweep skips them.
#[async_trait]
pub trait ChannelHandle: Send + Sync {
    /// Stable id of the account this handle serves.
    fn id(&self) -> &str;

    fn platform(&self) -> Platform;

    async fn send_message(&self, conversation_id: &str, text: &str) -> Result<(), String>;

    async fn stop(&self) -> Result<(), String>;

    async fn unread_conversations(&self) -> Result<Vec<UnreadConversation>, String> {
        Err(format!("{}: unread listing not supported", self.id()))
    }

    async fn recent_messages(
        &self,
        _conversation_id: &str,
        _limit: usize,
    ) -> Result<Vec<InboundMessage>, String> {
        Err(format!("{}: message history not supported", self.id()))
    }
}
