//! Events pushed to dashboard WebSocket clients. Fire-and-forget: a slow or
//! absent dashboard never blocks the reply pipeline.

use serde::Serialize;
use tokio::sync::broadcast;

/// One dashboard event, serialized as `{"type": ..., ...}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DashboardEvent {
    /// Pairing QR for an account that needs linking.
    #[serde(rename_all = "camelCase")]
    Qr { account_id: String, data: String },
    /// Contact list snapshot after an account finishes syncing.
    #[serde(rename_all = "camelCase")]
    Contacts {
        account_id: String,
        contacts: Vec<Contact>,
    },
    /// Inbound text message.
    #[serde(rename_all = "camelCase")]
    TextMessage {
        account_id: String,
        conversation_id: String,
        sender_id: String,
        body: String,
        timestamp: i64,
    },
    /// Inbound message carrying media.
    #[serde(rename_all = "camelCase")]
    MediaMessage {
        account_id: String,
        conversation_id: String,
        sender_id: String,
        mime_type: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        timestamp: i64,
    },
    /// Reply the engine sent out.
    #[serde(rename_all = "camelCase")]
    Reply {
        account_id: String,
        conversation_id: String,
        body: String,
        source: String,
    },
    /// Gateway is shutting down.
    Shutdown,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: String,
    pub name: String,
}

impl DashboardEvent {
    /// Serialize and broadcast. Send errors mean no dashboard is connected
    /// and are ignored.
    pub fn emit(&self, events: &broadcast::Sender<String>) {
        match serde_json::to_string(self) {
            Ok(payload) => {
                let _ = events.send(payload);
            }
            Err(e) => log::warn!("serializing dashboard event: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_carry_a_type_tag() {
        let event = DashboardEvent::TextMessage {
            account_id: "acct".to_string(),
            conversation_id: "c1".to_string(),
            sender_id: "s1".to_string(),
            body: "merhaba".to_string(),
            timestamp: 1_700_000_000,
        };
        let v = serde_json::to_value(&event).unwrap();
        assert_eq!(v["type"], "textMessage");
        assert_eq!(v["accountId"], "acct");
        assert_eq!(v["conversationId"], "c1");

        let v = serde_json::to_value(DashboardEvent::Shutdown).unwrap();
        assert_eq!(v["type"], "shutdown");
    }

    #[test]
    fn media_event_omits_missing_url() {
        let event = DashboardEvent::MediaMessage {
            account_id: "acct".to_string(),
            conversation_id: "c1".to_string(),
            sender_id: "s1".to_string(),
            mime_type: "audio/ogg".to_string(),
            url: None,
            timestamp: 0,
        };
        let v = serde_json::to_value(&event).unwrap();
        assert_eq!(v["type"], "mediaMessage");
        assert!(v.get("url").is_none());
    }
}
