//! External collaborators: the message core that owns packets, the contact store, and the
//! notification surface. This layer only moves opaque bytes between them and the transports.

use serde::{Deserialize, Serialize};

use crate::protocol::TransportKind;

/// Decoded message metadata as reported by the message core (never plaintext bodies
/// beyond what the notification needs).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSummary {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub sender_id: String,
    #[serde(default)]
    pub message_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

impl MessageSummary {
    /// One-line notification text for this message.
    pub fn notification_body(&self) -> String {
        let status = self.status.as_deref().unwrap_or("");
        let text = self.text.as_deref().unwrap_or("");
        match (self.message_type.as_str(), status) {
            ("status", "ok") => "I'm OK".to_string(),
            ("status", "busy") => "All good, busy right now".to_string(),
            ("status", "later") => "Will call later".to_string(),
            ("voice", _) => "Voice message".to_string(),
            ("text", _) if !text.is_empty() => format!("Message: {text}"),
            _ => "New message".to_string(),
        }
    }
}

/// Owner of identities, encryption, the pending-packet queue, and de-duplication.
pub trait MessageCore: Send + Sync {
    /// Up to `limit` pending packets as one opaque batch. Empty means nothing to send.
    fn export_pending_packets(&self, limit: usize) -> Vec<u8>;
    /// Import a packet batch received from `address` over `kind`. Returns packets imported.
    fn import_packets_with_peer(&self, payload: &[u8], kind: TransportKind, address: &str) -> usize;
    /// Legacy import: payload is a plain JSON array of messages. Returns messages imported.
    fn import_messages(&self, json: &[u8]) -> usize;
    /// Most recent decoded messages, newest first.
    fn recent_messages(&self, limit: usize) -> Vec<MessageSummary>;
    /// Pending messages in summary form (legacy delivery marking).
    fn export_pending_messages(&self, limit: usize) -> Vec<MessageSummary>;
    fn mark_delivered(&self, id: &str) -> bool;
}

pub trait ContactStore: Send + Sync {
    fn update_last_checkin(&self, peer_id: &str, timestamp_millis: u64);
}

pub trait NotificationSink: Send + Sync {
    /// `messages` is non-empty; the first one drives the notification text.
    fn show_incoming(&self, messages: &[MessageSummary]);
}
