//! Inbound pipeline: the one path by which received bytes reach the message core.
//! Host-driven: the host passes envelopes; the pipeline calls the collaborators and
//! reports what happened.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tracing::{debug, info};

use crate::collab::{ContactStore, MessageCore, MessageSummary, NotificationSink};
use crate::protocol::{TransportEnvelope, RECENT_MESSAGES_LIMIT};

/// Which importer accepted an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportOutcome {
    /// Packet importer took `n > 0` packets; legacy importer not consulted.
    Packets(usize),
    /// Packet importer took nothing; legacy JSON importer took `n > 0` messages.
    Legacy(usize),
    /// Neither importer accepted anything.
    Nothing,
}

pub struct IncomingPacketPipeline {
    core: Arc<dyn MessageCore>,
    contacts: Arc<dyn ContactStore>,
    notifier: Arc<dyn NotificationSink>,
}

impl IncomingPacketPipeline {
    pub fn new(
        core: Arc<dyn MessageCore>,
        contacts: Arc<dyn ContactStore>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            core,
            contacts,
            notifier,
        }
    }

    pub fn handle(&self, envelope: &TransportEnvelope) -> ImportOutcome {
        self.handle_at(envelope, now_millis())
    }

    /// Same as `handle` with an explicit wall-clock timestamp for contact updates.
    ///
    /// The legacy importer runs only when the packet importer reported zero; the two
    /// never both run for one envelope.
    pub fn handle_at(&self, envelope: &TransportEnvelope, now_millis: u64) -> ImportOutcome {
        let imported = self.core.import_packets_with_peer(
            &envelope.payload,
            envelope.kind,
            &envelope.source,
        );
        if imported > 0 {
            debug!(
                count = imported,
                source = %envelope.source,
                kind = %envelope.kind,
                "imported packets"
            );
            let recent = self.core.recent_messages(RECENT_MESSAGES_LIMIT);
            self.deliver(&recent, now_millis);
            return ImportOutcome::Packets(imported);
        }

        let imported = self.core.import_messages(&envelope.payload);
        if imported == 0 {
            return ImportOutcome::Nothing;
        }
        info!(count = imported, source = %envelope.source, "imported legacy messages");
        let messages = legacy_summaries(&envelope.payload);
        self.deliver(&messages, now_millis);
        ImportOutcome::Legacy(imported)
    }

    fn deliver(&self, messages: &[MessageSummary], now_millis: u64) {
        if messages.is_empty() {
            return;
        }
        for m in messages {
            if !m.sender_id.trim().is_empty() {
                self.contacts.update_last_checkin(&m.sender_id, now_millis);
            }
        }
        self.notifier.show_incoming(messages);
    }
}

/// Read a legacy JSON array element by element. A field of the wrong type reads as its
/// JSON text (or empty when null or missing) instead of failing the whole array.
fn legacy_summaries(json: &[u8]) -> Vec<MessageSummary> {
    let Ok(values) = serde_json::from_slice::<Vec<Value>>(json) else {
        return Vec::new();
    };
    values
        .iter()
        .filter(|v| v.is_object())
        .map(|v| MessageSummary {
            id: field(v, "id"),
            sender_id: field(v, "sender_id"),
            message_type: field(v, "message_type"),
            status: Some(field(v, "status")).filter(|s| !s.is_empty()),
            text: Some(field(v, "text")).filter(|s| !s.is_empty()),
            timestamp: v.get("timestamp").and_then(Value::as_u64),
        })
        .collect()
}

fn field(v: &Value, key: &str) -> String {
    match v.get(key) {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
