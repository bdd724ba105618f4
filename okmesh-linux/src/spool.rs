//! Spool-directory collaborators for the daemon: a file-backed message core, a JSON contact
//! map, and a logging notification sink.
//!
//! Layout under the spool dir:
//! - `outbox/<name>.pkt`: one opaque packet per file, pending until marked delivered.
//! - `inbox/<sha256>.pkt`: received packets, content-addressed so re-imports are no-ops.
//! - `contacts.json`: sender id to last check-in (ms since epoch).
//!
//! A packet batch on the wire is a JSON array of hex-encoded packets.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use okmesh_core::{ContactStore, MessageCore, MessageSummary, NotificationSink, TransportKind};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

const RECENT_CAPACITY: usize = 100;

pub fn encode_batch(packets: &[Vec<u8>]) -> Vec<u8> {
    let hexed: Vec<String> = packets.iter().map(hex::encode).collect();
    serde_json::to_vec(&hexed).unwrap_or_default()
}

/// `None` if the bytes are not a batch.
pub fn decode_batch(bytes: &[u8]) -> Option<Vec<Vec<u8>>> {
    let hexed: Vec<String> = serde_json::from_slice(bytes).ok()?;
    hexed.iter().map(|h| hex::decode(h).ok()).collect()
}

fn content_name(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub struct SpoolCore {
    outbox: PathBuf,
    inbox: PathBuf,
    recent: Mutex<VecDeque<MessageSummary>>,
}

impl SpoolCore {
    pub fn open(dir: &Path) -> io::Result<Self> {
        let outbox = dir.join("outbox");
        let inbox = dir.join("inbox");
        fs::create_dir_all(&outbox)?;
        fs::create_dir_all(&inbox)?;
        Ok(Self {
            outbox,
            inbox,
            recent: Mutex::new(VecDeque::new()),
        })
    }

    /// Queue a packet for sending. Returns its id.
    pub fn enqueue(&self, packet: &[u8]) -> io::Result<String> {
        let id = content_name(packet);
        fs::write(self.outbox.join(format!("{id}.pkt")), packet)?;
        Ok(id)
    }

    /// Pending outbox entries, oldest name first.
    fn pending(&self, limit: usize) -> Vec<(String, PathBuf)> {
        let entries = match fs::read_dir(&self.outbox) {
            Ok(e) => e,
            Err(e) => {
                warn!(dir = %self.outbox.display(), error = %e, "outbox unreadable");
                return Vec::new();
            }
        };
        let mut out: Vec<(String, PathBuf)> = entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|x| x == "pkt"))
            .filter_map(|p| {
                let stem = p.file_stem()?.to_str()?.to_string();
                Some((stem, p))
            })
            .collect();
        out.sort();
        out.truncate(limit);
        out
    }

    /// Store `bytes` in the inbox unless already present. True if new.
    fn store(&self, bytes: &[u8], ext: &str) -> bool {
        let path = self.inbox.join(format!("{}.{ext}", content_name(bytes)));
        if path.exists() {
            return false;
        }
        match fs::write(&path, bytes) {
            Ok(()) => true,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "inbox write failed");
                false
            }
        }
    }

    fn remember(&self, summary: MessageSummary) {
        let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        recent.push_front(summary);
        recent.truncate(RECENT_CAPACITY);
    }
}

impl MessageCore for SpoolCore {
    fn export_pending_packets(&self, limit: usize) -> Vec<u8> {
        let packets: Vec<Vec<u8>> = self
            .pending(limit)
            .into_iter()
            .filter_map(|(_, path)| fs::read(path).ok())
            .collect();
        if packets.is_empty() {
            return Vec::new();
        }
        encode_batch(&packets)
    }

    fn import_packets_with_peer(
        &self,
        payload: &[u8],
        kind: TransportKind,
        address: &str,
    ) -> usize {
        let Some(packets) = decode_batch(payload) else {
            return 0;
        };
        let mut imported = 0;
        for packet in packets {
            if !self.store(&packet, "pkt") {
                continue;
            }
            imported += 1;
            // Packets are opaque here; a JSON summary inside is surfaced when present.
            let summary = serde_json::from_slice::<MessageSummary>(&packet).unwrap_or_else(|_| {
                MessageSummary {
                    id: content_name(&packet),
                    message_type: "packet".to_string(),
                    ..Default::default()
                }
            });
            self.remember(summary);
        }
        if imported > 0 {
            debug!(imported, %kind, %address, "packets spooled");
        }
        imported
    }

    fn import_messages(&self, json: &[u8]) -> usize {
        let Ok(messages) = serde_json::from_slice::<Vec<MessageSummary>>(json) else {
            return 0;
        };
        let mut imported = 0;
        for message in messages {
            let Ok(bytes) = serde_json::to_vec(&message) else { continue };
            if self.store(&bytes, "json") {
                imported += 1;
                self.remember(message);
            }
        }
        imported
    }

    fn recent_messages(&self, limit: usize) -> Vec<MessageSummary> {
        let recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        recent.iter().take(limit).cloned().collect()
    }

    fn export_pending_messages(&self, limit: usize) -> Vec<MessageSummary> {
        self.pending(limit)
            .into_iter()
            .map(|(id, _)| MessageSummary {
                id,
                message_type: "packet".to_string(),
                ..Default::default()
            })
            .collect()
    }

    fn mark_delivered(&self, id: &str) -> bool {
        if id.is_empty() || id.contains(|c: char| c == '/' || c == '\\') || id.starts_with('.') {
            return false;
        }
        fs::remove_file(self.outbox.join(format!("{id}.pkt"))).is_ok()
    }
}

/// Contact last-seen map persisted as `contacts.json`.
pub struct SpoolContacts {
    path: PathBuf,
    seen: Mutex<HashMap<String, u64>>,
}

impl SpoolContacts {
    pub fn open(dir: &Path) -> io::Result<Self> {
        let path = dir.join("contacts.json");
        let seen = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "contacts file unreadable; starting empty"
                );
                HashMap::new()
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e),
        };
        Ok(Self {
            path,
            seen: Mutex::new(seen),
        })
    }

    pub fn last_checkin(&self, peer_id: &str) -> Option<u64> {
        self.seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(peer_id)
            .copied()
    }
}

impl ContactStore for SpoolContacts {
    fn update_last_checkin(&self, peer_id: &str, timestamp_millis: u64) {
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        seen.insert(peer_id.to_string(), timestamp_millis);
        let written = serde_json::to_vec_pretty(&*seen)
            .map_err(io::Error::from)
            .and_then(|bytes| fs::write(&self.path, bytes));
        if let Err(e) = written {
            warn!(path = %self.path.display(), error = %e, "contacts write failed");
        }
    }
}

/// Notifications go to the log.
pub struct LogNotifier;

impl NotificationSink for LogNotifier {
    fn show_incoming(&self, messages: &[MessageSummary]) {
        let Some(first) = messages.first() else { return };
        info!(
            count = messages.len(),
            from = %first.sender_id,
            body = %first.notification_body(),
            "incoming check-in"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbox_exports_until_marked() {
        let dir = tempfile::tempdir().unwrap();
        let core = SpoolCore::open(dir.path()).unwrap();
        assert!(core.export_pending_packets(50).is_empty());

        let a = core.enqueue(b"packet-a").unwrap();
        core.enqueue(b"packet-b").unwrap();
        assert_eq!(decode_batch(&core.export_pending_packets(1)).unwrap().len(), 1);
        let all = decode_batch(&core.export_pending_packets(50)).unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.contains(&b"packet-a".to_vec()));

        // Still pending on the next tick.
        assert_eq!(decode_batch(&core.export_pending_packets(50)).unwrap().len(), 2);
        assert!(core.mark_delivered(&a));
        assert!(!core.mark_delivered(&a));
        assert!(!core.mark_delivered("../escape"));
        assert_eq!(core.export_pending_messages(50).len(), 1);
    }

    #[test]
    fn duplicate_batches_import_once() {
        let dir = tempfile::tempdir().unwrap();
        let core = SpoolCore::open(dir.path()).unwrap();
        let status = br#"{"id":"s1","sender_id":"alice","message_type":"status","status":"ok"}"#;
        let batch = encode_batch(&[b"opaque".to_vec(), status.to_vec()]);

        assert_eq!(core.import_packets_with_peer(&batch, TransportKind::Udp, "10.0.0.2:45678"), 2);
        assert_eq!(core.import_packets_with_peer(&batch, TransportKind::Ble, "AA:BB"), 0);

        let recent = core.recent_messages(20);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].sender_id, "alice");
        assert_eq!(recent[1].message_type, "packet");
        assert_eq!(core.recent_messages(1).len(), 1);
    }

    #[test]
    fn non_batch_payload_imports_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let core = SpoolCore::open(dir.path()).unwrap();
        assert_eq!(core.import_packets_with_peer(b"\x00\x01", TransportKind::Udp, "x"), 0);
        assert_eq!(core.import_packets_with_peer(br#"["zz"]"#, TransportKind::Udp, "x"), 0);
        assert_eq!(core.import_messages(b"not json"), 0);
    }

    #[test]
    fn legacy_json_messages_import() {
        let dir = tempfile::tempdir().unwrap();
        let core = SpoolCore::open(dir.path()).unwrap();
        let json = br#"[{"id":"1","sender_id":"bob","message_type":"text","text":"hi"}]"#;
        assert_eq!(core.import_messages(json), 1);
        assert_eq!(core.import_messages(json), 0);
        assert_eq!(core.recent_messages(20)[0].notification_body(), "Message: hi");
    }

    #[test]
    fn contacts_persist_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let contacts = SpoolContacts::open(dir.path()).unwrap();
        contacts.update_last_checkin("alice", 1_700_000_000_000);
        contacts.update_last_checkin("alice", 1_700_000_000_500);
        let reopened = SpoolContacts::open(dir.path()).unwrap();
        assert_eq!(reopened.last_checkin("alice"), Some(1_700_000_000_500));
        assert_eq!(reopened.last_checkin("bob"), None);
    }
}
