//! Chunk manager: split a framed payload into link-sized chunks; reassemble per peer.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::protocol::BLE_CHUNK_SIZE;
use crate::wire::{self, FrameDecodeError, FrameEncodeError};

/// Partial buffers untouched for this long are dropped by `evict_expired`.
pub const DEFAULT_REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Split bytes into fixed-size chunks. A zero chunk size uses the BLE default.
pub fn split_into_chunks(bytes: &[u8], chunk_size: usize) -> Vec<Vec<u8>> {
    let size = if chunk_size == 0 {
        BLE_CHUNK_SIZE
    } else {
        chunk_size
    };
    bytes.chunks(size).map(<[u8]>::to_vec).collect()
}

/// Length-prefix `payload` and split the frame into chunks, ready for sequential delivery.
pub fn frame_into_chunks(
    payload: &[u8],
    chunk_size: usize,
) -> Result<Vec<Vec<u8>>, FrameEncodeError> {
    let framed = wire::encode_frame(payload)?;
    Ok(split_into_chunks(&framed, chunk_size))
}

/// Single in-flight message for one peer address.
struct ReassemblyState {
    expected: usize,
    accumulated: Vec<u8>,
    last_update: Instant,
}

/// Result of feeding one chunk to the reassembler.
#[derive(Debug, PartialEq, Eq)]
pub enum ChunkReceiveResult {
    /// Declared length reached; exactly that many bytes, buffer cleared.
    Complete(Vec<u8>),
    /// Chunk stored; message not complete yet.
    InProgress,
    /// Malformed or undersized chunk with no message in flight; nothing stored.
    Ignored,
}

/// Per-peer reassembly buffers. One message in flight per peer address.
pub struct Reassembler {
    buffers: HashMap<String, ReassemblyState>,
    timeout: Duration,
}

impl Reassembler {
    pub fn new(timeout: Duration) -> Self {
        Self {
            buffers: HashMap::new(),
            timeout,
        }
    }

    /// Feed one chunk received from `peer`.
    pub fn on_chunk(&mut self, peer: &str, chunk: &[u8]) -> ChunkReceiveResult {
        self.on_chunk_at(peer, chunk, Instant::now())
    }

    /// Same as `on_chunk` with an explicit clock.
    ///
    /// With no message in flight the chunk must start with the 4-byte length prefix;
    /// otherwise the whole chunk continues the current message, even if it looks like a
    /// new header (there is no cancellation signal on the wire).
    pub fn on_chunk_at(&mut self, peer: &str, chunk: &[u8], now: Instant) -> ChunkReceiveResult {
        if let Some(state) = self.buffers.get_mut(peer) {
            if chunk.is_empty() {
                return ChunkReceiveResult::InProgress;
            }
            state.accumulated.extend_from_slice(chunk);
            state.last_update = now;
        } else {
            let expected = match wire::decode_length(chunk) {
                Ok(n) => n,
                Err(FrameDecodeError::NeedMore) => {
                    debug!(peer, len = chunk.len(), "undersized first chunk ignored");
                    return ChunkReceiveResult::Ignored;
                }
                Err(e) => {
                    debug!(peer, error = %e, "malformed first chunk ignored");
                    return ChunkReceiveResult::Ignored;
                }
            };
            self.buffers.insert(
                peer.to_owned(),
                ReassemblyState {
                    expected,
                    accumulated: chunk[wire::LEN_SIZE..].to_vec(),
                    last_update: now,
                },
            );
        }
        let complete = self
            .buffers
            .get(peer)
            .is_some_and(|s| s.accumulated.len() >= s.expected);
        if !complete {
            return ChunkReceiveResult::InProgress;
        }
        match self.buffers.remove(peer) {
            Some(state) => {
                let mut bytes = state.accumulated;
                bytes.truncate(state.expected);
                ChunkReceiveResult::Complete(bytes)
            }
            None => ChunkReceiveResult::InProgress,
        }
    }

    /// Drop the partial buffer for `peer` (e.g. link lost). Returns true if one existed.
    pub fn discard(&mut self, peer: &str) -> bool {
        self.buffers.remove(peer).is_some()
    }

    /// Drop buffers that have not grown within the timeout. Returns the number dropped.
    pub fn evict_expired(&mut self, now: Instant) -> usize {
        let before = self.buffers.len();
        let timeout = self.timeout;
        self.buffers
            .retain(|_, s| now.saturating_duration_since(s.last_update) < timeout);
        before - self.buffers.len()
    }

    pub fn is_pending(&self, peer: &str) -> bool {
        self.buffers.contains_key(peer)
    }

    pub fn pending_count(&self) -> usize {
        self.buffers.len()
    }

    /// Reassembly timeout in use.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(DEFAULT_REASSEMBLY_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn feed_all(r: &mut Reassembler, peer: &str, chunks: &[Vec<u8>]) -> Option<Vec<u8>> {
        let mut out = None;
        for (i, c) in chunks.iter().enumerate() {
            match r.on_chunk(peer, c) {
                ChunkReceiveResult::Complete(bytes) => {
                    assert_eq!(i, chunks.len() - 1, "completed before last chunk");
                    out = Some(bytes);
                }
                ChunkReceiveResult::InProgress => {}
                ChunkReceiveResult::Ignored => panic!("chunk {i} ignored"),
            }
        }
        out
    }

    #[test]
    fn split_chunks() {
        let chunks = split_into_chunks(&[0u8; 100], 30);
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0].len(), 30);
        assert_eq!(chunks[3].len(), 10);
    }

    #[test]
    fn split_zero_length() {
        assert!(split_into_chunks(&[], 30).is_empty());
    }

    #[test]
    fn split_zero_chunk_size_uses_default() {
        let chunks = split_into_chunks(&[0u8; BLE_CHUNK_SIZE * 2], 0);
        assert_eq!(chunks.len(), 2);
    }

    #[test]
    fn framed_chunk_count_matches_length() {
        for len in [0usize, 1, 175, 176, 177, 356, 357, 1000] {
            let chunks = frame_into_chunks(&vec![1u8; len], BLE_CHUNK_SIZE).unwrap();
            assert_eq!(chunks.len(), (len + 4).div_ceil(BLE_CHUNK_SIZE), "len {len}");
        }
    }

    #[test]
    fn reassemble_random_payloads() {
        let mut rng = rand::thread_rng();
        let mut r = Reassembler::default();
        for _ in 0..20 {
            let len = rng.gen_range(0..2000);
            let payload: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            let chunks = frame_into_chunks(&payload, BLE_CHUNK_SIZE).unwrap();
            let out = feed_all(&mut r, "AA:BB", &chunks).expect("complete");
            assert_eq!(out, payload);
            assert!(!r.is_pending("AA:BB"));
        }
    }

    #[test]
    fn interleaved_peers_do_not_mix() {
        let a: Vec<u8> = (0..500u32).map(|i| i as u8).collect();
        let b: Vec<u8> = (0..700u32).map(|i| (i * 7) as u8).collect();
        let ca = frame_into_chunks(&a, BLE_CHUNK_SIZE).unwrap();
        let cb = frame_into_chunks(&b, BLE_CHUNK_SIZE).unwrap();
        let mut r = Reassembler::default();
        let mut got_a = None;
        let mut got_b = None;
        for i in 0..ca.len().max(cb.len()) {
            if let Some(c) = ca.get(i) {
                if let ChunkReceiveResult::Complete(bytes) = r.on_chunk("peer-a", c) {
                    got_a = Some(bytes);
                }
            }
            if let Some(c) = cb.get(i) {
                if let ChunkReceiveResult::Complete(bytes) = r.on_chunk("peer-b", c) {
                    got_b = Some(bytes);
                }
            }
        }
        assert_eq!(got_a.unwrap(), a);
        assert_eq!(got_b.unwrap(), b);
        assert_eq!(r.pending_count(), 0);
    }

    #[test]
    fn surplus_bytes_are_trimmed() {
        let mut r = Reassembler::default();
        let mut chunk = 3u32.to_be_bytes().to_vec();
        chunk.extend_from_slice(b"abcdef");
        assert_eq!(
            r.on_chunk("p", &chunk),
            ChunkReceiveResult::Complete(b"abc".to_vec())
        );
        assert!(!r.is_pending("p"));
    }

    #[test]
    fn undersized_first_chunk_ignored() {
        let mut r = Reassembler::default();
        assert_eq!(r.on_chunk("p", &[0, 0, 1]), ChunkReceiveResult::Ignored);
        assert_eq!(r.on_chunk("p", &[]), ChunkReceiveResult::Ignored);
        assert!(!r.is_pending("p"));
    }

    #[test]
    fn oversized_declared_length_ignored() {
        let mut r = Reassembler::default();
        let chunk = u32::MAX.to_be_bytes();
        assert_eq!(r.on_chunk("p", &chunk), ChunkReceiveResult::Ignored);
        assert!(!r.is_pending("p"));
    }

    #[test]
    fn new_header_continues_unfinished_message() {
        let mut r = Reassembler::default();
        let mut first = 8u32.to_be_bytes().to_vec();
        first.extend_from_slice(b"abc");
        assert_eq!(r.on_chunk("p", &first), ChunkReceiveResult::InProgress);
        // Looks like a fresh header but is consumed as body.
        let second = 2u32.to_be_bytes().to_vec();
        assert_eq!(r.on_chunk("p", &second), ChunkReceiveResult::InProgress);
        assert_eq!(
            r.on_chunk("p", b"z"),
            ChunkReceiveResult::Complete(vec![b'a', b'b', b'c', 0, 0, 0, 2, b'z'])
        );
    }

    #[test]
    fn discard_drops_partial_state() {
        let mut r = Reassembler::default();
        let chunks = frame_into_chunks(&[9u8; 400], BLE_CHUNK_SIZE).unwrap();
        r.on_chunk("p", &chunks[0]);
        assert!(r.is_pending("p"));
        assert!(r.discard("p"));
        assert!(!r.discard("p"));
        // A fresh message starts cleanly afterwards.
        assert_eq!(feed_all(&mut r, "p", &chunks).unwrap(), vec![9u8; 400]);
    }

    #[test]
    fn stale_buffers_evicted() {
        let mut r = Reassembler::new(Duration::from_secs(30));
        let start = Instant::now();
        let chunks = frame_into_chunks(&[1u8; 400], BLE_CHUNK_SIZE).unwrap();
        r.on_chunk_at("old", &chunks[0], start);
        r.on_chunk_at("fresh", &chunks[0], start + Duration::from_secs(20));
        assert_eq!(r.evict_expired(start + Duration::from_secs(29)), 0);
        assert_eq!(r.evict_expired(start + Duration::from_secs(31)), 1);
        assert!(!r.is_pending("old"));
        assert!(r.is_pending("fresh"));
    }
}
