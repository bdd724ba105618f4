//! Relay gatekeeping: address pinning, inbound rate limiting, trailing Ed25519 signatures.

use std::collections::HashSet;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use tracing::debug;

use crate::protocol::RELAY_PORT;

/// Default cap on relay datagrams accepted per window.
pub const DEFAULT_MAX_PACKETS_PER_WINDOW: u32 = 100;
/// Length of the rate-limit window.
pub const RATE_WINDOW: Duration = Duration::from_secs(1);
/// Length of a trailing relay signature.
pub const SIGNATURE_LEN: usize = 64;

/// Sliding counter over relay traffic.
#[derive(Debug, Clone, Copy)]
struct RateWindow {
    window_start: Instant,
    count: u32,
}

/// Decides whether relay endpoints and relay datagrams are acceptable.
pub struct RelaySecurityManager {
    relay_port: u16,
    pinned: HashSet<IpAddr>,
    max_per_window: u32,
    window: Option<RateWindow>,
    relay_key: Option<VerifyingKey>,
}

impl RelaySecurityManager {
    pub fn new(relay_port: u16) -> Self {
        Self {
            relay_port,
            pinned: HashSet::new(),
            max_per_window: DEFAULT_MAX_PACKETS_PER_WINDOW,
            window: None,
            relay_key: None,
        }
    }

    /// Only accept relay addresses in `pinned`. An empty set disables pinning.
    pub fn with_pinned<I: IntoIterator<Item = IpAddr>>(mut self, pinned: I) -> Self {
        self.pinned = pinned.into_iter().collect();
        self
    }

    pub fn with_rate_limit(mut self, max_per_window: u32) -> Self {
        self.max_per_window = max_per_window;
        self
    }

    /// Require a valid trailing signature by `key` on relay datagrams longer than 64 bytes.
    pub fn with_relay_key(mut self, key: VerifyingKey) -> Self {
        self.relay_key = Some(key);
        self
    }

    pub fn relay_port(&self) -> u16 {
        self.relay_port
    }

    /// True when pinning is off, or `addr` is one of the pinned addresses.
    pub fn validate_relay_address(&self, addr: IpAddr) -> bool {
        if self.pinned.is_empty() {
            return true;
        }
        let ok = self.pinned.contains(&addr);
        if !ok {
            debug!(%addr, "relay address not pinned");
        }
        ok
    }

    /// Gate one inbound relay datagram: wrong source port or rate cap exceeded means reject.
    pub fn validate_incoming_packet(&mut self, source_port: u16, data: &[u8]) -> bool {
        self.validate_incoming_packet_at(source_port, data, Instant::now())
    }

    /// Same as `validate_incoming_packet` with an explicit clock.
    pub fn validate_incoming_packet_at(
        &mut self,
        source_port: u16,
        data: &[u8],
        now: Instant,
    ) -> bool {
        if source_port != self.relay_port {
            return false;
        }
        let within = self
            .window
            .is_some_and(|w| now.saturating_duration_since(w.window_start) <= RATE_WINDOW);
        if !within {
            self.window = Some(RateWindow {
                window_start: now,
                count: 1,
            });
            return true;
        }
        let max = self.max_per_window;
        if let Some(w) = self.window.as_mut() {
            w.count = w.count.saturating_add(1);
            if w.count > max {
                debug!(count = w.count, len = data.len(), "relay rate limit exceeded");
                return false;
            }
        }
        true
    }

    /// Packets of 64 bytes or fewer carry no signature and are accepted. Longer packets
    /// are checked against the configured relay key; with no key configured they are
    /// accepted unverified.
    pub fn verify_signature(&self, data: &[u8]) -> bool {
        if data.len() <= SIGNATURE_LEN {
            return true;
        }
        let Some(key) = &self.relay_key else {
            return true;
        };
        let (body, sig) = data.split_at(data.len() - SIGNATURE_LEN);
        let Ok(sig) = <[u8; SIGNATURE_LEN]>::try_from(sig) else {
            return false;
        };
        key.verify(body, &Signature::from_bytes(&sig)).is_ok()
    }

    /// Bytes of a relay datagram to hand on: `None` if the signature check fails, the body
    /// without its signature when one was verified, or the datagram unchanged otherwise.
    pub fn relay_payload<'a>(&self, data: &'a [u8]) -> Option<&'a [u8]> {
        if !self.verify_signature(data) {
            return None;
        }
        if self.relay_key.is_some() && data.len() > SIGNATURE_LEN {
            Some(&data[..data.len() - SIGNATURE_LEN])
        } else {
            Some(data)
        }
    }

    /// Current count in the open rate window (0 before the first relay datagram).
    pub fn window_count(&self) -> u32 {
        self.window.map(|w| w.count).unwrap_or(0)
    }
}

impl Default for RelaySecurityManager {
    fn default() -> Self {
        Self::new(RELAY_PORT)
    }
}

/// Parse a hex-encoded Ed25519 relay public key.
pub fn parse_relay_key(hex_key: &str) -> Result<VerifyingKey, RelayKeyError> {
    let bytes = hex::decode(hex_key.trim())?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|v: Vec<u8>| RelayKeyError::Length(v.len()))?;
    VerifyingKey::from_bytes(&bytes).map_err(|_| RelayKeyError::Invalid)
}

#[derive(Debug, thiserror::Error)]
pub enum RelayKeyError {
    #[error("relay key is not hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("relay key must be 32 bytes, got {0}")]
    Length(usize),
    #[error("relay key is not a valid Ed25519 point")]
    Invalid,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};
    use std::net::Ipv4Addr;

    fn ip(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    #[test]
    fn empty_pin_set_accepts_any_address() {
        let m = RelaySecurityManager::default();
        assert!(m.validate_relay_address(ip(1, 2, 3, 4)));
        assert!(m.validate_relay_address(ip(10, 0, 0, 1)));
    }

    #[test]
    fn pinned_set_filters_addresses() {
        let a = ip(203, 0, 113, 7);
        let b = ip(203, 0, 113, 8);
        let m = RelaySecurityManager::default().with_pinned([a]);
        assert!(m.validate_relay_address(a));
        assert!(!m.validate_relay_address(b));
    }

    #[test]
    fn wrong_source_port_rejected() {
        let mut m = RelaySecurityManager::default();
        assert!(!m.validate_incoming_packet(45678, b"x"));
        assert_eq!(m.window_count(), 0);
    }

    #[test]
    fn rate_limit_rejects_101st_in_window() {
        let mut m = RelaySecurityManager::default();
        let t0 = Instant::now();
        for i in 0..100 {
            let now = t0 + Duration::from_millis(i * 5);
            assert!(m.validate_incoming_packet_at(RELAY_PORT, b"x", now), "packet {i}");
        }
        assert!(!m.validate_incoming_packet_at(RELAY_PORT, b"x", t0 + Duration::from_millis(600)));
        assert!(!m.validate_incoming_packet_at(RELAY_PORT, b"x", t0 + Duration::from_millis(1000)));

        // Window elapsed: accepted and the counter restarts at 1.
        let later = t0 + Duration::from_millis(1001);
        assert!(m.validate_incoming_packet_at(RELAY_PORT, b"x", later));
        assert_eq!(m.window_count(), 1);
    }

    #[test]
    fn custom_rate_cap() {
        let mut m = RelaySecurityManager::default().with_rate_limit(2);
        let t0 = Instant::now();
        assert!(m.validate_incoming_packet_at(RELAY_PORT, b"a", t0));
        assert!(m.validate_incoming_packet_at(RELAY_PORT, b"b", t0));
        assert!(!m.validate_incoming_packet_at(RELAY_PORT, b"c", t0));
    }

    #[test]
    fn short_packets_skip_signature() {
        let key = SigningKey::from_bytes(&[3u8; 32]);
        let m = RelaySecurityManager::default().with_relay_key(key.verifying_key());
        assert!(m.verify_signature(&[0u8; 64]));
        assert_eq!(m.relay_payload(&[1u8; 10]), Some(&[1u8; 10][..]));
    }

    #[test]
    fn no_key_accepts_long_packets() {
        let m = RelaySecurityManager::default();
        let data = vec![5u8; 200];
        assert!(m.verify_signature(&data));
        assert_eq!(m.relay_payload(&data), Some(&data[..]));
    }

    #[test]
    fn signed_packet_verified_and_stripped() {
        let key = SigningKey::from_bytes(&rand::random::<[u8; 32]>());
        let m = RelaySecurityManager::default().with_relay_key(key.verifying_key());
        let body = b"opaque packet batch from the relay".to_vec();
        let mut data = body.clone();
        data.extend_from_slice(&key.sign(&body).to_bytes());
        assert!(m.verify_signature(&data));
        assert_eq!(m.relay_payload(&data), Some(&body[..]));

        let last = data.len() - 1;
        data[last] ^= 0x01;
        assert!(!m.verify_signature(&data));
        assert_eq!(m.relay_payload(&data), None);
    }

    #[test]
    fn parse_key_from_hex() {
        let key = SigningKey::from_bytes(&[9u8; 32]).verifying_key();
        let parsed = parse_relay_key(&hex::encode(key.to_bytes())).unwrap();
        assert_eq!(parsed, key);
        assert!(matches!(parse_relay_key("abcd"), Err(RelayKeyError::Length(2))));
        assert!(matches!(parse_relay_key("zz"), Err(RelayKeyError::Hex(_))));
    }
}
