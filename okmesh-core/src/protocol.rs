//! Mesh transport constants, transport kinds, and the types shared by every transport.

use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current LAN discovery protocol version. Carried in every beacon.
pub const PROTOCOL_VERSION: u8 = 1;

/// Local UDP port for broadcast and direct peer datagrams.
pub const UDP_PORT: u16 = 45678;
/// Source port of every datagram coming from the cloud relay.
pub const RELAY_PORT: u16 = 40100;
/// Production relay hostname (anycast, so its addresses are not pinned by default).
pub const RELAY_HOST: &str = "i-am-ok-relay.fly.dev";
/// Limited broadcast address used for local fan-out.
pub const BROADCAST_ADDR: Ipv4Addr = Ipv4Addr::BROADCAST;
/// LAN discovery multicast group (same subnet, TTL 1).
pub const DISCOVERY_MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 60);
/// LAN discovery UDP port.
pub const DISCOVERY_PORT: u16 = 45679;

/// GATT service advertised and scanned for by every mesh node.
pub const BLE_SERVICE_UUID: Uuid = Uuid::from_u128(0x2f61cdb3_1b5f_4b2a_9a8d_3f6b9c3c1b00);
/// Single write+notify characteristic carrying framed chunks.
pub const BLE_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x2f61cdb3_1b5f_4b2a_9a8d_3f6b9c3c1b01);
/// BLE write chunk size in bytes.
pub const BLE_CHUNK_SIZE: usize = 180;
/// Pause between consecutive chunk writes to the same peer.
pub const BLE_CHUNK_INTERVAL: Duration = Duration::from_millis(20);

/// Default period of the export-and-fan-out loop.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(15);
/// Default number of pending packets requested per sync tick.
pub const DEFAULT_EXPORT_LIMIT: usize = 50;
/// Number of recent messages fetched after a successful packet import.
pub const RECENT_MESSAGES_LIMIT: usize = 20;

/// Channel a payload travelled over. Wire values are shared with MessageCore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TransportKind {
    Ble = 0,
    WifiDirect = 1,
    Udp = 2,
    /// Reserved; no transport produces it yet.
    Satellite = 3,
}

impl TransportKind {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(TransportKind::Ble),
            1 => Some(TransportKind::WifiDirect),
            2 => Some(TransportKind::Udp),
            3 => Some(TransportKind::Satellite),
            _ => None,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportKind::Ble => "ble",
            TransportKind::WifiDirect => "wifi-direct",
            TransportKind::Udp => "udp",
            TransportKind::Satellite => "satellite",
        };
        f.write_str(name)
    }
}

/// A transport-scoped address we can reach. Not an identity: the same device may
/// show up once per transport, and a fresh sighting overwrites the old one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Peer {
    pub address: String,
    pub kind: TransportKind,
}

impl Peer {
    pub fn new(address: impl Into<String>, kind: TransportKind) -> Self {
        Self {
            address: address.into(),
            kind,
        }
    }
}

/// Bytes received by a transport, on their way into the inbound pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEnvelope {
    pub payload: Vec<u8>,
    pub source: String,
    pub kind: TransportKind,
}

impl TransportEnvelope {
    pub fn new(payload: Vec<u8>, source: impl Into<String>, kind: TransportKind) -> Self {
        Self {
            payload,
            source: source.into(),
            kind,
        }
    }
}

/// LAN discovery messages. Encoding is bincode (see wire module); these never carry payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscoveryMessage {
    /// Periodic multicast: advertise presence.
    Beacon {
        protocol_version: u8,
        instance_id: [u8; 16],
    },
    /// Unicast reply to a beacon: confirm the session from the responder's side.
    Response {
        protocol_version: u8,
        instance_id: [u8; 16],
    },
}

impl DiscoveryMessage {
    pub fn instance_id(&self) -> [u8; 16] {
        match self {
            DiscoveryMessage::Beacon { instance_id, .. }
            | DiscoveryMessage::Response { instance_id, .. } => *instance_id,
        }
    }

    pub fn protocol_version(&self) -> u8 {
        match self {
            DiscoveryMessage::Beacon {
                protocol_version, ..
            }
            | DiscoveryMessage::Response {
                protocol_version, ..
            } => *protocol_version,
        }
    }
}
