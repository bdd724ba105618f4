//! Check-in mesh synchronization core.
//! Host-driven: no I/O; transports pass received bytes and link events in, and get
//! completed payloads, delivery plans, and accept/reject verdicts back.

pub mod chunk;
pub mod collab;
pub mod fanout;
pub mod pipeline;
pub mod protocol;
pub mod relay;
pub mod wire;

pub use chunk::{frame_into_chunks, ChunkReceiveResult, Reassembler};
pub use collab::{ContactStore, MessageCore, MessageSummary, NotificationSink};
pub use fanout::{plan_ble_delivery, udp_destinations, DeliveryPath, LinkRoles};
pub use pipeline::{ImportOutcome, IncomingPacketPipeline};
pub use protocol::{DiscoveryMessage, Peer, TransportEnvelope, TransportKind, PROTOCOL_VERSION};
pub use relay::{parse_relay_key, RelayKeyError, RelaySecurityManager};
pub use wire::{FrameDecodeError, FrameEncodeError};
