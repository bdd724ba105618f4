//! Check-in mesh daemon for Linux: UDP broadcast/peers/relay, BLE over a pluggable radio,
//! LAN session discovery, and the periodic sync loop, wired to the okmesh-core pipeline.

pub mod ble;
#[cfg(feature = "bluetooth")]
pub mod bluez;
pub mod config;
pub mod coordinator;
pub mod discovery;
pub mod spool;
pub mod transport;
pub mod udp;

pub use ble::{BleConfig, BleEvent, BleRadio, BleTransport, LinkState, RadioError, UnavailableRadio};
pub use config::{Config, ConfigError};
pub use coordinator::{SyncConfig, TransportCoordinator};
pub use discovery::{
    DiscoveryError, DiscoveryEvent, LocalDiscoveryController, MulticastSession, P2pSession,
    PeerHints,
};
pub use transport::{SendReport, Transport, TransportError};
pub use udp::{RelayEndpoint, UdpConfig, UdpTransport};
