//! Peer-to-peer session discovery. Carries no payload: connections it establishes become
//! peer hints for the UDP transport. The LAN backend uses multicast beacons.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use okmesh_core::protocol::{DISCOVERY_MULTICAST_GROUP, DISCOVERY_PORT};
use okmesh_core::wire::{decode_discovery, encode_discovery};
use okmesh_core::{DiscoveryMessage, PROTOCOL_VERSION};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::udp::UdpTransport;

const BEACON_INTERVAL: Duration = Duration::from_secs(4);
const PEER_TIMEOUT: Duration = Duration::from_secs(16);

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("discovery session already unregistered")]
    AlreadyUnregistered,
    #[error("unknown discovery peer {0}")]
    UnknownPeer(String),
    #[error("beacon encoding failed: {0}")]
    Encode(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// Current candidate list, most recently seen first.
    PeersChanged(Vec<String>),
    /// Session state changed; a formed group yields the address to reach the other side.
    ConnectionChanged {
        group_formed: bool,
        group_owner: Option<IpAddr>,
    },
}

/// Platform peer-to-peer session API.
#[async_trait]
pub trait P2pSession: Send + Sync {
    fn location_enabled(&self) -> bool;
    fn permission_granted(&self) -> bool;
    /// Register for session events.
    async fn register(&self) -> Result<mpsc::UnboundedReceiver<DiscoveryEvent>, DiscoveryError>;
    async fn discover_peers(&self) -> Result<(), DiscoveryError>;
    async fn connect(&self, peer: &str) -> Result<(), DiscoveryError>;
    /// Drop the registration. A second call reports `AlreadyUnregistered`.
    async fn unregister(&self) -> Result<(), DiscoveryError>;
}

/// Receiver of peer addresses learned by discovery.
#[async_trait]
pub trait PeerHints: Send + Sync {
    async fn add_peer(&self, ip: IpAddr);
}

#[async_trait]
impl PeerHints for UdpTransport {
    async fn add_peer(&self, ip: IpAddr) {
        UdpTransport::add_peer(self, ip).await;
    }
}

pub struct LocalDiscoveryController {
    session: Arc<dyn P2pSession>,
    hints: Arc<dyn PeerHints>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LocalDiscoveryController {
    pub fn new(session: Arc<dyn P2pSession>, hints: Arc<dyn PeerHints>) -> Self {
        Self {
            session,
            hints,
            task: Mutex::new(None),
        }
    }

    /// Register and begin discovery. Returns `Ok(false)` without touching the session when
    /// location services or the permission are missing.
    pub async fn start(&self) -> Result<bool, DiscoveryError> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return Ok(true);
        }
        if !self.session.location_enabled() || !self.session.permission_granted() {
            info!("local discovery not started: location or permission unavailable");
            return Ok(false);
        }
        let events = self.session.register().await?;
        *task = Some(tokio::spawn(event_loop(
            self.session.clone(),
            self.hints.clone(),
            events,
        )));
        if let Err(e) = self.session.discover_peers().await {
            warn!(error = %e, "peer discovery request failed");
        }
        info!("local discovery started");
        Ok(true)
    }

    pub async fn stop(&self) {
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
            let _ = task.await;
        }
        match self.session.unregister().await {
            Ok(()) | Err(DiscoveryError::AlreadyUnregistered) => {}
            Err(e) => warn!(error = %e, "discovery unregister failed"),
        }
        debug!("local discovery stopped");
    }
}

async fn event_loop(
    session: Arc<dyn P2pSession>,
    hints: Arc<dyn PeerHints>,
    mut events: mpsc::UnboundedReceiver<DiscoveryEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            DiscoveryEvent::PeersChanged(candidates) => {
                let Some(first) = candidates.first() else { continue };
                debug!(
                    peer = %first,
                    candidates = candidates.len(),
                    "connecting to discovered peer"
                );
                if let Err(e) = session.connect(first).await {
                    warn!(peer = %first, error = %e, "discovery connect failed");
                }
            }
            DiscoveryEvent::ConnectionChanged {
                group_formed: true,
                group_owner: Some(ip),
            } if !ip.is_unspecified() => {
                info!(%ip, "discovery session formed; adding udp peer");
                hints.add_peer(ip).await;
            }
            DiscoveryEvent::ConnectionChanged { group_formed, .. } => {
                debug!(group_formed, "discovery connection changed without usable address");
            }
        }
    }
}

struct BeaconPeer {
    addr: SocketAddr,
    last_seen: Instant,
}

/// Beacon bookkeeping for the LAN backend; turns datagrams into session events.
struct BeaconTable {
    instance_id: [u8; 16],
    peers: HashMap<String, BeaconPeer>,
    order: Vec<String>,
}

impl BeaconTable {
    fn new(instance_id: [u8; 16]) -> Self {
        Self {
            instance_id,
            peers: HashMap::new(),
            order: Vec::new(),
        }
    }

    fn on_datagram(&mut self, bytes: &[u8], from: SocketAddr, now: Instant) -> Vec<DiscoveryEvent> {
        let msg = match decode_discovery(bytes) {
            Ok(m) => m,
            Err(e) => {
                debug!(%from, error = %e, "undecodable discovery datagram");
                return Vec::new();
            }
        };
        if msg.protocol_version() != PROTOCOL_VERSION || msg.instance_id() == self.instance_id {
            return Vec::new();
        }
        let id = hex::encode(msg.instance_id());
        let is_new = self
            .peers
            .insert(id.clone(), BeaconPeer { addr: from, last_seen: now })
            .is_none();
        let mut events = Vec::new();
        match msg {
            DiscoveryMessage::Beacon { .. } => {
                if is_new {
                    self.order.insert(0, id);
                    events.push(DiscoveryEvent::PeersChanged(self.order.clone()));
                }
            }
            DiscoveryMessage::Response { .. } => {
                if is_new {
                    self.order.insert(0, id);
                }
                events.push(DiscoveryEvent::ConnectionChanged {
                    group_formed: true,
                    group_owner: Some(from.ip()),
                });
            }
        }
        events
    }

    fn expire(&mut self, now: Instant) -> Option<DiscoveryEvent> {
        let before = self.peers.len();
        self.peers
            .retain(|_, p| now.duration_since(p.last_seen) < PEER_TIMEOUT);
        if self.peers.len() == before {
            return None;
        }
        let peers = &self.peers;
        self.order.retain(|id| peers.contains_key(id));
        Some(DiscoveryEvent::PeersChanged(self.order.clone()))
    }

    fn addr_of(&self, peer: &str) -> Option<SocketAddr> {
        self.peers.get(peer).map(|p| p.addr)
    }
}

struct Running {
    socket: Arc<UdpSocket>,
    table: Arc<Mutex<BeaconTable>>,
    tasks: Vec<JoinHandle<()>>,
}

/// LAN stand-in for a peer-to-peer session: multicast beacons announce the instance,
/// "connect" answers a peer with a unicast response, and a received response counts as
/// a formed session with that peer.
pub struct MulticastSession {
    port: u16,
    instance_id: [u8; 16],
    running: Mutex<Option<Running>>,
}

impl MulticastSession {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            instance_id: *uuid::Uuid::new_v4().as_bytes(),
            running: Mutex::new(None),
        }
    }

    fn beacon(&self) -> DiscoveryMessage {
        DiscoveryMessage::Beacon {
            protocol_version: PROTOCOL_VERSION,
            instance_id: self.instance_id,
        }
    }

    fn group_addr(&self) -> SocketAddr {
        SocketAddr::from((DISCOVERY_MULTICAST_GROUP, self.port))
    }
}

impl Default for MulticastSession {
    fn default() -> Self {
        Self::new(DISCOVERY_PORT)
    }
}

fn make_multicast_socket(port: u16) -> io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
    std_sock.join_multicast_v4(&DISCOVERY_MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

#[async_trait]
impl P2pSession for MulticastSession {
    fn location_enabled(&self) -> bool {
        true
    }

    fn permission_granted(&self) -> bool {
        true
    }

    async fn register(&self) -> Result<mpsc::UnboundedReceiver<DiscoveryEvent>, DiscoveryError> {
        let mut running = self.running.lock().await;
        if let Some(old) = running.take() {
            for t in old.tasks {
                t.abort();
            }
        }
        let socket = Arc::new(make_multicast_socket(self.port)?);
        let table = Arc::new(Mutex::new(BeaconTable::new(self.instance_id)));
        let (tx, rx) = mpsc::unbounded_channel();
        let beacon = encode_discovery(&self.beacon())?;

        let tasks = vec![
            tokio::spawn(beacon_loop(socket.clone(), beacon, self.group_addr())),
            tokio::spawn(recv_loop(socket.clone(), table.clone(), tx.clone())),
            tokio::spawn(expire_loop(table.clone(), tx)),
        ];
        *running = Some(Running {
            socket,
            table,
            tasks,
        });
        Ok(rx)
    }

    async fn discover_peers(&self) -> Result<(), DiscoveryError> {
        let running = self.running.lock().await;
        let Some(r) = running.as_ref() else {
            return Err(DiscoveryError::AlreadyUnregistered);
        };
        let beacon = encode_discovery(&self.beacon())?;
        r.socket.send_to(&beacon, self.group_addr()).await?;
        Ok(())
    }

    async fn connect(&self, peer: &str) -> Result<(), DiscoveryError> {
        let running = self.running.lock().await;
        let Some(r) = running.as_ref() else {
            return Err(DiscoveryError::AlreadyUnregistered);
        };
        let addr = r
            .table
            .lock()
            .await
            .addr_of(peer)
            .ok_or_else(|| DiscoveryError::UnknownPeer(peer.to_string()))?;
        let response = encode_discovery(&DiscoveryMessage::Response {
            protocol_version: PROTOCOL_VERSION,
            instance_id: self.instance_id,
        })?;
        r.socket.send_to(&response, addr).await?;
        Ok(())
    }

    async fn unregister(&self) -> Result<(), DiscoveryError> {
        let Some(r) = self.running.lock().await.take() else {
            return Err(DiscoveryError::AlreadyUnregistered);
        };
        for t in &r.tasks {
            t.abort();
        }
        for t in r.tasks {
            let _ = t.await;
        }
        Ok(())
    }
}

async fn beacon_loop(socket: Arc<UdpSocket>, beacon: Vec<u8>, dest: SocketAddr) {
    loop {
        if let Err(e) = socket.send_to(&beacon, dest).await {
            debug!(error = %e, "beacon send failed");
        }
        tokio::time::sleep(BEACON_INTERVAL).await;
    }
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    table: Arc<Mutex<BeaconTable>>,
    tx: mpsc::UnboundedSender<DiscoveryEvent>,
) {
    let mut buf = vec![0u8; 2048];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, from)) => {
                let events = table.lock().await.on_datagram(&buf[..n], from, Instant::now());
                for event in events {
                    if tx.send(event).is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "discovery receive failed; loop exiting");
                return;
            }
        }
    }
}

async fn expire_loop(table: Arc<Mutex<BeaconTable>>, tx: mpsc::UnboundedSender<DiscoveryEvent>) {
    loop {
        tokio::time::sleep(BEACON_INTERVAL).await;
        let expired = table.lock().await.expire(Instant::now());
        if let Some(event) = expired {
            if tx.send(event).is_err() {
                return;
            }
        }
    }
}
