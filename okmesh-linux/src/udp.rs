//! UDP transport: subnet broadcast, learned direct peers, and the cloud relay fallback,
//! all over one bound port with broadcast enabled.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use okmesh_core::protocol::{BROADCAST_ADDR, UDP_PORT};
use okmesh_core::{
    udp_destinations, Peer, RelaySecurityManager, TransportEnvelope, TransportKind,
};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::transport::{SendReport, Transport, TransportError};

const RECV_BUFFER: usize = 65_536;

/// Where the relay lives and how often to look it up again.
#[derive(Debug, Clone)]
pub struct RelayEndpoint {
    pub host: String,
    pub port: u16,
    pub refresh: Duration,
    pub retry: Duration,
}

#[derive(Debug, Clone)]
pub struct UdpConfig {
    /// Local bind port; also the port assumed for peers added by discovery.
    pub port: u16,
    pub broadcast: SocketAddr,
    pub relay: Option<RelayEndpoint>,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            port: UDP_PORT,
            broadcast: SocketAddr::from((BROADCAST_ADDR, UDP_PORT)),
            relay: None,
        }
    }
}

/// State touched by the receive loop, the resolver, discovery, and senders.
struct Shared {
    port: u16,
    security: Mutex<RelaySecurityManager>,
    peers: Mutex<HashMap<IpAddr, SocketAddr>>,
    relay_addr: Mutex<Option<SocketAddr>>,
    /// Our own interface addresses at the bound port; broadcast loops back from these.
    own_addrs: Mutex<HashSet<SocketAddr>>,
    inbound: mpsc::UnboundedSender<TransportEnvelope>,
}

impl Shared {
    /// Accept or drop one datagram. Our own broadcasts are dropped. Relay-port traffic
    /// must pass the security gate and is never learned as a peer; anything else is
    /// accepted and its source remembered.
    async fn on_datagram(&self, data: &[u8], from: SocketAddr) -> Option<TransportEnvelope> {
        if self.own_addrs.lock().await.contains(&from) {
            return None;
        }
        let mut security = self.security.lock().await;
        if from.port() == security.relay_port() {
            if !security.validate_incoming_packet(from.port(), data) {
                debug!(%from, "relay datagram dropped");
                return None;
            }
            let Some(payload) = security.relay_payload(data) else {
                warn!(%from, "relay datagram failed signature check");
                return None;
            };
            return Some(TransportEnvelope::new(
                payload.to_vec(),
                from.to_string(),
                TransportKind::Udp,
            ));
        }
        drop(security);
        self.peers.lock().await.insert(from.ip(), from);
        Some(TransportEnvelope::new(
            data.to_vec(),
            from.to_string(),
            TransportKind::Udp,
        ))
    }
}

pub struct UdpTransport {
    config: UdpConfig,
    shared: Arc<Shared>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl UdpTransport {
    pub fn new(
        config: UdpConfig,
        security: RelaySecurityManager,
        inbound: mpsc::UnboundedSender<TransportEnvelope>,
    ) -> Self {
        let shared = Arc::new(Shared {
            port: config.port,
            security: Mutex::new(security),
            peers: Mutex::new(HashMap::new()),
            relay_addr: Mutex::new(None),
            own_addrs: Mutex::new(HashSet::new()),
            inbound,
        });
        Self {
            config,
            shared,
            socket: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Seed the peer table with an address learned out of band (e.g. discovery).
    pub async fn add_peer(&self, ip: IpAddr) {
        let addr = SocketAddr::new(ip, self.shared.port);
        debug!(%addr, "peer hint added");
        self.shared.peers.lock().await.insert(ip, addr);
    }

    pub async fn peers(&self) -> Vec<Peer> {
        let mut out: Vec<Peer> = self
            .shared
            .peers
            .lock()
            .await
            .values()
            .map(|a| Peer::new(a.to_string(), TransportKind::Udp))
            .collect();
        out.sort_by(|a, b| a.address.cmp(&b.address));
        out
    }

    /// Relay address from the last successful lookup, if any.
    pub async fn relay_address(&self) -> Option<SocketAddr> {
        *self.shared.relay_addr.lock().await
    }

    /// Local address of the bound socket while started.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        let socket = self.socket.lock().await;
        socket.as_ref().and_then(|s| s.local_addr().ok())
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Udp
    }

    async fn start(&self) -> Result<(), TransportError> {
        let mut slot = self.socket.lock().await;
        if slot.is_some() {
            return Ok(());
        }
        let socket = Arc::new(make_broadcast_socket(self.config.port)?);
        let bound = socket.local_addr()?;
        *self.shared.own_addrs.lock().await = own_addresses(bound.port());
        info!(addr = %bound, "udp transport bound");

        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(recv_loop(socket.clone(), self.shared.clone())));
        if let Some(relay) = self.config.relay.clone() {
            tasks.push(tokio::spawn(resolve_loop(
                relay,
                self.shared.clone(),
                |host, port| async move { resolve_relay(&host, port).await },
            )));
        }
        *slot = Some(socket);
        Ok(())
    }

    async fn stop(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            let _ = task.await;
        }
        self.socket.lock().await.take();
        self.shared.relay_addr.lock().await.take();
        self.shared.own_addrs.lock().await.clear();
        debug!("udp transport stopped");
    }

    async fn send(&self, payload: Arc<[u8]>) -> Result<SendReport, TransportError> {
        let socket = self
            .socket
            .lock()
            .await
            .clone()
            .ok_or(TransportError::NotStarted)?;
        let peers = self.shared.peers.lock().await.clone();
        let relay = *self.shared.relay_addr.lock().await;
        let relay = match relay {
            Some(addr) if self.shared.security.lock().await.validate_relay_address(addr.ip()) => {
                Some(addr)
            }
            _ => None,
        };
        let destinations = udp_destinations(self.config.broadcast, &peers, relay);
        let mut report = SendReport {
            attempted: destinations.len(),
            delivered: 0,
        };
        for dest in destinations {
            match socket.send_to(&payload, dest).await {
                Ok(_) => report.delivered += 1,
                Err(e) => warn!(%dest, error = %e, "udp send failed"),
            }
        }
        debug!(
            bytes = payload.len(),
            delivered = report.delivered,
            attempted = report.attempted,
            "udp fan-out"
        );
        Ok(report)
    }
}

/// IPv4 UDP socket with address reuse and broadcast enabled, bound on all interfaces.
fn make_broadcast_socket(port: u16) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SockAddr::from(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))))?;
    UdpSocket::from_std(socket.into())
}

/// Every local IPv4 interface address paired with `port`.
fn own_addresses(port: u16) -> HashSet<SocketAddr> {
    match get_if_addrs::get_if_addrs() {
        Ok(ifaces) => ifaces
            .iter()
            .map(|i| i.ip())
            .filter(IpAddr::is_ipv4)
            .map(|ip| SocketAddr::new(ip, port))
            .collect(),
        Err(e) => {
            warn!(error = %e, "listing local interfaces failed; own broadcasts not filtered");
            HashSet::new()
        }
    }
}

async fn recv_loop(socket: Arc<UdpSocket>, shared: Arc<Shared>) {
    let mut buf = vec![0u8; RECV_BUFFER];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, from)) => {
                if let Some(envelope) = shared.on_datagram(&buf[..n], from).await {
                    if shared.inbound.send(envelope).is_err() {
                        debug!("inbound channel closed; udp receive loop exiting");
                        return;
                    }
                }
            }
            // ICMP unreachable from an earlier send surfaces here on Linux.
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
                ) =>
            {
                continue
            }
            Err(e) => {
                warn!(error = %e, "udp receive failed; loop exiting");
                return;
            }
        }
    }
}

/// Resolve the relay host to an IPv4 socket address.
pub async fn resolve_relay(host: &str, port: u16) -> io::Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no IPv4 address for relay"))
}

/// Look the relay up now, then every `refresh` after a success or every `retry` after a
/// failure. A failed lookup keeps the last good address.
async fn resolve_loop<F, Fut>(relay: RelayEndpoint, shared: Arc<Shared>, resolve: F)
where
    F: Fn(String, u16) -> Fut,
    Fut: Future<Output = io::Result<SocketAddr>>,
{
    loop {
        let wait = match resolve(relay.host.clone(), relay.port).await {
            Ok(addr) => {
                if !shared.security.lock().await.validate_relay_address(addr.ip()) {
                    warn!(%addr, host = %relay.host, "resolved relay address is not pinned");
                }
                let previous = shared.relay_addr.lock().await.replace(addr);
                if previous != Some(addr) {
                    info!(%addr, host = %relay.host, "relay resolved");
                }
                relay.refresh
            }
            Err(e) => {
                warn!(host = %relay.host, error = %e, "relay resolution failed");
                relay.retry
            }
        };
        tokio::time::sleep(wait).await;
    }
}
