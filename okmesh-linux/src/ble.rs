//! BLE transport: dual-role GATT link over a pluggable radio. Outbound payloads are
//! length-prefixed, chunked, and paced per peer; inbound chunks (peripheral writes and
//! central notifications) are reassembled per peer address.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use okmesh_core::chunk::DEFAULT_REASSEMBLY_TIMEOUT;
use okmesh_core::protocol::{
    BLE_CHARACTERISTIC_UUID, BLE_CHUNK_INTERVAL, BLE_CHUNK_SIZE, BLE_SERVICE_UUID,
};
use okmesh_core::{
    frame_into_chunks, plan_ble_delivery, ChunkReceiveResult, DeliveryPath, LinkRoles, Peer,
    Reassembler, TransportEnvelope, TransportKind,
};
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::transport::{SendReport, Transport, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum RadioError {
    #[error("bluetooth permission denied")]
    PermissionDenied,
    #[error("bluetooth adapter unavailable: {0}")]
    Unavailable(String),
    #[error("no link to {0}")]
    NotConnected(String),
    #[error("not supported by this radio: {0}")]
    Unsupported(&'static str),
    #[error("radio backend: {0}")]
    Backend(String),
}

/// Link and data events reported by a radio. Addresses are the radio's peer identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BleEvent {
    /// Scan result advertising the mesh service.
    Discovered { address: String },
    /// Our central-role connection to the remote is up.
    CentralConnected { address: String },
    /// Our central-role connection dropped or failed to come up.
    CentralDisconnected { address: String },
    /// The remote connected to our peripheral role.
    SubscriberConnected { address: String },
    SubscriberDisconnected { address: String },
    /// Characteristic write from a remote central.
    WriteReceived { address: String, value: Vec<u8> },
    /// Characteristic notification on one of our central-role links.
    NotificationReceived { address: String, value: Vec<u8> },
}

/// Advertising, scanning, and GATT I/O. `start` returns the event stream; the other
/// calls act on peers the stream has reported.
#[async_trait]
pub trait BleRadio: Send + Sync {
    async fn start(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<mpsc::UnboundedReceiver<BleEvent>, RadioError>;
    /// Begin a central-role connection. Completion arrives as `CentralConnected`.
    async fn connect(&self, address: &str) -> Result<(), RadioError>;
    async fn write(&self, address: &str, chunk: &[u8]) -> Result<(), RadioError>;
    async fn notify(&self, address: &str, chunk: &[u8]) -> Result<(), RadioError>;
    /// True when one `notify` reaches every subscribed central, not just `address`.
    fn notify_reaches_all(&self) -> bool {
        false
    }
    async fn disconnect(&self, address: &str);
    /// Stop advertising and scanning, close every link, end the event stream.
    async fn stop(&self);
}

/// Radio for builds without a Bluetooth backend; `start` always reports unavailable.
pub struct UnavailableRadio;

#[async_trait]
impl BleRadio for UnavailableRadio {
    async fn start(
        &self,
        _service: Uuid,
        _characteristic: Uuid,
    ) -> Result<mpsc::UnboundedReceiver<BleEvent>, RadioError> {
        Err(RadioError::Unavailable("built without bluetooth support".to_string()))
    }
    async fn connect(&self, address: &str) -> Result<(), RadioError> {
        Err(RadioError::NotConnected(address.to_string()))
    }
    async fn write(&self, address: &str, _chunk: &[u8]) -> Result<(), RadioError> {
        Err(RadioError::NotConnected(address.to_string()))
    }
    async fn notify(&self, address: &str, _chunk: &[u8]) -> Result<(), RadioError> {
        Err(RadioError::NotConnected(address.to_string()))
    }
    async fn disconnect(&self, _address: &str) {}
    async fn stop(&self) {}
}

#[derive(Debug, Clone)]
pub struct BleConfig {
    pub service: Uuid,
    pub characteristic: Uuid,
    pub chunk_size: usize,
    pub chunk_interval: Duration,
    pub reassembly_timeout: Duration,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            service: BLE_SERVICE_UUID,
            characteristic: BLE_CHARACTERISTIC_UUID,
            chunk_size: BLE_CHUNK_SIZE,
            chunk_interval: BLE_CHUNK_INTERVAL,
            reassembly_timeout: DEFAULT_REASSEMBLY_TIMEOUT,
        }
    }
}

/// Central-role connection state for one remote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LinkState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// One framed payload queued for a peer, with the path chosen at send time.
struct Outbound {
    path: DeliveryPath,
    chunks: Arc<Vec<Vec<u8>>>,
}

struct Worker {
    queue: mpsc::UnboundedSender<Outbound>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct PeerLink {
    state: LinkState,
    roles: LinkRoles,
    worker: Option<Worker>,
}

struct BleShared {
    radio: Arc<dyn BleRadio>,
    config: BleConfig,
    links: Mutex<HashMap<String, PeerLink>>,
    reassembler: Mutex<Reassembler>,
    connects: Mutex<JoinSet<()>>,
    inbound: mpsc::UnboundedSender<TransportEnvelope>,
}

impl BleShared {
    async fn on_event(self: &Arc<Self>, event: BleEvent) {
        match event {
            BleEvent::Discovered { address } => self.on_discovered(address).await,
            BleEvent::CentralConnected { address } => {
                let mut links = self.links.lock().await;
                let link = links.entry(address.clone()).or_default();
                link.state = LinkState::Connected;
                link.roles.central = true;
                info!(%address, "ble central link up");
            }
            BleEvent::CentralDisconnected { address } => {
                {
                    let mut links = self.links.lock().await;
                    if let Some(link) = links.get_mut(&address) {
                        link.state = LinkState::Disconnected;
                        link.roles.central = false;
                    }
                }
                debug!(%address, "ble central link down");
                self.after_link_loss(&address).await;
            }
            BleEvent::SubscriberConnected { address } => {
                let mut links = self.links.lock().await;
                links.entry(address.clone()).or_default().roles.peripheral = true;
                info!(%address, "ble subscriber connected");
            }
            BleEvent::SubscriberDisconnected { address } => {
                if let Some(link) = self.links.lock().await.get_mut(&address) {
                    link.roles.peripheral = false;
                }
                debug!(%address, "ble subscriber disconnected");
                self.after_link_loss(&address).await;
            }
            BleEvent::WriteReceived { address, value }
            | BleEvent::NotificationReceived { address, value } => {
                self.on_chunk(address, &value).await;
            }
        }
    }

    async fn on_discovered(self: &Arc<Self>, address: String) {
        {
            let mut links = self.links.lock().await;
            let link = links.entry(address.clone()).or_default();
            if link.state != LinkState::Disconnected {
                return;
            }
            link.state = LinkState::Connecting;
        }
        debug!(%address, "ble connecting");
        let shared = self.clone();
        let mut connects = self.connects.lock().await;
        while connects.try_join_next().is_some() {}
        connects.spawn(async move {
            if let Err(e) = shared.radio.connect(&address).await {
                warn!(%address, error = %e, "ble connect failed");
                {
                    let mut links = shared.links.lock().await;
                    if let Some(link) = links.get_mut(&address) {
                        if link.state == LinkState::Connecting {
                            link.state = LinkState::Disconnected;
                        }
                    }
                }
                shared.after_link_loss(&address).await;
            }
        });
    }

    /// Once neither role links the peer (and no connect is in flight), drop its worker,
    /// entry, and partial buffer.
    async fn after_link_loss(&self, address: &str) {
        let removed = {
            let mut links = self.links.lock().await;
            match links.get(address) {
                Some(link) if !link.roles.is_linked() && link.state != LinkState::Connecting => {
                    links.remove(address)
                }
                _ => None,
            }
        };
        let Some(link) = removed else { return };
        if let Some(worker) = link.worker {
            worker.handle.abort();
        }
        if self.reassembler.lock().await.discard(address) {
            debug!(%address, "partial ble message discarded on disconnect");
        }
    }

    async fn on_chunk(&self, address: String, chunk: &[u8]) {
        let result = self.reassembler.lock().await.on_chunk(&address, chunk);
        if let ChunkReceiveResult::Complete(payload) = result {
            debug!(%address, bytes = payload.len(), "ble message reassembled");
            let envelope = TransportEnvelope::new(payload, address, TransportKind::Ble);
            if self.inbound.send(envelope).is_err() {
                debug!("inbound channel closed; ble message dropped");
            }
        }
    }

    fn spawn_worker(&self, address: &str) -> Worker {
        let (queue, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(pacing_worker(
            self.radio.clone(),
            address.to_string(),
            self.config.chunk_interval,
            rx,
        ));
        Worker { queue, handle }
    }
}

/// Deliver queued payloads to one peer, one chunk per interval. A failed chunk abandons
/// the rest of that payload; the next sync resends it.
async fn pacing_worker(
    radio: Arc<dyn BleRadio>,
    address: String,
    interval: Duration,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(out) = rx.recv().await {
        for chunk in out.chunks.iter() {
            let result = match out.path {
                DeliveryPath::Write => radio.write(&address, chunk).await,
                DeliveryPath::Notify => radio.notify(&address, chunk).await,
            };
            if let Err(e) = result {
                warn!(%address, path = ?out.path, error = %e, "ble chunk delivery failed");
                break;
            }
            tokio::time::sleep(interval).await;
        }
    }
}

async fn event_loop(shared: Arc<BleShared>, mut events: mpsc::UnboundedReceiver<BleEvent>) {
    let mut sweep = tokio::time::interval(shared.config.reassembly_timeout);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => shared.on_event(event).await,
                None => {
                    debug!("ble event stream ended");
                    return;
                }
            },
            _ = sweep.tick() => {
                let evicted = shared.reassembler.lock().await.evict_expired(Instant::now());
                if evicted > 0 {
                    debug!(evicted, "stale ble reassembly buffers dropped");
                }
            }
        }
    }
}

pub struct BleTransport {
    shared: Arc<BleShared>,
    inert: AtomicBool,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl BleTransport {
    pub fn new(
        radio: Arc<dyn BleRadio>,
        config: BleConfig,
        inbound: mpsc::UnboundedSender<TransportEnvelope>,
    ) -> Self {
        let reassembler = Reassembler::new(config.reassembly_timeout);
        Self {
            shared: Arc::new(BleShared {
                radio,
                config,
                links: Mutex::new(HashMap::new()),
                reassembler: Mutex::new(reassembler),
                connects: Mutex::new(JoinSet::new()),
                inbound,
            }),
            inert: AtomicBool::new(false),
            event_task: Mutex::new(None),
        }
    }

    pub async fn link_state(&self, address: &str) -> LinkState {
        self.shared
            .links
            .lock()
            .await
            .get(address)
            .map(|l| l.state)
            .unwrap_or_default()
    }

    /// Peers with at least one live link.
    pub async fn peers(&self) -> Vec<Peer> {
        let links = self.shared.links.lock().await;
        let mut out: Vec<Peer> = links
            .iter()
            .filter(|(_, l)| l.roles.is_linked())
            .map(|(a, _)| Peer::new(a.clone(), TransportKind::Ble))
            .collect();
        out.sort_by(|a, b| a.address.cmp(&b.address));
        out
    }
}

#[async_trait]
impl Transport for BleTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Ble
    }

    async fn start(&self) -> Result<(), TransportError> {
        if self.inert.load(Ordering::Acquire) {
            return Err(TransportError::PermissionDenied("bluetooth".to_string()));
        }
        let mut task = self.event_task.lock().await;
        if task.is_some() {
            return Ok(());
        }
        let config = &self.shared.config;
        match self
            .shared
            .radio
            .start(config.service, config.characteristic)
            .await
        {
            Ok(events) => {
                *task = Some(tokio::spawn(event_loop(self.shared.clone(), events)));
                info!(service = %config.service, "ble transport started");
                Ok(())
            }
            Err(RadioError::PermissionDenied) => {
                self.inert.store(true, Ordering::Release);
                Err(TransportError::PermissionDenied("bluetooth".to_string()))
            }
            Err(e) => Err(TransportError::Radio(e.to_string())),
        }
    }

    async fn stop(&self) {
        if let Some(task) = self.event_task.lock().await.take() {
            task.abort();
            let _ = task.await;
        }
        self.shared.connects.lock().await.shutdown().await;
        let links = std::mem::take(&mut *self.shared.links.lock().await);
        for (address, link) in links {
            if link.roles.central {
                self.shared.radio.disconnect(&address).await;
            }
            if let Some(worker) = link.worker {
                worker.handle.abort();
                let _ = worker.handle.await;
            }
        }
        self.shared.radio.stop().await;
        let fresh = Reassembler::new(self.shared.config.reassembly_timeout);
        *self.shared.reassembler.lock().await = fresh;
        debug!("ble transport stopped");
    }

    async fn send(&self, payload: Arc<[u8]>) -> Result<SendReport, TransportError> {
        if self.event_task.lock().await.is_none() {
            return Err(TransportError::NotStarted);
        }
        let chunks = Arc::new(frame_into_chunks(&payload, self.shared.config.chunk_size)?);
        let mut links = self.shared.links.lock().await;
        let plan = plan_ble_delivery(links.iter().map(|(a, l)| (a, &l.roles)));
        let mut report = SendReport {
            attempted: plan.len(),
            delivered: 0,
        };
        let shared_notify = self.shared.radio.notify_reaches_all();
        let mut notify_queued = false;
        for (address, path) in plan {
            if shared_notify && path == DeliveryPath::Notify {
                // One subscriber's queue carries the payload to all of them.
                if notify_queued {
                    report.delivered += 1;
                    continue;
                }
                notify_queued = true;
            }
            let Some(link) = links.get_mut(&address) else { continue };
            let worker = link
                .worker
                .get_or_insert_with(|| self.shared.spawn_worker(&address));
            let out = Outbound {
                path,
                chunks: chunks.clone(),
            };
            if worker.queue.send(out).is_ok() {
                report.delivered += 1;
            } else {
                warn!(%address, "ble pacing worker gone");
                link.worker = None;
            }
        }
        debug!(
            bytes = payload.len(),
            chunks = chunks.len(),
            peers = report.delivered,
            "ble fan-out queued"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use okmesh_core::wire::encode_frame;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct FakeRadio {
        deny: bool,
        fail_connect: bool,
        broadcast_notify: bool,
        starts: StdMutex<usize>,
        events: StdMutex<Option<mpsc::UnboundedSender<BleEvent>>>,
        connects: StdMutex<Vec<String>>,
        sent: StdMutex<Vec<(String, DeliveryPath, Vec<u8>)>>,
        stopped: AtomicBool,
    }

    impl FakeRadio {
        fn emit(&self, event: BleEvent) {
            if let Some(tx) = self.events.lock().unwrap().as_ref() {
                tx.send(event).unwrap();
            }
        }
        fn sent_to(&self, address: &str) -> Vec<(DeliveryPath, Vec<u8>)> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(a, _, _)| a == address)
                .map(|(_, p, c)| (*p, c.clone()))
                .collect()
        }
    }

    #[async_trait]
    impl BleRadio for FakeRadio {
        async fn start(
            &self,
            _service: Uuid,
            _characteristic: Uuid,
        ) -> Result<mpsc::UnboundedReceiver<BleEvent>, RadioError> {
            *self.starts.lock().unwrap() += 1;
            if self.deny {
                return Err(RadioError::PermissionDenied);
            }
            let (tx, rx) = mpsc::unbounded_channel();
            *self.events.lock().unwrap() = Some(tx);
            Ok(rx)
        }
        async fn connect(&self, address: &str) -> Result<(), RadioError> {
            self.connects.lock().unwrap().push(address.to_string());
            if self.fail_connect {
                return Err(RadioError::Backend("timeout".into()));
            }
            Ok(())
        }
        async fn write(&self, address: &str, chunk: &[u8]) -> Result<(), RadioError> {
            self.sent
                .lock()
                .unwrap()
                .push((address.to_string(), DeliveryPath::Write, chunk.to_vec()));
            Ok(())
        }
        async fn notify(&self, address: &str, chunk: &[u8]) -> Result<(), RadioError> {
            self.sent
                .lock()
                .unwrap()
                .push((address.to_string(), DeliveryPath::Notify, chunk.to_vec()));
            Ok(())
        }
        fn notify_reaches_all(&self) -> bool {
            self.broadcast_notify
        }
        async fn disconnect(&self, _address: &str) {}
        async fn stop(&self) {
            self.events.lock().unwrap().take();
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    fn transport(
        radio: Arc<FakeRadio>,
    ) -> (BleTransport, mpsc::UnboundedReceiver<TransportEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (BleTransport::new(radio, BleConfig::default(), tx), rx)
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn addr(a: &str) -> String {
        a.to_string()
    }

    #[tokio::test(start_paused = true)]
    async fn permission_denied_leaves_transport_inert() {
        let radio = Arc::new(FakeRadio {
            deny: true,
            ..Default::default()
        });
        let (t, _rx) = transport(radio.clone());
        assert!(matches!(t.start().await, Err(TransportError::PermissionDenied(_))));
        assert!(matches!(t.start().await, Err(TransportError::PermissionDenied(_))));
        assert_eq!(*radio.starts.lock().unwrap(), 1);
        assert!(matches!(
            t.send(Arc::from(&b"x"[..])).await,
            Err(TransportError::NotStarted)
        ));
    }

    #[tokio::test]
    async fn unavailable_radio_fails_start_but_not_inert() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let t = BleTransport::new(Arc::new(UnavailableRadio), BleConfig::default(), tx);
        assert!(matches!(t.start().await, Err(TransportError::Radio(_))));
        assert!(!t.inert.load(Ordering::SeqCst));
        t.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn rediscovery_while_linked_is_ignored() {
        let radio = Arc::new(FakeRadio::default());
        let (t, _rx) = transport(radio.clone());
        t.start().await.unwrap();

        radio.emit(BleEvent::Discovered { address: addr("A") });
        radio.emit(BleEvent::Discovered { address: addr("A") });
        eventually(|| radio.connects.lock().unwrap().len() == 1).await;
        assert_eq!(t.link_state("A").await, LinkState::Connecting);

        radio.emit(BleEvent::CentralConnected { address: addr("A") });
        radio.emit(BleEvent::Discovered { address: addr("A") });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(t.link_state("A").await, LinkState::Connected);
        assert_eq!(radio.connects.lock().unwrap().len(), 1);

        radio.emit(BleEvent::CentralDisconnected { address: addr("A") });
        radio.emit(BleEvent::Discovered { address: addr("A") });
        eventually(|| radio.connects.lock().unwrap().len() == 2).await;
        t.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connect_returns_to_disconnected() {
        let radio = Arc::new(FakeRadio {
            fail_connect: true,
            ..Default::default()
        });
        let (t, _rx) = transport(radio.clone());
        t.start().await.unwrap();
        radio.emit(BleEvent::Discovered { address: addr("B") });
        eventually(|| radio.connects.lock().unwrap().len() == 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(t.link_state("B").await, LinkState::Disconnected);
        assert!(t.shared.links.lock().await.is_empty());

        // A later sighting retries.
        radio.emit(BleEvent::Discovered { address: addr("B") });
        eventually(|| radio.connects.lock().unwrap().len() == 2).await;
        t.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connects_do_not_accumulate_links() {
        let radio = Arc::new(FakeRadio {
            fail_connect: true,
            ..Default::default()
        });
        let (t, _rx) = transport(radio.clone());
        t.start().await.unwrap();
        // Rotating private addresses: every sighting is a new peer.
        for i in 0..500 {
            radio.emit(BleEvent::Discovered {
                address: format!("R{i}"),
            });
        }
        eventually(|| radio.connects.lock().unwrap().len() == 500).await;
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(t.shared.links.lock().await.is_empty());
        assert!(t.peers().await.is_empty());
        t.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connect_keeps_subscriber_role() {
        let radio = Arc::new(FakeRadio {
            fail_connect: true,
            ..Default::default()
        });
        let (t, _rx) = transport(radio.clone());
        t.start().await.unwrap();
        radio.emit(BleEvent::SubscriberConnected { address: addr("S") });
        radio.emit(BleEvent::Discovered { address: addr("S") });
        eventually(|| radio.connects.lock().unwrap().len() == 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(t.peers().await, vec![Peer::new("S", TransportKind::Ble)]);
        t.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn broadcast_notify_queues_once_for_all_subscribers() {
        let radio = Arc::new(FakeRadio {
            broadcast_notify: true,
            ..Default::default()
        });
        let (t, _rx) = transport(radio.clone());
        t.start().await.unwrap();
        radio.emit(BleEvent::CentralConnected { address: addr("W") });
        radio.emit(BleEvent::SubscriberConnected { address: addr("N1") });
        radio.emit(BleEvent::SubscriberConnected { address: addr("N2") });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let payload = vec![5u8; 300];
        let report = t.send(Arc::from(payload.clone())).await.unwrap();
        assert_eq!(report, SendReport { attempted: 3, delivered: 3 });

        let chunks = (payload.len() + 4).div_ceil(BLE_CHUNK_SIZE);
        eventually(|| radio.sent.lock().unwrap().len() == 2 * chunks).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        let sent = radio.sent.lock().unwrap().clone();
        let notified = sent.iter().filter(|(_, p, _)| *p == DeliveryPath::Notify).count();
        assert_eq!(notified, chunks);
        assert!(radio.sent_to("N2").is_empty());
        assert_eq!(radio.sent_to("W").len(), chunks);
        t.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn written_chunks_are_reassembled() {
        let radio = Arc::new(FakeRadio::default());
        let (t, mut rx) = transport(radio.clone());
        t.start().await.unwrap();

        let payload: Vec<u8> = (0..500u32).map(|i| (i % 251) as u8).collect();
        radio.emit(BleEvent::SubscriberConnected { address: addr("P") });
        for chunk in frame_into_chunks(&payload, BLE_CHUNK_SIZE).unwrap() {
            radio.emit(BleEvent::WriteReceived {
                address: addr("P"),
                value: chunk,
            });
        }
        let env = rx.recv().await.unwrap();
        assert_eq!(env.payload, payload);
        assert_eq!(env.source, "P");
        assert_eq!(env.kind, TransportKind::Ble);
        t.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn notifications_use_the_same_reassembly() {
        let radio = Arc::new(FakeRadio::default());
        let (t, mut rx) = transport(radio.clone());
        t.start().await.unwrap();
        radio.emit(BleEvent::CentralConnected { address: addr("C") });
        for chunk in frame_into_chunks(b"short batch", BLE_CHUNK_SIZE).unwrap() {
            radio.emit(BleEvent::NotificationReceived {
                address: addr("C"),
                value: chunk,
            });
        }
        assert_eq!(rx.recv().await.unwrap().payload, b"short batch");
        t.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn send_picks_one_path_per_peer() {
        let radio = Arc::new(FakeRadio::default());
        let (t, _rx) = transport(radio.clone());
        t.start().await.unwrap();
        // W: central only, N: peripheral only, B: both roles.
        radio.emit(BleEvent::CentralConnected { address: addr("W") });
        radio.emit(BleEvent::SubscriberConnected { address: addr("N") });
        radio.emit(BleEvent::CentralConnected { address: addr("B") });
        radio.emit(BleEvent::SubscriberConnected { address: addr("B") });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(t.peers().await.len(), 3);

        let payload = vec![7u8; 400];
        let report = t.send(Arc::from(payload.clone())).await.unwrap();
        assert_eq!(report, SendReport { attempted: 3, delivered: 3 });

        let expected_chunks = (payload.len() + 4).div_ceil(BLE_CHUNK_SIZE);
        eventually(|| radio.sent.lock().unwrap().len() == 3 * expected_chunks).await;

        let frame = encode_frame(&payload).unwrap();
        for (peer, path) in [
            ("W", DeliveryPath::Write),
            ("N", DeliveryPath::Notify),
            ("B", DeliveryPath::Write),
        ] {
            let sent = radio.sent_to(peer);
            assert!(sent.iter().all(|(p, _)| *p == path), "peer {peer}");
            let joined: Vec<u8> = sent.into_iter().flat_map(|(_, c)| c).collect();
            assert_eq!(joined, frame);
        }
        t.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_sends_do_not_interleave_per_peer() {
        let radio = Arc::new(FakeRadio::default());
        let (t, _rx) = transport(radio.clone());
        t.start().await.unwrap();
        radio.emit(BleEvent::CentralConnected { address: addr("W") });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let first = vec![1u8; 300];
        let second = vec![2u8; 300];
        t.send(Arc::from(first.clone())).await.unwrap();
        t.send(Arc::from(second.clone())).await.unwrap();
        eventually(|| radio.sent.lock().unwrap().len() == 4).await;

        let joined: Vec<u8> = radio.sent_to("W").into_iter().flat_map(|(_, c)| c).collect();
        let mut expected = encode_frame(&first).unwrap();
        expected.extend(encode_frame(&second).unwrap());
        assert_eq!(joined, expected);
        t.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn full_disconnect_discards_partial_message() {
        let radio = Arc::new(FakeRadio::default());
        let (t, _rx) = transport(radio.clone());
        t.start().await.unwrap();
        radio.emit(BleEvent::CentralConnected { address: addr("D") });
        radio.emit(BleEvent::SubscriberConnected { address: addr("D") });
        let chunks = frame_into_chunks(&[9u8; 1000], BLE_CHUNK_SIZE).unwrap();
        radio.emit(BleEvent::WriteReceived {
            address: addr("D"),
            value: chunks[0].clone(),
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(t.shared.reassembler.lock().await.is_pending("D"));

        // One role left: partial message is kept.
        radio.emit(BleEvent::CentralDisconnected { address: addr("D") });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(t.shared.reassembler.lock().await.is_pending("D"));

        radio.emit(BleEvent::SubscriberDisconnected { address: addr("D") });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!t.shared.reassembler.lock().await.is_pending("D"));
        assert!(t.peers().await.is_empty());
        t.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_releases_radio_and_state() {
        let radio = Arc::new(FakeRadio::default());
        let (t, _rx) = transport(radio.clone());
        t.start().await.unwrap();
        radio.emit(BleEvent::SubscriberConnected { address: addr("S") });
        tokio::time::sleep(Duration::from_millis(10)).await;
        t.send(Arc::from(&b"batch"[..])).await.unwrap();

        t.stop().await;
        assert!(radio.stopped.load(Ordering::SeqCst));
        assert!(t.peers().await.is_empty());
        assert!(matches!(
            t.send(Arc::from(&b"x"[..])).await,
            Err(TransportError::NotStarted)
        ));
        // Restart after stop is allowed.
        t.start().await.unwrap();
        assert_eq!(*radio.starts.lock().unwrap(), 2);
        t.stop().await;
    }
}
