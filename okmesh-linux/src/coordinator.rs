//! Transport lifecycle and the periodic export-and-fan-out loop.

use std::sync::Arc;
use std::time::Duration;

use okmesh_core::protocol::{DEFAULT_EXPORT_LIMIT, DEFAULT_SYNC_INTERVAL};
use okmesh_core::{IncomingPacketPipeline, MessageCore, TransportEnvelope};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::discovery::LocalDiscoveryController;
use crate::transport::Transport;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub interval: Duration,
    pub export_limit: usize,
    /// After a non-empty fan-out, mark the pending message summaries delivered.
    pub mark_delivered_after_send: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_SYNC_INTERVAL,
            export_limit: DEFAULT_EXPORT_LIMIT,
            mark_delivered_after_send: false,
        }
    }
}

pub struct TransportCoordinator {
    core: Arc<dyn MessageCore>,
    pipeline: Arc<IncomingPacketPipeline>,
    config: SyncConfig,
    /// Start order; stopped in reverse.
    transports: Vec<Arc<dyn Transport>>,
    discovery: Option<Arc<LocalDiscoveryController>>,
    inbound: Arc<Mutex<mpsc::UnboundedReceiver<TransportEnvelope>>>,
    /// Transports whose `start` succeeded this session; the only fan-out targets.
    started: Mutex<Vec<Arc<dyn Transport>>>,
    sync_task: Mutex<Option<JoinHandle<()>>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl TransportCoordinator {
    pub fn new(
        core: Arc<dyn MessageCore>,
        pipeline: Arc<IncomingPacketPipeline>,
        inbound: mpsc::UnboundedReceiver<TransportEnvelope>,
        config: SyncConfig,
    ) -> Self {
        Self {
            core,
            pipeline,
            config,
            transports: Vec::new(),
            discovery: None,
            inbound: Arc::new(Mutex::new(inbound)),
            started: Mutex::new(Vec::new()),
            sync_task: Mutex::new(None),
            event_task: Mutex::new(None),
        }
    }

    /// Add a transport; transports start in the order added.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transports.push(transport);
        self
    }

    pub fn with_discovery(mut self, discovery: Arc<LocalDiscoveryController>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Start every transport, then discovery, then the inbound and sync loops. Failures
    /// are logged per transport and never stop the rest.
    pub async fn start(self: &Arc<Self>) {
        let mut started = Vec::new();
        for transport in &self.transports {
            match transport.start().await {
                Ok(()) => {
                    info!(kind = %transport.kind(), "transport started");
                    started.push(transport.clone());
                }
                Err(e) => warn!(kind = %transport.kind(), error = %e, "transport failed to start"),
            }
        }
        *self.started.lock().await = started;

        if let Some(discovery) = &self.discovery {
            if let Err(e) = discovery.start().await {
                warn!(error = %e, "local discovery failed to start");
            }
        }

        let mut event_task = self.event_task.lock().await;
        if event_task.is_none() {
            *event_task = Some(tokio::spawn(event_loop(
                self.inbound.clone(),
                self.pipeline.clone(),
            )));
        }
        drop(event_task);

        let mut sync_task = self.sync_task.lock().await;
        if let Some(old) = sync_task.take() {
            old.abort();
        }
        let this = self.clone();
        *sync_task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                this.sync().await;
            }
        }));
    }

    /// One export-and-fan-out pass. Returns how many transports were handed the batch.
    pub async fn sync(&self) -> usize {
        let batch = self.core.export_pending_packets(self.config.export_limit);
        if batch.is_empty() {
            debug!("nothing pending");
            return 0;
        }
        let payload: Arc<[u8]> = Arc::from(batch);
        let started = self.started.lock().await.clone();
        for transport in &started {
            match transport.send(payload.clone()).await {
                Ok(report) => debug!(
                    kind = %transport.kind(),
                    attempted = report.attempted,
                    delivered = report.delivered,
                    "batch sent"
                ),
                Err(e) => warn!(kind = %transport.kind(), error = %e, "batch send failed"),
            }
        }
        if self.config.mark_delivered_after_send {
            for message in self.core.export_pending_messages(self.config.export_limit) {
                if !self.core.mark_delivered(&message.id) {
                    debug!(id = %message.id, "mark delivered refused");
                }
            }
        }
        info!(bytes = payload.len(), transports = started.len(), "sync fan-out");
        started.len()
    }

    /// Cancel the sync timer, then stop discovery and transports in reverse start order.
    /// Envelopes the transports queued before stopping are still handed to the pipeline;
    /// nothing reaches it after this returns.
    pub async fn stop(&self) {
        if let Some(task) = self.sync_task.lock().await.take() {
            task.abort();
            let _ = task.await;
        }
        if let Some(discovery) = &self.discovery {
            discovery.stop().await;
        }
        for transport in self.transports.iter().rev() {
            transport.stop().await;
        }
        self.started.lock().await.clear();
        if let Some(task) = self.event_task.lock().await.take() {
            task.abort();
            let _ = task.await;
        }
        let mut rx = self.inbound.lock().await;
        let mut drained = 0usize;
        while let Ok(envelope) = rx.try_recv() {
            self.pipeline.handle(&envelope);
            drained += 1;
        }
        if drained > 0 {
            debug!(drained, "queued inbound handled at stop");
        }
        info!("transports stopped");
    }
}

async fn event_loop(
    inbound: Arc<Mutex<mpsc::UnboundedReceiver<TransportEnvelope>>>,
    pipeline: Arc<IncomingPacketPipeline>,
) {
    let mut rx = inbound.lock().await;
    while let Some(envelope) = rx.recv().await {
        let outcome = pipeline.handle(&envelope);
        debug!(source = %envelope.source, kind = %envelope.kind, ?outcome, "inbound handled");
    }
}
