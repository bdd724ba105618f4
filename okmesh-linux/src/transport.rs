//! Transport seam: every payload-carrying channel is started, fed batches, and stopped
//! through this trait.

use std::sync::Arc;

use async_trait::async_trait;
use okmesh_core::{FrameEncodeError, TransportKind};

/// Outcome of one `send`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendReport {
    /// Destinations the batch was addressed to.
    pub attempted: usize,
    /// Destinations that accepted it (UDP: datagram sent; BLE: queued for pacing).
    pub delivered: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("transport not started")]
    NotStarted,
    #[error("radio error: {0}")]
    Radio(String),
    #[error("framing failed: {0}")]
    Frame(#[from] FrameEncodeError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A channel that can carry opaque packet batches. Failures stay inside the transport and
/// come back as values; none of these calls may panic the sync loop.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Bring the transport up. An error leaves it inert; the caller logs and moves on.
    async fn start(&self) -> Result<(), TransportError>;

    /// Release sockets, links, and workers. No inbound envelope is produced after return.
    async fn stop(&self);

    /// Deliver `payload` over every viable destination. Safe to call concurrently.
    async fn send(&self, payload: Arc<[u8]>) -> Result<SendReport, TransportError>;
}
