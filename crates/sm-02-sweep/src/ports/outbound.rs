//! Driven Ports (SPI - Outbound Dependencies)
//!
//! The sweep engine never waits on a remote reply inline. Programming
//! requests are handed to `MadTransport::submit` and their outcomes come back
//! later through a `CompletionSink`, one `Completion` per transaction.

use async_trait::async_trait;
use fabric_types::{
    Completion, DiscoveryReport, Guid, MadRequest, SmCandidate, SmRole, TransactionId,
    TransportError,
};
use tokio::sync::mpsc;

/// Fabric discovery: one full walk of the fabric per call.
#[async_trait]
pub trait FabricDiscovery: Send + Sync {
    async fn discover(&self) -> Result<DiscoveryReport, TransportError>;
}

/// Management-datagram transport.
///
/// `submit` must return without waiting for the target. Exactly one
/// completion is expected per accepted request; a rejected submit produces
/// none.
pub trait MadTransport: Send + Sync {
    fn submit(&self, id: TransactionId, request: MadRequest) -> Result<(), TransportError>;
}

/// Another subnet manager instance as seen on the fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerInfo {
    pub candidate: SmCandidate,
    pub role: SmRole,
}

impl PeerInfo {
    pub fn new(guid: Guid, priority: u8, role: SmRole) -> Self {
        Self {
            candidate: SmCandidate::new(guid, priority),
            role,
        }
    }
}

/// Communication with peer subnet managers.
#[async_trait]
pub trait SmPeers: Send + Sync {
    /// Every other SM instance currently reachable.
    async fn discover_peers(&self) -> Result<Vec<PeerInfo>, TransportError>;

    /// Whether `master` still answers as master.
    async fn poll_master(&self, master: Guid) -> Result<bool, TransportError>;

    /// Transfer mastership to `to`.
    async fn send_handover(&self, to: Guid) -> Result<(), TransportError>;
}

/// Delivery path for transaction outcomes, held by the transport.
#[derive(Debug, Clone)]
pub struct CompletionSink {
    tx: mpsc::UnboundedSender<Completion>,
}

/// Receiving end of a `CompletionSink`, owned by the sweep engine.
pub type CompletionStream = mpsc::UnboundedReceiver<Completion>;

impl CompletionSink {
    /// Report one outcome. Returns false once the engine has stopped.
    pub fn complete(&self, completion: Completion) -> bool {
        self.tx.send(completion).is_ok()
    }
}

/// Create a linked sink/stream pair.
pub fn completion_channel() -> (CompletionSink, CompletionStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (CompletionSink { tx }, rx)
}
