//! Message transport between nodes
//!
//! The engine only needs best-effort broadcast: messages may be lost,
//! duplicated or reordered, and duplicates are rejected by ID further up.
//! [`InMemoryNetwork`] connects any number of [`MemoryTransport`]s through a
//! single broadcast channel carrying encoded envelopes.

use async_trait::async_trait;
use sovereign_core::{NodeId, SovereignError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::message::Envelope;

/// Result of a broadcast
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Receivers the message was handed to, the sender included
    pub recipients: usize,
}

/// Best-effort broadcast to every federation peer
#[async_trait]
pub trait Transport: Send + Sync {
    async fn broadcast(&self, envelope: &Envelope) -> Result<DeliveryReport, SovereignError>;

    /// Stream of envelopes sent by other nodes
    fn subscribe(&self) -> Inbox;

    /// Whether peers are currently reachable
    fn is_connected(&self) -> bool;
}

/// Incoming envelopes for one node
pub struct Inbox {
    local: NodeId,
    rx: broadcast::Receiver<Arc<Vec<u8>>>,
    connected: Arc<AtomicBool>,
}

impl Inbox {
    /// Next envelope from another node; `None` once the network is gone.
    ///
    /// Undecodable frames are skipped, as is everything that arrives while
    /// this node is disconnected.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            let frame = match self.rx.recv().await {
                Ok(frame) => frame,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!("{} dropped {} frames", self.local, missed);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            };
            if let Some(envelope) = self.accept(&frame) {
                return Some(envelope);
            }
        }
    }

    /// Next buffered envelope, without waiting
    pub fn try_recv(&mut self) -> Option<Envelope> {
        loop {
            let frame = match self.rx.try_recv() {
                Ok(frame) => frame,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            };
            if let Some(envelope) = self.accept(&frame) {
                return Some(envelope);
            }
        }
    }

    fn accept(&self, frame: &[u8]) -> Option<Envelope> {
        if !self.connected.load(Ordering::SeqCst) {
            return None;
        }
        match Envelope::decode(frame) {
            Ok(envelope) if envelope.sender == self.local => None,
            Ok(envelope) => Some(envelope),
            Err(e) => {
                tracing::debug!("{} discarded undecodable frame: {}", self.local, e);
                None
            }
        }
    }
}

/// Shared medium for in-process nodes
#[derive(Clone)]
pub struct InMemoryNetwork {
    tx: broadcast::Sender<Arc<Vec<u8>>>,
}

impl InMemoryNetwork {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Attach a node to the network
    pub fn join(&self, local: NodeId) -> MemoryTransport {
        MemoryTransport {
            local,
            tx: self.tx.clone(),
            connected: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Inject raw bytes, bypassing any sender
    pub fn inject(&self, frame: Vec<u8>) -> usize {
        self.tx.send(Arc::new(frame)).unwrap_or(0)
    }
}

impl Default for InMemoryNetwork {
    fn default() -> Self {
        Self::new(4096)
    }
}

/// One node's attachment to an [`InMemoryNetwork`]
#[derive(Clone)]
pub struct MemoryTransport {
    local: NodeId,
    tx: broadcast::Sender<Arc<Vec<u8>>>,
    connected: Arc<AtomicBool>,
}

impl MemoryTransport {
    /// Simulate losing or regaining connectivity
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn broadcast(&self, envelope: &Envelope) -> Result<DeliveryReport, SovereignError> {
        if !self.is_connected() {
            return Err(SovereignError::Transport(format!(
                "{} is disconnected",
                self.local
            )));
        }
        let frame = Arc::new(envelope.encode()?);
        let recipients = self.tx.send(frame).unwrap_or(0);
        tracing::debug!(
            "{} broadcast {} to {} receivers",
            self.local,
            envelope.message.kind(),
            recipients
        );
        Ok(DeliveryReport { recipients })
    }

    fn subscribe(&self) -> Inbox {
        Inbox {
            local: self.local.clone(),
            rx: self.tx.subscribe(),
            connected: self.connected.clone(),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
