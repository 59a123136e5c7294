//! Engine events published to observers

use crate::fault::FaultKind;
use crate::types::{ConsensusState, NodeId, ProposalId, Round};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events emitted by the coordinator, verification layer and island manager
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EngineEvent {
    /// Consensus session changed state
    StateChange {
        round: Round,
        from: ConsensusState,
        to: ConsensusState,
    },
    /// Weighted approvals first reached quorum
    ConsensusReached { proposal_id: ProposalId, ratio: f64 },
    /// A peer misbehaved
    ByzantineFaultDetected { peer_id: NodeId, reason: FaultKind },
    /// Proposal committed and its contribution accepted
    RoundCommitted { round: Round, proposal_id: ProposalId },
    /// Round aborted without a committed result
    RoundAborted { round: Round, reason: String },
    /// Robust aggregate recomputed over the accepted set
    AggregatePublished {
        contributors: usize,
        selected: usize,
        digest: [u8; 32],
    },
    IslandModeEntered,
    IslandModeExited { queued: usize },
}

const DEFAULT_CAPACITY: usize = 1024;

/// Fan-out of engine events to any number of subscribers.
///
/// Publishing never blocks and never fails; events sent with no subscriber
/// attached are dropped, and slow subscribers observe `Lagged`.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: EngineEvent) {
        tracing::trace!(?event, "engine event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Drain every event currently buffered on a receiver
pub fn drain(rx: &mut broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    events
}
