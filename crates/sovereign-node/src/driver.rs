//! Round driver
//!
//! Owns the caller side of the consensus round: proposing, collecting votes
//! under a deadline, aborting and retrying. The coordinator itself never
//! blocks or times out.

use async_trait::async_trait;
use parking_lot::Mutex;
use sovereign_consensus::{AggregationEpoch, Proposal, Vote};
use sovereign_core::{ConsensusState, EngineEvent, EventBus, NodeId, ProposalId, SovereignError};
use sovereign_crypto::Proof;
use sovereign_island::SubmissionBackend;
use sovereign_security::ReputationStore;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::config::RoundConfig;
use crate::message::{Envelope, NetworkMessage};
use crate::transport::Transport;

enum RoundOutcome {
    Committed,
    /// Another proposal took the round and has since resolved
    Displaced,
}

pub struct RoundDriver {
    local_id: NodeId,
    epoch: Arc<AggregationEpoch>,
    reputation: Arc<ReputationStore>,
    transport: Arc<dyn Transport>,
    events: EventBus,
    config: RoundConfig,
    /// Serializes commit decisions between the message loop and deadlines
    finalize_lock: Mutex<()>,
}

impl RoundDriver {
    pub fn new(
        local_id: NodeId,
        epoch: Arc<AggregationEpoch>,
        reputation: Arc<ReputationStore>,
        transport: Arc<dyn Transport>,
        events: EventBus,
        config: RoundConfig,
    ) -> Self {
        Self {
            local_id,
            epoch,
            reputation,
            transport,
            events,
            config,
            finalize_lock: Mutex::new(()),
        }
    }

    pub fn epoch(&self) -> &Arc<AggregationEpoch> {
        &self.epoch
    }

    async fn send(&self, message: NetworkMessage) -> Result<(), SovereignError> {
        let envelope = Envelope::new(self.local_id.clone(), message);
        self.transport.broadcast(&envelope).await?;
        Ok(())
    }

    /// Propose `payload` and drive it to commit.
    ///
    /// Each attempt waits `deadline` for quorum, then aborts and starts over
    /// from a fresh round. After `max_attempts` the last shortfall is
    /// returned as `InsufficientQuorum`.
    pub async fn run_round(
        &self,
        payload: Vec<u8>,
        proof: Proof,
    ) -> Result<ProposalId, SovereignError> {
        let coordinator = self.epoch.coordinator();
        let mut shortfall = SovereignError::InsufficientQuorum {
            required: coordinator.quorum(),
            approvals: 0.0,
        };

        for attempt in 1..=self.config.max_attempts {
            let mut rx = self.events.subscribe();
            let proposal = self.open_local(payload.clone(), proof.clone())?;
            let id = proposal.id;
            tracing::info!(
                "Round {} attempt {}/{}: proposing {}",
                proposal.round,
                attempt,
                self.config.max_attempts,
                id
            );

            if let Err(e) = self.send(NetworkMessage::Proposal(proposal.clone())).await {
                self.abandon(&id, "proposal broadcast failed");
                return Err(e);
            }
            let vote = self.epoch.review(&proposal);
            if let Err(e) = self.on_vote(vote.clone()) {
                // A competing proposal may already have displaced ours
                tracing::debug!("Own vote on {} not counted: {}", id, e);
            }
            if let Err(e) = self.send(NetworkMessage::Vote(vote)).await {
                self.abandon(&id, "vote broadcast failed");
                return Err(e);
            }

            let waited =
                tokio::time::timeout(self.config.deadline(), self.await_round(&mut rx, id)).await;
            match waited {
                Ok(Ok(RoundOutcome::Committed)) => return Ok(id),
                Ok(Ok(RoundOutcome::Displaced)) => {
                    tracing::info!("Proposal {} lost its round to a competing proposal", id);
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => match self.expire(&id, &mut rx) {
                    None => return Ok(id),
                    Some(err) => {
                        tracing::warn!(
                            "Round for {} missed its deadline (attempt {}): {}",
                            id,
                            attempt,
                            err
                        );
                        shortfall = err;
                    }
                },
            }
        }
        Err(shortfall)
    }

    /// Open voting on a local proposal, displacing whatever session is pending
    fn open_local(&self, payload: Vec<u8>, proof: Proof) -> Result<Proposal, SovereignError> {
        let _guard = self.finalize_lock.lock();
        let coordinator = self.epoch.coordinator();
        match coordinator.state() {
            ConsensusState::Proposing => {}
            ConsensusState::Committed | ConsensusState::Aborted => self.epoch.next_round(),
            ConsensusState::Voting => {
                coordinator.abort("superseded by local proposal")?;
                self.epoch.next_round();
            }
        }
        self.epoch.propose_contribution(payload, proof)
    }

    /// Wait for `id` to commit, or for a competing proposal that displaced
    /// it to resolve
    async fn await_round(
        &self,
        rx: &mut broadcast::Receiver<EngineEvent>,
        id: ProposalId,
    ) -> Result<RoundOutcome, SovereignError> {
        loop {
            match rx.recv().await {
                Ok(EngineEvent::RoundCommitted { proposal_id, .. }) if proposal_id == id => {
                    return Ok(RoundOutcome::Committed)
                }
                Ok(EngineEvent::RoundCommitted { .. }) | Ok(EngineEvent::RoundAborted { .. }) => {
                    let coordinator = self.epoch.coordinator();
                    let displaced = coordinator.active_proposal().map(|p| p.id) != Some(id);
                    if displaced && coordinator.state() != ConsensusState::Voting {
                        return Ok(RoundOutcome::Displaced);
                    }
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(SovereignError::Internal("event bus closed".to_string()))
                }
            }
        }
    }

    /// Resolve a missed deadline: `None` if the commit raced the timer,
    /// otherwise abort and return the shortfall.
    fn expire(
        &self,
        id: &ProposalId,
        rx: &mut broadcast::Receiver<EngineEvent>,
    ) -> Option<SovereignError> {
        let _guard = self.finalize_lock.lock();
        let committed = sovereign_core::events::drain(rx).iter().any(|e| {
            matches!(e, EngineEvent::RoundCommitted { proposal_id, .. } if proposal_id == id)
        });
        if committed {
            return None;
        }

        let coordinator = self.epoch.coordinator();
        let approvals = coordinator
            .check_consensus(id)
            .map(|tally| tally.weighted_approvals)
            .unwrap_or(0.0);
        // A competing proposal may have superseded ours already
        if coordinator.active_proposal().map(|p| p.id) == Some(*id) {
            if coordinator.state() == ConsensusState::Voting {
                if let Err(e) = coordinator.abort("deadline exceeded") {
                    tracing::warn!("Failed to abort round: {}", e);
                }
            }
            self.epoch.next_round();
        }
        Some(SovereignError::InsufficientQuorum {
            required: coordinator.quorum(),
            approvals,
        })
    }

    fn abandon(&self, id: &ProposalId, reason: &str) {
        let _guard = self.finalize_lock.lock();
        let coordinator = self.epoch.coordinator();
        if coordinator.active_proposal().map(|p| p.id) == Some(*id)
            && coordinator.state() == ConsensusState::Voting
        {
            if let Err(e) = coordinator.abort(reason) {
                tracing::warn!("Failed to abort round: {}", e);
            }
            self.epoch.next_round();
        }
    }

    /// Review a peer's proposal, record and broadcast this node's vote
    pub async fn on_proposal(&self, proposal: Proposal) -> Result<Vote, SovereignError> {
        let vote = self.admit_remote(proposal)?;
        self.on_vote(vote.clone())?;
        self.send(NetworkMessage::Vote(vote.clone())).await?;
        Ok(vote)
    }

    /// Open voting on a peer's proposal.
    ///
    /// A proposal for a later round replaces a stale session. Within one
    /// round the acceptable proposal with the lowest ID wins, so nodes that
    /// propose concurrently converge on the same one.
    fn admit_remote(&self, proposal: Proposal) -> Result<Vote, SovereignError> {
        let _guard = self.finalize_lock.lock();
        let coordinator = self.epoch.coordinator();
        match coordinator.state() {
            ConsensusState::Committed | ConsensusState::Aborted => self.epoch.next_round(),
            ConsensusState::Voting if proposal.round > coordinator.round() => {
                coordinator.abort(&format!("superseded by round {}", proposal.round))?;
                self.epoch.next_round();
            }
            ConsensusState::Voting if proposal.round == coordinator.round() => {
                let wins = coordinator
                    .active_proposal()
                    .map_or(false, |active| proposal.id < active.id);
                if wins && self.epoch.assess(&proposal).is_ok() {
                    coordinator.supersede(proposal.clone())?;
                    return Ok(self.epoch.review(&proposal));
                }
            }
            ConsensusState::Voting | ConsensusState::Proposing => {}
        }
        self.epoch.receive_proposal(proposal)
    }

    /// Record a vote and commit once it completes the quorum
    pub fn on_vote(&self, vote: Vote) -> Result<(), SovereignError> {
        let id = vote.proposal_id;
        self.epoch.coordinator().cast_vote(vote)?;
        self.try_finalize(&id)?;
        Ok(())
    }

    /// Commit `id` if it is the active proposal and has reached quorum
    pub fn try_finalize(&self, id: &ProposalId) -> Result<bool, SovereignError> {
        let _guard = self.finalize_lock.lock();
        let coordinator = self.epoch.coordinator();
        if coordinator.state() != ConsensusState::Voting
            || coordinator.active_proposal().map(|p| p.id) != Some(*id)
        {
            return Ok(false);
        }
        if !coordinator.check_consensus(id)?.reached {
            return Ok(false);
        }

        self.epoch.finalize(id)?;
        self.epoch.next_round();
        if let Err(e) = self.reputation.persist() {
            tracing::warn!("Failed to persist reputation records: {}", e);
        }
        Ok(true)
    }
}

#[async_trait]
impl SubmissionBackend for RoundDriver {
    async fn submit(&self, payload: Vec<u8>, proof: Proof) -> Result<ProposalId, SovereignError> {
        self.run_round(payload, proof).await
    }
}
