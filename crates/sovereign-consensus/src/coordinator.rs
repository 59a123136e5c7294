//! # Consensus Coordinator
//!
//! One propose/vote/commit session at a time.
//!
//! ## State Transitions
//!
//! ```text
//! Proposing ──propose──► Voting ──commit──► Committed
//!     │                    │  └──commit without quorum──► Aborted
//!     └────────abort───────┴──abort──────────────────────► Aborted
//!
//! reset: any state ──► Proposing (next round)
//! ```
//!
//! Votes are weighted by the voter's trust (reputation, 1.0 by default;
//! blacklisted voters weigh 0) and the proposal commits once the weighted
//! approvals reach `floor(2n/3) + 1` of the `n` known voters. The coordinator
//! never blocks: deadlines belong to the caller, which polls
//! [`ConsensusCoordinator::check_consensus`] or subscribes to the event bus and
//! calls [`ConsensusCoordinator::abort`] when time runs out.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sovereign_core::{
    ConsensusState, EngineEvent, EventBus, FaultKind, NodeId, ProposalId, Round, SharedClock,
    SovereignError,
};
use sovereign_security::PeerTrust;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::proposal::{Proposal, Vote};
use crate::quorum::quorum_size;

/// Coordinator configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Largest accepted proposal payload (bytes)
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
}

fn default_max_payload_bytes() -> usize {
    16 * 1024 * 1024
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: default_max_payload_bytes(),
        }
    }
}

/// Result of evaluating the votes on a proposal
#[derive(Clone, Debug, PartialEq)]
pub struct ConsensusTally {
    pub reached: bool,
    /// Weighted approvals over the number of known voters
    pub ratio: f64,
    pub weighted_approvals: f64,
    pub weighted_rejections: f64,
    pub votes: usize,
    pub quorum: usize,
    pub voters: usize,
}

/// Coordinator statistics
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CoordinatorStats {
    pub rounds_committed: u64,
    pub rounds_aborted: u64,
    pub votes_accepted: u64,
    pub votes_rejected: u64,
}

impl CoordinatorStats {
    pub fn total_rounds(&self) -> u64 {
        self.rounds_committed + self.rounds_aborted
    }
}

#[derive(Default)]
struct Session {
    round: Round,
    state: ConsensusState,
    proposals: HashMap<ProposalId, Proposal>,
    votes: HashMap<ProposalId, Vec<Vote>>,
    active: Option<ProposalId>,
    reached_announced: bool,
}

/// Quorum-based consensus coordinator
pub struct ConsensusCoordinator {
    local_id: NodeId,
    config: CoordinatorConfig,
    voters: RwLock<BTreeSet<NodeId>>,
    session: Mutex<Session>,
    trust: Arc<dyn PeerTrust>,
    events: EventBus,
    clock: SharedClock,
    stats: Mutex<CoordinatorStats>,
}

impl ConsensusCoordinator {
    pub fn new(
        local_id: NodeId,
        config: CoordinatorConfig,
        trust: Arc<dyn PeerTrust>,
        events: EventBus,
        clock: SharedClock,
    ) -> Self {
        Self {
            local_id,
            config,
            voters: RwLock::new(BTreeSet::new()),
            session: Mutex::new(Session::default()),
            trust,
            events,
            clock,
            stats: Mutex::new(CoordinatorStats::default()),
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    // ========================================================================
    // Voter set
    // ========================================================================

    /// Replace the known voter set
    pub fn set_voters(&self, voters: impl IntoIterator<Item = NodeId>) {
        let mut set = self.voters.write();
        *set = voters.into_iter().collect();
        tracing::info!("Voter set updated: {} voters, quorum {}", set.len(), quorum_size(set.len()));
    }

    pub fn add_voter(&self, voter: NodeId) -> bool {
        self.voters.write().insert(voter)
    }

    pub fn remove_voter(&self, voter: &NodeId) -> bool {
        self.voters.write().remove(voter)
    }

    pub fn voters(&self) -> Vec<NodeId> {
        self.voters.read().iter().cloned().collect()
    }

    pub fn voter_count(&self) -> usize {
        self.voters.read().len()
    }

    pub fn quorum(&self) -> usize {
        quorum_size(self.voter_count())
    }

    // ========================================================================
    // Session
    // ========================================================================

    pub fn state(&self) -> ConsensusState {
        self.session.lock().state
    }

    pub fn round(&self) -> Round {
        self.session.lock().round
    }

    pub fn active_proposal(&self) -> Option<Proposal> {
        let session = self.session.lock();
        session
            .active
            .and_then(|id| session.proposals.get(&id).cloned())
    }

    pub fn proposal(&self, id: &ProposalId) -> Option<Proposal> {
        self.session.lock().proposals.get(id).cloned()
    }

    pub fn votes(&self, id: &ProposalId) -> Vec<Vote> {
        self.session
            .lock()
            .votes
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn stats(&self) -> CoordinatorStats {
        self.stats.lock().clone()
    }

    fn transition(&self, session: &mut Session, to: ConsensusState) {
        let from = session.state;
        session.state = to;
        if from != to {
            tracing::info!("Round {}: {} -> {}", session.round, from, to);
            self.events.publish(EngineEvent::StateChange {
                round: session.round,
                from,
                to,
            });
        }
    }

    /// Open voting on `proposal`
    pub fn propose(&self, proposal: Proposal) -> Result<ProposalId, SovereignError> {
        let mut session = self.session.lock();
        self.open(&mut session, proposal)
    }

    /// Replace the pending proposal with a competing one for the same round.
    ///
    /// The pending proposal is aborted and its votes dropped. The round
    /// number is kept, so the replacement opens voting in the same round.
    pub fn supersede(&self, proposal: Proposal) -> Result<ProposalId, SovereignError> {
        let mut session = self.session.lock();
        if session.state != ConsensusState::Voting || proposal.round != session.round {
            return Err(SovereignError::ProtocolViolation {
                operation: "supersede",
                state: format!("{} in round {}", session.state, session.round),
            });
        }
        if session.active == Some(proposal.id) {
            return Err(SovereignError::AlreadyVoting(proposal.id));
        }
        self.validate(&proposal)?;

        let round = session.round;
        self.transition(&mut session, ConsensusState::Aborted);
        self.stats.lock().rounds_aborted += 1;
        tracing::info!("Round {}: superseded by {}", round, proposal.id);
        self.events.publish(EngineEvent::RoundAborted {
            round,
            reason: format!("superseded by {}", proposal.id),
        });

        session.proposals.clear();
        session.votes.clear();
        session.active = None;
        self.transition(&mut session, ConsensusState::Proposing);
        self.open(&mut session, proposal)
    }

    fn validate(&self, proposal: &Proposal) -> Result<(), SovereignError> {
        if !proposal.has_valid_id() {
            return Err(SovereignError::InvalidInput(format!(
                "proposal {} does not match its content",
                proposal.id
            )));
        }
        if proposal.payload.len() > self.config.max_payload_bytes {
            return Err(SovereignError::InvalidInput(format!(
                "payload of {} bytes exceeds {}",
                proposal.payload.len(),
                self.config.max_payload_bytes
            )));
        }
        Ok(())
    }

    fn open(&self, session: &mut Session, proposal: Proposal) -> Result<ProposalId, SovereignError> {
        match session.state {
            ConsensusState::Proposing => {}
            ConsensusState::Voting => {
                let active = session.active.unwrap_or_default();
                return Err(SovereignError::AlreadyVoting(active));
            }
            state => {
                return Err(SovereignError::ProtocolViolation {
                    operation: "propose",
                    state: state.to_string(),
                })
            }
        }

        if proposal.round < session.round {
            return Err(SovereignError::ProtocolViolation {
                operation: "propose",
                state: format!("stale round {} (current {})", proposal.round, session.round),
            });
        }
        self.validate(&proposal)?;

        let id = proposal.id;
        tracing::info!(
            "Round {}: proposal {} from {}",
            proposal.round,
            id,
            proposal.proposer
        );
        session.round = proposal.round;
        session.proposals.insert(id, proposal);
        session.votes.insert(id, Vec::new());
        session.active = Some(id);
        session.reached_announced = false;
        self.transition(session, ConsensusState::Voting);
        Ok(id)
    }

    /// Record a vote on the pending proposal
    pub fn cast_vote(&self, vote: Vote) -> Result<(), SovereignError> {
        let result = self.record_vote(vote);
        let mut stats = self.stats.lock();
        if result.is_ok() {
            stats.votes_accepted += 1;
        } else {
            stats.votes_rejected += 1;
        }
        result
    }

    fn record_vote(&self, vote: Vote) -> Result<(), SovereignError> {
        let mut session = self.session.lock();

        if session.state != ConsensusState::Voting {
            return Err(SovereignError::NotVoting {
                state: session.state,
            });
        }
        if !session.proposals.contains_key(&vote.proposal_id) {
            return Err(SovereignError::UnknownProposal(vote.proposal_id));
        }
        if !self.voters.read().contains(&vote.voter) {
            return Err(SovereignError::UnknownVoter(vote.voter));
        }

        self.trust
            .authenticate(&vote.voter, &vote.signing_data(), &vote.signature)?;

        let votes = session.votes.entry(vote.proposal_id).or_default();
        if let Some(existing) = votes.iter().find(|v| v.voter == vote.voter) {
            // A retransmission is harmless; a changed decision is equivocation
            if !existing.same_decision(&vote) {
                tracing::warn!(
                    "Conflicting vote from {} on proposal {}",
                    vote.voter,
                    vote.proposal_id
                );
                self.trust.report_fault(&vote.voter, FaultKind::DuplicateVote);
            }
            return Err(SovereignError::DuplicateVote {
                voter: vote.voter,
                proposal: vote.proposal_id,
            });
        }

        tracing::debug!(
            "Vote from {} on {}: {}",
            vote.voter,
            vote.proposal_id,
            if vote.approve { "approve" } else { "reject" }
        );
        let proposal_id = vote.proposal_id;
        votes.push(vote);

        let tally = self.tally(&session, &proposal_id);
        if tally.reached && !session.reached_announced {
            session.reached_announced = true;
            tracing::info!(
                "Consensus reached on {} ({:.2} of {} voters)",
                proposal_id,
                tally.weighted_approvals,
                tally.voters
            );
            self.events.publish(EngineEvent::ConsensusReached {
                proposal_id,
                ratio: tally.ratio,
            });
        }
        Ok(())
    }

    fn tally(&self, session: &Session, id: &ProposalId) -> ConsensusTally {
        let voters = self.voters.read();
        let n = voters.len();
        let quorum = quorum_size(n);

        let mut approvals = 0.0;
        let mut rejections = 0.0;
        let mut count = 0;
        for vote in session.votes.get(id).into_iter().flatten() {
            if !voters.contains(&vote.voter) {
                continue;
            }
            count += 1;
            let weight = self.trust.vote_weight(&vote.voter).max(0.0);
            if vote.approve {
                approvals += weight;
            } else {
                rejections += weight;
            }
        }

        let ratio = if n == 0 { 0.0 } else { approvals / n as f64 };
        ConsensusTally {
            reached: n > 0 && approvals >= quorum as f64,
            ratio,
            weighted_approvals: approvals,
            weighted_rejections: rejections,
            votes: count,
            quorum,
            voters: n,
        }
    }

    /// Evaluate the votes on `id`
    pub fn check_consensus(&self, id: &ProposalId) -> Result<ConsensusTally, SovereignError> {
        let session = self.session.lock();
        if !session.proposals.contains_key(id) {
            return Err(SovereignError::UnknownProposal(*id));
        }
        Ok(self.tally(&session, id))
    }

    /// Commit `id` if it reached quorum, otherwise abort the round
    pub fn commit(&self, id: &ProposalId) -> Result<Proposal, SovereignError> {
        let mut session = self.session.lock();

        if session.state != ConsensusState::Voting {
            return Err(SovereignError::ProtocolViolation {
                operation: "commit",
                state: session.state.to_string(),
            });
        }
        let Some(proposal) = session.proposals.get(id).cloned() else {
            return Err(SovereignError::UnknownProposal(*id));
        };

        let tally = self.tally(&session, id);
        let round = session.round;
        if tally.reached {
            self.transition(&mut session, ConsensusState::Committed);
            self.stats.lock().rounds_committed += 1;
            self.events.publish(EngineEvent::RoundCommitted {
                round,
                proposal_id: *id,
            });
            Ok(proposal)
        } else {
            self.transition(&mut session, ConsensusState::Aborted);
            self.stats.lock().rounds_aborted += 1;
            tracing::warn!(
                "Round {} aborted: {:.2} weighted approvals, quorum {}",
                round,
                tally.weighted_approvals,
                tally.quorum
            );
            self.events.publish(EngineEvent::RoundAborted {
                round,
                reason: "insufficient quorum".to_string(),
            });
            Err(SovereignError::InsufficientQuorum {
                required: tally.quorum,
                approvals: tally.weighted_approvals,
            })
        }
    }

    /// Abandon the round being voted on, e.g. on deadline expiry
    pub fn abort(&self, reason: &str) -> Result<(), SovereignError> {
        let mut session = self.session.lock();
        if session.state != ConsensusState::Voting {
            return Err(SovereignError::ProtocolViolation {
                operation: "abort",
                state: session.state.to_string(),
            });
        }

        let round = session.round;
        self.transition(&mut session, ConsensusState::Aborted);
        self.stats.lock().rounds_aborted += 1;
        tracing::warn!("Round {} aborted: {}", round, reason);
        self.events.publish(EngineEvent::RoundAborted {
            round,
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// Clear proposals and votes and start the next round
    pub fn reset(&self) {
        let mut session = self.session.lock();
        session.proposals.clear();
        session.votes.clear();
        session.active = None;
        session.reached_announced = false;
        session.round += 1;
        self.transition(&mut session, ConsensusState::Proposing);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sovereign_core::events::drain;
    use sovereign_core::ManualClock;
    use sovereign_crypto::Proof;
    use sovereign_security::{ReputationConfig, ReputationStore, UniformTrust};

    fn coordinator_with(trust: Arc<dyn PeerTrust>, voters: usize) -> (ConsensusCoordinator, EventBus) {
        let events = EventBus::default();
        let coordinator = ConsensusCoordinator::new(
            NodeId::from("node-0"),
            CoordinatorConfig::default(),
            trust,
            events.clone(),
            Arc::new(ManualClock::new(0)),
        );
        coordinator.set_voters((0..voters).map(|i| NodeId::new(format!("node-{}", i))));
        (coordinator, events)
    }

    fn coordinator(voters: usize) -> (ConsensusCoordinator, EventBus) {
        coordinator_with(Arc::new(UniformTrust), voters)
    }

    fn proposal(round: Round) -> Proposal {
        Proposal::new(round, NodeId::from("node-0"), vec![1, 2, 3], Proof::default(), 42)
    }

    fn vote(voter: usize, id: ProposalId, approve: bool) -> Vote {
        Vote::unsigned(NodeId::new(format!("node-{}", voter)), id, approve, 43)
    }

    #[test]
    fn test_propose_enters_voting() {
        let (c, events) = coordinator(4);
        let mut rx = events.subscribe();
        assert_eq!(c.state(), ConsensusState::Proposing);

        let id = c.propose(proposal(0)).unwrap();
        assert_eq!(c.state(), ConsensusState::Voting);
        assert_eq!(c.active_proposal().unwrap().id, id);
        assert_eq!(
            drain(&mut rx),
            vec![EngineEvent::StateChange {
                round: 0,
                from: ConsensusState::Proposing,
                to: ConsensusState::Voting,
            }]
        );
    }

    #[test]
    fn test_second_proposal_rejected() {
        let (c, _) = coordinator(4);
        let id = c.propose(proposal(0)).unwrap();
        let other = Proposal::new(0, NodeId::from("node-1"), vec![9], Proof::default(), 1);
        assert_eq!(c.propose(other), Err(SovereignError::AlreadyVoting(id)));
    }

    #[test]
    fn test_quorum_commit() {
        let (c, events) = coordinator(4);
        let mut rx = events.subscribe();
        let id = c.propose(proposal(0)).unwrap();

        c.cast_vote(vote(0, id, true)).unwrap();
        c.cast_vote(vote(1, id, true)).unwrap();
        assert!(!c.check_consensus(&id).unwrap().reached);

        c.cast_vote(vote(2, id, true)).unwrap();
        let tally = c.check_consensus(&id).unwrap();
        assert!(tally.reached);
        assert_eq!(tally.quorum, 3);
        assert!((tally.ratio - 0.75).abs() < 1e-12);

        let committed = c.commit(&id).unwrap();
        assert_eq!(committed.id, id);
        assert_eq!(c.state(), ConsensusState::Committed);
        assert_eq!(c.stats().rounds_committed, 1);

        let events = drain(&mut rx);
        assert!(events.contains(&EngineEvent::ConsensusReached {
            proposal_id: id,
            ratio: 0.75
        }));
        assert!(events.contains(&EngineEvent::RoundCommitted {
            round: 0,
            proposal_id: id
        }));
    }

    #[test]
    fn test_consensus_reached_announced_once() {
        let (c, events) = coordinator(4);
        let mut rx = events.subscribe();
        let id = c.propose(proposal(0)).unwrap();
        for i in 0..4 {
            c.cast_vote(vote(i, id, true)).unwrap();
        }
        let reached = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, EngineEvent::ConsensusReached { .. }))
            .count();
        assert_eq!(reached, 1);
    }

    #[test]
    fn test_commit_without_quorum_aborts() {
        let (c, _) = coordinator(4);
        let id = c.propose(proposal(0)).unwrap();
        c.cast_vote(vote(0, id, true)).unwrap();
        c.cast_vote(vote(1, id, false)).unwrap();

        let err = c.commit(&id).unwrap_err();
        assert!(matches!(err, SovereignError::InsufficientQuorum { required: 3, .. }));
        assert!(err.is_recoverable());
        assert_eq!(c.state(), ConsensusState::Aborted);

        // Read-only until reset
        assert!(matches!(
            c.cast_vote(vote(2, id, true)),
            Err(SovereignError::NotVoting {
                state: ConsensusState::Aborted
            })
        ));
        assert!(matches!(
            c.propose(proposal(0)),
            Err(SovereignError::ProtocolViolation { .. })
        ));
    }

    #[test]
    fn test_duplicate_vote_keeps_original() {
        let (c, _) = coordinator(4);
        let id = c.propose(proposal(0)).unwrap();
        c.cast_vote(vote(1, id, true)).unwrap();

        let err = c.cast_vote(vote(1, id, false)).unwrap_err();
        assert!(matches!(err, SovereignError::DuplicateVote { .. }));

        let votes = c.votes(&id);
        assert_eq!(votes.len(), 1);
        assert!(votes[0].approve);
        assert_eq!(c.stats().votes_rejected, 1);
    }

    #[test]
    fn test_vote_validation() {
        let (c, _) = coordinator(4);
        let stray = ProposalId::new([7u8; 32]);
        assert!(matches!(
            c.cast_vote(vote(0, stray, true)),
            Err(SovereignError::NotVoting { .. })
        ));

        let id = c.propose(proposal(0)).unwrap();
        assert_eq!(
            c.cast_vote(vote(0, stray, true)),
            Err(SovereignError::UnknownProposal(stray))
        );
        assert_eq!(
            c.cast_vote(vote(9, id, true)),
            Err(SovereignError::UnknownVoter(NodeId::from("node-9")))
        );
    }

    #[test]
    fn test_blacklisted_votes_weigh_zero() {
        let reputation = Arc::new(ReputationStore::new(
            ReputationConfig::default(),
            Arc::new(ManualClock::new(0)),
        ));
        for _ in 0..5 {
            reputation.update(&NodeId::from("node-3"), false);
        }
        let (c, _) = coordinator_with(reputation, 4);
        let id = c.propose(proposal(0)).unwrap();

        c.cast_vote(vote(0, id, true)).unwrap();
        c.cast_vote(vote(1, id, true)).unwrap();
        // Accepted silently but contributes nothing
        c.cast_vote(vote(3, id, true)).unwrap();

        let tally = c.check_consensus(&id).unwrap();
        assert_eq!(tally.votes, 3);
        assert!((tally.weighted_approvals - 2.0).abs() < 1e-12);
        assert!(!tally.reached);

        c.cast_vote(vote(2, id, true)).unwrap();
        assert!(c.check_consensus(&id).unwrap().reached);
    }

    #[test]
    fn test_abort_and_reset() {
        let (c, events) = coordinator(3);
        let mut rx = events.subscribe();
        c.propose(proposal(0)).unwrap();

        c.abort("deadline").unwrap();
        assert_eq!(c.state(), ConsensusState::Aborted);
        assert!(c.abort("again").is_err());

        c.reset();
        assert_eq!(c.state(), ConsensusState::Proposing);
        assert_eq!(c.round(), 1);
        assert!(c.active_proposal().is_none());

        let events = drain(&mut rx);
        assert!(events.contains(&EngineEvent::RoundAborted {
            round: 0,
            reason: "deadline".to_string()
        }));
        assert!(events.contains(&EngineEvent::StateChange {
            round: 1,
            from: ConsensusState::Aborted,
            to: ConsensusState::Proposing,
        }));
    }

    #[test]
    fn test_abort_requires_voting() {
        let (c, _) = coordinator(3);
        assert!(matches!(
            c.abort("early"),
            Err(SovereignError::ProtocolViolation { operation: "abort", .. })
        ));
        assert_eq!(c.state(), ConsensusState::Proposing);
        assert_eq!(c.stats().rounds_aborted, 0);
    }

    #[test]
    fn test_supersede_within_round() {
        let (c, events) = coordinator(4);
        let first = c.propose(proposal(0)).unwrap();
        c.cast_vote(vote(1, first, true)).unwrap();
        let mut rx = events.subscribe();

        let rival = Proposal::new(0, NodeId::from("node-1"), vec![9], Proof::default(), 1);
        let id = c.supersede(rival.clone()).unwrap();
        assert_eq!(id, rival.id);
        assert_eq!(c.round(), 0);
        assert_eq!(c.state(), ConsensusState::Voting);
        assert_eq!(c.active_proposal().unwrap().id, id);
        assert!(c.votes(&first).is_empty());
        assert_eq!(
            c.cast_vote(vote(1, first, true)),
            Err(SovereignError::UnknownProposal(first))
        );
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, EngineEvent::RoundAborted { round: 0, .. })));

        assert!(matches!(
            c.supersede(proposal(1)),
            Err(SovereignError::ProtocolViolation { operation: "supersede", .. })
        ));
        assert_eq!(c.supersede(rival), Err(SovereignError::AlreadyVoting(id)));
    }

    #[test]
    fn test_commit_requires_voting() {
        let (c, _) = coordinator(3);
        let id = proposal(0).id;
        assert!(matches!(
            c.commit(&id),
            Err(SovereignError::ProtocolViolation { operation: "commit", .. })
        ));
    }

    #[test]
    fn test_stale_and_forged_proposals() {
        let (c, _) = coordinator(3);
        c.reset();
        c.reset();
        assert!(matches!(
            c.propose(proposal(1)),
            Err(SovereignError::ProtocolViolation { .. })
        ));

        let mut forged = proposal(2);
        forged.payload.push(0);
        assert!(matches!(
            c.propose(forged),
            Err(SovereignError::InvalidInput(_))
        ));

        // A later round is adopted from the proposer
        c.propose(proposal(5)).unwrap();
        assert_eq!(c.round(), 5);
    }

    #[test]
    fn test_no_voters_never_reaches() {
        let (c, _) = coordinator(0);
        let id = c.propose(proposal(0)).unwrap();
        let tally = c.check_consensus(&id).unwrap();
        assert!(!tally.reached);
        assert_eq!(tally.ratio, 0.0);
    }
}
