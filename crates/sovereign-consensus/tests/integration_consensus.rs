//! Integration tests for the consensus subsystem
//!
//! Large voter sets, reputation-weighted tallies and end-to-end aggregation
//! of a Byzantine-contaminated round.

use sovereign_consensus::{
    quorum_size, verify_byzantine_resilience, AggregationConfig, ConsensusCoordinator,
    Contribution, CoordinatorConfig, Proposal, RobustAggregator, Vote,
};
use sovereign_core::{ConsensusState, EventBus, ManualClock, NodeId, SovereignError};
use sovereign_crypto::{Ed25519Verifier, KeyPair, KeyedAttestor, Proof};
use sovereign_security::{
    PeerTrust, ReputationConfig, ReputationStore, UniformTrust, VerificationConfig,
    VerificationProtocol,
};
use std::sync::Arc;

fn voter(i: usize) -> NodeId {
    NodeId::new(format!("voter-{:03}", i))
}

fn coordinator(n: usize, trust: Arc<dyn PeerTrust>) -> ConsensusCoordinator {
    let c = ConsensusCoordinator::new(
        voter(0),
        CoordinatorConfig::default(),
        trust,
        EventBus::default(),
        Arc::new(ManualClock::new(0)),
    );
    c.set_voters((0..n).map(voter));
    c
}

fn open_round(c: &ConsensusCoordinator) -> Proposal {
    let proposal = Proposal::new(c.round(), voter(0), vec![0xAB; 16], Proof::default(), 7);
    c.propose(proposal.clone()).unwrap();
    proposal
}

mod two_hundred_nodes {
    use super::*;

    #[test]
    fn test_quorum_is_134() {
        let c = coordinator(200, Arc::new(UniformTrust));
        assert_eq!(c.quorum(), 134);
        assert_eq!(quorum_size(200), 134);
        // More faulty nodes than honest ones cannot be tolerated
        assert!(verify_byzantine_resilience(200, 111).is_err());
    }

    #[test]
    fn test_exact_quorum_commits() {
        let c = coordinator(200, Arc::new(UniformTrust));
        let proposal = open_round(&c);

        for i in 0..200 {
            let approve = i < 134;
            c.cast_vote(Vote::unsigned(voter(i), proposal.id, approve, 8))
                .unwrap();
        }

        let tally = c.check_consensus(&proposal.id).unwrap();
        assert!(tally.reached);
        assert_eq!(tally.votes, 200);
        assert!((tally.weighted_rejections - 66.0).abs() < 1e-9);
        assert!(c.commit(&proposal.id).is_ok());
        assert_eq!(c.state(), ConsensusState::Committed);
    }

    #[test]
    fn test_one_short_of_quorum_aborts() {
        let c = coordinator(200, Arc::new(UniformTrust));
        let proposal = open_round(&c);

        for i in 0..133 {
            c.cast_vote(Vote::unsigned(voter(i), proposal.id, true, 8))
                .unwrap();
        }

        match c.commit(&proposal.id) {
            Err(SovereignError::InsufficientQuorum { required, approvals }) => {
                assert_eq!(required, 134);
                assert!((approvals - 133.0).abs() < 1e-9);
            }
            other => panic!("expected InsufficientQuorum, got {:?}", other),
        }
        assert_eq!(c.state(), ConsensusState::Aborted);

        c.reset();
        assert_eq!(c.state(), ConsensusState::Proposing);
        assert_eq!(c.round(), 1);
    }

    #[test]
    fn test_blacklisted_approvals_do_not_count() {
        let reputation = Arc::new(ReputationStore::new(
            ReputationConfig::default(),
            Arc::new(ManualClock::new(0)),
        ));
        for i in 130..150 {
            for _ in 0..5 {
                reputation.update(&voter(i), false);
            }
        }

        let c = coordinator(200, reputation);
        let proposal = open_round(&c);
        for i in 0..150 {
            c.cast_vote(Vote::unsigned(voter(i), proposal.id, true, 8))
                .unwrap();
        }

        let tally = c.check_consensus(&proposal.id).unwrap();
        assert_eq!(tally.votes, 150);
        assert!((tally.weighted_approvals - 130.0).abs() < 1e-9);
        assert!(!tally.reached);
    }
}

mod signed_votes {
    use super::*;

    fn keys(i: usize) -> KeyPair {
        KeyPair::from_seed([i as u8 + 1; 32])
    }

    fn verifying_coordinator(n: usize) -> (ConsensusCoordinator, Arc<VerificationProtocol>) {
        let clock = Arc::new(ManualClock::new(0));
        let reputation = Arc::new(ReputationStore::new(ReputationConfig::default(), clock.clone()));
        let verification = Arc::new(VerificationProtocol::new(
            voter(0),
            VerificationConfig::default(),
            reputation,
            Arc::new(Ed25519Verifier),
            Arc::new(KeyedAttestor::from_secret(b"federation")),
            clock,
            EventBus::default(),
        ));
        for i in 0..n {
            verification.register_peer(voter(i), keys(i).public_key());
        }
        (coordinator(n, verification.clone()), verification)
    }

    #[test]
    fn test_forged_votes_do_not_discredit_claimed_voter() {
        let (c, verification) = verifying_coordinator(4);
        let proposal = open_round(&c);
        let victim = voter(1);

        for _ in 0..5 {
            let forged = Vote::unsigned(victim.clone(), proposal.id, false, 8);
            assert_eq!(
                c.cast_vote(forged),
                Err(SovereignError::InvalidSignature(victim.clone()))
            );
        }
        assert!(!verification.is_blacklisted(&victim));
        assert!((verification.reputation().score(&victim) - 1.0).abs() < 1e-12);

        for i in 0..4 {
            c.cast_vote(Vote::signed(voter(i), proposal.id, true, 9, &keys(i)))
                .unwrap();
        }
        let tally = c.check_consensus(&proposal.id).unwrap();
        assert_eq!(tally.votes, 4);
        assert!((tally.weighted_approvals - 4.0).abs() < 1e-9);
        assert!(tally.reached);
    }
}

mod aggregation {
    use super::*;

    #[test]
    fn test_honest_majority_aggregate() {
        let mut contributions: Vec<Contribution> = (0..7)
            .map(|i| Contribution::new(format!("honest-{}", i), vec![5.0 + i as f64 * 0.01; 8]))
            .collect();
        contributions.push(Contribution::new("mallory-a", vec![1e6; 8]));
        contributions.push(Contribution::new("mallory-b", vec![-1e6; 8]));
        contributions.push(Contribution::new("mallory-c", vec![1e6, -1e6, 1e6, -1e6, 1e6, -1e6, 1e6, -1e6]));

        let aggregator = RobustAggregator::new(AggregationConfig {
            byzantine_tolerance: 3,
            ..Default::default()
        });
        let result = aggregator.robust_aggregate(&contributions).unwrap();

        assert!(result.selection.outliers.contains(&7));
        assert!(result.selection.outliers.contains(&8));
        assert!(result.selection.outliers.contains(&9));
        for v in &result.vector {
            assert!((v - 5.03).abs() < 0.05);
        }
    }
}
