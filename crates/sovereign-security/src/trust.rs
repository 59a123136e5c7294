//! Trust seam consumed by the consensus coordinator

use sovereign_core::{FaultKind, NodeId, SovereignError};
use sovereign_crypto::Signature;

use crate::reputation::ReputationStore;
use crate::verification::VerificationProtocol;

/// How the coordinator weighs and authenticates voters
pub trait PeerTrust: Send + Sync {
    /// Weight of the peer's vote; zero excludes it from the tally
    fn vote_weight(&self, peer: &NodeId) -> f64;

    fn is_blacklisted(&self, peer: &NodeId) -> bool {
        self.vote_weight(peer) <= 0.0
    }

    /// Check the peer's signature over `message`
    fn authenticate(
        &self,
        peer: &NodeId,
        message: &[u8],
        signature: &Signature,
    ) -> Result<(), SovereignError>;

    /// Feed a protocol outcome back into the peer's reputation
    fn record_outcome(&self, peer: &NodeId, success: bool);

    fn report_fault(&self, peer: &NodeId, reason: FaultKind);
}

impl PeerTrust for VerificationProtocol {
    fn vote_weight(&self, peer: &NodeId) -> f64 {
        self.reputation().vote_weight(peer)
    }

    fn is_blacklisted(&self, peer: &NodeId) -> bool {
        VerificationProtocol::is_blacklisted(self, peer)
    }

    fn authenticate(
        &self,
        peer: &NodeId,
        message: &[u8],
        signature: &Signature,
    ) -> Result<(), SovereignError> {
        self.verify_signature(peer, message, signature)
    }

    fn record_outcome(&self, peer: &NodeId, success: bool) {
        self.reputation().update(peer, success);
    }

    fn report_fault(&self, peer: &NodeId, reason: FaultKind) {
        VerificationProtocol::report_fault(self, peer, reason)
    }
}

/// Reputation-weighted trust without signature checks
///
/// For deployments where votes arrive over an already authenticated channel.
impl PeerTrust for ReputationStore {
    fn vote_weight(&self, peer: &NodeId) -> f64 {
        ReputationStore::vote_weight(self, peer)
    }

    fn is_blacklisted(&self, peer: &NodeId) -> bool {
        ReputationStore::is_blacklisted(self, peer)
    }

    fn authenticate(&self, _: &NodeId, _: &[u8], _: &Signature) -> Result<(), SovereignError> {
        Ok(())
    }

    fn record_outcome(&self, peer: &NodeId, success: bool) {
        self.update(peer, success);
    }

    fn report_fault(&self, peer: &NodeId, reason: FaultKind) {
        tracing::warn!("Byzantine fault from {}: {}", peer, reason);
        if reason.penalizes() {
            self.update(peer, false);
        }
    }
}

/// Every peer weighs 1.0 and every signature is accepted
#[derive(Clone, Copy, Debug, Default)]
pub struct UniformTrust;

impl PeerTrust for UniformTrust {
    fn vote_weight(&self, _: &NodeId) -> f64 {
        sovereign_core::constants::DEFAULT_VOTE_WEIGHT
    }

    fn authenticate(&self, _: &NodeId, _: &[u8], _: &Signature) -> Result<(), SovereignError> {
        Ok(())
    }

    fn record_outcome(&self, _: &NodeId, _: bool) {}

    fn report_fault(&self, _: &NodeId, _: FaultKind) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reputation::ReputationConfig;
    use sovereign_core::ManualClock;
    use std::sync::Arc;

    #[test]
    fn test_uniform_trust() {
        let trust = UniformTrust;
        let peer = NodeId::from("anyone");
        assert_eq!(trust.vote_weight(&peer), 1.0);
        assert!(!trust.is_blacklisted(&peer));
        assert!(trust.authenticate(&peer, b"m", &Signature::empty()).is_ok());
    }

    #[test]
    fn test_reputation_trust_blacklists() {
        let store = ReputationStore::new(ReputationConfig::default(), Arc::new(ManualClock::new(0)));
        let trust: &dyn PeerTrust = &store;
        let peer = NodeId::from("mallory");

        for _ in 0..5 {
            trust.report_fault(&peer, FaultKind::InvalidProof);
        }
        assert!(trust.is_blacklisted(&peer));
        assert_eq!(trust.vote_weight(&peer), 0.0);
    }
}
