//! Challenge/response peer verification
//!
//! A challenge carries a fresh random nonce and is answered by signing it with
//! the target's registered key. Challenges are single use, expire after a
//! time-to-live and fail closed: anything short of a valid, timely signature
//! from the challenged peer counts as a failed challenge.

use parking_lot::{Mutex, RwLock};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sovereign_core::constants::NONCE_SIZE;
use sovereign_core::{
    EngineEvent, EventBus, FaultKind, NodeId, SharedClock, SovereignError, Timestamp,
};
use sovereign_crypto::{
    AttestationService, IncrementalHasher, Proof, PublicKey, Signature, SignatureService,
    SignatureVerifier,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use crate::reputation::ReputationStore;

/// Verification configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VerificationConfig {
    /// Challenge time-to-live (milliseconds)
    #[serde(default = "default_challenge_ttl_ms")]
    pub challenge_ttl_ms: i64,
    /// Outstanding challenges kept before new ones are refused
    #[serde(default = "default_max_pending")]
    pub max_pending_challenges: usize,
    /// Answered challenge IDs remembered for replay detection
    #[serde(default = "default_consumed_history")]
    pub consumed_history: usize,
}

fn default_challenge_ttl_ms() -> i64 {
    30_000
}

fn default_max_pending() -> usize {
    1024
}

fn default_consumed_history() -> usize {
    4096
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            challenge_ttl_ms: default_challenge_ttl_ms(),
            max_pending_challenges: default_max_pending(),
            consumed_history: default_consumed_history(),
        }
    }
}

/// ChallengeId = BLAKE3(domain || nonce || target || issuer || timestamp)
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChallengeId([u8; 32]);

impl ChallengeId {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ChallengeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChallengeId({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for ChallengeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

/// Liveness/identity challenge sent to a peer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    pub id: ChallengeId,
    pub nonce: [u8; NONCE_SIZE],
    pub timestamp: Timestamp,
    pub target: NodeId,
    pub issuer: NodeId,
}

impl Challenge {
    fn new(issuer: NodeId, target: NodeId, timestamp: Timestamp) -> Self {
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let mut hasher = IncrementalHasher::with_domain("sovereign.challenge.v1");
        hasher
            .update(&nonce)
            .update_framed(target.as_bytes())
            .update_framed(issuer.as_bytes())
            .update_i64(timestamp);
        let id = ChallengeId(hasher.finalize());

        Self {
            id,
            nonce,
            timestamp,
            target,
            issuer,
        }
    }

    /// Bytes the target signs
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(32 + NONCE_SIZE + self.target.as_bytes().len() + 16);
        bytes.extend_from_slice(b"sovereign.response.v1");
        bytes.extend_from_slice(self.id.as_bytes());
        bytes.extend_from_slice(&self.nonce);
        bytes.extend_from_slice(self.target.as_bytes());
        bytes
    }
}

/// Signed answer to a [`Challenge`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeResponse {
    pub challenge_id: ChallengeId,
    pub responder: NodeId,
    pub signature: Signature,
}

impl ChallengeResponse {
    /// Sign `challenge` as `responder`
    pub fn sign(challenge: &Challenge, responder: NodeId, signer: &dyn SignatureService) -> Self {
        Self {
            challenge_id: challenge.id,
            responder,
            signature: signer.sign(&challenge.signing_bytes()),
        }
    }
}

/// Outcome of [`VerificationProtocol::verify_response`]
#[derive(Clone, Debug, PartialEq)]
pub struct VerificationOutcome {
    pub valid: bool,
    pub error: Option<SovereignError>,
}

impl VerificationOutcome {
    fn accepted() -> Self {
        Self {
            valid: true,
            error: None,
        }
    }

    fn rejected(error: SovereignError) -> Self {
        Self {
            valid: false,
            error: Some(error),
        }
    }
}

#[derive(Default)]
struct ConsumedChallenges {
    order: VecDeque<ChallengeId>,
    seen: HashSet<ChallengeId>,
}

impl ConsumedChallenges {
    fn insert(&mut self, id: ChallengeId, capacity: usize) {
        if self.seen.insert(id) {
            self.order.push_back(id);
        }
        while self.order.len() > capacity {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
    }

    fn contains(&self, id: &ChallengeId) -> bool {
        self.seen.contains(id)
    }
}

/// Verification statistics
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VerificationStats {
    pub registered_peers: usize,
    pub pending_challenges: usize,
    pub verified: u64,
    pub rejected: u64,
}

/// Peer verification protocol
pub struct VerificationProtocol {
    local_id: NodeId,
    config: VerificationConfig,
    keys: RwLock<HashMap<NodeId, PublicKey>>,
    pending: Mutex<HashMap<ChallengeId, Challenge>>,
    consumed: Mutex<ConsumedChallenges>,
    reputation: Arc<ReputationStore>,
    verifier: Arc<dyn SignatureVerifier>,
    attestation: Arc<dyn AttestationService>,
    clock: SharedClock,
    events: EventBus,
    counters: Mutex<(u64, u64)>,
}

impl VerificationProtocol {
    pub fn new(
        local_id: NodeId,
        config: VerificationConfig,
        reputation: Arc<ReputationStore>,
        verifier: Arc<dyn SignatureVerifier>,
        attestation: Arc<dyn AttestationService>,
        clock: SharedClock,
        events: EventBus,
    ) -> Self {
        Self {
            local_id,
            config,
            keys: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            consumed: Mutex::new(ConsumedChallenges::default()),
            reputation,
            verifier,
            attestation,
            clock,
            events,
            counters: Mutex::new((0, 0)),
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    pub fn reputation(&self) -> &Arc<ReputationStore> {
        &self.reputation
    }

    /// Register (or rotate) a peer's public key
    pub fn register_peer(&self, peer: NodeId, key: PublicKey) {
        tracing::debug!("Registered key {:?} for {}", key, peer);
        self.keys.write().insert(peer, key);
    }

    pub fn public_key(&self, peer: &NodeId) -> Option<PublicKey> {
        self.keys.read().get(peer).copied()
    }

    pub fn is_registered(&self, peer: &NodeId) -> bool {
        self.keys.read().contains_key(peer)
    }

    pub fn is_blacklisted(&self, peer: &NodeId) -> bool {
        self.reputation.is_blacklisted(peer)
    }

    /// Issue a fresh challenge to `peer`
    pub fn challenge(&self, peer: &NodeId) -> Result<Challenge, SovereignError> {
        if self.reputation.is_blacklisted(peer) {
            return Err(SovereignError::Blacklisted(peer.clone()));
        }
        if !self.is_registered(peer) {
            return Err(SovereignError::UnknownPeer(peer.clone()));
        }

        let now = self.clock.now_millis();
        let mut pending = self.pending.lock();
        self.prune_expired(&mut pending, now);
        if pending.len() >= self.config.max_pending_challenges {
            return Err(SovereignError::CapacityExceeded {
                max: self.config.max_pending_challenges,
            });
        }

        let challenge = Challenge::new(self.local_id.clone(), peer.clone(), now);
        pending.insert(challenge.id, challenge.clone());
        tracing::debug!("Challenge {} issued to {}", challenge.id, peer);
        Ok(challenge)
    }

    /// Answer a challenge addressed to this node
    pub fn respond(
        &self,
        challenge: &Challenge,
        signer: &dyn SignatureService,
    ) -> Result<ChallengeResponse, SovereignError> {
        if challenge.target != self.local_id {
            return Err(SovereignError::ProtocolViolation {
                operation: "respond",
                state: format!("challenge addressed to {}", challenge.target),
            });
        }
        Ok(ChallengeResponse::sign(challenge, self.local_id.clone(), signer))
    }

    /// Whether `id` was issued here and is still awaiting a response
    pub fn is_pending(&self, id: &ChallengeId) -> bool {
        self.pending.lock().contains_key(id)
    }

    /// Check a response, consume its challenge and update the target's
    /// reputation with the result.
    pub fn verify_response(&self, response: &ChallengeResponse) -> VerificationOutcome {
        let outcome = self.check_response(response);
        {
            let mut counters = self.counters.lock();
            if outcome.valid {
                counters.0 += 1;
            } else {
                counters.1 += 1;
            }
        }
        outcome
    }

    fn check_response(&self, response: &ChallengeResponse) -> VerificationOutcome {
        let challenge = self.pending.lock().remove(&response.challenge_id);
        let Some(challenge) = challenge else {
            if self.consumed.lock().contains(&response.challenge_id) {
                let err = SovereignError::ChallengeReplayed(response.challenge_id.to_hex());
                self.record_fault(&response.responder, &err);
                return VerificationOutcome::rejected(err);
            }
            return VerificationOutcome::rejected(SovereignError::UnknownChallenge(
                response.challenge_id.to_hex(),
            ));
        };
        self.consumed
            .lock()
            .insert(challenge.id, self.config.consumed_history);

        let target = &challenge.target;
        if response.responder != *target {
            let err = SovereignError::InvalidSignature(response.responder.clone());
            self.record_fault(&response.responder, &err);
            return VerificationOutcome::rejected(err);
        }

        let Some(key) = self.public_key(target) else {
            return VerificationOutcome::rejected(SovereignError::UnknownPeer(target.clone()));
        };

        // Only a correctly signed response says anything about the target
        if let Err(e) = self
            .verifier
            .verify(&key, &challenge.signing_bytes(), &response.signature)
        {
            tracing::warn!("Challenge {} failed for {}: {}", challenge.id, target, e);
            let err = SovereignError::InvalidSignature(target.clone());
            self.record_fault(target, &err);
            return VerificationOutcome::rejected(err);
        }

        if self.clock.now_millis() - challenge.timestamp > self.config.challenge_ttl_ms {
            let err = SovereignError::ChallengeExpired(challenge.id.to_hex());
            self.record_fault(target, &err);
            return VerificationOutcome::rejected(err);
        }

        self.reputation.update(target, true);
        tracing::debug!("Challenge {} answered by {}", challenge.id, target);
        VerificationOutcome::accepted()
    }

    /// Verify a signature by `peer` over `message`.
    ///
    /// Failures are reported without touching `peer`'s reputation.
    pub fn verify_signature(
        &self,
        peer: &NodeId,
        message: &[u8],
        signature: &Signature,
    ) -> Result<(), SovereignError> {
        let key = self
            .public_key(peer)
            .ok_or_else(|| SovereignError::UnknownPeer(peer.clone()))?;

        self.verifier
            .verify(&key, message, signature)
            .map_err(|_| {
                let err = SovereignError::InvalidSignature(peer.clone());
                self.record_fault(peer, &err);
                err
            })
    }

    /// Check a contribution before it reaches the coordinator
    pub fn verify_contribution(
        &self,
        contributor: &NodeId,
        payload: &[u8],
        proof: &Proof,
    ) -> Result<(), SovereignError> {
        if self.reputation.is_blacklisted(contributor) {
            return Err(SovereignError::Blacklisted(contributor.clone()));
        }
        if !self.attestation.verify_proof(payload, proof) {
            let err = SovereignError::InvalidProof(contributor.clone());
            self.record_fault(contributor, &err);
            return Err(err);
        }
        Ok(())
    }

    /// Record a fault attributed to `peer` without an originating error
    pub fn report_fault(&self, peer: &NodeId, reason: FaultKind) {
        tracing::warn!("Byzantine fault from {}: {}", peer, reason);
        if reason.penalizes() {
            self.reputation.update(peer, false);
        }
        self.events.publish(EngineEvent::ByzantineFaultDetected {
            peer_id: peer.clone(),
            reason,
        });
    }

    fn record_fault(&self, peer: &NodeId, err: &SovereignError) {
        match FaultKind::classify(err) {
            Some(kind) => self.report_fault(peer, kind),
            None => {
                self.reputation.update(peer, false);
            }
        }
    }

    fn prune_expired(&self, pending: &mut HashMap<ChallengeId, Challenge>, now: Timestamp) {
        let ttl = self.config.challenge_ttl_ms;
        pending.retain(|_, c| now - c.timestamp <= ttl);
    }

    pub fn stats(&self) -> VerificationStats {
        let (verified, rejected) = *self.counters.lock();
        VerificationStats {
            registered_peers: self.keys.read().len(),
            pending_challenges: self.pending.lock().len(),
            verified,
            rejected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reputation::ReputationConfig;
    use sovereign_core::events::drain;
    use sovereign_core::ManualClock;
    use sovereign_crypto::{Ed25519Verifier, KeyPair, KeyedAttestor};

    struct Fixture {
        protocol: VerificationProtocol,
        clock: ManualClock,
        events: EventBus,
        bob: KeyPair,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::new(1_000_000);
        let shared: SharedClock = Arc::new(clock.clone());
        let events = EventBus::default();
        let reputation = Arc::new(ReputationStore::new(ReputationConfig::default(), shared.clone()));
        let protocol = VerificationProtocol::new(
            NodeId::from("alice"),
            VerificationConfig::default(),
            reputation,
            Arc::new(Ed25519Verifier),
            Arc::new(KeyedAttestor::from_secret(b"federation")),
            shared,
            events.clone(),
        );
        let bob = KeyPair::from_seed([2u8; 32]);
        protocol.register_peer(NodeId::from("bob"), bob.public_key());
        Fixture {
            protocol,
            clock,
            events,
            bob,
        }
    }

    #[test]
    fn test_valid_response() {
        let f = fixture();
        let bob = NodeId::from("bob");
        let challenge = f.protocol.challenge(&bob).unwrap();
        let response = ChallengeResponse::sign(&challenge, bob.clone(), &f.bob);

        let outcome = f.protocol.verify_response(&response);
        assert!(outcome.valid);
        assert!(outcome.error.is_none());
        assert_eq!(f.protocol.reputation().get_record(&bob).unwrap().successes, 1);
    }

    #[test]
    fn test_challenges_are_fresh() {
        let f = fixture();
        let bob = NodeId::from("bob");
        let a = f.protocol.challenge(&bob).unwrap();
        let b = f.protocol.challenge(&bob).unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.id, b.id);
        assert_eq!(f.protocol.stats().pending_challenges, 2);
    }

    #[test]
    fn test_replayed_response_rejected() {
        let f = fixture();
        let bob = NodeId::from("bob");
        let challenge = f.protocol.challenge(&bob).unwrap();
        let response = ChallengeResponse::sign(&challenge, bob.clone(), &f.bob);

        assert!(f.protocol.verify_response(&response).valid);
        let replay = f.protocol.verify_response(&response);
        assert!(!replay.valid);
        assert!(matches!(
            replay.error,
            Some(SovereignError::ChallengeReplayed(_))
        ));
    }

    #[test]
    fn test_expired_challenge_fails_closed() {
        let f = fixture();
        let bob = NodeId::from("bob");
        let challenge = f.protocol.challenge(&bob).unwrap();
        let response = ChallengeResponse::sign(&challenge, bob.clone(), &f.bob);

        f.clock.advance(30_001);
        let outcome = f.protocol.verify_response(&response);
        assert!(!outcome.valid);
        assert!(matches!(
            outcome.error,
            Some(SovereignError::ChallengeExpired(_))
        ));
        assert_eq!(f.protocol.reputation().get_record(&bob).unwrap().failures, 1);
    }

    #[test]
    fn test_forged_response_leaves_reputation() {
        let f = fixture();
        let mut rx = f.events.subscribe();
        let bob = NodeId::from("bob");
        let mallory = KeyPair::from_seed([66u8; 32]);

        let challenge = f.protocol.challenge(&bob).unwrap();
        let forged = ChallengeResponse::sign(&challenge, bob.clone(), &mallory);
        let outcome = f.protocol.verify_response(&forged);

        assert!(!outcome.valid);
        assert_eq!(outcome.error, Some(SovereignError::InvalidSignature(bob.clone())));
        assert!((f.protocol.reputation().score(&bob) - 1.0).abs() < 1e-12);
        assert!(!f.protocol.is_pending(&challenge.id));
        assert_eq!(
            drain(&mut rx),
            vec![EngineEvent::ByzantineFaultDetected {
                peer_id: bob,
                reason: FaultKind::InvalidSignature,
            }]
        );
    }

    #[test]
    fn test_late_forgery_is_not_an_expiry() {
        let f = fixture();
        let bob = NodeId::from("bob");
        let mallory = KeyPair::from_seed([66u8; 32]);

        let challenge = f.protocol.challenge(&bob).unwrap();
        f.clock.advance(30_001);
        let forged = ChallengeResponse::sign(&challenge, bob.clone(), &mallory);
        let outcome = f.protocol.verify_response(&forged);

        assert_eq!(outcome.error, Some(SovereignError::InvalidSignature(bob.clone())));
        assert!(f.protocol.reputation().get_record(&bob).is_none());
    }

    #[test]
    fn test_forged_signatures_never_blacklist() {
        let f = fixture();
        let bob = NodeId::from("bob");
        for _ in 0..10 {
            assert_eq!(
                f.protocol.verify_signature(&bob, b"vote", &Signature::empty()),
                Err(SovereignError::InvalidSignature(bob.clone()))
            );
        }
        assert!(!f.protocol.is_blacklisted(&bob));
        assert!((f.protocol.reputation().score(&bob) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_unknown_challenge() {
        let f = fixture();
        let response = ChallengeResponse {
            challenge_id: ChallengeId([9u8; 32]),
            responder: NodeId::from("bob"),
            signature: Signature::empty(),
        };
        let outcome = f.protocol.verify_response(&response);
        assert!(!outcome.valid);
        assert!(matches!(
            outcome.error,
            Some(SovereignError::UnknownChallenge(_))
        ));
        assert_eq!(f.protocol.stats().rejected, 1);
    }

    #[test]
    fn test_blacklisted_peer_not_challenged() {
        let f = fixture();
        let bob = NodeId::from("bob");
        for _ in 0..5 {
            f.protocol.reputation().update(&bob, false);
        }
        assert_eq!(
            f.protocol.challenge(&bob),
            Err(SovereignError::Blacklisted(bob))
        );
        assert!(matches!(
            f.protocol.challenge(&NodeId::from("carol")),
            Err(SovereignError::UnknownPeer(_))
        ));
    }

    #[test]
    fn test_respond_only_to_own_challenges() {
        let f = fixture();
        let alice = KeyPair::from_seed([1u8; 32]);
        let challenge = f.protocol.challenge(&NodeId::from("bob")).unwrap();
        assert!(matches!(
            f.protocol.respond(&challenge, &alice),
            Err(SovereignError::ProtocolViolation { .. })
        ));
    }

    #[test]
    fn test_verify_contribution() {
        let f = fixture();
        let bob = NodeId::from("bob");
        let attestor = KeyedAttestor::from_secret(b"federation");
        let proof = attestor.attest(b"payload");

        assert!(f.protocol.verify_contribution(&bob, b"payload", &proof).is_ok());
        assert_eq!(
            f.protocol.verify_contribution(&bob, b"tampered", &proof),
            Err(SovereignError::InvalidProof(bob.clone()))
        );
        assert_eq!(f.protocol.reputation().get_record(&bob).unwrap().failures, 1);
    }

    #[test]
    fn test_verify_signature() {
        let f = fixture();
        let bob = NodeId::from("bob");
        let sig = f.bob.sign(b"vote");

        assert!(f.protocol.verify_signature(&bob, b"vote", &sig).is_ok());
        assert_eq!(
            f.protocol.verify_signature(&bob, b"other", &sig),
            Err(SovereignError::InvalidSignature(bob))
        );
        assert!(matches!(
            f.protocol.verify_signature(&NodeId::from("zed"), b"vote", &sig),
            Err(SovereignError::UnknownPeer(_))
        ));
    }
}
