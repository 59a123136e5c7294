//! # Aggregation Epoch
//!
//! Glue between the coordinator, peer verification and the aggregator for one
//! node. Each committed round admits the proposer's contribution into the
//! epoch's accepted set; the robust aggregate is recomputed over that set.
//!
//! ```text
//! propose_vector ──► Proposal ──► peers review ──► signed Votes
//!                                                      │
//!        aggregate ◄── accepted set ◄── finalize ◄─────┘
//! ```

use parking_lot::RwLock;
use sovereign_core::{
    EngineEvent, EventBus, FaultKind, NodeId, ProposalId, SharedClock, SovereignError,
};
use sovereign_crypto::{AttestationService, Proof, SignatureService};
use sovereign_security::VerificationProtocol;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::aggregator::{decode_vector, encode_vector, Contribution, RobustAggregator};
use crate::coordinator::ConsensusCoordinator;
use crate::proposal::{Proposal, Vote};

/// Result of aggregating the accepted set
#[derive(Clone, Debug, PartialEq)]
pub struct AggregationOutcome {
    pub vector: Vec<f64>,
    /// BLAKE3 digest of `vector`, for cross-checking with peers
    pub digest: [u8; 32],
    pub selected: Vec<NodeId>,
    pub outliers: Vec<NodeId>,
}

pub struct AggregationEpoch {
    local_id: NodeId,
    coordinator: Arc<ConsensusCoordinator>,
    verification: Arc<VerificationProtocol>,
    aggregator: RobustAggregator,
    signer: Arc<dyn SignatureService>,
    attestation: Arc<dyn AttestationService>,
    events: EventBus,
    clock: SharedClock,
    accepted: RwLock<BTreeMap<NodeId, Contribution>>,
    dimension: RwLock<Option<usize>>,
}

impl AggregationEpoch {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_id: NodeId,
        coordinator: Arc<ConsensusCoordinator>,
        verification: Arc<VerificationProtocol>,
        aggregator: RobustAggregator,
        signer: Arc<dyn SignatureService>,
        attestation: Arc<dyn AttestationService>,
        events: EventBus,
        clock: SharedClock,
    ) -> Self {
        let dimension = aggregator.config().dimension;
        Self {
            local_id,
            coordinator,
            verification,
            aggregator,
            signer,
            attestation,
            events,
            clock,
            accepted: RwLock::new(BTreeMap::new()),
            dimension: RwLock::new(dimension),
        }
    }

    pub fn coordinator(&self) -> &Arc<ConsensusCoordinator> {
        &self.coordinator
    }

    pub fn dimension(&self) -> Option<usize> {
        *self.dimension.read()
    }

    /// Propose an already attested payload for the current round
    pub fn propose_contribution(
        &self,
        payload: Vec<u8>,
        proof: Proof,
    ) -> Result<Proposal, SovereignError> {
        let proposal = Proposal::new(
            self.coordinator.round(),
            self.local_id.clone(),
            payload,
            proof,
            self.clock.now_millis(),
        )
        .sign(self.signer.as_ref());
        self.coordinator.propose(proposal.clone())?;
        Ok(proposal)
    }

    /// Encode, attest and propose a local update vector
    pub fn propose_vector(&self, vector: &[f64]) -> Result<Proposal, SovereignError> {
        if let Some(dim) = self.dimension() {
            if vector.len() != dim {
                return Err(SovereignError::InvalidInput(format!(
                    "update has length {}, epoch expects {}",
                    vector.len(),
                    dim
                )));
            }
        }
        let payload = encode_vector(vector)?;
        let proof = self.attestation.attest(&payload);
        self.propose_contribution(payload, proof)
    }

    /// Open voting on a peer's proposal and return this node's vote on it
    pub fn receive_proposal(&self, proposal: Proposal) -> Result<Vote, SovereignError> {
        self.coordinator.propose(proposal.clone())?;
        Ok(self.review(&proposal))
    }

    /// Decode and validate a proposal's contribution.
    ///
    /// The proposer's signature is checked first; content faults count
    /// against the proposer only once it is authenticated.
    pub fn assess(&self, proposal: &Proposal) -> Result<Contribution, SovereignError> {
        let proposer = &proposal.proposer;
        self.verification
            .verify_signature(proposer, &proposal.signing_data(), &proposal.signature)?;
        self.verification
            .verify_contribution(proposer, &proposal.payload, &proposal.proof)?;

        let malformed = |reason: String| {
            self.verification
                .report_fault(proposer, FaultKind::MalformedContribution);
            SovereignError::MalformedContribution {
                contributor: proposer.clone(),
                reason,
            }
        };

        let vector = decode_vector(&proposal.payload).map_err(|e| malformed(e.to_string()))?;
        if vector.is_empty() || vector.iter().any(|v| !v.is_finite()) {
            return Err(malformed("empty or non-finite vector".to_string()));
        }
        if let Some(dim) = self.dimension() {
            if vector.len() != dim {
                return Err(malformed(format!("length {} differs from {}", vector.len(), dim)));
            }
        }
        Ok(Contribution::new(proposer.clone(), vector))
    }

    /// Signed vote approving `proposal` iff its contribution is acceptable
    pub fn review(&self, proposal: &Proposal) -> Vote {
        let approve = match self.assess(proposal) {
            Ok(_) => true,
            Err(e) => {
                tracing::info!("Rejecting proposal {} from {}: {}", proposal.id, proposal.proposer, e);
                false
            }
        };
        Vote::signed(
            self.local_id.clone(),
            proposal.id,
            approve,
            self.clock.now_millis(),
            self.signer.as_ref(),
        )
    }

    /// Commit `id` and admit its contribution.
    ///
    /// Voters are scored by agreement with the committed outcome. Without
    /// quorum the round is aborted and `InsufficientQuorum` returned.
    pub fn finalize(&self, id: &ProposalId) -> Result<Contribution, SovereignError> {
        let votes = self.coordinator.votes(id);
        let proposal = self.coordinator.commit(id)?;

        for vote in &votes {
            if vote.approve {
                self.verification.reputation().update(&vote.voter, true);
            } else {
                self.verification
                    .report_fault(&vote.voter, FaultKind::DisagreedWithCommit);
            }
        }

        let vector = decode_vector(&proposal.payload)?;
        let contribution = Contribution::new(proposal.proposer.clone(), vector);
        {
            let mut dimension = self.dimension.write();
            if dimension.is_none() {
                *dimension = Some(contribution.vector.len());
            }
        }
        self.accepted
            .write()
            .insert(contribution.contributor.clone(), contribution.clone());
        tracing::info!(
            "Accepted contribution from {} ({} in epoch)",
            contribution.contributor,
            self.accepted_count()
        );
        Ok(contribution)
    }

    /// Reset the coordinator for the next round
    pub fn next_round(&self) {
        self.coordinator.reset();
    }

    pub fn accepted(&self) -> Vec<Contribution> {
        self.accepted.read().values().cloned().collect()
    }

    pub fn accepted_count(&self) -> usize {
        self.accepted.read().len()
    }

    /// Robust aggregate over the accepted set, ordered by contributor ID
    pub fn aggregate(&self) -> Result<AggregationOutcome, SovereignError> {
        let weighted = self.aggregator.config().weighted;
        let contributions: Vec<Contribution> = self
            .accepted
            .read()
            .values()
            .map(|c| {
                let mut c = c.clone();
                if weighted {
                    c.weight = Some(self.verification.reputation().vote_weight(&c.contributor));
                }
                c
            })
            .collect();

        let result = self.aggregator.robust_aggregate(&contributions)?;

        let name = |i: &usize| contributions[*i].contributor.clone();
        let selected: Vec<NodeId> = result.selection.selected.iter().map(name).collect();
        let outliers: Vec<NodeId> = result.selection.outliers.iter().map(name).collect();

        // Selection is recomputed on every call; exclusions are reported,
        // never scored
        for peer in &outliers {
            self.verification
                .report_fault(peer, FaultKind::OutlierContribution);
        }
        for i in &result.selection.malformed {
            tracing::warn!(
                "Excluded malformed contribution from {}",
                contributions[*i].contributor
            );
        }

        self.events.publish(EngineEvent::AggregatePublished {
            contributors: contributions.len(),
            selected: selected.len(),
            digest: result.digest,
        });
        tracing::info!(
            "Aggregated {} of {} contributions",
            selected.len(),
            contributions.len()
        );

        Ok(AggregationOutcome {
            vector: result.vector,
            digest: result.digest,
            selected,
            outliers,
        })
    }

    /// Drop the accepted set and start a new epoch
    pub fn start_new_epoch(&self) {
        self.accepted.write().clear();
        *self.dimension.write() = self.aggregator.config().dimension;
    }
}
