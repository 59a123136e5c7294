//! Proposals and votes

use serde::{Deserialize, Serialize};
use sovereign_core::{NodeId, ProposalId, Round, Timestamp};
use sovereign_crypto::{IncrementalHasher, Proof, Signature, SignatureService};

/// A contribution submitted for acceptance in one round
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    /// BLAKE3 over the remaining fields
    pub id: ProposalId,
    pub round: Round,
    pub proposer: NodeId,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    pub proof: Proof,
    pub timestamp: Timestamp,
    /// Proposer's signature over `id`; empty until [`Proposal::sign`]
    pub signature: Signature,
}

impl Proposal {
    pub fn new(
        round: Round,
        proposer: NodeId,
        payload: Vec<u8>,
        proof: Proof,
        timestamp: Timestamp,
    ) -> Self {
        let id = Self::generate_id(round, &proposer, &payload, &proof, timestamp);
        Self {
            id,
            round,
            proposer,
            payload,
            proof,
            timestamp,
            signature: Signature::empty(),
        }
    }

    /// Sign as the proposer
    pub fn sign(mut self, signer: &dyn SignatureService) -> Self {
        self.signature = signer.sign(&self.signing_data());
        self
    }

    pub fn signing_data(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(48);
        data.extend_from_slice(b"sovereign.proposal.v1");
        data.extend_from_slice(self.id.as_bytes());
        data
    }

    fn generate_id(
        round: Round,
        proposer: &NodeId,
        payload: &[u8],
        proof: &Proof,
        timestamp: Timestamp,
    ) -> ProposalId {
        let mut hasher = IncrementalHasher::with_domain("sovereign.proposal.v1");
        hasher
            .update_u64(round)
            .update_framed(proposer.as_bytes())
            .update_framed(payload)
            .update_framed(proof.as_bytes())
            .update_i64(timestamp);
        ProposalId::new(hasher.finalize())
    }

    /// Whether `id` matches the content it claims to identify
    pub fn has_valid_id(&self) -> bool {
        self.id
            == Self::generate_id(
                self.round,
                &self.proposer,
                &self.payload,
                &self.proof,
                self.timestamp,
            )
    }
}

/// One voter's decision on one proposal
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub voter: NodeId,
    pub proposal_id: ProposalId,
    pub approve: bool,
    pub signature: Signature,
    pub timestamp: Timestamp,
}

impl Vote {
    /// Create a vote signed by `signer`
    pub fn signed(
        voter: NodeId,
        proposal_id: ProposalId,
        approve: bool,
        timestamp: Timestamp,
        signer: &dyn SignatureService,
    ) -> Self {
        let mut vote = Self {
            voter,
            proposal_id,
            approve,
            signature: Signature::empty(),
            timestamp,
        };
        vote.signature = signer.sign(&vote.signing_data());
        vote
    }

    /// Create an unsigned vote (for channels that authenticate separately)
    pub fn unsigned(voter: NodeId, proposal_id: ProposalId, approve: bool, timestamp: Timestamp) -> Self {
        Self {
            voter,
            proposal_id,
            approve,
            signature: Signature::empty(),
            timestamp,
        }
    }

    /// Get the data to be signed
    pub fn signing_data(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(64 + self.voter.as_bytes().len());
        data.extend_from_slice(b"sovereign.vote.v1");
        data.extend_from_slice(self.proposal_id.as_bytes());
        data.extend_from_slice(&(self.voter.as_bytes().len() as u32).to_le_bytes());
        data.extend_from_slice(self.voter.as_bytes());
        data.push(self.approve as u8);
        data.extend_from_slice(&self.timestamp.to_le_bytes());
        data
    }

    /// Same voter, proposal and decision
    pub fn same_decision(&self, other: &Vote) -> bool {
        self.voter == other.voter
            && self.proposal_id == other.proposal_id
            && self.approve == other.approve
    }
}
