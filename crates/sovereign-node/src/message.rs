//! Messages exchanged between federation nodes

use serde::{Deserialize, Serialize};
use sovereign_consensus::{Proposal, Vote};
use sovereign_core::{NodeId, Round, SovereignError};
use sovereign_security::{Challenge, ChallengeResponse};

/// Protocol payloads
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum NetworkMessage {
    Proposal(Proposal),
    Vote(Vote),
    Challenge(Challenge),
    ChallengeResponse(ChallengeResponse),
    /// Digest of the sender's current aggregate, for cross-checking
    AggregateAnnouncement {
        round: Round,
        digest: [u8; 32],
        contributors: Vec<NodeId>,
    },
}

impl NetworkMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Proposal(_) => "proposal",
            Self::Vote(_) => "vote",
            Self::Challenge(_) => "challenge",
            Self::ChallengeResponse(_) => "challenge_response",
            Self::AggregateAnnouncement { .. } => "aggregate_announcement",
        }
    }

    /// Identity the payload itself claims to originate from
    pub fn claimed_origin(&self) -> Option<&NodeId> {
        match self {
            Self::Proposal(p) => Some(&p.proposer),
            Self::Vote(v) => Some(&v.voter),
            Self::Challenge(c) => Some(&c.issuer),
            Self::ChallengeResponse(r) => Some(&r.responder),
            Self::AggregateAnnouncement { .. } => None,
        }
    }
}

/// A message together with its sender
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub sender: NodeId,
    pub message: NetworkMessage,
}

impl Envelope {
    pub fn new(sender: NodeId, message: NetworkMessage) -> Self {
        Self { sender, message }
    }

    /// Whether the sender matches the identity embedded in the payload
    pub fn is_consistent(&self) -> bool {
        self.message
            .claimed_origin()
            .map_or(true, |origin| *origin == self.sender)
    }

    pub fn encode(&self) -> Result<Vec<u8>, SovereignError> {
        bincode::serialize(self).map_err(|e| SovereignError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SovereignError> {
        bincode::deserialize(bytes).map_err(|e| SovereignError::Serialization(e.to_string()))
    }
}
