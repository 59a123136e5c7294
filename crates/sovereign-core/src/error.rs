//! Error types for the Sovereign federation engine

use crate::types::{ConsensusState, NodeId, ProposalId};
use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, SovereignError>;

/// Errors that can occur anywhere in the consensus and aggregation engine
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SovereignError {
    // === Protocol ===
    /// A proposal is already collecting votes
    #[error("Proposal {0} is already collecting votes")]
    AlreadyVoting(ProposalId),

    /// Operation requires the Voting state
    #[error("Session is not accepting votes (state: {state})")]
    NotVoting { state: ConsensusState },

    /// Operation invoked in a state that does not permit it
    #[error("Protocol violation: {operation} is not allowed while {state}")]
    ProtocolViolation {
        operation: &'static str,
        state: String,
    },

    /// Proposal not part of the active session
    #[error("Unknown proposal: {0}")]
    UnknownProposal(ProposalId),

    /// Vote from a voter outside the known voter set
    #[error("Unknown voter: {0}")]
    UnknownVoter(NodeId),

    /// Voter already voted on this proposal
    #[error("Duplicate vote from {voter} on proposal {proposal}")]
    DuplicateVote { voter: NodeId, proposal: ProposalId },

    // === Quorum ===
    /// Weighted approvals below the BFT quorum
    #[error("Insufficient quorum: need {required}, have {approvals:.2}")]
    InsufficientQuorum { required: usize, approvals: f64 },

    /// Voter set too small to tolerate the requested fault bound
    #[error("Byzantine resilience violated: {total} nodes cannot tolerate {faulty} faults")]
    ResilienceViolation { total: usize, faulty: usize },

    // === Verification ===
    /// Attestation proof did not verify
    #[error("Invalid proof from {0}")]
    InvalidProof(NodeId),

    /// Signature did not verify against the registered key
    #[error("Invalid signature from {0}")]
    InvalidSignature(NodeId),

    /// Peer has no registered public key
    #[error("Unknown peer: {0}")]
    UnknownPeer(NodeId),

    /// Peer is at or below the blacklist threshold
    #[error("Peer is blacklisted: {0}")]
    Blacklisted(NodeId),

    /// Challenge outlived its time-to-live
    #[error("Challenge {0} expired")]
    ChallengeExpired(String),

    /// Challenge was already answered
    #[error("Challenge {0} was already consumed")]
    ChallengeReplayed(String),

    /// Challenge was never issued by this node
    #[error("Unknown challenge: {0}")]
    UnknownChallenge(String),

    // === Aggregation ===
    /// Not enough well-formed contributions to run robust selection
    #[error("Insufficient contributions: need more than {required}, have {available}")]
    InsufficientContributions { required: usize, available: usize },

    /// Contribution payload rejected before scoring
    #[error("Malformed contribution from {contributor}: {reason}")]
    MalformedContribution { contributor: NodeId, reason: String },

    // === Island log ===
    /// Stored chain does not re-hash correctly
    #[error("Chain integrity violation at sequence {sequence}")]
    ChainIntegrityViolation { sequence: u64 },

    /// Island log is full
    #[error("Island log capacity of {max} entries exceeded")]
    CapacityExceeded { max: usize },

    // === Infrastructure ===
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Peers unreachable
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classes of the error taxonomy
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Protocol,
    Quorum,
    Verification,
    Aggregation,
    Integrity,
    Capacity,
    Infrastructure,
}

impl SovereignError {
    /// Stable numeric code for logs and wire responses
    pub fn code(&self) -> u32 {
        match self {
            Self::AlreadyVoting(_) => 2001,
            Self::NotVoting { .. } => 2002,
            Self::ProtocolViolation { .. } => 2003,
            Self::UnknownProposal(_) => 2004,
            Self::UnknownVoter(_) => 2005,
            Self::DuplicateVote { .. } => 2006,
            Self::InsufficientQuorum { .. } => 2101,
            Self::ResilienceViolation { .. } => 2102,
            Self::InvalidProof(_) => 2201,
            Self::InvalidSignature(_) => 2202,
            Self::UnknownPeer(_) => 2203,
            Self::Blacklisted(_) => 2204,
            Self::ChallengeExpired(_) | Self::ChallengeReplayed(_) | Self::UnknownChallenge(_) => {
                2205
            }
            Self::InsufficientContributions { .. } => 2301,
            Self::MalformedContribution { .. } => 2302,
            Self::ChainIntegrityViolation { .. } => 2401,
            Self::CapacityExceeded { .. } => 2402,
            _ => 9999,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::AlreadyVoting(_)
            | Self::NotVoting { .. }
            | Self::ProtocolViolation { .. }
            | Self::UnknownProposal(_)
            | Self::UnknownVoter(_)
            | Self::DuplicateVote { .. } => ErrorCategory::Protocol,
            Self::InsufficientQuorum { .. } | Self::ResilienceViolation { .. } => {
                ErrorCategory::Quorum
            }
            Self::InvalidProof(_)
            | Self::InvalidSignature(_)
            | Self::UnknownPeer(_)
            | Self::Blacklisted(_)
            | Self::ChallengeExpired(_)
            | Self::ChallengeReplayed(_)
            | Self::UnknownChallenge(_) => ErrorCategory::Verification,
            Self::InsufficientContributions { .. } | Self::MalformedContribution { .. } => {
                ErrorCategory::Aggregation
            }
            Self::ChainIntegrityViolation { .. } => ErrorCategory::Integrity,
            Self::CapacityExceeded { .. } => ErrorCategory::Capacity,
            Self::Storage(_)
            | Self::Serialization(_)
            | Self::Transport(_)
            | Self::InvalidInput(_)
            | Self::Internal(_) => ErrorCategory::Infrastructure,
        }
    }

    /// Check if the caller can retry after a reset, a flush or more input
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::InsufficientQuorum { .. }
                | Self::InsufficientContributions { .. }
                | Self::CapacityExceeded { .. }
                | Self::ChallengeExpired(_)
                | Self::Transport(_)
        )
    }

    /// Errors that invalidate persisted state and must reach the operator
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ChainIntegrityViolation { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = SovereignError::ChainIntegrityViolation { sequence: 3 };
        assert_eq!(err.code(), 2401);

        let err = SovereignError::InvalidSignature(NodeId::from("mallory"));
        assert_eq!(err.code(), 2202);
        assert_eq!(SovereignError::Internal("boom".into()).code(), 9999);
    }

    #[test]
    fn test_error_display() {
        let err = SovereignError::ChainIntegrityViolation { sequence: 7 };
        assert_eq!(err.to_string(), "Chain integrity violation at sequence 7");

        let err = SovereignError::InsufficientQuorum {
            required: 3,
            approvals: 1.5,
        };
        assert!(err.to_string().contains("need 3, have 1.50"));
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(SovereignError::InsufficientQuorum {
            required: 3,
            approvals: 0.0
        }
        .is_recoverable());
        assert!(SovereignError::CapacityExceeded { max: 10 }.is_recoverable());
        assert!(!SovereignError::ChainIntegrityViolation { sequence: 1 }.is_recoverable());
        assert!(SovereignError::ChainIntegrityViolation { sequence: 1 }.is_fatal());
    }

    #[test]
    fn test_categories() {
        assert_eq!(
            SovereignError::NotVoting {
                state: ConsensusState::Committed
            }
            .category(),
            ErrorCategory::Protocol
        );
        assert_eq!(
            SovereignError::InvalidProof(NodeId::from("a")).category(),
            ErrorCategory::Verification
        );
        assert_eq!(
            SovereignError::CapacityExceeded { max: 1 }.category(),
            ErrorCategory::Capacity
        );
    }
}
