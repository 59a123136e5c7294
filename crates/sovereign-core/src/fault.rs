//! Byzantine fault categories

use crate::error::SovereignError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reason a peer was reported as faulty
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultKind {
    InvalidSignature,
    InvalidProof,
    ReplayedChallenge,
    ExpiredChallenge,
    DuplicateVote,
    MalformedContribution,
    /// Excluded by robust selection; informational only
    OutlierContribution,
    /// Voted against a proposal that committed
    DisagreedWithCommit,
    Blacklisted,
}

impl FaultKind {
    /// Map an engine error to the fault it evidences, if any.
    ///
    /// Errors caused by local state (wrong session state, storage, capacity)
    /// say nothing about the remote peer and map to `None`.
    pub fn classify(error: &SovereignError) -> Option<FaultKind> {
        match error {
            SovereignError::InvalidSignature(_) => Some(Self::InvalidSignature),
            SovereignError::InvalidProof(_) => Some(Self::InvalidProof),
            SovereignError::ChallengeReplayed(_) => Some(Self::ReplayedChallenge),
            SovereignError::ChallengeExpired(_) => Some(Self::ExpiredChallenge),
            SovereignError::DuplicateVote { .. } => Some(Self::DuplicateVote),
            SovereignError::MalformedContribution { .. } => Some(Self::MalformedContribution),
            SovereignError::Blacklisted(_) => Some(Self::Blacklisted),
            _ => None,
        }
    }

    /// Whether the fault should lower the peer's reputation.
    ///
    /// Only faults that the named peer provably committed count. A bad
    /// signature or a replayed response can come from anyone claiming the
    /// identity, and selection always excludes some honest contributions.
    pub fn penalizes(&self) -> bool {
        !matches!(
            self,
            Self::InvalidSignature
                | Self::ReplayedChallenge
                | Self::OutlierContribution
                | Self::Blacklisted
        )
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InvalidSignature => "invalid signature",
            Self::InvalidProof => "invalid proof",
            Self::ReplayedChallenge => "replayed challenge",
            Self::ExpiredChallenge => "expired challenge",
            Self::DuplicateVote => "duplicate vote",
            Self::MalformedContribution => "malformed contribution",
            Self::OutlierContribution => "outlier contribution",
            Self::DisagreedWithCommit => "disagreed with commit",
            Self::Blacklisted => "blacklisted",
        };
        f.write_str(s)
    }
}
