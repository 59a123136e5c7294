//! Core identifiers shared by every engine component

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a federation participant.
///
/// Opaque to the engine; ordering is lexicographic and is used to break ties
/// wherever a deterministic order between peers is required.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// ProposalId - BLAKE3 digest of a proposal's content and submission time
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct ProposalId {
    hash: [u8; 32],
}

impl ProposalId {
    pub fn new(hash: [u8; 32]) -> Self {
        Self { hash }
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.hash
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.hash)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut hash = [0u8; 32];
        hex::decode_to_slice(s, &mut hash)?;
        Ok(Self { hash })
    }
}

impl fmt::Debug for ProposalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProposalId({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for ProposalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

/// Chain hash of an island log entry, or of the genesis sentinel
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ChainHash {
    hash: [u8; 32],
}

impl ChainHash {
    /// Sentinel preceding the first entry of every log
    pub const GENESIS: Self = Self { hash: [0u8; 32] };

    pub fn new(hash: [u8; 32]) -> Self {
        Self { hash }
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.hash
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.hash)
    }

    pub fn is_genesis(&self) -> bool {
        *self == Self::GENESIS
    }
}

impl fmt::Debug for ChainHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_genesis() {
            return write!(f, "ChainHash(genesis)");
        }
        write!(f, "ChainHash({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for ChainHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

/// Round number of a consensus session
pub type Round = u64;

/// Lifecycle of a consensus session
///
/// `Proposing -> Voting -> {Committed | Aborted}`, and `Reset` returns any
/// state to `Proposing`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConsensusState {
    /// Waiting for a proposal
    #[default]
    Proposing,
    /// Collecting votes on the pending proposal
    Voting,
    /// Quorum reached and the proposal accepted; read-only until reset
    Committed,
    /// Commit attempted without quorum, or aborted by the caller
    Aborted,
}

impl ConsensusState {
    /// True once the session can no longer change without a reset
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }
}

impl fmt::Display for ConsensusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Proposing => "proposing",
            Self::Voting => "voting",
            Self::Committed => "committed",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Connectivity mode of a node
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectivityMode {
    #[default]
    Online,
    /// Disconnected; submissions are queued in the island log
    Island,
}

impl fmt::Display for ConnectivityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Online => f.write_str("online"),
            Self::Island => f.write_str("island"),
        }
    }
}

/// Unix time in milliseconds
pub type Timestamp = i64;

/// Protocol constants
pub mod constants {
    /// Neutral vote weight for peers without a reputation record
    pub const DEFAULT_VOTE_WEIGHT: f64 = 1.0;

    /// Smoothing factor of the reputation moving average
    pub const DEFAULT_REPUTATION_ALPHA: f64 = 0.2;

    /// Challenge nonce length in bytes
    pub const NONCE_SIZE: usize = 32;

    /// Milliseconds per second
    pub const MILLIS_PER_SECOND: i64 = 1_000;
}
