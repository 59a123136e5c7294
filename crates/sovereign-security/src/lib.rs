//! # Sovereign Security
//!
//! Long-lived trust in federation peers.
//!
//! - **Reputation**: EMA-scored records with time decay and blacklisting
//! - **Verification**: nonce challenge/response checks, vote signature and
//!   contribution proof checks that feed reputation
//! - **Trust**: the `PeerTrust` seam the coordinator weighs votes through
//!
//! ```text
//!   challenge ──► peer signs nonce ──► verify_response ──┐
//!   vote signature ─────────────────► verify_signature ──┼──► ReputationStore
//!   contribution proof ─────────────► verify_contribution┘        │
//!                                                                  ▼
//!                                               vote_weight / is_blacklisted
//! ```

pub mod reputation;
pub mod trust;
pub mod verification;

pub use reputation::{
    PeerReputation, RecoveryPolicy, ReputationConfig, ReputationRecord, ReputationStore,
    ReputationUpdate,
};
pub use trust::{PeerTrust, UniformTrust};
pub use verification::{
    Challenge, ChallengeId, ChallengeResponse, VerificationConfig, VerificationOutcome,
    VerificationProtocol, VerificationStats,
};
