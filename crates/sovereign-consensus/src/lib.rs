//! # Sovereign Consensus
//!
//! Byzantine fault-tolerant agreement on which contributions to accept, and
//! outlier-resistant combination of the accepted ones.
//!
//! ## Round Phases
//!
//! 1. Propose - a node attests its update and opens a session
//! 2. Vote - peers review the proposal and return signed, reputation-weighted votes
//! 3. Commit - with `floor(2n/3) + 1` weighted approvals the contribution is admitted
//! 4. Aggregate - Multi-Krum selection and averaging over the accepted set
//!
//! ## Byzantine Fault Tolerance
//!
//! Tolerates `f = (n-1)/3` faulty voters; for n=200 voters the quorum is 134.

pub mod aggregator;
pub mod coordinator;
pub mod epoch;
pub mod proposal;
pub mod quorum;

// Re-exports
pub use aggregator::{
    decode_vector, encode_vector, AggregationConfig, AggregationResult, Contribution,
    RobustAggregator, Selection,
};
pub use coordinator::{ConsensusCoordinator, ConsensusTally, CoordinatorConfig, CoordinatorStats};
pub use epoch::{AggregationEpoch, AggregationOutcome};
pub use proposal::{Proposal, Vote};
pub use quorum::*;
