//! # Sovereign Island
//!
//! Keeps a node contributing while it cannot reach the federation.
//!
//! Online, local contributions go straight to the proposal path through a
//! [`SubmissionBackend`]. In island mode they are appended to an
//! [`IslandLog`], a hash chain persisted on every append. On reconnection the
//! chain is re-verified, replayed in order and flushed as a single batch.

pub mod log;
pub mod manager;

pub use log::{IslandLog, IslandLogEntry};
pub use manager::{
    IslandConfig, IslandModeManager, ReplayReport, Submission, SubmissionBackend, SyncReport,
    LOG_KEY,
};
