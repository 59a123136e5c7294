//! # Sovereign Core
//!
//! Shared vocabulary of the Byzantine-robust consensus and aggregation engine:
//!
//! - `NodeId`, `ProposalId`, `ChainHash` - identifiers crossing node boundaries
//! - `ConsensusState` / `ConnectivityMode` - the two externally visible state machines
//! - `SovereignError` - the engine error taxonomy
//! - `FaultKind` - closed set of Byzantine fault reasons
//! - `EventBus` - broadcast of `EngineEvent`s to observers
//! - `Clock` - injectable wall clock

pub mod clock;
pub mod error;
pub mod events;
pub mod fault;
pub mod types;

pub use clock::*;
pub use error::*;
pub use events::{EngineEvent, EventBus};
pub use fault::FaultKind;
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::clock::{Clock, ManualClock, SharedClock, SystemClock};
    pub use crate::error::{Result, SovereignError};
    pub use crate::events::{EngineEvent, EventBus};
    pub use crate::fault::FaultKind;
    pub use crate::types::*;
}
