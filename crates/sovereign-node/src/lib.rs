//! # Sovereign Node
//!
//! Assembly of the consensus and aggregation engine into a running node.
//!
//! ## Modules
//!
//! - `config` - layered TOML/environment configuration
//! - `logging` - tracing subscriber setup
//! - `metrics` - Prometheus counters fed from engine events
//! - `message` - wire envelopes exchanged between nodes
//! - `transport` - broadcast transport seam and its in-memory network
//! - `driver` - deadline-bound round driver and island submission backend
//! - `node` - the assembled node with its message loop

pub mod config;
pub mod driver;
pub mod logging;
pub mod message;
pub mod metrics;
pub mod node;
pub mod transport;

pub use config::{
    LogFormat, LoggingConfig, MetricsConfig, NodeConfig, NodeSettings, RoundConfig,
    StorageBackend, StorageConfig,
};
pub use driver::RoundDriver;
pub use logging::init_tracing;
pub use message::{Envelope, NetworkMessage};
pub use metrics::EngineMetrics;
pub use node::{NodeHandle, SovereignNode};
pub use transport::{DeliveryReport, InMemoryNetwork, Inbox, MemoryTransport, Transport};
