//! Node configuration types

use anyhow::{ensure, Context};
use serde::{Deserialize, Serialize};
use sovereign_consensus::{AggregationConfig, CoordinatorConfig};
use sovereign_island::IslandConfig;
use sovereign_security::{ReputationConfig, VerificationConfig};
use std::path::Path;
use std::time::Duration;

/// Prefix of environment overrides, e.g. `SOVEREIGN__ROUND__DEADLINE_MS`
pub const ENV_PREFIX: &str = "SOVEREIGN";

/// Complete node configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node identity and housekeeping
    #[serde(default)]
    pub node: NodeSettings,

    /// Round deadlines and retries
    #[serde(default)]
    pub round: RoundConfig,

    /// Consensus coordinator
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// Robust aggregation
    #[serde(default)]
    pub aggregation: AggregationConfig,

    /// Peer reputation
    #[serde(default)]
    pub reputation: ReputationConfig,

    /// Challenge/response verification
    #[serde(default)]
    pub verification: VerificationConfig,

    /// Offline queue
    #[serde(default)]
    pub island: IslandConfig,

    /// Storage settings
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl NodeConfig {
    /// Parse a TOML document; missing sections take their defaults
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content).context("invalid node configuration")?;
        Ok(config)
    }

    /// Load `path` (TOML) layered under `SOVEREIGN__*` environment overrides
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let settings = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("failed to read configuration from {}", path.display()))?;

        let config: Self = settings
            .try_deserialize()
            .context("invalid node configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(!self.node.id.is_empty(), "node.id must not be empty");
        ensure!(
            self.node.connectivity_check_ms > 0,
            "node.connectivity_check_ms must be positive"
        );
        ensure!(self.round.deadline_ms > 0, "round.deadline_ms must be positive");
        ensure!(self.round.max_attempts > 0, "round.max_attempts must be positive");
        ensure!(
            self.coordinator.max_payload_bytes > 0,
            "coordinator.max_payload_bytes must be positive"
        );
        ensure!(
            self.aggregation.selection_size != Some(0),
            "aggregation.selection_size must be positive"
        );
        ensure!(
            self.aggregation.dimension != Some(0),
            "aggregation.dimension must be positive"
        );
        ensure!(
            self.verification.challenge_ttl_ms > 0,
            "verification.challenge_ttl_ms must be positive"
        );
        ensure!(
            self.verification.max_pending_challenges > 0,
            "verification.max_pending_challenges must be positive"
        );
        ensure!(self.island.max_entries > 0, "island.max_entries must be positive");
        self.reputation.validate()?;
        Ok(())
    }
}

/// Basic node settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Node identifier announced to peers
    #[serde(default = "default_node_id")]
    pub id: String,

    /// Hex-encoded 32-byte Ed25519 seed; a fresh key is generated when unset
    #[serde(default)]
    pub key_seed: Option<String>,

    /// Federation-wide attestation secret
    #[serde(default = "default_attestation_secret")]
    pub attestation_secret: String,

    /// Connectivity check interval in milliseconds
    #[serde(default = "default_connectivity_check")]
    pub connectivity_check_ms: u64,

    /// Event bus capacity
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_node_id() -> String {
    "sovereign-node".to_string()
}

fn default_attestation_secret() -> String {
    "sovereign-dev-federation".to_string()
}

fn default_connectivity_check() -> u64 {
    5_000
}

fn default_event_capacity() -> usize {
    1024
}

impl NodeSettings {
    pub fn connectivity_check_interval(&self) -> Duration {
        Duration::from_millis(self.connectivity_check_ms)
    }

    /// Decode `key_seed`, if set
    pub fn seed(&self) -> anyhow::Result<Option<[u8; 32]>> {
        let Some(seed) = &self.key_seed else {
            return Ok(None);
        };
        let bytes = hex::decode(seed).context("node.key_seed is not valid hex")?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("node.key_seed must be 32 bytes"))?;
        Ok(Some(seed))
    }
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            id: default_node_id(),
            key_seed: None,
            attestation_secret: default_attestation_secret(),
            connectivity_check_ms: default_connectivity_check(),
            event_capacity: default_event_capacity(),
        }
    }
}

/// Round driver configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoundConfig {
    /// Time allowed for a proposal to reach quorum (milliseconds)
    #[serde(default = "default_deadline_ms")]
    pub deadline_ms: u64,

    /// Proposals attempted before reporting `InsufficientQuorum`
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_deadline_ms() -> u64 {
    10_000
}

fn default_max_attempts() -> u32 {
    3
}

impl RoundConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }
}

impl Default for RoundConfig {
    fn default() -> Self {
        Self {
            deadline_ms: default_deadline_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

/// Storage backend selection
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    File,
}

/// Storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    /// Data directory for the file backend
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

fn default_data_dir() -> String {
    "./data".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            data_dir: default_data_dir(),
        }
    }
}

/// Log output format
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Metrics configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Record engine events into the registry
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}
