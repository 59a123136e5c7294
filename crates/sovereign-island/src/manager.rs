//! Online/island mode switching and the offline submission queue

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sovereign_core::{
    ChainHash, ConnectivityMode, EngineEvent, EventBus, ProposalId, SharedClock, SovereignError,
};
use sovereign_crypto::Proof;
use sovereign_storage::{get_typed, put_typed, KeyValueStore};
use std::sync::Arc;

use crate::log::{IslandLog, IslandLogEntry};

/// Storage key of the persisted island log
pub const LOG_KEY: &str = "island/log";

/// Island mode configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IslandConfig {
    /// Maximum number of queued entries
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

fn default_max_entries() -> usize {
    10_000
}

impl Default for IslandConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
        }
    }
}

/// Where online submissions go
#[async_trait]
pub trait SubmissionBackend: Send + Sync {
    /// Run the contribution through the proposal path
    async fn submit(&self, payload: Vec<u8>, proof: Proof) -> Result<ProposalId, SovereignError>;
}

/// Outcome of `submit_update`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Submission {
    /// Forwarded to the proposal path
    Online(ProposalId),
    /// Appended to the island log at this sequence number
    Queued { sequence: u64 },
}

/// Verified contents of the persisted log
#[derive(Clone, Debug)]
pub struct SyncReport {
    /// Entries in ascending sequence order
    pub entries: Vec<IslandLogEntry>,
    pub chain_valid: bool,
    pub head: ChainHash,
}

/// Outcome of a successful `replay`
#[derive(Clone, Debug, Default)]
pub struct ReplayReport {
    pub replayed: usize,
    pub proposals: Vec<ProposalId>,
}

/// Routes local contributions online or into the island log.
///
/// Mode is driven externally through `enter_island_mode` and
/// `exit_island_mode`; the log is persisted on every append and only emptied
/// as a batch by `flush` after a successful `sync`.
pub struct IslandModeManager {
    config: IslandConfig,
    mode: RwLock<ConnectivityMode>,
    log: Mutex<IslandLog>,
    /// Head observed by the last successful sync
    synced_head: Mutex<Option<ChainHash>>,
    store: Arc<dyn KeyValueStore>,
    backend: Arc<dyn SubmissionBackend>,
    events: EventBus,
    clock: SharedClock,
}

impl IslandModeManager {
    /// Load and verify the persisted log, starting in online mode
    pub fn open(
        config: IslandConfig,
        store: Arc<dyn KeyValueStore>,
        backend: Arc<dyn SubmissionBackend>,
        events: EventBus,
        clock: SharedClock,
    ) -> Result<Self, SovereignError> {
        let log = Self::load(store.as_ref())?;
        if !log.is_empty() {
            tracing::info!(
                "Recovered island log with {} entries, head {}",
                log.len(),
                log.head()
            );
        }
        Ok(Self {
            config,
            mode: RwLock::new(ConnectivityMode::Online),
            log: Mutex::new(log),
            synced_head: Mutex::new(None),
            store,
            backend,
            events,
            clock,
        })
    }

    fn load(store: &dyn KeyValueStore) -> Result<IslandLog, SovereignError> {
        let log: IslandLog = get_typed(store, LOG_KEY)?.unwrap_or_default();
        if let Err(e) = log.verify() {
            tracing::warn!("Persisted island log failed verification: {}", e);
            return Err(e);
        }
        Ok(log)
    }

    pub fn mode(&self) -> ConnectivityMode {
        *self.mode.read()
    }

    pub fn is_island(&self) -> bool {
        self.mode() == ConnectivityMode::Island
    }

    /// Switch to island mode. Returns false if already there.
    pub fn enter_island_mode(&self) -> bool {
        {
            let mut mode = self.mode.write();
            if *mode == ConnectivityMode::Island {
                return false;
            }
            *mode = ConnectivityMode::Island;
        }
        tracing::warn!("Connectivity lost, entering island mode");
        self.events.publish(EngineEvent::IslandModeEntered);
        true
    }

    /// Switch back online. Queued entries stay until replayed.
    pub fn exit_island_mode(&self) -> bool {
        {
            let mut mode = self.mode.write();
            if *mode == ConnectivityMode::Online {
                return false;
            }
            *mode = ConnectivityMode::Online;
        }
        let queued = self.queue_depth();
        tracing::info!("Connectivity restored, {} entries queued", queued);
        self.events.publish(EngineEvent::IslandModeExited { queued });
        true
    }

    /// Submit a local contribution.
    ///
    /// Online it is forwarded to the backend; in island mode it is appended to
    /// the log, or rejected with `CapacityExceeded` once the log is full.
    pub async fn submit_update(
        &self,
        payload: Vec<u8>,
        proof: Proof,
    ) -> Result<Submission, SovereignError> {
        match self.mode() {
            ConnectivityMode::Online => {
                let id = self.backend.submit(payload, proof).await?;
                Ok(Submission::Online(id))
            }
            ConnectivityMode::Island => self.enqueue(payload, proof),
        }
    }

    fn enqueue(&self, payload: Vec<u8>, proof: Proof) -> Result<Submission, SovereignError> {
        let mut log = self.log.lock();
        if log.len() >= self.config.max_entries {
            tracing::warn!("Island log full ({} entries)", log.len());
            return Err(SovereignError::CapacityExceeded {
                max: self.config.max_entries,
            });
        }

        let sequence = log.append(payload, proof, self.clock.now_millis()).sequence;
        if let Err(e) = put_typed(self.store.as_ref(), LOG_KEY, &*log) {
            log.pop();
            return Err(e.into());
        }
        tracing::debug!("Queued island entry {}, head {}", sequence, log.head());
        Ok(Submission::Queued { sequence })
    }

    /// Re-read the persisted chain and verify every hash.
    ///
    /// On success the in-memory log is replaced by the verified one and its
    /// head recorded as the point `flush` may clear up to.
    pub fn sync(&self) -> Result<SyncReport, SovereignError> {
        let mut log = self.log.lock();
        let stored = Self::load(self.store.as_ref())?;
        *log = stored;

        let head = log.head();
        *self.synced_head.lock() = Some(head);
        tracing::info!("Synced island log: {} entries, head {}", log.len(), head);

        Ok(SyncReport {
            entries: log.entries().to_vec(),
            chain_valid: true,
            head,
        })
    }

    /// Delete every entry and reset to genesis.
    ///
    /// Only legal while the head still matches the last successful sync.
    pub fn flush(&self) -> Result<usize, SovereignError> {
        let mut log = self.log.lock();
        let mut synced = self.synced_head.lock();
        if *synced != Some(log.head()) {
            return Err(SovereignError::ProtocolViolation {
                operation: "flush",
                state: "unsynced".to_string(),
            });
        }

        self.store.delete(LOG_KEY)?;
        let flushed = log.len();
        log.clear();
        *synced = None;
        tracing::info!("Flushed {} island entries", flushed);
        Ok(flushed)
    }

    /// Resubmit every queued entry in order, then flush.
    ///
    /// Stops at the first failed resubmission and leaves the log intact.
    pub async fn replay(&self) -> Result<ReplayReport, SovereignError> {
        if self.is_island() {
            return Err(SovereignError::ProtocolViolation {
                operation: "replay",
                state: "island".to_string(),
            });
        }

        let report = self.sync()?;
        let mut proposals = Vec::with_capacity(report.entries.len());
        for entry in report.entries {
            match self.backend.submit(entry.payload, entry.proof).await {
                Ok(id) => proposals.push(id),
                Err(e) => {
                    tracing::warn!("Replay stopped at island entry {}: {}", entry.sequence, e);
                    return Err(e);
                }
            }
        }

        let replayed = self.flush()?;
        Ok(ReplayReport {
            replayed,
            proposals,
        })
    }

    /// Chain head, publishable to peers
    pub fn head_hash(&self) -> ChainHash {
        self.log.lock().head()
    }

    pub fn queue_depth(&self) -> usize {
        self.log.lock().len()
    }

    pub fn entries(&self) -> Vec<IslandLogEntry> {
        self.log.lock().entries().to_vec()
    }

    pub fn config(&self) -> &IslandConfig {
        &self.config
    }
}
