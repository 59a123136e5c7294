//! Peer reputation store
//!
//! Scores follow an exponential moving average of verification outcomes,
//! `score' = alpha * outcome + (1 - alpha) * score`, clamped to
//! `[min_score, max_score]`. Peers that stay silent decay toward a neutral
//! floor; peers whose score falls to the blacklist threshold lose their vote
//! weight and stop receiving challenges.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sovereign_core::{NodeId, SharedClock, SovereignError, Timestamp};
use sovereign_storage::{get_typed, put_typed, KeyValueStore};
use std::sync::Arc;

/// Storage key of the persisted record map
pub const RECORDS_KEY: &str = "reputation/records";

/// Whether a blacklisted peer can earn its way back
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryPolicy {
    /// Lifted once the score climbs back to `recovery_threshold`
    #[default]
    Recoverable,
    /// Sticky for the lifetime of the store
    Permanent,
}

/// Reputation configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReputationConfig {
    /// EMA smoothing factor
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    /// Score assigned on first contact
    #[serde(default = "default_initial_score")]
    pub initial_score: f64,
    #[serde(default = "default_min_score")]
    pub min_score: f64,
    #[serde(default = "default_max_score")]
    pub max_score: f64,
    /// Blacklisted at or below this score
    #[serde(default = "default_blacklist_threshold")]
    pub blacklist_threshold: f64,
    /// Score a blacklisted peer must reach to be restored
    #[serde(default = "default_recovery_threshold")]
    pub recovery_threshold: f64,
    /// Neutral score idle peers decay toward
    #[serde(default = "default_decay_floor")]
    pub decay_floor: f64,
    /// Time for the distance to the floor to halve (seconds, 0 disables decay)
    #[serde(default = "default_decay_half_life_secs")]
    pub decay_half_life_secs: u64,
    #[serde(default)]
    pub recovery_policy: RecoveryPolicy,
}

fn default_alpha() -> f64 {
    sovereign_core::constants::DEFAULT_REPUTATION_ALPHA
}

fn default_initial_score() -> f64 {
    1.0
}

fn default_min_score() -> f64 {
    0.0
}

fn default_max_score() -> f64 {
    1.0
}

fn default_blacklist_threshold() -> f64 {
    // Five consecutive failures from a perfect score: 0.8^5 = 0.328
    0.35
}

fn default_recovery_threshold() -> f64 {
    0.6
}

fn default_decay_floor() -> f64 {
    0.5
}

fn default_decay_half_life_secs() -> u64 {
    24 * 60 * 60
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            alpha: default_alpha(),
            initial_score: default_initial_score(),
            min_score: default_min_score(),
            max_score: default_max_score(),
            blacklist_threshold: default_blacklist_threshold(),
            recovery_threshold: default_recovery_threshold(),
            decay_floor: default_decay_floor(),
            decay_half_life_secs: default_decay_half_life_secs(),
            recovery_policy: RecoveryPolicy::default(),
        }
    }
}

impl ReputationConfig {
    pub fn validate(&self) -> Result<(), SovereignError> {
        let invalid = |msg: &str| -> Result<(), SovereignError> {
            Err(SovereignError::InvalidInput(format!("reputation: {}", msg)))
        };

        if !(self.alpha > 0.0 && self.alpha <= 1.0) {
            return invalid("alpha must be in (0, 1]");
        }
        if !(self.min_score < self.max_score) {
            return invalid("min_score must be below max_score");
        }
        let in_range = |v: f64| v >= self.min_score && v <= self.max_score;
        if !in_range(self.initial_score) || !in_range(self.decay_floor) {
            return invalid("initial_score and decay_floor must lie within the score range");
        }
        if !(self.blacklist_threshold >= self.min_score
            && self.blacklist_threshold < self.initial_score)
        {
            return invalid("blacklist_threshold must be below initial_score");
        }
        if self.recovery_threshold <= self.blacklist_threshold
            || self.recovery_threshold > self.max_score
        {
            return invalid("recovery_threshold must lie above blacklist_threshold");
        }
        Ok(())
    }
}

/// Per-peer reputation record
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReputationRecord {
    /// Score as of `last_updated`, before decay
    pub score: f64,
    pub last_updated: Timestamp,
    pub interaction_count: u64,
    pub successes: u64,
    pub failures: u64,
    pub blacklisted: bool,
    pub blacklisted_at: Option<Timestamp>,
}

impl ReputationRecord {
    fn new(score: f64, now: Timestamp) -> Self {
        Self {
            score,
            last_updated: now,
            interaction_count: 0,
            successes: 0,
            failures: 0,
            blacklisted: false,
            blacklisted_at: None,
        }
    }
}

/// Result of applying one outcome
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ReputationUpdate {
    pub previous: f64,
    pub score: f64,
    pub blacklisted: bool,
    pub newly_blacklisted: bool,
    pub restored: bool,
}

/// Read-only view of one peer
#[derive(Clone, Debug, PartialEq)]
pub struct PeerReputation {
    pub peer: NodeId,
    /// Decayed score at snapshot time
    pub score: f64,
    pub blacklisted: bool,
    pub interaction_count: u64,
}

/// Reputation store
///
/// Mutations of one peer are serialized by the map's shard lock; different
/// peers update concurrently.
pub struct ReputationStore {
    records: DashMap<NodeId, ReputationRecord>,
    config: ReputationConfig,
    clock: SharedClock,
    storage: Option<Arc<dyn KeyValueStore>>,
}

impl ReputationStore {
    pub fn new(config: ReputationConfig, clock: SharedClock) -> Self {
        Self {
            records: DashMap::new(),
            config,
            clock,
            storage: None,
        }
    }

    /// Create a store backed by `storage`, loading any persisted records
    pub fn with_storage(
        config: ReputationConfig,
        clock: SharedClock,
        storage: Arc<dyn KeyValueStore>,
    ) -> Result<Self, SovereignError> {
        let records = DashMap::new();
        let persisted: Option<Vec<(NodeId, ReputationRecord)>> =
            get_typed(storage.as_ref(), RECORDS_KEY)?;
        if let Some(persisted) = persisted {
            tracing::info!("Loaded {} reputation records", persisted.len());
            for (peer, record) in persisted {
                records.insert(peer, record);
            }
        }

        Ok(Self {
            records,
            config,
            clock,
            storage: Some(storage),
        })
    }

    pub fn config(&self) -> &ReputationConfig {
        &self.config
    }

    fn clamp(&self, score: f64) -> f64 {
        score.clamp(self.config.min_score, self.config.max_score)
    }

    /// Score after decaying toward the floor for the time elapsed since the
    /// last update. Scores already at or below the floor do not move: idle
    /// time neither punishes nor forgives.
    fn decayed(&self, record: &ReputationRecord, now: Timestamp) -> f64 {
        let floor = self.config.decay_floor;
        if self.config.decay_half_life_secs == 0 || record.score <= floor {
            return record.score;
        }
        let elapsed_secs = (now - record.last_updated).max(0) as f64 / 1000.0;
        let factor = 0.5f64.powf(elapsed_secs / self.config.decay_half_life_secs as f64);
        self.clamp(floor + (record.score - floor) * factor)
    }

    /// Apply a verification outcome to `peer`
    pub fn update(&self, peer: &NodeId, success: bool) -> ReputationUpdate {
        let now = self.clock.now_millis();
        let initial = self.config.initial_score;
        let mut entry = self
            .records
            .entry(peer.clone())
            .or_insert_with(|| ReputationRecord::new(initial, now));
        let record = entry.value_mut();

        let previous = self.decayed(record, now);
        let outcome = if success { 1.0 } else { 0.0 };
        let score = self.clamp(self.config.alpha * outcome + (1.0 - self.config.alpha) * previous);

        record.score = score;
        record.last_updated = now;
        record.interaction_count += 1;
        if success {
            record.successes += 1;
        } else {
            record.failures += 1;
        }

        let was_blacklisted = record.blacklisted;
        if score <= self.config.blacklist_threshold {
            record.blacklisted = true;
        } else if was_blacklisted
            && self.config.recovery_policy == RecoveryPolicy::Recoverable
            && score >= self.config.recovery_threshold
        {
            record.blacklisted = false;
            record.blacklisted_at = None;
        }

        let newly_blacklisted = !was_blacklisted && record.blacklisted;
        let restored = was_blacklisted && !record.blacklisted;
        if newly_blacklisted {
            record.blacklisted_at = Some(now);
            tracing::warn!("Peer {} blacklisted at score {:.3}", peer, score);
        } else if restored {
            tracing::info!("Peer {} restored at score {:.3}", peer, score);
        } else {
            tracing::debug!(
                "Reputation of {}: {:.3} -> {:.3} ({})",
                peer,
                previous,
                score,
                if success { "success" } else { "failure" }
            );
        }

        ReputationUpdate {
            previous,
            score,
            blacklisted: record.blacklisted,
            newly_blacklisted,
            restored,
        }
    }

    /// Current (decayed) score; unknown peers report the initial score
    pub fn score(&self, peer: &NodeId) -> f64 {
        let now = self.clock.now_millis();
        self.records
            .get(peer)
            .map(|r| self.decayed(r.value(), now))
            .unwrap_or(self.config.initial_score)
    }

    /// Current score, or `None` for peers never seen
    pub fn get_reputation(&self, peer: &NodeId) -> Option<f64> {
        let now = self.clock.now_millis();
        self.records.get(peer).map(|r| self.decayed(r.value(), now))
    }

    pub fn get_record(&self, peer: &NodeId) -> Option<ReputationRecord> {
        self.records.get(peer).map(|r| r.value().clone())
    }

    pub fn is_blacklisted(&self, peer: &NodeId) -> bool {
        self.records
            .get(peer)
            .map(|r| r.blacklisted)
            .unwrap_or(false)
    }

    /// Weight of the peer's vote: zero when blacklisted, otherwise its score
    pub fn vote_weight(&self, peer: &NodeId) -> f64 {
        if self.is_blacklisted(peer) {
            0.0
        } else {
            self.score(peer)
        }
    }

    pub fn peer_count(&self) -> usize {
        self.records.len()
    }

    pub fn blacklisted_count(&self) -> usize {
        self.records.iter().filter(|r| r.blacklisted).count()
    }

    /// Point-in-time view of every known peer, ordered by peer ID
    pub fn snapshot(&self) -> Vec<PeerReputation> {
        let now = self.clock.now_millis();
        let mut peers: Vec<_> = self
            .records
            .iter()
            .map(|r| PeerReputation {
                peer: r.key().clone(),
                score: self.decayed(r.value(), now),
                blacklisted: r.blacklisted,
                interaction_count: r.interaction_count,
            })
            .collect();
        peers.sort_by(|a, b| a.peer.cmp(&b.peer));
        peers
    }

    /// Write all records to the backing store, if any
    pub fn persist(&self) -> Result<(), SovereignError> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };
        let mut records: Vec<(NodeId, ReputationRecord)> = self
            .records
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect();
        records.sort_by(|a, b| a.0.cmp(&b.0));
        put_typed(storage.as_ref(), RECORDS_KEY, &records)?;
        tracing::debug!("Persisted {} reputation records", records.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sovereign_core::ManualClock;
    use sovereign_storage::MemoryStore;

    const DAY_MS: i64 = 24 * 60 * 60 * 1000;

    fn store_with_clock() -> (ReputationStore, ManualClock) {
        let clock = ManualClock::new(1_700_000_000_000);
        let store = ReputationStore::new(ReputationConfig::default(), Arc::new(clock.clone()));
        (store, clock)
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(ReputationConfig::default().validate().is_ok());

        let bad = ReputationConfig {
            alpha: 0.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        let bad = ReputationConfig {
            recovery_threshold: 0.2,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_ema_update() {
        let (store, _) = store_with_clock();
        let peer = NodeId::from("alice");

        let update = store.update(&peer, false);
        assert!((update.previous - 1.0).abs() < 1e-12);
        assert!((update.score - 0.8).abs() < 1e-12);

        let update = store.update(&peer, true);
        assert!((update.score - (0.2 + 0.8 * 0.8)).abs() < 1e-12);
        assert_eq!(store.get_record(&peer).unwrap().interaction_count, 2);
    }

    #[test]
    fn test_failures_versus_successes() {
        let (store, _) = store_with_clock();
        let good = NodeId::from("good");
        let bad = NodeId::from("bad");

        for _ in 0..5 {
            store.update(&good, true);
            store.update(&bad, false);
        }

        assert!(store.score(&bad) < store.score(&good));
        assert!(store.is_blacklisted(&bad));
        assert!(!store.is_blacklisted(&good));
        assert_eq!(store.vote_weight(&bad), 0.0);
        assert!((store.vote_weight(&good) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_four_failures_not_blacklisted() {
        let (store, _) = store_with_clock();
        let peer = NodeId::from("flaky");
        for _ in 0..4 {
            store.update(&peer, false);
        }
        assert!(!store.is_blacklisted(&peer));

        let update = store.update(&peer, false);
        assert!(update.newly_blacklisted);
        assert_eq!(store.blacklisted_count(), 1);
    }

    #[test]
    fn test_unknown_peer_defaults() {
        let (store, _) = store_with_clock();
        let stranger = NodeId::from("stranger");
        assert_eq!(store.get_reputation(&stranger), None);
        assert_eq!(store.score(&stranger), 1.0);
        assert_eq!(store.vote_weight(&stranger), 1.0);
        assert!(!store.is_blacklisted(&stranger));
    }

    #[test]
    fn test_decay_toward_floor() {
        let (store, clock) = store_with_clock();
        let peer = NodeId::from("idle");
        store.update(&peer, true);
        assert!((store.score(&peer) - 1.0).abs() < 1e-12);

        clock.advance(DAY_MS);
        assert!((store.score(&peer) - 0.75).abs() < 1e-9);

        clock.advance(10 * DAY_MS);
        let score = store.score(&peer);
        assert!(score > 0.5 && score < 0.501);
    }

    #[test]
    fn test_decay_does_not_forgive() {
        let (store, clock) = store_with_clock();
        let peer = NodeId::from("mallory");
        for _ in 0..5 {
            store.update(&peer, false);
        }
        let before = store.score(&peer);

        clock.advance(30 * DAY_MS);
        assert_eq!(store.score(&peer), before);
        assert!(store.is_blacklisted(&peer));
    }

    #[test]
    fn test_recoverable_policy() {
        let (store, _) = store_with_clock();
        let peer = NodeId::from("reformed");
        for _ in 0..5 {
            store.update(&peer, false);
        }
        assert!(store.is_blacklisted(&peer));

        // 0.328 -> 0.462 -> 0.570 stays listed, 0.656 clears the recovery threshold
        assert!(!store.update(&peer, true).restored);
        assert!(!store.update(&peer, true).restored);
        let update = store.update(&peer, true);
        assert!(update.restored);
        assert!(!store.is_blacklisted(&peer));
    }

    #[test]
    fn test_permanent_policy() {
        let clock = ManualClock::new(0);
        let config = ReputationConfig {
            recovery_policy: RecoveryPolicy::Permanent,
            ..Default::default()
        };
        let store = ReputationStore::new(config, Arc::new(clock));
        let peer = NodeId::from("banned");
        for _ in 0..5 {
            store.update(&peer, false);
        }
        for _ in 0..20 {
            store.update(&peer, true);
        }
        assert!(store.score(&peer) > 0.9);
        assert!(store.is_blacklisted(&peer));
        assert_eq!(store.vote_weight(&peer), 0.0);
    }

    #[test]
    fn test_persist_and_reload() {
        let clock: SharedClock = Arc::new(ManualClock::new(0));
        let storage: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());

        let store =
            ReputationStore::with_storage(ReputationConfig::default(), clock.clone(), storage.clone())
                .unwrap();
        store.update(&NodeId::from("a"), false);
        for _ in 0..5 {
            store.update(&NodeId::from("b"), false);
        }
        store.persist().unwrap();

        let reloaded =
            ReputationStore::with_storage(ReputationConfig::default(), clock, storage).unwrap();
        assert_eq!(reloaded.peer_count(), 2);
        assert!((reloaded.score(&NodeId::from("a")) - 0.8).abs() < 1e-12);
        assert!(reloaded.is_blacklisted(&NodeId::from("b")));
    }

    #[test]
    fn test_snapshot_sorted() {
        let (store, _) = store_with_clock();
        store.update(&NodeId::from("c"), true);
        store.update(&NodeId::from("a"), false);
        store.update(&NodeId::from("b"), true);

        let names: Vec<_> = store
            .snapshot()
            .into_iter()
            .map(|p| p.peer.as_str().to_string())
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_concurrent_updates_are_serialized() {
        let (store, _) = store_with_clock();
        let store = Arc::new(store);
        let peer = NodeId::from("busy");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let peer = peer.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        store.update(&peer, true);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.get_record(&peer).unwrap().interaction_count, 800);
    }
}
