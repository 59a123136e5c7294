//! Sovereign federation node
//!
//! Wires the engine components around one identity:
//!
//! ```text
//!  submit_vector ──► IslandModeManager ──online──► RoundDriver ──► Transport
//!                          │ island                    ▲              │
//!                          ▼                           │              ▼
//!                      IslandLog              handle_envelope ◄── Inbox
//! ```
//!
//! `spawn` starts the message loop and the connectivity monitor; rounds are
//! driven from the caller's task while the loop feeds votes in.

use parking_lot::RwLock;
use sovereign_consensus::{
    encode_vector, AggregationEpoch, AggregationOutcome, ConsensusCoordinator, RobustAggregator,
};
use sovereign_core::{EventBus, NodeId, SharedClock, SovereignError};
use sovereign_crypto::{AttestationService, Ed25519Verifier, KeyPair, KeyedAttestor, PublicKey};
use sovereign_island::{IslandModeManager, ReplayReport, Submission};
use sovereign_security::{ChallengeId, ReputationStore, VerificationProtocol};
use sovereign_storage::{FileStore, KeyValueStore, MemoryStore};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{NodeConfig, StorageBackend};
use crate::driver::RoundDriver;
use crate::message::{Envelope, NetworkMessage};
use crate::metrics::EngineMetrics;
use crate::transport::{Inbox, Transport};

pub struct SovereignNode {
    id: NodeId,
    config: NodeConfig,
    keys: Arc<KeyPair>,
    events: EventBus,
    reputation: Arc<ReputationStore>,
    verification: Arc<VerificationProtocol>,
    attestation: Arc<dyn AttestationService>,
    epoch: Arc<AggregationEpoch>,
    driver: Arc<RoundDriver>,
    island: IslandModeManager,
    transport: Arc<dyn Transport>,
    metrics: EngineMetrics,
    last_aggregate: RwLock<Option<AggregationOutcome>>,
}

impl SovereignNode {
    /// Create a node with the key and storage backend named in `config`
    pub fn new(
        config: NodeConfig,
        transport: Arc<dyn Transport>,
        clock: SharedClock,
    ) -> anyhow::Result<Self> {
        let keys = match config.node.seed()? {
            Some(seed) => KeyPair::from_seed(seed),
            None => KeyPair::generate(),
        };
        let store: Arc<dyn KeyValueStore> = match config.storage.backend {
            StorageBackend::Memory => Arc::new(MemoryStore::new()),
            StorageBackend::File => Arc::new(FileStore::open(&config.storage.data_dir)?),
        };
        Self::with_parts(config, keys, store, transport, clock)
    }

    /// Create a node from explicit parts
    pub fn with_parts(
        config: NodeConfig,
        keys: KeyPair,
        store: Arc<dyn KeyValueStore>,
        transport: Arc<dyn Transport>,
        clock: SharedClock,
    ) -> anyhow::Result<Self> {
        config.validate()?;

        let id = NodeId::new(config.node.id.clone());
        let keys = Arc::new(keys);
        let events = EventBus::new(config.node.event_capacity);

        let reputation = Arc::new(ReputationStore::with_storage(
            config.reputation.clone(),
            clock.clone(),
            store.clone(),
        )?);
        let attestation: Arc<dyn AttestationService> = Arc::new(KeyedAttestor::from_secret(
            config.node.attestation_secret.as_bytes(),
        ));
        let verification = Arc::new(VerificationProtocol::new(
            id.clone(),
            config.verification.clone(),
            reputation.clone(),
            Arc::new(Ed25519Verifier),
            attestation.clone(),
            clock.clone(),
            events.clone(),
        ));
        verification.register_peer(id.clone(), keys.public_key());

        let coordinator = Arc::new(ConsensusCoordinator::new(
            id.clone(),
            config.coordinator.clone(),
            verification.clone(),
            events.clone(),
            clock.clone(),
        ));
        coordinator.add_voter(id.clone());

        let epoch = Arc::new(AggregationEpoch::new(
            id.clone(),
            coordinator,
            verification.clone(),
            RobustAggregator::new(config.aggregation.clone()),
            keys.clone(),
            attestation.clone(),
            events.clone(),
            clock.clone(),
        ));
        let driver = Arc::new(RoundDriver::new(
            id.clone(),
            epoch.clone(),
            reputation.clone(),
            transport.clone(),
            events.clone(),
            config.round.clone(),
        ));
        let island = IslandModeManager::open(
            config.island.clone(),
            store,
            driver.clone(),
            events.clone(),
            clock,
        )?;
        let metrics = EngineMetrics::new()?;

        tracing::info!(
            "Node {} ready (key {}, {} queued island entries)",
            id,
            &keys.public_key().to_hex()[..16],
            island.queue_depth()
        );

        Ok(Self {
            id,
            config,
            keys,
            events,
            reputation,
            verification,
            attestation,
            epoch,
            driver,
            island,
            transport,
            metrics,
            last_aggregate: RwLock::new(None),
        })
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn public_key(&self) -> PublicKey {
        self.keys.public_key()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn coordinator(&self) -> &Arc<ConsensusCoordinator> {
        self.epoch.coordinator()
    }

    pub fn epoch(&self) -> &Arc<AggregationEpoch> {
        &self.epoch
    }

    pub fn reputation(&self) -> &Arc<ReputationStore> {
        &self.reputation
    }

    pub fn verification(&self) -> &Arc<VerificationProtocol> {
        &self.verification
    }

    pub fn island(&self) -> &IslandModeManager {
        &self.island
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    /// Admit a federation peer as a voter
    pub fn register_peer(&self, peer: NodeId, key: PublicKey) {
        self.verification.register_peer(peer.clone(), key);
        self.coordinator().add_voter(peer);
    }

    /// Attest a local update and submit it, online or into the island log
    pub async fn submit_vector(&self, vector: &[f64]) -> Result<Submission, SovereignError> {
        if let Some(dim) = self.epoch.dimension() {
            if vector.len() != dim {
                return Err(SovereignError::InvalidInput(format!(
                    "update has length {}, epoch expects {}",
                    vector.len(),
                    dim
                )));
            }
        }
        let payload = encode_vector(vector)?;
        let proof = self.attestation.attest(&payload);
        let submission = self.island.submit_update(payload, proof).await;
        self.refresh_metrics();
        submission
    }

    /// Process one envelope from a peer, broadcasting any reply
    pub async fn handle_envelope(&self, envelope: Envelope) -> Result<(), SovereignError> {
        if !envelope.is_consistent() {
            tracing::warn!(
                "Dropping {} from {}: sender does not match payload",
                envelope.message.kind(),
                envelope.sender
            );
            return Ok(());
        }

        let sender = envelope.sender;
        match envelope.message {
            NetworkMessage::Proposal(proposal) => {
                if let Err(e) = self.driver.on_proposal(proposal).await {
                    tracing::debug!("Not voting on proposal from {}: {}", sender, e);
                }
            }
            NetworkMessage::Vote(vote) => {
                if let Err(e) = self.driver.on_vote(vote) {
                    tracing::debug!("Vote from {} not counted: {}", sender, e);
                }
            }
            NetworkMessage::Challenge(challenge) => {
                if challenge.target == self.id {
                    let response = self.verification.respond(&challenge, self.keys.as_ref())?;
                    self.send(NetworkMessage::ChallengeResponse(response)).await?;
                }
            }
            NetworkMessage::ChallengeResponse(response) => {
                if self.verification.is_pending(&response.challenge_id) {
                    let outcome = self.verification.verify_response(&response);
                    if let Some(e) = outcome.error {
                        tracing::warn!("Challenge response from {} rejected: {}", sender, e);
                    }
                }
            }
            NetworkMessage::AggregateAnnouncement { round, digest, .. } => {
                let local = self.last_aggregate.read().as_ref().map(|a| a.digest);
                match local {
                    Some(local) if local == digest => {
                        tracing::debug!("Aggregate of {} at round {} matches ours", sender, round)
                    }
                    Some(_) => tracing::info!(
                        "Aggregate of {} at round {} differs from ours",
                        sender,
                        round
                    ),
                    None => {}
                }
            }
        }
        self.refresh_metrics();
        Ok(())
    }

    async fn send(&self, message: NetworkMessage) -> Result<(), SovereignError> {
        let envelope = Envelope::new(self.id.clone(), message);
        self.transport.broadcast(&envelope).await?;
        Ok(())
    }

    /// Challenge `peer` with a signed nonce
    pub async fn challenge_peer(&self, peer: &NodeId) -> Result<ChallengeId, SovereignError> {
        let challenge = self.verification.challenge(peer)?;
        let id = challenge.id;
        self.send(NetworkMessage::Challenge(challenge)).await?;
        Ok(id)
    }

    /// Aggregate the accepted set and announce its digest to peers
    pub async fn publish_aggregate(&self) -> Result<AggregationOutcome, SovereignError> {
        let outcome = self.epoch.aggregate()?;
        *self.last_aggregate.write() = Some(outcome.clone());

        let announcement = NetworkMessage::AggregateAnnouncement {
            round: self.coordinator().round(),
            digest: outcome.digest,
            contributors: outcome.selected.clone(),
        };
        if let Err(e) = self.send(announcement).await {
            tracing::warn!("Aggregate announcement not delivered: {}", e);
        }
        if let Err(e) = self.reputation.persist() {
            tracing::warn!("Failed to persist reputation records: {}", e);
        }
        self.refresh_metrics();
        Ok(outcome)
    }

    /// Leave island mode and replay the queued contributions
    pub async fn reconnect(&self) -> Result<ReplayReport, SovereignError> {
        self.island.exit_island_mode();
        let report = self.island.replay().await;
        self.refresh_metrics();
        report
    }

    /// Reconcile the island mode with transport reachability
    pub async fn check_connectivity(&self) {
        if !self.transport.is_connected() {
            self.island.enter_island_mode();
        } else if self.island.is_island() {
            match self.reconnect().await {
                Ok(report) => tracing::info!("Replayed {} island entries", report.replayed),
                Err(e) => tracing::warn!("Island replay failed: {}", e),
            }
        }
    }

    pub fn refresh_metrics(&self) {
        self.metrics.set_island_queue_depth(self.island.queue_depth());
        self.metrics
            .set_blacklisted_peers(self.reputation.blacklisted_count());
    }

    /// Metrics in Prometheus text format
    pub fn render_metrics(&self) -> anyhow::Result<String> {
        self.refresh_metrics();
        self.metrics.render()
    }

    pub fn persist(&self) -> Result<(), SovereignError> {
        self.reputation.persist()
    }

    /// Start the message loop and connectivity monitor
    pub fn spawn(self: &Arc<Self>) -> NodeHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let inbox = self.transport.subscribe();

        let recorder = self
            .config
            .metrics
            .enabled
            .then(|| self.metrics.spawn_recorder(self.events.subscribe()));
        let message_loop = tokio::spawn(self.clone().run(inbox, shutdown_rx));
        let monitor = tokio::spawn(self.clone().monitor_connectivity());

        NodeHandle {
            shutdown_tx,
            message_loop,
            monitor,
            recorder,
        }
    }

    async fn run(self: Arc<Self>, mut inbox: Inbox, mut shutdown_rx: mpsc::Receiver<()>) {
        tracing::info!("Node {} listening", self.id);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("Node {} shutting down", self.id);
                    break;
                }
                envelope = inbox.recv() => {
                    let Some(envelope) = envelope else {
                        tracing::warn!("Node {} lost its transport", self.id);
                        break;
                    };
                    if let Err(e) = self.handle_envelope(envelope).await {
                        tracing::warn!("Node {} failed to handle message: {}", self.id, e);
                    }
                }
            }
        }
        if let Err(e) = self.persist() {
            tracing::warn!("Failed to persist reputation records: {}", e);
        }
    }

    async fn monitor_connectivity(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.node.connectivity_check_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.check_connectivity().await;
        }
    }
}

/// Background tasks of a spawned node
pub struct NodeHandle {
    shutdown_tx: mpsc::Sender<()>,
    message_loop: JoinHandle<()>,
    monitor: JoinHandle<()>,
    recorder: Option<JoinHandle<()>>,
}

impl NodeHandle {
    /// Stop the background tasks and wait for the message loop to finish
    pub async fn shutdown(self) {
        self.monitor.abort();
        let _ = self.shutdown_tx.send(()).await;
        let _ = self.message_loop.await;
        if let Some(recorder) = self.recorder {
            recorder.abort();
        }
    }
}
