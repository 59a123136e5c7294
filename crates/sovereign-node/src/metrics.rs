//! Prometheus metrics fed from engine events

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use sovereign_core::EngineEvent;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Engine counters and gauges in a private registry
#[derive(Clone)]
pub struct EngineMetrics {
    registry: Registry,
    rounds_committed: IntCounter,
    rounds_aborted: IntCounter,
    byzantine_faults: IntCounterVec,
    island_queue_depth: IntGauge,
    blacklisted_peers: IntGauge,
}

impl EngineMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let rounds_committed = IntCounter::new(
            "sovereign_rounds_committed_total",
            "Consensus rounds committed",
        )?;
        let rounds_aborted =
            IntCounter::new("sovereign_rounds_aborted_total", "Consensus rounds aborted")?;
        let byzantine_faults = IntCounterVec::new(
            Opts::new(
                "sovereign_byzantine_faults_total",
                "Byzantine faults detected, by reason",
            ),
            &["reason"],
        )?;
        let island_queue_depth =
            IntGauge::new("sovereign_island_queue_depth", "Entries queued in the island log")?;
        let blacklisted_peers =
            IntGauge::new("sovereign_blacklisted_peers", "Peers currently blacklisted")?;

        registry.register(Box::new(rounds_committed.clone()))?;
        registry.register(Box::new(rounds_aborted.clone()))?;
        registry.register(Box::new(byzantine_faults.clone()))?;
        registry.register(Box::new(island_queue_depth.clone()))?;
        registry.register(Box::new(blacklisted_peers.clone()))?;

        Ok(Self {
            registry,
            rounds_committed,
            rounds_aborted,
            byzantine_faults,
            island_queue_depth,
            blacklisted_peers,
        })
    }

    /// Count an engine event
    pub fn observe(&self, event: &EngineEvent) {
        match event {
            EngineEvent::RoundCommitted { .. } => self.rounds_committed.inc(),
            EngineEvent::RoundAborted { .. } => self.rounds_aborted.inc(),
            EngineEvent::ByzantineFaultDetected { reason, .. } => {
                let reason = reason.to_string();
                self.byzantine_faults
                    .with_label_values(&[reason.as_str()])
                    .inc();
            }
            _ => {}
        }
    }

    pub fn set_island_queue_depth(&self, depth: usize) {
        self.island_queue_depth.set(depth as i64);
    }

    pub fn set_blacklisted_peers(&self, count: usize) {
        self.blacklisted_peers.set(count as i64);
    }

    pub fn rounds_committed(&self) -> u64 {
        self.rounds_committed.get()
    }

    pub fn rounds_aborted(&self) -> u64 {
        self.rounds_aborted.get()
    }

    /// Text exposition format
    pub fn render(&self) -> anyhow::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    /// Count every event published on `rx` until the bus closes
    pub fn spawn_recorder(&self, mut rx: broadcast::Receiver<EngineEvent>) -> JoinHandle<()> {
        let metrics = self.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => metrics.observe(&event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!("Metrics recorder lagged, {} events missed", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
