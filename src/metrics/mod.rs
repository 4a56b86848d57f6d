//! Prometheus metrics for the consensus, sync and storage subsystems,
//! exposed over a small HTTP endpoint.

use std::net::SocketAddr;
use std::sync::atomic::AtomicI64;
use std::sync::Arc;

use axum::{extract::State, routing::get, Router};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

#[derive(Clone)]
pub struct Metrics {
    pub registry: Arc<std::sync::Mutex<Registry>>,

    pub consensus_height: Gauge<i64, AtomicI64>,
    pub consensus_round: Gauge<i64, AtomicI64>,
    pub consensus_proposals_received: Counter,
    pub consensus_votes_received: Counter,
    pub consensus_blocks_committed: Counter,

    pub sync_blocks_applied: Counter,
    pub sync_peers: Gauge<i64, AtomicI64>,

    pub store_height: Gauge<i64, AtomicI64>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let consensus_height = Gauge::<i64, AtomicI64>::default();
        registry.register(
            "merklebft_consensus_height",
            "Current consensus height",
            consensus_height.clone(),
        );

        let consensus_round = Gauge::<i64, AtomicI64>::default();
        registry.register(
            "merklebft_consensus_round",
            "Current consensus round",
            consensus_round.clone(),
        );

        let consensus_proposals_received = Counter::default();
        registry.register(
            "merklebft_consensus_proposals_received_total",
            "Proposals received",
            consensus_proposals_received.clone(),
        );

        let consensus_votes_received = Counter::default();
        registry.register(
            "merklebft_consensus_votes_received_total",
            "Votes received",
            consensus_votes_received.clone(),
        );

        let consensus_blocks_committed = Counter::default();
        registry.register(
            "merklebft_consensus_blocks_committed_total",
            "Blocks committed by consensus",
            consensus_blocks_committed.clone(),
        );

        let sync_blocks_applied = Counter::default();
        registry.register(
            "merklebft_sync_blocks_applied_total",
            "Blocks applied during catch-up",
            sync_blocks_applied.clone(),
        );

        let sync_peers = Gauge::<i64, AtomicI64>::default();
        registry.register("merklebft_sync_peers", "Connected peers", sync_peers.clone());

        let store_height = Gauge::<i64, AtomicI64>::default();
        registry.register(
            "merklebft_store_height",
            "Block store height",
            store_height.clone(),
        );

        Self {
            registry: Arc::new(std::sync::Mutex::new(registry)),
            consensus_height,
            consensus_round,
            consensus_proposals_received,
            consensus_votes_received,
            consensus_blocks_committed,
            sync_blocks_applied,
            sync_peers,
            store_height,
        }
    }

    /// Prometheus text exposition format.
    pub fn encode(&self) -> String {
        let mut buf = String::new();
        let registry = self.registry.lock().expect("metrics lock");
        let _ = prometheus_client::encoding::text::encode(&mut buf, &registry);
        buf
    }
}

#[derive(Clone, Debug)]
pub struct MetricsConfig {
    pub listen_addr: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:26660".to_string(),
        }
    }
}

/// Standalone HTTP server exposing `GET /metrics`.
pub struct MetricsServer {
    pub config: MetricsConfig,
    pub metrics: Arc<Metrics>,
}

impl MetricsServer {
    pub fn new(config: MetricsConfig, metrics: Arc<Metrics>) -> Self {
        Self { config, metrics }
    }

    pub async fn run(self) -> Result<(), anyhow::Error> {
        let app = Router::new()
            .route("/metrics", get(handle_metrics))
            .with_state(self.metrics);

        let addr: SocketAddr = self.config.listen_addr.parse()?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;
        Ok(())
    }
}

async fn handle_metrics(State(metrics): State<Arc<Metrics>>) -> String {
    metrics.encode()
}
