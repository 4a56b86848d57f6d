use std::path::Path;
use std::sync::{Arc, RwLock as StdRwLock};

use crossbeam_channel::bounded;
use tokio::sync::mpsc;
use tracing::{error, info};

use merklebft::config::NodeConfig;
use merklebft::consensus::{
    ConsensusConfig, ConsensusEvent, ConsensusOutput, ConsensusReactor, ConsensusState, RoundState,
    TimerService,
};
use merklebft::crypto::PrivValidator;
use merklebft::db::{Db, RocksDb};
use merklebft::mempool::Mempool;
use merklebft::metrics::{Metrics, MetricsConfig, MetricsServer};
use merklebft::p2p::Switch;
use merklebft::state::State;
use merklebft::store::BlockStore;
use merklebft::sync::{BlockchainReactor, BlockchainReactorConfig};
use merklebft::types::GenesisDoc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -------------------------------------------------------
    // 0. Configuration and logging
    // -------------------------------------------------------
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());
    let cfg = NodeConfig::load_or_default(Path::new(&config_path));
    init_logging(&cfg.logging);

    info!(config_path = %config_path, "loading configuration");
    std::fs::create_dir_all(&cfg.node.data_dir)?;

    // -------------------------------------------------------
    // 1. Metrics
    // -------------------------------------------------------
    let metrics = Arc::new(Metrics::new());
    if cfg.observability.metrics_enabled {
        let server = MetricsServer::new(
            MetricsConfig {
                listen_addr: cfg.observability.metrics_listen_addr.clone(),
            },
            metrics.clone(),
        );
        info!(addr = %cfg.observability.metrics_listen_addr, "starting metrics exporter");
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!(error = %e, "metrics server error");
            }
        });
    }

    // -------------------------------------------------------
    // 2. Storage
    // -------------------------------------------------------
    let block_db: Arc<dyn Db> =
        Arc::new(RocksDb::open(Path::new(&format!("{}/blockstore", cfg.node.data_dir)))?);
    let state_db: Arc<dyn Db> =
        Arc::new(RocksDb::open(Path::new(&format!("{}/state", cfg.node.data_dir)))?);
    let block_store = Arc::new(BlockStore::new(block_db));
    metrics.store_height.set(block_store.height() as i64);

    // -------------------------------------------------------
    // 3. State: resume from db or bootstrap from genesis
    // -------------------------------------------------------
    let state = match State::load(state_db.clone())? {
        Some(state) => {
            info!(height = state.last_block_height, chain_id = %state.chain_id, "resuming state");
            state
        }
        None => {
            let genesis = GenesisDoc::from_file(Path::new(&cfg.node.genesis_file))?;
            let mut state = State::from_genesis(state_db.clone(), &genesis)?;
            state.save();
            info!(chain_id = %state.chain_id, validators = state.bonded_validators.size(), "bootstrapped from genesis");
            state
        }
    };

    // -------------------------------------------------------
    // 4. Validator identity
    // -------------------------------------------------------
    let priv_validator =
        PrivValidator::load_or_generate(Path::new(&cfg.node.priv_validator_file))?;
    info!(address = %priv_validator.address, "validator identity loaded");

    // -------------------------------------------------------
    // 5. Switch and blockchain (catch-up) reactor
    // -------------------------------------------------------
    let switch = Switch::new();

    let (handoff_tx, mut handoff_rx) = mpsc::channel::<State>(1);
    let blockchain_reactor = BlockchainReactor::new(
        BlockchainReactorConfig {
            stop_syncing_secs: cfg.sync.stop_syncing_secs,
        },
        state.clone(),
        block_store.clone(),
        handoff_tx,
        metrics.clone(),
    );
    switch.add_reactor(blockchain_reactor.clone());

    // -------------------------------------------------------
    // 6. Consensus machinery (idle until catch-up hands off)
    // -------------------------------------------------------
    let (event_tx, event_rx) = bounded::<ConsensusEvent>(1024);
    let (output_tx, output_rx) = bounded::<ConsensusOutput>(1024);
    let shared_rs = Arc::new(StdRwLock::new(RoundState::empty(&state.chain_id)));

    let (timer_service, timer_handle) = TimerService::new(event_tx.clone());
    tokio::spawn(async move {
        timer_service.run().await;
    });

    let consensus_reactor = ConsensusReactor::new(
        event_tx.clone(),
        output_rx,
        shared_rs.clone(),
        metrics.clone(),
    );
    switch.add_reactor(consensus_reactor.clone());

    blockchain_reactor.start(switch.clone());

    let consensus_cfg = ConsensusConfig {
        timeout_propose_ms: cfg.consensus.timeout_propose_ms,
        timeout_prevote_ms: cfg.consensus.timeout_prevote_ms,
        timeout_precommit_ms: cfg.consensus.timeout_precommit_ms,
        timeout_commit_ms: cfg.consensus.timeout_commit_ms,
        timeout_delta_ms: cfg.consensus.timeout_delta_ms,
    };

    {
        let switch = switch.clone();
        let block_store = block_store.clone();
        let consensus_reactor = consensus_reactor.clone();
        tokio::spawn(async move {
            // Catch-up finishes (immediately, for a fresh chain) and hands us
            // the synced state to run live consensus on.
            let synced_state = match handoff_rx.recv().await {
                Some(s) => s,
                None => return,
            };
            let mempool = Arc::new(Mempool::new(synced_state.clone()));
            let machine = ConsensusState::new(
                consensus_cfg,
                synced_state,
                block_store,
                mempool,
                Some(priv_validator),
                event_rx,
                output_tx,
                timer_handle.tx.clone(),
                shared_rs,
            );
            consensus_reactor.start(switch);
            std::thread::spawn(move || machine.run());
        });
    }

    info!(height = state.last_block_height, "node started");

    tokio::signal::ctrl_c().await.ok();
    info!("shutdown initiated");
    blockchain_reactor.stop();
    consensus_reactor.stop();
    info!("node stopped");
    Ok(())
}

fn init_logging(cfg: &merklebft::config::LoggingSection) {
    use tracing_subscriber::EnvFilter;

    let env_filter =
        EnvFilter::try_from_env("RUST_LOG").unwrap_or_else(|_| EnvFilter::new(&cfg.level));

    if cfg.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
