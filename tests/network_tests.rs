//! End-to-end: four validators over the in-process transport reach
//! consecutive commits through real proposal, part, and vote gossip.

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crossbeam_channel::bounded;
use ed25519_dalek::SigningKey;

use merklebft::consensus::{
    ConsensusConfig, ConsensusEvent, ConsensusOutput, ConsensusReactor, ConsensusState, RoundState,
    TimerService,
};
use merklebft::crypto::{hex, PrivValidator, PubKey};
use merklebft::db::{Db, MemDb};
use merklebft::mempool::Mempool;
use merklebft::metrics::Metrics;
use merklebft::p2p::{
    self, ChannelDescriptor, Switch, DATA_CHANNEL, STATE_CHANNEL, VOTE_CHANNEL,
};
use merklebft::state::State;
use merklebft::store::BlockStore;
use merklebft::types::{GenesisDoc, GenesisValidator};

const CHAIN_ID: &str = "net-chain";

struct Node {
    switch: Arc<Switch>,
    store: Arc<BlockStore>,
    shared: Arc<RwLock<RoundState>>,
}

fn consensus_channels() -> Vec<ChannelDescriptor> {
    vec![
        ChannelDescriptor {
            id: STATE_CHANNEL,
            priority: 5,
            send_queue_capacity: 100,
        },
        ChannelDescriptor {
            id: DATA_CHANNEL,
            priority: 5,
            send_queue_capacity: 100,
        },
        ChannelDescriptor {
            id: VOTE_CHANNEL,
            priority: 5,
            send_queue_capacity: 100,
        },
    ]
}

fn spawn_network(keys: &[SigningKey]) -> Vec<Node> {
    let genesis = GenesisDoc {
        chain_id: CHAIN_ID.to_string(),
        genesis_time: 0,
        validators: keys
            .iter()
            .map(|sk| GenesisValidator {
                pub_key: hex::encode(&sk.verifying_key().to_bytes()),
                amount: 1,
            })
            .collect(),
        accounts: vec![],
    };

    // Short timeouts keep the test fast; gossip is in-process anyway.
    let cfg = ConsensusConfig {
        timeout_propose_ms: 2000,
        timeout_prevote_ms: 1000,
        timeout_precommit_ms: 1000,
        timeout_commit_ms: 200,
        timeout_delta_ms: 500,
    };

    let mut nodes = Vec::new();
    let mut machines = Vec::new();

    for sk in keys {
        let state_db: Arc<dyn Db> = Arc::new(MemDb::new());
        let state = State::from_genesis(state_db, &genesis).unwrap();
        let store = Arc::new(BlockStore::new(Arc::new(MemDb::new())));
        let mempool = Arc::new(Mempool::new(state.clone()));
        let priv_validator = PrivValidator::from_signing_key(sk.clone());

        let (event_tx, event_rx) = bounded::<ConsensusEvent>(4096);
        let (output_tx, output_rx) = bounded::<ConsensusOutput>(4096);
        let shared = Arc::new(RwLock::new(RoundState::empty(CHAIN_ID)));

        let (timer_service, timer_handle) = TimerService::new(event_tx.clone());
        tokio::spawn(async move {
            timer_service.run().await;
        });

        let switch = Switch::new();
        let reactor = ConsensusReactor::new(
            event_tx,
            output_rx,
            shared.clone(),
            Arc::new(Metrics::new()),
        );
        switch.add_reactor(reactor.clone());
        reactor.start(switch.clone());

        let machine = ConsensusState::new(
            cfg.clone(),
            state,
            store.clone(),
            mempool,
            Some(priv_validator),
            event_rx,
            output_tx,
            timer_handle.tx.clone(),
            shared.clone(),
        );
        machines.push(machine);
        nodes.push(Node {
            switch,
            store,
            shared,
        });
    }

    // Full mesh before anyone starts voting.
    for i in 0..nodes.len() {
        for j in (i + 1)..nodes.len() {
            p2p::connect(
                &nodes[i].switch,
                &format!("node-{}", i),
                &nodes[j].switch,
                &format!("node-{}", j),
                &consensus_channels(),
            );
        }
    }

    for machine in machines {
        std::thread::spawn(move || machine.run());
    }
    nodes
}

fn wait_for_height(nodes: &[Node], height: u64, deadline: Duration) {
    let end = Instant::now() + deadline;
    loop {
        let mut heights = Vec::new();
        for node in nodes {
            heights.push(node.shared.read().unwrap().height);
        }
        if heights.iter().all(|h| *h > height) {
            return;
        }
        if Instant::now() > end {
            panic!("network stalled before height {}: at {:?}", height, heights);
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_four_validators_gossip_to_three_commits() {
    let keys: Vec<SigningKey> = (0..4)
        .map(|i| {
            let mut seed = [0u8; 32];
            seed[0] = i as u8 + 1;
            SigningKey::from_bytes(&seed)
        })
        .collect();
    let nodes = spawn_network(&keys);

    wait_for_height(&nodes, 3, Duration::from_secs(60));

    // Every node stored the same three blocks.
    let reference: Vec<_> = (1..=3)
        .map(|height| nodes[0].store.load_block(height).unwrap().unwrap().hash())
        .collect();
    for (i, node) in nodes.iter().enumerate() {
        assert!(node.store.height() >= 3, "node {} store behind", i);
        for height in 1..=3u64 {
            let block = node.store.load_block(height).unwrap().unwrap();
            assert_eq!(
                block.hash(),
                reference[height as usize - 1],
                "node {} disagrees at height {}",
                i,
                height
            );
        }
    }

    // Each committed block past the first carries at least 2/3 commits for
    // its predecessor.
    let block2 = nodes[0].store.load_block(2).unwrap().unwrap();
    let block3 = nodes[0].store.load_block(3).unwrap().unwrap();
    assert!(block2.last_validation.commits.len() >= 3);
    assert!(block3.last_validation.commits.len() >= 3);
}
