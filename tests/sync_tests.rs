//! Catch-up over the in-process transport: a fresh node fetches, verifies
//! and appends blocks served by a peer, then hands off to live consensus.

use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::SigningKey;
use tokio::sync::mpsc;

use merklebft::crypto::ed25519::sign;
use merklebft::crypto::{hex, PubKey};
use merklebft::db::{Db, MemDb};
use merklebft::metrics::Metrics;
use merklebft::p2p::{self, ChannelDescriptor, Switch, BLOCKCHAIN_CHANNEL};
use merklebft::state::State;
use merklebft::store::BlockStore;
use merklebft::sync::{BlockchainReactor, BlockchainReactorConfig};
use merklebft::types::{
    now_micros, Block, BlockData, BlockHeader, CommitSig, GenesisDoc, GenesisValidator, Hash,
    PartSetHeader, Validation, Vote, VoteType,
};

const CHAIN_ID: &str = "sync-chain";

fn validator_key() -> SigningKey {
    SigningKey::from_bytes(&[11u8; 32])
}

fn genesis_state() -> State {
    let doc = GenesisDoc {
        chain_id: CHAIN_ID.to_string(),
        genesis_time: 0,
        validators: vec![GenesisValidator {
            pub_key: hex::encode(&validator_key().verifying_key().to_bytes()),
            amount: 10,
        }],
        accounts: vec![],
    };
    let db: Arc<dyn Db> = Arc::new(MemDb::new());
    State::from_genesis(db, &doc).unwrap()
}

/// Build a short committed chain the way a proposer would: empty blocks,
/// each embedding the single validator's commit of its predecessor. Early
/// blocks are hours old; only the last two are near wall time, so the
/// syncing side flips to consensus exactly when it validates block 4.
fn build_chain(state: &mut State, store: &BlockStore) {
    let sk = validator_key();
    let signer = PubKey(sk.verifying_key().to_bytes()).address();
    let minutes_ago: [i64; 5] = [60, 45, 30, 5, 4];
    let now = now_micros();
    let mut prev_commit: Option<Validation> = None;

    for height in 1..=5u64 {
        let last_validation = prev_commit.take().unwrap_or_default();
        let data = BlockData { txs: vec![] };
        let mut block = Block {
            header: BlockHeader {
                chain_id: CHAIN_ID.to_string(),
                height,
                time: now - minutes_ago[height as usize - 1] * 60 * 1_000_000,
                fees: 0,
                num_txs: 0,
                last_block_hash: state.last_block_hash,
                last_block_parts: state.last_block_parts,
                last_validation_hash: last_validation.hash(),
                data_hash: data.hash(),
                state_hash: Hash::ZERO,
            },
            last_validation,
            data,
        };
        let mut trial = state.clone();
        trial
            .append_block(&block, PartSetHeader::default(), false)
            .unwrap();
        block.header.state_hash = trial.hash();

        let parts = block.make_part_set();
        state.append_block(&block, parts.header(), true).unwrap();
        state.save();

        // The validator's commit of this block, embedded in the next one and
        // persisted as the block's own validation.
        let doc = Vote::sign_doc(
            CHAIN_ID,
            height,
            0,
            VoteType::Commit,
            &Some(block.hash()),
            &parts.header(),
        );
        let validation = Validation {
            commits: vec![CommitSig {
                signer,
                round: 0,
                signature: sign(&sk, &doc),
            }],
        };
        store.save_block(&block, &parts, &validation).unwrap();
        prev_commit = Some(validation);
    }
}

fn blockchain_channels() -> Vec<ChannelDescriptor> {
    vec![ChannelDescriptor {
        id: BLOCKCHAIN_CHANNEL,
        priority: 5,
        send_queue_capacity: 20,
    }]
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fresh_node_syncs_from_peer() {
    // Serving node: 5 committed blocks.
    let mut state_a = genesis_state();
    let store_a = Arc::new(BlockStore::new(Arc::new(MemDb::new())));
    build_chain(&mut state_a, &store_a);
    assert_eq!(store_a.height(), 5);

    let (handoff_a_tx, _handoff_a_rx) = mpsc::channel(1);
    let reactor_a = BlockchainReactor::new(
        BlockchainReactorConfig::default(),
        state_a.clone(),
        store_a.clone(),
        handoff_a_tx,
        Arc::new(Metrics::new()),
    );
    let switch_a = Switch::new();
    switch_a.add_reactor(reactor_a.clone());

    // Fresh node at height 0.
    let state_b = genesis_state();
    let store_b = Arc::new(BlockStore::new(Arc::new(MemDb::new())));
    let (handoff_b_tx, mut handoff_b_rx) = mpsc::channel(1);
    let reactor_b = BlockchainReactor::new(
        BlockchainReactorConfig::default(),
        state_b,
        store_b.clone(),
        handoff_b_tx,
        Arc::new(Metrics::new()),
    );
    let switch_b = Switch::new();
    switch_b.add_reactor(reactor_b.clone());

    p2p::connect(&switch_a, "node-a", &switch_b, "node-b", &blockchain_channels());

    reactor_a.start(switch_a.clone());
    reactor_b.start(switch_b.clone());

    // The fresh node validates blocks 1..4 (each needs its successor's
    // commits); block 4 is recent, so it hands the state to consensus there.
    // The unpaired final block is live consensus's job.
    let synced = tokio::time::timeout(Duration::from_secs(15), handoff_b_rx.recv())
        .await
        .expect("sync must hand off in time")
        .expect("handoff channel open");

    assert_eq!(
        synced.last_block_height, 4,
        "blocks 1..4 sync; block 5 has no successor to verify it"
    );
    assert_eq!(store_b.height(), synced.last_block_height);

    // Synced blocks are byte-identical to the served ones.
    for height in 1..=synced.last_block_height {
        let a = store_a.load_block(height).unwrap().unwrap();
        let b = store_b.load_block(height).unwrap().unwrap();
        assert_eq!(a.hash(), b.hash(), "block {} diverged", height);
    }
    assert_eq!(synced.last_block_hash, Some(store_a.load_block(synced.last_block_height).unwrap().unwrap().hash()));

    reactor_a.stop();
    reactor_b.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fresh_chain_hands_off_without_peers() {
    // A validator bootstrapping a brand-new chain has nothing to sync; the
    // reactor must still start consensus after the status grace period.
    let state = genesis_state();
    let store = Arc::new(BlockStore::new(Arc::new(MemDb::new())));
    let (handoff_tx, mut handoff_rx) = mpsc::channel(1);
    let reactor = BlockchainReactor::new(
        BlockchainReactorConfig::default(),
        state,
        store,
        handoff_tx,
        Arc::new(Metrics::new()),
    );
    let switch = Switch::new();
    switch.add_reactor(reactor.clone());
    reactor.start(switch);

    let synced = tokio::time::timeout(Duration::from_secs(10), handoff_rx.recv())
        .await
        .expect("genesis node must reach consensus")
        .expect("handoff channel open");
    assert_eq!(synced.last_block_height, 0);
}
