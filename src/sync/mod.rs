//! Blockchain reactor: long-term catch-up syncing.
//!
//! Drives the block pool on a 100 ms ticker, verifies each fetched block with
//! the next block's validation, appends it to state and store, and hands off
//! to live consensus once the chain tip is fresh enough.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::codec::{CodecError, Decoder, Encoder};
use crate::metrics::Metrics;
use crate::p2p::{
    ChannelDescriptor, ChannelId, Peer, PeerId, Reactor, Switch, BLOCKCHAIN_CHANNEL,
};
use crate::pool::{BlockPool, BlockRequest};
use crate::state::State;
use crate::store::BlockStore;
use crate::types::{now_micros, Block};

const TRY_SYNC_INTERVAL: Duration = Duration::from_millis(100);
const BLOCKS_PER_SYNC_BATCH: usize = 10;
const CAUGHT_UP_GRACE_TICKS: u64 = 10;

const MSG_TYPE_BLOCK_REQUEST: u8 = 0x10;
const MSG_TYPE_BLOCK_RESPONSE: u8 = 0x11;
const MSG_TYPE_PEER_STATUS: u8 = 0x20;

#[derive(Clone, Debug)]
pub enum BlockchainMessage {
    BlockRequest { height: u64 },
    BlockResponse { block: Box<Block> },
    PeerStatus { height: u64 },
}

impl BlockchainMessage {
    pub fn encode_to_bytes(&self) -> Vec<u8> {
        let mut e = Encoder::new();
        match self {
            BlockchainMessage::BlockRequest { height } => {
                e.put_u8(MSG_TYPE_BLOCK_REQUEST);
                e.put_u64(*height);
            }
            BlockchainMessage::BlockResponse { block } => {
                e.put_u8(MSG_TYPE_BLOCK_RESPONSE);
                block.encode(&mut e);
            }
            BlockchainMessage::PeerStatus { height } => {
                e.put_u8(MSG_TYPE_PEER_STATUS);
                e.put_u64(*height);
            }
        }
        e.into_bytes()
    }

    pub fn decode_from_bytes(bytes: &[u8]) -> Result<BlockchainMessage, CodecError> {
        let mut d = Decoder::new(bytes);
        let msg = match d.get_u8()? {
            MSG_TYPE_BLOCK_REQUEST => BlockchainMessage::BlockRequest {
                height: d.get_u64()?,
            },
            MSG_TYPE_BLOCK_RESPONSE => BlockchainMessage::BlockResponse {
                block: Box::new(Block::decode(&mut d)?),
            },
            MSG_TYPE_PEER_STATUS => BlockchainMessage::PeerStatus {
                height: d.get_u64()?,
            },
            _ => return Err(CodecError::Invalid("unknown blockchain message")),
        };
        d.finish()?;
        Ok(msg)
    }
}

pub struct BlockchainReactorConfig {
    /// Stop syncing once the tip is within this many seconds of wall time.
    pub stop_syncing_secs: u64,
}

impl Default for BlockchainReactorConfig {
    fn default() -> Self {
        Self {
            stop_syncing_secs: 600,
        }
    }
}

pub struct BlockchainReactor {
    cfg: BlockchainReactorConfig,
    state: Mutex<State>,
    store: Arc<BlockStore>,
    pool: Arc<BlockPool>,
    requests_rx: Mutex<Option<mpsc::Receiver<BlockRequest>>>,
    timeouts_rx: Mutex<Option<mpsc::Receiver<PeerId>>>,
    switch: Mutex<Option<Arc<Switch>>>,
    switch_to_consensus: mpsc::Sender<State>,
    metrics: Arc<Metrics>,
    quit: watch::Sender<bool>,
}

impl BlockchainReactor {
    pub fn new(
        cfg: BlockchainReactorConfig,
        state: State,
        store: Arc<BlockStore>,
        switch_to_consensus: mpsc::Sender<State>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        assert_eq!(
            state.last_block_height,
            store.height(),
            "state and store height mismatch"
        );
        let (requests_tx, requests_rx) = mpsc::channel(100);
        let (timeouts_tx, timeouts_rx) = mpsc::channel(100);
        let pool = Arc::new(BlockPool::new(store.height() + 1, requests_tx, timeouts_tx));
        let (quit, _) = watch::channel(false);
        Arc::new(Self {
            cfg,
            state: Mutex::new(state),
            store,
            pool,
            requests_rx: Mutex::new(Some(requests_rx)),
            timeouts_rx: Mutex::new(Some(timeouts_rx)),
            switch: Mutex::new(None),
            switch_to_consensus,
            metrics,
            quit,
        })
    }

    pub fn start(self: &Arc<Self>, switch: Arc<Switch>) {
        info!("starting blockchain reactor");
        *self.switch.lock().expect("reactor lock") = Some(switch);
        let reactor = self.clone();
        tokio::spawn(async move {
            reactor.pool_routine().await;
        });
    }

    pub fn stop(&self) {
        let _ = self.quit.send(true);
    }

    fn current_switch(&self) -> Option<Arc<Switch>> {
        self.switch.lock().expect("reactor lock").clone()
    }

    async fn pool_routine(self: Arc<Self>) {
        let mut requests_rx = self
            .requests_rx
            .lock()
            .expect("reactor lock")
            .take()
            .expect("pool routine started once");
        let mut timeouts_rx = self
            .timeouts_rx
            .lock()
            .expect("reactor lock")
            .take()
            .expect("pool routine started once");
        let mut quit_rx = self.quit.subscribe();
        let mut ticker = tokio::time::interval(TRY_SYNC_INTERVAL);
        let mut ticks: u64 = 0;

        loop {
            tokio::select! {
                Some(request) = requests_rx.recv() => {
                    self.send_block_request(request);
                }
                Some(peer_id) = timeouts_rx.recv() => {
                    if let Some(switch) = self.current_switch() {
                        if let Some(peer) = switch.get_peer(&peer_id) {
                            switch.stop_peer_for_error(peer, "block request timeout");
                        }
                    }
                }
                _ = ticker.tick() => {
                    ticks += 1;
                    self.pool.make_next_requests();
                    self.pool.check_timeouts();
                    if self.try_sync(ticks) {
                        // Caught up enough: hand the state to live consensus,
                        // which also fetches the unpaired final block through
                        // commit gossip. We keep serving blocks to others.
                        let state = self.state.lock().expect("reactor lock").clone();
                        info!(height = state.last_block_height, "caught up, switching to consensus");
                        let _ = self.switch_to_consensus.send(state).await;
                        return;
                    }
                }
                _ = quit_rx.changed() => {
                    return;
                }
            }
        }
    }

    fn send_block_request(&self, request: BlockRequest) {
        let switch = match self.current_switch() {
            Some(s) => s,
            None => return,
        };
        let peer = match switch.get_peer(&request.peer_id) {
            Some(p) => p,
            None => return,
        };
        let msg = BlockchainMessage::BlockRequest {
            height: request.height,
        };
        if !peer.try_send(BLOCKCHAIN_CHANNEL, msg.encode_to_bytes()) {
            // Queue full; the pool will time the request out and reassign.
        }
    }

    /// Validate and append as many fetched blocks as possible this tick.
    /// Returns true once the node is caught up.
    fn try_sync(&self, ticks: u64) -> bool {
        let mut last_validated_time: Option<i64> = None;

        for _ in 0..BLOCKS_PER_SYNC_BATCH {
            let (first, second) = self.pool.peek_two_blocks();
            let (first, second) = match (first, second) {
                (Some(f), Some(s)) => (f, s),
                // Both are needed: the second carries the first's commits.
                _ => break,
            };

            let first_parts = first.make_part_set();
            let first_header = first_parts.header();
            let mut state = self.state.lock().expect("reactor lock");
            let verified = state.bonded_validators.verify_validation(
                &state.chain_id,
                first.hash(),
                first_header,
                first.header.height,
                &second.last_validation,
            );
            if let Err(e) = verified {
                warn!(height = first.header.height, error = %e, "fetched block failed commit verification");
                if let Some(peer_id) = self.pool.redo_request(first.header.height) {
                    if let Some(switch) = self.current_switch() {
                        if let Some(peer) = switch.get_peer(&peer_id) {
                            switch.stop_peer_for_error(peer, "served invalid block");
                        }
                    }
                }
                break;
            }

            self.pool.pop_request();
            if let Err(e) = state.append_block(&first, first_header, true) {
                // 2/3 of the network committed a block our state rejects.
                error!(height = first.header.height, error = %e, "failed to process committed block, halting sync");
                self.stop();
                return false;
            }
            state.save();
            if let Err(e) = self
                .store
                .save_block(&first, &first_parts, &second.last_validation)
            {
                error!(height = first.header.height, error = %e, "failed to persist block, halting sync");
                self.stop();
                return false;
            }
            self.metrics.sync_blocks_applied.inc();
            last_validated_time = Some(first.header.time);
        }

        // Switch to consensus either because we just validated a recent
        // block, or because no peer knows more than we do. The latter only
        // counts after a grace period so peer statuses had time to arrive.
        let fresh_enough = match last_validated_time {
            Some(t) => now_micros() - t < (self.cfg.stop_syncing_secs as i64) * 1_000_000,
            None => false,
        };
        fresh_enough || (ticks >= CAUGHT_UP_GRACE_TICKS && self.pool.is_caught_up())
    }
}

impl Reactor for BlockchainReactor {
    fn name(&self) -> &'static str {
        "BLOCKCHAIN"
    }

    fn channels(&self) -> Vec<ChannelDescriptor> {
        vec![ChannelDescriptor {
            id: BLOCKCHAIN_CHANNEL,
            priority: 5,
            send_queue_capacity: 20,
        }]
    }

    fn add_peer(&self, peer: Arc<dyn Peer>) {
        // Tell the new peer where our chain is.
        let msg = BlockchainMessage::PeerStatus {
            height: self.store.height(),
        };
        peer.try_send(BLOCKCHAIN_CHANNEL, msg.encode_to_bytes());
    }

    fn remove_peer(&self, peer: Arc<dyn Peer>, _reason: &str) {
        self.pool.remove_peer(&peer.id());
    }

    fn receive(&self, _channel: ChannelId, peer: Arc<dyn Peer>, bytes: Vec<u8>) {
        let msg = match BlockchainMessage::decode_from_bytes(&bytes) {
            Ok(m) => m,
            Err(e) => {
                warn!(peer = %peer.id(), error = %e, "bad blockchain message");
                return;
            }
        };
        match msg {
            BlockchainMessage::BlockRequest { height } => match self.store.load_block(height) {
                Ok(Some(block)) => {
                    let response = BlockchainMessage::BlockResponse {
                        block: Box::new(block),
                    };
                    // Queue full is a drop; the peer will re-request.
                    peer.try_send(BLOCKCHAIN_CHANNEL, response.encode_to_bytes());
                }
                Ok(None) => {}
                Err(e) => warn!(height, error = %e, "failed to load requested block"),
            },
            BlockchainMessage::BlockResponse { block } => {
                self.pool.add_block(*block, &peer.id());
            }
            BlockchainMessage::PeerStatus { height } => {
                self.pool.set_peer_height(&peer.id(), height);
            }
        }
    }
}
