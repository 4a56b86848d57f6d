//! Block pool: concurrent multi-peer block fetching for catch-up.
//!
//! A window of requesters tracks heights `[base, base + WINDOW)`. Pending
//! requesters are assigned to peers advertising a sufficient height; request
//! and timeout signals are emitted on channels the blockchain reactor drains.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::p2p::PeerId;
use crate::types::Block;

pub const POOL_WINDOW: u64 = 32;
const MAX_PENDING_PER_PEER: usize = 8;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockRequest {
    pub height: u64,
    pub peer_id: PeerId,
}

enum RequesterState {
    Pending,
    Requested { peer_id: PeerId, deadline: Instant },
    Received { peer_id: PeerId, block: Box<Block> },
}

struct Requester {
    height: u64,
    state: RequesterState,
}

struct PoolPeer {
    height: u64,
    num_pending: usize,
}

struct Inner {
    /// Next height to hand to the consumer; nondecreasing.
    base: u64,
    requesters: BTreeMap<u64, Requester>,
    peers: BTreeMap<PeerId, PoolPeer>,
    max_peer_height: u64,
}

pub struct BlockPool {
    inner: Mutex<Inner>,
    requests_tx: mpsc::Sender<BlockRequest>,
    timeouts_tx: mpsc::Sender<PeerId>,
}

impl BlockPool {
    pub fn new(
        start: u64,
        requests_tx: mpsc::Sender<BlockRequest>,
        timeouts_tx: mpsc::Sender<PeerId>,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                base: start,
                requesters: BTreeMap::new(),
                peers: BTreeMap::new(),
                max_peer_height: 0,
            }),
            requests_tx,
            timeouts_tx,
        }
    }

    pub fn base(&self) -> u64 {
        self.inner.lock().expect("pool lock").base
    }

    pub fn max_peer_height(&self) -> u64 {
        self.inner.lock().expect("pool lock").max_peer_height
    }

    /// No peer knows a block we don't have.
    pub fn is_caught_up(&self) -> bool {
        let inner = self.inner.lock().expect("pool lock");
        inner.base > inner.max_peer_height
    }

    pub fn set_peer_height(&self, peer_id: &PeerId, height: u64) {
        let mut inner = self.inner.lock().expect("pool lock");
        let entry = inner.peers.entry(peer_id.clone()).or_insert(PoolPeer {
            height: 0,
            num_pending: 0,
        });
        entry.height = height;
        if height > inner.max_peer_height {
            inner.max_peer_height = height;
        }
    }

    /// Forget a peer; its in-flight assignments go back to pending.
    pub fn remove_peer(&self, peer_id: &PeerId) {
        let mut inner = self.inner.lock().expect("pool lock");
        inner.peers.remove(peer_id);
        for requester in inner.requesters.values_mut() {
            let assigned = match &requester.state {
                RequesterState::Requested { peer_id: p, .. } => p == peer_id,
                RequesterState::Received { peer_id: p, .. } => p == peer_id,
                RequesterState::Pending => false,
            };
            if assigned {
                requester.state = RequesterState::Pending;
            }
        }
    }

    /// Fill the window and assign pending requesters to capable peers,
    /// emitting a `BlockRequest` per assignment.
    pub fn make_next_requests(&self) {
        let mut inner = self.inner.lock().expect("pool lock");
        let base = inner.base;
        let ceiling = inner.max_peer_height.min(base + POOL_WINDOW - 1);

        for height in base..=ceiling {
            inner.requesters.entry(height).or_insert(Requester {
                height,
                state: RequesterState::Pending,
            });
        }

        let pending: Vec<u64> = inner
            .requesters
            .values()
            .filter(|r| matches!(r.state, RequesterState::Pending))
            .map(|r| r.height)
            .collect();

        for height in pending {
            // Least-loaded peer that has the block.
            let pick = inner
                .peers
                .iter()
                .filter(|(_, p)| p.height >= height && p.num_pending < MAX_PENDING_PER_PEER)
                .min_by_key(|(_, p)| p.num_pending)
                .map(|(id, _)| id.clone());
            let peer_id = match pick {
                Some(id) => id,
                None => continue,
            };
            let request = BlockRequest {
                height,
                peer_id: peer_id.clone(),
            };
            if self.requests_tx.try_send(request).is_err() {
                // Channel full; retry next tick.
                break;
            }
            inner.peers.get_mut(&peer_id).expect("picked peer").num_pending += 1;
            let requester = inner.requesters.get_mut(&height).expect("windowed");
            requester.state = RequesterState::Requested {
                peer_id,
                deadline: Instant::now() + REQUEST_TIMEOUT,
            };
            trace!(height, "block requested");
        }
    }

    /// Revert expired requests and report their peers on the timeout channel.
    pub fn check_timeouts(&self) {
        let mut inner = self.inner.lock().expect("pool lock");
        let now = Instant::now();
        let mut timed_out: Vec<(u64, PeerId)> = Vec::new();
        for requester in inner.requesters.values() {
            if let RequesterState::Requested { peer_id, deadline } = &requester.state {
                if *deadline <= now {
                    timed_out.push((requester.height, peer_id.clone()));
                }
            }
        }
        for (height, peer_id) in timed_out {
            debug!(height, peer = %peer_id, "block request timed out");
            if let Some(requester) = inner.requesters.get_mut(&height) {
                requester.state = RequesterState::Pending;
            }
            if let Some(peer) = inner.peers.get_mut(&peer_id) {
                peer.num_pending = peer.num_pending.saturating_sub(1);
            }
            let _ = self.timeouts_tx.try_send(peer_id);
        }
    }

    /// Accept a block iff the serving peer was the assigned one and the
    /// height matches an outstanding request. Anything else is discarded.
    pub fn add_block(&self, block: Block, peer_id: &PeerId) -> bool {
        let height = block.header.height;
        let mut inner = self.inner.lock().expect("pool lock");
        let requester = match inner.requesters.get_mut(&height) {
            Some(r) => r,
            None => return false,
        };
        match &requester.state {
            RequesterState::Requested { peer_id: assigned, .. } if assigned == peer_id => {
                requester.state = RequesterState::Received {
                    peer_id: peer_id.clone(),
                    block: Box::new(block),
                };
                if let Some(peer) = inner.peers.get_mut(peer_id) {
                    peer.num_pending = peer.num_pending.saturating_sub(1);
                }
                true
            }
            _ => false,
        }
    }

    /// The two lowest-height received blocks: the consumer validates the
    /// first with the second's validation.
    pub fn peek_two_blocks(&self) -> (Option<Block>, Option<Block>) {
        let inner = self.inner.lock().expect("pool lock");
        let get = |height: u64| -> Option<Block> {
            match inner.requesters.get(&height).map(|r| &r.state) {
                Some(RequesterState::Received { block, .. }) => Some((**block).clone()),
                _ => None,
            }
        };
        (get(inner.base), get(inner.base + 1))
    }

    /// Advance the window base past a validated block.
    pub fn pop_request(&self) {
        let mut inner = self.inner.lock().expect("pool lock");
        let base = inner.base;
        inner.requesters.remove(&base);
        inner.base = base + 1;
    }

    /// Reset a height to pending after its block failed validation.
    /// Returns the peer that served the bad block.
    pub fn redo_request(&self, height: u64) -> Option<PeerId> {
        let mut inner = self.inner.lock().expect("pool lock");
        let requester = inner.requesters.get_mut(&height)?;
        let served_by = match &requester.state {
            RequesterState::Received { peer_id, .. } => Some(peer_id.clone()),
            RequesterState::Requested { peer_id, .. } => Some(peer_id.clone()),
            RequesterState::Pending => None,
        };
        requester.state = RequesterState::Pending;
        served_by
    }
}
