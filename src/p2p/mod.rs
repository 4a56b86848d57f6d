//! Peer transport interface.
//!
//! The framed, multiplexed transport itself is an external collaborator; the
//! core consumes it through `Peer`, `Reactor` and `Switch`. Reactors register
//! the channels they own; the switch routes inbound frames by channel id and
//! notifies reactors of peer arrival and departure. An in-process transport
//! is provided for tests and local multi-node runs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{debug, info, warn};

pub type PeerId = String;
pub type ChannelId = u8;

pub const BLOCKCHAIN_CHANNEL: ChannelId = 0x40;
pub const STATE_CHANNEL: ChannelId = 0x20;
pub const DATA_CHANNEL: ChannelId = 0x21;
pub const VOTE_CHANNEL: ChannelId = 0x22;

#[derive(Clone, Copy, Debug)]
pub struct ChannelDescriptor {
    pub id: ChannelId,
    pub priority: u8,
    pub send_queue_capacity: usize,
}

/// Outbound half of a connected peer. `send` blocks briefly on a full queue;
/// `try_send` drops instead — gossip re-offers through bit-array diffing.
pub trait Peer: Send + Sync {
    fn id(&self) -> PeerId;
    fn send(&self, channel: ChannelId, bytes: Vec<u8>) -> bool;
    fn try_send(&self, channel: ChannelId, bytes: Vec<u8>) -> bool;
    fn is_running(&self) -> bool;
}

/// Capability set every reactor implements; concrete reactors are composed
/// into the switch by constructor injection.
pub trait Reactor: Send + Sync {
    fn name(&self) -> &'static str;
    fn channels(&self) -> Vec<ChannelDescriptor>;
    fn add_peer(&self, peer: Arc<dyn Peer>);
    fn remove_peer(&self, peer: Arc<dyn Peer>, reason: &str);
    fn receive(&self, channel: ChannelId, peer: Arc<dyn Peer>, bytes: Vec<u8>);
}

#[derive(Default)]
pub struct Switch {
    reactors: RwLock<Vec<Arc<dyn Reactor>>>,
    by_channel: RwLock<BTreeMap<ChannelId, Arc<dyn Reactor>>>,
    peers: RwLock<BTreeMap<PeerId, Arc<dyn Peer>>>,
}

impl Switch {
    pub fn new() -> Arc<Switch> {
        Arc::new(Switch::default())
    }

    pub fn add_reactor(&self, reactor: Arc<dyn Reactor>) {
        let mut by_channel = self.by_channel.write().expect("switch lock");
        for chan in reactor.channels() {
            by_channel.insert(chan.id, reactor.clone());
        }
        self.reactors.write().expect("switch lock").push(reactor);
    }

    pub fn peers(&self) -> Vec<Arc<dyn Peer>> {
        self.peers
            .read()
            .expect("switch lock")
            .values()
            .cloned()
            .collect()
    }

    pub fn get_peer(&self, id: &PeerId) -> Option<Arc<dyn Peer>> {
        self.peers.read().expect("switch lock").get(id).cloned()
    }

    pub fn add_peer(&self, peer: Arc<dyn Peer>) {
        info!(peer = %peer.id(), "peer connected");
        self.peers
            .write()
            .expect("switch lock")
            .insert(peer.id(), peer.clone());
        for reactor in self.reactors.read().expect("switch lock").iter() {
            reactor.add_peer(peer.clone());
        }
    }

    pub fn remove_peer(&self, peer: Arc<dyn Peer>, reason: &str) {
        info!(peer = %peer.id(), reason, "peer disconnected");
        self.peers.write().expect("switch lock").remove(&peer.id());
        for reactor in self.reactors.read().expect("switch lock").iter() {
            reactor.remove_peer(peer.clone(), reason);
        }
    }

    /// Drop a misbehaving peer. Its reputation problem, not ours.
    pub fn stop_peer_for_error(&self, peer: Arc<dyn Peer>, reason: &str) {
        warn!(peer = %peer.id(), reason, "stopping peer for error");
        self.remove_peer(peer, reason);
    }

    /// Best-effort fanout on one channel.
    pub fn broadcast(&self, channel: ChannelId, bytes: &[u8]) {
        for peer in self.peers() {
            if !peer.try_send(channel, bytes.to_vec()) {
                debug!(peer = %peer.id(), channel, "broadcast dropped on full queue");
            }
        }
    }

    /// Inbound delivery from the transport.
    pub fn receive(&self, channel: ChannelId, peer: Arc<dyn Peer>, bytes: Vec<u8>) {
        let reactor = self
            .by_channel
            .read()
            .expect("switch lock")
            .get(&channel)
            .cloned();
        match reactor {
            Some(r) => r.receive(channel, peer, bytes),
            None => debug!(channel, "frame on unknown channel"),
        }
    }
}

/// In-process transport: a pair of queue-backed peers pumping frames between
/// two switches on dedicated threads.
pub struct MemPeer {
    id: PeerId,
    queues: BTreeMap<ChannelId, crossbeam_channel::Sender<Vec<u8>>>,
    running: Arc<AtomicBool>,
}

impl Peer for MemPeer {
    fn id(&self) -> PeerId {
        self.id.clone()
    }

    fn send(&self, channel: ChannelId, bytes: Vec<u8>) -> bool {
        match self.queues.get(&channel) {
            None => false,
            Some(q) => q
                .send_timeout(bytes, Duration::from_millis(500))
                .is_ok(),
        }
    }

    fn try_send(&self, channel: ChannelId, bytes: Vec<u8>) -> bool {
        match self.queues.get(&channel) {
            None => false,
            Some(q) => q.try_send(bytes).is_ok(),
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Connect two switches over in-memory queues. Returns the two peer handles
/// (`a`'s view of `b`, and `b`'s view of `a`).
pub fn connect(
    switch_a: &Arc<Switch>,
    id_a: &str,
    switch_b: &Arc<Switch>,
    id_b: &str,
    channels: &[ChannelDescriptor],
) -> (Arc<MemPeer>, Arc<MemPeer>) {
    let running = Arc::new(AtomicBool::new(true));

    let mut queues_ab = BTreeMap::new(); // frames a -> b
    let mut queues_ba = BTreeMap::new(); // frames b -> a
    let mut pumps = Vec::new();

    for chan in channels {
        let (tx_ab, rx_ab) = crossbeam_channel::bounded::<Vec<u8>>(chan.send_queue_capacity);
        let (tx_ba, rx_ba) = crossbeam_channel::bounded::<Vec<u8>>(chan.send_queue_capacity);
        queues_ab.insert(chan.id, tx_ab);
        queues_ba.insert(chan.id, tx_ba);
        pumps.push((chan.id, rx_ab, rx_ba));
    }

    // a's handle for b: sends land on b's switch, attributed to a.
    let peer_b_at_a = Arc::new(MemPeer {
        id: id_b.to_string(),
        queues: queues_ab,
        running: running.clone(),
    });
    let peer_a_at_b = Arc::new(MemPeer {
        id: id_a.to_string(),
        queues: queues_ba,
        running: running.clone(),
    });

    for (chan, rx_ab, rx_ba) in pumps {
        {
            let switch_b = switch_b.clone();
            let from = peer_a_at_b.clone();
            std::thread::spawn(move || {
                while let Ok(bytes) = rx_ab.recv() {
                    switch_b.receive(chan, from.clone(), bytes);
                }
            });
        }
        {
            let switch_a = switch_a.clone();
            let from = peer_b_at_a.clone();
            std::thread::spawn(move || {
                while let Ok(bytes) = rx_ba.recv() {
                    switch_a.receive(chan, from.clone(), bytes);
                }
            });
        }
    }

    switch_a.add_peer(peer_b_at_a.clone());
    switch_b.add_peer(peer_a_at_b.clone());
    (peer_b_at_a, peer_a_at_b)
}
