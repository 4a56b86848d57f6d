//! Consensus reactor: connects the state machine to the peer network.
//!
//! Inbound frames become consensus events; two gossip loops per peer push
//! proposals, parts and votes the peer is missing, biased by its
//! PeerRoundState; step changes and vote summaries are broadcast to all.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, info, warn};

use crate::consensus::peer_state::PeerState;
use crate::consensus::round_state::{RoundState, RoundStep};
use crate::consensus::state::{ConsensusEvent, ConsensusOutput};
use crate::consensus::wire::{ConsensusMessage, PartKind};
use crate::metrics::Metrics;
use crate::p2p::{
    ChannelDescriptor, ChannelId, Peer, PeerId, Reactor, Switch, DATA_CHANNEL, STATE_CHANNEL,
    VOTE_CHANNEL,
};
use crate::types::{now_micros, Vote};

/// Idle sleep when a gossip loop has nothing to send.
const GOSSIP_SLEEP: Duration = Duration::from_millis(50);

pub struct ConsensusReactor {
    event_tx: Sender<ConsensusEvent>,
    outputs_rx: Mutex<Option<Receiver<ConsensusOutput>>>,
    round_state: Arc<RwLock<RoundState>>,
    peers: RwLock<BTreeMap<PeerId, Arc<PeerState>>>,
    switch: Mutex<Option<Arc<Switch>>>,
    metrics: Arc<Metrics>,
    stopped: Arc<AtomicBool>,
    weak_self: Weak<ConsensusReactor>,
}

impl ConsensusReactor {
    pub fn new(
        event_tx: Sender<ConsensusEvent>,
        outputs_rx: Receiver<ConsensusOutput>,
        round_state: Arc<RwLock<RoundState>>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            event_tx,
            outputs_rx: Mutex::new(Some(outputs_rx)),
            round_state,
            peers: RwLock::new(BTreeMap::new()),
            switch: Mutex::new(None),
            metrics,
            stopped: Arc::new(AtomicBool::new(false)),
            weak_self: weak.clone(),
        })
    }

    pub fn start(self: &Arc<Self>, switch: Arc<Switch>) {
        info!("starting consensus reactor");
        *self.switch.lock().expect("reactor lock") = Some(switch);
        let reactor = self.clone();
        let outputs_rx = self
            .outputs_rx
            .lock()
            .expect("reactor lock")
            .take()
            .expect("reactor started once");
        std::thread::spawn(move || reactor.output_routine(outputs_rx));
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn current_switch(&self) -> Option<Arc<Switch>> {
        self.switch.lock().expect("reactor lock").clone()
    }

    fn rs(&self) -> RoundState {
        self.round_state.read().expect("round state lock").clone()
    }

    /// Drains machine outputs: step broadcasts, vote summaries, peer errors.
    fn output_routine(self: Arc<Self>, outputs_rx: Receiver<ConsensusOutput>) {
        while let Ok(output) = outputs_rx.recv() {
            if self.is_stopped() {
                return;
            }
            match output {
                ConsensusOutput::NewStep(rs) => {
                    self.metrics.consensus_height.set(rs.height as i64);
                    self.metrics.consensus_round.set(rs.round as i64);
                    if rs.step == RoundStep::NewHeight {
                        self.metrics.consensus_blocks_committed.inc();
                    }
                    let elapsed = ((now_micros() - rs.start_time) / 1_000_000).max(0) as u32;
                    let msg = ConsensusMessage::NewRoundStep {
                        height: rs.height,
                        round: rs.round,
                        step: rs.step,
                        seconds_since_start_time: elapsed,
                    };
                    if let Some(switch) = self.current_switch() {
                        switch.broadcast(STATE_CHANNEL, &msg.encode_to_bytes());
                    }
                }
                ConsensusOutput::HasVotes {
                    height,
                    round,
                    prevotes,
                    precommits,
                    commits,
                } => {
                    let msg = ConsensusMessage::HasVotes {
                        height,
                        round,
                        prevotes,
                        precommits,
                        commits,
                    };
                    if let Some(switch) = self.current_switch() {
                        switch.broadcast(STATE_CHANNEL, &msg.encode_to_bytes());
                    }
                }
                ConsensusOutput::PeerError { peer, reason } => {
                    if let Some(switch) = self.current_switch() {
                        if let Some(peer) = switch.get_peer(&peer) {
                            switch.stop_peer_for_error(peer, &reason);
                        }
                    }
                }
                ConsensusOutput::Halt { reason } => {
                    warn!(reason, "consensus halted");
                    self.stop();
                    return;
                }
            }
        }
    }

    /// Ships proposals, block parts and POL parts the peer is missing.
    fn gossip_data_routine(self: Arc<Self>, peer: Arc<dyn Peer>, ps: Arc<PeerState>) {
        loop {
            if self.is_stopped() || !peer.is_running() {
                return;
            }
            let rs = self.rs();
            let prs = ps.get_round_state();

            // Block parts first: even across rounds the part sets match
            // while a commit is in flight.
            if let Some(parts) = &rs.proposal_block_parts {
                if parts.header() == prs.proposal_block_parts {
                    if let Some(index) = parts
                        .bit_array()
                        .sub(&prs.proposal_block_bits)
                        .pick_random()
                    {
                        if let Some(part) = parts.get_part(index as u32) {
                            let msg = ConsensusMessage::Part {
                                height: rs.height,
                                round: rs.round,
                                kind: PartKind::ProposalBlock,
                                part: part.clone(),
                            };
                            if peer.send(DATA_CHANNEL, msg.encode_to_bytes()) {
                                ps.set_has_block_part(rs.height, rs.round, index as u32);
                            }
                            continue;
                        }
                    }
                }
            }

            if rs.height != prs.height || rs.round != prs.round {
                std::thread::sleep(GOSSIP_SLEEP);
                continue;
            }

            if let Some(proposal) = &rs.proposal {
                if !prs.proposal {
                    let msg = ConsensusMessage::Proposal(proposal.clone());
                    if peer.send(DATA_CHANNEL, msg.encode_to_bytes()) {
                        ps.set_has_proposal(proposal);
                    }
                    continue;
                }
            }

            if let Some(pol_parts) = &rs.proposal_pol_parts {
                if pol_parts.header() == prs.proposal_pol_parts {
                    if let Some(index) = pol_parts
                        .bit_array()
                        .sub(&prs.proposal_pol_bits)
                        .pick_random()
                    {
                        if let Some(part) = pol_parts.get_part(index as u32) {
                            let msg = ConsensusMessage::Part {
                                height: rs.height,
                                round: rs.round,
                                kind: PartKind::ProposalPol,
                                part: part.clone(),
                            };
                            if peer.send(DATA_CHANNEL, msg.encode_to_bytes()) {
                                ps.set_has_pol_part(rs.height, rs.round, index as u32);
                            }
                            continue;
                        }
                    }
                }
            }

            std::thread::sleep(GOSSIP_SLEEP);
        }
    }

    /// Ships votes the peer is missing for its current step.
    fn gossip_votes_routine(self: Arc<Self>, peer: Arc<dyn Peer>, ps: Arc<PeerState>) {
        loop {
            if self.is_stopped() || !peer.is_running() {
                return;
            }
            let rs = self.rs();
            let prs = ps.get_round_state();

            let try_send = |vote_set: &crate::consensus::vote_set::VoteSet,
                            peer_bits: &crate::types::BitArray|
             -> bool {
                if let Some(index) = vote_set.bit_array().sub(peer_bits).pick_random() {
                    if let Some(vote) = vote_set.get_by_index(index) {
                        let msg = ConsensusMessage::Vote(vote.clone());
                        if peer.send(VOTE_CHANNEL, msg.encode_to_bytes()) {
                            ps.set_has_vote(vote, index);
                        }
                        return true;
                    }
                }
                false
            };

            if rs.height == prs.height {
                ps.ensure_vote_bit_arrays(rs.height, rs.validators.size());
                let prs = ps.get_round_state();

                if rs.round == prs.round && prs.step <= RoundStep::Prevote {
                    if try_send(&rs.prevotes, &prs.prevotes) {
                        continue;
                    }
                }
                if rs.round == prs.round && prs.step <= RoundStep::Precommit {
                    if try_send(&rs.precommits, &prs.precommits) {
                        continue;
                    }
                }
                if try_send(&rs.commits, &prs.commits) {
                    continue;
                }
            } else if prs.height + 1 == rs.height {
                // The peer is finishing the height we just committed; our
                // last commits are exactly the votes it still needs.
                ps.ensure_vote_bit_arrays(prs.height, rs.last_commits.size());
                let prs = ps.get_round_state();
                if try_send(&rs.last_commits, &prs.commits) {
                    continue;
                }
            }

            std::thread::sleep(GOSSIP_SLEEP);
        }
    }
}

impl Reactor for ConsensusReactor {
    fn name(&self) -> &'static str {
        "CONSENSUS"
    }

    fn channels(&self) -> Vec<ChannelDescriptor> {
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

    fn add_peer(&self, peer: Arc<dyn Peer>) {
        let ps = Arc::new(PeerState::new());
        self.peers
            .write()
            .expect("peers lock")
            .insert(peer.id(), ps.clone());
        self.metrics.sync_peers.inc();

        // One task per peer per topic.
        if let Some(this) = self.weak_self.upgrade() {
            {
                let peer = peer.clone();
                let ps = ps.clone();
                let this = this.clone();
                std::thread::spawn(move || this.gossip_data_routine(peer, ps));
            }
            let peer_votes = peer.clone();
            std::thread::spawn(move || this.gossip_votes_routine(peer_votes, ps));
        }

        // Tell the new peer where we are.
        let rs = self.rs();
        let elapsed = ((now_micros() - rs.start_time) / 1_000_000).max(0) as u32;
        let msg = ConsensusMessage::NewRoundStep {
            height: rs.height,
            round: rs.round,
            step: rs.step,
            seconds_since_start_time: elapsed,
        };
        peer.try_send(STATE_CHANNEL, msg.encode_to_bytes());
    }

    fn remove_peer(&self, peer: Arc<dyn Peer>, _reason: &str) {
        self.peers.write().expect("peers lock").remove(&peer.id());
        self.metrics.sync_peers.dec();
    }

    fn receive(&self, channel: ChannelId, peer: Arc<dyn Peer>, bytes: Vec<u8>) {
        let msg = match ConsensusMessage::decode_from_bytes(&bytes) {
            Ok(m) => m,
            Err(e) => {
                warn!(peer = %peer.id(), error = %e, "bad consensus message");
                return;
            }
        };
        let ps = self.peers.read().expect("peers lock").get(&peer.id()).cloned();
        let ps = match ps {
            Some(ps) => ps,
            None => return,
        };

        match (channel, msg) {
            (
                STATE_CHANNEL,
                ConsensusMessage::NewRoundStep {
                    height,
                    round,
                    step,
                    seconds_since_start_time,
                },
            ) => {
                ps.apply_new_round_step(height, round, step, seconds_since_start_time);
            }
            (
                STATE_CHANNEL,
                ConsensusMessage::HasVotes {
                    height,
                    round,
                    prevotes,
                    precommits,
                    commits,
                },
            ) => {
                ps.apply_has_votes(height, round, &prevotes, &precommits, &commits);
            }
            (DATA_CHANNEL, ConsensusMessage::Proposal(proposal)) => {
                self.metrics.consensus_proposals_received.inc();
                ps.set_has_proposal(&proposal);
                let _ = self.event_tx.try_send(ConsensusEvent::Proposal {
                    proposal,
                    peer: Some(peer.id()),
                });
            }
            (
                DATA_CHANNEL,
                ConsensusMessage::Part {
                    height,
                    round,
                    kind,
                    part,
                },
            ) => {
                let event = match kind {
                    PartKind::ProposalBlock => {
                        ps.set_has_block_part(height, round, part.index);
                        ConsensusEvent::BlockPart {
                            height,
                            round,
                            part,
                            peer: Some(peer.id()),
                        }
                    }
                    PartKind::ProposalPol => {
                        ps.set_has_pol_part(height, round, part.index);
                        ConsensusEvent::PolPart {
                            height,
                            round,
                            part,
                            peer: Some(peer.id()),
                        }
                    }
                };
                let _ = self.event_tx.try_send(event);
            }
            (VOTE_CHANNEL, ConsensusMessage::Vote(vote)) => {
                self.metrics.consensus_votes_received.inc();
                self.mark_peer_vote(&ps, &vote);
                let _ = self.event_tx.try_send(ConsensusEvent::Vote {
                    vote,
                    peer: Some(peer.id()),
                });
            }
            _ => {
                debug!(channel, "consensus message on wrong channel");
            }
        }
    }
}

impl ConsensusReactor {
    fn mark_peer_vote(&self, ps: &Arc<PeerState>, vote: &Vote) {
        let rs = self.rs();
        if vote.height != rs.height {
            return;
        }
        if let Some(index) = rs.validators.index_of(&vote.signer) {
            ps.ensure_vote_bit_arrays(rs.height, rs.validators.size());
            ps.set_has_vote(vote, index);
        }
    }
}

