//! The consensus state machine.
//!
//! Runs on a single owning thread: peer messages and timer expirations arrive
//! as events on a channel and are serialized here, so all RoundState mutation
//! (including the lock/unlock discipline) is race-free. Snapshots are
//! published after every event for the gossip loops.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, error, info, warn};

use crate::consensus::round_state::{RoundState, RoundStep};
use crate::consensus::timer::TimeoutInfo;
use crate::consensus::vote_set::{HeightVoteSet, VoteSet, VoteSetError};
use crate::crypto::PrivValidator;
use crate::mempool::Mempool;
use crate::p2p::PeerId;
use crate::state::State;
use crate::store::BlockStore;
use crate::types::{
    now_micros, Block, BlockData, BlockHeader, DupeoutTx, Hash, Part, PartSet, PartSetHeader, Pol,
    Proposal, Tx, Validation, ValidatorSet, Vote, VoteType,
};

/// Broadcast a HasVotes summary after this many accepted votes.
const HAS_VOTES_INTERVAL: u64 = 50;

#[derive(Clone, Debug)]
pub struct ConsensusConfig {
    pub timeout_propose_ms: u64,
    pub timeout_prevote_ms: u64,
    pub timeout_precommit_ms: u64,
    /// Pause between finding 2/3 commits and starting the next height.
    pub timeout_commit_ms: u64,
    /// Extra time per round past zero.
    pub timeout_delta_ms: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            timeout_propose_ms: 3000,
            timeout_prevote_ms: 1000,
            timeout_precommit_ms: 1000,
            timeout_commit_ms: 1000,
            timeout_delta_ms: 500,
        }
    }
}

#[derive(Clone, Debug)]
pub enum ConsensusEvent {
    Proposal {
        proposal: Proposal,
        peer: Option<PeerId>,
    },
    BlockPart {
        height: u64,
        round: u32,
        part: Part,
        peer: Option<PeerId>,
    },
    PolPart {
        height: u64,
        round: u32,
        part: Part,
        peer: Option<PeerId>,
    },
    Vote {
        vote: Vote,
        peer: Option<PeerId>,
    },
    Timeout {
        height: u64,
        round: u32,
        step: RoundStep,
    },
}

#[derive(Clone, Debug)]
pub enum ConsensusOutput {
    /// The machine changed (height, round, step).
    NewStep(Box<RoundState>),
    /// Periodic vote-possession summary for peers.
    HasVotes {
        height: u64,
        round: u32,
        prevotes: crate::types::BitArray,
        precommits: crate::types::BitArray,
        commits: crate::types::BitArray,
    },
    /// A peer sent something cryptographically invalid.
    PeerError { peer: PeerId, reason: String },
    /// A committed block failed the state transition; the node must stop.
    Halt { reason: String },
}

pub struct ConsensusState {
    cfg: ConsensusConfig,
    chain_id: String,
    block_store: Arc<BlockStore>,
    mempool: Arc<Mempool>,
    priv_validator: Option<PrivValidator>,
    /// Last committed state; advanced in place at finalize.
    state: State,

    height: u64,
    round: u32,
    step: RoundStep,
    start_time: i64,
    commit_time: i64,
    validators: ValidatorSet,
    proposal: Option<Proposal>,
    proposal_block: Option<Block>,
    proposal_block_parts: Option<PartSet>,
    proposal_pol: Option<Pol>,
    proposal_pol_parts: Option<PartSet>,
    locked_block: Option<Block>,
    locked_block_parts: Option<PartSet>,
    locked_pol: Option<Pol>,
    locked_round: Option<u32>,
    /// Hash we are committing, once 2/3 precommits or commits are seen.
    commit_block_hash: Option<Hash>,
    votes: HeightVoteSet,
    last_commits: Option<VoteSet>,

    accepted_votes: u64,
    last_published_step: (u64, u32, RoundStep),
    halted: bool,

    rx: Receiver<ConsensusEvent>,
    outputs: Sender<ConsensusOutput>,
    timer_tx: tokio::sync::mpsc::Sender<TimeoutInfo>,
    shared: Arc<RwLock<RoundState>>,
}

impl ConsensusState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: ConsensusConfig,
        state: State,
        block_store: Arc<BlockStore>,
        mempool: Arc<Mempool>,
        priv_validator: Option<PrivValidator>,
        rx: Receiver<ConsensusEvent>,
        outputs: Sender<ConsensusOutput>,
        timer_tx: tokio::sync::mpsc::Sender<TimeoutInfo>,
        shared: Arc<RwLock<RoundState>>,
    ) -> Self {
        let chain_id = state.chain_id.clone();
        let validators = state.bonded_validators.clone();
        let height = state.last_block_height + 1;
        let votes = HeightVoteSet::new(&chain_id, height, validators.clone());
        Self {
            cfg,
            chain_id,
            block_store,
            mempool,
            priv_validator,
            state,
            height,
            round: 0,
            step: RoundStep::NewHeight,
            start_time: now_micros(),
            commit_time: 0,
            validators,
            proposal: None,
            proposal_block: None,
            proposal_block_parts: None,
            proposal_pol: None,
            proposal_pol_parts: None,
            locked_block: None,
            locked_block_parts: None,
            locked_pol: None,
            locked_round: None,
            commit_block_hash: None,
            votes,
            last_commits: None,
            accepted_votes: 0,
            last_published_step: (0, 0, RoundStep::NewHeight),
            halted: false,
            rx,
            outputs,
            timer_tx,
            shared,
        }
    }

    pub fn run(mut self) {
        info!(height = self.height, "consensus starting");
        self.enter_round(0);
        self.publish();

        loop {
            if self.halted {
                break;
            }
            let event = match self.rx.recv() {
                Ok(ev) => ev,
                Err(_) => break,
            };
            self.process_event(event);
            while let Ok(ev) = self.rx.try_recv() {
                if self.halted {
                    break;
                }
                self.process_event(ev);
            }
            self.publish();
        }
        info!(height = self.height, "consensus stopped");
    }

    fn process_event(&mut self, event: ConsensusEvent) {
        match event {
            ConsensusEvent::Proposal { proposal, peer } => self.handle_proposal(proposal, peer),
            ConsensusEvent::BlockPart {
                height,
                round,
                part,
                peer,
            } => self.handle_block_part(height, round, part, peer),
            ConsensusEvent::PolPart {
                height,
                round,
                part,
                peer,
            } => self.handle_pol_part(height, round, part, peer),
            ConsensusEvent::Vote { vote, peer } => self.handle_vote(vote, peer),
            ConsensusEvent::Timeout {
                height,
                round,
                step,
            } => self.handle_timeout(height, round, step),
        }
    }

    // -------------------------------------------------------
    // Step transitions
    // -------------------------------------------------------

    fn enter_new_height(&mut self) {
        self.height = self.state.last_block_height + 1;
        self.round = 0;
        self.step = RoundStep::NewHeight;
        self.start_time = if self.commit_time == 0 {
            now_micros()
        } else {
            self.commit_time + (self.cfg.timeout_commit_ms as i64) * 1000
        };
        self.validators = self.state.bonded_validators.clone();
        self.proposal = None;
        self.proposal_block = None;
        self.proposal_block_parts = None;
        self.proposal_pol = None;
        self.proposal_pol_parts = None;
        self.locked_block = None;
        self.locked_block_parts = None;
        self.locked_pol = None;
        self.locked_round = None;
        self.commit_block_hash = None;
        self.votes = HeightVoteSet::new(&self.chain_id, self.height, self.validators.clone());
        self.commit_time = 0;

        // Wait out the commit interval before round 0 of the new height.
        let wait = (self.start_time - now_micros()).max(0) as u64 / 1000;
        self.schedule_timeout(RoundStep::NewHeight, Duration::from_millis(wait));
    }

    fn enter_round(&mut self, round: u32) {
        // The proposer rotates every round within the height.
        if round > self.round {
            for _ in self.round..round {
                self.validators.increment_accum();
            }
        }
        self.round = round;
        self.votes.set_round(round);
        self.proposal = None;
        self.proposal_block = None;
        self.proposal_block_parts = None;
        self.proposal_pol = None;
        self.proposal_pol_parts = None;
        self.enter_propose();
    }

    fn enter_propose(&mut self) {
        self.step = RoundStep::Propose;
        debug!(height = self.height, round = self.round, "entering propose");

        let duration = Duration::from_millis(
            self.cfg.timeout_propose_ms + self.round as u64 * self.cfg.timeout_delta_ms,
        );
        self.schedule_timeout(RoundStep::Propose, duration);

        if self.is_proposer() {
            self.make_proposal();
        }
    }

    fn enter_prevote(&mut self) {
        self.step = RoundStep::Prevote;
        debug!(height = self.height, round = self.round, "entering prevote");

        let (hash, parts) = self.decide_prevote();
        self.sign_and_add_vote(VoteType::Prevote, self.round, hash, parts);

        let duration = Duration::from_millis(
            self.cfg.timeout_prevote_ms + self.round as u64 * self.cfg.timeout_delta_ms,
        );
        self.schedule_timeout(RoundStep::Prevote, duration);

        self.check_prevote_majority();
    }

    fn enter_precommit(&mut self) {
        self.step = RoundStep::Precommit;
        debug!(height = self.height, round = self.round, "entering precommit");

        let round = self.round;
        let maj = self.votes.prevotes(round).two_thirds_majority();
        let (hash, parts) = match maj {
            Some(Some(block_hash)) => {
                // 2/3 prevoted a block: lock it if we have it.
                if self.proposal_block_hash() == Some(block_hash)
                    && self.proposal_block_complete()
                {
                    let parts_header = self
                        .proposal_block_parts
                        .as_ref()
                        .expect("complete proposal parts")
                        .header();
                    self.locked_block = self.proposal_block.clone();
                    self.locked_block_parts = self.proposal_block_parts.clone();
                    self.locked_round = Some(round);
                    self.locked_pol =
                        Some(self.votes.make_pol(round, Some(block_hash), parts_header));
                    info!(height = self.height, round, hash = %block_hash, "locked block");
                    (Some(block_hash), parts_header)
                } else if self.locked_block.as_ref().map(|b| b.hash()) == Some(block_hash) {
                    let parts_header = self
                        .locked_block_parts
                        .as_ref()
                        .expect("locked parts")
                        .header();
                    self.locked_round = Some(round);
                    self.locked_pol =
                        Some(self.votes.make_pol(round, Some(block_hash), parts_header));
                    (Some(block_hash), parts_header)
                } else {
                    // A block we never received got 2/3. Precommit nil but
                    // keep any lock we hold.
                    (None, PartSetHeader::default())
                }
            }
            Some(None) => {
                // 2/3 prevoted nil: release the lock.
                if self.locked_block.is_some() {
                    info!(height = self.height, round, "unlocking on nil polka");
                }
                self.locked_block = None;
                self.locked_block_parts = None;
                self.locked_pol = None;
                self.locked_round = None;
                (None, PartSetHeader::default())
            }
            None => (None, PartSetHeader::default()),
        };
        self.sign_and_add_vote(VoteType::Precommit, round, hash, parts);

        let duration = Duration::from_millis(
            self.cfg.timeout_precommit_ms + self.round as u64 * self.cfg.timeout_delta_ms,
        );
        self.schedule_timeout(RoundStep::Precommit, duration);

        self.check_precommit_majority(round);
    }

    fn enter_commit(&mut self, block_hash: Hash, round: u32) {
        if self.step == RoundStep::Commit {
            return;
        }
        info!(height = self.height, round, hash = %block_hash, "entering commit");
        self.step = RoundStep::Commit;
        self.commit_time = now_micros();
        self.commit_block_hash = Some(block_hash);

        // Make sure the committed block is what we are collecting parts for.
        if self.proposal_block_hash() != Some(block_hash) {
            if self.locked_block.as_ref().map(|b| b.hash()) == Some(block_hash) {
                self.proposal_block = self.locked_block.clone();
                self.proposal_block_parts = self.locked_block_parts.clone();
            } else if let Some(header) = self.parts_header_from_votes(block_hash) {
                // We never saw this block; keep gossiping while its parts
                // stream in.
                self.proposal_block = None;
                self.proposal_block_parts = Some(PartSet::new_from_header(header));
            }
        }

        let parts_header = self.proposal_block_parts.as_ref().map(|p| p.header());
        if let Some(header) = parts_header {
            self.sign_and_add_vote(VoteType::Commit, round, Some(block_hash), header);
        }

        self.try_finalize();
    }

    fn try_finalize(&mut self) {
        if self.step != RoundStep::Commit {
            return;
        }
        let block_hash = match self.commit_block_hash {
            Some(h) => h,
            None => return,
        };
        // The next height's proposals embed this commit set, so finalizing
        // needs both the whole block and 2/3 commits.
        if self.votes.commits().two_thirds_majority() != Some(Some(block_hash)) {
            return;
        }
        if self.proposal_block_hash() != Some(block_hash) || !self.proposal_block_complete() {
            return;
        }

        let block = self.proposal_block.clone().expect("complete block");
        let parts = self.proposal_block_parts.clone().expect("complete parts");
        let validation = self
            .votes
            .commits()
            .make_validation()
            .expect("2/3 commits present");

        if let Err(e) = self.state.append_block(&block, parts.header(), true) {
            // 2/3 of the network committed a block our state rejects: we have
            // diverged and must not vote further.
            error!(height = self.height, error = %e, "committed block failed state transition");
            let _ = self.outputs.send(ConsensusOutput::Halt {
                reason: e.to_string(),
            });
            self.halted = true;
            return;
        }
        self.state.save();
        if let Err(e) = self.block_store.save_block(&block, &parts, &validation) {
            error!(height = self.height, error = %e, "failed to persist committed block");
            let _ = self.outputs.send(ConsensusOutput::Halt {
                reason: e.to_string(),
            });
            self.halted = true;
            return;
        }
        self.mempool.update(self.state.clone(), &block.data.txs);
        info!(
            height = block.header.height,
            hash = %block.hash(),
            txs = block.data.txs.len(),
            "block committed"
        );

        self.last_commits = Some(self.votes.commits().clone());
        self.enter_new_height();
    }

    // -------------------------------------------------------
    // Event handlers
    // -------------------------------------------------------

    fn handle_proposal(&mut self, proposal: Proposal, peer: Option<PeerId>) {
        if proposal.height != self.height || proposal.round != self.round {
            return;
        }
        if self.proposal.is_some() {
            return;
        }

        let proposer = match self.validators.proposer() {
            Some(p) => p.clone(),
            None => return,
        };
        if !proposer
            .pub_key
            .verify(&proposal.sign_bytes(&self.chain_id), &proposal.signature)
        {
            self.peer_error(peer, "invalid proposal signature");
            return;
        }

        self.proposal_block = None;
        self.proposal_block_parts = Some(PartSet::new_from_header(proposal.block_parts));
        self.proposal_pol = None;
        self.proposal_pol_parts = if proposal.pol_parts.is_zero() {
            None
        } else {
            Some(PartSet::new_from_header(proposal.pol_parts))
        };
        self.proposal = Some(proposal);
    }

    fn handle_block_part(&mut self, height: u64, round: u32, part: Part, peer: Option<PeerId>) {
        if height != self.height {
            return;
        }
        if round != self.round && self.step != RoundStep::Commit {
            return;
        }
        let added = match &mut self.proposal_block_parts {
            Some(parts) => parts.add_part(part),
            None => return,
        };
        match added {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                self.peer_error(peer, &format!("bad block part: {}", e));
                return;
            }
        }

        let complete = self
            .proposal_block_parts
            .as_ref()
            .map(|p| p.is_complete())
            .unwrap_or(false);
        if complete && self.proposal_block.is_none() {
            let bytes = self
                .proposal_block_parts
                .as_ref()
                .expect("checked above")
                .assemble()
                .expect("complete part set");
            match Block::decode_from_bytes(&bytes) {
                Ok(block) => {
                    debug!(height, hash = %block.hash(), "proposal block complete");
                    self.proposal_block = Some(block);
                }
                Err(e) => {
                    warn!(height, error = %e, "assembled proposal block does not decode");
                    self.peer_error(peer, "undecodable proposal block");
                    return;
                }
            }
            match self.step {
                RoundStep::Propose => self.enter_prevote(),
                RoundStep::Commit => self.try_finalize(),
                _ => {}
            }
        }
    }

    fn handle_pol_part(&mut self, height: u64, round: u32, part: Part, peer: Option<PeerId>) {
        if height != self.height || round != self.round {
            return;
        }
        let added = match &mut self.proposal_pol_parts {
            Some(parts) => parts.add_part(part),
            None => return,
        };
        match added {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                self.peer_error(peer, &format!("bad pol part: {}", e));
                return;
            }
        }

        let complete = self
            .proposal_pol_parts
            .as_ref()
            .map(|p| p.is_complete())
            .unwrap_or(false);
        if complete && self.proposal_pol.is_none() {
            let bytes = self
                .proposal_pol_parts
                .as_ref()
                .expect("checked above")
                .assemble()
                .expect("complete part set");
            match Pol::decode_from_bytes(&bytes) {
                Ok(pol) => self.proposal_pol = Some(pol),
                Err(e) => {
                    warn!(height, error = %e, "assembled pol does not decode");
                    self.peer_error(peer, "undecodable pol");
                }
            }
        }
    }

    fn handle_vote(&mut self, vote: Vote, peer: Option<PeerId>) {
        // Late commits for the previous height still count: they top up
        // last_commits, which seeds the next proposal's validation and is
        // gossiped to peers that lag a height behind.
        if vote.vote_type == VoteType::Commit && vote.height + 1 == self.height {
            if let Some(last_commits) = &mut self.last_commits {
                let _ = last_commits.add_vote(vote);
            }
            return;
        }
        if vote.height != self.height {
            return;
        }
        let vote_type = vote.vote_type;
        let vote_round = vote.round;

        let incoming = vote.clone();
        match self.votes.add_vote(vote) {
            Ok(true) => {}
            Ok(false) => return, // exact duplicate
            Err(VoteSetError::Conflicting(signer, existing)) => {
                warn!(validator = %signer, "conflicting votes: generating dupeout evidence");
                self.submit_dupeout(signer, *existing, incoming);
                return;
            }
            Err(e @ VoteSetError::InvalidSignature(_)) | Err(e @ VoteSetError::NonValidator(_)) => {
                self.peer_error(peer, &e.to_string());
                return;
            }
            Err(_) => return,
        }

        self.accepted_votes += 1;
        if self.accepted_votes % HAS_VOTES_INTERVAL == 0 {
            let round = self.round;
            let prevotes = self.votes.prevotes(round).bit_array();
            let precommits = self.votes.precommits(round).bit_array();
            let commits = self.votes.commits().bit_array();
            let _ = self.outputs.send(ConsensusOutput::HasVotes {
                height: self.height,
                round,
                prevotes,
                precommits,
                commits,
            });
        }

        match vote_type {
            VoteType::Prevote => {
                if vote_round == self.round {
                    self.check_prevote_majority();
                }
            }
            VoteType::Precommit => self.check_precommit_majority(vote_round),
            VoteType::Commit => self.check_commit_majority(),
        }
    }

    fn handle_timeout(&mut self, height: u64, round: u32, step: RoundStep) {
        if height != self.height {
            return;
        }
        match step {
            RoundStep::NewHeight => {
                if self.step == RoundStep::NewHeight {
                    self.enter_round(0);
                }
            }
            RoundStep::Propose => {
                if round == self.round && self.step == RoundStep::Propose {
                    // No (complete) proposal in time; prevote will go nil.
                    self.enter_prevote();
                }
            }
            RoundStep::Prevote => {
                if round == self.round && self.step == RoundStep::Prevote {
                    self.enter_precommit();
                }
            }
            RoundStep::Precommit => {
                if round == self.round && self.step == RoundStep::Precommit {
                    self.enter_round(round + 1);
                }
            }
            _ => {}
        }
    }

    // -------------------------------------------------------
    // Majority checks
    // -------------------------------------------------------

    fn check_prevote_majority(&mut self) {
        if self.step != RoundStep::Prevote {
            return;
        }
        let round = self.round;
        if self.votes.prevotes(round).two_thirds_majority().is_some() {
            self.enter_precommit();
        }
    }

    fn check_precommit_majority(&mut self, round: u32) {
        if self.step == RoundStep::Commit {
            return;
        }
        if let Some(Some(block_hash)) = self.votes.precommits(round).two_thirds_majority() {
            self.enter_commit(block_hash, round);
        }
    }

    fn check_commit_majority(&mut self) {
        if let Some(Some(block_hash)) = self.votes.commits().two_thirds_majority() {
            if self.step == RoundStep::Commit {
                self.try_finalize();
            } else {
                let round = self.locked_round.unwrap_or(self.round);
                self.enter_commit(block_hash, round);
            }
        }
    }

    // -------------------------------------------------------
    // Proposing and voting
    // -------------------------------------------------------

    fn is_proposer(&self) -> bool {
        match (&self.priv_validator, self.validators.proposer()) {
            (Some(pv), Some(proposer)) => proposer.id == pv.address,
            _ => false,
        }
    }

    fn make_proposal(&mut self) {
        let (block, parts, pol) = if let Some(locked) = &self.locked_block {
            // Re-propose the locked block with the proof that locked it.
            (
                locked.clone(),
                self.locked_block_parts.clone().expect("locked parts"),
                self.locked_pol.clone(),
            )
        } else {
            match self.build_proposal_block() {
                Some((block, parts)) => (block, parts, None),
                None => return,
            }
        };

        let pol_parts = pol
            .as_ref()
            .map(|p| PartSet::from_data(&p.encode_to_bytes()));
        let mut proposal = Proposal {
            height: self.height,
            round: self.round,
            block_parts: parts.header(),
            pol_parts: pol_parts.as_ref().map(|p| p.header()).unwrap_or_default(),
            signature: crate::crypto::Signature::ZERO,
        };

        let pv = match &mut self.priv_validator {
            Some(pv) => pv,
            None => return,
        };
        if let Err(e) = pv.sign_proposal(&self.chain_id, &mut proposal) {
            warn!(error = %e, "refusing to sign proposal");
            return;
        }

        info!(
            height = self.height,
            round = self.round,
            hash = %block.hash(),
            txs = block.data.txs.len(),
            "proposing block"
        );
        self.proposal = Some(proposal);
        self.proposal_block = Some(block);
        self.proposal_block_parts = Some(parts);
        self.proposal_pol = pol;
        self.proposal_pol_parts = pol_parts;

        // We have the full block; no need to wait out the propose timeout.
        if self.step == RoundStep::Propose {
            self.enter_prevote();
        }
    }

    /// Build a fresh block from the mempool on top of the committed state.
    fn build_proposal_block(&mut self) -> Option<(Block, PartSet)> {
        let validation = if self.height == 1 {
            Validation::default()
        } else {
            match self.last_commits.as_ref().and_then(|lc| lc.make_validation()) {
                Some(v) => v,
                None => {
                    // Without the previous commit set we cannot justify a
                    // block; let another proposer carry this round.
                    warn!(height = self.height, "no last commits to embed, skipping proposal");
                    return None;
                }
            }
        };

        let mut txs = self.mempool.reap();
        loop {
            match self.assemble_block(&validation, txs.clone()) {
                Some(block) => {
                    let parts = block.make_part_set();
                    return Some((block, parts));
                }
                None if !txs.is_empty() => {
                    // Some reaped tx no longer applies; propose empty rather
                    // than not at all.
                    txs = Vec::new();
                }
                None => return None,
            }
        }
    }

    fn assemble_block(&mut self, validation: &Validation, txs: Vec<Tx>) -> Option<Block> {
        let data = BlockData { txs };
        let mut trial = self.state.clone();
        let time = now_micros().max(self.state.last_block_time + 1);

        // Fees must match execution exactly, so dry-run to compute them.
        let mut fees: u64 = 0;
        {
            let height = self.height;
            for tx in &data.txs {
                match crate::state::execute_tx(&mut trial, tx, height) {
                    Ok(fee) => fees = fees.saturating_add(fee),
                    Err(e) => {
                        debug!(error = %e, "dropping tx during block assembly");
                        return None;
                    }
                }
            }
        }

        let mut block = Block {
            header: BlockHeader {
                chain_id: self.chain_id.clone(),
                height: self.height,
                time,
                fees,
                num_txs: data.txs.len() as u32,
                last_block_hash: self.state.last_block_hash,
                last_block_parts: self.state.last_block_parts,
                last_validation_hash: validation.hash(),
                data_hash: data.hash(),
                state_hash: Hash::ZERO,
            },
            last_validation: validation.clone(),
            data,
        };

        // Fill the state hash from a trial transition.
        let mut trial = self.state.clone();
        if let Err(e) = trial.append_block(&block, PartSetHeader::default(), false) {
            warn!(error = %e, "trial state transition failed during block assembly");
            return None;
        }
        block.header.state_hash = trial.hash();
        Some(block)
    }

    /// What to prevote this round, honoring the lock discipline: a lock is
    /// abandoned only for a proposal justified by a POL from a later round.
    fn decide_prevote(&mut self) -> (Option<Hash>, PartSetHeader) {
        if let Some(locked) = self.locked_block.clone() {
            let locked_round = self.locked_round.unwrap_or(0);
            if let (Some(block), Some(pol)) =
                (self.proposal_block.clone(), self.proposal_pol.clone())
            {
                let block_hash = block.hash();
                if block_hash != locked.hash()
                    && pol.round > locked_round
                    && pol.round < self.round
                    && pol.block_hash == Some(block_hash)
                    && pol.verify(&self.chain_id, &self.validators).is_ok()
                    && self.validate_proposal_block(&block)
                {
                    let header = self
                        .proposal_block_parts
                        .as_ref()
                        .expect("complete proposal parts")
                        .header();
                    info!(height = self.height, round = self.round, "pol overrides lock");
                    return (Some(block_hash), header);
                }
            }
            let header = self
                .locked_block_parts
                .as_ref()
                .expect("locked parts")
                .header();
            return (Some(locked.hash()), header);
        }

        if self.proposal.is_some() && self.proposal_block_complete() {
            let block = self.proposal_block.clone().expect("complete block");
            // A proposal re-proposing an earlier block must justify itself.
            if let Some(pol) = &self.proposal_pol {
                if pol.verify(&self.chain_id, &self.validators).is_err()
                    || pol.block_hash != Some(block.hash())
                    || pol.round >= self.round
                {
                    return (None, PartSetHeader::default());
                }
            }
            if self.validate_proposal_block(&block) {
                let header = self
                    .proposal_block_parts
                    .as_ref()
                    .expect("complete proposal parts")
                    .header();
                return (Some(block.hash()), header);
            }
        }
        (None, PartSetHeader::default())
    }

    /// Syntactic block validation at the consensus layer: linkage to our
    /// state and a well-formed embedded validation.
    fn validate_proposal_block(&self, block: &Block) -> bool {
        if block
            .validate_basic(
                &self.chain_id,
                self.state.last_block_height,
                self.state.last_block_hash,
                self.state.last_block_parts,
                self.state.last_block_time,
            )
            .is_err()
        {
            return false;
        }
        if self.height > 1 {
            let last_hash = match self.state.last_block_hash {
                Some(h) => h,
                None => return false,
            };
            if self
                .state
                .bonded_validators
                .verify_validation(
                    &self.chain_id,
                    last_hash,
                    self.state.last_block_parts,
                    self.state.last_block_height,
                    &block.last_validation,
                )
                .is_err()
            {
                return false;
            }
        }
        true
    }

    fn sign_and_add_vote(
        &mut self,
        vote_type: VoteType,
        round: u32,
        block_hash: Option<Hash>,
        block_parts: PartSetHeader,
    ) {
        let pv = match &mut self.priv_validator {
            Some(pv) => pv,
            None => return,
        };
        if !self.validators.has(&pv.address) {
            return;
        }
        let mut vote = Vote {
            height: self.height,
            round,
            vote_type,
            block_hash,
            block_parts,
            signer: pv.address,
            signature: crate::crypto::Signature::ZERO,
        };
        if let Err(e) = pv.sign_vote(&self.chain_id, &mut vote) {
            warn!(error = %e, "refusing to sign vote");
            return;
        }
        debug!(
            height = self.height,
            round,
            vote_type = ?vote_type,
            hash = ?block_hash,
            "signed vote"
        );
        if let Err(e) = self.votes.add_vote(vote) {
            warn!(error = %e, "own vote rejected");
        }
    }

    /// Queue equivocation evidence for inclusion in a future block. The
    /// slash happens when some proposer picks the tx up.
    fn submit_dupeout(&mut self, signer: crate::types::Address, vote_a: Vote, vote_b: Vote) {
        let tx = Tx::Dupeout(DupeoutTx {
            address: signer,
            vote_a,
            vote_b,
        });
        if let Err(e) = self.mempool.add_tx(tx) {
            debug!(validator = %signer, error = %e, "dupeout evidence not admitted");
        }
    }

    fn parts_header_from_votes(&mut self, block_hash: Hash) -> Option<PartSetHeader> {
        let round = self.round;
        let from_precommits = self
            .votes
            .precommits(round)
            .votes_for(&Some(block_hash))
            .map(|v| v.block_parts)
            .next();
        from_precommits.or_else(|| {
            self.votes
                .commits()
                .votes_for(&Some(block_hash))
                .map(|v| v.block_parts)
                .next()
        })
    }

    fn proposal_block_hash(&self) -> Option<Hash> {
        self.proposal_block.as_ref().map(|b| b.hash())
    }

    fn proposal_block_complete(&self) -> bool {
        self.proposal_block.is_some()
            && self
                .proposal_block_parts
                .as_ref()
                .map(|p| p.is_complete())
                .unwrap_or(false)
    }

    fn schedule_timeout(&self, step: RoundStep, duration: Duration) {
        let info = TimeoutInfo {
            height: self.height,
            round: self.round,
            step,
            duration,
        };
        if self.timer_tx.try_send(info).is_err() {
            debug!("timer channel unavailable");
        }
    }

    fn peer_error(&self, peer: Option<PeerId>, reason: &str) {
        if let Some(peer) = peer {
            let _ = self.outputs.send(ConsensusOutput::PeerError {
                peer,
                reason: reason.to_string(),
            });
        }
    }

    // -------------------------------------------------------
    // Publishing
    // -------------------------------------------------------

    fn current_round_state(&mut self) -> RoundState {
        let round = self.round;
        let prevotes = self.votes.prevotes(round).clone();
        let precommits = self.votes.precommits(round).clone();
        let commits = self.votes.commits().clone();
        let last_commits = self.last_commits.clone().unwrap_or_else(|| {
            VoteSet::new(
                &self.chain_id,
                self.height.saturating_sub(1),
                0,
                VoteType::Commit,
                ValidatorSet::new(vec![]),
            )
        });
        RoundState {
            height: self.height,
            round: self.round,
            step: self.step,
            start_time: self.start_time,
            commit_time: self.commit_time,
            validators: self.validators.clone(),
            proposal: self.proposal.clone(),
            proposal_block: self.proposal_block.clone(),
            proposal_block_parts: self.proposal_block_parts.clone(),
            proposal_pol: self.proposal_pol.clone(),
            proposal_pol_parts: self.proposal_pol_parts.clone(),
            locked_block: self.locked_block.clone(),
            locked_block_parts: self.locked_block_parts.clone(),
            locked_pol: self.locked_pol.clone(),
            locked_round: self.locked_round,
            prevotes,
            precommits,
            commits,
            last_commits,
        }
    }

    fn publish(&mut self) {
        let snapshot = self.current_round_state();
        *self.shared.write().expect("round state lock") = snapshot.clone();

        let step_key = (self.height, self.round, self.step);
        if step_key != self.last_published_step {
            self.last_published_step = step_key;
            let _ = self
                .outputs
                .send(ConsensusOutput::NewStep(Box::new(snapshot)));
        }
    }
}
