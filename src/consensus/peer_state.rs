//! What we believe each peer has: their (height, round, step), which block
//! and POL parts they hold, and which votes. Gossip loops diff against this
//! to send only what a peer lacks.

use std::sync::Mutex;

use crate::consensus::round_state::RoundStep;
use crate::types::{now_micros, BitArray, PartSetHeader, Proposal, Vote, VoteType};

#[derive(Clone, Debug)]
pub struct PeerRoundState {
    pub height: u64,
    pub round: u32,
    pub step: RoundStep,
    /// Estimated start of round 0 at the peer's height, microseconds.
    pub start_time: i64,
    pub proposal: bool,
    pub proposal_block_parts: PartSetHeader,
    pub proposal_block_bits: BitArray,
    pub proposal_pol_parts: PartSetHeader,
    pub proposal_pol_bits: BitArray,
    pub prevotes: BitArray,
    pub precommits: BitArray,
    pub commits: BitArray,
}

impl Default for PeerRoundState {
    fn default() -> Self {
        Self {
            height: 0,
            round: 0,
            step: RoundStep::NewHeight,
            start_time: 0,
            proposal: false,
            proposal_block_parts: PartSetHeader::default(),
            proposal_block_bits: BitArray::default(),
            proposal_pol_parts: PartSetHeader::default(),
            proposal_pol_bits: BitArray::default(),
            prevotes: BitArray::default(),
            precommits: BitArray::default(),
            commits: BitArray::default(),
        }
    }
}

#[derive(Default)]
pub struct PeerState {
    state: Mutex<PeerRoundState>,
}

impl PeerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomic snapshot; mutating the copy changes nothing.
    pub fn get_round_state(&self) -> PeerRoundState {
        self.state.lock().expect("peer state lock").clone()
    }

    pub fn set_has_proposal(&self, proposal: &Proposal) {
        let mut ps = self.state.lock().expect("peer state lock");
        if ps.height != proposal.height || ps.round != proposal.round || ps.proposal {
            return;
        }
        ps.proposal = true;
        ps.proposal_block_parts = proposal.block_parts;
        ps.proposal_block_bits = BitArray::new(proposal.block_parts.total as usize);
        ps.proposal_pol_parts = proposal.pol_parts;
        ps.proposal_pol_bits = BitArray::new(proposal.pol_parts.total as usize);
    }

    pub fn set_has_block_part(&self, height: u64, round: u32, index: u32) {
        let mut ps = self.state.lock().expect("peer state lock");
        if ps.height != height || ps.round != round {
            return;
        }
        ps.proposal_block_bits.set_index(index as usize, true);
    }

    pub fn set_has_pol_part(&self, height: u64, round: u32, index: u32) {
        let mut ps = self.state.lock().expect("peer state lock");
        if ps.height != height || ps.round != round {
            return;
        }
        ps.proposal_pol_bits.set_index(index as usize, true);
    }

    pub fn ensure_vote_bit_arrays(&self, height: u64, num_validators: usize) {
        let mut ps = self.state.lock().expect("peer state lock");
        if ps.height != height {
            return;
        }
        if ps.prevotes.is_empty() {
            ps.prevotes = BitArray::new(num_validators);
        }
        if ps.precommits.is_empty() {
            ps.precommits = BitArray::new(num_validators);
        }
        if ps.commits.is_empty() {
            ps.commits = BitArray::new(num_validators);
        }
    }

    pub fn set_has_vote(&self, vote: &Vote, index: usize) {
        let mut ps = self.state.lock().expect("peer state lock");
        if ps.height != vote.height {
            return;
        }
        match vote.vote_type {
            VoteType::Prevote => ps.prevotes.set_index(index, true),
            VoteType::Precommit => ps.precommits.set_index(index, true),
            VoteType::Commit => {
                // A commit from an earlier round implies both earlier votes.
                if vote.round < ps.round {
                    ps.prevotes.set_index(index, true);
                    ps.precommits.set_index(index, true);
                }
                ps.commits.set_index(index, true);
            }
        }
    }

    pub fn apply_new_round_step(
        &self,
        height: u64,
        round: u32,
        step: RoundStep,
        seconds_since_start_time: u32,
    ) {
        let mut ps = self.state.lock().expect("peer state lock");
        let (prev_height, prev_round) = (ps.height, ps.round);

        ps.height = height;
        ps.round = round;
        ps.step = step;
        ps.start_time = now_micros() - (seconds_since_start_time as i64) * 1_000_000;

        if prev_height != height || prev_round != round {
            ps.proposal = false;
            ps.proposal_block_parts = PartSetHeader::default();
            ps.proposal_block_bits = BitArray::default();
            ps.proposal_pol_parts = PartSetHeader::default();
            ps.proposal_pol_bits = BitArray::default();
            // Resized lazily once we know the validator count.
            ps.prevotes = BitArray::default();
            ps.precommits = BitArray::default();
        }
        if prev_height != height {
            ps.commits = BitArray::default();
        }
    }

    pub fn apply_has_votes(
        &self,
        height: u64,
        round: u32,
        prevotes: &BitArray,
        precommits: &BitArray,
        commits: &BitArray,
    ) {
        let mut ps = self.state.lock().expect("peer state lock");
        if ps.height != height {
            return;
        }
        ps.commits = ps.commits.or(commits);
        if ps.round == round {
            ps.prevotes = ps.prevotes.or(prevotes);
            ps.precommits = ps.precommits.or(precommits);
        } else {
            ps.prevotes = prevotes.clone();
            ps.precommits = precommits.clone();
        }
    }
}
