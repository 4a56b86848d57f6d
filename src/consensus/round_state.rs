use crate::consensus::vote_set::VoteSet;
use crate::types::{Block, PartSet, Pol, Proposal, ValidatorSet, VoteType};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum RoundStep {
    NewHeight = 1,
    NewRound = 2,
    Propose = 3,
    Prevote = 4,
    Precommit = 5,
    Commit = 6,
}

impl RoundStep {
    pub fn from_u8(b: u8) -> Option<RoundStep> {
        match b {
            1 => Some(RoundStep::NewHeight),
            2 => Some(RoundStep::NewRound),
            3 => Some(RoundStep::Propose),
            4 => Some(RoundStep::Prevote),
            5 => Some(RoundStep::Precommit),
            6 => Some(RoundStep::Commit),
            _ => None,
        }
    }
}

/// Snapshot of the consensus machine's per-(height, round) state.
///
/// The owning thread mutates the real thing; everyone else (gossip loops,
/// the reactor, metrics) reads copies published after each event.
#[derive(Clone, Debug)]
pub struct RoundState {
    pub height: u64,
    pub round: u32,
    pub step: RoundStep,
    /// Estimated start of round 0 at this height, microseconds.
    pub start_time: i64,
    /// When 2/3 commits were first seen this height; 0 until then.
    pub commit_time: i64,
    pub validators: ValidatorSet,
    pub proposal: Option<Proposal>,
    pub proposal_block: Option<Block>,
    pub proposal_block_parts: Option<PartSet>,
    pub proposal_pol: Option<Pol>,
    pub proposal_pol_parts: Option<PartSet>,
    pub locked_block: Option<Block>,
    pub locked_block_parts: Option<PartSet>,
    pub locked_pol: Option<Pol>,
    pub locked_round: Option<u32>,
    pub prevotes: VoteSet,
    pub precommits: VoteSet,
    pub commits: VoteSet,
    pub last_commits: VoteSet,
}

impl RoundState {
    /// Placeholder published before the machine enters its first height.
    pub fn empty(chain_id: &str) -> RoundState {
        let validators = ValidatorSet::new(vec![]);
        RoundState {
            height: 0,
            round: 0,
            step: RoundStep::NewHeight,
            start_time: 0,
            commit_time: 0,
            validators: validators.clone(),
            proposal: None,
            proposal_block: None,
            proposal_block_parts: None,
            proposal_pol: None,
            proposal_pol_parts: None,
            locked_block: None,
            locked_block_parts: None,
            locked_pol: None,
            locked_round: None,
            prevotes: VoteSet::new(chain_id, 0, 0, VoteType::Prevote, validators.clone()),
            precommits: VoteSet::new(chain_id, 0, 0, VoteType::Precommit, validators.clone()),
            commits: VoteSet::new(chain_id, 0, 0, VoteType::Commit, validators.clone()),
            last_commits: VoteSet::new(chain_id, 0, 0, VoteType::Commit, validators),
        }
    }
}
