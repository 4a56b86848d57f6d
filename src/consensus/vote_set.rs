use std::collections::BTreeMap;

use crate::types::{
    Address, BitArray, CommitSig, Hash, PartSetHeader, Pol, PolCommit, PolVote, Validation,
    ValidatorSet, Vote, VoteType,
};

#[derive(thiserror::Error, Debug)]
pub enum VoteSetError {
    #[error("wrong height: expected {expected}, got {got}")]
    WrongHeight { expected: u64, got: u64 },
    #[error("wrong round: expected {expected}, got {got}")]
    WrongRound { expected: u32, got: u32 },
    #[error("wrong vote type")]
    WrongType,
    #[error("commit round {got} ahead of round {current}")]
    CommitRoundAhead { got: u32, current: u32 },
    #[error("vote from non-validator {0}")]
    NonValidator(Address),
    #[error("invalid vote signature from {0}")]
    InvalidSignature(Address),
    #[error("conflicting vote from {0}")]
    Conflicting(Address, Box<Vote>),
}

/// One vote per validator, tallied by block hash, with a sticky 2/3 majority
/// marker. Signatures are verified on admission against the validator set.
#[derive(Clone, Debug)]
pub struct VoteSet {
    chain_id: String,
    height: u64,
    round: u32,
    vote_type: VoteType,
    validators: ValidatorSet,
    votes: Vec<Option<Vote>>,
    votes_bit_array: BitArray,
    sum_by_hash: BTreeMap<Option<Hash>, u64>,
    total_voted: u64,
    maj23: Option<Option<Hash>>,
}

impl VoteSet {
    pub fn new(
        chain_id: &str,
        height: u64,
        round: u32,
        vote_type: VoteType,
        validators: ValidatorSet,
    ) -> VoteSet {
        let n = validators.size();
        VoteSet {
            chain_id: chain_id.to_string(),
            height,
            round,
            vote_type,
            validators,
            votes: vec![None; n],
            votes_bit_array: BitArray::new(n),
            sum_by_hash: BTreeMap::new(),
            total_voted: 0,
            maj23: None,
        }
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn vote_type(&self) -> VoteType {
        self.vote_type
    }

    pub fn size(&self) -> usize {
        self.votes.len()
    }

    /// Admit a vote. `Ok(true)` when newly added; `Ok(false)` for an exact
    /// duplicate, which is silently dropped by callers.
    pub fn add_vote(&mut self, vote: Vote) -> Result<bool, VoteSetError> {
        if vote.height != self.height {
            return Err(VoteSetError::WrongHeight {
                expected: self.height,
                got: vote.height,
            });
        }
        if vote.vote_type != self.vote_type {
            return Err(VoteSetError::WrongType);
        }
        // A commit carries the round it was cast in, which may lag ours.
        if self.vote_type == VoteType::Commit {
            if vote.round > self.round {
                return Err(VoteSetError::CommitRoundAhead {
                    got: vote.round,
                    current: self.round,
                });
            }
        } else if vote.round != self.round {
            return Err(VoteSetError::WrongRound {
                expected: self.round,
                got: vote.round,
            });
        }

        let (index, validator) = self
            .validators
            .get_by_id(&vote.signer)
            .ok_or(VoteSetError::NonValidator(vote.signer))?;

        if let Some(existing) = &self.votes[index] {
            if existing.block_hash == vote.block_hash && existing.block_parts == vote.block_parts {
                return Ok(false);
            }
            return Err(VoteSetError::Conflicting(
                vote.signer,
                Box::new(existing.clone()),
            ));
        }

        if !validator
            .pub_key
            .verify(&vote.sign_bytes(&self.chain_id), &vote.signature)
        {
            return Err(VoteSetError::InvalidSignature(vote.signer));
        }

        let power = validator.voting_power;
        let tally = self.sum_by_hash.entry(vote.block_hash).or_insert(0);
        *tally += power;
        if self.maj23.is_none() && *tally * 3 > self.validators.total_voting_power() * 2 {
            self.maj23 = Some(vote.block_hash);
        }
        self.total_voted += power;
        self.votes_bit_array.set_index(index, true);
        self.votes[index] = Some(vote);
        Ok(true)
    }

    pub fn get_by_index(&self, index: usize) -> Option<&Vote> {
        self.votes.get(index).and_then(|v| v.as_ref())
    }

    pub fn bit_array(&self) -> BitArray {
        self.votes_bit_array.clone()
    }

    pub fn sum_for(&self, block_hash: &Option<Hash>) -> u64 {
        self.sum_by_hash.get(block_hash).copied().unwrap_or(0)
    }

    /// The block hash (or nil) that crossed 2/3, once one has.
    pub fn two_thirds_majority(&self) -> Option<Option<Hash>> {
        self.maj23
    }

    /// More than 2/3 of total power has voted for anything at all.
    pub fn has_two_thirds_any(&self) -> bool {
        self.total_voted * 3 > self.validators.total_voting_power() * 2
    }

    /// Bundle the commits behind the 2/3 hash into a block validation.
    /// None until a non-nil majority exists.
    pub fn make_validation(&self) -> Option<Validation> {
        let maj_hash = match self.maj23 {
            Some(Some(h)) => Some(h),
            _ => return None,
        };
        let commits = self
            .votes
            .iter()
            .flatten()
            .filter(|v| v.block_hash == maj_hash)
            .map(|v| CommitSig {
                signer: v.signer,
                round: v.round,
                signature: v.signature,
            })
            .collect();
        Some(Validation { commits })
    }

    pub fn votes_for<'a>(&'a self, block_hash: &'a Option<Hash>) -> impl Iterator<Item = &'a Vote> + 'a {
        self.votes
            .iter()
            .flatten()
            .filter(move |v| v.block_hash == *block_hash)
    }
}

/// All vote sets for one height: prevotes and precommits per round, commits
/// across rounds, created on demand.
#[derive(Clone, Debug)]
pub struct HeightVoteSet {
    chain_id: String,
    height: u64,
    validators: ValidatorSet,
    rounds: BTreeMap<u32, (VoteSet, VoteSet)>,
    commits: VoteSet,
}

impl HeightVoteSet {
    pub fn new(chain_id: &str, height: u64, validators: ValidatorSet) -> HeightVoteSet {
        let commits = VoteSet::new(chain_id, height, 0, VoteType::Commit, validators.clone());
        HeightVoteSet {
            chain_id: chain_id.to_string(),
            height,
            validators,
            rounds: BTreeMap::new(),
            commits,
        }
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    fn round_sets(&mut self, round: u32) -> &mut (VoteSet, VoteSet) {
        if !self.rounds.contains_key(&round) {
            let prevotes = VoteSet::new(
                &self.chain_id,
                self.height,
                round,
                VoteType::Prevote,
                self.validators.clone(),
            );
            let precommits = VoteSet::new(
                &self.chain_id,
                self.height,
                round,
                VoteType::Precommit,
                self.validators.clone(),
            );
            self.rounds.insert(round, (prevotes, precommits));
        }
        self.rounds.get_mut(&round).expect("inserted above")
    }

    pub fn prevotes(&mut self, round: u32) -> &mut VoteSet {
        &mut self.round_sets(round).0
    }

    pub fn precommits(&mut self, round: u32) -> &mut VoteSet {
        &mut self.round_sets(round).1
    }

    pub fn commits(&mut self) -> &mut VoteSet {
        &mut self.commits
    }

    /// Raise the commit set's round ceiling as rounds advance.
    pub fn set_round(&mut self, round: u32) {
        if round > self.commits.round {
            self.commits.round = round;
        }
    }

    pub fn add_vote(&mut self, vote: Vote) -> Result<bool, VoteSetError> {
        match vote.vote_type {
            VoteType::Prevote => self.prevotes(vote.round).add_vote(vote),
            VoteType::Precommit => self.precommits(vote.round).add_vote(vote),
            VoteType::Commit => self.commits.add_vote(vote),
        }
    }

    /// Assemble a proof of lock for `block_hash` at `round` from the round's
    /// prevotes plus any commits for the same hash at earlier rounds.
    pub fn make_pol(
        &mut self,
        round: u32,
        block_hash: Option<Hash>,
        block_parts: PartSetHeader,
    ) -> Pol {
        let votes: Vec<PolVote> = self
            .prevotes(round)
            .votes_for(&block_hash)
            .filter(|v| v.block_parts == block_parts)
            .map(|v| PolVote {
                signer: v.signer,
                signature: v.signature,
            })
            .collect();
        let voters: Vec<Address> = votes.iter().map(|v| v.signer).collect();
        let commits: Vec<PolCommit> = self
            .commits
            .votes_for(&block_hash)
            .filter(|v| {
                v.round < round && v.block_parts == block_parts && !voters.contains(&v.signer)
            })
            .map(|v| PolCommit {
                signer: v.signer,
                round: v.round,
                signature: v.signature,
            })
            .collect();
        Pol {
            height: self.height,
            round,
            block_hash,
            block_parts,
            votes,
            commits,
        }
    }
}
