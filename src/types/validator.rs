use std::cmp::Ordering;
use std::collections::BTreeSet;

use crate::codec::{CodecError, Decoder, Encoder};
use crate::crypto::hash::sha256;
use crate::crypto::{PubKey, Signature};
use crate::merkle::simple_hash_from_hashes;
use crate::types::{Address, Hash, PartSetHeader, Vote, VoteType};

#[derive(Clone, Debug)]
pub struct Validator {
    pub id: Address,
    pub pub_key: PubKey,
    pub voting_power: u64,
    pub bond_height: u64,
    pub unbond_height: u64,
    pub last_commit_height: u64,
    /// Proposer-selection running counter.
    pub accum: i64,
}

impl Validator {
    pub fn new(pub_key: PubKey, voting_power: u64, bond_height: u64) -> Self {
        Self {
            id: pub_key.address(),
            pub_key,
            voting_power,
            bond_height,
            unbond_height: 0,
            last_commit_height: 0,
            accum: 0,
        }
    }

    /// Ordering by accum, ties broken toward the smaller id.
    pub fn beats(&self, other: &Validator) -> bool {
        match self.accum.cmp(&other.accum) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => self.id < other.id,
        }
    }

    pub fn encode(&self, e: &mut Encoder) {
        e.put_address(&self.id);
        e.put_pub_key(&self.pub_key);
        e.put_u64(self.voting_power);
        e.put_u64(self.bond_height);
        e.put_u64(self.unbond_height);
        e.put_u64(self.last_commit_height);
        e.put_i64(self.accum);
    }

    pub fn decode(d: &mut Decoder<'_>) -> Result<Validator, CodecError> {
        Ok(Validator {
            id: d.get_address()?,
            pub_key: d.get_pub_key()?,
            voting_power: d.get_u64()?,
            bond_height: d.get_u64()?,
            unbond_height: d.get_u64()?,
            last_commit_height: d.get_u64()?,
            accum: d.get_i64()?,
        })
    }

    pub fn hash(&self) -> Hash {
        let mut e = Encoder::new();
        self.encode(&mut e);
        sha256(&e.into_bytes())
    }
}

/// One commit signature inside a block's validation, tagged with the round
/// the commit vote was cast in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitSig {
    pub signer: Address,
    pub round: u32,
    pub signature: Signature,
}

/// The bundle of commit signatures that finalizes a block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Validation {
    pub commits: Vec<CommitSig>,
}

impl Validation {
    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }

    pub fn encode(&self, e: &mut Encoder) {
        e.put_u32(self.commits.len() as u32);
        for c in &self.commits {
            e.put_address(&c.signer);
            e.put_u32(c.round);
            e.put_signature(&c.signature);
        }
    }

    pub fn decode(d: &mut Decoder<'_>) -> Result<Validation, CodecError> {
        let n = d.get_u32()? as usize;
        if n > 1 << 16 {
            return Err(CodecError::Invalid("validation too large"));
        }
        let mut commits = Vec::with_capacity(n);
        for _ in 0..n {
            commits.push(CommitSig {
                signer: d.get_address()?,
                round: d.get_u32()?,
                signature: d.get_signature()?,
            });
        }
        Ok(Validation { commits })
    }

    pub fn hash(&self) -> Hash {
        let mut e = Encoder::new();
        self.encode(&mut e);
        sha256(&e.into_bytes())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ValidationError {
    #[error("commit from unknown validator {0}")]
    UnknownValidator(Address),
    #[error("duplicate commit from validator {0}")]
    DuplicateValidator(Address),
    #[error("invalid commit signature from validator {0}")]
    InvalidSignature(Address),
    #[error("insufficient voting power: {got} of {total}")]
    InsufficientPower { got: u64, total: u64 },
}

/// Ordered set of validators with deterministic iteration (by id).
#[derive(Clone, Debug, Default)]
pub struct ValidatorSet {
    validators: Vec<Validator>,
    total_voting_power: u64,
}

impl ValidatorSet {
    pub fn new(mut validators: Vec<Validator>) -> Self {
        validators.sort_by(|a, b| a.id.cmp(&b.id));
        let total_voting_power = validators.iter().map(|v| v.voting_power).sum();
        Self {
            validators,
            total_voting_power,
        }
    }

    pub fn size(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn total_voting_power(&self) -> u64 {
        self.total_voting_power
    }

    pub fn has(&self, id: &Address) -> bool {
        self.index_of(id).is_some()
    }

    pub fn index_of(&self, id: &Address) -> Option<usize> {
        self.validators.binary_search_by(|v| v.id.cmp(id)).ok()
    }

    pub fn get_by_id(&self, id: &Address) -> Option<(usize, &Validator)> {
        let i = self.index_of(id)?;
        Some((i, &self.validators[i]))
    }

    pub fn get_by_index(&self, index: usize) -> Option<&Validator> {
        self.validators.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Validator> {
        self.validators.iter()
    }

    pub fn voting_power_of(&self, id: &Address) -> u64 {
        self.get_by_id(id).map(|(_, v)| v.voting_power).unwrap_or(0)
    }

    /// Validator with the greatest accum; ties break toward the smaller id.
    pub fn proposer(&self) -> Option<&Validator> {
        let mut best: Option<&Validator> = None;
        for v in &self.validators {
            best = match best {
                None => Some(v),
                Some(b) => {
                    if v.beats(b) {
                        Some(v)
                    } else {
                        Some(b)
                    }
                }
            };
        }
        best
    }

    /// One proposer-selection step: every validator gains its voting power,
    /// then the chosen proposer pays the total back.
    pub fn increment_accum(&mut self) {
        for v in &mut self.validators {
            v.accum = v.accum.saturating_add(v.voting_power as i64);
        }
        let total = self.total_voting_power as i64;
        let proposer_id = match self.proposer() {
            Some(p) => p.id,
            None => return,
        };
        if let Some(i) = self.index_of(&proposer_id) {
            self.validators[i].accum -= total;
        }
    }

    pub fn add(&mut self, v: Validator) -> bool {
        if self.has(&v.id) {
            return false;
        }
        self.total_voting_power += v.voting_power;
        self.validators.push(v);
        self.validators.sort_by(|a, b| a.id.cmp(&b.id));
        true
    }

    pub fn remove(&mut self, id: &Address) -> Option<Validator> {
        let i = self.index_of(id)?;
        let v = self.validators.remove(i);
        self.total_voting_power -= v.voting_power;
        Some(v)
    }

    pub fn update(&mut self, v: Validator) -> bool {
        match self.index_of(&v.id) {
            None => false,
            Some(i) => {
                self.total_voting_power =
                    self.total_voting_power - self.validators[i].voting_power + v.voting_power;
                self.validators[i] = v;
                true
            }
        }
    }

    pub fn hash(&self) -> Hash {
        let hashes: Vec<Hash> = self.validators.iter().map(|v| v.hash()).collect();
        simple_hash_from_hashes(&hashes)
    }

    /// Verify that `validation` commits the block (hash, parts) at `height`
    /// with more than 2/3 of this set's voting power.
    pub fn verify_validation(
        &self,
        chain_id: &str,
        block_hash: Hash,
        block_parts: PartSetHeader,
        height: u64,
        validation: &Validation,
    ) -> Result<(), ValidationError> {
        let mut seen = BTreeSet::new();
        let mut tallied: u64 = 0;

        for commit in &validation.commits {
            if !seen.insert(commit.signer) {
                return Err(ValidationError::DuplicateValidator(commit.signer));
            }
            let (_, validator) = self
                .get_by_id(&commit.signer)
                .ok_or(ValidationError::UnknownValidator(commit.signer))?;
            let doc = Vote::sign_doc(
                chain_id,
                height,
                commit.round,
                VoteType::Commit,
                &Some(block_hash),
                &block_parts,
            );
            if !validator.pub_key.verify(&doc, &commit.signature) {
                return Err(ValidationError::InvalidSignature(commit.signer));
            }
            tallied += validator.voting_power;
        }

        if tallied * 3 > self.total_voting_power * 2 {
            Ok(())
        } else {
            Err(ValidationError::InsufficientPower {
                got: tallied,
                total: self.total_voting_power,
            })
        }
    }
}
