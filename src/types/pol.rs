use std::collections::BTreeSet;

use crate::codec::{CodecError, Decoder, Encoder};
use crate::crypto::Signature;
use crate::types::{Address, Hash, PartSetHeader, ValidatorSet, Vote, VoteType};

/// Proof of lock: more than 2/3 of voting power voting for a block hash at
/// (height, round). Prevote signatures carry the POL's round; commit
/// signatures carry the earlier round each commit was cast in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pol {
    pub height: u64,
    pub round: u32,
    pub block_hash: Option<Hash>,
    pub block_parts: PartSetHeader,
    pub votes: Vec<PolVote>,
    pub commits: Vec<PolCommit>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PolVote {
    pub signer: Address,
    pub signature: Signature,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PolCommit {
    pub signer: Address,
    pub round: u32,
    pub signature: Signature,
}

#[derive(thiserror::Error, Debug)]
pub enum PolError {
    #[error("duplicate validator {0} in proof of lock")]
    DuplicateValidator(Address),
    #[error("unknown validator {0} in proof of lock")]
    UnknownValidator(Address),
    #[error("invalid signature from validator {0} in proof of lock")]
    InvalidSignature(Address),
    #[error("commit round {commit} not below proof round {round}")]
    BadCommitRound { commit: u32, round: u32 },
    #[error("insufficient voting power: {got} of {total}")]
    InsufficientPower { got: u64, total: u64 },
}

impl Pol {
    /// Verify that the aggregate voting power behind this proof exceeds 2/3.
    pub fn verify(&self, chain_id: &str, validators: &ValidatorSet) -> Result<(), PolError> {
        let mut seen = BTreeSet::new();
        let mut tallied: u64 = 0;

        let vote_doc = Vote::sign_doc(
            chain_id,
            self.height,
            self.round,
            VoteType::Prevote,
            &self.block_hash,
            &self.block_parts,
        );

        for vote in &self.votes {
            if !seen.insert(vote.signer) {
                return Err(PolError::DuplicateValidator(vote.signer));
            }
            let (_, validator) = validators
                .get_by_id(&vote.signer)
                .ok_or(PolError::UnknownValidator(vote.signer))?;
            if !validator.pub_key.verify(&vote_doc, &vote.signature) {
                return Err(PolError::InvalidSignature(vote.signer));
            }
            tallied += validator.voting_power;
        }

        for commit in &self.commits {
            if commit.round >= self.round {
                return Err(PolError::BadCommitRound {
                    commit: commit.round,
                    round: self.round,
                });
            }
            if !seen.insert(commit.signer) {
                return Err(PolError::DuplicateValidator(commit.signer));
            }
            let (_, validator) = validators
                .get_by_id(&commit.signer)
                .ok_or(PolError::UnknownValidator(commit.signer))?;
            let commit_doc = Vote::sign_doc(
                chain_id,
                self.height,
                commit.round,
                VoteType::Commit,
                &self.block_hash,
                &self.block_parts,
            );
            if !validator.pub_key.verify(&commit_doc, &commit.signature) {
                return Err(PolError::InvalidSignature(commit.signer));
            }
            tallied += validator.voting_power;
        }

        if tallied * 3 > validators.total_voting_power() * 2 {
            Ok(())
        } else {
            Err(PolError::InsufficientPower {
                got: tallied,
                total: validators.total_voting_power(),
            })
        }
    }

    pub fn encode(&self, e: &mut Encoder) {
        e.put_u64(self.height);
        e.put_u32(self.round);
        e.put_opt_hash(&self.block_hash);
        self.block_parts.encode(e);
        e.put_u32(self.votes.len() as u32);
        for v in &self.votes {
            e.put_address(&v.signer);
            e.put_signature(&v.signature);
        }
        e.put_u32(self.commits.len() as u32);
        for c in &self.commits {
            e.put_address(&c.signer);
            e.put_u32(c.round);
            e.put_signature(&c.signature);
        }
    }

    pub fn encode_to_bytes(&self) -> Vec<u8> {
        let mut e = Encoder::new();
        self.encode(&mut e);
        e.into_bytes()
    }

    pub fn decode(d: &mut Decoder<'_>) -> Result<Pol, CodecError> {
        let height = d.get_u64()?;
        let round = d.get_u32()?;
        let block_hash = d.get_opt_hash()?;
        let block_parts = PartSetHeader::decode(d)?;
        let nv = d.get_u32()? as usize;
        if nv > 1 << 16 {
            return Err(CodecError::Invalid("pol votes too large"));
        }
        let mut votes = Vec::with_capacity(nv);
        for _ in 0..nv {
            votes.push(PolVote {
                signer: d.get_address()?,
                signature: d.get_signature()?,
            });
        }
        let nc = d.get_u32()? as usize;
        if nc > 1 << 16 {
            return Err(CodecError::Invalid("pol commits too large"));
        }
        let mut commits = Vec::with_capacity(nc);
        for _ in 0..nc {
            commits.push(PolCommit {
                signer: d.get_address()?,
                round: d.get_u32()?,
                signature: d.get_signature()?,
            });
        }
        Ok(Pol {
            height,
            round,
            block_hash,
            block_parts,
            votes,
            commits,
        })
    }

    pub fn decode_from_bytes(bytes: &[u8]) -> Result<Pol, CodecError> {
        let mut d = Decoder::new(bytes);
        let pol = Pol::decode(&mut d)?;
        d.finish()?;
        Ok(pol)
    }
}
