//! Persistent signing identity for a validator.
//!
//! Tracks the last signed (height, round, step) and refuses to sign anything
//! that does not advance it, so a restarted node cannot accidentally
//! double-sign.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};

use crate::crypto::ed25519::{generate_keypair, sign};
use crate::crypto::{hex, PubKey};
use crate::types::{Address, Proposal, Vote, VoteType};

const STEP_PROPOSE: u8 = 1;
const STEP_PREVOTE: u8 = 2;
const STEP_PRECOMMIT: u8 = 3;
const STEP_COMMIT: u8 = 4;

fn vote_step(t: VoteType) -> u8 {
    match t {
        VoteType::Prevote => STEP_PREVOTE,
        VoteType::Precommit => STEP_PRECOMMIT,
        VoteType::Commit => STEP_COMMIT,
    }
}

#[derive(thiserror::Error, Debug)]
pub enum SignError {
    #[error("sign regression: last ({0}, {1}, {2})")]
    Regression(u64, u32, u8),
}

#[derive(Serialize, Deserialize)]
struct PrivValidatorFile {
    address: String,
    pub_key: String,
    priv_key: String,
    last_height: u64,
    last_round: u32,
    last_step: u8,
}

pub struct PrivValidator {
    pub address: Address,
    pub pub_key: PubKey,
    signing_key: SigningKey,
    last_height: u64,
    last_round: u32,
    last_step: u8,
    path: Option<PathBuf>,
}

impl PrivValidator {
    pub fn generate() -> Self {
        let (signing_key, pub_key) = generate_keypair();
        Self {
            address: pub_key.address(),
            pub_key,
            signing_key,
            last_height: 0,
            last_round: 0,
            last_step: 0,
            path: None,
        }
    }

    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        let pub_key = PubKey(signing_key.verifying_key().to_bytes());
        Self {
            address: pub_key.address(),
            pub_key,
            signing_key,
            last_height: 0,
            last_round: 0,
            last_step: 0,
            path: None,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)
            .with_context(|| format!("read priv validator file {}", path.display()))?;
        let file: PrivValidatorFile = serde_json::from_slice(&bytes)?;
        let priv_bytes = hex::decode_array::<32>(&file.priv_key)
            .ok_or_else(|| anyhow::anyhow!("bad priv key hex"))?;
        let signing_key = SigningKey::from_bytes(&priv_bytes);
        let pub_key = PubKey(signing_key.verifying_key().to_bytes());
        Ok(Self {
            address: pub_key.address(),
            pub_key,
            signing_key,
            last_height: file.last_height,
            last_round: file.last_round,
            last_step: file.last_step,
            path: Some(path.to_path_buf()),
        })
    }

    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            let mut pv = Self::generate();
            pv.path = Some(path.to_path_buf());
            pv.save()?;
            Ok(pv)
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = match &self.path {
            Some(p) => p,
            None => return Ok(()),
        };
        let file = PrivValidatorFile {
            address: hex::encode(&self.address.0),
            pub_key: hex::encode(&self.pub_key.0),
            priv_key: hex::encode(&self.signing_key.to_bytes()),
            last_height: self.last_height,
            last_round: self.last_round,
            last_step: self.last_step,
        };
        fs::write(path, serde_json::to_vec_pretty(&file)?)?;
        Ok(())
    }

    fn advance(&mut self, height: u64, round: u32, step: u8) -> Result<(), SignError> {
        let last = (self.last_height, self.last_round, self.last_step);
        if (height, round, step) <= last {
            return Err(SignError::Regression(last.0, last.1, last.2));
        }
        self.last_height = height;
        self.last_round = round;
        self.last_step = step;
        if let Err(e) = self.save() {
            tracing::warn!(error = %e, "failed to persist priv validator state");
        }
        Ok(())
    }

    /// Commit votes carry the round the lock was formed in, which may lag
    /// the round of our last precommit. One commit per height.
    fn advance_commit(&mut self, height: u64, round: u32) -> Result<(), SignError> {
        if height < self.last_height
            || (height == self.last_height && self.last_step >= STEP_COMMIT)
        {
            return Err(SignError::Regression(
                self.last_height,
                self.last_round,
                self.last_step,
            ));
        }
        if height == self.last_height {
            self.last_round = self.last_round.max(round);
        } else {
            self.last_height = height;
            self.last_round = round;
        }
        self.last_step = STEP_COMMIT;
        if let Err(e) = self.save() {
            tracing::warn!(error = %e, "failed to persist priv validator state");
        }
        Ok(())
    }

    pub fn sign_vote(&mut self, chain_id: &str, vote: &mut Vote) -> Result<(), SignError> {
        match vote.vote_type {
            VoteType::Commit => self.advance_commit(vote.height, vote.round)?,
            _ => self.advance(vote.height, vote.round, vote_step(vote.vote_type))?,
        }
        vote.signer = self.address;
        vote.signature = sign(&self.signing_key, &vote.sign_bytes(chain_id));
        Ok(())
    }

    pub fn sign_proposal(
        &mut self,
        chain_id: &str,
        proposal: &mut Proposal,
    ) -> Result<(), SignError> {
        self.advance(proposal.height, proposal.round, STEP_PROPOSE)?;
        proposal.signature = sign(&self.signing_key, &proposal.sign_bytes(chain_id));
        Ok(())
    }
}
