//! Replicated application state: account balances in an IAVL+ tree plus the
//! bonded and unbonding validator sets, advanced one committed block at a
//! time by `append_block`.

pub mod execution;

use std::sync::Arc;

use tracing::info;

use crate::codec::{CodecError, Decoder, Encoder};
use crate::crypto::hash::sha256;
use crate::crypto::PubKey;
use crate::db::Db;
use crate::merkle::{IavlTree, TreeError};
use crate::types::{
    Address, Block, BlockError, GenesisDoc, Hash, PartSetHeader, ValidationError, Validator,
    ValidatorSet,
};

pub use execution::{execute_tx, ExecutionError};

/// Blocks an unbonding validator waits before its stake is returned.
pub const UNBONDING_PERIOD_BLOCKS: u64 = 4096;
/// A bonded validator silent for this many blocks can be timed out.
pub const VALIDATOR_TIMEOUT_BLOCKS: u64 = 1024;

const STATE_KEY: &[u8] = b"state";

#[derive(thiserror::Error, Debug)]
pub enum StateError {
    #[error(transparent)]
    Block(#[from] BlockError),
    #[error("invalid last validation: {0}")]
    Validation(#[from] ValidationError),
    #[error("tx failed: {0}")]
    Execution(#[from] ExecutionError),
    #[error(transparent)]
    Tree(#[from] TreeError),
    #[error("corrupt persisted state: {0}")]
    Corrupt(#[from] CodecError),
    #[error("header fees {header} do not match computed fees {computed}")]
    WrongFees { header: u64, computed: u64 },
    #[error("header state hash does not match computed state")]
    WrongStateHash,
    #[error("genesis error: {0}")]
    Genesis(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Account {
    pub address: Address,
    /// Unknown until the account's first signed spend reveals it.
    pub pub_key: Option<PubKey>,
    pub sequence: u64,
    pub balance: u64,
}

impl Account {
    pub fn new(address: Address, balance: u64) -> Self {
        Self {
            address,
            pub_key: None,
            sequence: 0,
            balance,
        }
    }

    pub fn encode(&self, e: &mut Encoder) {
        e.put_address(&self.address);
        match &self.pub_key {
            None => e.put_u8(0),
            Some(pk) => {
                e.put_u8(1);
                e.put_pub_key(pk);
            }
        }
        e.put_u64(self.sequence);
        e.put_u64(self.balance);
    }

    pub fn decode(d: &mut Decoder<'_>) -> Result<Account, CodecError> {
        let address = d.get_address()?;
        let pub_key = match d.get_u8()? {
            0 => None,
            1 => Some(d.get_pub_key()?),
            _ => return Err(CodecError::Invalid("bad pub key tag")),
        };
        Ok(Account {
            address,
            pub_key,
            sequence: d.get_u64()?,
            balance: d.get_u64()?,
        })
    }
}

pub struct State {
    db: Arc<dyn Db>,
    pub chain_id: String,
    pub last_block_height: u64,
    pub last_block_hash: Option<Hash>,
    pub last_block_parts: PartSetHeader,
    pub last_block_time: i64,
    pub bonded_validators: ValidatorSet,
    pub unbonding_validators: ValidatorSet,
    pub accounts: IavlTree,
}

impl Clone for State {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            chain_id: self.chain_id.clone(),
            last_block_height: self.last_block_height,
            last_block_hash: self.last_block_hash,
            last_block_parts: self.last_block_parts,
            last_block_time: self.last_block_time,
            bonded_validators: self.bonded_validators.clone(),
            unbonding_validators: self.unbonding_validators.clone(),
            accounts: self.accounts.clone(),
        }
    }
}

impl std::fmt::Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("State")
            .field("chain_id", &self.chain_id)
            .field("height", &self.last_block_height)
            .finish()
    }
}

impl State {
    pub fn from_genesis(db: Arc<dyn Db>, genesis: &GenesisDoc) -> Result<State, StateError> {
        let mut accounts = IavlTree::new(db.clone());
        for acc in &genesis.accounts {
            let address = acc
                .parsed_address()
                .map_err(|e| StateError::Genesis(e.to_string()))?;
            let account = Account::new(address, acc.amount);
            let mut e = Encoder::new();
            account.encode(&mut e);
            accounts.set(&address.0, &e.into_bytes())?;
        }

        let mut validators = Vec::with_capacity(genesis.validators.len());
        for v in &genesis.validators {
            let pub_key = v
                .parsed_pub_key()
                .map_err(|e| StateError::Genesis(e.to_string()))?;
            validators.push(Validator::new(pub_key, v.amount, 0));
        }

        Ok(State {
            db,
            chain_id: genesis.chain_id.clone(),
            last_block_height: 0,
            last_block_hash: None,
            last_block_parts: PartSetHeader::default(),
            last_block_time: genesis.genesis_time,
            bonded_validators: ValidatorSet::new(validators),
            unbonding_validators: ValidatorSet::new(vec![]),
            accounts,
        })
    }

    /// Load the persisted state, if any.
    pub fn load(db: Arc<dyn Db>) -> Result<Option<State>, StateError> {
        let bytes = match db.get(STATE_KEY) {
            None => return Ok(None),
            Some(b) => b,
        };
        let mut d = Decoder::new(&bytes);
        let chain_id = d.get_string()?;
        let last_block_height = d.get_u64()?;
        let last_block_hash = d.get_opt_hash()?;
        let last_block_parts = PartSetHeader::decode(&mut d)?;
        let last_block_time = d.get_time()?;
        let bonded_validators = decode_validator_set(&mut d)?;
        let unbonding_validators = decode_validator_set(&mut d)?;
        let accounts_root = d.get_hash()?;
        d.finish()?;

        let accounts = IavlTree::load(db.clone(), accounts_root)?;
        Ok(Some(State {
            db,
            chain_id,
            last_block_height,
            last_block_hash,
            last_block_parts,
            last_block_time,
            bonded_validators,
            unbonding_validators,
            accounts,
        }))
    }

    /// Persist the accounts tree and the state record. Failure to persist is
    /// fatal upstream.
    pub fn save(&mut self) {
        let accounts_root = self.accounts.save();
        let mut e = Encoder::new();
        e.put_string(&self.chain_id);
        e.put_u64(self.last_block_height);
        e.put_opt_hash(&self.last_block_hash);
        self.last_block_parts.encode(&mut e);
        e.put_time(self.last_block_time);
        encode_validator_set(&mut e, &self.bonded_validators);
        encode_validator_set(&mut e, &self.unbonding_validators);
        e.put_hash(&accounts_root);
        self.db.set(STATE_KEY, &e.into_bytes());
    }

    pub fn db(&self) -> Arc<dyn Db> {
        self.db.clone()
    }

    pub fn get_account(&self, address: &Address) -> Result<Option<Account>, StateError> {
        match self.accounts.get(&address.0)? {
            None => Ok(None),
            Some(bytes) => {
                let mut d = Decoder::new(&bytes);
                let acc = Account::decode(&mut d)?;
                d.finish()?;
                Ok(Some(acc))
            }
        }
    }

    pub fn set_account(&mut self, account: &Account) -> Result<(), StateError> {
        let mut e = Encoder::new();
        account.encode(&mut e);
        self.accounts.set(&account.address.0, &e.into_bytes())?;
        Ok(())
    }

    /// Deterministic digest of the whole state.
    pub fn hash(&mut self) -> Hash {
        let (accounts_root, _) = self.accounts.hash();
        let mut e = Encoder::new();
        e.put_u64(self.last_block_height);
        e.put_hash(&accounts_root);
        e.put_hash(&self.bonded_validators.hash());
        e.put_hash(&self.unbonding_validators.hash());
        sha256(&e.into_bytes())
    }

    /// Apply a committed block. On error the state is partially mutated and
    /// must be discarded; callers work on a copy (or halt, after a block that
    /// carried 2/3 commits fails here).
    pub fn append_block(
        &mut self,
        block: &Block,
        block_parts: PartSetHeader,
        check_state_hash: bool,
    ) -> Result<(), StateError> {
        block.validate_basic(
            &self.chain_id,
            self.last_block_height,
            self.last_block_hash,
            self.last_block_parts,
            self.last_block_time,
        )?;

        // The embedded validation must commit our current tip with >2/3 of
        // the bonded power.
        if self.last_block_height > 0 {
            let last_hash = self.last_block_hash.expect("tip hash above genesis");
            self.bonded_validators.verify_validation(
                &self.chain_id,
                last_hash,
                self.last_block_parts,
                self.last_block_height,
                &block.last_validation,
            )?;
            let committed_height = self.last_block_height;
            for commit in &block.last_validation.commits {
                if let Some((_, v)) = self.bonded_validators.get_by_id(&commit.signer) {
                    let mut v = v.clone();
                    v.last_commit_height = committed_height;
                    self.bonded_validators.update(v);
                }
            }
        }

        let mut fees: u64 = 0;
        for tx in &block.data.txs {
            let fee = execute_tx(self, tx, block.header.height)?;
            fees = fees
                .checked_add(fee)
                .ok_or(ExecutionError::AmountOverflow)?;
        }
        if fees != block.header.fees {
            return Err(StateError::WrongFees {
                header: block.header.fees,
                computed: fees,
            });
        }

        self.bonded_validators.increment_accum();
        self.release_expired_unbonds(block.header.height)?;

        self.last_block_height = block.header.height;
        self.last_block_hash = Some(block.hash());
        self.last_block_parts = block_parts;
        self.last_block_time = block.header.time;

        if check_state_hash && block.header.state_hash != self.hash() {
            return Err(StateError::WrongStateHash);
        }
        Ok(())
    }

    /// Return matured unbonding stakes to their accounts.
    fn release_expired_unbonds(&mut self, height: u64) -> Result<(), StateError> {
        let expired: Vec<Validator> = self
            .unbonding_validators
            .iter()
            .filter(|v| v.unbond_height + UNBONDING_PERIOD_BLOCKS <= height)
            .cloned()
            .collect();
        for v in expired {
            self.unbonding_validators.remove(&v.id);
            let mut account = self
                .get_account(&v.id)?
                .unwrap_or_else(|| Account::new(v.id, 0));
            account.balance = account.balance.saturating_add(v.voting_power);
            self.set_account(&account)?;
            info!(validator = %v.id, amount = v.voting_power, "unbond released");
        }
        Ok(())
    }
}

fn encode_validator_set(e: &mut Encoder, set: &ValidatorSet) {
    e.put_u32(set.size() as u32);
    for v in set.iter() {
        v.encode(e);
    }
}

fn decode_validator_set(d: &mut Decoder<'_>) -> Result<ValidatorSet, CodecError> {
    let n = d.get_u32()? as usize;
    if n > 1 << 16 {
        return Err(CodecError::Invalid("validator set too large"));
    }
    let mut validators = Vec::with_capacity(n);
    for _ in 0..n {
        validators.push(Validator::decode(d)?);
    }
    Ok(ValidatorSet::new(validators))
}
