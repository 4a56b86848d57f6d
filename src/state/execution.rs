//! Per-transaction state transitions. Any failure aborts the whole block: a
//! faulty proposer produces no valid block.

use tracing::debug;

use crate::crypto::PubKey;
use crate::state::{Account, State, StateError, VALIDATOR_TIMEOUT_BLOCKS};
use crate::types::{Address, BondTx, DupeoutTx, SendTx, TimeoutTx, Tx, TxInput, UnbondTx, Validator};

#[derive(thiserror::Error, Debug)]
pub enum ExecutionError {
    #[error("unknown account {0}")]
    UnknownAccount(Address),
    #[error("invalid sequence for {address}: expected {expected}, got {got}")]
    InvalidSequence {
        address: Address,
        expected: u64,
        got: u64,
    },
    #[error("insufficient funds in {0}")]
    InsufficientFunds(Address),
    #[error("invalid signature from {0}")]
    InvalidSignature(Address),
    #[error("no public key known for {0}")]
    UnknownPubKey(Address),
    #[error("public key does not match address {0}")]
    PubKeyMismatch(Address),
    #[error("zero amount")]
    ZeroAmount,
    #[error("no inputs")]
    NoInputs,
    #[error("outputs exceed inputs")]
    OutputsExceedInputs,
    #[error("amount overflow")]
    AmountOverflow,
    #[error("validator {0} already bonded or unbonding")]
    AlreadyBonded(Address),
    #[error("validator {0} not bonded")]
    NotBonded(Address),
    #[error("unbond height mismatch")]
    BadUnbondHeight,
    #[error("validator {0} has not timed out")]
    NotTimedOut(Address),
    #[error("excessive timeout penalty")]
    ExcessivePenalty,
    #[error("invalid dupeout evidence: {0}")]
    InvalidEvidence(&'static str),
    #[error("state access failed: {0}")]
    State(String),
}

impl From<StateError> for ExecutionError {
    fn from(e: StateError) -> Self {
        ExecutionError::State(e.to_string())
    }
}

/// Execute one transaction, returning the fee it pays.
pub fn execute_tx(state: &mut State, tx: &Tx, height: u64) -> Result<u64, ExecutionError> {
    match tx {
        Tx::Send(send) => exec_send(state, tx, send),
        Tx::Bond(bond) => exec_bond(state, tx, bond, height),
        Tx::Unbond(unbond) => exec_unbond(state, tx, unbond, height),
        Tx::Timeout(timeout) => exec_timeout(state, timeout, height),
        Tx::Dupeout(dupeout) => exec_dupeout(state, dupeout),
    }
}

/// Validate one input: existing account, next sequence, known key, good
/// signature, covered amount. Returns the debited account.
fn validate_input(
    state: &State,
    tx: &Tx,
    input: &TxInput,
) -> Result<(Account, PubKey), ExecutionError> {
    if input.amount == 0 {
        return Err(ExecutionError::ZeroAmount);
    }
    let account = state
        .get_account(&input.address)?
        .ok_or(ExecutionError::UnknownAccount(input.address))?;

    if input.sequence != account.sequence + 1 {
        return Err(ExecutionError::InvalidSequence {
            address: input.address,
            expected: account.sequence + 1,
            got: input.sequence,
        });
    }

    let pub_key = match (account.pub_key, input.pub_key) {
        (Some(pk), _) => pk,
        (None, Some(pk)) => {
            if pk.address() != input.address {
                return Err(ExecutionError::PubKeyMismatch(input.address));
            }
            pk
        }
        (None, None) => return Err(ExecutionError::UnknownPubKey(input.address)),
    };

    if !pub_key.verify(&tx.sign_bytes(&state.chain_id), &input.signature) {
        return Err(ExecutionError::InvalidSignature(input.address));
    }
    if account.balance < input.amount {
        return Err(ExecutionError::InsufficientFunds(input.address));
    }
    Ok((account, pub_key))
}

fn debit_inputs(state: &mut State, tx: &Tx, inputs: &[TxInput]) -> Result<u64, ExecutionError> {
    if inputs.is_empty() {
        return Err(ExecutionError::NoInputs);
    }
    let mut total: u64 = 0;
    // Validate everything before mutating anything.
    for input in inputs {
        validate_input(state, tx, input)?;
        total = total
            .checked_add(input.amount)
            .ok_or(ExecutionError::AmountOverflow)?;
    }
    for input in inputs {
        let (mut account, pub_key) = validate_input(state, tx, input)?;
        account.balance -= input.amount;
        account.sequence += 1;
        if account.pub_key.is_none() {
            account.pub_key = Some(pub_key);
        }
        state.set_account(&account)?;
    }
    Ok(total)
}

fn exec_send(state: &mut State, tx: &Tx, send: &SendTx) -> Result<u64, ExecutionError> {
    let mut out_total: u64 = 0;
    for output in &send.outputs {
        if output.amount == 0 {
            return Err(ExecutionError::ZeroAmount);
        }
        out_total = out_total
            .checked_add(output.amount)
            .ok_or(ExecutionError::AmountOverflow)?;
    }

    let in_total = debit_inputs(state, tx, &send.inputs)?;
    if out_total > in_total {
        return Err(ExecutionError::OutputsExceedInputs);
    }

    for output in &send.outputs {
        let mut account = state
            .get_account(&output.address)?
            .unwrap_or_else(|| Account::new(output.address, 0));
        account.balance = account
            .balance
            .checked_add(output.amount)
            .ok_or(ExecutionError::AmountOverflow)?;
        state.set_account(&account)?;
    }
    Ok(in_total - out_total)
}

fn exec_bond(
    state: &mut State,
    tx: &Tx,
    bond: &BondTx,
    height: u64,
) -> Result<u64, ExecutionError> {
    let id = bond.pub_key.address();
    if state.bonded_validators.has(&id) || state.unbonding_validators.has(&id) {
        return Err(ExecutionError::AlreadyBonded(id));
    }
    let bonded = debit_inputs(state, tx, &bond.inputs)?;
    let mut validator = Validator::new(bond.pub_key, bonded, height);
    validator.last_commit_height = height;
    state.bonded_validators.add(validator);
    debug!(validator = %id, amount = bonded, "validator bonded");
    Ok(0)
}

fn exec_unbond(
    state: &mut State,
    tx: &Tx,
    unbond: &UnbondTx,
    height: u64,
) -> Result<u64, ExecutionError> {
    if unbond.height != height {
        return Err(ExecutionError::BadUnbondHeight);
    }
    let (_, validator) = state
        .bonded_validators
        .get_by_id(&unbond.address)
        .ok_or(ExecutionError::NotBonded(unbond.address))?;
    if !validator
        .pub_key
        .verify(&tx.sign_bytes(&state.chain_id), &unbond.signature)
    {
        return Err(ExecutionError::InvalidSignature(unbond.address));
    }

    let mut validator = state
        .bonded_validators
        .remove(&unbond.address)
        .expect("checked above");
    validator.unbond_height = height;
    state.unbonding_validators.add(validator);
    debug!(validator = %unbond.address, "validator unbonding");
    Ok(0)
}

fn exec_timeout(
    state: &mut State,
    timeout: &TimeoutTx,
    height: u64,
) -> Result<u64, ExecutionError> {
    let (_, validator) = state
        .bonded_validators
        .get_by_id(&timeout.address)
        .ok_or(ExecutionError::NotBonded(timeout.address))?;

    let last_activity = validator.last_commit_height.max(validator.bond_height);
    if height <= last_activity + VALIDATOR_TIMEOUT_BLOCKS {
        return Err(ExecutionError::NotTimedOut(timeout.address));
    }
    if timeout.penalty > validator.voting_power {
        return Err(ExecutionError::ExcessivePenalty);
    }

    let mut validator = state
        .bonded_validators
        .remove(&timeout.address)
        .expect("checked above");
    validator.voting_power -= timeout.penalty;
    validator.unbond_height = height;
    state.unbonding_validators.add(validator);
    debug!(validator = %timeout.address, penalty = timeout.penalty, "validator timed out");
    Ok(0)
}

fn exec_dupeout(state: &mut State, dupeout: &DupeoutTx) -> Result<u64, ExecutionError> {
    let validator = state
        .bonded_validators
        .get_by_id(&dupeout.address)
        .map(|(_, v)| v.clone())
        .or_else(|| {
            state
                .unbonding_validators
                .get_by_id(&dupeout.address)
                .map(|(_, v)| v.clone())
        })
        .ok_or(ExecutionError::NotBonded(dupeout.address))?;

    let a = &dupeout.vote_a;
    let b = &dupeout.vote_b;
    if a.signer != dupeout.address || b.signer != dupeout.address {
        return Err(ExecutionError::InvalidEvidence("signer mismatch"));
    }
    if a.height != b.height || a.round != b.round || a.vote_type != b.vote_type {
        return Err(ExecutionError::InvalidEvidence("votes not comparable"));
    }
    if a.block_hash == b.block_hash && a.block_parts == b.block_parts {
        return Err(ExecutionError::InvalidEvidence("votes identical"));
    }
    if !validator
        .pub_key
        .verify(&a.sign_bytes(&state.chain_id), &a.signature)
        || !validator
            .pub_key
            .verify(&b.sign_bytes(&state.chain_id), &b.signature)
    {
        return Err(ExecutionError::InvalidEvidence("bad signature"));
    }

    // Slash: the stake is forfeited, not refunded.
    state.bonded_validators.remove(&dupeout.address);
    state.unbonding_validators.remove(&dupeout.address);
    debug!(validator = %dupeout.address, "validator slashed for equivocation");
    Ok(0)
}
