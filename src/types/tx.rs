//! Transactions: value transfers and validator-set adjustments.
//!
//! TxType (1 byte):
//!   0x01 Send     multi-input / multi-output value transfer
//!   0x02 Bond     new validator posts a bond
//!   0x03 Unbond   validator leaves
//!   0x04 Timeout  validator stopped committing and is pushed out
//!   0x05 Dupeout  validator signed two blocks at the same height/round
//!
//! All integers are big-endian fixed-width; byte fields are u32-length
//! prefixed. Inputs sign over the sign-doc, which omits signatures and
//! revealed public keys and is prefixed with the chain id.

use crate::codec::{CodecError, Decoder, Encoder};
use crate::crypto::hash::sha256;
use crate::crypto::{PubKey, Signature};
use crate::types::{Address, Hash, Vote};

pub const TX_TYPE_SEND: u8 = 0x01;
pub const TX_TYPE_BOND: u8 = 0x02;
pub const TX_TYPE_UNBOND: u8 = 0x03;
pub const TX_TYPE_TIMEOUT: u8 = 0x04;
pub const TX_TYPE_DUPEOUT: u8 = 0x05;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxInput {
    pub address: Address,
    pub amount: u64,
    /// Must be exactly the account's sequence + 1.
    pub sequence: u64,
    pub signature: Signature,
    /// Required on the first spend from an account, when the account does
    /// not yet know its public key.
    pub pub_key: Option<PubKey>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxOutput {
    pub address: Address,
    pub amount: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendTx {
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BondTx {
    /// Key the new validator will sign consensus votes with.
    pub pub_key: PubKey,
    pub inputs: Vec<TxInput>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnbondTx {
    pub address: Address,
    /// Height this unbond is valid at; stale unbonds don't replay.
    pub height: u64,
    pub signature: Signature,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimeoutTx {
    pub address: Address,
    pub penalty: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DupeoutTx {
    pub address: Address,
    pub vote_a: Vote,
    pub vote_b: Vote,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Tx {
    Send(SendTx),
    Bond(BondTx),
    Unbond(UnbondTx),
    Timeout(TimeoutTx),
    Dupeout(DupeoutTx),
}

impl Tx {
    pub fn type_byte(&self) -> u8 {
        match self {
            Tx::Send(_) => TX_TYPE_SEND,
            Tx::Bond(_) => TX_TYPE_BOND,
            Tx::Unbond(_) => TX_TYPE_UNBOND,
            Tx::Timeout(_) => TX_TYPE_TIMEOUT,
            Tx::Dupeout(_) => TX_TYPE_DUPEOUT,
        }
    }

    pub fn encode(&self, e: &mut Encoder) {
        e.put_u8(self.type_byte());
        match self {
            Tx::Send(tx) => {
                encode_inputs(e, &tx.inputs);
                encode_outputs(e, &tx.outputs);
            }
            Tx::Bond(tx) => {
                e.put_pub_key(&tx.pub_key);
                encode_inputs(e, &tx.inputs);
            }
            Tx::Unbond(tx) => {
                e.put_address(&tx.address);
                e.put_u64(tx.height);
                e.put_signature(&tx.signature);
            }
            Tx::Timeout(tx) => {
                e.put_address(&tx.address);
                e.put_u64(tx.penalty);
            }
            Tx::Dupeout(tx) => {
                e.put_address(&tx.address);
                tx.vote_a.encode(e);
                tx.vote_b.encode(e);
            }
        }
    }

    pub fn encode_to_bytes(&self) -> Vec<u8> {
        let mut e = Encoder::new();
        self.encode(&mut e);
        e.into_bytes()
    }

    pub fn decode(d: &mut Decoder<'_>) -> Result<Tx, CodecError> {
        let ty = d.get_u8()?;
        match ty {
            TX_TYPE_SEND => Ok(Tx::Send(SendTx {
                inputs: decode_inputs(d)?,
                outputs: decode_outputs(d)?,
            })),
            TX_TYPE_BOND => Ok(Tx::Bond(BondTx {
                pub_key: d.get_pub_key()?,
                inputs: decode_inputs(d)?,
            })),
            TX_TYPE_UNBOND => Ok(Tx::Unbond(UnbondTx {
                address: d.get_address()?,
                height: d.get_u64()?,
                signature: d.get_signature()?,
            })),
            TX_TYPE_TIMEOUT => Ok(Tx::Timeout(TimeoutTx {
                address: d.get_address()?,
                penalty: d.get_u64()?,
            })),
            TX_TYPE_DUPEOUT => Ok(Tx::Dupeout(DupeoutTx {
                address: d.get_address()?,
                vote_a: Vote::decode(d)?,
                vote_b: Vote::decode(d)?,
            })),
            _ => Err(CodecError::Invalid("unknown tx type")),
        }
    }

    pub fn decode_from_bytes(bytes: &[u8]) -> Result<Tx, CodecError> {
        let mut d = Decoder::new(bytes);
        let tx = Tx::decode(&mut d)?;
        d.finish()?;
        Ok(tx)
    }

    pub fn hash(&self) -> Hash {
        sha256(&self.encode_to_bytes())
    }

    /// Payload every input (or the unbonding validator) signs.
    pub fn sign_bytes(&self, chain_id: &str) -> Vec<u8> {
        let mut e = Encoder::new();
        e.put_string(chain_id);
        e.put_u8(self.type_byte());
        match self {
            Tx::Send(tx) => {
                e.put_u32(tx.inputs.len() as u32);
                for input in &tx.inputs {
                    encode_input_sign_doc(&mut e, input);
                }
                encode_outputs(&mut e, &tx.outputs);
            }
            Tx::Bond(tx) => {
                e.put_pub_key(&tx.pub_key);
                e.put_u32(tx.inputs.len() as u32);
                for input in &tx.inputs {
                    encode_input_sign_doc(&mut e, input);
                }
            }
            Tx::Unbond(tx) => {
                e.put_address(&tx.address);
                e.put_u64(tx.height);
            }
            // Timeout and Dupeout are protocol-justified, not signed.
            Tx::Timeout(tx) => {
                e.put_address(&tx.address);
                e.put_u64(tx.penalty);
            }
            Tx::Dupeout(tx) => {
                e.put_address(&tx.address);
                tx.vote_a.encode(&mut e);
                tx.vote_b.encode(&mut e);
            }
        }
        e.into_bytes()
    }
}

fn encode_input_sign_doc(e: &mut Encoder, input: &TxInput) {
    e.put_address(&input.address);
    e.put_u64(input.amount);
    e.put_u64(input.sequence);
}

fn encode_inputs(e: &mut Encoder, inputs: &[TxInput]) {
    e.put_u32(inputs.len() as u32);
    for input in inputs {
        e.put_address(&input.address);
        e.put_u64(input.amount);
        e.put_u64(input.sequence);
        e.put_signature(&input.signature);
        match &input.pub_key {
            None => e.put_u8(0),
            Some(pk) => {
                e.put_u8(1);
                e.put_pub_key(pk);
            }
        }
    }
}

fn decode_inputs(d: &mut Decoder<'_>) -> Result<Vec<TxInput>, CodecError> {
    let n = d.get_u32()? as usize;
    if n > 1 << 12 {
        return Err(CodecError::Invalid("too many tx inputs"));
    }
    let mut inputs = Vec::with_capacity(n);
    for _ in 0..n {
        let address = d.get_address()?;
        let amount = d.get_u64()?;
        let sequence = d.get_u64()?;
        let signature = d.get_signature()?;
        let pub_key = match d.get_u8()? {
            0 => None,
            1 => Some(d.get_pub_key()?),
            _ => return Err(CodecError::Invalid("bad pub key tag")),
        };
        inputs.push(TxInput {
            address,
            amount,
            sequence,
            signature,
            pub_key,
        });
    }
    Ok(inputs)
}

fn encode_outputs(e: &mut Encoder, outputs: &[TxOutput]) {
    e.put_u32(outputs.len() as u32);
    for output in outputs {
        e.put_address(&output.address);
        e.put_u64(output.amount);
    }
}

fn decode_outputs(d: &mut Decoder<'_>) -> Result<Vec<TxOutput>, CodecError> {
    let n = d.get_u32()? as usize;
    if n > 1 << 12 {
        return Err(CodecError::Invalid("too many tx outputs"));
    }
    let mut outputs = Vec::with_capacity(n);
    for _ in 0..n {
        outputs.push(TxOutput {
            address: d.get_address()?,
            amount: d.get_u64()?,
        });
    }
    Ok(outputs)
}
