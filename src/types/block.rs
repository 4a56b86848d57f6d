use crate::codec::{CodecError, Decoder, Encoder};
use crate::crypto::hash::sha256;
use crate::merkle::simple_hash_from_hashes;
use crate::types::{Hash, PartSet, PartSetHeader, Tx, Validation};

#[derive(thiserror::Error, Debug)]
pub enum BlockError {
    #[error("wrong chain id: {0}")]
    WrongChainId(String),
    #[error("wrong height: got {got}, want {want}")]
    WrongHeight { got: u64, want: u64 },
    #[error("last block hash mismatch")]
    LastBlockHashMismatch,
    #[error("last block parts mismatch")]
    LastBlockPartsMismatch,
    #[error("block time not after previous block")]
    NonMonotonicTime,
    #[error("num_txs does not match data")]
    NumTxsMismatch,
    #[error("data hash does not match transactions")]
    DataHashMismatch,
    #[error("last validation hash mismatch")]
    LastValidationHashMismatch,
    #[error("unexpected validation on first block")]
    ValidationOnGenesis,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub chain_id: String,
    pub height: u64,
    /// Microseconds since the Unix epoch.
    pub time: i64,
    pub fees: u64,
    pub num_txs: u32,
    pub last_block_hash: Option<Hash>,
    pub last_block_parts: PartSetHeader,
    pub last_validation_hash: Hash,
    pub data_hash: Hash,
    pub state_hash: Hash,
}

impl BlockHeader {
    pub fn encode(&self, e: &mut Encoder) {
        e.put_string(&self.chain_id);
        e.put_u64(self.height);
        e.put_time(self.time);
        e.put_u64(self.fees);
        e.put_u32(self.num_txs);
        e.put_opt_hash(&self.last_block_hash);
        self.last_block_parts.encode(e);
        e.put_hash(&self.last_validation_hash);
        e.put_hash(&self.data_hash);
        e.put_hash(&self.state_hash);
    }

    pub fn decode(d: &mut Decoder<'_>) -> Result<BlockHeader, CodecError> {
        Ok(BlockHeader {
            chain_id: d.get_string()?,
            height: d.get_u64()?,
            time: d.get_time()?,
            fees: d.get_u64()?,
            num_txs: d.get_u32()?,
            last_block_hash: d.get_opt_hash()?,
            last_block_parts: PartSetHeader::decode(d)?,
            last_validation_hash: d.get_hash()?,
            data_hash: d.get_hash()?,
            state_hash: d.get_hash()?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockData {
    pub txs: Vec<Tx>,
}

impl BlockData {
    pub fn hash(&self) -> Hash {
        let hashes: Vec<Hash> = self.txs.iter().map(|tx| tx.hash()).collect();
        simple_hash_from_hashes(&hashes)
    }

    pub fn encode(&self, e: &mut Encoder) {
        e.put_u32(self.txs.len() as u32);
        for tx in &self.txs {
            tx.encode(e);
        }
    }

    pub fn decode(d: &mut Decoder<'_>) -> Result<BlockData, CodecError> {
        let n = d.get_u32()? as usize;
        if n > 1 << 20 {
            return Err(CodecError::Invalid("too many txs"));
        }
        let mut txs = Vec::with_capacity(n);
        for _ in 0..n {
            txs.push(Tx::decode(d)?);
        }
        Ok(BlockData { txs })
    }
}

/// A block: header, transactions, and the commit signatures that finalized
/// the previous block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub last_validation: Validation,
    pub data: BlockData,
}

impl Block {
    /// Block hash: the hash of the canonical header encoding. The header
    /// commits to data and validation through their hashes.
    pub fn hash(&self) -> Hash {
        let mut e = Encoder::new();
        self.header.encode(&mut e);
        sha256(&e.into_bytes())
    }

    pub fn encode(&self, e: &mut Encoder) {
        self.header.encode(e);
        self.last_validation.encode(e);
        self.data.encode(e);
    }

    pub fn encode_to_bytes(&self) -> Vec<u8> {
        let mut e = Encoder::new();
        self.encode(&mut e);
        e.into_bytes()
    }

    pub fn decode(d: &mut Decoder<'_>) -> Result<Block, CodecError> {
        Ok(Block {
            header: BlockHeader::decode(d)?,
            last_validation: Validation::decode(d)?,
            data: BlockData::decode(d)?,
        })
    }

    pub fn decode_from_bytes(bytes: &[u8]) -> Result<Block, CodecError> {
        let mut d = Decoder::new(bytes);
        let block = Block::decode(&mut d)?;
        d.finish()?;
        Ok(block)
    }

    pub fn make_part_set(&self) -> PartSet {
        PartSet::from_data(&self.encode_to_bytes())
    }

    /// Syntactic validation against the chain tip. Signature checks on
    /// `last_validation` belong to the state transition.
    pub fn validate_basic(
        &self,
        chain_id: &str,
        last_block_height: u64,
        last_block_hash: Option<Hash>,
        last_block_parts: PartSetHeader,
        last_block_time: i64,
    ) -> Result<(), BlockError> {
        if self.header.chain_id != chain_id {
            return Err(BlockError::WrongChainId(self.header.chain_id.clone()));
        }
        if self.header.height != last_block_height + 1 {
            return Err(BlockError::WrongHeight {
                got: self.header.height,
                want: last_block_height + 1,
            });
        }
        if self.header.last_block_hash != last_block_hash {
            return Err(BlockError::LastBlockHashMismatch);
        }
        if self.header.last_block_parts != last_block_parts {
            return Err(BlockError::LastBlockPartsMismatch);
        }
        if self.header.time <= last_block_time {
            return Err(BlockError::NonMonotonicTime);
        }
        if self.header.num_txs as usize != self.data.txs.len() {
            return Err(BlockError::NumTxsMismatch);
        }
        if self.header.data_hash != self.data.hash() {
            return Err(BlockError::DataHashMismatch);
        }
        if self.header.last_validation_hash != self.last_validation.hash() {
            return Err(BlockError::LastValidationHashMismatch);
        }
        if self.header.height == 1 && !self.last_validation.is_empty() {
            return Err(BlockError::ValidationOnGenesis);
        }
        Ok(())
    }
}
