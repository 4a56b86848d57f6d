//! Append-only block store over the blob `Db`.
//!
//! Keys: `H:<height>` block bytes, `P:<height>:<index>` part bytes,
//! `V:<height>` the block's own commit signatures, `BSINFO` the store height.
//! The height only advances once both `H:` and `V:` for it are written.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::codec::{CodecError, Decoder, Encoder};
use crate::db::Db;
use crate::types::{Block, Part, PartSet, Validation};

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("corrupt stored value: {0}")]
    Corrupt(#[from] CodecError),
    #[error("non-contiguous save: store at {store}, block at {block}")]
    NonContiguous { store: u64, block: u64 },
    #[error("part set incomplete for block {0}")]
    IncompleteParts(u64),
}

pub struct BlockStore {
    db: Arc<dyn Db>,
    height: AtomicU64,
}

fn block_key(height: u64) -> Vec<u8> {
    format!("H:{}", height).into_bytes()
}

fn part_key(height: u64, index: u32) -> Vec<u8> {
    format!("P:{}:{}", height, index).into_bytes()
}

fn validation_key(height: u64) -> Vec<u8> {
    format!("V:{}", height).into_bytes()
}

const BSINFO_KEY: &[u8] = b"BSINFO";

impl BlockStore {
    pub fn new(db: Arc<dyn Db>) -> Self {
        let height = match db.get(BSINFO_KEY) {
            None => 0,
            Some(bytes) => {
                let mut d = Decoder::new(&bytes);
                d.get_u64().unwrap_or(0)
            }
        };
        Self {
            db,
            height: AtomicU64::new(height),
        }
    }

    /// Greatest height for which both block and validation are stored.
    pub fn height(&self) -> u64 {
        self.height.load(Ordering::SeqCst)
    }

    pub fn load_block(&self, height: u64) -> Result<Option<Block>, StoreError> {
        match self.db.get(&block_key(height)) {
            None => Ok(None),
            Some(bytes) => Ok(Some(Block::decode_from_bytes(&bytes)?)),
        }
    }

    pub fn load_block_part(&self, height: u64, index: u32) -> Result<Option<Part>, StoreError> {
        match self.db.get(&part_key(height, index)) {
            None => Ok(None),
            Some(bytes) => {
                let mut d = Decoder::new(&bytes);
                let part = Part::decode(&mut d)?;
                d.finish()?;
                Ok(Some(part))
            }
        }
    }

    /// The commit signatures for the block at `height` itself (not the ones
    /// embedded in the block, which prove its predecessor).
    pub fn load_block_validation(&self, height: u64) -> Result<Option<Validation>, StoreError> {
        match self.db.get(&validation_key(height)) {
            None => Ok(None),
            Some(bytes) => {
                let mut d = Decoder::new(&bytes);
                let validation = Validation::decode(&mut d)?;
                d.finish()?;
                Ok(Some(validation))
            }
        }
    }

    /// Persist a committed block with all its parts and its commit set, then
    /// advance the store height.
    pub fn save_block(
        &self,
        block: &Block,
        parts: &PartSet,
        validation: &Validation,
    ) -> Result<(), StoreError> {
        let height = block.header.height;
        let store_height = self.height();
        if height != store_height + 1 {
            return Err(StoreError::NonContiguous {
                store: store_height,
                block: height,
            });
        }
        if !parts.is_complete() {
            return Err(StoreError::IncompleteParts(height));
        }

        self.db.set(&block_key(height), &block.encode_to_bytes());
        for i in 0..parts.total() {
            let part = parts.get_part(i).expect("complete part set");
            let mut e = Encoder::new();
            part.encode(&mut e);
            self.db.set(&part_key(height, i), &e.into_bytes());
        }
        let mut e = Encoder::new();
        validation.encode(&mut e);
        self.db.set(&validation_key(height), &e.into_bytes());

        let mut e = Encoder::new();
        e.put_u64(height);
        self.db.set(BSINFO_KEY, &e.into_bytes());
        self.height.store(height, Ordering::SeqCst);
        Ok(())
    }
}
