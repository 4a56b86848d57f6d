//! Blocks are gossiped as fixed-size parts, Merkle-rooted so every part can
//! be verified in isolation before the block is whole.

use crate::codec::{CodecError, Decoder, Encoder};
use crate::crypto::hash::sha256;
use crate::merkle::{simple_hash_from_hashes, simple_proofs_from_hashes, verify_proof};
use crate::types::{BitArray, Hash};

pub const PART_SIZE: usize = 4096;

#[derive(thiserror::Error, Debug)]
pub enum PartSetError {
    #[error("part index {0} out of bounds")]
    IndexOutOfBounds(u32),
    #[error("invalid inclusion proof for part {0}")]
    InvalidProof(u32),
    #[error("part set is incomplete")]
    Incomplete,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct PartSetHeader {
    pub total: u32,
    pub hash: Hash,
}

impl PartSetHeader {
    pub fn is_zero(&self) -> bool {
        self.total == 0 && self.hash.is_zero()
    }

    pub fn encode(&self, e: &mut Encoder) {
        e.put_u32(self.total);
        e.put_hash(&self.hash);
    }

    pub fn decode(d: &mut Decoder<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            total: d.get_u32()?,
            hash: d.get_hash()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Part {
    pub index: u32,
    pub bytes: Vec<u8>,
    /// Sibling path proving inclusion under the part set root.
    pub proof: Vec<Hash>,
}

impl Part {
    pub fn hash(&self) -> Hash {
        sha256(&self.bytes)
    }

    pub fn encode(&self, e: &mut Encoder) {
        e.put_u32(self.index);
        e.put_bytes(&self.bytes);
        e.put_u32(self.proof.len() as u32);
        for h in &self.proof {
            e.put_hash(h);
        }
    }

    pub fn decode(d: &mut Decoder<'_>) -> Result<Self, CodecError> {
        let index = d.get_u32()?;
        let bytes = d.get_bytes()?;
        let n = d.get_u32()? as usize;
        if n > 64 {
            return Err(CodecError::Invalid("part proof too long"));
        }
        let mut proof = Vec::with_capacity(n);
        for _ in 0..n {
            proof.push(d.get_hash()?);
        }
        Ok(Self { index, bytes, proof })
    }
}

#[derive(Clone, Debug)]
pub struct PartSet {
    header: PartSetHeader,
    parts: Vec<Option<Part>>,
    bit_array: BitArray,
    count: u32,
}

impl PartSet {
    /// Split data into parts with inclusion proofs; the result is complete.
    pub fn from_data(data: &[u8]) -> PartSet {
        let chunks: Vec<&[u8]> = if data.is_empty() {
            vec![data]
        } else {
            data.chunks(PART_SIZE).collect()
        };
        let hashes: Vec<Hash> = chunks.iter().map(|c| sha256(c)).collect();
        let root = simple_hash_from_hashes(&hashes);
        let proofs = simple_proofs_from_hashes(&hashes);

        let total = chunks.len() as u32;
        let mut bit_array = BitArray::new(total as usize);
        let parts: Vec<Option<Part>> = chunks
            .iter()
            .zip(proofs)
            .enumerate()
            .map(|(i, (chunk, proof))| {
                bit_array.set_index(i, true);
                Some(Part {
                    index: i as u32,
                    bytes: chunk.to_vec(),
                    proof,
                })
            })
            .collect();

        PartSet {
            header: PartSetHeader { total, hash: root },
            parts,
            bit_array,
            count: total,
        }
    }

    /// Empty set awaiting parts matching `header`.
    pub fn new_from_header(header: PartSetHeader) -> PartSet {
        PartSet {
            header,
            parts: vec![None; header.total as usize],
            bit_array: BitArray::new(header.total as usize),
            count: 0,
        }
    }

    pub fn header(&self) -> PartSetHeader {
        self.header
    }

    pub fn has_header(&self, header: &PartSetHeader) -> bool {
        self.header == *header
    }

    pub fn total(&self) -> u32 {
        self.header.total
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn bit_array(&self) -> BitArray {
        self.bit_array.clone()
    }

    pub fn is_complete(&self) -> bool {
        self.count == self.header.total
    }

    pub fn get_part(&self, index: u32) -> Option<&Part> {
        self.parts.get(index as usize).and_then(|p| p.as_ref())
    }

    /// Add a part after verifying its inclusion proof.
    /// Returns false when the slot was already filled.
    pub fn add_part(&mut self, part: Part) -> Result<bool, PartSetError> {
        let index = part.index;
        if index >= self.header.total {
            return Err(PartSetError::IndexOutOfBounds(index));
        }
        if self.parts[index as usize].is_some() {
            return Ok(false);
        }
        if !verify_proof(
            part.hash(),
            index as usize,
            self.header.total as usize,
            &part.proof,
            self.header.hash,
        ) {
            return Err(PartSetError::InvalidProof(index));
        }
        self.parts[index as usize] = Some(part);
        self.bit_array.set_index(index as usize, true);
        self.count += 1;
        Ok(true)
    }

    /// Concatenate all parts back into the original bytes.
    pub fn assemble(&self) -> Result<Vec<u8>, PartSetError> {
        if !self.is_complete() {
            return Err(PartSetError::Incomplete);
        }
        let mut out = Vec::new();
        for part in &self.parts {
            out.extend_from_slice(&part.as_ref().expect("complete").bytes);
        }
        Ok(out)
    }
}
