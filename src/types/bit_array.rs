use rand::Rng;

use crate::codec::{CodecError, Decoder, Encoder};

/// Fixed-size bit set used to track which parts / votes a peer has.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct BitArray {
    bits: usize,
    elems: Vec<u64>,
}

impl BitArray {
    pub fn new(bits: usize) -> Self {
        Self {
            bits,
            elems: vec![0u64; (bits + 63) / 64],
        }
    }

    pub fn len(&self) -> usize {
        self.bits
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    pub fn get_index(&self, i: usize) -> bool {
        if i >= self.bits {
            return false;
        }
        self.elems[i / 64] & (1u64 << (i % 64)) != 0
    }

    pub fn set_index(&mut self, i: usize, v: bool) {
        if i >= self.bits {
            return;
        }
        if v {
            self.elems[i / 64] |= 1u64 << (i % 64);
        } else {
            self.elems[i / 64] &= !(1u64 << (i % 64));
        }
    }

    /// Bits set in `self` but not in `other`.
    pub fn sub(&self, other: &BitArray) -> BitArray {
        let mut out = self.clone();
        for (i, w) in out.elems.iter_mut().enumerate() {
            if let Some(o) = other.elems.get(i) {
                *w &= !o;
            }
        }
        out
    }

    pub fn or(&self, other: &BitArray) -> BitArray {
        let mut out = if self.bits >= other.bits {
            self.clone()
        } else {
            other.clone()
        };
        let shorter = if self.bits >= other.bits { other } else { self };
        for (i, w) in shorter.elems.iter().enumerate() {
            out.elems[i] |= w;
        }
        out
    }

    pub fn none_set(&self) -> bool {
        self.elems.iter().all(|w| *w == 0)
    }

    /// Pick a uniformly random set bit, if any.
    pub fn pick_random(&self) -> Option<usize> {
        let set: Vec<usize> = (0..self.bits).filter(|i| self.get_index(*i)).collect();
        if set.is_empty() {
            return None;
        }
        let mut rng = rand::thread_rng();
        Some(set[rng.gen_range(0..set.len())])
    }

    pub fn encode(&self, e: &mut Encoder) {
        e.put_u32(self.bits as u32);
        for w in &self.elems {
            e.put_u64(*w);
        }
    }

    pub fn decode(d: &mut Decoder<'_>) -> Result<BitArray, CodecError> {
        let bits = d.get_u32()? as usize;
        if bits > 1 << 24 {
            return Err(CodecError::Invalid("bit array too large"));
        }
        let words = (bits + 63) / 64;
        let mut elems = Vec::with_capacity(words);
        for _ in 0..words {
            elems.push(d.get_u64()?);
        }
        Ok(BitArray { bits, elems })
    }
}
