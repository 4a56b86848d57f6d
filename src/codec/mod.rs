//! Canonical binary codec.
//!
//! Every integer is big-endian and fixed-width. Byte strings are prefixed by a
//! u32 length. Tagged unions encode as a type byte followed by the body. Time
//! is an i64 count of microseconds since the Unix epoch. Every hash in the
//! protocol is the SHA-256 of a value's canonical encoding, so encoding must
//! be byte-identical everywhere.

use crate::crypto::{PubKey, Signature};
use crate::types::{Address, Hash};

#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("unexpected eof")]
    Eof,
    #[error("invalid data: {0}")]
    Invalid(&'static str),
}

pub struct Encoder {
    buf: Vec<u8>,
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }
    pub fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }
    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }
    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }
    pub fn put_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Time is an i64 microsecond count.
    pub fn put_time(&mut self, micros: i64) {
        self.put_i64(micros);
    }

    /// u32 length prefix followed by the raw bytes.
    pub fn put_bytes(&mut self, data: &[u8]) {
        self.put_u32(data.len() as u32);
        self.buf.extend_from_slice(data);
    }

    pub fn put_string(&mut self, s: &str) {
        self.put_bytes(s.as_bytes());
    }

    pub fn put_hash(&mut self, h: &Hash) {
        self.buf.extend_from_slice(&h.0);
    }

    /// Absent hash encodes as a zero length, present as length 32 + bytes.
    pub fn put_opt_hash(&mut self, h: &Option<Hash>) {
        match h {
            None => self.put_u32(0),
            Some(h) => {
                self.put_u32(32);
                self.buf.extend_from_slice(&h.0);
            }
        }
    }

    pub fn put_address(&mut self, a: &Address) {
        self.buf.extend_from_slice(&a.0);
    }

    pub fn put_pub_key(&mut self, pk: &PubKey) {
        self.buf.extend_from_slice(&pk.0);
    }

    pub fn put_signature(&mut self, sig: &Signature) {
        self.buf.extend_from_slice(&sig.0);
    }
}

pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Remaining unread byte count.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Decoding must consume the whole input; trailing bytes are an error.
    pub fn finish(self) -> Result<(), CodecError> {
        if self.pos != self.data.len() {
            return Err(CodecError::Invalid("trailing bytes"));
        }
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.pos + n > self.data.len() {
            return Err(CodecError::Eof);
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }
    pub fn get_u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }
    pub fn get_u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
    pub fn get_u64(&mut self) -> Result<u64, CodecError> {
        let b = self.take(8)?;
        let mut x = [0u8; 8];
        x.copy_from_slice(b);
        Ok(u64::from_be_bytes(x))
    }
    pub fn get_i64(&mut self) -> Result<i64, CodecError> {
        let b = self.take(8)?;
        let mut x = [0u8; 8];
        x.copy_from_slice(b);
        Ok(i64::from_be_bytes(x))
    }
    pub fn get_time(&mut self) -> Result<i64, CodecError> {
        self.get_i64()
    }

    pub fn get_bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        let n = self.get_u32()? as usize;
        Ok(self.take(n)?.to_vec())
    }

    pub fn get_string(&mut self) -> Result<String, CodecError> {
        let bytes = self.get_bytes()?;
        String::from_utf8(bytes).map_err(|_| CodecError::Invalid("non-utf8 string"))
    }

    pub fn get_hash(&mut self) -> Result<Hash, CodecError> {
        let b = self.take(32)?;
        let mut out = [0u8; 32];
        out.copy_from_slice(b);
        Ok(Hash(out))
    }

    pub fn get_opt_hash(&mut self) -> Result<Option<Hash>, CodecError> {
        let n = self.get_u32()? as usize;
        if n == 0 {
            return Ok(None);
        }
        if n != 32 {
            return Err(CodecError::Invalid("opt hash length != 32"));
        }
        Ok(Some(self.get_hash()?))
    }

    pub fn get_address(&mut self) -> Result<Address, CodecError> {
        let b = self.take(20)?;
        let mut out = [0u8; 20];
        out.copy_from_slice(b);
        Ok(Address(out))
    }

    pub fn get_pub_key(&mut self) -> Result<PubKey, CodecError> {
        let b = self.take(32)?;
        let mut out = [0u8; 32];
        out.copy_from_slice(b);
        Ok(PubKey(out))
    }

    pub fn get_signature(&mut self) -> Result<Signature, CodecError> {
        let b = self.take(64)?;
        let mut out = [0u8; 64];
        out.copy_from_slice(b);
        Ok(Signature(out))
    }
}
