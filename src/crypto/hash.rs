use crate::types::{Address, Hash};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

pub fn sha256(data: &[u8]) -> Hash {
    let mut h = Sha256::new();
    h.update(data);
    let out = h.finalize();
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&out);
    Hash(bytes)
}

/// Address digest: RIPEMD-160 over the SHA-256 of the input.
pub fn address_digest(data: &[u8]) -> Address {
    let inner = sha256(data);
    let mut h = Ripemd160::new();
    h.update(inner.0);
    let out = h.finalize();
    let mut bytes = [0u8; 20];
    bytes.copy_from_slice(&out);
    Address(bytes)
}
