use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::Result;
use ed25519_dalek::Signer;
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand_core::OsRng;

use crate::crypto::hash::address_digest;
use crate::types::Address;

/// Ed25519 public key (32 raw bytes).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PubKey(pub [u8; 32]);

impl PubKey {
    /// Account / validator address derived from this key.
    pub fn address(&self) -> Address {
        address_digest(&self.0)
    }

    pub fn verify(&self, msg: &[u8], sig: &Signature) -> bool {
        let vk = match VerifyingKey::from_bytes(&self.0) {
            Ok(vk) => vk,
            Err(_) => return false,
        };
        let sig = ed25519_dalek::Signature::from_bytes(&sig.0);
        vk.verify_strict(msg, &sig).is_ok()
    }
}

impl fmt::Debug for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PubKey({})", crate::crypto::hex::encode(&self.0[..8]))
    }
}

/// Ed25519 signature (64 raw bytes).
#[derive(Clone, Copy)]
pub struct Signature(pub [u8; 64]);

impl Signature {
    pub const ZERO: Signature = Signature([0u8; 64]);
}

impl PartialEq for Signature {
    fn eq(&self, other: &Self) -> bool {
        self.0[..] == other.0[..]
    }
}
impl Eq for Signature {}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", crate::crypto::hex::encode(&self.0[..8]))
    }
}

pub fn generate_keypair() -> (SigningKey, PubKey) {
    let sk = SigningKey::generate(&mut OsRng);
    let pk = PubKey(sk.verifying_key().to_bytes());
    (sk, pk)
}

pub fn sign(sk: &SigningKey, msg: &[u8]) -> Signature {
    Signature(sk.sign(msg).to_bytes())
}

pub fn load_or_generate_keypair<P: AsRef<Path>>(path: P) -> Result<(SigningKey, PubKey)> {
    let path = path.as_ref();

    if path.exists() {
        let bytes = fs::read(path)?;
        if bytes.len() != 32 {
            anyhow::bail!("invalid key file length");
        }
        let mut sk_bytes = [0u8; 32];
        sk_bytes.copy_from_slice(&bytes);
        let signing = SigningKey::from_bytes(&sk_bytes);
        let pub_key = PubKey(signing.verifying_key().to_bytes());
        Ok((signing, pub_key))
    } else {
        let (signing, pub_key) = generate_keypair();
        fs::write(path, signing.to_bytes())?;
        Ok((signing, pub_key))
    }
}
