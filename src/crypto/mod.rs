pub mod ed25519;
pub mod hash;
pub mod hex;
pub mod priv_validator;

pub use ed25519::{PubKey, Signature};
pub use priv_validator::PrivValidator;
