pub mod node;
pub mod simple;
pub mod tree;

pub use node::TreeError;
pub use simple::{simple_hash_from_hashes, simple_proofs_from_hashes, verify_proof};
pub use tree::IavlTree;
