pub mod address;
pub mod bit_array;
pub mod block;
pub mod genesis;
pub mod hash;
pub mod part_set;
pub mod pol;
pub mod proposal;
pub mod tx;
pub mod validator;
pub mod vote;

pub use address::Address;
pub use bit_array::BitArray;
pub use block::{Block, BlockData, BlockError, BlockHeader};
pub use genesis::{GenesisAccount, GenesisDoc, GenesisValidator};
pub use hash::Hash;
pub use part_set::{Part, PartSet, PartSetError, PartSetHeader, PART_SIZE};
pub use pol::{Pol, PolCommit, PolError, PolVote};
pub use proposal::Proposal;
pub use tx::{BondTx, DupeoutTx, SendTx, TimeoutTx, Tx, TxInput, TxOutput, UnbondTx};
pub use validator::{CommitSig, Validation, ValidationError, Validator, ValidatorSet};
pub use vote::{Vote, VoteType};

/// Wall-clock time as microseconds since the Unix epoch.
pub fn now_micros() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}
