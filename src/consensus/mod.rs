pub mod peer_state;
pub mod reactor;
pub mod round_state;
pub mod state;
pub mod timer;
pub mod vote_set;
pub mod wire;

pub use peer_state::{PeerRoundState, PeerState};
pub use reactor::ConsensusReactor;
pub use round_state::{RoundState, RoundStep};
pub use state::{ConsensusConfig, ConsensusEvent, ConsensusOutput, ConsensusState};
pub use timer::{TimeoutInfo, TimerHandle, TimerService};
pub use vote_set::{HeightVoteSet, VoteSet, VoteSetError};
pub use wire::{ConsensusMessage, PartKind};
