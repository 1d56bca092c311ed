//! Consensus constants, network parameters, checkpoints, and the block value schedule.

pub mod checkpoints;
pub mod constants;
pub mod money;
pub mod params;
pub mod rewards;

pub type Hash256 = [u8; 32];

pub use checkpoints::{CheckpointPolicy, Checkpoints};
pub use params::{
    chain_params, consensus_params, hash256_from_hex, hash256_to_hex, ChainParams, Checkpoint,
    CheckpointData, ConsensusParams, GenesisParams, HexError, MasternodeParams, Network,
};
pub use rewards::{block_value, difficulty_from_bits};
