pub mod difficulty;
pub mod validation;

pub use difficulty::{
    block_proof, compact_to_target, compact_to_u256, difficulty_policy, hash_meets_target,
    target_to_compact, u256_to_compact, CompactError, DifficultyError, DifficultyPolicy,
    HeaderInfo, IntervalRetarget, NoRetarget,
};
pub use validation::{bits_within_tolerance, check_proof_of_work, PowError};
