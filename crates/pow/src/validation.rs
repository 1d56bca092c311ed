use primitive_types::U256;
use vcoin_consensus::{difficulty_from_bits, ConsensusParams, Hash256};

use crate::difficulty::{compact_to_u256, CompactError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowError {
    InvalidBits(&'static str),
    HashMismatch,
    Compact(CompactError),
}

impl std::fmt::Display for PowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowError::InvalidBits(message) => write!(f, "{message}"),
            PowError::HashMismatch => write!(f, "block hash does not meet target"),
            PowError::Compact(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for PowError {}

impl From<CompactError> for PowError {
    fn from(err: CompactError) -> Self {
        PowError::Compact(err)
    }
}

/// Checks that `bits` is a valid target no easier than the limit and that `hash` meets it.
pub fn check_proof_of_work(
    hash: &Hash256,
    bits: u32,
    params: &ConsensusParams,
) -> Result<(), PowError> {
    let target = compact_to_u256(bits)?;
    if target.is_zero() {
        return Err(PowError::InvalidBits("pow target is zero"));
    }

    let pow_limit = U256::from_little_endian(&params.pow_limit);
    if target > pow_limit {
        return Err(PowError::InvalidBits("pow target above limit"));
    }

    if U256::from_little_endian(hash) > target {
        return Err(PowError::HashMismatch);
    }

    Ok(())
}

/// Relaxed bits comparison used while early mainnet blocks are accepted: the claimed
/// difficulty may differ from the expected one by up to 20%.
pub fn bits_within_tolerance(claimed: u32, expected: u32) -> bool {
    let claimed = difficulty_from_bits(claimed);
    let expected = difficulty_from_bits(expected);
    (claimed - expected).abs() <= claimed * 0.2
}
