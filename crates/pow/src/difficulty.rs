//! Difficulty and compact target utilities.

use std::sync::Arc;

use primitive_types::{U256, U512};
use vcoin_consensus::{ConsensusParams, Hash256};
use vcoin_log::log_debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactError {
    Negative,
    Overflow,
}

impl std::fmt::Display for CompactError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactError::Negative => write!(f, "compact target has negative sign bit"),
            CompactError::Overflow => write!(f, "compact target overflows 256-bit range"),
        }
    }
}

impl std::error::Error for CompactError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DifficultyError {
    InsufficientHistory,
    NonContiguous,
    Compact(CompactError),
}

impl std::fmt::Display for DifficultyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DifficultyError::InsufficientHistory => {
                write!(f, "not enough ancestor headers for retarget")
            }
            DifficultyError::NonContiguous => write!(f, "header list must be contiguous by height"),
            DifficultyError::Compact(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for DifficultyError {}

impl From<CompactError> for DifficultyError {
    fn from(err: CompactError) -> Self {
        DifficultyError::Compact(err)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeaderInfo {
    pub height: i64,
    pub time: i64,
    pub bits: u32,
}

pub fn compact_to_u256(bits: u32) -> Result<U256, CompactError> {
    let size = bits >> 24;
    let mut word = bits & 0x007f_ffff;
    let negative = (bits & 0x0080_0000) != 0;

    if negative && word != 0 {
        return Err(CompactError::Negative);
    }

    let value = if size <= 3 {
        word >>= 8 * (3 - size);
        U256::from(word)
    } else {
        if word != 0 {
            let overflow =
                size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32);
            if overflow {
                return Err(CompactError::Overflow);
            }
        }
        U256::from(word) << (8 * (size - 3))
    };

    Ok(value)
}

pub fn u256_to_compact(value: U256) -> u32 {
    if value.is_zero() {
        return 0;
    }

    let mut size = value.bits().div_ceil(8) as u32;
    let mut compact = if size <= 3 {
        value.low_u32() << (8 * (3 - size))
    } else {
        (value >> (8 * (size - 3))).low_u32()
    };

    if (compact & 0x0080_0000) != 0 {
        compact >>= 8;
        size += 1;
    }

    (size << 24) | (compact & 0x007f_ffff)
}

pub fn compact_to_target(bits: u32) -> Result<Hash256, CompactError> {
    Ok(compact_to_u256(bits)?.to_little_endian())
}

pub fn target_to_compact(target: &Hash256) -> u32 {
    u256_to_compact(U256::from_little_endian(target))
}

pub fn hash_meets_target(hash: &Hash256, target: &Hash256) -> bool {
    U256::from_little_endian(hash) <= U256::from_little_endian(target)
}

/// Expected number of hashes to find a block at `bits`: `2^256 / (target + 1)`.
pub fn block_proof(bits: u32) -> U256 {
    let target = match compact_to_u256(bits) {
        Ok(target) if !target.is_zero() => target,
        _ => return U256::zero(),
    };
    (!target / (target + U256::one())) + U256::one()
}

/// Computes the bits a block must carry given its ancestors.
///
/// `chain` ends at the parent of the new block and must be contiguous by height;
/// an empty slice means the new block is the genesis block.
pub trait DifficultyPolicy: Send + Sync {
    fn next_work_required(
        &self,
        chain: &[HeaderInfo],
        next_block_time: i64,
    ) -> Result<u32, DifficultyError>;

    /// How many trailing headers `next_work_required` needs.
    fn lookback(&self) -> usize;

    /// Easiest bits reachable `elapsed` seconds after a block carrying `base_bits`.
    fn compute_min_work(&self, base_bits: u32, elapsed: i64) -> u32;

    fn pow_limit_bits(&self) -> u32;
}

/// Retargets once per `timespan / spacing` blocks, clamping the observed timespan to ×4.
#[derive(Clone, Debug)]
pub struct IntervalRetarget {
    pow_limit: U256,
    limit_bits: u32,
    spacing: i64,
    timespan: i64,
    interval: i64,
    allow_min_difficulty: bool,
}

impl IntervalRetarget {
    pub fn new(params: &ConsensusParams) -> Self {
        let pow_limit = U256::from_little_endian(&params.pow_limit);
        Self {
            pow_limit,
            limit_bits: u256_to_compact(pow_limit),
            spacing: params.pow_target_spacing,
            timespan: params.pow_target_timespan,
            interval: params.difficulty_adjustment_interval().max(1),
            allow_min_difficulty: params.pow_allow_min_difficulty_blocks,
        }
    }

    fn retarget(&self, chain: &[HeaderInfo]) -> Result<u32, DifficultyError> {
        let last = chain[chain.len() - 1];
        // The first retarget after genesis can only reach back to block 0.
        let go_back = if last.height + 1 == self.interval {
            self.interval - 1
        } else {
            self.interval
        };
        if go_back as usize >= chain.len() {
            return Err(DifficultyError::InsufficientHistory);
        }
        let first = chain[chain.len() - 1 - go_back as usize];

        let actual = (last.time - first.time).clamp(self.timespan / 4, self.timespan * 4);
        let target = compact_to_u256(last.bits)?;
        let scaled = target.full_mul(U256::from(actual as u64)) / U512::from(self.timespan as u64);
        let mut next = U256::try_from(scaled).unwrap_or(self.pow_limit);
        if next > self.pow_limit {
            next = self.pow_limit;
        }
        let bits = u256_to_compact(next);
        log_debug!(
            "retarget at height {}: timespan {} (target {}), bits {:08x} -> {:08x}",
            last.height + 1,
            actual,
            self.timespan,
            last.bits,
            bits
        );
        Ok(bits)
    }
}

impl DifficultyPolicy for IntervalRetarget {
    fn next_work_required(
        &self,
        chain: &[HeaderInfo],
        next_block_time: i64,
    ) -> Result<u32, DifficultyError> {
        let Some(last) = chain.last() else {
            return Ok(self.limit_bits);
        };
        ensure_contiguous(chain)?;

        if (last.height + 1) % self.interval == 0 {
            return self.retarget(chain);
        }
        if !self.allow_min_difficulty {
            return Ok(last.bits);
        }
        if next_block_time > last.time + self.spacing * 2 {
            return Ok(self.limit_bits);
        }
        let mut index = chain.len() - 1;
        while index > 0
            && chain[index].height % self.interval != 0
            && chain[index].bits == self.limit_bits
        {
            index -= 1;
        }
        Ok(chain[index].bits)
    }

    fn lookback(&self) -> usize {
        self.interval as usize + 1
    }

    fn compute_min_work(&self, base_bits: u32, elapsed: i64) -> u32 {
        if self.allow_min_difficulty && elapsed > self.spacing * 2 {
            return self.limit_bits;
        }
        let Ok(mut result) = compact_to_u256(base_bits) else {
            return self.limit_bits;
        };
        let mut remaining = elapsed;
        while remaining > 0 && result < self.pow_limit {
            result = result.saturating_mul(U256::from(4u8));
            remaining -= self.timespan * 4;
        }
        if result > self.pow_limit {
            result = self.pow_limit;
        }
        u256_to_compact(result)
    }

    fn pow_limit_bits(&self) -> u32 {
        self.limit_bits
    }
}

/// Every block carries its parent's bits.
#[derive(Clone, Debug)]
pub struct NoRetarget {
    limit_bits: u32,
}

impl NoRetarget {
    pub fn new(params: &ConsensusParams) -> Self {
        Self {
            limit_bits: target_to_compact(&params.pow_limit),
        }
    }
}

impl DifficultyPolicy for NoRetarget {
    fn next_work_required(
        &self,
        chain: &[HeaderInfo],
        _next_block_time: i64,
    ) -> Result<u32, DifficultyError> {
        Ok(chain.last().map_or(self.limit_bits, |last| last.bits))
    }

    fn lookback(&self) -> usize {
        1
    }

    fn compute_min_work(&self, _base_bits: u32, _elapsed: i64) -> u32 {
        self.limit_bits
    }

    fn pow_limit_bits(&self) -> u32 {
        self.limit_bits
    }
}

pub fn difficulty_policy(params: &ConsensusParams) -> Arc<dyn DifficultyPolicy> {
    if params.pow_no_retargeting {
        Arc::new(NoRetarget::new(params))
    } else {
        Arc::new(IntervalRetarget::new(params))
    }
}

fn ensure_contiguous(chain: &[HeaderInfo]) -> Result<(), DifficultyError> {
    let base = chain[0].height;
    for (idx, header) in chain.iter().enumerate() {
        if header.height != base + idx as i64 {
            return Err(DifficultyError::NonContiguous);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vcoin_consensus::{consensus_params, Network};

    fn make_chain(base_height: i64, times: &[i64], bits: u32) -> Vec<HeaderInfo> {
        times
            .iter()
            .enumerate()
            .map(|(offset, time)| HeaderInfo {
                height: base_height + offset as i64,
                time: *time,
                bits,
            })
            .collect()
    }

    #[test]
    fn first_retarget_goes_back_one_block_less() {
        let params = consensus_params(Network::Mainnet);
        let policy = IntervalRetarget::new(&params);
        assert_eq!(params.difficulty_adjustment_interval(), 3);

        // Two blocks spanning 600s against a 900s timespan.
        let chain = make_chain(0, &[0, 300, 600], 0x1e0f_fff0);
        let bits = policy.next_work_required(&chain, 900).expect("bits");
        assert_eq!(bits, 0x1e0a_aaa0);
    }

    #[test]
    fn later_retargets_span_full_interval() {
        let params = consensus_params(Network::Mainnet);
        let policy = IntervalRetarget::new(&params);
        let chain = make_chain(2, &[600, 900, 1200, 1500], 0x1e0f_fff0);
        let bits = policy.next_work_required(&chain, 1800).expect("bits");
        assert_eq!(bits, 0x1e0f_fff0);

        assert_eq!(
            policy.next_work_required(&chain[1..], 1800),
            Err(DifficultyError::InsufficientHistory)
        );
    }

    #[test]
    fn retarget_clamps_to_four_times() {
        let params = consensus_params(Network::Mainnet);
        let policy = IntervalRetarget::new(&params);
        let chain = make_chain(2, &[0, 1, 2, 3], 0x1d0f_fff0);
        let bits = policy.next_work_required(&chain, 4).expect("bits");
        assert_eq!(bits, u256_to_compact(compact_to_u256(0x1d0f_fff0).expect("target") / 4));
    }

    #[test]
    fn between_retargets_bits_carry_over() {
        let params = consensus_params(Network::Mainnet);
        let policy = IntervalRetarget::new(&params);
        let chain = make_chain(3, &[1000, 1300], 0x1d00_ffff);
        assert_eq!(policy.next_work_required(&chain, 100_000), Ok(0x1d00_ffff));
    }

    #[test]
    fn testnet_allows_min_difficulty_after_gap() {
        let params = consensus_params(Network::Testnet);
        let policy = IntervalRetarget::new(&params);
        let limit = policy.pow_limit_bits();

        let chain = make_chain(3, &[1000, 1300], 0x1d00_ffff);
        assert_eq!(policy.next_work_required(&chain, 1300 + 601), Ok(limit));

        // A run of min-difficulty blocks falls back to the last real bits.
        let mut chain = make_chain(3, &[1000, 1601], 0x1d00_ffff);
        chain[1].bits = limit;
        assert_eq!(policy.next_work_required(&chain, 1700), Ok(0x1d00_ffff));
    }

    #[test]
    fn min_work_grows_four_fold_per_window() {
        let params = consensus_params(Network::Mainnet);
        let policy = IntervalRetarget::new(&params);
        assert_eq!(policy.compute_min_work(0x1e0f_fff0, 0), 0x1e0f_fff0);
        assert_eq!(policy.compute_min_work(0x1e0f_fff0, 1), 0x1e3f_ffc0);
        assert_eq!(
            policy.compute_min_work(0x1e0f_fff0, 1_000_000),
            target_to_compact(&params.pow_limit)
        );

        let testnet = IntervalRetarget::new(&consensus_params(Network::Testnet));
        assert_eq!(testnet.compute_min_work(0x1c00_ffff, 601), testnet.pow_limit_bits());
    }

    #[test]
    fn regtest_never_retargets() {
        let params = consensus_params(Network::Regtest);
        let policy = difficulty_policy(&params);
        let chain = make_chain(0, &[0, 1, 2], 0x207f_ffff);
        assert_eq!(policy.next_work_required(&chain, 3), Ok(0x207f_ffff));
        assert_eq!(policy.next_work_required(&[], 0), Ok(policy.pow_limit_bits()));
    }

    #[test]
    fn block_proof_of_easiest_target() {
        assert_eq!(block_proof(0x207f_ffff), U256::from(2u8));
        assert!(block_proof(0x1d00_ffff) > block_proof(0x1e0f_fff0));
        assert_eq!(block_proof(0), U256::zero());
    }
}
