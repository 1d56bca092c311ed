//! Hardcoded chain checkpoints.

use crate::params::{Checkpoint, CheckpointData, ConsensusParams};
use crate::Hash256;

/// Relative cost of verifying a transaction past the last checkpoint.
const SIGCHECK_VERIFICATION_FACTOR: f64 = 5.0;

/// Veto and sync-progress contract consulted by block acceptance and connection.
pub trait CheckpointPolicy: Send + Sync {
    /// Returns false when `hash` conflicts with a checkpoint pinned at `height`.
    fn check(&self, height: i32, hash: &Hash256) -> bool;
    /// Height below which script verification may be skipped.
    fn total_blocks_estimate(&self) -> i32;
    /// Highest checkpoint, if any.
    fn last_checkpoint(&self) -> Option<Checkpoint>;
    /// Estimated fraction of the chain's transactions verified at a tip with the given stats.
    fn verification_progress(&self, chain_tx: u64, tip_time: i64, now: i64) -> f64;
}

#[derive(Clone, Debug, Default)]
pub struct Checkpoints {
    entries: Vec<Checkpoint>,
    data: Option<CheckpointData>,
}

impl Checkpoints {
    pub fn new(mut entries: Vec<Checkpoint>, data: Option<CheckpointData>) -> Self {
        entries.sort_by_key(|entry| entry.height);
        Self { entries, data }
    }

    pub fn from_params(params: &ConsensusParams) -> Self {
        Self::new(params.checkpoints.clone(), Some(params.checkpoint_data))
    }

    /// No checkpoints at all; every block is verified in full.
    pub fn disabled() -> Self {
        Self::default()
    }
}

impl CheckpointPolicy for Checkpoints {
    fn check(&self, height: i32, hash: &Hash256) -> bool {
        match self.entries.iter().find(|entry| entry.height == height) {
            Some(entry) => &entry.hash == hash,
            None => true,
        }
    }

    fn total_blocks_estimate(&self) -> i32 {
        self.entries.last().map(|entry| entry.height).unwrap_or(0)
    }

    fn last_checkpoint(&self) -> Option<Checkpoint> {
        self.entries.last().copied()
    }

    fn verification_progress(&self, chain_tx: u64, tip_time: i64, now: i64) -> f64 {
        let Some(data) = self.data else {
            return 1.0;
        };
        // One unit of work per transaction before the last checkpoint, more after it.
        let per_day = data.transactions_per_day / 86_400.0;
        let chain_tx = chain_tx as f64;
        let checkpoint_tx = data.transactions_last_checkpoint as f64;
        let (before, after) = if chain_tx <= checkpoint_tx {
            let expensive_after = (now - data.time_last_checkpoint) as f64 * per_day;
            (
                chain_tx,
                (checkpoint_tx - chain_tx) + expensive_after * SIGCHECK_VERIFICATION_FACTOR,
            )
        } else {
            let expensive_before = chain_tx - checkpoint_tx;
            let expensive_after = (now - tip_time) as f64 * per_day;
            (
                checkpoint_tx + expensive_before * SIGCHECK_VERIFICATION_FACTOR,
                expensive_after * SIGCHECK_VERIFICATION_FACTOR,
            )
        };
        if before + after <= 0.0 {
            return 1.0;
        }
        before / (before + after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Checkpoints {
        Checkpoints::new(
            vec![
                Checkpoint {
                    height: 20,
                    hash: [2u8; 32],
                },
                Checkpoint {
                    height: 10,
                    hash: [1u8; 32],
                },
            ],
            Some(CheckpointData {
                time_last_checkpoint: 1_000,
                transactions_last_checkpoint: 100,
                transactions_per_day: 86_400.0,
            }),
        )
    }

    #[test]
    fn check_vetoes_conflicting_hash() {
        let checkpoints = sample();
        assert!(checkpoints.check(10, &[1u8; 32]));
        assert!(!checkpoints.check(10, &[9u8; 32]));
        assert!(checkpoints.check(11, &[9u8; 32]));
    }

    #[test]
    fn estimate_uses_highest_checkpoint() {
        let checkpoints = sample();
        assert_eq!(checkpoints.total_blocks_estimate(), 20);
        assert_eq!(checkpoints.last_checkpoint().map(|cp| cp.height), Some(20));
        assert_eq!(Checkpoints::disabled().total_blocks_estimate(), 0);
    }

    #[test]
    fn progress_counts_pending_transactions() {
        let checkpoints = sample();
        let progress = checkpoints.verification_progress(50, 500, 1_000);
        assert!((progress - 0.5).abs() < 1e-9);
        let caught_up = checkpoints.verification_progress(200, 1_000, 1_000);
        assert!((caught_up - 1.0).abs() < 1e-9);
    }
}
