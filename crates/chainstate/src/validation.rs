//! Context-free transaction and block checks.

use std::collections::HashSet;

use rayon::prelude::*;
use vcoin_consensus::constants::{MAX_BLOCK_SIGOPS, MAX_BLOCK_SIZE, MAX_FUTURE_BLOCK_TIME};
use vcoin_consensus::money::{money_range, MAX_MONEY};
use vcoin_consensus::params::ConsensusParams;
use vcoin_consensus::Hash256;
use vcoin_pow::check_proof_of_work;
use vcoin_primitives::{sha256d, Block, Transaction};
use vcoin_script::legacy_sigop_count;

/// Blocks with at least this many transactions hash their txids on the rayon pool.
const PARALLEL_TXID_THRESHOLD: usize = 64;

/// A rejected transaction or block, with the misbehavior score the sender earns.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ValidationError {
    /// Fails checks that need no chain state; no context can make it valid.
    Malformed { reason: &'static str, dos: u8 },
    /// Inconsistent with the chain or pool it was checked against.
    Invalid { reason: &'static str, dos: u8 },
}

impl ValidationError {
    pub fn malformed(reason: &'static str, dos: u8) -> Self {
        ValidationError::Malformed { reason, dos }
    }

    pub fn invalid(reason: &'static str, dos: u8) -> Self {
        ValidationError::Invalid { reason, dos }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            ValidationError::Malformed { reason, .. } | ValidationError::Invalid { reason, .. } => {
                reason
            }
        }
    }

    pub fn dos_score(&self) -> u8 {
        match self {
            ValidationError::Malformed { dos, .. } | ValidationError::Invalid { dos, .. } => *dos,
        }
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, ValidationError::Malformed { .. })
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Malformed { reason, dos } => {
                write!(f, "malformed: {reason} (dos {dos})")
            }
            ValidationError::Invalid { reason, dos } => write!(f, "invalid: {reason} (dos {dos})"),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Which of the expensive header commitments `check_block` verifies.
#[derive(Clone, Copy, Debug)]
pub struct BlockCheck {
    pub check_pow: bool,
    pub check_merkle: bool,
}

impl BlockCheck {
    pub const FULL: BlockCheck = BlockCheck {
        check_pow: true,
        check_merkle: true,
    };
    pub const STRUCTURE_ONLY: BlockCheck = BlockCheck {
        check_pow: false,
        check_merkle: false,
    };
}

pub fn check_transaction(tx: &Transaction) -> Result<(), ValidationError> {
    if tx.vin.is_empty() {
        return Err(ValidationError::malformed("bad-txns-vin-empty", 10));
    }
    if tx.vout.is_empty() {
        return Err(ValidationError::malformed("bad-txns-vout-empty", 10));
    }
    if tx.serialized_size() > MAX_BLOCK_SIZE as usize {
        return Err(ValidationError::malformed("bad-txns-oversize", 100));
    }

    let mut value_out = 0i64;
    for output in &tx.vout {
        if output.value < 0 {
            return Err(ValidationError::malformed("bad-txns-vout-negative", 100));
        }
        if output.value > MAX_MONEY {
            return Err(ValidationError::malformed("bad-txns-vout-toolarge", 100));
        }
        value_out += output.value;
        if !money_range(value_out) {
            return Err(ValidationError::malformed("bad-txns-txouttotal-toolarge", 100));
        }
    }

    let mut seen = HashSet::with_capacity(tx.vin.len());
    for input in &tx.vin {
        if !seen.insert(input.prevout) {
            return Err(ValidationError::malformed("bad-txns-inputs-duplicate", 100));
        }
    }

    if tx.is_coinbase() {
        let len = tx.vin[0].script_sig.len();
        if !(2..=100).contains(&len) {
            return Err(ValidationError::malformed("bad-cb-length", 100));
        }
    } else if tx.vin.iter().any(|input| input.prevout.is_null()) {
        return Err(ValidationError::malformed("bad-txns-prevout-null", 10));
    }
    Ok(())
}

/// Structural block checks. Returns the txids in block order.
pub fn check_block(
    block: &Block,
    adjusted_time: i64,
    params: &ConsensusParams,
    check: BlockCheck,
) -> Result<Vec<Hash256>, ValidationError> {
    if block.transactions.is_empty()
        || block.transactions.len() > MAX_BLOCK_SIZE as usize
        || block.serialized_size() > MAX_BLOCK_SIZE as usize
    {
        return Err(ValidationError::malformed("bad-blk-length", 100));
    }

    if check.check_pow && check_proof_of_work(&block.hash(), block.header.bits, params).is_err() {
        return Err(ValidationError::malformed("high-hash", 50));
    }

    if i64::from(block.header.time) > adjusted_time + MAX_FUTURE_BLOCK_TIME {
        return Err(ValidationError::malformed("time-too-new", 0));
    }

    if !block.transactions[0].is_coinbase() {
        return Err(ValidationError::malformed("bad-cb-missing", 100));
    }
    if block.transactions[1..].iter().any(Transaction::is_coinbase) {
        return Err(ValidationError::malformed("bad-cb-multiple", 100));
    }

    for tx in &block.transactions {
        check_transaction(tx)?;
    }

    let txids = compute_txids(block);
    let unique: HashSet<&Hash256> = txids.iter().collect();
    if unique.len() != txids.len() {
        return Err(ValidationError::malformed("bad-txns-duplicate", 100));
    }

    let sigops: u32 = block.transactions.iter().map(legacy_sigop_count).sum();
    if sigops > MAX_BLOCK_SIGOPS {
        return Err(ValidationError::malformed("bad-blk-sigops", 100));
    }

    if check.check_merkle && block.header.merkle_root != merkle_root(&txids) {
        return Err(ValidationError::malformed("bad-txnmrklroot", 100));
    }

    Ok(txids)
}

fn compute_txids(block: &Block) -> Vec<Hash256> {
    if block.transactions.len() >= PARALLEL_TXID_THRESHOLD {
        block.transactions.par_iter().map(Transaction::txid).collect()
    } else {
        block.txids()
    }
}

/// Merkle root over `txids`, duplicating the last entry of odd-sized layers.
pub fn merkle_root(txids: &[Hash256]) -> Hash256 {
    if txids.is_empty() {
        return [0u8; 32];
    }
    let mut layer = txids.to_vec();
    while layer.len() > 1 {
        let size = layer.len();
        let mut next = Vec::with_capacity(size.div_ceil(2));
        let mut i = 0usize;
        while i < size {
            let i2 = if i + 1 < size { i + 1 } else { i };
            let mut data = Vec::with_capacity(64);
            data.extend_from_slice(&layer[i]);
            data.extend_from_slice(&layer[i2]);
            next.push(sha256d(&data));
            i += 2;
        }
        layer = next;
    }
    layer[0]
}
