//! Applying and unwinding one block against a coin view.
//!
//! Both directions work on whatever view they are handed; the coordinator passes a
//! throwaway overlay so nothing reaches the store until a whole reorganization succeeds.

use std::sync::Arc;
use std::time::Instant;

use vcoin_consensus::constants::MAX_BLOCK_SIGOPS;
use vcoin_consensus::money::Amount;
use vcoin_consensus::params::ConsensusParams;
use vcoin_consensus::{hash256_to_hex, CheckpointPolicy, Hash256};
use vcoin_log::{log_category, log_debug, log_warn, Category};
use vcoin_primitives::Block;
use vcoin_script::{legacy_sigop_count, SCRIPT_VERIFY_NONE, SCRIPT_VERIFY_P2SH};

use crate::checkqueue::CheckQueue;
use crate::coins::{CoinRecord, CoinView};
use crate::inputs::{check_inputs, fetch_inputs, p2sh_sigops, update_coins, InputLookup};
use crate::rewards::{ParentBlock, RewardPolicy};
use crate::state::ChainStateError;
use crate::undo::{BlockUndo, SpentRecordMeta};
use crate::validation::{check_block, BlockCheck, ValidationError};

/// Everything connecting a block consults besides the view itself.
#[derive(Clone, Copy)]
pub struct ConnectContext<'a> {
    pub params: &'a ConsensusParams,
    pub rewards: &'a dyn RewardPolicy,
    pub checkpoints: &'a dyn CheckpointPolicy,
    pub queue: Option<&'a CheckQueue>,
    pub adjusted_time: i64,
    pub genesis_hash: Hash256,
}

#[derive(Debug, Default)]
pub struct ConnectedBlock {
    pub undo: BlockUndo,
    pub fees: Amount,
    pub txids: Vec<Hash256>,
}

/// Applies `block` at `height` on top of `parent` (absent only for genesis).
///
/// With `just_check` the block's commitments are not re-hashed and the view's best
/// block is left alone; the coin changes are still made, so callers pass a scratch view.
pub fn connect_block<V: CoinView>(
    view: &mut V,
    block: &Block,
    height: i32,
    parent: Option<&ParentBlock<'_>>,
    ctx: &ConnectContext<'_>,
    just_check: bool,
) -> Result<ConnectedBlock, ChainStateError> {
    let started = Instant::now();
    let hash = block.hash();
    let check = if just_check {
        BlockCheck::STRUCTURE_ONLY
    } else if hash == ctx.genesis_hash {
        // Genesis is accepted by identity, not by work.
        BlockCheck {
            check_pow: false,
            check_merkle: true,
        }
    } else {
        BlockCheck::FULL
    };
    let txids = check_block(block, ctx.adjusted_time, ctx.params, check)?;

    let expected_prev = view.best_block()?;
    if parent.is_some() && expected_prev != Some(block.header.prev_block) {
        return Err(ChainStateError::CorruptIndex(
            "coin view is not at the parent of the connecting block",
        ));
    }

    // The genesis coinbase is not spendable and never enters the coin set.
    if hash == ctx.genesis_hash {
        if !just_check {
            view.set_best_block(hash)?;
        }
        return Ok(ConnectedBlock {
            txids,
            ..ConnectedBlock::default()
        });
    }
    let Some(parent) = parent else {
        return Err(ChainStateError::CorruptIndex("non-genesis block without a parent"));
    };

    // Never let a transaction overwrite an unspent record with the same id.
    for txid in &txids {
        if view.have_coins(txid)? {
            return Err(ValidationError::invalid("bad-txns-BIP30", 100).into());
        }
    }

    let strict_p2sh = block.header.time >= ctx.params.p2sh_switch_time;
    let flags = if strict_p2sh {
        SCRIPT_VERIFY_P2SH
    } else {
        SCRIPT_VERIFY_NONE
    };
    let script_checks = height >= ctx.checkpoints.total_blocks_estimate();
    let spend_height = u32::try_from(height)
        .map_err(|_| ChainStateError::CorruptIndex("negative block height"))?;

    let mut control = if script_checks {
        ctx.queue.map(CheckQueue::control)
    } else {
        None
    };
    let mut undo = BlockUndo::default();
    undo.txs.reserve(block.transactions.len().saturating_sub(1));
    let mut fees: Amount = 0;
    let mut sigops = 0u32;

    for (tx, txid) in block.transactions.iter().zip(&txids) {
        sigops = sigops.saturating_add(legacy_sigop_count(tx));
        if sigops > MAX_BLOCK_SIGOPS {
            return Err(ValidationError::invalid("bad-blk-sigops", 100).into());
        }

        if !tx.is_coinbase() {
            let spent = match fetch_inputs(tx, &*view)? {
                InputLookup::Found(spent) => spent,
                InputLookup::Missing(_) | InputLookup::Spent(_) => {
                    return Err(
                        ValidationError::invalid("bad-txns-inputs-missingorspent", 100).into(),
                    )
                }
            };
            if strict_p2sh {
                sigops = sigops.saturating_add(p2sh_sigops(tx, &spent));
                if sigops > MAX_BLOCK_SIGOPS {
                    return Err(ValidationError::invalid("bad-blk-sigops", 100).into());
                }
            }
            let shared = Arc::new(tx.clone());
            fees += check_inputs(
                &shared,
                &spent,
                height,
                ctx.params.coinbase_maturity,
                script_checks.then_some(flags),
                control.as_mut(),
            )?;
        }

        let Some(tx_undo) = update_coins(tx, txid, view, spend_height)? else {
            return Err(ValidationError::invalid("bad-txns-inputs-missingorspent", 100).into());
        };
        if !tx.is_coinbase() {
            undo.txs.push(tx_undo);
        }
    }

    let ceiling = ctx.rewards.coinbase_value_ceiling(parent, fees);
    let coinbase_value = block.transactions[0].value_out();
    if coinbase_value > ceiling {
        log_debug!(
            "coinbase pays too much (actual={} vs limit={})",
            coinbase_value,
            ceiling
        );
        return Err(ValidationError::invalid("bad-cb-amount", 100).into());
    }

    if let Some(control) = control {
        if let Err(failure) = control.wait() {
            log_debug!(
                "script check failed in block {} input {}: {}",
                hash256_to_hex(&hash),
                failure.input_index,
                failure.error
            );
            return Err(ValidationError::invalid("mandatory-script-verify-flag-failed", 100).into());
        }
    }

    if !just_check {
        view.set_best_block(hash)?;
    }
    log_category!(
        Category::Bench,
        "connect block {} ({} txs, {} sigops): {:.2}ms",
        height,
        txids.len(),
        sigops,
        started.elapsed().as_secs_f64() * 1000.0
    );
    Ok(ConnectedBlock { undo, fees, txids })
}

/// Reverses `block` at `height` using its undo record and points the view at the parent.
///
/// Returns `false` when the view did not hold exactly what connecting the block would
/// have produced; the view is repaired as far as the undo data allows either way.
pub fn disconnect_block<V: CoinView>(
    view: &mut V,
    block: &Block,
    height: i32,
    undo: &BlockUndo,
) -> Result<bool, ChainStateError> {
    if undo.txs.len() + 1 != block.transactions.len() {
        return Err(ChainStateError::CorruptIndex(
            "block and undo data inconsistent",
        ));
    }
    let record_height = u32::try_from(height)
        .map_err(|_| ChainStateError::CorruptIndex("negative block height"))?;
    let mut clean = true;

    for (index, tx) in block.transactions.iter().enumerate().rev() {
        let txid = tx.txid();
        let expected = CoinRecord::from_transaction(tx, record_height);
        let current = view.coins(&txid)?.unwrap_or_default();
        if !current.same_outputs(&expected) {
            log_warn!(
                "disconnect: added transaction {} mismatch",
                hash256_to_hex(&txid)
            );
            clean = false;
        }
        view.set_coins(&txid, CoinRecord::default())?;

        if index == 0 {
            continue;
        }
        let tx_undo = &undo.txs[index - 1];
        if tx_undo.inputs.len() != tx.vin.len() {
            return Err(ChainStateError::CorruptIndex(
                "transaction and undo data inconsistent",
            ));
        }
        for (input, restored) in tx.vin.iter().zip(&tx_undo.inputs).rev() {
            let prevout = input.prevout;
            let mut record = view.coins(&prevout.hash)?.unwrap_or_default();
            match restored.meta {
                Some(SpentRecordMeta {
                    height,
                    coinbase,
                    version,
                }) => {
                    if !record.is_pruned() {
                        log_warn!("disconnect: undo data overwriting existing transaction");
                        clean = false;
                    }
                    record = CoinRecord {
                        version,
                        coinbase,
                        height,
                        outputs: Vec::new(),
                    };
                }
                None => {
                    if record.is_pruned() {
                        log_warn!("disconnect: undo data adding output to missing transaction");
                        clean = false;
                    }
                }
            }
            if record.is_available(prevout.index) {
                log_warn!("disconnect: undo data overwriting existing output");
                clean = false;
            }
            let slot = prevout.index as usize;
            if record.outputs.len() <= slot {
                record.outputs.resize(slot + 1, None);
            }
            record.outputs[slot] = Some(restored.output.clone());
            view.set_coins(&prevout.hash, record)?;
        }
    }

    view.set_best_block(block.header.prev_block)?;
    if !clean {
        log_category!(
            Category::Reorg,
            "block {} disconnected with inconsistencies",
            hash256_to_hex(&block.hash())
        );
    }
    Ok(clean)
}
