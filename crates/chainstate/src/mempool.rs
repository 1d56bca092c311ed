//! Unconfirmed transaction pool.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use vcoin_consensus::money::Amount;
use vcoin_consensus::{hash256_to_hex, Hash256};
use vcoin_log::{log_category, Category};
use vcoin_primitives::{OutPoint, Transaction};
use vcoin_script::{SCRIPT_VERIFY_P2SH, SCRIPT_VERIFY_STRICTENC};

use crate::coins::{CoinView, CoinViewError, MempoolCoinView};
use crate::inputs::{check_inputs, fetch_inputs, value_in, InputLookup};
use crate::policy::{are_inputs_standard, is_standard_tx, FeeMode, FreeRelayLimiter, RelayPolicy};
use crate::validation::{check_transaction, ValidationError};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MempoolErrorKind {
    Malformed,
    Coinbase,
    LockTime,
    NonStandard,
    AlreadyKnown,
    Conflict,
    MissingInputs,
    InputsSpent,
    NonStandardInputs,
    InsufficientFee,
    RateLimited,
    Invalid,
    Internal,
}

#[derive(Clone, Debug)]
pub struct MempoolError {
    pub kind: MempoolErrorKind,
    pub message: String,
    pub dos: u8,
    pub missing_inputs: Vec<OutPoint>,
}

impl MempoolError {
    pub fn new(kind: MempoolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            dos: 0,
            missing_inputs: Vec::new(),
        }
    }

    pub fn with_dos(mut self, dos: u8) -> Self {
        self.dos = dos;
        self
    }

    pub fn missing_inputs(missing_inputs: Vec<OutPoint>) -> Self {
        Self {
            kind: MempoolErrorKind::MissingInputs,
            message: "missing inputs".to_string(),
            dos: 0,
            missing_inputs,
        }
    }

    fn validation(err: ValidationError) -> Self {
        let kind = if err.is_malformed() {
            MempoolErrorKind::Malformed
        } else {
            MempoolErrorKind::Invalid
        };
        Self::new(kind, err.reason()).with_dos(err.dos_score())
    }

    fn coin_view(err: CoinViewError) -> Self {
        Self::new(MempoolErrorKind::Internal, err.to_string())
    }
}

impl std::fmt::Display for MempoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for MempoolError {}

#[derive(Clone, Debug)]
pub struct MempoolEntry {
    pub txid: Hash256,
    pub tx: Arc<Transaction>,
    pub fee: Amount,
    pub size: usize,
    pub time: i64,
    pub height: i32,
}

/// The pool transaction spending an outpoint, and through which input.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct InPoint {
    pub txid: Hash256,
    pub input: u32,
}

/// Chain context an admission decision is made in.
#[derive(Clone, Copy, Debug)]
pub struct AcceptContext<'a> {
    pub best_height: i32,
    pub adjusted_time: i64,
    pub now: i64,
    pub require_standard: bool,
    pub coinbase_maturity: i32,
    /// Enforce the fee schedule and the free relay budget.
    pub limit_free: bool,
    pub policy: &'a RelayPolicy,
}

#[derive(Debug, Default)]
pub struct Mempool {
    entries: HashMap<Hash256, MempoolEntry>,
    next_tx: BTreeMap<OutPoint, InPoint>,
    generation: u64,
    limiter: FreeRelayLimiter,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bumped whenever a transaction enters or leaves the pool.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.entries.contains_key(txid)
    }

    pub fn get(&self, txid: &Hash256) -> Option<&MempoolEntry> {
        self.entries.get(txid)
    }

    pub fn entries(&self) -> impl Iterator<Item = &MempoolEntry> {
        self.entries.values()
    }

    pub fn txids(&self) -> Vec<Hash256> {
        self.entries.keys().copied().collect()
    }

    pub fn spender(&self, outpoint: &OutPoint) -> Option<InPoint> {
        self.next_tx.get(outpoint).copied()
    }

    pub fn accept<V: CoinView>(
        &mut self,
        tip: &V,
        tx: Arc<Transaction>,
        ctx: &AcceptContext<'_>,
    ) -> Result<Hash256, MempoolError> {
        check_transaction(&tx).map_err(MempoolError::validation)?;

        if tx.is_coinbase() {
            return Err(
                MempoolError::new(MempoolErrorKind::Coinbase, "coinbase as individual tx")
                    .with_dos(100),
            );
        }
        if tx.lock_time > i32::MAX as u32 {
            return Err(MempoolError::new(
                MempoolErrorKind::LockTime,
                "lock time too far in the future",
            ));
        }

        let enforce_standard = ctx.require_standard && !ctx.policy.accept_non_standard;
        if enforce_standard {
            is_standard_tx(&tx, ctx.best_height, ctx.adjusted_time).map_err(|reason| {
                MempoolError::new(
                    MempoolErrorKind::NonStandard,
                    format!("nonstandard transaction: {reason}"),
                )
            })?;
        }

        let txid = tx.txid();
        if self.entries.contains_key(&txid) {
            return Err(MempoolError::new(
                MempoolErrorKind::AlreadyKnown,
                "already in pool",
            ));
        }

        // Replacement is disabled: the first spender of an outpoint wins.
        for input in &tx.vin {
            if let Some(spender) = self.next_tx.get(&input.prevout) {
                return Err(MempoolError::new(
                    MempoolErrorKind::Conflict,
                    format!(
                        "{} conflicts with pool tx {}",
                        input.prevout,
                        hash256_to_hex(&spender.txid)
                    ),
                ));
            }
        }

        let spent = {
            let view = MempoolCoinView::new(tip, self);
            if view.have_coins(&txid).map_err(MempoolError::coin_view)? {
                return Err(MempoolError::new(
                    MempoolErrorKind::AlreadyKnown,
                    "already have unspent outputs",
                ));
            }
            match fetch_inputs(&tx, &view).map_err(MempoolError::coin_view)? {
                InputLookup::Found(spent) => spent,
                InputLookup::Missing(missing) => return Err(MempoolError::missing_inputs(missing)),
                InputLookup::Spent(outpoint) => {
                    return Err(MempoolError::new(
                        MempoolErrorKind::InputsSpent,
                        format!("input {outpoint} already spent"),
                    ))
                }
            }
        };

        if enforce_standard && !are_inputs_standard(&tx, &spent) {
            return Err(MempoolError::new(
                MempoolErrorKind::NonStandardInputs,
                "nonstandard transaction input",
            ));
        }

        let size = tx.serialized_size();
        let fee = value_in(&spent).saturating_sub(tx.value_out());
        if ctx.limit_free {
            let min_fee = ctx.policy.min_fee(&tx, size, 1_000, true, FeeMode::Relay);
            if fee < min_fee {
                return Err(MempoolError::new(
                    MempoolErrorKind::InsufficientFee,
                    format!("not enough fees: {fee} < {min_fee}"),
                ));
            }
            if fee < ctx.policy.relay_fee_for_size(size) {
                let before = self.limiter.count();
                if !self
                    .limiter
                    .try_admit(ctx.policy.limit_free_relay, size, ctx.now)
                {
                    return Err(MempoolError::new(
                        MempoolErrorKind::RateLimited,
                        "free transaction rejected by rate limiter",
                    ));
                }
                log_category!(
                    Category::Mempool,
                    "rate limit free count: {:.0} => {:.0}",
                    before,
                    self.limiter.count()
                );
            }
        }

        check_inputs(
            &tx,
            &spent,
            ctx.best_height.saturating_add(1),
            ctx.coinbase_maturity,
            Some(SCRIPT_VERIFY_P2SH | SCRIPT_VERIFY_STRICTENC),
            None,
        )
        .map_err(MempoolError::validation)?;

        self.insert_unchecked(MempoolEntry {
            txid,
            tx,
            fee,
            size,
            time: ctx.now,
            height: ctx.best_height,
        });
        log_category!(
            Category::Mempool,
            "accepted {} (pool size {})",
            hash256_to_hex(&txid),
            self.entries.len()
        );
        Ok(txid)
    }

    fn insert_unchecked(&mut self, entry: MempoolEntry) {
        for (index, input) in entry.tx.vin.iter().enumerate() {
            self.next_tx.insert(
                input.prevout,
                InPoint {
                    txid: entry.txid,
                    input: index as u32,
                },
            );
        }
        self.entries.insert(entry.txid, entry);
        self.generation += 1;
    }

    /// Removes `tx` if present. With `recursive`, pool transactions spending its
    /// outputs go first, even when `tx` itself is not in the pool.
    pub fn remove(&mut self, tx: &Transaction, recursive: bool) -> Vec<Arc<Transaction>> {
        let mut removed = Vec::new();
        self.remove_txid(tx.txid(), tx.vout.len(), recursive, &mut removed);
        removed
    }

    fn remove_txid(
        &mut self,
        txid: Hash256,
        outputs: usize,
        recursive: bool,
        removed: &mut Vec<Arc<Transaction>>,
    ) {
        if recursive {
            for index in 0..outputs as u32 {
                let Some(spender) = self.next_tx.get(&OutPoint::new(txid, index)).copied() else {
                    continue;
                };
                let child_outputs = self
                    .entries
                    .get(&spender.txid)
                    .map_or(0, |entry| entry.tx.vout.len());
                self.remove_txid(spender.txid, child_outputs, true, removed);
            }
        }
        if let Some(entry) = self.entries.remove(&txid) {
            for input in &entry.tx.vin {
                self.next_tx.remove(&input.prevout);
            }
            self.generation += 1;
            removed.push(entry.tx);
        }
    }

    /// Evicts every other pool transaction spending an input of `tx`, with descendants.
    pub fn remove_conflicts(&mut self, tx: &Transaction) -> Vec<Arc<Transaction>> {
        let txid = tx.txid();
        let mut removed = Vec::new();
        for input in &tx.vin {
            let Some(spender) = self.next_tx.get(&input.prevout).copied() else {
                continue;
            };
            if spender.txid == txid {
                continue;
            }
            let outputs = self
                .entries
                .get(&spender.txid)
                .map_or(0, |entry| entry.tx.vout.len());
            self.remove_txid(spender.txid, outputs, true, &mut removed);
        }
        removed
    }

    /// Drops pool transactions, with their descendants, that spend coins missing from
    /// `tip` or coinbase outputs not yet mature at `spend_height`. Run after the tip moves.
    pub fn remove_unavailable<V: CoinView>(
        &mut self,
        tip: &V,
        spend_height: i32,
        coinbase_maturity: i32,
    ) -> Result<Vec<Arc<Transaction>>, CoinViewError> {
        let mut stale = Vec::new();
        for entry in self.entries.values() {
            for input in &entry.tx.vin {
                let prevout = input.prevout;
                if self.entries.contains_key(&prevout.hash) {
                    continue;
                }
                let usable = match tip.coins(&prevout.hash)? {
                    Some(record) => {
                        record.is_available(prevout.index)
                            && (!record.coinbase
                                || i64::from(spend_height) - i64::from(record.height)
                                    >= i64::from(coinbase_maturity))
                    }
                    None => false,
                };
                if !usable {
                    stale.push(entry.txid);
                    break;
                }
            }
        }

        let mut removed = Vec::new();
        for txid in stale {
            let Some(outputs) = self.entries.get(&txid).map(|entry| entry.tx.vout.len()) else {
                continue;
            };
            self.remove_txid(txid, outputs, true, &mut removed);
        }
        Ok(removed)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.next_tx.clear();
        self.generation += 1;
    }
}
