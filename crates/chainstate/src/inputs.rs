//! Input resolution, input-value and script checks, and coin updates for one transaction.

use std::collections::HashMap;
use std::sync::Arc;

use vcoin_consensus::money::{money_range, Amount};
use vcoin_consensus::Hash256;
use vcoin_primitives::{OutPoint, Transaction, TxOut};
use vcoin_script::{p2sh_sigop_count, ScriptFlags, SCRIPT_VERIFY_STRICTENC};

use crate::checkqueue::{CheckControl, ScriptCheck};
use crate::coins::{CoinRecord, CoinView, CoinViewError};
use crate::undo::TxUndo;
use crate::validation::ValidationError;

/// The output an input spends, with the metadata of the record it came from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SpentCoin {
    pub output: TxOut,
    pub height: u32,
    pub coinbase: bool,
}

#[derive(Debug)]
pub enum InputLookup {
    Found(Vec<SpentCoin>),
    /// No record exists for these prevouts' transactions.
    Missing(Vec<OutPoint>),
    /// The record exists but this output is already spent.
    Spent(OutPoint),
}

/// Resolves every input of a non-coinbase transaction against `view`.
pub fn fetch_inputs<V: CoinView>(tx: &Transaction, view: &V) -> Result<InputLookup, CoinViewError> {
    let mut records: HashMap<Hash256, CoinRecord> = HashMap::new();
    let mut missing = Vec::new();
    for input in &tx.vin {
        let hash = input.prevout.hash;
        if records.contains_key(&hash) {
            continue;
        }
        match view.coins(&hash)? {
            Some(record) => {
                records.insert(hash, record);
            }
            None => missing.push(input.prevout),
        }
    }
    if !missing.is_empty() {
        return Ok(InputLookup::Missing(missing));
    }

    let mut spent = Vec::with_capacity(tx.vin.len());
    for input in &tx.vin {
        let record = &records[&input.prevout.hash];
        match record.output(input.prevout.index) {
            Some(output) => spent.push(SpentCoin {
                output: output.clone(),
                height: record.height,
                coinbase: record.coinbase,
            }),
            None => return Ok(InputLookup::Spent(input.prevout)),
        }
    }
    Ok(InputLookup::Found(spent))
}

/// True when every input refers to an unspent output visible through `view`.
pub fn have_inputs<V: CoinView>(tx: &Transaction, view: &V) -> Result<bool, CoinViewError> {
    if tx.is_coinbase() {
        return Ok(true);
    }
    Ok(matches!(fetch_inputs(tx, view)?, InputLookup::Found(_)))
}

pub fn value_in(spent: &[SpentCoin]) -> Amount {
    spent
        .iter()
        .fold(0i64, |total, coin| total.saturating_add(coin.output.value))
}

/// Signature operations hidden in pay-to-script-hash redeem scripts.
pub fn p2sh_sigops(tx: &Transaction, spent: &[SpentCoin]) -> u32 {
    if tx.is_coinbase() {
        return 0;
    }
    tx.vin
        .iter()
        .zip(spent)
        .map(|(input, coin)| p2sh_sigop_count(&input.script_sig, &coin.output.script_pubkey))
        .sum()
}

/// Value, maturity, and (when `script_flags` is set) script checks for a non-coinbase
/// transaction whose inputs resolved to `spent`. Returns the fee.
///
/// With a `control`, script checks are queued instead of run; the caller collects their
/// outcome through [`CheckControl::wait`].
pub fn check_inputs(
    tx: &Arc<Transaction>,
    spent: &[SpentCoin],
    spend_height: i32,
    coinbase_maturity: i32,
    script_flags: Option<ScriptFlags>,
    control: Option<&mut CheckControl<'_>>,
) -> Result<Amount, ValidationError> {
    if tx.is_coinbase() {
        return Ok(0);
    }

    let mut total_in = 0i64;
    for coin in spent {
        if coin.coinbase && i64::from(spend_height) - i64::from(coin.height) < i64::from(coinbase_maturity)
        {
            return Err(ValidationError::invalid("bad-txns-premature-spend-of-coinbase", 0));
        }
        total_in += coin.output.value;
        if !money_range(coin.output.value) || !money_range(total_in) {
            return Err(ValidationError::invalid("bad-txns-inputvalues-outofrange", 100));
        }
    }

    let value_out = tx.value_out();
    if total_in < value_out {
        return Err(ValidationError::invalid("bad-txns-in-belowout", 100));
    }
    let fee = total_in - value_out;
    if !money_range(fee) {
        return Err(ValidationError::invalid("bad-txns-fee-outofrange", 100));
    }

    let Some(flags) = script_flags else {
        return Ok(fee);
    };
    let checks: Vec<ScriptCheck> = spent
        .iter()
        .enumerate()
        .map(|(input_index, coin)| ScriptCheck {
            tx: Arc::clone(tx),
            input_index,
            script_pubkey: coin.output.script_pubkey.clone(),
            flags,
        })
        .collect();

    match control {
        Some(control) => control.add(checks),
        None => {
            for check in &checks {
                if check.verify().is_err() {
                    if flags & SCRIPT_VERIFY_STRICTENC != 0 {
                        let relaxed = ScriptCheck {
                            flags: flags & !SCRIPT_VERIFY_STRICTENC,
                            ..check.clone()
                        };
                        // Only the encoding rule failed: reject without penalizing.
                        if relaxed.verify().is_ok() {
                            return Err(ValidationError::invalid(
                                "non-canonical-signature-or-pubkey",
                                0,
                            ));
                        }
                    }
                    return Err(ValidationError::invalid("mandatory-script-verify-flag-failed", 100));
                }
            }
        }
    }
    Ok(fee)
}

/// Spends `tx`'s inputs in `view` and adds its outputs at `height`.
///
/// Returns the undo for the spent inputs, or `None` when an input is not available,
/// in which case `view` may have been partly modified.
pub fn update_coins<V: CoinView>(
    tx: &Transaction,
    txid: &Hash256,
    view: &mut V,
    height: u32,
) -> Result<Option<TxUndo>, CoinViewError> {
    let mut undo = TxUndo::default();
    if !tx.is_coinbase() {
        undo.inputs.reserve(tx.vin.len());
        for input in &tx.vin {
            let Some(mut record) = view.coins(&input.prevout.hash)? else {
                return Ok(None);
            };
            let Some(spent) = record.spend(input.prevout.index) else {
                return Ok(None);
            };
            view.set_coins(&input.prevout.hash, record)?;
            undo.inputs.push(spent);
        }
    }
    view.set_coins(txid, CoinRecord::from_transaction(tx, height))?;
    Ok(Some(undo))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coins::{CoinCache, DbCoinView};
    use vcoin_primitives::{TxIn, SEQUENCE_FINAL};
    use vcoin_storage::memory::MemoryStore;

    fn funding_tx(values: &[i64], coinbase: bool) -> Transaction {
        let prevout = if coinbase {
            OutPoint::null()
        } else {
            OutPoint::new([0x42; 32], 0)
        };
        Transaction {
            version: 1,
            vin: vec![TxIn {
                prevout,
                script_sig: vec![0x01, 0x01],
                sequence: SEQUENCE_FINAL,
            }],
            vout: values
                .iter()
                .map(|value| TxOut::new(*value, vec![0x51]))
                .collect(),
            lock_time: 0,
        }
    }

    fn spend(prevouts: &[OutPoint], value: i64) -> Transaction {
        Transaction {
            version: 1,
            vin: prevouts
                .iter()
                .map(|prevout| TxIn {
                    prevout: *prevout,
                    script_sig: Vec::new(),
                    sequence: SEQUENCE_FINAL,
                })
                .collect(),
            vout: vec![TxOut::new(value, vec![0x51])],
            lock_time: 0,
        }
    }

    fn view_with(txs: &[(&Transaction, u32)]) -> CoinCache<DbCoinView<MemoryStore>> {
        let mut view = CoinCache::new(DbCoinView::new(std::sync::Arc::new(MemoryStore::new())));
        for (tx, height) in txs {
            view.set_coins(&tx.txid(), CoinRecord::from_transaction(tx, *height))
                .expect("seed");
        }
        view
    }

    #[test]
    fn lookup_distinguishes_missing_and_spent() {
        let funding = funding_tx(&[1_000, 2_000], false);
        let mut view = view_with(&[(&funding, 5)]);

        let unknown = spend(&[OutPoint::new([9u8; 32], 0)], 10);
        assert!(matches!(
            fetch_inputs(&unknown, &view).expect("lookup"),
            InputLookup::Missing(missing) if missing.len() == 1
        ));

        let first = spend(&[OutPoint::new(funding.txid(), 0)], 900);
        update_coins(&first, &first.txid(), &mut view, 6)
            .expect("update")
            .expect("inputs available");
        assert!(matches!(
            fetch_inputs(&first, &view).expect("lookup"),
            InputLookup::Spent(_)
        ));
        assert!(!have_inputs(&first, &view).expect("have"));
    }

    #[test]
    fn value_and_maturity_rules() {
        let coinbase = funding_tx(&[5_000], true);
        let view = view_with(&[(&coinbase, 10)]);
        let tx = Arc::new(spend(&[OutPoint::new(coinbase.txid(), 0)], 4_000));
        let InputLookup::Found(spent) = fetch_inputs(tx.as_ref(), &view).expect("lookup") else {
            panic!("inputs should resolve");
        };

        let immature = check_inputs(&tx, &spent, 50, 100, None, None).unwrap_err();
        assert_eq!(immature.reason(), "bad-txns-premature-spend-of-coinbase");
        assert_eq!(immature.dos_score(), 0);

        assert_eq!(check_inputs(&tx, &spent, 110, 100, None, None), Ok(1_000));

        let overspend = Arc::new(spend(&[OutPoint::new(coinbase.txid(), 0)], 6_000));
        let err = check_inputs(&overspend, &spent, 110, 100, None, None).unwrap_err();
        assert_eq!(err.dos_score(), 100);
    }

    #[test]
    fn failing_script_is_penalized() {
        let funding = Transaction {
            vout: vec![TxOut::new(1_000, vec![0x00])],
            ..funding_tx(&[1], false)
        };
        let view = view_with(&[(&funding, 1)]);
        let tx = Arc::new(spend(&[OutPoint::new(funding.txid(), 0)], 500));
        let InputLookup::Found(spent) = fetch_inputs(tx.as_ref(), &view).expect("lookup") else {
            panic!("inputs should resolve");
        };
        let err = check_inputs(&tx, &spent, 2, 100, Some(0), None).unwrap_err();
        assert_eq!(err.dos_score(), 100);
        assert!(check_inputs(&tx, &spent, 2, 100, None, None).is_ok());
    }

    #[test]
    fn update_records_metadata_for_fully_spent_parent() {
        let funding = funding_tx(&[1_000], false);
        let mut view = view_with(&[(&funding, 7)]);
        let tx = spend(&[OutPoint::new(funding.txid(), 0)], 900);
        let undo = update_coins(&tx, &tx.txid(), &mut view, 8)
            .expect("update")
            .expect("available");
        assert_eq!(undo.inputs.len(), 1);
        assert_eq!(undo.inputs[0].meta.map(|meta| meta.height), Some(7));
        assert!(!view.have_coins(&funding.txid()).expect("have"));
        assert!(view.have_coins(&tx.txid()).expect("have"));
    }
}
