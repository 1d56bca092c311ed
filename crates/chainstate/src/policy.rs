//! Relay policy: standard transaction shapes, the minimum fee schedule, and the
//! free-transaction rate limiter.

use vcoin_consensus::constants::{
    CURRENT_TX_VERSION, DEFAULT_BLOCK_PRIORITY_SIZE, DEFAULT_LIMIT_FREE_RELAY, DUST_SOFT_LIMIT,
    FREE_SEND_SIZE, MAX_BLOCK_SIZE_GEN, MAX_STANDARD_SCRIPTSIG_SIZE, MAX_STANDARD_TX_SIZE,
    MIN_RELAY_TX_FEE, MIN_TX_FEE,
};
use vcoin_consensus::money::{money_range, Amount, MAX_MONEY};
use vcoin_primitives::Transaction;
use vcoin_script::{is_input_standard, is_push_only, is_standard_script};

use crate::inputs::SpentCoin;

/// Half-life window of the free relay counter, in seconds.
const FREE_RELAY_WINDOW_SECS: f64 = 600.0;

/// Which base fee the schedule starts from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FeeMode {
    /// Assembling a block.
    Block,
    /// Admitting a transaction to the pool.
    Relay,
    /// Creating a transaction locally.
    Send,
}

#[derive(Clone, Debug)]
pub struct RelayPolicy {
    pub min_tx_fee: Amount,
    pub min_relay_tx_fee: Amount,
    /// Thousands of bytes per minute of below-fee transactions.
    pub limit_free_relay: u32,
    /// Accept non-standard transactions even where the network requires standardness.
    pub accept_non_standard: bool,
}

impl Default for RelayPolicy {
    fn default() -> Self {
        Self {
            min_tx_fee: MIN_TX_FEE,
            min_relay_tx_fee: MIN_RELAY_TX_FEE,
            limit_free_relay: DEFAULT_LIMIT_FREE_RELAY,
            accept_non_standard: false,
        }
    }
}

impl RelayPolicy {
    pub fn base_fee(&self, mode: FeeMode) -> Amount {
        match mode {
            FeeMode::Relay => self.min_relay_tx_fee,
            FeeMode::Block | FeeMode::Send => self.min_tx_fee,
        }
    }

    /// `min_relay_tx_fee` per started kilobyte.
    pub fn relay_fee_for_size(&self, size: usize) -> Amount {
        fee_for_size(self.min_relay_tx_fee, size)
    }

    /// Minimum fee for `tx` (serialized as `size` bytes) joining a block that already
    /// holds `block_size` bytes. A `block_size` of 1 means "no block context".
    pub fn min_fee(
        &self,
        tx: &Transaction,
        size: usize,
        block_size: u32,
        allow_free: bool,
        mode: FeeMode,
    ) -> Amount {
        let base = self.base_fee(mode);
        let new_block_size = u64::from(block_size) + size as u64;
        let mut min_fee = fee_for_size(base, size);

        if allow_free {
            let free_area = match mode {
                FeeMode::Send => FREE_SEND_SIZE,
                FeeMode::Block | FeeMode::Relay => DEFAULT_BLOCK_PRIORITY_SIZE - 1_000,
            };
            if (size as u64) < u64::from(free_area) {
                min_fee = 0;
            }
        }

        for output in &tx.vout {
            if output.value < DUST_SOFT_LIMIT {
                min_fee = min_fee.saturating_add(base);
            }
        }

        let gen = u64::from(MAX_BLOCK_SIZE_GEN);
        if block_size != 1 && new_block_size >= gen / 2 {
            if new_block_size >= gen {
                return MAX_MONEY;
            }
            let factor = (gen / (gen - new_block_size)) as i64;
            min_fee = min_fee.saturating_mul(factor);
        }

        if !money_range(min_fee) {
            return MAX_MONEY;
        }
        min_fee
    }
}

fn fee_for_size(base: Amount, size: usize) -> Amount {
    let kilobytes = (size as i64).saturating_add(999) / 1_000;
    base.saturating_mul(kilobytes.max(1))
}

/// Standardness of `tx` on its own. Returns the rejection reason.
pub fn is_standard_tx(
    tx: &Transaction,
    best_height: i32,
    adjusted_time: i64,
) -> Result<(), &'static str> {
    if tx.version > CURRENT_TX_VERSION || tx.version < 1 {
        return Err("version");
    }
    if !tx.is_final(best_height, adjusted_time) {
        return Err("not-final");
    }
    if tx.serialized_size() >= MAX_STANDARD_TX_SIZE as usize {
        return Err("tx-size");
    }
    for input in &tx.vin {
        if input.script_sig.len() > MAX_STANDARD_SCRIPTSIG_SIZE {
            return Err("scriptsig-size");
        }
        if !is_push_only(&input.script_sig) {
            return Err("scriptsig-not-pushonly");
        }
    }
    // Dust outputs are relayed; the per-output fee surcharge prices them instead.
    if tx.vout.iter().any(|output| !is_standard_script(&output.script_pubkey)) {
        return Err("scriptpubkey");
    }
    Ok(())
}

/// Every input spends a standard script with the stack items that script expects,
/// including standard pay-to-script-hash redeem scripts.
pub fn are_inputs_standard(tx: &Transaction, spent: &[SpentCoin]) -> bool {
    if tx.is_coinbase() {
        return true;
    }
    spent
        .iter()
        .enumerate()
        .all(|(index, coin)| is_input_standard(tx, index, &coin.output.script_pubkey))
}

/// Exponentially decaying byte counter for transactions paying less than the relay fee.
#[derive(Debug, Default)]
pub struct FreeRelayLimiter {
    count: f64,
    last_time: i64,
}

impl FreeRelayLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits `size` more bytes at time `now` unless the budget of `limit` thousand bytes
    /// per minute is used up.
    pub fn try_admit(&mut self, limit: u32, size: usize, now: i64) -> bool {
        let elapsed = now.saturating_sub(self.last_time).max(0);
        self.count *= (1.0 - 1.0 / FREE_RELAY_WINDOW_SECS).powf(elapsed as f64);
        self.last_time = now;

        let threshold = f64::from(limit) * 10.0 * 1_000.0;
        if self.count >= threshold {
            return false;
        }
        self.count += size as f64;
        true
    }

    pub fn count(&self) -> f64 {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vcoin_primitives::{OutPoint, TxIn, TxOut, SEQUENCE_FINAL};

    fn p2pkh() -> Vec<u8> {
        let mut script = vec![0x76, 0xa9, 0x14];
        script.extend_from_slice(&[0x11; 20]);
        script.extend_from_slice(&[0x88, 0xac]);
        script
    }

    fn tx(values: &[i64]) -> Transaction {
        Transaction {
            version: 1,
            vin: vec![TxIn {
                prevout: OutPoint::new([1u8; 32], 0),
                script_sig: vec![0x01, 0x02],
                sequence: SEQUENCE_FINAL,
            }],
            vout: values.iter().map(|value| TxOut::new(*value, p2pkh())).collect(),
            lock_time: 0,
        }
    }

    #[test]
    fn fee_rounds_up_to_started_kilobytes() {
        let policy = RelayPolicy::default();
        let big = tx(&[DUST_SOFT_LIMIT]);
        assert_eq!(policy.relay_fee_for_size(1), MIN_RELAY_TX_FEE);
        assert_eq!(policy.relay_fee_for_size(1_000), MIN_RELAY_TX_FEE);
        assert_eq!(policy.relay_fee_for_size(1_001), 2 * MIN_RELAY_TX_FEE);
        assert_eq!(
            policy.min_fee(&big, 2_500, 1, false, FeeMode::Relay),
            3 * MIN_RELAY_TX_FEE
        );
    }

    #[test]
    fn small_transactions_are_free_unless_dusty() {
        let policy = RelayPolicy::default();
        let clean = tx(&[DUST_SOFT_LIMIT, 5 * DUST_SOFT_LIMIT]);
        assert_eq!(policy.min_fee(&clean, 400, 1_000, true, FeeMode::Relay), 0);

        let dusty = tx(&[DUST_SOFT_LIMIT - 1, 1]);
        assert_eq!(
            policy.min_fee(&dusty, 400, 1_000, true, FeeMode::Relay),
            2 * MIN_RELAY_TX_FEE
        );
        // Sending only waives fees below 5000 bytes.
        assert_eq!(
            policy.min_fee(&clean, 6_000, 1, true, FeeMode::Send),
            6 * MIN_TX_FEE
        );
    }

    #[test]
    fn nearly_full_blocks_price_out_transactions() {
        let policy = RelayPolicy::default();
        let clean = tx(&[DUST_SOFT_LIMIT]);
        assert_eq!(
            policy.min_fee(&clean, 1_000, MAX_BLOCK_SIZE_GEN - 500, false, FeeMode::Block),
            MAX_MONEY
        );
        let half = MAX_BLOCK_SIZE_GEN / 2;
        let fee = policy.min_fee(&clean, 1_000, half, false, FeeMode::Block);
        assert!(fee > MIN_TX_FEE);
    }

    #[test]
    fn standardness_reasons() {
        assert_eq!(is_standard_tx(&tx(&[1]), 10, 0), Ok(()));

        let mut bad_version = tx(&[1]);
        bad_version.version = 2;
        assert_eq!(is_standard_tx(&bad_version, 10, 0), Err("version"));

        let mut locked = tx(&[1]);
        locked.lock_time = 50;
        locked.vin[0].sequence = 0;
        assert_eq!(is_standard_tx(&locked, 10, 0), Err("not-final"));

        let mut not_push = tx(&[1]);
        not_push.vin[0].script_sig = vec![0x76];
        assert_eq!(is_standard_tx(&not_push, 10, 0), Err("scriptsig-not-pushonly"));

        let mut odd_output = tx(&[1]);
        odd_output.vout[0].script_pubkey = vec![0x51];
        assert_eq!(is_standard_tx(&odd_output, 10, 0), Err("scriptpubkey"));
    }

    #[test]
    fn limiter_decays_and_blocks() {
        let mut limiter = FreeRelayLimiter::new();
        assert!(limiter.try_admit(1, 9_000, 100));
        assert!(limiter.try_admit(1, 2_000, 100));
        assert!(!limiter.try_admit(1, 1, 100));
        // Ten minutes later the counter has decayed by about 1/e.
        assert!(limiter.try_admit(1, 1, 700));
        assert!(limiter.count() < 11_000.0);

        let mut closed = FreeRelayLimiter::new();
        assert!(!closed.try_admit(0, 1, 5));
    }
}
