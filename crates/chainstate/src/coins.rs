//! Per-transaction coin records and the layered views that serve them.
//!
//! The stack used by the node is `DbCoinView -> CoinCache` for the chain tip, with short
//! lived `CoinCache` overlays for block connection and a read-only [`MempoolCoinView`]
//! underneath transaction acceptance.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use vcoin_consensus::constants::MEMPOOL_HEIGHT;
use vcoin_consensus::Hash256;
use vcoin_primitives::encoding::{DecodeError, Decoder, Encoder};
use vcoin_primitives::{Decodable, Encodable, Transaction, TxOut};
use vcoin_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::mempool::Mempool;
use crate::undo::{InputUndo, SpentRecordMeta};

const META_BEST_BLOCK_KEY: &[u8] = b"best_block";
const FLAG_COINBASE: u8 = 1 << 0;

#[derive(Debug)]
pub enum CoinViewError {
    Store(StoreError),
    Decode(DecodeError),
    ReadOnly,
}

impl std::fmt::Display for CoinViewError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoinViewError::Store(err) => write!(f, "{err}"),
            CoinViewError::Decode(err) => write!(f, "corrupt coin record: {err}"),
            CoinViewError::ReadOnly => write!(f, "coin view is read-only"),
        }
    }
}

impl std::error::Error for CoinViewError {}

impl From<StoreError> for CoinViewError {
    fn from(err: StoreError) -> Self {
        CoinViewError::Store(err)
    }
}

impl From<DecodeError> for CoinViewError {
    fn from(err: DecodeError) -> Self {
        CoinViewError::Decode(err)
    }
}

/// Unspent outputs of one transaction. Spent slots are `None`; trailing spent slots are
/// trimmed so a fully spent record has no outputs at all.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CoinRecord {
    pub version: i32,
    pub coinbase: bool,
    pub height: u32,
    pub outputs: Vec<Option<TxOut>>,
}

impl CoinRecord {
    pub fn from_transaction(tx: &Transaction, height: u32) -> Self {
        Self {
            version: tx.version,
            coinbase: tx.is_coinbase(),
            height,
            outputs: tx.vout.iter().cloned().map(Some).collect(),
        }
    }

    pub fn is_pruned(&self) -> bool {
        self.outputs.iter().all(Option::is_none)
    }

    pub fn is_available(&self, index: u32) -> bool {
        self.output(index).is_some()
    }

    pub fn output(&self, index: u32) -> Option<&TxOut> {
        self.outputs.get(index as usize).and_then(Option::as_ref)
    }

    /// Marks `index` spent. The returned undo carries the record metadata when this spend
    /// removed the last unspent output.
    pub fn spend(&mut self, index: u32) -> Option<InputUndo> {
        let output = self.outputs.get_mut(index as usize)?.take()?;
        self.cleanup();
        let meta = self.outputs.is_empty().then_some(SpentRecordMeta {
            height: self.height,
            coinbase: self.coinbase,
            version: self.version,
        });
        Some(InputUndo { output, meta })
    }

    /// Same-shaped comparison used when unwinding a block: spent slots are ignored on
    /// both sides so trimmed and untrimmed records compare equal.
    pub fn same_outputs(&self, other: &CoinRecord) -> bool {
        let len = self.outputs.len().max(other.outputs.len());
        (0..len).all(|index| {
            let index = index as u32;
            self.output(index) == other.output(index)
        }) && self.coinbase == other.coinbase
            && self.height == other.height
            && self.version == other.version
    }

    fn cleanup(&mut self) {
        while matches!(self.outputs.last(), Some(None)) {
            self.outputs.pop();
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_varint(u64::from(self.version as u32));
        encoder.write_u8(if self.coinbase { FLAG_COINBASE } else { 0 });
        encoder.write_u32_le(self.height);
        encoder.write_varint(self.outputs.len() as u64);
        for slot in &self.outputs {
            match slot {
                Some(output) => {
                    encoder.write_u8(1);
                    output.consensus_encode(&mut encoder);
                }
                None => encoder.write_u8(0),
            }
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let version = u32::try_from(decoder.read_varint()?)
            .map_err(|_| DecodeError::InvalidData("coin version out of range"))?
            as i32;
        let flags = decoder.read_u8()?;
        let height = decoder.read_u32_le()?;
        let count = decoder.read_len(1)?;
        let mut outputs = Vec::with_capacity(count);
        for _ in 0..count {
            match decoder.read_u8()? {
                0 => outputs.push(None),
                1 => outputs.push(Some(TxOut::consensus_decode(&mut decoder)?)),
                _ => return Err(DecodeError::InvalidData("invalid coin slot marker")),
            }
        }
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            version,
            coinbase: flags & FLAG_COINBASE != 0,
            height,
            outputs,
        })
    }
}

/// Read/write access to coin records plus the hash of the block the records reflect.
///
/// Pruned records are never returned: `coins` yields `None` and `have_coins` false.
pub trait CoinView {
    fn coins(&self, txid: &Hash256) -> Result<Option<CoinRecord>, CoinViewError>;
    fn set_coins(&mut self, txid: &Hash256, coins: CoinRecord) -> Result<(), CoinViewError>;
    fn have_coins(&self, txid: &Hash256) -> Result<bool, CoinViewError> {
        Ok(self.coins(txid)?.is_some())
    }
    fn best_block(&self) -> Result<Option<Hash256>, CoinViewError>;
    fn set_best_block(&mut self, hash: Hash256) -> Result<(), CoinViewError>;
    /// Applies every record (pruned ones as deletions) and the optional best block as one
    /// unit.
    fn batch_write(
        &mut self,
        coins: &HashMap<Hash256, CoinRecord>,
        best_block: Option<Hash256>,
    ) -> Result<(), CoinViewError>;
}

impl<V: CoinView + ?Sized> CoinView for &mut V {
    fn coins(&self, txid: &Hash256) -> Result<Option<CoinRecord>, CoinViewError> {
        (**self).coins(txid)
    }

    fn set_coins(&mut self, txid: &Hash256, coins: CoinRecord) -> Result<(), CoinViewError> {
        (**self).set_coins(txid, coins)
    }

    fn have_coins(&self, txid: &Hash256) -> Result<bool, CoinViewError> {
        (**self).have_coins(txid)
    }

    fn best_block(&self) -> Result<Option<Hash256>, CoinViewError> {
        (**self).best_block()
    }

    fn set_best_block(&mut self, hash: Hash256) -> Result<(), CoinViewError> {
        (**self).set_best_block(hash)
    }

    fn batch_write(
        &mut self,
        coins: &HashMap<Hash256, CoinRecord>,
        best_block: Option<Hash256>,
    ) -> Result<(), CoinViewError> {
        (**self).batch_write(coins, best_block)
    }
}

/// Coin records persisted in [`Column::Coins`].
pub struct DbCoinView<S> {
    store: Arc<S>,
}

impl<S> DbCoinView<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> CoinView for DbCoinView<S> {
    fn coins(&self, txid: &Hash256) -> Result<Option<CoinRecord>, CoinViewError> {
        let Some(bytes) = self.store.get(Column::Coins, txid)? else {
            return Ok(None);
        };
        let record = CoinRecord::decode(&bytes)?;
        Ok((!record.is_pruned()).then_some(record))
    }

    fn set_coins(&mut self, txid: &Hash256, coins: CoinRecord) -> Result<(), CoinViewError> {
        if coins.is_pruned() {
            self.store.delete(Column::Coins, txid)?;
        } else {
            self.store.put(Column::Coins, txid, &coins.encode())?;
        }
        Ok(())
    }

    fn have_coins(&self, txid: &Hash256) -> Result<bool, CoinViewError> {
        Ok(self.store.get(Column::Coins, txid)?.is_some())
    }

    fn best_block(&self) -> Result<Option<Hash256>, CoinViewError> {
        let Some(bytes) = self.store.get(Column::Meta, META_BEST_BLOCK_KEY)? else {
            return Ok(None);
        };
        let hash: Hash256 = bytes
            .as_slice()
            .try_into()
            .map_err(|_| DecodeError::InvalidData("invalid best block hash"))?;
        Ok(Some(hash))
    }

    fn set_best_block(&mut self, hash: Hash256) -> Result<(), CoinViewError> {
        self.store.put(Column::Meta, META_BEST_BLOCK_KEY, &hash)?;
        Ok(())
    }

    fn batch_write(
        &mut self,
        coins: &HashMap<Hash256, CoinRecord>,
        best_block: Option<Hash256>,
    ) -> Result<(), CoinViewError> {
        let mut batch = WriteBatch::new();
        batch.reserve(coins.len() + 1);
        for (txid, record) in coins {
            if record.is_pruned() {
                batch.delete(Column::Coins, txid);
            } else {
                batch.put(Column::Coins, txid, record.encode());
            }
        }
        if let Some(hash) = best_block {
            batch.put(Column::Meta, META_BEST_BLOCK_KEY, hash);
        }
        self.store.write_batch(&batch)?;
        Ok(())
    }
}

#[derive(Clone, Debug)]
struct CacheEntry {
    coins: Option<CoinRecord>,
    dirty: bool,
}

/// Write-back cache over another view. Reads are memoized; writes stay local until
/// [`CoinCache::flush`] pushes every dirty record and the best block down in one batch.
pub struct CoinCache<V> {
    base: V,
    entries: RefCell<HashMap<Hash256, CacheEntry>>,
    best_block: Option<Hash256>,
}

impl<V: CoinView> CoinCache<V> {
    pub fn new(base: V) -> Self {
        Self {
            base,
            entries: RefCell::new(HashMap::new()),
            best_block: None,
        }
    }

    /// Number of records held in memory, dirty or not.
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    pub fn dirty_len(&self) -> usize {
        self.entries
            .borrow()
            .values()
            .filter(|entry| entry.dirty)
            .count()
    }

    pub fn base(&self) -> &V {
        &self.base
    }

    /// Writes every dirty record to the base view. On failure nothing is discarded and
    /// the flush may be retried.
    pub fn flush(&mut self) -> Result<(), CoinViewError> {
        let dirty: HashMap<Hash256, CoinRecord> = self
            .entries
            .get_mut()
            .iter()
            .filter(|(_, entry)| entry.dirty)
            .map(|(txid, entry)| (*txid, entry.coins.clone().unwrap_or_default()))
            .collect();
        self.base.batch_write(&dirty, self.best_block)?;
        self.entries.get_mut().clear();
        self.best_block = None;
        Ok(())
    }

    /// Drops memoized reads and pending writes.
    pub fn discard(&mut self) {
        self.entries.get_mut().clear();
        self.best_block = None;
    }

    pub fn into_base(self) -> V {
        self.base
    }
}

impl<V: CoinView> CoinView for CoinCache<V> {
    fn coins(&self, txid: &Hash256) -> Result<Option<CoinRecord>, CoinViewError> {
        if let Some(entry) = self.entries.borrow().get(txid) {
            return Ok(entry.coins.clone().filter(|coins| !coins.is_pruned()));
        }
        let fetched = self.base.coins(txid)?;
        self.entries.borrow_mut().insert(
            *txid,
            CacheEntry {
                coins: fetched.clone(),
                dirty: false,
            },
        );
        Ok(fetched)
    }

    fn set_coins(&mut self, txid: &Hash256, coins: CoinRecord) -> Result<(), CoinViewError> {
        self.entries.get_mut().insert(
            *txid,
            CacheEntry {
                coins: Some(coins),
                dirty: true,
            },
        );
        Ok(())
    }

    fn best_block(&self) -> Result<Option<Hash256>, CoinViewError> {
        match self.best_block {
            Some(hash) => Ok(Some(hash)),
            None => self.base.best_block(),
        }
    }

    fn set_best_block(&mut self, hash: Hash256) -> Result<(), CoinViewError> {
        self.best_block = Some(hash);
        Ok(())
    }

    fn batch_write(
        &mut self,
        coins: &HashMap<Hash256, CoinRecord>,
        best_block: Option<Hash256>,
    ) -> Result<(), CoinViewError> {
        let entries = self.entries.get_mut();
        for (txid, record) in coins {
            entries.insert(
                *txid,
                CacheEntry {
                    coins: Some(record.clone()),
                    dirty: true,
                },
            );
        }
        if best_block.is_some() {
            self.best_block = best_block;
        }
        Ok(())
    }
}

/// Chain coins plus synthetic records for every pool transaction, at [`MEMPOOL_HEIGHT`].
pub struct MempoolCoinView<'a, V> {
    base: &'a V,
    mempool: &'a Mempool,
}

impl<'a, V: CoinView> MempoolCoinView<'a, V> {
    pub fn new(base: &'a V, mempool: &'a Mempool) -> Self {
        Self { base, mempool }
    }
}

impl<V: CoinView> CoinView for MempoolCoinView<'_, V> {
    fn coins(&self, txid: &Hash256) -> Result<Option<CoinRecord>, CoinViewError> {
        if let Some(coins) = self.base.coins(txid)? {
            return Ok(Some(coins));
        }
        Ok(self
            .mempool
            .get(txid)
            .map(|entry| CoinRecord::from_transaction(&entry.tx, MEMPOOL_HEIGHT)))
    }

    fn set_coins(&mut self, _txid: &Hash256, _coins: CoinRecord) -> Result<(), CoinViewError> {
        Err(CoinViewError::ReadOnly)
    }

    fn have_coins(&self, txid: &Hash256) -> Result<bool, CoinViewError> {
        Ok(self.mempool.contains(txid) || self.base.have_coins(txid)?)
    }

    fn best_block(&self) -> Result<Option<Hash256>, CoinViewError> {
        self.base.best_block()
    }

    fn set_best_block(&mut self, _hash: Hash256) -> Result<(), CoinViewError> {
        Err(CoinViewError::ReadOnly)
    }

    fn batch_write(
        &mut self,
        _coins: &HashMap<Hash256, CoinRecord>,
        _best_block: Option<Hash256>,
    ) -> Result<(), CoinViewError> {
        Err(CoinViewError::ReadOnly)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vcoin_primitives::{OutPoint, TxIn, SEQUENCE_FINAL};
    use vcoin_storage::memory::MemoryStore;

    fn sample_tx(outputs: usize) -> Transaction {
        Transaction {
            version: 1,
            vin: vec![TxIn {
                prevout: OutPoint::new([7u8; 32], 0),
                script_sig: vec![0x51],
                sequence: SEQUENCE_FINAL,
            }],
            vout: (0..outputs)
                .map(|index| TxOut::new(1_000 * (index as i64 + 1), vec![0x51]))
                .collect(),
            lock_time: 0,
        }
    }

    #[test]
    fn spending_last_output_carries_metadata() {
        let tx = sample_tx(2);
        let mut record = CoinRecord::from_transaction(&tx, 12);

        let first = record.spend(0).expect("first spend");
        assert!(first.meta.is_none());
        assert_eq!(record.outputs.len(), 2);

        let second = record.spend(1).expect("second spend");
        let meta = second.meta.expect("metadata on final spend");
        assert_eq!(meta.height, 12);
        assert!(record.outputs.is_empty());
        assert!(record.is_pruned());
        assert!(record.spend(1).is_none());
    }

    #[test]
    fn record_encoding_keeps_spent_slots() {
        let tx = sample_tx(3);
        let mut record = CoinRecord::from_transaction(&tx, 40);
        record.spend(1);
        let decoded = CoinRecord::decode(&record.encode()).expect("decode");
        assert_eq!(decoded, record);
        assert!(!decoded.is_available(1));
        assert!(decoded.is_available(2));
    }

    #[test]
    fn cache_flush_removes_pruned_records() {
        let store = Arc::new(MemoryStore::new());
        let mut db = DbCoinView::new(Arc::clone(&store));
        let tx = sample_tx(1);
        let txid = tx.txid();
        db.set_coins(&txid, CoinRecord::from_transaction(&tx, 1))
            .expect("seed");

        let mut cache = CoinCache::new(&mut db);
        let mut record = cache.coins(&txid).expect("read").expect("present");
        record.spend(0);
        cache.set_coins(&txid, record).expect("set");
        cache.set_best_block([9u8; 32]).expect("best");
        assert!(!cache.have_coins(&txid).expect("have"));
        cache.flush().expect("flush");
        drop(cache);

        assert!(db.coins(&txid).expect("read").is_none());
        assert!(store.get(Column::Coins, &txid).expect("raw").is_none());
        assert_eq!(db.best_block().expect("best"), Some([9u8; 32]));
    }

    #[test]
    fn overlay_changes_stay_local_until_flushed() {
        let store = Arc::new(MemoryStore::new());
        let mut tip = CoinCache::new(DbCoinView::new(store));
        let tx = sample_tx(1);
        let txid = tx.txid();
        {
            let mut overlay = CoinCache::new(&mut tip);
            overlay
                .set_coins(&txid, CoinRecord::from_transaction(&tx, 5))
                .expect("set");
            assert!(overlay.have_coins(&txid).expect("have"));
        }
        assert!(!tip.have_coins(&txid).expect("have"));

        let mut overlay = CoinCache::new(&mut tip);
        overlay
            .set_coins(&txid, CoinRecord::from_transaction(&tx, 5))
            .expect("set");
        overlay.flush().expect("flush");
        drop(overlay);
        assert!(tip.have_coins(&txid).expect("have"));
        assert_eq!(tip.dirty_len(), 1);
    }
}
