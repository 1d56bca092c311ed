//! Blocks and transactions parked until a missing parent arrives.

use std::collections::HashMap;
use std::sync::Arc;

use rand::seq::IteratorRandom;
use smallvec::SmallVec;
use vcoin_consensus::constants::{MAX_ORPHAN_TRANSACTIONS, MAX_ORPHAN_TX_SIZE};
use vcoin_consensus::Hash256;
use vcoin_log::{log_category, Category};
use vcoin_primitives::{Block, Transaction};

pub const MAX_ORPHAN_BLOCKS: usize = 750;

type Dependents = SmallVec<[Hash256; 2]>;

fn unlink(by_parent: &mut HashMap<Hash256, Dependents>, parent: &Hash256, child: &Hash256) {
    if let Some(children) = by_parent.get_mut(parent) {
        children.retain(|entry| entry != child);
        if children.is_empty() {
            by_parent.remove(parent);
        }
    }
}

#[derive(Debug, Default)]
pub struct OrphanBlocks {
    blocks: HashMap<Hash256, Arc<Block>>,
    by_prev: HashMap<Hash256, Dependents>,
}

impl OrphanBlocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.blocks.contains_key(hash)
    }

    pub fn insert(&mut self, block: Arc<Block>) {
        let hash = block.hash();
        if self.blocks.contains_key(&hash) {
            return;
        }
        while self.blocks.len() >= MAX_ORPHAN_BLOCKS {
            let Some(victim) = self.blocks.keys().choose(&mut rand::thread_rng()).copied() else {
                break;
            };
            self.remove(&victim);
        }
        self.by_prev
            .entry(block.header.prev_block)
            .or_default()
            .push(hash);
        self.blocks.insert(hash, block);
    }

    pub fn remove(&mut self, hash: &Hash256) -> Option<Arc<Block>> {
        let block = self.blocks.remove(hash)?;
        unlink(&mut self.by_prev, &block.header.prev_block, hash);
        Some(block)
    }

    /// Removes and returns every orphan whose parent is `prev`.
    pub fn take_children(&mut self, prev: &Hash256) -> Vec<Arc<Block>> {
        let Some(children) = self.by_prev.remove(prev) else {
            return Vec::new();
        };
        children
            .iter()
            .filter_map(|hash| self.blocks.remove(hash))
            .collect()
    }

    /// First ancestor of `hash` that is not itself parked; this is the block to ask
    /// peers for.
    pub fn root(&self, hash: &Hash256) -> Hash256 {
        let mut cursor = *hash;
        while let Some(block) = self.blocks.get(&cursor) {
            cursor = block.header.prev_block;
        }
        cursor
    }

    /// The parked block at the bottom of the chain containing `hash`.
    pub fn root_block(&self, hash: &Hash256) -> Option<Hash256> {
        let mut cursor = self.blocks.get(hash)?;
        while let Some(parent) = self.blocks.get(&cursor.header.prev_block) {
            cursor = parent;
        }
        Some(cursor.hash())
    }
}

#[derive(Debug)]
struct OrphanTx {
    tx: Arc<Transaction>,
    parents: Dependents,
}

#[derive(Debug)]
pub struct OrphanTxs {
    txs: HashMap<Hash256, OrphanTx>,
    by_prev: HashMap<Hash256, Dependents>,
    limit: usize,
}

impl Default for OrphanTxs {
    fn default() -> Self {
        Self::new(MAX_ORPHAN_TRANSACTIONS)
    }
}

impl OrphanTxs {
    pub fn new(limit: usize) -> Self {
        Self {
            txs: HashMap::new(),
            by_prev: HashMap::new(),
            limit,
        }
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.txs.contains_key(txid)
    }

    pub fn get(&self, txid: &Hash256) -> Option<&Arc<Transaction>> {
        self.txs.get(txid).map(|orphan| &orphan.tx)
    }

    /// Parks `tx`. Large transactions are refused so a flood of them cannot pin memory.
    /// Returns how many parked transactions were evicted to make room.
    pub fn insert(&mut self, txid: Hash256, tx: Arc<Transaction>, size: usize) -> Option<usize> {
        if self.txs.contains_key(&txid) {
            return Some(0);
        }
        if size > MAX_ORPHAN_TX_SIZE {
            log_category!(
                Category::Orphan,
                "ignoring large orphan tx (size {}, hash {})",
                size,
                vcoin_consensus::hash256_to_hex(&txid)
            );
            return None;
        }
        let mut parents = Dependents::new();
        for input in &tx.vin {
            if !parents.contains(&input.prevout.hash) {
                parents.push(input.prevout.hash);
            }
        }
        for parent in &parents {
            self.by_prev.entry(*parent).or_default().push(txid);
        }
        self.txs.insert(txid, OrphanTx { tx, parents });
        Some(self.limit_size())
    }

    pub fn remove(&mut self, txid: &Hash256) -> Option<Arc<Transaction>> {
        let orphan = self.txs.remove(txid)?;
        for parent in &orphan.parents {
            unlink(&mut self.by_prev, parent, txid);
        }
        Some(orphan.tx)
    }

    /// Txids of parked transactions spending outputs of `parent`.
    pub fn dependents(&self, parent: &Hash256) -> Vec<Hash256> {
        self.by_prev
            .get(parent)
            .map(|children| children.to_vec())
            .unwrap_or_default()
    }

    fn limit_size(&mut self) -> usize {
        let mut evicted = 0usize;
        while self.txs.len() > self.limit {
            let Some(victim) = self.txs.keys().choose(&mut rand::thread_rng()).copied() else {
                break;
            };
            self.remove(&victim);
            evicted += 1;
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vcoin_primitives::{BlockHeader, OutPoint, TxIn, TxOut, SEQUENCE_FINAL};

    fn block(prev: Hash256, nonce: u32) -> Arc<Block> {
        Arc::new(Block {
            header: BlockHeader {
                version: 1,
                prev_block: prev,
                merkle_root: [0u8; 32],
                time: 1,
                bits: 0x207f_ffff,
                nonce,
            },
            transactions: Vec::new(),
            votes: Vec::new(),
        })
    }

    fn spend(parent: Hash256, index: u32) -> Arc<Transaction> {
        Arc::new(Transaction {
            version: 1,
            vin: vec![TxIn {
                prevout: OutPoint::new(parent, index),
                script_sig: Vec::new(),
                sequence: SEQUENCE_FINAL,
            }],
            vout: vec![TxOut::new(1, vec![0x51])],
            lock_time: 0,
        })
    }

    #[test]
    fn block_roots_and_children() {
        let mut orphans = OrphanBlocks::new();
        let a = block([1u8; 32], 0);
        let b = block(a.hash(), 1);
        let c = block(b.hash(), 2);
        orphans.insert(Arc::clone(&c));
        orphans.insert(Arc::clone(&b));
        orphans.insert(Arc::clone(&a));

        assert_eq!(orphans.root(&c.hash()), [1u8; 32]);
        assert_eq!(orphans.root_block(&c.hash()), Some(a.hash()));

        let children = orphans.take_children(&a.hash());
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].hash(), b.hash());
        assert!(!orphans.contains(&b.hash()));
        assert_eq!(orphans.len(), 2);
    }

    #[test]
    fn transactions_are_bounded() {
        let mut orphans = OrphanTxs::new(3);
        for index in 0..5u32 {
            let tx = spend([9u8; 32], index);
            orphans.insert(tx.txid(), tx, 100).expect("small orphan");
        }
        assert_eq!(orphans.len(), 3);
        assert_eq!(orphans.dependents(&[9u8; 32]).len(), 3);

        let large = spend([8u8; 32], 0);
        assert!(orphans.insert(large.txid(), large, MAX_ORPHAN_TX_SIZE + 1).is_none());
    }

    #[test]
    fn removal_unlinks_parents() {
        let mut orphans = OrphanTxs::default();
        let tx = spend([4u8; 32], 0);
        let txid = tx.txid();
        orphans.insert(txid, tx, 60);
        assert_eq!(orphans.dependents(&[4u8; 32]), vec![txid]);
        assert!(orphans.remove(&txid).is_some());
        assert!(orphans.dependents(&[4u8; 32]).is_empty());
        assert!(orphans.get(&txid).is_none());
    }
}
