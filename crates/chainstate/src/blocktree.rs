//! In-memory block tree.
//!
//! Nodes live in an arena and refer to each other through [`BlockHandle`]s. Parent links
//! are fixed at insertion; the forward links of the active chain are kept in a side map
//! that the chain coordinator rewrites on reorganization.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};

use primitive_types::U256;
use vcoin_consensus::constants::MEDIAN_TIME_SPAN;
use vcoin_consensus::Hash256;
use vcoin_pow::{block_proof, HeaderInfo};
use vcoin_primitives::BlockHeader;

use crate::blobs::BlobPos;

pub const BLOCK_VALID_UNKNOWN: u32 = 0;
pub const BLOCK_VALID_HEADER: u32 = 1;
pub const BLOCK_VALID_TREE: u32 = 2;
pub const BLOCK_VALID_TRANSACTIONS: u32 = 3;
pub const BLOCK_VALID_CHAIN: u32 = 4;
pub const BLOCK_VALID_SCRIPTS: u32 = 5;
pub const BLOCK_VALID_MASK: u32 = 7;
pub const BLOCK_HAVE_DATA: u32 = 8;
pub const BLOCK_HAVE_UNDO: u32 = 16;
pub const BLOCK_FAILED_VALID: u32 = 32;
pub const BLOCK_FAILED_CHILD: u32 = 64;
pub const BLOCK_FAILED_MASK: u32 = BLOCK_FAILED_VALID | BLOCK_FAILED_CHILD;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct BlockHandle(u32);

impl BlockHandle {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Debug)]
pub struct BlockNode {
    pub hash: Hash256,
    pub parent: Option<BlockHandle>,
    pub height: i32,
    pub header: BlockHeader,
    pub chain_work: U256,
    pub tx_count: u32,
    /// Transactions in this block and all of its ancestors.
    pub chain_tx: u64,
    pub status: u32,
    pub data_pos: Option<BlobPos>,
    pub undo_pos: Option<BlobPos>,
    sequence: u64,
}

impl BlockNode {
    pub fn time(&self) -> i64 {
        i64::from(self.header.time)
    }

    pub fn bits(&self) -> u32 {
        self.header.bits
    }

    pub fn validity(&self) -> u32 {
        self.status & BLOCK_VALID_MASK
    }

    pub fn is_valid(&self, level: u32) -> bool {
        !self.is_failed() && self.validity() >= level
    }

    pub fn is_failed(&self) -> bool {
        self.status & BLOCK_FAILED_MASK != 0
    }

    /// Raises the validity tier; never lowers it.
    pub fn raise_validity(&mut self, level: u32) {
        if self.validity() < level {
            self.status = (self.status & !BLOCK_VALID_MASK) | level;
        }
    }

    pub fn header_info(&self) -> HeaderInfo {
        HeaderInfo {
            height: i64::from(self.height),
            time: self.time(),
            bits: self.header.bits,
        }
    }
}

/// Fields needed to place a node in the tree; chain work and totals are derived.
#[derive(Clone, Debug)]
pub struct NewNode {
    pub header: BlockHeader,
    pub tx_count: u32,
    pub status: u32,
    pub data_pos: Option<BlobPos>,
    pub undo_pos: Option<BlobPos>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
struct CandidateKey {
    work: U256,
    arrival: Reverse<u64>,
    handle: BlockHandle,
}

#[derive(Debug, Default)]
pub struct BlockTree {
    nodes: Vec<BlockNode>,
    by_hash: HashMap<Hash256, BlockHandle>,
    next: HashMap<BlockHandle, BlockHandle>,
    candidates: BTreeSet<CandidateKey>,
    best: Option<BlockHandle>,
    genesis: Option<BlockHandle>,
    next_sequence: u64,
}

impl BlockTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Adds a node whose parent (`header.prev_block`) is already present, or a root when
    /// the tree is empty. Returns `None` for an unknown parent.
    pub fn insert(&mut self, node: NewNode) -> Option<BlockHandle> {
        let hash = node.header.hash();
        if let Some(existing) = self.by_hash.get(&hash) {
            return Some(*existing);
        }
        let parent = if self.nodes.is_empty() && !self.by_hash.contains_key(&node.header.prev_block)
        {
            None
        } else {
            Some(*self.by_hash.get(&node.header.prev_block)?)
        };
        let (height, parent_work, parent_tx) = match parent {
            Some(parent) => {
                let parent = self.get(parent);
                (parent.height + 1, parent.chain_work, parent.chain_tx)
            }
            None => (0, U256::zero(), 0),
        };
        let handle = BlockHandle(self.nodes.len() as u32);
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.nodes.push(BlockNode {
            hash,
            parent,
            height,
            chain_work: parent_work.saturating_add(block_proof(node.header.bits)),
            tx_count: node.tx_count,
            chain_tx: parent_tx + u64::from(node.tx_count),
            status: node.status,
            data_pos: node.data_pos,
            undo_pos: node.undo_pos,
            header: node.header,
            sequence,
        });
        self.by_hash.insert(hash, handle);
        if parent.is_none() {
            self.genesis = Some(handle);
        }
        Some(handle)
    }

    pub fn get(&self, handle: BlockHandle) -> &BlockNode {
        &self.nodes[handle.index()]
    }

    pub fn get_mut(&mut self, handle: BlockHandle) -> &mut BlockNode {
        &mut self.nodes[handle.index()]
    }

    pub fn lookup(&self, hash: &Hash256) -> Option<BlockHandle> {
        self.by_hash.get(hash).copied()
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.by_hash.contains_key(hash)
    }

    pub fn handles(&self) -> impl Iterator<Item = BlockHandle> + '_ {
        (0..self.nodes.len() as u32).map(BlockHandle)
    }

    pub fn genesis(&self) -> Option<BlockHandle> {
        self.genesis
    }

    pub fn best(&self) -> Option<BlockHandle> {
        self.best
    }

    pub fn best_node(&self) -> Option<&BlockNode> {
        self.best.map(|handle| self.get(handle))
    }

    pub fn best_height(&self) -> i32 {
        self.best_node().map(|node| node.height).unwrap_or(-1)
    }

    pub fn set_best(&mut self, handle: Option<BlockHandle>) {
        self.best = handle;
    }

    pub fn parent(&self, handle: BlockHandle) -> Option<BlockHandle> {
        self.get(handle).parent
    }

    pub fn next(&self, handle: BlockHandle) -> Option<BlockHandle> {
        self.next.get(&handle).copied()
    }

    pub fn set_next(&mut self, handle: BlockHandle, next: BlockHandle) {
        self.next.insert(handle, next);
    }

    pub fn clear_next(&mut self, handle: BlockHandle) {
        self.next.remove(&handle);
    }

    /// Rebuilds the forward links from the best node back to the root.
    pub fn relink_active_chain(&mut self) {
        self.next.clear();
        let mut cursor = self.best;
        while let Some(handle) = cursor {
            let parent = self.parent(handle);
            if let Some(parent) = parent {
                self.next.insert(parent, handle);
            }
            cursor = parent;
        }
    }

    /// Makes `target` the best node, relinking only the branches on either side of the
    /// fork with the previous best.
    pub fn move_best(&mut self, target: BlockHandle) {
        let fork = self.best.and_then(|old| self.find_fork(old, target));
        let (Some(old), Some(fork)) = (self.best, fork) else {
            self.best = Some(target);
            self.relink_active_chain();
            return;
        };

        let mut cursor = old;
        while cursor != fork {
            self.next.remove(&cursor);
            match self.parent(cursor) {
                Some(parent) => cursor = parent,
                None => break,
            }
        }
        self.next.remove(&fork);

        let mut cursor = target;
        while cursor != fork {
            let Some(parent) = self.parent(cursor) else {
                break;
            };
            self.next.insert(parent, cursor);
            cursor = parent;
        }
        self.best = Some(target);
    }

    pub fn is_on_active_chain(&self, handle: BlockHandle) -> bool {
        self.best == Some(handle) || self.next.contains_key(&handle)
    }

    pub fn ancestor(&self, handle: BlockHandle, height: i32) -> Option<BlockHandle> {
        let mut cursor = handle;
        if height < 0 || height > self.get(cursor).height {
            return None;
        }
        while self.get(cursor).height > height {
            cursor = self.parent(cursor)?;
        }
        Some(cursor)
    }

    /// Active-chain node at `height`.
    pub fn active_at(&self, height: i32) -> Option<BlockHandle> {
        self.ancestor(self.best?, height)
    }

    /// Last common ancestor of `a` and `b`.
    pub fn find_fork(&self, a: BlockHandle, b: BlockHandle) -> Option<BlockHandle> {
        let mut a = a;
        let mut b = b;
        while a != b {
            let height_a = self.get(a).height;
            let height_b = self.get(b).height;
            if height_a >= height_b {
                a = self.parent(a)?;
            }
            if height_b >= height_a {
                b = self.parent(b)?;
            }
        }
        Some(a)
    }

    /// Median of the last [`MEDIAN_TIME_SPAN`] block times ending at `handle`.
    pub fn median_time_past(&self, handle: BlockHandle) -> i64 {
        let mut times = Vec::with_capacity(MEDIAN_TIME_SPAN);
        let mut cursor = Some(handle);
        while let Some(current) = cursor {
            if times.len() == MEDIAN_TIME_SPAN {
                break;
            }
            times.push(self.get(current).time());
            cursor = self.parent(current);
        }
        times.sort_unstable();
        times[times.len() / 2]
    }

    /// Up to `count` header summaries ending at `handle`, oldest first.
    pub fn header_infos(&self, handle: BlockHandle, count: usize) -> Vec<HeaderInfo> {
        let mut infos = Vec::with_capacity(count);
        let mut cursor = Some(handle);
        while let Some(current) = cursor {
            if infos.len() == count {
                break;
            }
            infos.push(self.get(current).header_info());
            cursor = self.parent(current);
        }
        infos.reverse();
        infos
    }

    fn candidate_key(&self, handle: BlockHandle) -> CandidateKey {
        let node = self.get(handle);
        CandidateKey {
            work: node.chain_work,
            arrival: Reverse(node.sequence),
            handle,
        }
    }

    pub fn add_candidate(&mut self, handle: BlockHandle) {
        let key = self.candidate_key(handle);
        self.candidates.insert(key);
    }

    pub fn remove_candidate(&mut self, handle: BlockHandle) {
        let key = self.candidate_key(handle);
        self.candidates.remove(&key);
    }

    /// Most-work candidate; equal work goes to the node that arrived first.
    pub fn best_candidate(&self) -> Option<BlockHandle> {
        self.candidates.iter().next_back().map(|key| key.handle)
    }

    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_candidate(&self, handle: BlockHandle) -> bool {
        let key = self.candidate_key(handle);
        self.candidates.contains(&key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EASY_BITS: u32 = 0x207f_ffff;

    fn header(prev: Hash256, time: u32, nonce: u32) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_block: prev,
            merkle_root: [0u8; 32],
            time,
            bits: EASY_BITS,
            nonce,
        }
    }

    fn add(tree: &mut BlockTree, prev: Hash256, time: u32, nonce: u32) -> BlockHandle {
        let handle = tree
            .insert(NewNode {
                header: header(prev, time, nonce),
                tx_count: 1,
                status: BLOCK_VALID_TRANSACTIONS | BLOCK_HAVE_DATA,
                data_pos: None,
                undo_pos: None,
            })
            .expect("insert");
        tree.add_candidate(handle);
        handle
    }

    fn chain(tree: &mut BlockTree, from: BlockHandle, len: usize, nonce: u32) -> Vec<BlockHandle> {
        let mut handles = Vec::new();
        let mut prev = tree.get(from).hash;
        let mut time = tree.get(from).header.time;
        for _ in 0..len {
            time += 60;
            let handle = add(tree, prev, time, nonce);
            prev = tree.get(handle).hash;
            handles.push(handle);
        }
        handles
    }

    #[test]
    fn heights_and_work_accumulate() {
        let mut tree = BlockTree::new();
        let genesis = add(&mut tree, [0u8; 32], 1_000, 0);
        let blocks = chain(&mut tree, genesis, 3, 1);
        let tip = tree.get(blocks[2]);
        assert_eq!(tip.height, 3);
        assert_eq!(tip.chain_tx, 4);
        assert_eq!(tip.chain_work, block_proof(EASY_BITS) * U256::from(4u64));
        assert_eq!(tree.genesis(), Some(genesis));
        assert!(tree
            .insert(NewNode {
                header: header([5u8; 32], 1, 1),
                tx_count: 1,
                status: 0,
                data_pos: None,
                undo_pos: None,
            })
            .is_none());
    }

    #[test]
    fn fork_point_and_candidates() {
        let mut tree = BlockTree::new();
        let genesis = add(&mut tree, [0u8; 32], 1_000, 0);
        let main = chain(&mut tree, genesis, 3, 1);
        let side = chain(&mut tree, main[0], 3, 2);

        assert_eq!(tree.find_fork(main[2], side[2]), Some(main[0]));
        assert_eq!(tree.best_candidate(), Some(side[2]));

        let equal = chain(&mut tree, main[2], 1, 3);
        // Same work as the side tip: the earlier arrival keeps precedence.
        assert_eq!(tree.get(equal[0]).chain_work, tree.get(side[2]).chain_work);
        assert_eq!(tree.best_candidate(), Some(side[2]));

        tree.remove_candidate(side[2]);
        assert_eq!(tree.best_candidate(), Some(equal[0]));
    }

    #[test]
    fn active_chain_links_follow_best() {
        let mut tree = BlockTree::new();
        let genesis = add(&mut tree, [0u8; 32], 1_000, 0);
        let main = chain(&mut tree, genesis, 4, 1);
        tree.set_best(Some(main[3]));
        tree.relink_active_chain();
        assert_eq!(tree.next(genesis), Some(main[0]));
        assert_eq!(tree.active_at(2), Some(main[1]));
        assert!(tree.is_on_active_chain(main[3]));
        assert_eq!(tree.median_time_past(main[3]), 1_120);
        let infos = tree.header_infos(main[3], 3);
        assert_eq!(infos.len(), 3);
        assert_eq!(infos[0].height, 2);
        assert_eq!(infos[2].height, 4);
    }

    #[test]
    fn moving_best_relinks_only_the_fork() {
        let mut tree = BlockTree::new();
        let genesis = add(&mut tree, [0u8; 32], 1_000, 0);
        let main = chain(&mut tree, genesis, 4, 1);
        let side = chain(&mut tree, main[1], 3, 2);

        tree.move_best(main[3]);
        assert_eq!(tree.next(genesis), Some(main[0]));
        assert_eq!(tree.next(main[2]), Some(main[3]));

        tree.move_best(side[2]);
        assert_eq!(tree.best(), Some(side[2]));
        assert_eq!(tree.next(genesis), Some(main[0]));
        assert_eq!(tree.next(main[1]), Some(side[0]));
        assert_eq!(tree.next(side[1]), Some(side[2]));
        assert_eq!(tree.next(main[2]), None);
        assert!(!tree.is_on_active_chain(main[2]));
        assert!(!tree.is_on_active_chain(main[3]));
        assert!(tree.is_on_active_chain(side[0]));

        // Back onto an ancestor of the old tip, then forward again.
        tree.move_best(main[1]);
        assert_eq!(tree.next(main[1]), None);
        assert!(!tree.is_on_active_chain(side[0]));
        assert!(tree.is_on_active_chain(main[1]));
        tree.move_best(main[3]);
        assert_eq!(tree.next(main[1]), Some(main[2]));
        assert_eq!(tree.next(main[2]), Some(main[3]));
        assert_eq!(tree.next(side[0]), None);
    }
}
