//! The chain coordinator: block index, coin tip, mempool, and orphan pools behind a
//! single lock.
//!
//! Every state-changing operation takes the inner mutex for its whole duration. Script
//! checks fan out to the [`CheckQueue`] workers while the lock is held; listeners are
//! notified after it is released.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use primitive_types::U256;
use vcoin_consensus::constants::{
    BLOCKFILE_CHUNK_SIZE, DEFAULT_COIN_CACHE_SIZE, MAX_BLOCKFILE_SIZE, MIN_DISK_SPACE,
    SCRIPT_CHECK_BATCH, STRICT_TIME_DRIFT, UNDOFILE_CHUNK_SIZE,
};
use vcoin_consensus::money::Amount;
use vcoin_consensus::params::{ChainParams, ConsensusParams, HexError};
use vcoin_consensus::{hash256_to_hex, CheckpointPolicy, Checkpoints, Hash256};
use vcoin_log::{log_category, log_debug, log_error, log_info, log_warn, Category};
use vcoin_pow::{bits_within_tolerance, block_proof, compact_to_u256, difficulty_policy};
use vcoin_pow::{DifficultyError, DifficultyPolicy};
use vcoin_primitives::encoding::{DecodeError, Decoder};
use vcoin_primitives::{Block, BlockHeader, Decodable, Transaction};
use vcoin_storage::{KeyValueStore, StoreError, WriteBatch};

use crate::blobs::{check_disk_space, BlobError, BlobPos, BlobStore, BlockFileInfo, FrameScanner};
use crate::blocktree::{
    BlockHandle, BlockNode, BlockTree, NewNode, BLOCK_FAILED_CHILD, BLOCK_FAILED_VALID,
    BLOCK_HAVE_DATA, BLOCK_HAVE_UNDO, BLOCK_VALID_SCRIPTS, BLOCK_VALID_TRANSACTIONS,
};
use crate::checkqueue::CheckQueue;
use crate::coins::{CoinCache, CoinRecord, CoinView, CoinViewError, DbCoinView};
use crate::connect::{connect_block, disconnect_block, ConnectContext};
use crate::genesis::genesis_block;
use crate::index::{BlockTreeDb, FLAG_TXINDEX};
use crate::mempool::{AcceptContext, Mempool, MempoolError, MempoolErrorKind};
use crate::orphans::{OrphanBlocks, OrphanTxs};
use crate::policy::RelayPolicy;
use crate::rewards::{CoinbasePlan, MasternodeVotes, ParentBlock, RewardPolicy, StandardReward};
use crate::txindex::{TxIndex, TxLocation};
use crate::undo::BlockUndo;
use crate::validation::{check_block, BlockCheck, ValidationError};

const BLOCK_FILE_PREFIX: &str = "blk";
const UNDO_FILE_PREFIX: &str = "rev";

/// A tip older than this is still catching up.
const IBD_TIP_AGE_SECS: i64 = 24 * 60 * 60;
/// ...unless it has not moved for this long.
const IBD_TIP_STALL_SECS: i64 = 10;

#[derive(Debug)]
pub enum ChainStateError {
    Validation(ValidationError),
    Store(StoreError),
    CoinView(CoinViewError),
    Blob(BlobError),
    Decode(DecodeError),
    Difficulty(DifficultyError),
    Io(std::io::Error),
    CorruptIndex(&'static str),
    /// Shutdown was requested before the operation could finish; nothing was committed.
    Interrupted,
    /// The node cannot continue safely; the shutdown signal has been raised.
    Fatal(String),
    Poisoned,
}

impl ChainStateError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ChainStateError::Fatal(_) | ChainStateError::Interrupted)
    }

    pub fn validation(&self) -> Option<&ValidationError> {
        match self {
            ChainStateError::Validation(err) => Some(err),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChainStateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainStateError::Validation(err) => write!(f, "{err}"),
            ChainStateError::Store(err) => write!(f, "{err}"),
            ChainStateError::CoinView(err) => write!(f, "{err}"),
            ChainStateError::Blob(err) => write!(f, "{err}"),
            ChainStateError::Decode(err) => write!(f, "{err}"),
            ChainStateError::Difficulty(err) => write!(f, "{err}"),
            ChainStateError::Io(err) => write!(f, "{err}"),
            ChainStateError::CorruptIndex(message) => write!(f, "{message}"),
            ChainStateError::Interrupted => write!(f, "interrupted by shutdown"),
            ChainStateError::Fatal(message) => write!(f, "fatal: {message}"),
            ChainStateError::Poisoned => write!(f, "chain state lock poisoned"),
        }
    }
}

impl std::error::Error for ChainStateError {}

impl From<ValidationError> for ChainStateError {
    fn from(err: ValidationError) -> Self {
        ChainStateError::Validation(err)
    }
}

impl From<StoreError> for ChainStateError {
    fn from(err: StoreError) -> Self {
        ChainStateError::Store(err)
    }
}

impl From<CoinViewError> for ChainStateError {
    fn from(err: CoinViewError) -> Self {
        ChainStateError::CoinView(err)
    }
}

impl From<BlobError> for ChainStateError {
    fn from(err: BlobError) -> Self {
        ChainStateError::Blob(err)
    }
}

impl From<DecodeError> for ChainStateError {
    fn from(err: DecodeError) -> Self {
        ChainStateError::Decode(err)
    }
}

impl From<DifficultyError> for ChainStateError {
    fn from(err: DifficultyError) -> Self {
        ChainStateError::Difficulty(err)
    }
}

impl From<std::io::Error> for ChainStateError {
    fn from(err: std::io::Error) -> Self {
        ChainStateError::Io(err)
    }
}

impl From<HexError> for ChainStateError {
    fn from(_: HexError) -> Self {
        ChainStateError::CorruptIndex("invalid genesis parameters")
    }
}

/// Source of wall-clock and network-adjusted time, in unix seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;

    fn adjusted_time(&self) -> i64 {
        self.now()
    }
}

/// The system clock, shifted by the median offset reported by peers.
#[derive(Debug, Default)]
pub struct SystemClock {
    offset: AtomicI64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offset(&self, offset: i64) {
        self.offset.store(offset, Ordering::Relaxed);
    }
}

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs() as i64)
            .unwrap_or_default()
    }

    fn adjusted_time(&self) -> i64 {
        self.now() + self.offset.load(Ordering::Relaxed)
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct FixedClock {
    now: AtomicI64,
}

impl FixedClock {
    pub fn new(now: i64) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::Relaxed);
    }

    pub fn advance(&self, seconds: i64) {
        self.now.fetch_add(seconds, Ordering::Relaxed);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
struct ShutdownInner {
    requested: AtomicBool,
    reason: Mutex<Option<String>>,
}

/// Node-wide stop flag shared between the chain state, import threads, and the signal
/// handler. The first reason recorded wins.
#[derive(Clone, Debug, Default)]
pub struct ShutdownSignal {
    inner: Arc<ShutdownInner>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self, reason: impl Into<String>) {
        if let Ok(mut slot) = self.inner.reason.lock() {
            if slot.is_none() {
                *slot = Some(reason.into());
            }
        }
        self.inner.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<String> {
        self.inner.reason.lock().ok().and_then(|slot| slot.clone())
    }
}

/// Observer of pool and chain changes, typically a wallet.
pub trait ChainListener: Send + Sync {
    /// `block` is the block that confirmed the transaction, absent for pool entries.
    fn sync_transaction(&self, _txid: &Hash256, _tx: &Transaction, _block: Option<&Block>) {}

    fn set_best_chain(&self, _tip: &Hash256) {}
}

enum ChainEvent {
    Transaction {
        txid: Hash256,
        tx: Arc<Transaction>,
        block: Option<Arc<Block>>,
    },
    BestChain(Hash256),
}

/// An inventory item as announced by peers.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Inventory {
    Tx(Hash256),
    Block(Hash256),
}

#[derive(Clone, Debug)]
pub struct ChainStateOptions {
    pub relay: RelayPolicy,
    /// Coin records the tip cache may hold during initial download before it is flushed.
    pub coin_cache_size: usize,
    pub txindex: bool,
    /// Script verification workers; zero checks inline on the validating thread.
    pub script_threads: usize,
}

impl Default for ChainStateOptions {
    fn default() -> Self {
        Self {
            relay: RelayPolicy::default(),
            coin_cache_size: DEFAULT_COIN_CACHE_SIZE,
            txindex: false,
            script_threads: 0,
        }
    }
}

/// The pluggable consensus rules.
#[derive(Clone)]
pub struct Policies {
    pub difficulty: Arc<dyn DifficultyPolicy>,
    pub rewards: Arc<dyn RewardPolicy>,
    pub checkpoints: Arc<dyn CheckpointPolicy>,
}

impl Policies {
    pub fn for_params(params: &ConsensusParams) -> Self {
        let rewards: Arc<dyn RewardPolicy> = if params.masternode.enforcement_height.is_some() {
            Arc::new(MasternodeVotes::new(
                params.network,
                params.masternode.clone(),
            ))
        } else {
            Arc::new(StandardReward::new(params.network))
        };
        Self {
            difficulty: difficulty_policy(params),
            rewards,
            checkpoints: Arc::new(Checkpoints::from_params(params)),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BlockOutcome {
    /// Stored on disk and indexed. Full validity is only known once the block is
    /// connected, so it may still end up failed or stay off the best chain.
    Accepted {
        hash: Hash256,
    },
    /// Parked until its ancestors arrive; `root` is the lowest parked block of its chain,
    /// whose parent is the one to request.
    Orphaned {
        hash: Hash256,
        root: Hash256,
    },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TxOutcome {
    Accepted {
        txid: Hash256,
        /// Parked transactions that became acceptable because of this one.
        orphans_accepted: Vec<Hash256>,
    },
    Orphaned {
        txid: Hash256,
        missing: Vec<vcoin_primitives::OutPoint>,
    },
}

/// A transaction found by [`ChainState::transaction`].
#[derive(Clone, Debug)]
pub struct LocatedTransaction {
    pub tx: Arc<Transaction>,
    /// Confirming block; `None` while the transaction sits in the pool.
    pub block: Option<Hash256>,
}

/// Summary of the active chain's tip.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TipInfo {
    pub hash: Hash256,
    pub height: i32,
    pub chain_work: U256,
    pub chain_tx: u64,
    pub time: i64,
}

#[derive(Debug, Default)]
struct BlobFiles {
    last_file: u32,
    infos: HashMap<u32, BlockFileInfo>,
}

struct ChainInner<S> {
    tree: BlockTree,
    tip: CoinCache<DbCoinView<S>>,
    mempool: Mempool,
    orphan_blocks: OrphanBlocks,
    /// Where parked blocks already sit on disk, when they came from a block file.
    orphan_positions: HashMap<Hash256, BlobPos>,
    orphan_txs: OrphanTxs,
    files: BlobFiles,
    best_invalid_work: U256,
    txindex: bool,
    ibd_seen_best: Option<BlockHandle>,
    ibd_seen_at: i64,
    events: Vec<ChainEvent>,
}

/// Outcome of one attempt to move the tip.
enum TipChange {
    Done,
    /// A block on the path failed validation; nothing was committed.
    Rejected(BlockHandle, ValidationError),
}

pub struct ChainState<S> {
    params: ChainParams,
    policies: Policies,
    options: ChainStateOptions,
    db: BlockTreeDb<S>,
    tx_index: TxIndex<S>,
    blocks: BlobStore,
    undo: BlobStore,
    queue: Option<CheckQueue>,
    clock: Arc<dyn Clock>,
    shutdown: ShutdownSignal,
    genesis_hash: Hash256,
    importing: AtomicBool,
    reindexing: AtomicBool,
    listeners: Mutex<Vec<Arc<dyn ChainListener>>>,
    inner: Mutex<ChainInner<S>>,
}

impl<S: KeyValueStore> ChainState<S> {
    /// Opens the chain state over `store` with block and undo files under `blocks_dir`.
    /// Call [`ChainState::load`] and then [`ChainState::init_genesis`] before use.
    pub fn open(
        params: ChainParams,
        store: Arc<S>,
        blocks_dir: &Path,
        options: ChainStateOptions,
    ) -> Result<Self, ChainStateError> {
        let blocks = BlobStore::open(blocks_dir, BLOCK_FILE_PREFIX, params.message_start)?;
        let undo = BlobStore::open(blocks_dir, UNDO_FILE_PREFIX, params.message_start)?;
        let queue = if options.script_threads > 0 {
            Some(CheckQueue::new(
                options.script_threads,
                options.script_threads * SCRIPT_CHECK_BATCH,
            )?)
        } else {
            None
        };
        let genesis_hash = genesis_block(&params.consensus)?.hash();
        let policies = Policies::for_params(&params.consensus);
        let inner = ChainInner {
            tree: BlockTree::new(),
            tip: CoinCache::new(DbCoinView::new(Arc::clone(&store))),
            mempool: Mempool::new(),
            orphan_blocks: OrphanBlocks::new(),
            orphan_positions: HashMap::new(),
            orphan_txs: OrphanTxs::default(),
            files: BlobFiles::default(),
            best_invalid_work: U256::zero(),
            txindex: options.txindex,
            ibd_seen_best: None,
            ibd_seen_at: 0,
            events: Vec::new(),
        };
        Ok(Self {
            params,
            policies,
            options,
            db: BlockTreeDb::new(Arc::clone(&store)),
            tx_index: TxIndex::new(store),
            blocks,
            undo,
            queue,
            clock: Arc::new(SystemClock::new()),
            shutdown: ShutdownSignal::new(),
            genesis_hash,
            importing: AtomicBool::new(false),
            reindexing: AtomicBool::new(false),
            listeners: Mutex::new(Vec::new()),
            inner: Mutex::new(inner),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_policies(mut self, policies: Policies) -> Self {
        self.policies = policies;
        self
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    pub fn genesis_hash(&self) -> Hash256 {
        self.genesis_hash
    }

    pub fn add_listener(&self, listener: Arc<dyn ChainListener>) -> Result<(), ChainStateError> {
        self.listeners
            .lock()
            .map_err(|_| ChainStateError::Poisoned)?
            .push(listener);
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, ChainInner<S>>, ChainStateError> {
        self.inner.lock().map_err(|_| ChainStateError::Poisoned)
    }

    /// Logs `err`, raises the shutdown signal, and returns the fatal error to propagate.
    fn fatal(&self, context: &str, err: impl std::fmt::Display) -> ChainStateError {
        let message = format!("{context}: {err}");
        log_error!("{}", message);
        self.shutdown.request(message.clone());
        ChainStateError::Fatal(message)
    }

    fn dispatch(&self, events: Vec<ChainEvent>) {
        if events.is_empty() {
            return;
        }
        let listeners = match self.listeners.lock() {
            Ok(listeners) => listeners.clone(),
            Err(_) => return,
        };
        for event in &events {
            for listener in &listeners {
                match event {
                    ChainEvent::Transaction { txid, tx, block } => {
                        listener.sync_transaction(txid, tx, block.as_deref())
                    }
                    ChainEvent::BestChain(tip) => listener.set_best_chain(tip),
                }
            }
        }
    }

    /// Releases the lock, then notifies listeners of what happened under it.
    fn finish(&self, mut guard: MutexGuard<'_, ChainInner<S>>) {
        let events = std::mem::take(&mut guard.events);
        drop(guard);
        self.dispatch(events);
    }

    /// Rebuilds the in-memory index from the block tree database.
    pub fn load(&self) -> Result<(), ChainStateError> {
        let started = Instant::now();
        let mut guard = self.lock()?;
        let inner = &mut *guard;

        match self.db.flag(FLAG_TXINDEX)? {
            Some(stored) => {
                if stored != self.options.txindex {
                    log_warn!(
                        "transaction index is {} in the database; reindex to change it",
                        if stored { "enabled" } else { "disabled" }
                    );
                }
                inner.txindex = stored;
            }
            None => inner.txindex = self.options.txindex,
        }
        self.reindexing
            .store(self.db.reindexing()?, Ordering::SeqCst);
        inner.files.last_file = self.db.last_file()?.unwrap_or(0);
        inner.files.infos.clear();
        inner.best_invalid_work = self.db.best_invalid_work()?;

        let mut nodes = self.db.load_nodes()?;
        nodes.sort_by_key(|(_, entry)| entry.height);
        for (hash, entry) in nodes {
            let height = entry.height;
            let Some(handle) = inner.tree.insert(NewNode {
                header: entry.header,
                tx_count: entry.tx_count,
                status: entry.status,
                data_pos: entry.data_pos,
                undo_pos: entry.undo_pos,
            }) else {
                log_warn!(
                    "block index entry {} at height {} has no parent; skipping",
                    hash256_to_hex(&hash),
                    height
                );
                continue;
            };
            let node = inner.tree.get(handle);
            if node.hash != hash || node.height != height {
                return Err(ChainStateError::CorruptIndex(
                    "block index entry does not match its key",
                ));
            }
            if node.is_valid(BLOCK_VALID_TRANSACTIONS) && node.status & BLOCK_HAVE_DATA != 0 {
                inner.tree.add_candidate(handle);
            }
        }

        let best = inner
            .tip
            .best_block()?
            .and_then(|hash| inner.tree.lookup(&hash));
        inner.tree.set_best(best);
        inner.tree.relink_active_chain();

        match inner.tree.best_node() {
            Some(best) => log_info!(
                "loaded {} block index entries in {}ms; best {} height {}",
                inner.tree.len(),
                started.elapsed().as_millis(),
                hash256_to_hex(&best.hash),
                best.height
            ),
            None => log_info!(
                "loaded {} block index entries in {}ms; no best chain",
                inner.tree.len(),
                started.elapsed().as_millis()
            ),
        }
        Ok(())
    }

    /// Writes and connects the genesis block when the index is empty. Returns whether it
    /// did so.
    pub fn init_genesis(&self) -> Result<bool, ChainStateError> {
        let mut guard = self.lock()?;
        if !guard.tree.is_empty() {
            return Ok(false);
        }
        let mut batch = WriteBatch::new();
        self.db.put_flag(&mut batch, FLAG_TXINDEX, guard.txindex);
        self.db
            .write(&batch)
            .map_err(|err| self.fatal("failed to write transaction index flag", err))?;
        if self.reindexing.load(Ordering::SeqCst) {
            // The genesis block comes back from the block files.
            return Ok(false);
        }

        let block = genesis_block(&self.params.consensus)?;
        self.accept_block(&mut guard, &block, None)?;
        log_info!("initialized chain at genesis {}", hash256_to_hex(&block.hash()));
        self.finish(guard);
        Ok(true)
    }

    /// Validates a block from any source and extends, reorganizes, or parks it.
    pub fn process_block(&self, block: Block) -> Result<BlockOutcome, ChainStateError> {
        let mut guard = self.lock()?;
        let outcome = self.process_block_locked(&mut guard, block, None);
        self.finish(guard);
        outcome
    }

    fn process_block_locked(
        &self,
        inner: &mut ChainInner<S>,
        block: Block,
        known: Option<BlobPos>,
    ) -> Result<BlockOutcome, ChainStateError> {
        let hash = block.hash();
        if inner.tree.contains(&hash) {
            return Err(ValidationError::invalid("duplicate", 0).into());
        }
        if inner.orphan_blocks.contains(&hash) {
            return Err(ValidationError::invalid("duplicate-orphan", 0).into());
        }

        let is_genesis = hash == self.genesis_hash;
        let check = if is_genesis {
            BlockCheck {
                check_pow: false,
                check_merkle: true,
            }
        } else {
            BlockCheck::FULL
        };
        check_block(&block, self.clock.adjusted_time(), &self.params.consensus, check)?;

        let extends_best =
            inner.tree.best_node().map(|best| best.hash) == Some(block.header.prev_block);
        if !extends_best {
            self.check_against_checkpoint(&inner.tree, &block)?;
        }

        if !is_genesis && !inner.tree.contains(&block.header.prev_block) {
            let block = Arc::new(block);
            inner.orphan_blocks.insert(Arc::clone(&block));
            if let Some(pos) = known {
                inner.orphan_positions.insert(hash, pos);
            }
            let root = inner.orphan_blocks.root_block(&hash).unwrap_or(hash);
            log_category!(
                Category::Orphan,
                "parked orphan block {} (missing {}), {} parked",
                hash256_to_hex(&hash),
                hash256_to_hex(&block.header.prev_block),
                inner.orphan_blocks.len()
            );
            return Ok(BlockOutcome::Orphaned { hash, root });
        }

        self.accept_block(inner, &block, known)?;

        let mut work = VecDeque::from([hash]);
        while let Some(parent) = work.pop_front() {
            for child in inner.orphan_blocks.take_children(&parent) {
                let child_hash = child.hash();
                let position = inner.orphan_positions.remove(&child_hash);
                match self.accept_block(inner, &child, position) {
                    Ok(()) => work.push_back(child_hash),
                    Err(err) if err.is_fatal() => return Err(err),
                    Err(err) => log_debug!(
                        "orphan block {} rejected: {}",
                        hash256_to_hex(&child_hash),
                        err
                    ),
                }
            }
        }
        Ok(BlockOutcome::Accepted { hash })
    }

    /// A block forking off below the last checkpoint must not predate it or claim less
    /// work than could have been reached since.
    fn check_against_checkpoint(&self, tree: &BlockTree, block: &Block) -> Result<(), ChainStateError> {
        let Some(checkpoint) = self.policies.checkpoints.last_checkpoint() else {
            return Ok(());
        };
        let Some(handle) = tree.lookup(&checkpoint.hash) else {
            return Ok(());
        };
        let node = tree.get(handle);
        let elapsed = i64::from(block.header.time) - node.time();
        if elapsed < 0 {
            return Err(ValidationError::invalid("time-before-checkpoint", 100).into());
        }
        let required = self
            .policies
            .difficulty
            .compute_min_work(node.bits(), elapsed);
        let claimed = compact_to_u256(block.header.bits)
            .map_err(|_| ValidationError::invalid("bad-diffbits", 100))?;
        let ceiling = compact_to_u256(required)
            .map_err(|_| ValidationError::invalid("bad-diffbits", 100))?;
        if claimed > ceiling {
            return Err(ValidationError::invalid("bad-diffbits-min-work", 100).into());
        }
        Ok(())
    }

    /// Checks `block` against its parent, stores it, indexes it, and lets the best chain
    /// move. With `known`, the block already sits at that position on disk.
    fn accept_block(
        &self,
        inner: &mut ChainInner<S>,
        block: &Block,
        known: Option<BlobPos>,
    ) -> Result<(), ChainStateError> {
        let hash = block.hash();
        if inner.tree.contains(&hash) {
            return Err(ValidationError::invalid("duplicate", 0).into());
        }
        let height = if hash == self.genesis_hash {
            0
        } else {
            self.check_contextual(inner, block, &hash)?
        };

        let payload = block.consensus_encode_to_vec();
        let pos = self.find_block_pos(
            &mut inner.files,
            BlobStore::framed_len(payload.len()),
            height,
            u64::from(block.header.time),
            known,
        )?;
        if known.is_none() {
            self.blocks
                .write(pos, &payload)
                .map_err(|err| self.fatal("failed to write block", err))?;
        }
        let handle = self.add_to_block_index(inner, block, pos)?;

        let failures = self.connect_best_block(inner)?;
        if let Some((_, err)) = failures.into_iter().find(|(failed, _)| *failed == handle) {
            return Err(err.into());
        }
        Ok(())
    }

    /// Rules that depend on the parent: difficulty, timestamps, finality, checkpoints,
    /// and the coinbase allocation. Returns the block's height.
    fn check_contextual(
        &self,
        inner: &mut ChainInner<S>,
        block: &Block,
        hash: &Hash256,
    ) -> Result<i32, ChainStateError> {
        let Some(parent) = inner.tree.lookup(&block.header.prev_block) else {
            return Err(ValidationError::invalid("prev-blk-not-found", 10).into());
        };
        let parent_node = inner.tree.get(parent);
        let parent_height = parent_node.height;
        let parent_bits = parent_node.bits();
        let parent_time = parent_node.time();
        let height = parent_height + 1;
        let time = i64::from(block.header.time);

        let history = inner
            .tree
            .header_infos(parent, self.policies.difficulty.lookback());
        let required = self
            .policies
            .difficulty
            .next_work_required(&history, time)?;
        if block.header.bits != required {
            let tolerated = self.params.consensus.pow_tolerance_active(height)
                && bits_within_tolerance(block.header.bits, required);
            if !tolerated {
                log_debug!(
                    "block {} has bits {:08x}, expected {:08x}",
                    hash256_to_hex(hash),
                    block.header.bits,
                    required
                );
                return Err(ValidationError::invalid("bad-diffbits", 100).into());
            }
        }

        if self.params.consensus.strict_time_active(height) {
            if time > self.clock.adjusted_time() + STRICT_TIME_DRIFT {
                return Err(ValidationError::invalid("time-too-new", 0).into());
            }
            if time <= parent_time - STRICT_TIME_DRIFT {
                return Err(ValidationError::invalid("time-too-old-drift", 0).into());
            }
        }
        if time <= inner.tree.median_time_past(parent) {
            return Err(ValidationError::invalid("time-too-old", 0).into());
        }
        if block
            .transactions
            .iter()
            .any(|tx| !tx.is_final(height, time))
        {
            return Err(ValidationError::invalid("bad-txns-nonfinal", 10).into());
        }
        if !self.policies.checkpoints.check(height, hash) {
            return Err(ValidationError::invalid("checkpoint-mismatch", 100).into());
        }

        let parent_block = if self.policies.rewards.validates_votes(height) {
            Some(self.read_block(inner.tree.get(parent))?)
        } else {
            None
        };
        let parent_ctx = ParentBlock {
            height: parent_height,
            bits: parent_bits,
            votes: parent_block
                .as_ref()
                .map_or(&[][..], |parent| parent.votes.as_slice()),
        };
        let initial_download = self.initial_download(inner);
        self.policies
            .rewards
            .check_block(block, &parent_ctx, initial_download)?;
        Ok(height)
    }

    fn add_to_block_index(
        &self,
        inner: &mut ChainInner<S>,
        block: &Block,
        pos: BlobPos,
    ) -> Result<BlockHandle, ChainStateError> {
        let handle = inner
            .tree
            .insert(NewNode {
                header: block.header.clone(),
                tx_count: block.transactions.len() as u32,
                status: BLOCK_VALID_TRANSACTIONS | BLOCK_HAVE_DATA,
                data_pos: Some(pos),
                undo_pos: None,
            })
            .ok_or(ChainStateError::CorruptIndex("accepted block has no indexed parent"))?;
        inner.tree.add_candidate(handle);
        let mut batch = WriteBatch::new();
        self.db.put_node(&mut batch, inner.tree.get(handle));
        self.db
            .write(&batch)
            .map_err(|err| self.fatal("failed to write block index", err))?;
        Ok(handle)
    }

    /// Moves the tip to the most-work valid candidate, skipping candidates whose ancestry
    /// failed. Returns the blocks found invalid on the way.
    fn connect_best_block(
        &self,
        inner: &mut ChainInner<S>,
    ) -> Result<Vec<(BlockHandle, ValidationError)>, ChainStateError> {
        let mut failures = Vec::new();
        loop {
            if self.shutdown.is_requested() {
                return Err(ChainStateError::Interrupted);
            }
            let Some(candidate) = inner.tree.best_candidate() else {
                return Ok(failures);
            };
            if let Some(best) = inner.tree.best() {
                if candidate == best
                    || inner.tree.get(candidate).chain_work <= inner.tree.get(best).chain_work
                {
                    return Ok(failures);
                }
            }

            let mut cursor = candidate;
            let failed_ancestor = loop {
                let node = inner.tree.get(cursor);
                if node.is_failed() {
                    break Some(cursor);
                }
                if inner.tree.is_on_active_chain(cursor) {
                    break None;
                }
                match node.parent {
                    Some(parent) => cursor = parent,
                    None => break None,
                }
            };

            if let Some(failed) = failed_ancestor {
                let mut batch = WriteBatch::new();
                let mut descendant = candidate;
                while descendant != failed {
                    inner.tree.get_mut(descendant).status |= BLOCK_FAILED_CHILD;
                    inner.tree.remove_candidate(descendant);
                    self.db.put_node(&mut batch, inner.tree.get(descendant));
                    match inner.tree.parent(descendant) {
                        Some(parent) => descendant = parent,
                        None => break,
                    }
                }
                inner.tree.remove_candidate(failed);
                self.db
                    .write(&batch)
                    .map_err(|err| self.fatal("failed to write block index", err))?;
                self.invalid_chain_found(inner, candidate)?;
                continue;
            }

            match self.set_best_chain(inner, candidate)? {
                TipChange::Done => {}
                TipChange::Rejected(handle, err) => {
                    let node = inner.tree.get_mut(handle);
                    node.status |= BLOCK_FAILED_VALID;
                    log_debug!(
                        "block {} at height {} failed validation: {}",
                        hash256_to_hex(&node.hash),
                        node.height,
                        err
                    );
                    inner.tree.remove_candidate(handle);
                    let mut batch = WriteBatch::new();
                    self.db.put_node(&mut batch, inner.tree.get(handle));
                    self.db
                        .write(&batch)
                        .map_err(|err| self.fatal("failed to write block index", err))?;
                    self.invalid_chain_found(inner, handle)?;
                    failures.push((handle, err));
                }
            }
        }
    }

    fn invalid_chain_found(
        &self,
        inner: &mut ChainInner<S>,
        handle: BlockHandle,
    ) -> Result<(), ChainStateError> {
        let node = inner.tree.get(handle);
        if node.chain_work > inner.best_invalid_work {
            inner.best_invalid_work = node.chain_work;
            let mut batch = WriteBatch::new();
            self.db.put_best_invalid_work(&mut batch, node.chain_work);
            self.db
                .write(&batch)
                .map_err(|err| self.fatal("failed to write best invalid work", err))?;
        }
        log_warn!(
            "invalid block={} height={} log2_work={:.8} date={}",
            hash256_to_hex(&node.hash),
            node.height,
            work_log2(node.chain_work),
            node.time()
        );
        if let Some(best) = inner.tree.best_node() {
            log_warn!(
                "current best={} height={} log2_work={:.8}",
                hash256_to_hex(&best.hash),
                best.height,
                work_log2(best.chain_work)
            );
            let margin = block_proof(best.bits()).saturating_mul(U256::from(6u8));
            if inner.best_invalid_work > best.chain_work.saturating_add(margin) {
                log_warn!(
                    "an invalid chain with substantially more work was seen; this node may need an upgrade"
                );
            }
        }
        Ok(())
    }

    /// Reorganizes the coin tip onto `target`. Disconnects and connects run in one
    /// overlay; a failing block leaves the tip, the coin store, and the active chain links
    /// untouched.
    fn set_best_chain(
        &self,
        inner: &mut ChainInner<S>,
        target: BlockHandle,
    ) -> Result<TipChange, ChainStateError> {
        let started = Instant::now();
        let fork = match inner.tree.best() {
            Some(best) => Some(
                inner
                    .tree
                    .find_fork(best, target)
                    .ok_or(ChainStateError::CorruptIndex("candidate shares no ancestor with the best chain"))?,
            ),
            None => None,
        };

        let mut disconnect = Vec::new();
        let mut cursor = inner.tree.best();
        while let Some(handle) = cursor {
            if Some(handle) == fork {
                break;
            }
            disconnect.push(handle);
            cursor = inner.tree.parent(handle);
        }
        let mut attach = Vec::new();
        let mut cursor = Some(target);
        while let Some(handle) = cursor {
            if Some(handle) == fork {
                break;
            }
            attach.push(handle);
            cursor = inner.tree.parent(handle);
        }
        attach.reverse();

        if !disconnect.is_empty() {
            log_category!(
                Category::Reorg,
                "reorganize: disconnect {} blocks back to {}, connect {} blocks",
                disconnect.len(),
                fork.map(|fork| hash256_to_hex(&inner.tree.get(fork).hash))
                    .unwrap_or_default(),
                attach.len()
            );
        }

        let initial_download = self.initial_download(inner);
        let estimate = self.policies.checkpoints.total_blocks_estimate();
        let ctx = self.connect_context();
        let mut index_batch = WriteBatch::new();
        let mut tx_batch = WriteBatch::new();
        let mut resurrect: Vec<Arc<Transaction>> = Vec::new();
        let mut connected: Vec<(Arc<Block>, Vec<Hash256>)> = Vec::new();

        {
            let mut view = CoinCache::new(&mut inner.tip);

            for &handle in &disconnect {
                if self.shutdown.is_requested() {
                    return Err(ChainStateError::Interrupted);
                }
                let node = inner.tree.get(handle);
                let block = self.read_block(node)?;
                let undo = self.read_undo(&inner.tree, handle)?;
                if !disconnect_block(&mut view, &block, node.height, &undo)? {
                    return Err(ChainStateError::CorruptIndex(
                        "coin view inconsistent while disconnecting block",
                    ));
                }
                if node.height > estimate {
                    resurrect.extend(
                        block
                            .transactions
                            .into_iter()
                            .filter(|tx| !tx.is_coinbase())
                            .map(Arc::new),
                    );
                }
            }

            for &handle in &attach {
                if self.shutdown.is_requested() {
                    // Undo positions and validity raised so far describe data already on disk.
                    self.db
                        .write(&index_batch)
                        .map_err(|err| self.fatal("failed to write block index", err))?;
                    return Err(ChainStateError::Interrupted);
                }
                let node = inner.tree.get(handle).clone();
                let block = self.read_block(&node)?;
                let parent = node.parent.map(|parent| {
                    let parent = inner.tree.get(parent);
                    ParentBlock {
                        height: parent.height,
                        bits: parent.bits(),
                        votes: &[],
                    }
                });
                let applied =
                    match connect_block(&mut view, &block, node.height, parent.as_ref(), &ctx, false) {
                        Ok(applied) => applied,
                        Err(ChainStateError::Validation(err)) => {
                            drop(view);
                            self.db
                                .write(&index_batch)
                                .map_err(|err| self.fatal("failed to write block index", err))?;
                            return Ok(TipChange::Rejected(handle, err));
                        }
                        Err(err) => return Err(err),
                    };

                if node.undo_pos.is_none() && node.parent.is_some() {
                    let file = node
                        .data_pos
                        .map(|pos| pos.file)
                        .ok_or(ChainStateError::CorruptIndex("connected block has no data"))?;
                    let payload = applied.undo.encode_with_checksum(&block.header.prev_block);
                    let pos = self.find_undo_pos(
                        &mut inner.files,
                        file,
                        BlobStore::framed_len(payload.len()),
                    )?;
                    self.undo
                        .write(pos, &payload)
                        .map_err(|err| self.fatal("failed to write undo data", err))?;
                    let stored = inner.tree.get_mut(handle);
                    stored.undo_pos = Some(pos);
                    stored.status |= BLOCK_HAVE_UNDO;
                }
                inner.tree.get_mut(handle).raise_validity(BLOCK_VALID_SCRIPTS);
                self.db.put_node(&mut index_batch, inner.tree.get(handle));

                if inner.txindex {
                    if let Some(data_pos) = node.data_pos {
                        for (txid, tx_offset) in applied.txids.iter().zip(block.transaction_offsets()) {
                            self.tx_index.insert(
                                &mut tx_batch,
                                txid,
                                TxLocation {
                                    block: data_pos,
                                    tx_offset,
                                },
                            );
                        }
                    }
                }
                connected.push((Arc::new(block), applied.txids));
            }

            view.flush()
                .map_err(|err| self.fatal("failed to update coin tip", err))?;
        }

        index_batch.extend(tx_batch);
        self.db
            .write(&index_batch)
            .map_err(|err| self.fatal("failed to write block index", err))?;

        if !initial_download || inner.tip.len() > self.options.coin_cache_size {
            let pending = 100 * 2 * 2 * inner.tip.len() as u64;
            check_disk_space(self.blocks.dir(), MIN_DISK_SPACE, pending)
                .map_err(|err| self.fatal("cannot flush coin database", err))?;
            self.flush_blob_files(&inner.files, false)?;
            inner
                .tip
                .flush()
                .map_err(|err| self.fatal("failed to write to coin database", err))?;
        }

        inner.tree.move_best(target);

        let now = self.clock.now();
        let accept_ctx = self.accept_context(inner.tree.best_height(), false);
        for tx in resurrect {
            if inner
                .mempool
                .accept(&inner.tip, Arc::clone(&tx), &accept_ctx)
                .is_err()
            {
                inner.mempool.remove(&tx, true);
            }
        }
        for (block, txids) in &connected {
            for (tx, txid) in block.transactions.iter().zip(txids) {
                inner.mempool.remove(tx, false);
                inner.mempool.remove_conflicts(tx);
                inner.events.push(ChainEvent::Transaction {
                    txid: *txid,
                    tx: Arc::new(tx.clone()),
                    block: Some(Arc::clone(block)),
                });
            }
        }
        let stale = if disconnect.is_empty() {
            Vec::new()
        } else {
            inner.mempool.remove_unavailable(
                &inner.tip,
                inner.tree.best_height().saturating_add(1),
                self.params.consensus.coinbase_maturity,
            )?
        };
        for tx in &stale {
            log_category!(
                Category::Mempool,
                "removed {} after reorganize: inputs no longer available",
                hash256_to_hex(&tx.txid())
            );
        }

        let best = inner.tree.get(target);
        inner.events.push(ChainEvent::BestChain(best.hash));
        log_info!(
            "new best={} height={} log2_work={:.8} tx={} date={} progress={:.6} ({}ms)",
            hash256_to_hex(&best.hash),
            best.height,
            work_log2(best.chain_work),
            best.chain_tx,
            best.time(),
            self.policies
                .checkpoints
                .verification_progress(best.chain_tx, best.time(), now),
            started.elapsed().as_millis()
        );
        Ok(TipChange::Done)
    }

    fn connect_context(&self) -> ConnectContext<'_> {
        ConnectContext {
            params: &self.params.consensus,
            rewards: self.policies.rewards.as_ref(),
            checkpoints: self.policies.checkpoints.as_ref(),
            queue: self.queue.as_ref(),
            adjusted_time: self.clock.adjusted_time(),
            genesis_hash: self.genesis_hash,
        }
    }

    fn file_info<'a>(
        &self,
        files: &'a mut BlobFiles,
        file: u32,
    ) -> Result<&'a mut BlockFileInfo, ChainStateError> {
        match files.infos.entry(file) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let info = self.db.file_info(file)?.unwrap_or_default();
                Ok(entry.insert(info))
            }
        }
    }

    fn persist_file_info(&self, files: &BlobFiles, file: u32) -> Result<(), ChainStateError> {
        let info = files.infos.get(&file).copied().unwrap_or_default();
        let mut batch = WriteBatch::new();
        self.db.put_file_info(&mut batch, file, &info);
        self.db.put_last_file(&mut batch, files.last_file);
        self.db
            .write(&batch)
            .map_err(|err| self.fatal("failed to write block file info", err))
    }

    /// Reserves `add_size` bytes for a block, rolling over to a new file when the current
    /// one would reach [`MAX_BLOCKFILE_SIZE`].
    fn find_block_pos(
        &self,
        files: &mut BlobFiles,
        add_size: u32,
        height: i32,
        time: u64,
        known: Option<BlobPos>,
    ) -> Result<BlobPos, ChainStateError> {
        let pos = match known {
            Some(pos) => {
                files.last_file = pos.file;
                pos
            }
            None => loop {
                let last = files.last_file;
                let info = *self.file_info(files, last)?;
                if u64::from(info.size) + u64::from(add_size) < u64::from(MAX_BLOCKFILE_SIZE) {
                    break BlobPos::new(last, info.size);
                }
                log_info!(
                    "leaving block file {}: {} blocks, heights {}..{}",
                    last,
                    info.blocks,
                    info.height_first,
                    info.height_last
                );
                self.flush_blob_files(files, true)?;
                files.last_file = last + 1;
            },
        };

        let info = self.file_info(files, pos.file)?;
        info.size = match known {
            Some(pos) => info.size.max(pos.offset.saturating_add(add_size)),
            None => info.size.saturating_add(add_size),
        };
        info.add_block(u32::try_from(height).unwrap_or_default(), time);
        let new_size = info.size;

        if known.is_none() {
            let chunk = u64::from(BLOCKFILE_CHUNK_SIZE);
            let old_chunks = (u64::from(pos.offset) + chunk - 1) / chunk;
            let new_chunks = (u64::from(new_size) + chunk - 1) / chunk;
            if new_chunks > old_chunks {
                check_disk_space(
                    self.blocks.dir(),
                    MIN_DISK_SPACE,
                    new_chunks * chunk - u64::from(pos.offset),
                )
                .map_err(|err| self.fatal("cannot store block", err))?;
            }
        }
        self.persist_file_info(files, pos.file)?;
        Ok(pos)
    }

    fn find_undo_pos(
        &self,
        files: &mut BlobFiles,
        file: u32,
        add_size: u32,
    ) -> Result<BlobPos, ChainStateError> {
        let info = self.file_info(files, file)?;
        let pos = BlobPos::new(file, info.undo_size);
        info.undo_size = info.undo_size.saturating_add(add_size);
        let new_size = info.undo_size;

        let chunk = u64::from(UNDOFILE_CHUNK_SIZE);
        let old_chunks = (u64::from(pos.offset) + chunk - 1) / chunk;
        let new_chunks = (u64::from(new_size) + chunk - 1) / chunk;
        if new_chunks > old_chunks {
            check_disk_space(
                self.undo.dir(),
                MIN_DISK_SPACE,
                new_chunks * chunk - u64::from(pos.offset),
            )
            .map_err(|err| self.fatal("cannot store undo data", err))?;
        }
        self.persist_file_info(files, file)?;
        Ok(pos)
    }

    /// Syncs the current block and undo files; `finalize` trims them to their used size.
    fn flush_blob_files(&self, files: &BlobFiles, finalize: bool) -> Result<(), ChainStateError> {
        let info = files
            .infos
            .get(&files.last_file)
            .copied()
            .unwrap_or_default();
        let (block_len, undo_len) = if finalize {
            (Some(info.size), Some(info.undo_size))
        } else {
            (None, None)
        };
        self.blocks
            .flush_file(files.last_file, block_len)
            .map_err(|err| self.fatal("failed to flush block file", err))?;
        self.undo
            .flush_file(files.last_file, undo_len)
            .map_err(|err| self.fatal("failed to flush undo file", err))?;
        Ok(())
    }

    fn read_block(&self, node: &BlockNode) -> Result<Block, ChainStateError> {
        let pos = node
            .data_pos
            .ok_or(ChainStateError::CorruptIndex("block data not available"))?;
        let block = Block::consensus_decode_from_slice(&self.blocks.read(pos)?)?;
        if block.hash() != node.hash {
            return Err(ChainStateError::CorruptIndex(
                "block on disk does not match its index entry",
            ));
        }
        Ok(block)
    }

    fn read_undo(&self, tree: &BlockTree, handle: BlockHandle) -> Result<BlockUndo, ChainStateError> {
        let pos = tree
            .get(handle)
            .undo_pos
            .ok_or(ChainStateError::CorruptIndex("undo data not available"))?;
        let parent_hash = tree
            .parent(handle)
            .map(|parent| tree.get(parent).hash)
            .unwrap_or([0u8; 32]);
        let payload = self.undo.read(pos)?;
        Ok(BlockUndo::decode_with_checksum(&payload, &parent_hash)?)
    }

    fn initial_download(&self, inner: &mut ChainInner<S>) -> bool {
        let Some(best) = inner.tree.best() else {
            return true;
        };
        if self.importing.load(Ordering::SeqCst)
            || self.reindexing.load(Ordering::SeqCst)
            || inner.tree.get(best).height < self.policies.checkpoints.total_blocks_estimate()
        {
            return true;
        }
        let now = self.clock.now();
        if inner.ibd_seen_best != Some(best) {
            inner.ibd_seen_best = Some(best);
            inner.ibd_seen_at = now;
        }
        now - inner.ibd_seen_at < IBD_TIP_STALL_SECS
            && inner.tree.get(best).time() < now - IBD_TIP_AGE_SECS
    }

    /// Whether the node is still catching up with the network.
    pub fn is_initial_block_download(&self) -> Result<bool, ChainStateError> {
        let mut guard = self.lock()?;
        Ok(self.initial_download(&mut guard))
    }

    pub fn set_importing(&self, importing: bool) {
        self.importing.store(importing, Ordering::SeqCst);
    }

    pub fn is_reindexing(&self) -> bool {
        self.reindexing.load(Ordering::SeqCst)
    }

    pub fn set_reindexing(&self, reindexing: bool) -> Result<(), ChainStateError> {
        self.db.set_reindexing(reindexing)?;
        self.reindexing.store(reindexing, Ordering::SeqCst);
        Ok(())
    }

    /// Validates a transaction for the pool. Transactions with unknown inputs are parked
    /// and retried when a parent is accepted.
    pub fn process_transaction(&self, tx: Transaction) -> Result<TxOutcome, MempoolError> {
        let internal = |err: ChainStateError| MempoolError::new(MempoolErrorKind::Internal, err.to_string());
        let mut guard = self.lock().map_err(internal)?;
        let inner = &mut *guard;
        let tx = Arc::new(tx);
        let txid = tx.txid();
        let ctx = self.accept_context(inner.tree.best_height(), true);

        let outcome = match inner.mempool.accept(&inner.tip, Arc::clone(&tx), &ctx) {
            Ok(_) => {
                inner.events.push(ChainEvent::Transaction {
                    txid,
                    tx,
                    block: None,
                });
                let mut orphans_accepted = Vec::new();
                let mut work = VecDeque::from([txid]);
                while let Some(parent) = work.pop_front() {
                    for orphan_id in inner.orphan_txs.dependents(&parent) {
                        let Some(orphan) = inner.orphan_txs.get(&orphan_id).cloned() else {
                            continue;
                        };
                        match inner.mempool.accept(&inner.tip, Arc::clone(&orphan), &ctx) {
                            Ok(_) => {
                                log_category!(
                                    Category::Orphan,
                                    "accepted orphan tx {}",
                                    hash256_to_hex(&orphan_id)
                                );
                                inner.orphan_txs.remove(&orphan_id);
                                inner.events.push(ChainEvent::Transaction {
                                    txid: orphan_id,
                                    tx: orphan,
                                    block: None,
                                });
                                orphans_accepted.push(orphan_id);
                                work.push_back(orphan_id);
                            }
                            Err(err) if err.kind == MempoolErrorKind::MissingInputs => {}
                            Err(err) => {
                                log_category!(
                                    Category::Orphan,
                                    "removed orphan tx {}: {}",
                                    hash256_to_hex(&orphan_id),
                                    err
                                );
                                inner.orphan_txs.remove(&orphan_id);
                            }
                        }
                    }
                }
                Ok(TxOutcome::Accepted {
                    txid,
                    orphans_accepted,
                })
            }
            Err(err) if err.kind == MempoolErrorKind::MissingInputs => {
                let size = tx.serialized_size();
                if let Some(evicted) = inner.orphan_txs.insert(txid, tx, size) {
                    if evicted > 0 {
                        log_category!(
                            Category::Orphan,
                            "orphan pool overflow, removed {} tx",
                            evicted
                        );
                    }
                }
                Ok(TxOutcome::Orphaned {
                    txid,
                    missing: err.missing_inputs,
                })
            }
            Err(err) => {
                log_debug!(
                    "{} was not accepted into the memory pool: {}",
                    hash256_to_hex(&txid),
                    err
                );
                Err(err)
            }
        };
        self.finish(guard);
        outcome
    }

    fn accept_context(&self, best_height: i32, limit_free: bool) -> AcceptContext<'_> {
        AcceptContext {
            best_height,
            adjusted_time: self.clock.adjusted_time(),
            now: self.clock.now(),
            require_standard: self.params.consensus.require_standard,
            coinbase_maturity: self.params.consensus.coinbase_maturity,
            limit_free,
            policy: &self.options.relay,
        }
    }

    /// Re-checks the last `depth` blocks of the active chain at `level`:
    /// 0 reads them, 1 runs the context-free checks, 2 verifies undo data, 3 disconnects
    /// them in memory, 4 reconnects them. The persistent coin view is never modified.
    pub fn verify_chain(&self, level: u32, depth: i32) -> Result<(), ChainStateError> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;
        let Some(best) = inner.tree.best() else {
            return Ok(());
        };
        if inner.tree.parent(best).is_none() {
            return Ok(());
        }
        let best_height = inner.tree.get(best).height;
        let depth = if depth <= 0 || depth > best_height {
            best_height
        } else {
            depth
        };
        let level = level.min(4);
        log_info!("verifying last {} blocks at level {}", depth, level);

        let adjusted = self.clock.adjusted_time();
        let cache_limit = 2 * self.options.coin_cache_size + 32_000;
        let mut view = CoinCache::new(&mut inner.tip);
        let mut state = best;
        let mut failure: Option<i32> = None;
        let mut good_transactions = 0usize;

        let mut cursor = best;
        while let Some(parent) = inner.tree.parent(cursor) {
            if self.shutdown.is_requested() {
                return Err(ChainStateError::Interrupted);
            }
            let node = inner.tree.get(cursor);
            if node.height < best_height - depth {
                break;
            }
            let block = self.read_block(node).map_err(|err| {
                log_error!("verify: cannot read block at height {}: {}", node.height, err);
                err
            })?;
            if level >= 1 {
                check_block(&block, adjusted, &self.params.consensus, BlockCheck::FULL).map_err(
                    |err| {
                        log_error!("verify: bad block at height {}: {}", node.height, err);
                        ChainStateError::from(err)
                    },
                )?;
            }
            if level >= 2 && node.undo_pos.is_some() {
                self.read_undo(&inner.tree, cursor).map_err(|err| {
                    log_error!("verify: bad undo data at height {}: {}", node.height, err);
                    err
                })?;
            }
            if level >= 3 && cursor == state && view.len() + view.base().len() <= cache_limit {
                let undo = self.read_undo(&inner.tree, cursor)?;
                let clean = disconnect_block(&mut view, &block, node.height, &undo)?;
                state = parent;
                if clean {
                    good_transactions += block.transactions.len();
                } else {
                    good_transactions = 0;
                    failure = Some(node.height);
                }
            }
            cursor = parent;
        }

        if let Some(height) = failure {
            log_error!(
                "verify: coin database inconsistencies found (last {} blocks, {} good transactions before that)",
                best_height - height + 1,
                good_transactions
            );
            return Err(ChainStateError::CorruptIndex(
                "coin database inconsistencies found",
            ));
        }

        if level >= 4 {
            let ctx = self.connect_context();
            while state != best {
                if self.shutdown.is_requested() {
                    return Err(ChainStateError::Interrupted);
                }
                let next = inner
                    .tree
                    .next(state)
                    .ok_or(ChainStateError::CorruptIndex("active chain link missing"))?;
                let node = inner.tree.get(next);
                let parent_node = inner.tree.get(state);
                let parent = ParentBlock {
                    height: parent_node.height,
                    bits: parent_node.bits(),
                    votes: &[],
                };
                let block = self.read_block(node)?;
                connect_block(&mut view, &block, node.height, Some(&parent), &ctx, false)
                    .map_err(|err| {
                        log_error!("verify: cannot reconnect block at height {}: {}", node.height, err);
                        err
                    })?;
                state = next;
            }
        }
        view.discard();

        log_info!(
            "no coin database inconsistencies in last {} blocks ({} transactions)",
            best_height - inner.tree.get(state).height,
            good_transactions
        );
        Ok(())
    }

    /// Feeds every well-framed block in `bytes` through block processing. With `file`,
    /// `bytes` is the content of that block file and accepted blocks are indexed in place
    /// instead of being written again. Returns how many blocks were processed.
    pub fn load_external_blocks(&self, bytes: &[u8], file: Option<u32>) -> Result<usize, ChainStateError> {
        let started = Instant::now();
        let was_importing = self.importing.swap(true, Ordering::SeqCst);
        let result = self.scan_external_blocks(bytes, file);
        self.importing.store(was_importing, Ordering::SeqCst);
        let loaded = result?;
        log_info!(
            "loaded {} blocks from external file in {}ms",
            loaded,
            started.elapsed().as_millis()
        );
        Ok(loaded)
    }

    fn scan_external_blocks(&self, bytes: &[u8], file: Option<u32>) -> Result<usize, ChainStateError> {
        let start = match file {
            Some(file) => {
                let mut guard = self.lock()?;
                let indexed = self.file_info(&mut guard.files, file)?.size as usize;
                indexed.min(bytes.len())
            }
            None => 0,
        };
        let mut loaded = 0usize;
        for (offset, payload) in FrameScanner::with_start(bytes, self.params.message_start, start) {
            if self.shutdown.is_requested() {
                return Err(ChainStateError::Interrupted);
            }
            let block = match Block::consensus_decode_from_slice(payload) {
                Ok(block) => block,
                Err(err) => {
                    log_debug!("skipping undecodable block at offset {}: {}", offset, err);
                    continue;
                }
            };
            let known = file.map(|file| BlobPos::new(file, offset));
            let mut guard = self.lock()?;
            let outcome = self.process_block_locked(&mut guard, block, known);
            self.finish(guard);
            match outcome {
                Ok(_) => loaded += 1,
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => log_debug!("imported block at offset {} rejected: {}", offset, err),
            }
        }
        Ok(loaded)
    }

    /// Whether an announced item is already known and need not be requested.
    pub fn already_have(&self, inventory: &Inventory) -> Result<bool, ChainStateError> {
        let guard = self.lock()?;
        match inventory {
            Inventory::Tx(txid) => Ok(guard.mempool.contains(txid)
                || guard.orphan_txs.contains(txid)
                || guard.tip.have_coins(txid)?),
            Inventory::Block(hash) => {
                Ok(guard.tree.contains(hash) || guard.orphan_blocks.contains(hash))
            }
        }
    }

    /// Looks a transaction up in the pool, then in the transaction index.
    pub fn transaction(&self, txid: &Hash256) -> Result<Option<LocatedTransaction>, ChainStateError> {
        let guard = self.lock()?;
        if let Some(entry) = guard.mempool.get(txid) {
            return Ok(Some(LocatedTransaction {
                tx: Arc::clone(&entry.tx),
                block: None,
            }));
        }
        if !guard.txindex {
            return Ok(None);
        }
        drop(guard);
        let Some(location) = self.tx_index.get(txid)? else {
            return Ok(None);
        };
        let payload = self.blocks.read(location.block)?;
        let header = BlockHeader::consensus_decode(&mut Decoder::new(&payload))?;
        let offset = location.tx_offset as usize;
        if offset >= payload.len() {
            return Err(ChainStateError::CorruptIndex("transaction offset past block end"));
        }
        let tx = Transaction::consensus_decode(&mut Decoder::new(&payload[offset..]))?;
        if tx.txid() != *txid {
            return Err(ChainStateError::CorruptIndex("transaction index points at another transaction"));
        }
        Ok(Some(LocatedTransaction {
            tx: Arc::new(tx),
            block: Some(header.hash()),
        }))
    }

    /// Writes the coin cache and syncs the open block files.
    pub fn flush(&self) -> Result<(), ChainStateError> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;
        self.flush_blob_files(&inner.files, false)?;
        inner
            .tip
            .flush()
            .map_err(|err| self.fatal("failed to write to coin database", err))
    }

    fn next_parent(&self, inner: &ChainInner<S>) -> Result<(i32, u32, Option<Block>), ChainStateError> {
        let best = inner
            .tree
            .best_node()
            .ok_or(ChainStateError::CorruptIndex("no best chain"))?;
        let block = if self.policies.rewards.validates_votes(best.height + 1) {
            Some(self.read_block(best)?)
        } else {
            None
        };
        Ok((best.height, best.bits(), block))
    }

    /// Largest coinbase value a block on the current tip may pay while collecting `fees`.
    pub fn next_block_value(&self, fees: Amount) -> Result<Amount, ChainStateError> {
        let guard = self.lock()?;
        let (height, bits, _) = self.next_parent(&guard)?;
        let parent = ParentBlock {
            height,
            bits,
            votes: &[],
        };
        Ok(self.policies.rewards.coinbase_value_ceiling(&parent, fees))
    }

    /// Extra payees and vote records a block on the current tip must carry.
    pub fn coinbase_plan(&self, coinbase_value: Amount) -> Result<CoinbasePlan, ChainStateError> {
        let guard = self.lock()?;
        let (height, bits, block) = self.next_parent(&guard)?;
        let parent = ParentBlock {
            height,
            bits,
            votes: block.as_ref().map_or(&[][..], |block| block.votes.as_slice()),
        };
        Ok(self.policies.rewards.mandatory_payees(&parent, coinbase_value))
    }

    /// Bits a block on the current tip must carry at `time`.
    pub fn next_work_required(&self, time: i64) -> Result<u32, ChainStateError> {
        let guard = self.lock()?;
        let history = match guard.tree.best() {
            Some(best) => guard
                .tree
                .header_infos(best, self.policies.difficulty.lookback()),
            None => Vec::new(),
        };
        Ok(self.policies.difficulty.next_work_required(&history, time)?)
    }

    pub fn tip(&self) -> Result<Option<TipInfo>, ChainStateError> {
        let guard = self.lock()?;
        Ok(guard.tree.best_node().map(|node| TipInfo {
            hash: node.hash,
            height: node.height,
            chain_work: node.chain_work,
            chain_tx: node.chain_tx,
            time: node.time(),
        }))
    }

    pub fn best_hash(&self) -> Result<Option<Hash256>, ChainStateError> {
        Ok(self.lock()?.tree.best_node().map(|node| node.hash))
    }

    pub fn best_height(&self) -> Result<i32, ChainStateError> {
        Ok(self.lock()?.tree.best_height())
    }

    /// Hash of the active-chain block at `height`.
    pub fn hash_at(&self, height: i32) -> Result<Option<Hash256>, ChainStateError> {
        let guard = self.lock()?;
        Ok(guard
            .tree
            .active_at(height)
            .map(|handle| guard.tree.get(handle).hash))
    }

    pub fn block_status(&self, hash: &Hash256) -> Result<Option<u32>, ChainStateError> {
        let guard = self.lock()?;
        Ok(guard
            .tree
            .lookup(hash)
            .map(|handle| guard.tree.get(handle).status))
    }

    pub fn read_block_by_hash(&self, hash: &Hash256) -> Result<Option<Block>, ChainStateError> {
        let guard = self.lock()?;
        let Some(handle) = guard.tree.lookup(hash) else {
            return Ok(None);
        };
        self.read_block(guard.tree.get(handle)).map(Some)
    }

    /// Unspent outputs of `txid` at the current tip.
    pub fn coins(&self, txid: &Hash256) -> Result<Option<CoinRecord>, ChainStateError> {
        Ok(self.lock()?.tip.coins(txid)?)
    }

    pub fn mempool_contains(&self, txid: &Hash256) -> Result<bool, ChainStateError> {
        Ok(self.lock()?.mempool.contains(txid))
    }

    pub fn mempool_len(&self) -> Result<usize, ChainStateError> {
        Ok(self.lock()?.mempool.len())
    }

    pub fn mempool_txids(&self) -> Result<Vec<Hash256>, ChainStateError> {
        Ok(self.lock()?.mempool.txids())
    }

    /// Bumped whenever the pool changes.
    pub fn mempool_generation(&self) -> Result<u64, ChainStateError> {
        Ok(self.lock()?.mempool.generation())
    }

    /// Lowest parked block of the orphan chain containing `hash`.
    pub fn orphan_root(&self, hash: &Hash256) -> Result<Option<Hash256>, ChainStateError> {
        Ok(self.lock()?.orphan_blocks.root_block(hash))
    }

    pub fn orphan_block_count(&self) -> Result<usize, ChainStateError> {
        Ok(self.lock()?.orphan_blocks.len())
    }

    pub fn orphan_tx_count(&self) -> Result<usize, ChainStateError> {
        Ok(self.lock()?.orphan_txs.len())
    }
}

/// Base-2 logarithm of accumulated work, for logs.
fn work_log2(work: U256) -> f64 {
    if work.is_zero() {
        return 0.0;
    }
    let shift = work.bits().saturating_sub(64);
    let top = (work >> shift).low_u64() as f64;
    top.log2() + shift as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_log2_tracks_magnitude() {
        assert_eq!(work_log2(U256::zero()), 0.0);
        assert!((work_log2(U256::from(1024u32)) - 10.0).abs() < 1e-9);
        assert!((work_log2(U256::one() << 200) - 200.0).abs() < 1e-9);
    }

    #[test]
    fn shutdown_keeps_first_reason() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_requested());
        let shared = signal.clone();
        shared.request("disk full");
        signal.request("ctrl-c");
        assert!(signal.is_requested());
        assert_eq!(signal.reason().as_deref(), Some("disk full"));
    }

    #[test]
    fn fixed_clock_moves_on_request() {
        let clock = FixedClock::new(1_000);
        clock.advance(30);
        assert_eq!(clock.now(), 1_030);
        clock.set(5);
        assert_eq!(clock.adjusted_time(), 5);
    }
}
