//! Consensus-wide constants shared across validation.

/// The maximum allowed size for a serialized block, in bytes (network rule).
pub const MAX_BLOCK_SIZE: u32 = 1_000_000;
/// The maximum size a locally assembled block may reach.
pub const MAX_BLOCK_SIZE_GEN: u32 = MAX_BLOCK_SIZE / 2;
/// The maximum allowed number of signature check operations in a block (network rule).
pub const MAX_BLOCK_SIGOPS: u32 = MAX_BLOCK_SIZE / 50;
/// Transactions above this size are never relayed.
pub const MAX_STANDARD_TX_SIZE: u32 = MAX_BLOCK_SIZE_GEN / 5;
/// Bytes of a block reserved for high-priority transactions; also the free-relay size bound.
pub const DEFAULT_BLOCK_PRIORITY_SIZE: u32 = 27_000;
/// Upper bound on the number of parked orphan transactions.
pub const MAX_ORPHAN_TRANSACTIONS: usize = (MAX_BLOCK_SIZE / 100) as usize;
/// Orphan transactions larger than this are dropped instead of parked.
pub const MAX_ORPHAN_TX_SIZE: usize = 5_000;
/// Coinbase transaction outputs can only be spent after this number of new blocks.
pub const COINBASE_MATURITY: i32 = 100;
/// Lock times below this are block heights, at or above it unix timestamps.
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;
/// Blocks more than this many seconds ahead of adjusted time are rejected.
pub const MAX_FUTURE_BLOCK_TIME: i64 = 2 * 60 * 60;
/// Drift tolerated once strict block timestamps apply.
pub const STRICT_TIME_DRIFT: i64 = 15 * 60;
/// Number of ancestors used for the median-time-past rule.
pub const MEDIAN_TIME_SPAN: usize = 11;
/// Height of the synthetic coin records produced for unconfirmed transactions.
pub const MEMPOOL_HEIGHT: u32 = 0x7fff_ffff;
/// Only transactions of this version or lower are standard.
pub const CURRENT_TX_VERSION: i32 = 1;
/// Maximum script size (consensus).
pub const MAX_SCRIPT_SIZE: usize = 10_000;
/// Standard scriptSig size limit.
pub const MAX_STANDARD_SCRIPTSIG_SIZE: usize = 500;
/// Pay-to-script-hash is enforced for blocks at or after this timestamp.
pub const BIP16_SWITCH_TIME: u32 = 1_349_049_600;

/// Fee per kilobyte charged to transactions entering a block.
pub const MIN_TX_FEE: i64 = 1_000;
/// Fee per kilobyte required for relay.
pub const MIN_RELAY_TX_FEE: i64 = 1_000;
/// Outputs below this value pay an extra base fee each.
pub const DUST_SOFT_LIMIT: i64 = 100_000;
/// Outputs below this value are considered dust.
pub const DUST_HARD_LIMIT: i64 = 1_000;
/// Free transactions smaller than this are always waived when sending.
pub const FREE_SEND_SIZE: u32 = 5_000;
/// Default allowance for the free transaction limiter, in thousands of bytes per minute.
pub const DEFAULT_LIMIT_FREE_RELAY: u32 = 15;

/// Free disk space required before writing blocks or coin state.
pub const MIN_DISK_SPACE: u64 = 52_428_800;
/// Blob files roll over once they reach this size.
pub const MAX_BLOCKFILE_SIZE: u32 = 0x0800_0000;
/// Preallocation chunk for block files.
pub const BLOCKFILE_CHUNK_SIZE: u32 = 0x0100_0000;
/// Preallocation chunk for undo files.
pub const UNDOFILE_CHUNK_SIZE: u32 = 0x0010_0000;
/// Script checks handed to a worker in one batch.
pub const SCRIPT_CHECK_BATCH: usize = 128;
/// Upper bound on script verification threads.
pub const MAX_SCRIPTCHECK_THREADS: usize = 16;
/// Default number of cached coin records kept before a forced flush.
pub const DEFAULT_COIN_CACHE_SIZE: usize = 5_000;
