//! Block validation, the coin set, the block index, and the transaction memory pool.

pub mod blobs;
pub mod blocktree;
pub mod checkqueue;
pub mod coins;
pub mod connect;
pub mod genesis;
pub mod index;
pub mod inputs;
pub mod mempool;
pub mod orphans;
pub mod policy;
pub mod rewards;
pub mod state;
pub mod txindex;
pub mod undo;
pub mod validation;
