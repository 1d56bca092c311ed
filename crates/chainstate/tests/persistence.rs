mod common;

use std::sync::Arc;

use vcoin_chainstate::state::{BlockOutcome, ChainStateOptions};
use vcoin_consensus::money::{CENT, COIN};
use vcoin_primitives::OutPoint;
use vcoin_storage::memory::MemoryStore;

use common::{build_block, open_chain, spend, TestChain};

#[test]
fn verify_chain_accepts_a_consistent_chain() {
    let chain = TestChain::new(1);
    let blocks = chain.extend(12, 1);
    let tip = chain.tip();

    chain.chain.verify_chain(4, 0).expect("full verification");
    chain.chain.verify_chain(3, 5).expect("shallow verification");
    chain.chain.verify_chain(9, 100).expect("clamped verification");

    assert_eq!(chain.tip(), tip);
    assert!(chain
        .chain
        .coins(&blocks[11].transactions[0].txid())
        .expect("coins")
        .is_some());
}

#[test]
fn reopened_state_resumes_from_the_database() {
    let chain = TestChain::new(1);
    chain.extend(6, 1);
    chain.chain.flush().expect("flush");
    let (tip, height) = chain.tip();

    let reopened = chain.reopen(ChainStateOptions::default());
    assert_eq!(reopened.best_hash().expect("best"), Some(tip));
    assert_eq!(reopened.best_height().expect("height"), height);
    assert!(!reopened.init_genesis().expect("genesis"));

    let next = build_block(&chain.params, tip, height + 1, 4, Vec::new());
    assert_eq!(
        reopened.process_block(next.clone()).expect("extend"),
        BlockOutcome::Accepted { hash: next.hash() }
    );
    assert_eq!(
        reopened.read_block_by_hash(&next.hash()).expect("read"),
        Some(next)
    );
}

#[test]
fn transaction_index_locates_confirmed_transactions() {
    let options = ChainStateOptions {
        txindex: true,
        ..ChainStateOptions::default()
    };
    let chain = TestChain::with_options(1, options);
    let blocks = chain.extend(18, 1);
    let funding = OutPoint::new(blocks[16].transactions[0].txid(), 0);
    let tx = spend(funding, &[COIN - CENT]);
    let block = chain.mine(vec![tx.clone()], 2);

    let found = chain
        .chain
        .transaction(&tx.txid())
        .expect("lookup")
        .expect("indexed");
    assert_eq!(*found.tx, tx);
    assert_eq!(found.block, Some(block.hash()));

    let coinbase = chain
        .chain
        .transaction(&blocks[4].transactions[0].txid())
        .expect("lookup")
        .expect("indexed");
    assert_eq!(coinbase.block, Some(blocks[4].hash()));
}

#[test]
fn reindex_rebuilds_the_index_from_block_files() {
    let chain = TestChain::new(1);
    chain.extend(5, 1);
    chain.chain.flush().expect("flush");
    let tip = chain.tip();

    let store = Arc::new(MemoryStore::new());
    let rebuilt = open_chain(
        &chain.params,
        store,
        chain.dir.path(),
        ChainStateOptions::default(),
        &chain.clock,
    );
    rebuilt.load().expect("load");
    rebuilt.set_reindexing(true).expect("flag");
    assert!(!rebuilt.init_genesis().expect("genesis"));
    assert_eq!(rebuilt.best_hash().expect("best"), None);

    let bytes = std::fs::read(chain.dir.path().join("blk00000.dat")).expect("block file");
    let loaded = rebuilt.load_external_blocks(&bytes, Some(0)).expect("reindex");
    assert_eq!(loaded, 6);
    rebuilt.set_reindexing(false).expect("flag");

    assert_eq!(rebuilt.best_hash().expect("best"), Some(tip.0));
    assert_eq!(rebuilt.best_height().expect("height"), tip.1);
    assert!(!rebuilt.init_genesis().expect("genesis"));
    rebuilt.verify_chain(3, 0).expect("verify");
}
