mod common;

use std::sync::{Arc, Mutex};

use vcoin_chainstate::mempool::MempoolErrorKind;
use vcoin_chainstate::state::{ChainListener, Inventory, TxOutcome};
use vcoin_consensus::money::{CENT, COIN};
use vcoin_consensus::Hash256;
use vcoin_primitives::{Block, OutPoint, Transaction};

use common::{spend, TestChain};

/// A chain 18 blocks high whose coinbases at heights 17 and 18 each hold one coin.
fn funded_chain() -> (TestChain, Vec<Block>) {
    let chain = TestChain::new(1);
    let blocks = chain.extend(18, 1);
    (chain, blocks)
}

fn funding(blocks: &[Block], height: usize) -> OutPoint {
    OutPoint::new(blocks[height - 1].transactions[0].txid(), 0)
}

#[test]
fn first_spender_wins() {
    let (chain, blocks) = funded_chain();
    let first = spend(funding(&blocks, 17), &[COIN - CENT]);
    let second = spend(funding(&blocks, 17), &[COIN - 2 * CENT]);

    chain.chain.process_transaction(first.clone()).expect("first");
    let err = chain
        .chain
        .process_transaction(second)
        .expect_err("conflict");
    assert_eq!(err.kind, MempoolErrorKind::Conflict);
    assert_eq!(chain.chain.mempool_txids().expect("txids"), vec![first.txid()]);

    let again = chain
        .chain
        .process_transaction(first)
        .expect_err("already known");
    assert_eq!(again.kind, MempoolErrorKind::AlreadyKnown);
}

#[test]
fn rejected_conflict_stays_out_after_the_winner_leaves() {
    let (chain, blocks) = funded_chain();
    let first = spend(funding(&blocks, 17), &[COIN - CENT]);
    let second = spend(funding(&blocks, 17), &[COIN - 2 * CENT]);
    let mined = spend(funding(&blocks, 17), &[COIN - 3 * CENT]);

    chain.chain.process_transaction(first.clone()).expect("first");
    let err = chain
        .chain
        .process_transaction(second.clone())
        .expect_err("conflict");
    assert_eq!(err.kind, MempoolErrorKind::Conflict);

    // A third spender confirms and evicts the first from the pool.
    chain.mine(vec![mined], 2);
    assert!(!chain.chain.mempool_contains(&first.txid()).expect("pool"));
    assert!(!chain.chain.mempool_contains(&second.txid()).expect("pool"));
    assert_eq!(chain.chain.mempool_len().expect("len"), 0);
    assert_eq!(chain.chain.orphan_tx_count().expect("orphans"), 0);
    assert!(!chain
        .chain
        .already_have(&Inventory::Tx(second.txid()))
        .expect("inventory"));
}

#[test]
fn dust_without_fee_is_refused() {
    let (chain, blocks) = funded_chain();
    let tx = spend(funding(&blocks, 17), &[COIN - 500, 100]);
    let err = chain.chain.process_transaction(tx).expect_err("fee");
    assert_eq!(err.kind, MempoolErrorKind::InsufficientFee);
    assert_eq!(chain.chain.mempool_len().expect("len"), 0);
}

#[test]
fn immature_coinbase_spend_is_refused() {
    let chain = TestChain::new(5);
    let blocks = chain.extend(18, 1);
    let tx = spend(funding(&blocks, 17), &[COIN - CENT]);
    let err = chain.chain.process_transaction(tx).expect_err("premature");
    assert_eq!(err.kind, MempoolErrorKind::Invalid);
    assert!(err.message.contains("premature"));
}

#[test]
fn orphan_transactions_wait_for_their_parent() {
    let (chain, blocks) = funded_chain();
    let parent = spend(funding(&blocks, 17), &[COIN - CENT]);
    let child = spend(OutPoint::new(parent.txid(), 0), &[COIN - 2 * CENT]);
    let grandchild = spend(OutPoint::new(child.txid(), 0), &[COIN - 3 * CENT]);

    match chain.chain.process_transaction(child.clone()).expect("park") {
        TxOutcome::Orphaned { txid, missing } => {
            assert_eq!(txid, child.txid());
            assert_eq!(missing, vec![OutPoint::new(parent.txid(), 0)]);
        }
        other => panic!("expected an orphan, got {other:?}"),
    }
    chain.chain.process_transaction(grandchild.clone()).expect("park");
    assert_eq!(chain.chain.orphan_tx_count().expect("orphans"), 2);
    assert!(chain
        .chain
        .already_have(&Inventory::Tx(child.txid()))
        .expect("inventory"));

    assert_eq!(
        chain.chain.process_transaction(parent.clone()).expect("accept"),
        TxOutcome::Accepted {
            txid: parent.txid(),
            orphans_accepted: vec![child.txid(), grandchild.txid()],
        }
    );
    assert_eq!(chain.chain.orphan_tx_count().expect("orphans"), 0);
    assert_eq!(chain.chain.mempool_len().expect("len"), 3);
}

#[test]
fn confirmed_block_evicts_pool_conflicts() {
    let (chain, blocks) = funded_chain();
    let pooled = spend(funding(&blocks, 17), &[COIN - CENT]);
    let mined = spend(funding(&blocks, 17), &[COIN - 2 * CENT]);
    let unrelated = spend(funding(&blocks, 18), &[COIN - CENT]);

    chain.chain.process_transaction(pooled.clone()).expect("pooled");
    chain.chain.process_transaction(unrelated.clone()).expect("unrelated");
    let generation = chain.chain.mempool_generation().expect("generation");

    chain.mine(vec![mined.clone()], 2);
    assert!(!chain.chain.mempool_contains(&pooled.txid()).expect("pool"));
    assert!(chain.chain.mempool_contains(&unrelated.txid()).expect("pool"));
    assert!(chain.chain.mempool_generation().expect("generation") > generation);
    assert!(chain.chain.coins(&mined.txid()).expect("coins").is_some());
    assert!(chain
        .chain
        .already_have(&Inventory::Tx(mined.txid()))
        .expect("inventory"));
}

#[test]
fn pool_lookup_reports_no_block() {
    let (chain, blocks) = funded_chain();
    let tx = spend(funding(&blocks, 18), &[COIN - CENT]);
    chain.chain.process_transaction(tx.clone()).expect("accept");

    let found = chain
        .chain
        .transaction(&tx.txid())
        .expect("lookup")
        .expect("pooled");
    assert_eq!(*found.tx, tx);
    assert_eq!(found.block, None);
    // Without the index, confirmed transactions are not retrievable.
    assert!(chain
        .chain
        .transaction(&blocks[3].transactions[0].txid())
        .expect("lookup")
        .is_none());
}

#[derive(Default)]
struct Recorder {
    txs: Mutex<Vec<(Hash256, Option<Hash256>)>>,
    tips: Mutex<Vec<Hash256>>,
}

impl ChainListener for Recorder {
    fn sync_transaction(&self, txid: &Hash256, _tx: &Transaction, block: Option<&Block>) {
        self.txs
            .lock()
            .expect("lock")
            .push((*txid, block.map(Block::hash)));
    }

    fn set_best_chain(&self, tip: &Hash256) {
        self.tips.lock().expect("lock").push(*tip);
    }
}

#[test]
fn listeners_see_pool_and_chain_updates() {
    let (chain, blocks) = funded_chain();
    let recorder = Arc::new(Recorder::default());
    chain.chain.add_listener(recorder.clone()).expect("listener");

    let tx = spend(funding(&blocks, 17), &[COIN - CENT]);
    chain.chain.process_transaction(tx.clone()).expect("accept");
    let block = chain.mine(vec![tx.clone()], 3);

    let txs = recorder.txs.lock().expect("lock").clone();
    assert_eq!(txs.first(), Some(&(tx.txid(), None)));
    assert!(txs.contains(&(tx.txid(), Some(block.hash()))));
    assert!(txs.contains(&(block.transactions[0].txid(), Some(block.hash()))));
    assert_eq!(recorder.tips.lock().expect("lock").last(), Some(&block.hash()));
}
