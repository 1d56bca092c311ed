use std::sync::Arc;

use vcoin_chainstate::state::{ChainState, ChainStateOptions};
use vcoin_chainstate::validation::merkle_root;
use vcoin_consensus::params::{chain_params, ChainParams, Network};
use vcoin_consensus::Hash256;
use vcoin_node::import::{block_file_path, import_files, reindex_block_files};
use vcoin_pow::check_proof_of_work;
use vcoin_primitives::{Block, BlockHeader, OutPoint, Transaction, TxIn, TxOut, SEQUENCE_FINAL};
use vcoin_storage::memory::MemoryStore;

/// A regtest block with a zero-value coinbase, which every regtest height allows.
fn mine(params: &ChainParams, prev: Hash256, height: i32) -> Block {
    let coinbase = Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig: (height as u32).to_le_bytes().to_vec(),
            sequence: SEQUENCE_FINAL,
        }],
        vout: vec![TxOut::new(0, vec![0x51])],
        lock_time: 0,
    };
    let mut block = Block {
        header: BlockHeader {
            version: 1,
            prev_block: prev,
            merkle_root: [0u8; 32],
            time: params.consensus.genesis.time + height as u32 * 60,
            bits: params.consensus.genesis.bits,
            nonce: 0,
        },
        transactions: vec![coinbase],
        votes: Vec::new(),
    };
    block.header.merkle_root = merkle_root(&block.txids());
    while check_proof_of_work(&block.hash(), block.header.bits, &params.consensus).is_err() {
        block.header.nonce += 1;
    }
    block
}

fn open(params: &ChainParams, dir: &std::path::Path) -> ChainState<MemoryStore> {
    let chain = ChainState::open(
        params.clone(),
        Arc::new(MemoryStore::new()),
        dir,
        ChainStateOptions::default(),
    )
    .expect("open");
    chain.load().expect("load");
    chain
}

#[test]
fn reindex_replays_block_files_into_an_empty_index() {
    let params = chain_params(Network::Regtest);
    let dir = tempfile::tempdir().expect("tempdir");

    let source = open(&params, dir.path());
    assert!(source.init_genesis().expect("genesis"));
    let mut prev = source.genesis_hash();
    for height in 1..=3 {
        let block = mine(&params, prev, height);
        prev = block.hash();
        source.process_block(block).expect("accept");
    }
    source.flush().expect("flush");
    drop(source);
    assert!(block_file_path(dir.path(), 0).exists());

    let rebuilt = open(&params, dir.path());
    rebuilt.set_reindexing(true).expect("flag");
    assert!(!rebuilt.init_genesis().expect("genesis"));

    let loaded = reindex_block_files(&rebuilt, dir.path()).expect("reindex");
    assert_eq!(loaded, 4);
    assert!(!rebuilt.is_reindexing());
    assert_eq!(rebuilt.best_hash().expect("best"), Some(prev));
    assert_eq!(rebuilt.best_height().expect("height"), 3);
}

#[test]
fn unreadable_import_files_are_skipped() {
    let params = chain_params(Network::Regtest);
    let dir = tempfile::tempdir().expect("tempdir");
    let chain = open(&params, dir.path());
    assert!(chain.init_genesis().expect("genesis"));

    let block = mine(&params, chain.genesis_hash(), 1);
    let payload = block.consensus_encode_to_vec();
    let mut framed = params.message_start.to_vec();
    framed.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    framed.extend_from_slice(&payload);
    let bootstrap = dir.path().join("bootstrap.dat");
    std::fs::write(&bootstrap, framed).expect("write");

    let files = vec![dir.path().join("missing.dat"), bootstrap];
    assert_eq!(import_files(&chain, &files).expect("import"), 1);
    assert_eq!(chain.best_hash().expect("best"), Some(block.hash()));
}
