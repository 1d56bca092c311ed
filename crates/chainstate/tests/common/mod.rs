#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;
use vcoin_chainstate::state::{BlockOutcome, ChainState, ChainStateOptions, Clock, FixedClock};
use vcoin_chainstate::validation::merkle_root;
use vcoin_consensus::money::{Amount, COIN};
use vcoin_consensus::params::{chain_params, ChainParams, Network};
use vcoin_consensus::{block_value, Hash256};
use vcoin_pow::check_proof_of_work;
use vcoin_primitives::{Block, BlockHeader, OutPoint, Transaction, TxIn, TxOut, SEQUENCE_FINAL};
use vcoin_storage::memory::MemoryStore;

pub const BITS: u32 = 0x207f_ffff;

pub fn regtest(maturity: i32) -> ChainParams {
    let mut params = chain_params(Network::Regtest);
    params.consensus.coinbase_maturity = maturity;
    params
}

pub fn block_time(params: &ChainParams, height: i32) -> u32 {
    params.consensus.genesis.time + height as u32 * 60
}

/// The most a regtest coinbase at `height` may pay without fees, capped at one coin.
pub fn reward(height: i32) -> Amount {
    block_value(BITS, height - 1, 0, false).min(COIN)
}

pub fn coinbase(height: i32, value: Amount, tag: u8) -> Transaction {
    let mut script_sig = (height as u32).to_le_bytes().to_vec();
    script_sig.push(tag);
    Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig,
            sequence: SEQUENCE_FINAL,
        }],
        vout: vec![TxOut::new(value, vec![0x51])],
        lock_time: 0,
    }
}

pub fn spend(prevout: OutPoint, outputs: &[Amount]) -> Transaction {
    Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout,
            script_sig: Vec::new(),
            sequence: SEQUENCE_FINAL,
        }],
        vout: outputs
            .iter()
            .map(|value| TxOut::new(*value, vec![0x51]))
            .collect(),
        lock_time: 0,
    }
}

/// Fills in the merkle root and grinds the nonce until the header meets its target.
pub fn solve(params: &ChainParams, block: &mut Block) {
    block.header.merkle_root = merkle_root(&block.txids());
    while check_proof_of_work(&block.hash(), block.header.bits, &params.consensus).is_err() {
        block.header.nonce += 1;
    }
}

pub fn build_block_paying(
    params: &ChainParams,
    prev: Hash256,
    height: i32,
    tag: u8,
    coinbase_value: Amount,
    txs: Vec<Transaction>,
) -> Block {
    let mut transactions = vec![coinbase(height, coinbase_value, tag)];
    transactions.extend(txs);
    let mut block = Block {
        header: BlockHeader {
            version: 1,
            prev_block: prev,
            merkle_root: [0u8; 32],
            time: block_time(params, height),
            bits: BITS,
            nonce: 0,
        },
        transactions,
        votes: Vec::new(),
    };
    solve(params, &mut block);
    block
}

pub fn build_block(
    params: &ChainParams,
    prev: Hash256,
    height: i32,
    tag: u8,
    txs: Vec<Transaction>,
) -> Block {
    build_block_paying(params, prev, height, tag, reward(height), txs)
}

pub struct TestChain {
    pub params: ChainParams,
    pub store: Arc<MemoryStore>,
    pub clock: Arc<FixedClock>,
    pub dir: TempDir,
    pub chain: ChainState<MemoryStore>,
}

impl TestChain {
    pub fn new(maturity: i32) -> Self {
        Self::with_options(maturity, ChainStateOptions::default())
    }

    pub fn with_options(maturity: i32, options: ChainStateOptions) -> Self {
        Self::configured(maturity, options, |chain| chain)
    }

    /// Like [`TestChain::with_options`], letting `configure` adjust the chain state before
    /// it loads.
    pub fn configured(
        maturity: i32,
        options: ChainStateOptions,
        configure: impl FnOnce(ChainState<MemoryStore>) -> ChainState<MemoryStore>,
    ) -> Self {
        let params = regtest(maturity);
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(FixedClock::new(
            i64::from(params.consensus.genesis.time) + 50_000,
        ));
        let dir = tempfile::tempdir().expect("tempdir");
        let chain = configure(open_chain(
            &params,
            Arc::clone(&store),
            dir.path(),
            options,
            &clock,
        ));
        chain.load().expect("load");
        assert!(chain.init_genesis().expect("genesis"));
        Self {
            params,
            store,
            clock,
            dir,
            chain,
        }
    }

    /// A second chain state over the same database and block files.
    pub fn reopen(&self, options: ChainStateOptions) -> ChainState<MemoryStore> {
        let chain = open_chain(
            &self.params,
            Arc::clone(&self.store),
            self.dir.path(),
            options,
            &self.clock,
        );
        chain.load().expect("load");
        chain
    }

    pub fn tip(&self) -> (Hash256, i32) {
        let tip = self.chain.tip().expect("tip").expect("best block");
        (tip.hash, tip.height)
    }

    /// Mines `count` blocks on the current tip and feeds them in.
    pub fn extend(&self, count: usize, tag: u8) -> Vec<Block> {
        let mut mined = Vec::with_capacity(count);
        for _ in 0..count {
            let (prev, height) = self.tip();
            let block = build_block(&self.params, prev, height + 1, tag, Vec::new());
            let outcome = self.chain.process_block(block.clone()).expect("accept block");
            assert_eq!(outcome, BlockOutcome::Accepted { hash: block.hash() });
            mined.push(block);
        }
        mined
    }

    /// Mines one block holding `txs` on the current tip.
    pub fn mine(&self, txs: Vec<Transaction>, tag: u8) -> Block {
        let (prev, height) = self.tip();
        let block = build_block(&self.params, prev, height + 1, tag, txs);
        self.chain.process_block(block.clone()).expect("accept block");
        block
    }
}

pub fn open_chain(
    params: &ChainParams,
    store: Arc<MemoryStore>,
    dir: &Path,
    options: ChainStateOptions,
    clock: &Arc<FixedClock>,
) -> ChainState<MemoryStore> {
    let clock: Arc<dyn Clock> = clock.clone();
    ChainState::open(params.clone(), store, dir, options)
        .expect("open chain state")
        .with_clock(clock)
}
