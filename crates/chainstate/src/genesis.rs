//! The hardcoded first block of each network.

use vcoin_consensus::params::{ConsensusParams, HexError};
use vcoin_primitives::{Block, BlockHeader, OutPoint, Transaction, TxIn, TxOut, SEQUENCE_FINAL};
use vcoin_script::opcodes::{push_data, OP_CHECKSIG};

use crate::validation::merkle_root;

/// Compact bits 0x1d00ffff as a script number, as the first coinbase pushed them.
const GENESIS_SCRIPT_BITS: [u8; 4] = [0xff, 0xff, 0x00, 0x1d];

fn decode_hex(input: &str) -> Result<Vec<u8>, HexError> {
    if input.len() % 2 != 0 {
        return Err(HexError::InvalidLength);
    }
    (0..input.len())
        .step_by(2)
        .map(|start| u8::from_str_radix(&input[start..start + 2], 16).map_err(|_| HexError::InvalidHex))
        .collect()
}

pub fn genesis_block(params: &ConsensusParams) -> Result<Block, HexError> {
    let genesis = &params.genesis;

    let mut script_sig = push_data(&GENESIS_SCRIPT_BITS);
    script_sig.extend(push_data(&[4]));
    script_sig.extend(push_data(genesis.timestamp.as_bytes()));

    let mut script_pubkey = push_data(&decode_hex(genesis.output_pubkey)?);
    script_pubkey.push(OP_CHECKSIG);

    let coinbase = Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig,
            sequence: SEQUENCE_FINAL,
        }],
        vout: vec![TxOut::new(genesis.output_value, script_pubkey)],
        lock_time: 0,
    };
    let merkle = merkle_root(&[coinbase.txid()]);
    Ok(Block {
        header: BlockHeader {
            version: genesis.version,
            prev_block: [0u8; 32],
            merkle_root: merkle,
            time: genesis.time,
            bits: genesis.bits,
            nonce: genesis.nonce,
        },
        transactions: vec![coinbase],
        votes: Vec::new(),
    })
}
