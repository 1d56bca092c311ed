//! Consensus parameter definitions.

use crate::constants::{BIP16_SWITCH_TIME, COINBASE_MATURITY};
use crate::money::{Amount, COIN};
use crate::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mainnet" | "main" => Some(Network::Mainnet),
            "testnet" | "test" => Some(Network::Testnet),
            "regtest" => Some(Network::Regtest),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ConsensusParams {
    pub network: Network,
    pub pow_limit: Hash256,
    pub pow_target_spacing: i64,
    pub pow_target_timespan: i64,
    /// Testnet rule: a block arriving more than twice the spacing late may use the limit.
    pub pow_allow_min_difficulty_blocks: bool,
    pub pow_no_retargeting: bool,
    /// Below this height a block's bits may differ from the required work by up to 20%.
    pub pow_tolerance_end_height: Option<i32>,
    /// From this height block times must stay within the strict drift window.
    pub strict_time_height: Option<i32>,
    pub p2sh_switch_time: u32,
    pub coinbase_maturity: i32,
    pub require_standard: bool,
    pub checkpoints: Vec<Checkpoint>,
    pub checkpoint_data: CheckpointData,
    pub masternode: MasternodeParams,
    pub genesis: GenesisParams,
}

impl ConsensusParams {
    pub fn difficulty_adjustment_interval(&self) -> i64 {
        self.pow_target_timespan / self.pow_target_spacing
    }

    pub fn strict_time_active(&self, height: i32) -> bool {
        self.strict_time_height
            .map(|start| height >= start)
            .unwrap_or(false)
    }

    pub fn pow_tolerance_active(&self, height: i32) -> bool {
        self.pow_tolerance_end_height
            .map(|end| height <= end)
            .unwrap_or(false)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Checkpoint {
    pub height: i32,
    pub hash: Hash256,
}

/// Chain statistics at the last checkpoint, used for sync progress estimates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CheckpointData {
    pub time_last_checkpoint: i64,
    pub transactions_last_checkpoint: i64,
    pub transactions_per_day: f64,
}

#[derive(Clone, Debug)]
pub struct MasternodeParams {
    /// Vote records are validated for blocks at or above this height.
    pub enforcement_height: Option<i32>,
    pub min_votes: i32,
    pub max_payments: usize,
    pub vote_expiration: i32,
    /// Each masternode payment is the coinbase value divided by this.
    pub payment_divisor: Amount,
    pub payee_script_len: usize,
}

#[derive(Clone, Debug)]
pub struct GenesisParams {
    pub version: i32,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
    pub timestamp: &'static str,
    pub output_value: Amount,
    /// Uncompressed public key paid by the genesis coinbase, hex encoded.
    pub output_pubkey: &'static str,
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    pub consensus: ConsensusParams,
    pub message_start: [u8; 4],
}

#[derive(Debug)]
pub enum HexError {
    InvalidLength,
    InvalidHex,
}

impl std::fmt::Display for HexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HexError::InvalidLength => write!(f, "invalid hex length"),
            HexError::InvalidHex => write!(f, "invalid hex digit"),
        }
    }
}

impl std::error::Error for HexError {}

/// Parses a display-order (big-endian) hex string into a little-endian hash.
pub fn hash256_from_hex(input: &str) -> Result<Hash256, HexError> {
    let mut hex = input.trim();
    if let Some(stripped) = hex.strip_prefix("0x").or_else(|| hex.strip_prefix("0X")) {
        hex = stripped;
    }
    if hex.is_empty() || hex.len() > 64 {
        return Err(HexError::InvalidLength);
    }

    let mut padded = String::with_capacity(64);
    for _ in 0..(64 - hex.len()) {
        padded.push('0');
    }
    padded.push_str(hex);

    let mut bytes = [0u8; 32];
    for (i, byte_out) in bytes.iter_mut().enumerate() {
        let start = i * 2;
        *byte_out = u8::from_str_radix(&padded[start..start + 2], 16)
            .map_err(|_| HexError::InvalidHex)?;
    }
    bytes.reverse();
    Ok(bytes)
}

pub fn hash256_to_hex(hash: &Hash256) -> String {
    let mut out = String::with_capacity(64);
    for byte in hash.iter().rev() {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

pub fn consensus_params(network: Network) -> ConsensusParams {
    match network {
        Network::Mainnet => mainnet_consensus_params(),
        Network::Testnet => testnet_consensus_params(),
        Network::Regtest => regtest_consensus_params(),
    }
}

pub fn chain_params(network: Network) -> ChainParams {
    match network {
        Network::Mainnet => ChainParams {
            network,
            consensus: mainnet_consensus_params(),
            message_start: [0xfb, 0xc0, 0xb6, 0xdb],
        },
        Network::Testnet => ChainParams {
            network,
            consensus: testnet_consensus_params(),
            message_start: [0xfb, 0xc0, 0xb6, 0xdb],
        },
        Network::Regtest => ChainParams {
            network,
            consensus: regtest_consensus_params(),
            message_start: [0xfc, 0xbf, 0xb7, 0xdc],
        },
    }
}

const GENESIS_TIMESTAMP: &str = "April-12-2014: Virtual Coin Launched Worldwide";
const GENESIS_PUBKEY: &str = "041be73d303408cf5d2a3ce128e25b11185509cb31d733ad94ff062381b40e5e1ced463510f8d70236c28a071dbe206ee8c4256beccd38f769096ff3adb33acf35";

fn shifted_limit(shift: u32) -> Hash256 {
    // ~0 >> shift, little-endian.
    let mut limit = [0xffu8; 32];
    let whole = (shift / 8) as usize;
    for byte in limit.iter_mut().rev().take(whole) {
        *byte = 0;
    }
    let rem = shift % 8;
    if rem != 0 && whole < 32 {
        limit[31 - whole] = 0xff >> rem;
    }
    limit
}

fn masternode_params(enforcement_height: Option<i32>) -> MasternodeParams {
    MasternodeParams {
        enforcement_height,
        min_votes: 5,
        max_payments: 1,
        vote_expiration: 10,
        payment_divisor: 5,
        payee_script_len: 25,
    }
}

fn mainnet_consensus_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Mainnet,
        pow_limit: shifted_limit(10),
        pow_target_spacing: 5 * 60,
        pow_target_timespan: 15 * 60,
        pow_allow_min_difficulty_blocks: false,
        pow_no_retargeting: false,
        pow_tolerance_end_height: Some(45_000),
        strict_time_height: Some(45_000),
        p2sh_switch_time: BIP16_SWITCH_TIME,
        coinbase_maturity: COINBASE_MATURITY,
        require_standard: true,
        checkpoints: Vec::new(),
        checkpoint_data: CheckpointData {
            time_last_checkpoint: 1_487_788_280,
            transactions_last_checkpoint: 6_269,
            transactions_per_day: 288.0,
        },
        masternode: masternode_params(None),
        genesis: GenesisParams {
            version: 1,
            time: 1_397_260_800,
            bits: 0x1e0f_fff0,
            nonce: 4_589_243,
            timestamp: GENESIS_TIMESTAMP,
            output_value: 50 * COIN,
            output_pubkey: GENESIS_PUBKEY,
        },
    }
}

fn testnet_consensus_params() -> ConsensusParams {
    let mut params = mainnet_consensus_params();
    params.network = Network::Testnet;
    params.pow_allow_min_difficulty_blocks = true;
    params.pow_tolerance_end_height = None;
    params.strict_time_height = Some(0);
    params.require_standard = false;
    params.checkpoint_data = CheckpointData {
        time_last_checkpoint: 1_485_907_131,
        transactions_last_checkpoint: 3_000,
        transactions_per_day: 30.0,
    };
    params.genesis.time = 1_397_260_801;
    params.genesis.nonce = 0;
    params
}

fn regtest_consensus_params() -> ConsensusParams {
    let mut params = testnet_consensus_params();
    params.network = Network::Regtest;
    params.pow_limit = shifted_limit(1);
    params.pow_no_retargeting = true;
    params.strict_time_height = None;
    params.genesis.bits = 0x207f_ffff;
    params.genesis.nonce = 2;
    params
}
