//! Transaction types and serialization.

use vcoin_consensus::constants::LOCKTIME_THRESHOLD;
use vcoin_consensus::Hash256;

use crate::encoding::{decode, encode, Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::outpoint::OutPoint;

/// Inputs with this sequence number never hold back finality.
pub const SEQUENCE_FINAL: u32 = u32::MAX;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

impl Encodable for TxIn {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.prevout.consensus_encode(encoder);
        encoder.write_var_bytes(&self.script_sig);
        encoder.write_u32_le(self.sequence);
    }
}

impl Decodable for TxIn {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let prevout = OutPoint::consensus_decode(decoder)?;
        let script_sig = decoder.read_var_bytes()?;
        let sequence = decoder.read_u32_le()?;
        Ok(Self {
            prevout,
            script_sig,
            sequence,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxOut {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
}

impl TxOut {
    pub fn new(value: i64, script_pubkey: Vec<u8>) -> Self {
        Self {
            value,
            script_pubkey,
        }
    }
}

impl Encodable for TxOut {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
    }
}

impl Decodable for TxOut {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let value = decoder.read_i64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        Ok(Self {
            value,
            script_pubkey,
        })
    }
}

/// A transaction as it appears on the wire. Its id is the double SHA-256 of that encoding.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Transaction {
    pub version: i32,
    pub vin: Vec<TxIn>,
    pub vout: Vec<TxOut>,
    pub lock_time: u32,
}

/// Smallest possible encodings, used to bound untrusted list lengths.
const MIN_TXIN_SIZE: usize = 41;
const MIN_TXOUT_SIZE: usize = 9;

impl Transaction {
    pub fn txid(&self) -> Hash256 {
        sha256d(&encode(self))
    }

    pub fn serialized_size(&self) -> usize {
        let mut size = 4 + 4;
        size += varint_len(self.vin.len());
        for input in &self.vin {
            size += 36 + varint_len(input.script_sig.len()) + input.script_sig.len() + 4;
        }
        size += varint_len(self.vout.len());
        for output in &self.vout {
            size += 8 + varint_len(output.script_pubkey.len()) + output.script_pubkey.len();
        }
        size
    }

    pub fn consensus_encode_to_vec(&self) -> Vec<u8> {
        encode(self)
    }

    pub fn consensus_decode_from_slice(bytes: &[u8]) -> Result<Self, DecodeError> {
        decode(bytes)
    }

    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].prevout.is_null()
    }

    /// Sum of output values. Callers range-check outputs first; this saturates instead of
    /// wrapping on hostile input.
    pub fn value_out(&self) -> i64 {
        self.vout
            .iter()
            .fold(0i64, |total, output| total.saturating_add(output.value))
    }

    /// Whether the lock time permits inclusion in a block at `height` with time `block_time`.
    pub fn is_final(&self, height: i32, block_time: i64) -> bool {
        if self.lock_time == 0 {
            return true;
        }
        let threshold = if self.lock_time < LOCKTIME_THRESHOLD {
            i64::from(height)
        } else {
            block_time
        };
        if i64::from(self.lock_time) < threshold {
            return true;
        }
        self.vin.iter().all(|input| input.sequence == SEQUENCE_FINAL)
    }
}

pub(crate) fn varint_len(value: usize) -> usize {
    match value {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

impl Encodable for Transaction {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_list(&self.vin);
        encoder.write_list(&self.vout);
        encoder.write_u32_le(self.lock_time);
    }
}

impl Decodable for Transaction {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let version = decoder.read_i32_le()?;
        let vin = decoder.read_list(MIN_TXIN_SIZE)?;
        let vout = decoder.read_list(MIN_TXOUT_SIZE)?;
        let lock_time = decoder.read_u32_le()?;
        Ok(Self {
            version,
            vin,
            vout,
            lock_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Transaction {
        Transaction {
            version: 1,
            vin: vec![TxIn {
                prevout: OutPoint::new([3u8; 32], 1),
                script_sig: vec![0x51; 3],
                sequence: 7,
            }],
            vout: vec![
                TxOut::new(5_000, vec![0x76, 0xa9]),
                TxOut::new(6_000, vec![0x51]),
            ],
            lock_time: 100,
        }
    }

    #[test]
    fn serialized_size_matches_encoding() {
        let tx = sample();
        let bytes = tx.consensus_encode_to_vec();
        assert_eq!(tx.serialized_size(), bytes.len());
        let decoded = Transaction::consensus_decode_from_slice(&bytes).expect("decode");
        assert_eq!(decoded, tx);
        assert_eq!(decoded.txid(), tx.txid());
    }

    #[test]
    fn finality_depends_on_lock_time_and_sequences() {
        let mut tx = sample();
        assert!(!tx.is_final(100, 0));
        assert!(tx.is_final(101, 0));
        tx.vin[0].sequence = SEQUENCE_FINAL;
        assert!(tx.is_final(1, 0));

        tx.vin[0].sequence = 0;
        tx.lock_time = LOCKTIME_THRESHOLD + 10;
        assert!(!tx.is_final(1_000_000, i64::from(LOCKTIME_THRESHOLD)));
        assert!(tx.is_final(0, i64::from(LOCKTIME_THRESHOLD) + 11));
    }

    #[test]
    fn coinbase_shape() {
        let mut tx = sample();
        assert!(!tx.is_coinbase());
        tx.vin[0].prevout = OutPoint::null();
        assert!(tx.is_coinbase());
        assert_eq!(tx.value_out(), 11_000);
    }

    #[test]
    fn truncated_input_is_rejected() {
        let bytes = sample().consensus_encode_to_vec();
        assert!(Transaction::consensus_decode_from_slice(&bytes[..bytes.len() - 1]).is_err());
    }
}
