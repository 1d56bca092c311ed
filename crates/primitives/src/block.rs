//! Block header and block types.

use vcoin_consensus::Hash256;

use crate::encoding::{decode, encode, Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::transaction::{varint_len, Transaction};

/// Serialized size of a block header.
pub const HEADER_SIZE: usize = 80;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn hash(&self) -> Hash256 {
        sha256d(&encode(self))
    }
}

impl Encodable for BlockHeader {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_hash_le(&self.prev_block);
        encoder.write_hash_le(&self.merkle_root);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.nonce);
    }
}

impl Decodable for BlockHeader {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            version: decoder.read_i32_le()?,
            prev_block: decoder.read_hash_le()?,
            merkle_root: decoder.read_hash_le()?,
            time: decoder.read_u32_le()?,
            bits: decoder.read_u32_le()?,
            nonce: decoder.read_u32_le()?,
        })
    }
}

/// Masternode payment vote carried in the block extension.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PaymentVote {
    /// Height of the block that first proposed this payee.
    pub height: i64,
    pub payee: Vec<u8>,
    pub votes: i32,
}

impl Encodable for PaymentVote {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i64_le(self.height);
        encoder.write_var_bytes(&self.payee);
        encoder.write_i32_le(self.votes);
    }
}

impl Decodable for PaymentVote {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            height: decoder.read_i64_le()?,
            payee: decoder.read_var_bytes()?,
            votes: decoder.read_i32_le()?,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    pub votes: Vec<PaymentVote>,
}

impl Block {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn txids(&self) -> Vec<Hash256> {
        self.transactions.iter().map(Transaction::txid).collect()
    }

    pub fn serialized_size(&self) -> usize {
        let mut size = HEADER_SIZE + varint_len(self.transactions.len());
        size += self
            .transactions
            .iter()
            .map(Transaction::serialized_size)
            .sum::<usize>();
        size += varint_len(self.votes.len());
        size += self
            .votes
            .iter()
            .map(|vote| 12 + varint_len(vote.payee.len()) + vote.payee.len())
            .sum::<usize>();
        size
    }

    pub fn consensus_encode_to_vec(&self) -> Vec<u8> {
        encode(self)
    }

    pub fn consensus_decode_from_slice(bytes: &[u8]) -> Result<Self, DecodeError> {
        decode(bytes)
    }

    /// Byte offset of each transaction inside the serialized block.
    pub fn transaction_offsets(&self) -> Vec<u32> {
        let mut offset = HEADER_SIZE + varint_len(self.transactions.len());
        let mut offsets = Vec::with_capacity(self.transactions.len());
        for tx in &self.transactions {
            offsets.push(offset as u32);
            offset += tx.serialized_size();
        }
        offsets
    }
}

impl Encodable for Block {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.header.consensus_encode(encoder);
        encoder.write_list(&self.transactions);
        encoder.write_list(&self.votes);
    }
}

impl Decodable for Block {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let header = BlockHeader::consensus_decode(decoder)?;
        let transactions = decoder.read_list(10)?;
        let votes = decoder.read_list(13)?;
        Ok(Self {
            header,
            transactions,
            votes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outpoint::OutPoint;
    use crate::transaction::{TxIn, TxOut};

    fn sample_block() -> Block {
        let coinbase = Transaction {
            version: 1,
            vin: vec![TxIn {
                prevout: OutPoint::null(),
                script_sig: vec![0x01, 0x01],
                sequence: u32::MAX,
            }],
            vout: vec![TxOut::new(50, vec![0x51])],
            lock_time: 0,
        };
        Block {
            header: BlockHeader {
                version: 1,
                prev_block: [1u8; 32],
                merkle_root: [2u8; 32],
                time: 1_397_260_800,
                bits: 0x207f_ffff,
                nonce: 9,
            },
            transactions: vec![coinbase.clone(), coinbase],
            votes: vec![PaymentVote {
                height: 12,
                payee: vec![0x76; 25],
                votes: 3,
            }],
        }
    }

    #[test]
    fn header_encodes_to_eighty_bytes() {
        let block = sample_block();
        assert_eq!(encode(&block.header).len(), HEADER_SIZE);
    }

    #[test]
    fn block_size_and_offsets_match_encoding() {
        let block = sample_block();
        let bytes = block.consensus_encode_to_vec();
        assert_eq!(block.serialized_size(), bytes.len());
        let offsets = block.transaction_offsets();
        let first = offsets[0] as usize;
        let second = offsets[1] as usize;
        let tx = Transaction::consensus_decode_from_slice(&bytes[first..second]).expect("tx");
        assert_eq!(tx, block.transactions[0]);
        assert_eq!(
            Block::consensus_decode_from_slice(&bytes).expect("block"),
            block
        );
    }

    #[test]
    fn header_hash_ignores_body() {
        let mut block = sample_block();
        let hash = block.hash();
        block.votes.clear();
        block.transactions.pop();
        assert_eq!(block.hash(), hash);
        block.header.nonce += 1;
        assert_ne!(block.hash(), hash);
    }
}
