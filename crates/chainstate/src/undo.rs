//! Undo records written alongside each connected block.

use vcoin_consensus::Hash256;
use vcoin_primitives::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use vcoin_primitives::{sha256d, TxOut};

pub const UNDO_CHECKSUM_LEN: usize = 32;

/// Metadata of a coin record that the spend fully pruned.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SpentRecordMeta {
    pub height: u32,
    pub coinbase: bool,
    pub version: i32,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InputUndo {
    pub output: TxOut,
    pub meta: Option<SpentRecordMeta>,
}

/// Undo data of one non-coinbase transaction, in input order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TxUndo {
    pub inputs: Vec<InputUndo>,
}

/// One [`TxUndo`] per non-coinbase transaction of a block.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BlockUndo {
    pub txs: Vec<TxUndo>,
}

impl Encodable for InputUndo {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        // height * 2 + coinbase; a zero height means no metadata follows.
        match self.meta {
            Some(meta) => {
                let code = u64::from(meta.height) * 2 + u64::from(meta.coinbase);
                encoder.write_varint(code);
                encoder.write_varint(u64::from(meta.version as u32));
            }
            None => encoder.write_varint(0),
        }
        self.output.consensus_encode(encoder);
    }
}

impl Decodable for InputUndo {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let code = decoder.read_varint()?;
        let height = u32::try_from(code / 2)
            .map_err(|_| DecodeError::InvalidData("undo height out of range"))?;
        let meta = if height > 0 {
            let version = u32::try_from(decoder.read_varint()?)
                .map_err(|_| DecodeError::InvalidData("undo version out of range"))?;
            Some(SpentRecordMeta {
                height,
                coinbase: code & 1 == 1,
                version: version as i32,
            })
        } else {
            None
        };
        let output = TxOut::consensus_decode(decoder)?;
        Ok(Self { output, meta })
    }
}

impl Encodable for TxUndo {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_list(&self.inputs);
    }
}

impl Decodable for TxUndo {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            inputs: decoder.read_list(9)?,
        })
    }
}

impl BlockUndo {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_list(&self.txs);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let txs = decoder.read_list(1)?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self { txs })
    }

    /// Undo bytes followed by `sha256d(parent_hash || undo bytes)`.
    pub fn encode_with_checksum(&self, parent_hash: &Hash256) -> Vec<u8> {
        let mut payload = self.encode();
        let checksum = undo_checksum(parent_hash, &payload);
        payload.extend_from_slice(&checksum);
        payload
    }

    pub fn decode_with_checksum(payload: &[u8], parent_hash: &Hash256) -> Result<Self, DecodeError> {
        if payload.len() < UNDO_CHECKSUM_LEN {
            return Err(DecodeError::UnexpectedEof);
        }
        let (body, checksum) = payload.split_at(payload.len() - UNDO_CHECKSUM_LEN);
        if undo_checksum(parent_hash, body).as_slice() != checksum {
            return Err(DecodeError::InvalidData("undo checksum mismatch"));
        }
        Self::decode(body)
    }
}

fn undo_checksum(parent_hash: &Hash256, body: &[u8]) -> Hash256 {
    let mut preimage = Vec::with_capacity(32 + body.len());
    preimage.extend_from_slice(parent_hash);
    preimage.extend_from_slice(body);
    sha256d(&preimage)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_undo() -> BlockUndo {
        BlockUndo {
            txs: vec![TxUndo {
                inputs: vec![
                    InputUndo {
                        output: TxOut::new(5_000, vec![0x51]),
                        meta: None,
                    },
                    InputUndo {
                        output: TxOut::new(7_000, vec![0x76, 0xa9]),
                        meta: Some(SpentRecordMeta {
                            height: 33,
                            coinbase: true,
                            version: 1,
                        }),
                    },
                ],
            }],
        }
    }

    #[test]
    fn checksum_binds_parent_hash() {
        let undo = sample_undo();
        let payload = undo.encode_with_checksum(&[1u8; 32]);
        let decoded = BlockUndo::decode_with_checksum(&payload, &[1u8; 32]).expect("decode");
        assert_eq!(decoded, undo);
        assert!(BlockUndo::decode_with_checksum(&payload, &[2u8; 32]).is_err());
    }

    #[test]
    fn corrupted_body_is_rejected() {
        let mut payload = sample_undo().encode_with_checksum(&[1u8; 32]);
        payload[3] ^= 0x01;
        assert!(BlockUndo::decode_with_checksum(&payload, &[1u8; 32]).is_err());
    }
}
