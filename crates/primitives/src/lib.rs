//! Core block/transaction types and consensus serialization.

pub mod block;
pub mod encoding;
pub mod hash;
pub mod outpoint;
pub mod transaction;

pub use block::{Block, BlockHeader, PaymentVote, HEADER_SIZE};
pub use encoding::{decode, encode, Decodable, DecodeError, Decoder, Encodable, Encoder};
pub use hash::{hash160, sha256, sha256d};
pub use outpoint::OutPoint;
pub use transaction::{Transaction, TxIn, TxOut, SEQUENCE_FINAL};
