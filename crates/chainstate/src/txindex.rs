//! Optional txid -> position index, maintained while connecting blocks.

use std::sync::Arc;

use vcoin_consensus::Hash256;
use vcoin_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::blobs::{BlobPos, BLOB_POS_LEN};

const TX_LOCATION_LEN: usize = BLOB_POS_LEN + 4;

/// A transaction's block record plus its byte offset inside the serialized block.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TxLocation {
    pub block: BlobPos,
    pub tx_offset: u32,
}

impl TxLocation {
    pub fn encode(&self) -> [u8; TX_LOCATION_LEN] {
        let mut out = [0u8; TX_LOCATION_LEN];
        out[0..BLOB_POS_LEN].copy_from_slice(&self.block.encode());
        out[BLOB_POS_LEN..].copy_from_slice(&self.tx_offset.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != TX_LOCATION_LEN {
            return None;
        }
        let block = BlobPos::decode(&bytes[0..BLOB_POS_LEN])?;
        let tx_offset = u32::from_le_bytes(bytes[BLOB_POS_LEN..].try_into().ok()?);
        Some(Self { block, tx_offset })
    }
}

pub struct TxIndex<S> {
    store: Arc<S>,
}

impl<S> TxIndex<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> TxIndex<S> {
    pub fn insert(&self, batch: &mut WriteBatch, txid: &Hash256, location: TxLocation) {
        batch.put(Column::TxIndex, txid, location.encode());
    }

    pub fn get(&self, txid: &Hash256) -> Result<Option<TxLocation>, StoreError> {
        let bytes = match self.store.get(Column::TxIndex, txid)? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        TxLocation::decode(&bytes)
            .ok_or_else(|| StoreError::Backend("invalid tx index entry".to_string()))
            .map(Some)
    }
}
