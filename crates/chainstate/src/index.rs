//! Persistent block index, blob file bookkeeping, and chain-wide flags.

use std::sync::Arc;

use primitive_types::U256;
use vcoin_consensus::Hash256;
use vcoin_primitives::encoding::{Decodable, Decoder, Encodable, Encoder};
use vcoin_primitives::BlockHeader;
use vcoin_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::blobs::{BlobPos, BlockFileInfo};
use crate::blocktree::BlockNode;

const META_LAST_BLOCK_FILE_KEY: &[u8] = b"last_block_file";
const META_BEST_INVALID_WORK_KEY: &[u8] = b"best_invalid_work";
const META_REINDEXING_KEY: &[u8] = b"reindexing";
const META_FLAG_PREFIX: &[u8] = b"flag:";

pub const FLAG_TXINDEX: &str = "txindex";

const POS_PRESENT: u8 = 1;

/// Block index node as persisted in [`Column::BlockIndex`], keyed by block hash.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DiskBlockIndex {
    pub header: BlockHeader,
    pub height: i32,
    pub status: u32,
    pub tx_count: u32,
    pub data_pos: Option<BlobPos>,
    pub undo_pos: Option<BlobPos>,
}

impl DiskBlockIndex {
    pub fn from_node(node: &BlockNode) -> Self {
        Self {
            header: node.header.clone(),
            height: node.height,
            status: node.status,
            tx_count: node.tx_count,
            data_pos: node.data_pos,
            undo_pos: node.undo_pos,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(120);
        self.header.consensus_encode(&mut encoder);
        encoder.write_i32_le(self.height);
        encoder.write_u32_le(self.status);
        encoder.write_u32_le(self.tx_count);
        write_pos(&mut encoder, self.data_pos);
        write_pos(&mut encoder, self.undo_pos);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        let mut decoder = Decoder::new(bytes);
        let header = BlockHeader::consensus_decode(&mut decoder).map_err(|err| err.to_string())?;
        let height = decoder.read_i32_le().map_err(|err| err.to_string())?;
        let status = decoder.read_u32_le().map_err(|err| err.to_string())?;
        let tx_count = decoder.read_u32_le().map_err(|err| err.to_string())?;
        let data_pos = read_pos(&mut decoder)?;
        let undo_pos = read_pos(&mut decoder)?;
        if !decoder.is_empty() {
            return Err("trailing bytes in block index entry".to_string());
        }
        Ok(Self {
            header,
            height,
            status,
            tx_count,
            data_pos,
            undo_pos,
        })
    }
}

fn write_pos(encoder: &mut Encoder, pos: Option<BlobPos>) {
    match pos {
        Some(pos) => {
            encoder.write_u8(POS_PRESENT);
            encoder.write_bytes(&pos.encode());
        }
        None => encoder.write_u8(0),
    }
}

fn read_pos(decoder: &mut Decoder) -> Result<Option<BlobPos>, String> {
    match decoder.read_u8().map_err(|err| err.to_string())? {
        0 => Ok(None),
        POS_PRESENT => {
            let bytes = decoder.read_fixed::<8>().map_err(|err| err.to_string())?;
            Ok(BlobPos::decode(&bytes))
        }
        _ => Err("invalid position marker".to_string()),
    }
}

pub struct BlockTreeDb<S> {
    store: Arc<S>,
}

impl<S: KeyValueStore> BlockTreeDb<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn write(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        self.store.write_batch(batch)
    }

    pub fn put_node(&self, batch: &mut WriteBatch, node: &BlockNode) {
        batch.put(
            Column::BlockIndex,
            node.hash,
            DiskBlockIndex::from_node(node).encode(),
        );
    }

    pub fn load_nodes(&self) -> Result<Vec<(Hash256, DiskBlockIndex)>, StoreError> {
        let entries = self.store.scan_prefix(Column::BlockIndex, &[])?;
        let mut out = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let hash = decode_hash(&key).map_err(StoreError::Backend)?;
            let entry = DiskBlockIndex::decode(&value).map_err(StoreError::Backend)?;
            out.push((hash, entry));
        }
        Ok(out)
    }

    pub fn put_file_info(&self, batch: &mut WriteBatch, file: u32, info: &BlockFileInfo) {
        batch.put(Column::BlockFiles, file.to_le_bytes(), info.encode());
    }

    pub fn file_info(&self, file: u32) -> Result<Option<BlockFileInfo>, StoreError> {
        let Some(bytes) = self.store.get(Column::BlockFiles, &file.to_le_bytes())? else {
            return Ok(None);
        };
        BlockFileInfo::decode(&bytes)
            .map(Some)
            .map_err(|err| StoreError::Backend(format!("invalid block file info: {err}")))
    }

    pub fn put_last_file(&self, batch: &mut WriteBatch, file: u32) {
        batch.put(Column::Meta, META_LAST_BLOCK_FILE_KEY, file.to_le_bytes());
    }

    pub fn last_file(&self) -> Result<Option<u32>, StoreError> {
        let Some(bytes) = self.store.get(Column::Meta, META_LAST_BLOCK_FILE_KEY)? else {
            return Ok(None);
        };
        let bytes: [u8; 4] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| StoreError::Backend("invalid last block file".to_string()))?;
        Ok(Some(u32::from_le_bytes(bytes)))
    }

    pub fn put_best_invalid_work(&self, batch: &mut WriteBatch, work: U256) {
        batch.put(Column::Meta, META_BEST_INVALID_WORK_KEY, work.to_big_endian());
    }

    pub fn best_invalid_work(&self) -> Result<U256, StoreError> {
        match self.store.get(Column::Meta, META_BEST_INVALID_WORK_KEY)? {
            Some(bytes) if bytes.len() == 32 => Ok(U256::from_big_endian(&bytes)),
            Some(_) => Err(StoreError::Backend("invalid best invalid work".to_string())),
            None => Ok(U256::zero()),
        }
    }

    pub fn set_reindexing(&self, reindexing: bool) -> Result<(), StoreError> {
        if reindexing {
            self.store.put(Column::Meta, META_REINDEXING_KEY, &[1])
        } else {
            self.store.delete(Column::Meta, META_REINDEXING_KEY)
        }
    }

    pub fn reindexing(&self) -> Result<bool, StoreError> {
        Ok(self.store.get(Column::Meta, META_REINDEXING_KEY)?.is_some())
    }

    pub fn put_flag(&self, batch: &mut WriteBatch, name: &str, value: bool) {
        batch.put(Column::Meta, flag_key(name), vec![u8::from(value)]);
    }

    pub fn flag(&self, name: &str) -> Result<Option<bool>, StoreError> {
        Ok(self
            .store
            .get(Column::Meta, &flag_key(name))?
            .map(|bytes| bytes.first() == Some(&1)))
    }
}

fn flag_key(name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(META_FLAG_PREFIX.len() + name.len());
    key.extend_from_slice(META_FLAG_PREFIX);
    key.extend_from_slice(name.as_bytes());
    key
}

fn decode_hash(bytes: &[u8]) -> Result<Hash256, String> {
    if bytes.len() != 32 {
        return Err("invalid hash length".to_string());
    }
    let mut hash = [0u8; 32];
    hash.copy_from_slice(bytes);
    Ok(hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vcoin_storage::memory::MemoryStore;

    #[test]
    fn disk_index_round_trips_positions() {
        let entry = DiskBlockIndex {
            header: BlockHeader {
                version: 1,
                prev_block: [3u8; 32],
                merkle_root: [4u8; 32],
                time: 1_400_000_000,
                bits: 0x1e0f_fff0,
                nonce: 9,
            },
            height: 17,
            status: 3 | 8,
            tx_count: 2,
            data_pos: Some(BlobPos::new(1, 800)),
            undo_pos: None,
        };
        assert_eq!(DiskBlockIndex::decode(&entry.encode()).expect("decode"), entry);
    }

    #[test]
    fn flags_and_meta_persist() {
        let db = BlockTreeDb::new(Arc::new(MemoryStore::new()));
        assert_eq!(db.flag(FLAG_TXINDEX).expect("flag"), None);
        assert_eq!(db.best_invalid_work().expect("work"), U256::zero());

        let mut batch = WriteBatch::new();
        db.put_flag(&mut batch, FLAG_TXINDEX, true);
        db.put_last_file(&mut batch, 4);
        db.put_best_invalid_work(&mut batch, U256::from(77u64));
        db.write(&batch).expect("write");

        assert_eq!(db.flag(FLAG_TXINDEX).expect("flag"), Some(true));
        assert_eq!(db.last_file().expect("last"), Some(4));
        assert_eq!(db.best_invalid_work().expect("work"), U256::from(77u64));

        db.set_reindexing(true).expect("set");
        assert!(db.reindexing().expect("get"));
        db.set_reindexing(false).expect("clear");
        assert!(!db.reindexing().expect("get"));
    }
}
