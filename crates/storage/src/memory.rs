use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{Column, KeyValueStore, PrefixVisitor, ScanResult, StoreError, WriteBatch, WriteOp};

type MemoryStoreMap = BTreeMap<(Column, Vec<u8>), Vec<u8>>;

/// Volatile store used for tests and `--backend memory`.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryStoreMap>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.read().map(|guard| guard.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryStoreMap>, StoreError> {
        self.inner
            .read()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryStoreMap>, StoreError> {
        self.inner
            .write()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.read()?.get(&(column, key.to_vec())).cloned())
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.write()?.insert((column, key.to_vec()), value.to_vec());
        Ok(())
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        self.write()?.remove(&(column, key.to_vec()));
        Ok(())
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        let guard = self.read()?;
        Ok(guard
            .range((column, prefix.to_vec())..)
            .take_while(|((entry_column, key), _)| {
                *entry_column == column && key.starts_with(prefix)
            })
            .map(|((_, key), value)| (key.clone(), value.clone()))
            .collect())
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        let guard = self.read()?;
        for ((entry_column, key), value) in guard.range((column, prefix.to_vec())..) {
            if *entry_column != column || !key.starts_with(prefix) {
                break;
            }
            visitor(key.as_slice(), value.as_slice())?;
        }
        Ok(())
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut guard = self.write()?;
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    guard.insert((*column, key.as_slice().to_vec()), value.as_slice().to_vec());
                }
                WriteOp::Delete { column, key } => {
                    guard.remove(&(*column, key.as_slice().to_vec()));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_scan_stays_inside_column() {
        let store = MemoryStore::new();
        store.put(Column::Meta, b"ab1", b"x").expect("put");
        store.put(Column::Meta, b"ab2", b"y").expect("put");
        store.put(Column::Meta, b"ac", b"z").expect("put");
        store.put(Column::TxIndex, b"ab3", b"w").expect("put");

        let found = store.scan_prefix(Column::Meta, b"ab").expect("scan");
        assert_eq!(
            found,
            vec![
                (b"ab1".to_vec(), b"x".to_vec()),
                (b"ab2".to_vec(), b"y".to_vec()),
            ]
        );

        let mut seen = 0;
        store
            .for_each_prefix(Column::TxIndex, b"", &mut |_, _| {
                seen += 1;
                Ok(())
            })
            .expect("visit");
        assert_eq!(seen, 1);
    }

    #[test]
    fn batch_applies_in_order() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.put(Column::Coins, b"k", b"1");
        batch.delete(Column::Coins, b"k");
        batch.put(Column::Coins, b"j", b"2");
        store.write_batch(&batch).expect("batch");
        assert!(store.get(Column::Coins, b"k").expect("get").is_none());
        assert_eq!(store.get(Column::Coins, b"j").expect("get"), Some(b"2".to_vec()));
        assert_eq!(store.len(), 1);
    }
}
