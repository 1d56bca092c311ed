use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use vcoin_storage::fjall::{FjallOptions, FjallStore};
use vcoin_storage::memory::MemoryStore;
use vcoin_storage::{Column, KeyValueStore, PrefixVisitor, ScanResult, StoreError, WriteBatch};

use crate::config::Backend;

/// Fjall block cache for the node database.
const DB_CACHE_BYTES: u64 = 64 * 1024 * 1024;

/// The database backend picked at startup.
pub enum Store {
    Memory(MemoryStore),
    Fjall(FjallStore),
}

impl Store {
    pub fn open(backend: Backend, db_path: &Path) -> Result<Self, String> {
        match backend {
            Backend::Memory => Ok(Store::Memory(MemoryStore::new())),
            Backend::Fjall => {
                fs::create_dir_all(db_path)
                    .map_err(|err| format!("failed to create {}: {err}", db_path.display()))?;
                let options = FjallOptions {
                    cache_bytes: Some(DB_CACHE_BYTES),
                    ..FjallOptions::default()
                };
                let store = FjallStore::open_with_options(db_path, options).map_err(|err| {
                    format!("failed to open database {}: {err}", db_path.display())
                })?;
                Ok(Store::Fjall(store))
            }
        }
    }

    /// Forces pending writes to disk before exit.
    pub fn persist(&self) -> Result<(), StoreError> {
        match self {
            Store::Memory(_) => Ok(()),
            Store::Fjall(store) => store.persist(),
        }
    }

    /// The memory backend keeps nothing between runs.
    pub fn is_volatile(&self) -> bool {
        matches!(self, Store::Memory(_))
    }
}

/// Removes the database directory so a reindex starts from an empty index.
pub fn wipe(db_path: &Path) -> Result<(), String> {
    match fs::remove_dir_all(db_path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(format!(
            "failed to remove database {}: {err}",
            db_path.display()
        )),
    }
}

impl KeyValueStore for Store {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        match self {
            Store::Memory(store) => store.get(column, key),
            Store::Fjall(store) => store.get(column, key),
        }
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.put(column, key, value),
            Store::Fjall(store) => store.put(column, key, value),
        }
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.delete(column, key),
            Store::Fjall(store) => store.delete(column, key),
        }
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        match self {
            Store::Memory(store) => store.scan_prefix(column, prefix),
            Store::Fjall(store) => store.scan_prefix(column, prefix),
        }
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.for_each_prefix(column, prefix, visitor),
            Store::Fjall(store) => store.for_each_prefix(column, prefix, visitor),
        }
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.write_batch(batch),
            Store::Fjall(store) => store.write_batch(batch),
        }
    }
}
