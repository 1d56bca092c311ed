use std::path::Path;
use std::time::{Duration, Instant};

use fjall::{Batch, Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};

use crate::{Column, KeyValueStore, PrefixVisitor, ScanResult, StoreError, WriteBatch, WriteOp};

const SLOW_COMMIT_THRESHOLD: Duration = Duration::from_millis(500);

/// Durable store backed by one fjall partition per [`Column`].
pub struct FjallStore {
    keyspace: Keyspace,
    partitions: Vec<PartitionHandle>,
    persist: PersistMode,
}

#[derive(Clone, Debug, Default)]
pub struct FjallOptions {
    pub cache_bytes: Option<u64>,
    pub write_buffer_bytes: Option<u64>,
    pub memtable_bytes: Option<u32>,
    /// Skip fsync on commit; writes then survive a process crash but not power loss.
    pub buffered_commits: bool,
}

impl FjallOptions {
    fn apply_config(&self, mut config: Config) -> Config {
        if let Some(bytes) = self.cache_bytes {
            config = config.cache_size(bytes);
        }
        if let Some(bytes) = self.write_buffer_bytes {
            config = config.max_write_buffer_size(bytes);
        }
        config
    }

    fn partition_options(&self) -> PartitionCreateOptions {
        let mut options = PartitionCreateOptions::default();
        if let Some(bytes) = self.memtable_bytes {
            options = options.max_memtable_size(bytes);
        }
        options
    }
}

impl FjallStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with_options(path, FjallOptions::default())
    }

    pub fn open_with_options(
        path: impl AsRef<Path>,
        options: FjallOptions,
    ) -> Result<Self, StoreError> {
        let keyspace = options
            .apply_config(Config::new(path))
            .open()
            .map_err(map_err)?;
        let partition_options = options.partition_options();
        let mut partitions = Vec::with_capacity(Column::ALL.len());
        for column in Column::ALL {
            let handle = keyspace
                .open_partition(column.as_str(), partition_options.clone())
                .map_err(map_err)?;
            partitions.push(handle);
        }
        let persist = if options.buffered_commits {
            PersistMode::Buffer
        } else {
            PersistMode::SyncAll
        };
        Ok(Self {
            keyspace,
            partitions,
            persist,
        })
    }

    fn partition(&self, column: Column) -> Result<&PartitionHandle, StoreError> {
        self.partitions
            .get(column.index())
            .ok_or_else(|| StoreError::Backend(format!("missing partition {}", column.as_str())))
    }

    /// Forces the journal to disk.
    pub fn persist(&self) -> Result<(), StoreError> {
        self.keyspace.persist(PersistMode::SyncAll).map_err(map_err)
    }
}

impl KeyValueStore for FjallStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let value = self.partition(column)?.get(key).map_err(map_err)?;
        Ok(value.map(|bytes| bytes.to_vec()))
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.partition(column)?.insert(key, value).map_err(map_err)?;
        Ok(())
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        self.partition(column)?.remove(key).map_err(map_err)?;
        Ok(())
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        let partition = self.partition(column)?;
        let mut results = Vec::new();
        for entry in partition.prefix(prefix) {
            let (key, value) = entry.map_err(map_err)?;
            results.push((key.to_vec(), value.to_vec()));
        }
        Ok(results)
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        let partition = self.partition(column)?;
        for entry in partition.prefix(prefix) {
            let (key, value) = entry.map_err(map_err)?;
            visitor(key.as_ref(), value.as_ref())?;
        }
        Ok(())
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut fjall_batch = Batch::with_capacity(self.keyspace.clone(), batch.len())
            .durability(Some(self.persist));
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    let partition = self.partition(*column)?;
                    fjall_batch.insert(partition, key.as_slice(), value.as_slice());
                }
                WriteOp::Delete { column, key } => {
                    let partition = self.partition(*column)?;
                    fjall_batch.remove(partition, key.as_slice());
                }
            }
        }
        let commit_start = Instant::now();
        fjall_batch.commit().map_err(map_err)?;
        let elapsed = commit_start.elapsed();
        if elapsed >= SLOW_COMMIT_THRESHOLD {
            vcoin_log::log_warn!(
                "fjall write_batch commit took {}ms ({} ops, write buffer {}B)",
                elapsed.as_millis(),
                batch.len(),
                self.keyspace.write_buffer_size(),
            );
        }
        Ok(())
    }
}

fn map_err(err: fjall::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}
