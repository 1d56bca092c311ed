//! Column-oriented key-value storage with atomic write batches.

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

pub mod memory;

#[cfg(feature = "fjall")]
pub mod fjall;

#[derive(Debug)]
pub enum StoreError {
    Backend(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Backend(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Column families of the node database.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Column {
    /// Unspent output records keyed by txid.
    Coins,
    /// Block index nodes keyed by block hash.
    BlockIndex,
    /// Per blob file bookkeeping keyed by file number.
    BlockFiles,
    /// Transaction positions keyed by txid.
    TxIndex,
    /// Singleton flags and chain pointers.
    Meta,
}

impl Column {
    pub const ALL: [Column; 5] = [
        Column::Coins,
        Column::BlockIndex,
        Column::BlockFiles,
        Column::TxIndex,
        Column::Meta,
    ];

    pub const fn bit(self) -> u32 {
        match self {
            Column::Coins => 1 << 0,
            Column::BlockIndex => 1 << 1,
            Column::BlockFiles => 1 << 2,
            Column::TxIndex => 1 << 3,
            Column::Meta => 1 << 4,
        }
    }

    pub const fn index(self) -> usize {
        self.bit().trailing_zeros() as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Column::Coins => "coins",
            Column::BlockIndex => "block_index",
            Column::BlockFiles => "block_files",
            Column::TxIndex => "tx_index",
            Column::Meta => "meta",
        }
    }
}

/// Byte string stored inline up to `N` bytes before spilling to the heap.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InlineBytes<const N: usize>(SmallVec<[u8; N]>);

/// Keys are at most a tag plus a 32-byte hash in practice.
pub type WriteKey = InlineBytes<40>;
/// Most coin records fit inline.
pub type WriteValue = InlineBytes<64>;

impl<const N: usize> InlineBytes<N> {
    pub fn as_slice(&self) -> &[u8] {
        self.0.as_slice()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0.into_vec()
    }
}

impl<const N: usize> AsRef<[u8]> for InlineBytes<N> {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl<const N: usize> From<Vec<u8>> for InlineBytes<N> {
    fn from(value: Vec<u8>) -> Self {
        Self(SmallVec::from_vec(value))
    }
}

impl<const N: usize> From<&[u8]> for InlineBytes<N> {
    fn from(value: &[u8]) -> Self {
        Self(SmallVec::from_slice(value))
    }
}

impl<const N: usize, const M: usize> From<[u8; M]> for InlineBytes<N> {
    fn from(value: [u8; M]) -> Self {
        Self(SmallVec::from_slice(&value))
    }
}

impl<const N: usize, const M: usize> From<&[u8; M]> for InlineBytes<N> {
    fn from(value: &[u8; M]) -> Self {
        Self(SmallVec::from_slice(value))
    }
}

#[derive(Clone, Debug)]
pub enum WriteOp {
    Put {
        column: Column,
        key: WriteKey,
        value: WriteValue,
    },
    Delete {
        column: Column,
        key: WriteKey,
    },
}

#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reserve(&mut self, additional: usize) {
        self.ops.reserve(additional);
    }

    pub fn put(&mut self, column: Column, key: impl Into<WriteKey>, value: impl Into<WriteValue>) {
        self.ops.push(WriteOp::Put {
            column,
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn delete(&mut self, column: Column, key: impl Into<WriteKey>) {
        self.ops.push(WriteOp::Delete {
            column,
            key: key.into(),
        });
    }

    pub fn iter(&self) -> impl Iterator<Item = &WriteOp> {
        self.ops.iter()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Appends every operation of `other`, preserving order.
    pub fn extend(&mut self, other: WriteBatch) {
        self.ops.extend(other.ops);
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

pub type ScanResult = Vec<(Vec<u8>, Vec<u8>)>;
pub type PrefixVisitor<'a> = dyn FnMut(&[u8], &[u8]) -> Result<(), StoreError> + 'a;

/// Backend contract: `write_batch` applies every operation or none, and is durable once it
/// returns `Ok`.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;
    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError>;
    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError>;
    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError>;
    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError>;
    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError>;
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.as_ref().get(column, key)
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.as_ref().put(column, key, value)
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        self.as_ref().delete(column, key)
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        self.as_ref().scan_prefix(column, prefix)
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        self.as_ref().for_each_prefix(column, prefix, visitor)
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        self.as_ref().write_batch(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_indices_are_dense() {
        for (position, column) in Column::ALL.iter().enumerate() {
            assert_eq!(column.index(), position);
        }
    }

    #[test]
    fn batch_extend_keeps_order() {
        let mut first = WriteBatch::new();
        first.put(Column::Meta, b"a", b"1");
        let mut second = WriteBatch::new();
        second.delete(Column::Meta, b"a");
        first.extend(second);
        assert_eq!(first.len(), 2);
        assert!(matches!(
            first.iter().last(),
            Some(WriteOp::Delete {
                column: Column::Meta,
                ..
            })
        ));
    }
}
