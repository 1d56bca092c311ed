use std::collections::HashSet;

use vcoin_storage::memory::MemoryStore;
use vcoin_storage::{Column, KeyValueStore, StoreError, WriteBatch};

#[test]
fn columns_have_distinct_names_and_bits() {
    let names: HashSet<_> = Column::ALL.iter().map(|column| column.as_str()).collect();
    assert_eq!(names.len(), Column::ALL.len());
    let mask = Column::ALL
        .iter()
        .fold(0u32, |mask, column| mask | column.bit());
    assert_eq!(mask.count_ones() as usize, Column::ALL.len());
}

#[test]
fn prefix_scans_stay_inside_their_column() {
    let store = MemoryStore::new();
    let mut batch = WriteBatch::new();
    batch.put(Column::BlockIndex, b"b:2".as_slice(), b"two".as_slice());
    batch.put(Column::BlockIndex, b"b:1".as_slice(), b"one".as_slice());
    batch.put(Column::BlockIndex, b"c:1".as_slice(), b"other".as_slice());
    batch.put(Column::BlockFiles, b"b:3".as_slice(), b"file".as_slice());
    store.write_batch(&batch).expect("batch");

    assert_eq!(
        store.scan_prefix(Column::BlockIndex, b"b:").expect("scan"),
        vec![
            (b"b:1".to_vec(), b"one".to_vec()),
            (b"b:2".to_vec(), b"two".to_vec()),
        ]
    );

    let mut seen = Vec::new();
    store
        .for_each_prefix(Column::BlockFiles, b"", &mut |key, _| {
            seen.push(key.to_vec());
            Ok(())
        })
        .expect("visit");
    assert_eq!(seen, vec![b"b:3".to_vec()]);
}

#[test]
fn visitor_errors_stop_the_walk() {
    let store = MemoryStore::new();
    store.put(Column::Coins, b"a", b"1").expect("put");
    store.put(Column::Coins, b"b", b"2").expect("put");

    let mut visits = 0;
    let result = store.for_each_prefix(Column::Coins, b"", &mut |_, _| {
        visits += 1;
        Err(StoreError::Backend("stop".to_string()))
    });
    assert!(result.is_err());
    assert_eq!(visits, 1);
}

#[test]
fn batch_applies_puts_and_deletes_in_order() {
    let store = MemoryStore::new();
    store.put(Column::Meta, b"flag", b"1").expect("put");

    let mut batch = WriteBatch::new();
    batch.delete(Column::Meta, b"flag".as_slice());
    batch.put(Column::Meta, b"best".as_slice(), b"a".as_slice());
    batch.put(Column::Meta, b"best".as_slice(), b"b".as_slice());
    store.write_batch(&batch).expect("batch");

    assert_eq!(store.get(Column::Meta, b"flag").expect("get"), None);
    assert_eq!(
        store.get(Column::Meta, b"best").expect("get"),
        Some(b"b".to_vec())
    );
    assert_eq!(store.len(), 1);
}
