//! Property-based test generators using proptest.
//!
//! Provides strategies for store contents, page budgets and store
//! identities that respect the input rules of the code under test.

use meshdb_core::DataSizeSpec;
use meshdb_storage::{DataItem, MemoryStore};
use proptest::prelude::*;
use std::sync::Arc;

/// One mutation of a generated store.
#[derive(Debug, Clone)]
pub enum StoreOp {
    /// Write `value` under key index `key`.
    Put(u8, Vec<u8>),
    /// Delete key index `key` if it is live.
    Delete(u8),
}

/// Strategy for non-empty keys.
pub fn key_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 1..32)
}

/// Strategy for values, empty ones included.
pub fn value_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..256)
}

/// Strategy for valid app, store and user ids.
pub fn store_param_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[A-Za-z0-9_]{1,32}").expect("Invalid regex")
}

/// Strategy for mutation sequences over a small key space.
pub fn store_ops_strategy() -> impl Strategy<Value = Vec<StoreOp>> {
    prop::collection::vec(
        prop_oneof![
            3 => (0u8..32, value_strategy()).prop_map(|(key, value)| StoreOp::Put(key, value)),
            1 => (0u8..32).prop_map(StoreOp::Delete),
        ],
        1..200,
    )
}

/// Strategy for page budgets that fit at least one small item.
pub fn data_size_spec_strategy() -> impl Strategy<Value = DataSizeSpec> {
    (64usize..8192, 1usize..64).prop_map(|(block, packet)| DataSizeSpec::new(block, packet))
}

/// Strategy for items with timestamps in `1..max_timestamp`, ties likely.
pub fn data_items_strategy(max_timestamp: u64) -> impl Strategy<Value = Vec<DataItem>> {
    prop::collection::btree_map(
        key_strategy(),
        (1..max_timestamp, any::<bool>(), value_strategy()),
        0..100,
    )
    .prop_map(|entries| {
        entries
            .into_iter()
            .map(|(key, (timestamp, deleted, value))| {
                if deleted {
                    DataItem::tombstone(key, timestamp)
                } else {
                    DataItem::live(key, value, timestamp)
                }
            })
            .collect()
    })
}

/// Applies `ops` to a fresh store.
pub fn apply_ops(ops: &[StoreOp]) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    for op in ops {
        match op {
            StoreOp::Put(key, value) => {
                store.put(&[b'k', *key], value).expect("generated put");
            }
            StoreOp::Delete(key) => {
                // Deleting a missing key is part of the generated noise.
                let _ = store.delete(&[b'k', *key]);
            }
        }
    }
    store
}

/// Loads `items` into a fresh store as-is.
pub fn store_from_items(items: Vec<DataItem>) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    for item in items {
        store.put_item(item).expect("generated item");
    }
    store
}
