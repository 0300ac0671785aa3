//! Benchmark utilities.

use meshdb_storage::{MemoryStore, Timestamp};
use rand::Rng;
use std::sync::Arc;

/// End of a range covering every timestamp a store hands out.
pub const ALL_TIME: Timestamp = i64::MAX as Timestamp;

/// Generate random value data of the specified size.
pub fn random_data(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.gen()).collect()
}

/// A store with `count` records of `value_size` random bytes, the first
/// `deleted` of them replaced by tombstones.
pub fn generate_store(count: usize, value_size: usize, deleted: usize) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    for i in 0..count {
        store
            .put(format!("key_{i:08}").as_bytes(), &random_data(value_size))
            .expect("bench put");
    }
    for i in 0..deleted.min(count) {
        store
            .delete(format!("key_{i:08}").as_bytes())
            .expect("bench delete");
    }
    store
}
