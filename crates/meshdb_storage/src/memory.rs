//! In-memory natural store.

use crate::error::{StorageError, StorageResult};
use crate::item::{DataItem, Timestamp};
use crate::source::{ScanFilter, SyncSource};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// An in-memory key-value store that keeps one record per key, tombstones
/// included, stamped with a strictly increasing commit timestamp.
///
/// # Example
///
/// ```rust
/// use meshdb_storage::{MemoryStore, ScanFilter, SyncSource};
///
/// let store = MemoryStore::new();
/// let first = store.put(b"k1", b"v1").unwrap();
/// store.delete(b"k1").unwrap();
/// let items = store.scan(None, first, u64::MAX, ScanFilter::Deleted).unwrap();
/// assert_eq!(items.len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<StoreInner>,
    appended_len: usize,
}

#[derive(Debug, Default)]
struct StoreInner {
    records: BTreeMap<Vec<u8>, DataItem>,
    clock: Timestamp,
}

impl StoreInner {
    fn next_timestamp(&mut self) -> Timestamp {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| (d.as_nanos() / 100) as Timestamp)
            .unwrap_or(0);
        self.clock = now.max(self.clock + 1);
        self.clock
    }
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty store whose items cost `appended_len` extra wire bytes.
    #[must_use]
    pub fn with_appended_len(appended_len: usize) -> Self {
        Self {
            appended_len,
            ..Self::default()
        }
    }

    /// Writes a live record and returns its commit timestamp.
    pub fn put(&self, key: &[u8], value: &[u8]) -> StorageResult<Timestamp> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey);
        }
        let mut inner = self.inner.write();
        let timestamp = inner.next_timestamp();
        inner
            .records
            .insert(key.to_vec(), DataItem::live(key, value, timestamp));
        Ok(timestamp)
    }

    /// Replaces a live record with a tombstone and returns its timestamp.
    pub fn delete(&self, key: &[u8]) -> StorageResult<Timestamp> {
        let mut inner = self.inner.write();
        match inner.records.get(key) {
            Some(item) if !item.is_deleted() => {}
            _ => return Err(StorageError::NotFound),
        }
        let timestamp = inner.next_timestamp();
        inner
            .records
            .insert(key.to_vec(), DataItem::tombstone(key, timestamp));
        Ok(timestamp)
    }

    /// Stores `item` as-is, keeping its timestamp (data received from a peer).
    pub fn put_item(&self, item: DataItem) -> StorageResult<()> {
        if item.key.is_empty() {
            return Err(StorageError::InvalidKey);
        }
        let mut inner = self.inner.write();
        inner.clock = inner.clock.max(item.timestamp);
        inner.records.insert(item.key.clone(), item);
        Ok(())
    }

    /// Reads a live value.
    #[must_use]
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.inner
            .read()
            .records
            .get(key)
            .filter(|item| !item.is_deleted())
            .map(|item| item.value.clone())
    }

    /// Number of records, tombstones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    /// Returns true if the store holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().records.is_empty()
    }

    /// Highest timestamp handed out so far.
    #[must_use]
    pub fn max_timestamp(&self) -> Timestamp {
        self.inner.read().clock
    }
}

impl SyncSource for MemoryStore {
    fn scan(
        &self,
        device: Option<&str>,
        begin: Timestamp,
        end: Timestamp,
        filter: ScanFilter,
    ) -> StorageResult<Vec<DataItem>> {
        let inner = self.inner.read();
        let mut items: Vec<DataItem> = inner
            .records
            .values()
            .filter(|item| item.timestamp >= begin && item.timestamp < end)
            .filter(|item| device.map_or(true, |dev| item.orig_dev == dev))
            .filter(|item| filter.accepts(item))
            .cloned()
            .collect();
        items.sort_by(|a, b| (a.timestamp, &a.key).cmp(&(b.timestamp, &b.key)));
        Ok(items)
    }

    fn appended_len(&self) -> usize {
        self.appended_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_strictly_increase() {
        let store = MemoryStore::new();
        let a = store.put(b"a", b"1").unwrap();
        let b = store.put(b"b", b"2").unwrap();
        let c = store.put(b"a", b"3").unwrap();
        assert!(a < b && b < c);
        assert_eq!(store.get(b"a"), Some(b"3".to_vec()));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn delete_leaves_tombstone() {
        let store = MemoryStore::new();
        store.put(b"a", b"1").unwrap();
        store.delete(b"a").unwrap();
        assert_eq!(store.get(b"a"), None);
        assert_eq!(store.len(), 1);
        assert_eq!(store.delete(b"a"), Err(StorageError::NotFound));
        assert_eq!(store.delete(b"zz"), Err(StorageError::NotFound));
    }

    #[test]
    fn empty_key_rejected() {
        let store = MemoryStore::new();
        assert_eq!(store.put(b"", b"v"), Err(StorageError::InvalidKey));
    }

    #[test]
    fn scan_orders_by_timestamp_and_filters() {
        let store = MemoryStore::new();
        store.put_item(DataItem::live(b"z".to_vec(), b"1".to_vec(), 10)).unwrap();
        store.put_item(DataItem::live(b"a".to_vec(), b"2".to_vec(), 10)).unwrap();
        store.put_item(DataItem::tombstone(b"m".to_vec(), 5)).unwrap();
        store
            .put_item(DataItem::live(b"r".to_vec(), b"3".to_vec(), 20).with_orig_dev("peer"))
            .unwrap();

        let all = store.scan(None, 0, 30, ScanFilter::All).unwrap();
        let keys: Vec<_> = all.iter().map(|i| i.key.clone()).collect();
        assert_eq!(keys, vec![b"m".to_vec(), b"a".to_vec(), b"z".to_vec(), b"r".to_vec()]);

        assert_eq!(store.scan(None, 0, 30, ScanFilter::Live).unwrap().len(), 3);
        assert_eq!(store.scan(None, 0, 30, ScanFilter::Deleted).unwrap().len(), 1);
        assert_eq!(store.scan(None, 10, 20, ScanFilter::All).unwrap().len(), 2);
        assert_eq!(store.scan(Some("peer"), 0, 30, ScanFilter::All).unwrap().len(), 1);
        assert_eq!(store.scan(Some(""), 0, 30, ScanFilter::All).unwrap().len(), 3);
        assert!(store.max_timestamp() >= 20);
    }
}
