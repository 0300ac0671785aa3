//! The scan seam the sync cursor reads through.

use crate::error::StorageResult;
use crate::item::{DataItem, Timestamp};

/// Which records a scan returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanFilter {
    /// Live records and tombstones.
    All,
    /// Live records only.
    Live,
    /// Tombstones only.
    Deleted,
}

impl ScanFilter {
    /// Returns true if `item` passes this filter.
    #[must_use]
    pub fn accepts(self, item: &DataItem) -> bool {
        match self {
            Self::All => true,
            Self::Live => !item.is_deleted(),
            Self::Deleted => item.is_deleted(),
        }
    }
}

/// A store that can list changed records by commit timestamp.
///
/// Implementations return every record with `begin <= timestamp < end`
/// that passes `filter`, ordered by timestamp and then key. A `device` of
/// `None` covers the whole store; `Some(dev)` limits the scan to records
/// that originated on `dev` (`Some("")` for local writes).
pub trait SyncSource: Send + Sync {
    /// List changed records in `[begin, end)`.
    fn scan(
        &self,
        device: Option<&str>,
        begin: Timestamp,
        end: Timestamp,
        filter: ScanFilter,
    ) -> StorageResult<Vec<DataItem>>;

    /// Extra bytes every item costs on the wire for this store.
    fn appended_len(&self) -> usize {
        0
    }
}
