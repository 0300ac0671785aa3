//! # MeshDB Storage
//!
//! Data items and the storage seam the sync layer reads through.
//!
//! The on-disk engine is not part of this crate. The sync cursor only
//! needs a [`SyncSource`]: something that lists changed records in a
//! timestamp range, live records and tombstones alike.
//!
//! ## Available Sources
//!
//! - [`MemoryStore`] - in-memory natural store for tests, tools and benches
//!
//! ## Example
//!
//! ```rust
//! use meshdb_storage::{MemoryStore, ScanFilter, SyncSource};
//!
//! let store = MemoryStore::new();
//! store.put(b"k1", b"v1").unwrap();
//! let items = store.scan(None, 0, u64::MAX, ScanFilter::All).unwrap();
//! assert_eq!(items[0].value, b"v1");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod item;
mod memory;
mod source;

pub use error::{StorageError, StorageResult};
pub use item::{DataFlags, DataItem, Timestamp, MAX_TIMESTAMP};
pub use memory::MemoryStore;
pub use source::{ScanFilter, SyncSource};
