//! Sync data cursor.
//!
//! A peer pulls changed records in pages bounded by a byte budget and an
//! item budget. Each page that leaves data behind carries a
//! [`ContinueToken`]; passing it back resumes exactly where the page
//! stopped. Query syncs read matching live records first and then the
//! tombstones of the deleted range within the same token.

mod query;
mod reader;
mod token;

pub use query::SyncQuery;
pub use reader::{DataSizeSpec, SyncDataReader, SyncPage};
pub use token::{ContinueToken, SyncTimeRange, TimeRange};
