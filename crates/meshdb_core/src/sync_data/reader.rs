//! Page-at-a-time reads of changed records.

use super::query::SyncQuery;
use super::token::{ContinueToken, SyncTimeRange, TimeRange};
use crate::config::CursorConfig;
use crate::error::{DbError, DbResult};
use crate::lifecycle::LifeCycleTimer;
use meshdb_storage::{DataFlags, DataItem, ScanFilter, SyncSource, Timestamp};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Byte and item budget of one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataSizeSpec {
    /// Byte budget, measured with [`DataItem::serial_size`].
    pub block_size: usize,
    /// Item budget.
    pub packet_size: usize,
}

impl DataSizeSpec {
    /// Creates a budget.
    #[must_use]
    pub const fn new(block_size: usize, packet_size: usize) -> Self {
        Self {
            block_size,
            packet_size,
        }
    }
}

/// One page of changed records.
#[derive(Debug)]
pub struct SyncPage {
    /// Records in non-decreasing timestamp order.
    pub items: Vec<DataItem>,
    /// Where to continue; `None` once the request is exhausted.
    pub token: Option<ContinueToken>,
}

impl SyncPage {
    /// Returns true if no further page exists.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.token.is_none()
    }
}

/// Where a scan stopped.
enum Fill {
    Finished,
    /// The budget ran out. Carries the timestamp of the last item this
    /// scan added, if it added any.
    Unfinished(Option<Timestamp>),
}

/// Accumulates one page across scans.
struct PageBuilder {
    items: Vec<DataItem>,
    total: usize,
    spec: DataSizeSpec,
    append_len: usize,
}

impl PageBuilder {
    fn new(spec: DataSizeSpec, append_len: usize) -> Self {
        Self {
            items: Vec::new(),
            total: 0,
            spec,
            append_len,
        }
    }

    fn is_full(&self, size: usize) -> bool {
        let over_bytes = self.total + size > self.spec.block_size && !self.items.is_empty();
        over_bytes || self.items.len() >= self.spec.packet_size
    }

    /// Appends `candidates` until the budget stops the page.
    ///
    /// Items sharing the timestamp of the last item added by this scan are
    /// appended past the budget so a timestamp never spans two pages.
    fn fill(&mut self, candidates: Vec<DataItem>) -> Fill {
        let mut last_added: Option<Timestamp> = None;
        let mut stopped = false;
        for item in candidates {
            if stopped {
                if last_added != Some(item.timestamp) {
                    break;
                }
            } else if self.is_full(item.serial_size(self.append_len)) {
                stopped = true;
                if last_added != Some(item.timestamp) {
                    break;
                }
            }
            self.total += item.serial_size(self.append_len);
            last_added = Some(item.timestamp);
            self.items.push(item);
        }
        if stopped {
            Fill::Unfinished(last_added)
        } else {
            Fill::Finished
        }
    }

    fn can_hold_deleted_data(&self, threshold: f64) -> bool {
        self.items.is_empty() || (self.total as f64) < self.spec.block_size as f64 * threshold
    }

    fn finish(self, token: ContinueToken) -> DbResult<SyncPage> {
        if !token.check_valid() {
            return Ok(SyncPage {
                items: self.items,
                token: None,
            });
        }
        if self.items.is_empty() {
            tracing::error!("unfinished sync page carries no data");
            return Err(DbError::internal("unfinished sync page is empty"));
        }
        Ok(SyncPage {
            items: self.items,
            token: Some(token),
        })
    }
}

fn next_begin(last: Timestamp) -> Timestamp {
    last.saturating_add(1)
}

fn miss_query_item(mut item: DataItem) -> DataItem {
    item.key = Sha256::digest(&item.key).to_vec();
    item.value.clear();
    item.flags.insert(DataFlags::REMOTE_DEVICE_DATA_MISS_QUERY);
    item
}

/// Reads changed records from a [`SyncSource`] in bounded pages.
///
/// The first call of a request takes a time range (and a query or device
/// list) and returns a [`SyncPage`]. While the page carries a token, hand
/// it to [`SyncDataReader::get_sync_data_next`] for the next page.
///
/// # Example
///
/// ```rust
/// use meshdb_core::{CursorConfig, DataSizeSpec, SyncDataReader};
/// use meshdb_storage::MemoryStore;
/// use std::sync::Arc;
///
/// let store = Arc::new(MemoryStore::new());
/// for i in 0..5 {
///     store.put(format!("k{i}").as_bytes(), b"v").unwrap();
/// }
/// let reader = SyncDataReader::new(store, CursorConfig::default());
/// let spec = DataSizeSpec::new(1024 * 1024, 2);
///
/// let mut page = reader.get_sync_data(0, u64::MAX >> 1, spec).unwrap();
/// let mut total = page.items.len();
/// while let Some(token) = page.token.take() {
///     page = reader.get_sync_data_next(token, spec).unwrap();
///     total += page.items.len();
/// }
/// assert_eq!(total, 5);
/// ```
pub struct SyncDataReader {
    source: Arc<dyn SyncSource>,
    config: CursorConfig,
    life_cycle: Option<Arc<LifeCycleTimer>>,
}

impl SyncDataReader {
    /// Creates a reader over `source`.
    pub fn new(source: Arc<dyn SyncSource>, config: CursorConfig) -> Self {
        Self {
            source,
            config,
            life_cycle: None,
        }
    }

    /// Beats `timer` on every read so the store is not closed mid-sync.
    #[must_use]
    pub fn with_life_cycle_timer(mut self, timer: Arc<LifeCycleTimer>) -> Self {
        self.life_cycle = Some(timer);
        self
    }

    /// First page of every record in `[begin, end)`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgs` if `begin >= end` or the budget is unusable.
    pub fn get_sync_data(
        &self,
        begin: Timestamp,
        end: Timestamp,
        spec: DataSizeSpec,
    ) -> DbResult<SyncPage> {
        self.check_spec(spec)?;
        if begin >= end {
            return Err(DbError::invalid_args("begin time must be before end time"));
        }
        self.heart_beat();
        self.read_page(ContinueToken::whole_store(TimeRange::new(begin, end)), spec)
    }

    /// First page of a query sync: live records of `range.begin_time..end_time`
    /// followed by tombstones of `range.delete_begin_time..delete_end_time`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgs` for an invalid range or budget.
    pub fn get_sync_data_by_query(
        &self,
        query: SyncQuery,
        range: SyncTimeRange,
        spec: DataSizeSpec,
    ) -> DbResult<SyncPage> {
        self.check_spec(spec)?;
        if !range.is_valid() {
            return Err(DbError::invalid_args("invalid query sync time range"));
        }
        self.heart_beat();
        self.read_page(ContinueToken::query_sync(range, query), spec)
    }

    /// First page of records in `[begin, end)` that originated on `devices`,
    /// one device after another.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgs` for an empty device list, `begin >= end` or an
    /// unusable budget.
    pub fn get_sync_data_by_devices(
        &self,
        devices: &[&str],
        begin: Timestamp,
        end: Timestamp,
        spec: DataSizeSpec,
    ) -> DbResult<SyncPage> {
        self.check_spec(spec)?;
        if devices.is_empty() {
            return Err(DbError::invalid_args("no devices"));
        }
        if begin >= end {
            return Err(DbError::invalid_args("begin time must be before end time"));
        }
        self.heart_beat();
        let token = ContinueToken::per_device(devices.iter().copied(), TimeRange::new(begin, end));
        self.read_page(token, spec)
    }

    /// Next page of the request `token` belongs to.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgs` if the token is exhausted or malformed, or the
    /// budget is unusable.
    pub fn get_sync_data_next(&self, token: ContinueToken, spec: DataSizeSpec) -> DbResult<SyncPage> {
        self.check_spec(spec)?;
        if !token.check_valid() {
            tracing::warn!("continue token is exhausted or malformed");
            return Err(DbError::invalid_args("invalid continue token"));
        }
        self.heart_beat();
        self.read_page(token, spec)
    }

    fn check_spec(&self, spec: DataSizeSpec) -> DbResult<()> {
        if spec.block_size > self.config.max_sync_block_size {
            return Err(DbError::invalid_args(format!(
                "block size {} over limit {}",
                spec.block_size, self.config.max_sync_block_size
            )));
        }
        if spec.packet_size == 0 {
            return Err(DbError::invalid_args("packet size must be positive"));
        }
        Ok(())
    }

    fn heart_beat(&self) {
        if let Some(timer) = &self.life_cycle {
            if let Err(err) = timer.heart_beat() {
                tracing::warn!(error = %err, "life cycle heart beat failed");
            }
        }
    }

    fn append_len(&self) -> usize {
        self.config.appended_len + self.source.appended_len()
    }

    fn read_page(&self, token: ContinueToken, spec: DataSizeSpec) -> DbResult<SyncPage> {
        let page = if token.is_query_sync() {
            self.read_query_page(token, spec)?
        } else {
            self.read_range_page(token, spec)?
        };
        tracing::debug!(
            items = page.items.len(),
            finished = page.is_finished(),
            "sync page read"
        );
        Ok(page)
    }

    fn read_range_page(&self, mut token: ContinueToken, spec: DataSizeSpec) -> DbResult<SyncPage> {
        let mut page = PageBuilder::new(spec, self.append_len());
        while let Some((device, range)) = token.first_time_range() {
            let device = device.to_owned();
            let candidates =
                self.source
                    .scan(token.device_filter(&device), range.begin, range.end, ScanFilter::All)?;
            match page.fill(candidates) {
                Fill::Finished => token.remove_time_range(&device),
                Fill::Unfinished(last) => {
                    if let Some(last) = last {
                        token.set_next_begin_time(&device, next_begin(last));
                    }
                    break;
                }
            }
        }
        page.finish(token)
    }

    fn read_query_page(&self, mut token: ContinueToken, spec: DataSizeSpec) -> DbResult<SyncPage> {
        let mut page = PageBuilder::new(spec, self.append_len());

        if let Some((device, range)) = token.first_time_range() {
            let device = device.to_owned();
            let candidates = self.query_candidates(&token, range)?;
            match page.fill(candidates) {
                Fill::Finished => token.finish_get_query_data(),
                Fill::Unfinished(last) => {
                    if let Some(last) = last {
                        token.set_next_begin_time(&device, next_begin(last));
                    }
                    return page.finish(token);
                }
            }
        }

        if let Some(range) = token.deleted_range() {
            if !page.can_hold_deleted_data(self.config.query_sync_threshold) {
                return page.finish(token);
            }
            let candidates = self.deleted_candidates(&token, range)?;
            match page.fill(candidates) {
                Fill::Finished => token.finish_get_deleted_data(),
                Fill::Unfinished(last) => {
                    if let Some(last) = last {
                        token.set_deleted_next_begin_time("", next_begin(last));
                    }
                }
            }
        }
        page.finish(token)
    }

    /// Tombstones carry no value, so only the key conditions apply.
    fn deleted_candidates(&self, token: &ContinueToken, range: TimeRange) -> DbResult<Vec<DataItem>> {
        let deleted = self
            .source
            .scan(None, range.begin, range.end, ScanFilter::Deleted)?;
        Ok(match token.query() {
            Some(query) => deleted
                .into_iter()
                .filter(|item| query.matches_key(&item.key))
                .collect(),
            None => deleted,
        })
    }

    fn query_candidates(&self, token: &ContinueToken, range: TimeRange) -> DbResult<Vec<DataItem>> {
        let Some(query) = token.query() else {
            return Err(DbError::internal("query token without query"));
        };
        let live = self
            .source
            .scan(None, range.begin, range.end, ScanFilter::Live)?;
        if query.is_query_only_by_key() {
            return Ok(live.into_iter().filter(|item| query.matches(item)).collect());
        }
        Ok(live
            .into_iter()
            .map(|item| {
                if query.matches(&item) {
                    item
                } else {
                    miss_query_item(item)
                }
            })
            .collect())
    }
}
