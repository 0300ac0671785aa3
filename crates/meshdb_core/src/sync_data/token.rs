//! Resumable paging state.

use super::query::SyncQuery;
use meshdb_codec::{check_version, CodecResult, Decode, Encode, ParcelReader, ParcelWriter};
use meshdb_storage::{Timestamp, MAX_TIMESTAMP};
use std::collections::BTreeMap;

const CONTINUE_TOKEN_VERSION: u32 = 1;

/// Half-open timestamp range `[begin, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    /// First timestamp included.
    pub begin: Timestamp,
    /// First timestamp excluded.
    pub end: Timestamp,
}

impl TimeRange {
    /// Creates a range.
    #[must_use]
    pub const fn new(begin: Timestamp, end: Timestamp) -> Self {
        Self { begin, end }
    }

    /// Returns true if nothing fits in the range.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.begin >= self.end
    }
}

/// Live and deleted ranges of a query sync request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncTimeRange {
    /// Start of live (query) data.
    pub begin_time: Timestamp,
    /// End of live (query) data, excluded.
    pub end_time: Timestamp,
    /// Start of deleted data.
    pub delete_begin_time: Timestamp,
    /// End of deleted data, excluded.
    pub delete_end_time: Timestamp,
}

impl SyncTimeRange {
    /// Both ranges set to `[begin, end)`.
    #[must_use]
    pub const fn both(begin: Timestamp, end: Timestamp) -> Self {
        Self {
            begin_time: begin,
            end_time: end,
            delete_begin_time: begin,
            delete_end_time: end,
        }
    }

    /// Returns true if neither range is reversed and at least one is non-empty.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.begin_time <= self.end_time
            && self.delete_begin_time <= self.delete_end_time
            && (self.begin_time < self.end_time || self.delete_begin_time < self.delete_end_time)
    }
}

/// Where the next page of a sync read starts.
///
/// A token is handed back with every unfinished page and consumed by the
/// next call. It holds only range bookkeeping, so dropping one early is
/// always safe.
///
/// Live ranges are keyed by device. A whole-store read uses the single key
/// `""`; a per-device read keeps one range per device and drains them in
/// key order. Query reads also carry the query and a deleted-data range
/// that is read after the live range is exhausted.
#[derive(Debug, PartialEq, Eq)]
pub struct ContinueToken {
    per_device: bool,
    time_ranges: BTreeMap<String, TimeRange>,
    deleted_ranges: BTreeMap<String, TimeRange>,
    query: Option<SyncQuery>,
}

fn non_empty(device: &str, range: TimeRange) -> BTreeMap<String, TimeRange> {
    let mut ranges = BTreeMap::new();
    if !range.is_empty() {
        ranges.insert(device.to_owned(), range);
    }
    ranges
}

impl ContinueToken {
    pub(crate) fn whole_store(range: TimeRange) -> Self {
        Self {
            per_device: false,
            time_ranges: non_empty("", range),
            deleted_ranges: BTreeMap::new(),
            query: None,
        }
    }

    pub(crate) fn per_device<'a>(devices: impl IntoIterator<Item = &'a str>, range: TimeRange) -> Self {
        Self {
            per_device: true,
            time_ranges: devices
                .into_iter()
                .filter(|_| !range.is_empty())
                .map(|device| (device.to_owned(), range))
                .collect(),
            deleted_ranges: BTreeMap::new(),
            query: None,
        }
    }

    pub(crate) fn query_sync(range: SyncTimeRange, query: SyncQuery) -> Self {
        Self {
            per_device: false,
            time_ranges: non_empty("", TimeRange::new(range.begin_time, range.end_time)),
            deleted_ranges: non_empty(
                "",
                TimeRange::new(range.delete_begin_time, range.delete_end_time),
            ),
            query: Some(query),
        }
    }

    /// Returns true for query sync tokens.
    #[must_use]
    pub fn is_query_sync(&self) -> bool {
        self.query.is_some()
    }

    /// Returns true if the token reads per device.
    #[must_use]
    pub fn is_per_device(&self) -> bool {
        self.per_device
    }

    /// The query of a query sync token.
    #[must_use]
    pub fn query(&self) -> Option<&SyncQuery> {
        self.query.as_ref()
    }

    /// Returns true if the token still has something to read and its
    /// shape matches its kind.
    ///
    /// Whole-store and query tokens keep at most one range per map, keyed
    /// `""`. Only query tokens carry deleted ranges, and a query token is
    /// never per device.
    #[must_use]
    pub fn check_valid(&self) -> bool {
        let well_formed = self
            .time_ranges
            .values()
            .chain(self.deleted_ranges.values())
            .all(|range| !range.is_empty());
        let pending = !self.time_ranges.is_empty()
            || (self.is_query_sync() && !self.deleted_ranges.is_empty());
        let shaped = if self.per_device {
            !self.is_query_sync() && self.deleted_ranges.is_empty()
        } else {
            let whole_store = |ranges: &BTreeMap<String, TimeRange>| {
                ranges.len() <= 1 && ranges.keys().all(String::is_empty)
            };
            whole_store(&self.time_ranges)
                && whole_store(&self.deleted_ranges)
                && (self.is_query_sync() || self.deleted_ranges.is_empty())
        };
        well_formed && pending && shaped
    }

    /// Device of the range read next and the range itself.
    #[must_use]
    pub fn first_time_range(&self) -> Option<(&str, TimeRange)> {
        self.time_ranges
            .iter()
            .next()
            .map(|(device, range)| (device.as_str(), *range))
    }

    /// The pending deleted-data range.
    #[must_use]
    pub fn deleted_range(&self) -> Option<TimeRange> {
        self.deleted_ranges.values().next().copied()
    }

    /// Device filter for a scan of `device`'s range.
    pub(crate) fn device_filter<'a>(&self, device: &'a str) -> Option<&'a str> {
        self.per_device.then_some(device)
    }

    /// Returns true once the live (query) ranges are exhausted.
    #[must_use]
    pub fn is_get_query_data_finished(&self) -> bool {
        self.time_ranges.is_empty()
    }

    /// Returns true once the deleted range is exhausted.
    #[must_use]
    pub fn is_get_deleted_data_finished(&self) -> bool {
        self.deleted_ranges.is_empty()
    }

    pub(crate) fn finish_get_query_data(&mut self) {
        self.time_ranges.clear();
    }

    pub(crate) fn finish_get_deleted_data(&mut self) {
        self.deleted_ranges.clear();
    }

    pub(crate) fn remove_time_range(&mut self, device: &str) {
        self.time_ranges.remove(device);
    }

    pub(crate) fn set_next_begin_time(&mut self, device: &str, next: Timestamp) {
        advance(&mut self.time_ranges, device, next);
    }

    pub(crate) fn set_deleted_next_begin_time(&mut self, device: &str, next: Timestamp) {
        advance(&mut self.deleted_ranges, device, next);
    }
}

fn advance(ranges: &mut BTreeMap<String, TimeRange>, device: &str, next: Timestamp) {
    let next = next.min(MAX_TIMESTAMP);
    let Some(range) = ranges.get_mut(device) else {
        return;
    };
    if next >= range.end {
        ranges.remove(device);
    } else {
        range.begin = next;
    }
}

fn encode_ranges(writer: &mut ParcelWriter, ranges: &BTreeMap<String, TimeRange>) {
    writer.write_u32(u32::try_from(ranges.len()).unwrap_or(u32::MAX));
    for (device, range) in ranges {
        writer.write_string(device);
        writer.write_u64(range.begin);
        writer.write_u64(range.end);
    }
}

fn decode_ranges(reader: &mut ParcelReader<'_>) -> BTreeMap<String, TimeRange> {
    let count = reader.read_u32();
    let mut ranges = BTreeMap::new();
    for _ in 0..count {
        if reader.is_error() {
            break;
        }
        let device = reader.read_string();
        let begin = reader.read_u64();
        let end = reader.read_u64();
        ranges.insert(device, TimeRange::new(begin, end));
    }
    ranges
}

impl Encode for ContinueToken {
    fn encode(&self, writer: &mut ParcelWriter) {
        writer.write_u32(CONTINUE_TOKEN_VERSION);
        writer.write_bool(self.per_device);
        encode_ranges(writer, &self.time_ranges);
        encode_ranges(writer, &self.deleted_ranges);
        writer.write_bool(self.query.is_some());
        writer.eight_align();
        if let Some(query) = &self.query {
            query.encode(writer);
        }
    }
}

impl Decode for ContinueToken {
    fn decode(reader: &mut ParcelReader<'_>) -> CodecResult<Self> {
        let version = reader.read_u32();
        check_version(reader, version, CONTINUE_TOKEN_VERSION)?;
        let per_device = reader.read_bool();
        let time_ranges = decode_ranges(reader);
        let deleted_ranges = decode_ranges(reader);
        let has_query = reader.read_bool();
        reader.eight_align();
        reader.check("continue token")?;
        let query = if has_query {
            Some(SyncQuery::decode(reader)?)
        } else {
            None
        };
        Ok(Self {
            per_device,
            time_ranges,
            deleted_ranges,
            query,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CursorConfig, DataSizeSpec, DbError, SyncDataReader};
    use meshdb_codec::CodecError;
    use meshdb_storage::{DataItem, MemoryStore};
    use proptest::prelude::*;
    use std::sync::Arc;

    type Ranges<'a> = &'a [(&'a str, Timestamp, Timestamp)];

    fn range_map(ranges: Ranges<'_>) -> BTreeMap<String, TimeRange> {
        ranges
            .iter()
            .map(|(device, begin, end)| ((*device).to_owned(), TimeRange::new(*begin, *end)))
            .collect()
    }

    /// A token as a peer could send it, decoded from the wire.
    fn from_peer(
        per_device: bool,
        time_ranges: Ranges<'_>,
        deleted_ranges: Ranges<'_>,
        query: Option<SyncQuery>,
    ) -> ContinueToken {
        let token = ContinueToken {
            per_device,
            time_ranges: range_map(time_ranges),
            deleted_ranges: range_map(deleted_ranges),
            query,
        };
        ContinueToken::from_parcel(&token.to_parcel().unwrap()).unwrap()
    }

    #[test]
    fn advancing_past_end_drops_range() {
        let mut token = ContinueToken::whole_store(TimeRange::new(10, 20));
        assert!(token.check_valid());
        token.set_next_begin_time("", 15);
        assert_eq!(token.first_time_range(), Some(("", TimeRange::new(15, 20))));
        token.set_next_begin_time("", 20);
        assert!(token.is_get_query_data_finished());
        assert!(!token.check_valid());
    }

    #[test]
    fn empty_ranges_are_not_recorded() {
        let token = ContinueToken::query_sync(
            SyncTimeRange {
                begin_time: 5,
                end_time: 5,
                delete_begin_time: 0,
                delete_end_time: 9,
            },
            SyncQuery::all(),
        );
        assert!(token.is_get_query_data_finished());
        assert_eq!(token.deleted_range(), Some(TimeRange::new(0, 9)));
        assert!(token.check_valid());
    }

    #[test]
    fn per_device_ranges_drain_in_key_order() {
        let mut token = ContinueToken::per_device(["b", "a"], TimeRange::new(0, 100));
        assert_eq!(token.first_time_range().map(|(dev, _)| dev), Some("a"));
        assert_eq!(token.device_filter("a"), Some("a"));
        token.remove_time_range("a");
        assert_eq!(token.first_time_range().map(|(dev, _)| dev), Some("b"));
    }

    #[test]
    fn sync_time_range_validity() {
        assert!(SyncTimeRange::both(1, 2).is_valid());
        assert!(!SyncTimeRange::both(2, 2).is_valid());
        assert!(!SyncTimeRange::both(3, 2).is_valid());
    }

    #[test]
    fn decoded_token_keeps_query_and_position() {
        let mut token =
            ContinueToken::query_sync(SyncTimeRange::both(0, 50), SyncQuery::prefix("k"));
        token.set_next_begin_time("", 7);
        let bytes = token.to_parcel().unwrap();
        let decoded = ContinueToken::from_parcel(&bytes).unwrap();
        assert_eq!(decoded, token);
        assert!(decoded.is_query_sync());
    }

    #[test]
    fn future_token_version_is_rejected() {
        let mut writer = ParcelWriter::new();
        writer.write_u32(CONTINUE_TOKEN_VERSION + 1);
        writer.eight_align();
        let bytes = writer.into_bytes().unwrap();
        let err = ContinueToken::from_parcel(&bytes).unwrap_err();
        assert!(matches!(err, CodecError::VersionNotSupported { .. }));
    }

    #[test]
    fn inconsistent_peer_tokens_are_invalid() {
        // query range under a device key
        assert!(!from_peer(false, &[("dev", 0, 100)], &[], Some(SyncQuery::all())).check_valid());
        // deleted range under a device key
        assert!(!from_peer(false, &[], &[("dev", 0, 100)], Some(SyncQuery::all())).check_valid());
        // per-device query
        assert!(!from_peer(true, &[("dev", 0, 100)], &[], Some(SyncQuery::all())).check_valid());
        // whole-store read with two streams
        assert!(!from_peer(false, &[("", 0, 10), ("a", 0, 10)], &[], None).check_valid());
        // deleted range without a query
        assert!(!from_peer(false, &[("", 0, 10)], &[("", 0, 10)], None).check_valid());
        // per-device read with a deleted range
        assert!(!from_peer(true, &[("a", 0, 10)], &[("a", 0, 10)], None).check_valid());

        assert!(from_peer(false, &[("", 0, 10)], &[("", 0, 10)], Some(SyncQuery::all())).check_valid());
        assert!(from_peer(true, &[("a", 0, 10), ("b", 0, 10)], &[], None).check_valid());
    }

    #[test]
    fn reader_rejects_inconsistent_peer_tokens() {
        let store = Arc::new(MemoryStore::new());
        for ts in 1..=5u64 {
            store
                .put_item(DataItem::live(format!("k{ts}"), "v", ts))
                .unwrap();
        }
        let reader = SyncDataReader::new(store, CursorConfig::default());
        let spec = DataSizeSpec::new(1024 * 1024, 2);

        let tokens = [
            from_peer(false, &[("dev", 0, 100)], &[], Some(SyncQuery::all())),
            from_peer(true, &[("dev", 0, 100)], &[], Some(SyncQuery::all())),
            from_peer(false, &[("", 0, 100), ("dev", 0, 100)], &[], None),
        ];
        for token in tokens {
            assert!(matches!(
                reader.get_sync_data_next(token, spec),
                Err(DbError::InvalidArgs { .. })
            ));
        }

        // A well-formed peer token still pages to the end.
        let mut page = reader
            .get_sync_data_next(
                from_peer(false, &[("", 0, 100)], &[], Some(SyncQuery::all())),
                spec,
            )
            .unwrap();
        let mut stamps: Vec<Timestamp> = page.items.iter().map(|item| item.timestamp).collect();
        while let Some(token) = page.token.take() {
            page = reader.get_sync_data_next(token, spec).unwrap();
            stamps.extend(page.items.iter().map(|item| item.timestamp));
        }
        assert_eq!(stamps, vec![1, 2, 3, 4, 5]);
    }

    proptest! {
        #[test]
        fn query_token_survives_the_wire(
            begin in 0u64..1_000,
            len in 1u64..1_000,
            step in 0u64..2_000,
            prefix in "[a-z]{0,8}",
        ) {
            let mut token = ContinueToken::query_sync(
                SyncTimeRange::both(begin, begin + len),
                SyncQuery::prefix(prefix.as_str()),
            );
            token.set_next_begin_time("", begin + step);
            let decoded = ContinueToken::from_parcel(&token.to_parcel().unwrap()).unwrap();
            prop_assert!(decoded.check_valid());
            prop_assert_eq!(decoded, token);
        }

        #[test]
        fn per_device_token_survives_the_wire(
            devices in proptest::collection::btree_set("[a-z]{1,6}", 1..4),
            begin in 0u64..1_000,
            len in 1u64..1_000,
        ) {
            let token = ContinueToken::per_device(
                devices.iter().map(String::as_str),
                TimeRange::new(begin, begin + len),
            );
            let decoded = ContinueToken::from_parcel(&token.to_parcel().unwrap()).unwrap();
            prop_assert!(decoded.check_valid());
            prop_assert_eq!(decoded.first_time_range().map(|(device, _)| device.to_owned()),
                devices.iter().next().cloned());
            prop_assert_eq!(decoded, token);
        }
    }
}
