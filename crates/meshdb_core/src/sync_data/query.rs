//! Query predicates for query sync.

use meshdb_codec::{check_version, CodecResult, Decode, Encode, ParcelReader, ParcelWriter};
use meshdb_storage::DataItem;
use std::collections::BTreeSet;

const SYNC_QUERY_VERSION: u32 = 1;

/// Which live records a peer subscribed to.
///
/// A record matches when its key starts with the prefix, is one of the
/// listed keys (if any are listed), and its value contains the value
/// pattern (if one is set). Queries without a value pattern are key-only.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SyncQuery {
    prefix: Vec<u8>,
    keys: BTreeSet<Vec<u8>>,
    value_contains: Option<Vec<u8>>,
}

impl SyncQuery {
    /// Matches every record.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Matches keys starting with `prefix`.
    #[must_use]
    pub fn prefix(prefix: impl Into<Vec<u8>>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Self::default()
        }
    }

    /// Matches exactly the given keys.
    #[must_use]
    pub fn in_keys<I, K>(keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<Vec<u8>>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Also require the value to contain `pattern`.
    #[must_use]
    pub fn value_contains(mut self, pattern: impl Into<Vec<u8>>) -> Self {
        self.value_contains = Some(pattern.into());
        self
    }

    /// Returns true if only keys are inspected.
    #[must_use]
    pub fn is_query_only_by_key(&self) -> bool {
        self.value_contains.is_none()
    }

    /// Returns true if `key` passes the key conditions.
    #[must_use]
    pub fn matches_key(&self, key: &[u8]) -> bool {
        key.starts_with(&self.prefix) && (self.keys.is_empty() || self.keys.contains(key))
    }

    /// Returns true if `item` matches.
    #[must_use]
    pub fn matches(&self, item: &DataItem) -> bool {
        if !self.matches_key(&item.key) {
            return false;
        }
        match &self.value_contains {
            None => true,
            Some(pattern) if pattern.is_empty() => true,
            Some(pattern) => item
                .value
                .windows(pattern.len())
                .any(|window| window == pattern.as_slice()),
        }
    }
}

impl Encode for SyncQuery {
    fn encode(&self, writer: &mut ParcelWriter) {
        writer.write_u32(SYNC_QUERY_VERSION);
        writer.write_bytes(&self.prefix);
        writer.write_u32(u32::try_from(self.keys.len()).unwrap_or(u32::MAX));
        for key in &self.keys {
            writer.write_bytes(key);
        }
        writer.write_bool(self.value_contains.is_some());
        writer.write_bytes(self.value_contains.as_deref().unwrap_or_default());
        writer.eight_align();
    }
}

impl Decode for SyncQuery {
    fn decode(reader: &mut ParcelReader<'_>) -> CodecResult<Self> {
        let version = reader.read_u32();
        check_version(reader, version, SYNC_QUERY_VERSION)?;
        let prefix = reader.read_bytes();
        let count = reader.read_u32();
        let mut keys = BTreeSet::new();
        for _ in 0..count {
            if reader.is_error() {
                break;
            }
            keys.insert(reader.read_bytes());
        }
        let has_value = reader.read_bool();
        let pattern = reader.read_bytes();
        reader.eight_align();
        reader.check("sync query")?;
        Ok(Self {
            prefix,
            keys,
            value_contains: has_value.then_some(pattern),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshdb_codec::CodecError;

    #[test]
    fn matching_rules() {
        let item = DataItem::live(b"user/1".to_vec(), b"name=ann".to_vec(), 1);
        assert!(SyncQuery::all().matches(&item));
        assert!(SyncQuery::prefix("user/").matches(&item));
        assert!(!SyncQuery::prefix("order/").matches(&item));
        assert!(SyncQuery::in_keys(["user/1"]).matches(&item));
        assert!(!SyncQuery::in_keys(["user/2"]).matches(&item));
        assert!(SyncQuery::prefix("user/").value_contains("ann").matches(&item));
        assert!(!SyncQuery::prefix("user/").value_contains("bob").matches(&item));
        assert!(SyncQuery::prefix("user/").value_contains("bob").matches_key(b"user/1"));
    }

    #[test]
    fn key_only_detection() {
        assert!(SyncQuery::prefix("a").is_query_only_by_key());
        assert!(!SyncQuery::all().value_contains("x").is_query_only_by_key());
    }

    #[test]
    fn codec_keeps_value_pattern() {
        let query = SyncQuery::in_keys(["a", "b"]).value_contains("");
        let bytes = query.to_parcel().unwrap();
        assert_eq!(bytes.len() % 8, 0);
        let decoded = SyncQuery::from_parcel(&bytes).unwrap();
        assert_eq!(decoded, query);
        assert!(!decoded.is_query_only_by_key());
    }

    #[test]
    fn truncated_payload_is_parse_fail() {
        let bytes = SyncQuery::prefix("abc").to_parcel().unwrap();
        let err = SyncQuery::from_parcel(&bytes[..6]).unwrap_err();
        assert!(matches!(err, CodecError::ParseFail { .. }));
    }
}
