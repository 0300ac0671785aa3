//! Sync data items.

use meshdb_codec::{check_version, u32_len, u64_len, vec_len, CodecResult, Decode, Encode};
use meshdb_codec::{ParcelReader, ParcelWriter};
use std::ops::BitOr;

/// Commit timestamp in 100ns units. Ordered, never zero for stored data.
pub type Timestamp = u64;

/// Largest timestamp a range may reach.
pub const MAX_TIMESTAMP: Timestamp = i64::MAX as u64;

/// Reserved width for the origin device when estimating item size.
const MAX_ORIG_DEV_LENGTH: usize = 40;

const DATA_ITEM_VERSION: u32 = 1;

/// Bit flags carried by a [`DataItem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DataFlags(u64);

impl DataFlags {
    /// The record is a tombstone.
    pub const DELETE: Self = Self(0x01);
    /// The record stands in for a row that no longer matches the sync query.
    pub const REMOTE_DEVICE_DATA_MISS_QUERY: Self = Self(0x10);

    /// No flags set.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Raw bits.
    #[must_use]
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Build from raw bits.
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Returns true if every bit of `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set the bits of `other`.
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl BitOr for DataFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// One changed record as handed to the sync layer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DataItem {
    /// Record key (a hash of the key for miss-query items).
    pub key: Vec<u8>,
    /// Record value, empty for tombstones and miss-query items.
    pub value: Vec<u8>,
    /// Commit timestamp used for ordering and paging.
    pub timestamp: Timestamp,
    /// Timestamp of the original write.
    pub write_timestamp: Timestamp,
    /// Record flags.
    pub flags: DataFlags,
    /// Device the record originated from; empty for local writes.
    pub orig_dev: String,
}

impl DataItem {
    /// A live record.
    pub fn live(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>, timestamp: Timestamp) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            timestamp,
            write_timestamp: timestamp,
            flags: DataFlags::empty(),
            orig_dev: String::new(),
        }
    }

    /// A tombstone.
    pub fn tombstone(key: impl Into<Vec<u8>>, timestamp: Timestamp) -> Self {
        Self {
            key: key.into(),
            value: Vec::new(),
            timestamp,
            write_timestamp: timestamp,
            flags: DataFlags::DELETE,
            orig_dev: String::new(),
        }
    }

    /// Set the origin device.
    #[must_use]
    pub fn with_orig_dev(mut self, device: impl Into<String>) -> Self {
        self.orig_dev = device.into();
        self
    }

    /// Returns true for tombstones.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.flags.contains(DataFlags::DELETE)
    }

    /// Estimated wire size used against the page byte budget.
    ///
    /// Three `u64` (timestamps and flags), the `u32` version, the padded key
    /// and value, at least [`MAX_ORIG_DEV_LENGTH`] bytes for the origin device,
    /// plus `append_len` bytes of per-store overhead.
    #[must_use]
    pub fn serial_size(&self, append_len: usize) -> usize {
        u64_len() * 3
            + u32_len()
            + vec_len(self.key.len())
            + vec_len(self.value.len())
            + self.orig_dev.len().max(MAX_ORIG_DEV_LENGTH)
            + append_len
    }
}

impl Encode for DataItem {
    fn encode(&self, writer: &mut ParcelWriter) {
        writer.write_u32(DATA_ITEM_VERSION);
        writer.write_u64(self.timestamp);
        writer.write_u64(self.write_timestamp);
        writer.write_u64(self.flags.bits());
        writer.write_bytes(&self.key);
        writer.write_bytes(&self.value);
        writer.write_string(&self.orig_dev);
        writer.eight_align();
    }
}

impl Decode for DataItem {
    fn decode(reader: &mut ParcelReader<'_>) -> CodecResult<Self> {
        let version = reader.read_u32();
        check_version(reader, version, DATA_ITEM_VERSION)?;
        let item = Self {
            timestamp: reader.read_u64(),
            write_timestamp: reader.read_u64(),
            flags: DataFlags::from_bits(reader.read_u64()),
            key: reader.read_bytes(),
            value: reader.read_bytes(),
            orig_dev: reader.read_string(),
        };
        reader.eight_align();
        reader.check("data item")?;
        Ok(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_size_reserves_device_width() {
        let item = DataItem::live(b"k1".to_vec(), b"v1".to_vec(), 10);
        assert_eq!(item.serial_size(0), 24 + 4 + 8 + 8 + 40);
        assert_eq!(item.serial_size(16), 24 + 4 + 8 + 8 + 40 + 16);

        let long = item.with_orig_dev("d".repeat(50));
        assert_eq!(long.serial_size(0), 24 + 4 + 8 + 8 + 50);
    }

    #[test]
    fn tombstone_flags() {
        let item = DataItem::tombstone(b"gone".to_vec(), 5);
        assert!(item.is_deleted());
        assert!(item.value.is_empty());
        let mut flags = item.flags;
        flags.insert(DataFlags::REMOTE_DEVICE_DATA_MISS_QUERY);
        assert!(flags.contains(DataFlags::DELETE | DataFlags::REMOTE_DEVICE_DATA_MISS_QUERY));
    }

    #[test]
    fn parcel_layout_is_stable() {
        let item = DataItem::live(b"key".to_vec(), b"value".to_vec(), 7).with_orig_dev("peer");
        let bytes = item.to_parcel().unwrap();
        assert_eq!(bytes.len() % 8, 0);
        assert_eq!(DataItem::from_parcel(&bytes).unwrap(), item);
    }

    #[test]
    fn rejects_newer_item_version() {
        let mut writer = ParcelWriter::new();
        writer.write_u32(DATA_ITEM_VERSION + 1);
        let bytes = writer.into_bytes().unwrap();
        let err = DataItem::from_parcel(&bytes).unwrap_err();
        assert!(err.is_version_not_supported());
    }
}
