//! # MeshDB Codec
//!
//! Parcel encoding/decoding for MeshDB sync payloads.
//!
//! A parcel is a flat byte buffer of big-endian fixed-width integers and
//! `u32` length-prefixed blobs padded to eight bytes. Writers and readers
//! are error-sticky: the first failure latches a flag and later operations
//! become no-ops, so a whole record is checked once.
//!
//! Multi-field records start with a version tag; [`check_version`] rejects
//! payloads written by a newer format with `VersionNotSupported`, distinct
//! from `ParseFail` for malformed bytes.
//!
//! ## Usage
//!
//! ```
//! use meshdb_codec::{ParcelReader, ParcelWriter};
//!
//! let mut writer = ParcelWriter::new();
//! writer.write_u64(42);
//! writer.write_string("k1");
//! let bytes = writer.into_bytes().unwrap();
//!
//! let mut reader = ParcelReader::new(&bytes);
//! assert_eq!(reader.read_u64(), 42);
//! assert_eq!(reader.read_string(), "k1");
//! assert!(reader.check("example").is_ok());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod reader;
mod writer;

pub use error::{CodecError, CodecResult};
pub use reader::ParcelReader;
pub use writer::ParcelWriter;

/// Rounds `len` up to the next multiple of eight.
#[must_use]
pub const fn eight_byte_align(len: usize) -> usize {
    (len + 7) & !7
}

/// Encoded size of a `u32`.
#[must_use]
pub const fn u32_len() -> usize {
    4
}

/// Encoded size of a `u64`.
#[must_use]
pub const fn u64_len() -> usize {
    8
}

/// Encoded size of a byte vector of `len` bytes, prefix and padding included.
#[must_use]
pub const fn vec_len(len: usize) -> usize {
    eight_byte_align(u32_len() + len)
}

/// Encoded size of a string.
#[must_use]
pub fn string_len(value: &str) -> usize {
    vec_len(value.len())
}

/// Trait for records that write themselves into a parcel.
pub trait Encode {
    /// Append this value to `writer`.
    fn encode(&self, writer: &mut ParcelWriter);

    /// Encode into a fresh buffer.
    ///
    /// # Errors
    ///
    /// Returns `ParseFail` if the writer latched an error.
    fn to_parcel(&self) -> CodecResult<Vec<u8>> {
        let mut writer = ParcelWriter::new();
        self.encode(&mut writer);
        writer.into_bytes().map(|bytes| bytes.to_vec())
    }
}

/// Trait for records that read themselves from a parcel.
pub trait Decode: Sized {
    /// Read a value from `reader`.
    ///
    /// # Errors
    ///
    /// Returns `VersionNotSupported` or `ParseFail`.
    fn decode(reader: &mut ParcelReader<'_>) -> CodecResult<Self>;

    /// Decode from a complete buffer.
    ///
    /// # Errors
    ///
    /// Returns `VersionNotSupported` or `ParseFail`.
    fn from_parcel(bytes: &[u8]) -> CodecResult<Self> {
        let mut reader = ParcelReader::new(bytes);
        Self::decode(&mut reader)
    }
}

/// Validate a version tag read from a parcel.
///
/// # Errors
///
/// Returns `ParseFail` if the reader already failed, `VersionNotSupported`
/// if `version` is newer than `supported`.
pub fn check_version(reader: &ParcelReader<'_>, version: u32, supported: u32) -> CodecResult<()> {
    reader.check("version tag")?;
    if version > supported {
        return Err(CodecError::VersionNotSupported { version, supported });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn align_helpers() {
        assert_eq!(eight_byte_align(0), 0);
        assert_eq!(eight_byte_align(1), 8);
        assert_eq!(eight_byte_align(8), 8);
        assert_eq!(vec_len(0), 8);
        assert_eq!(vec_len(4), 8);
        assert_eq!(vec_len(5), 16);
        assert_eq!(string_len("abcd"), 8);
    }

    #[test]
    fn future_version_is_distinct_from_parse_fail() {
        let mut writer = ParcelWriter::new();
        writer.write_u32(9);
        let bytes = writer.into_bytes().unwrap();
        let mut reader = ParcelReader::new(&bytes);
        let version = reader.read_u32();
        let err = check_version(&reader, version, 1).unwrap_err();
        assert!(err.is_version_not_supported());

        let mut empty = ParcelReader::new(&[]);
        let version = empty.read_u32();
        let err = check_version(&empty, version, 1).unwrap_err();
        assert!(matches!(err, CodecError::ParseFail { .. }));
    }

    proptest! {
        #[test]
        fn written_length_matches_size_helper(blob in proptest::collection::vec(any::<u8>(), 0..64)) {
            let mut writer = ParcelWriter::new();
            writer.write_bytes(&blob);
            prop_assert_eq!(writer.len(), vec_len(blob.len()));
            let bytes = writer.into_bytes().unwrap();
            let mut reader = ParcelReader::new(&bytes);
            prop_assert_eq!(reader.read_bytes(), blob);
        }
    }
}
