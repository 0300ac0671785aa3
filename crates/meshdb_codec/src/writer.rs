//! Error-sticky parcel writer.

use crate::error::{CodecError, CodecResult};
use crate::{eight_byte_align, string_len, vec_len};
use bytes::{BufMut, Bytes, BytesMut};

/// Writes fixed-width big-endian integers and length-prefixed blobs.
///
/// The first failed write (exceeding the configured limit, or a blob longer
/// than `u32::MAX`) latches the error flag; every later write is ignored.
/// Callers check [`ParcelWriter::is_error`] once at the end instead of after
/// every field.
///
/// # Example
///
/// ```
/// use meshdb_codec::ParcelWriter;
///
/// let mut writer = ParcelWriter::new();
/// writer.write_u32(1);
/// writer.write_string("device-a");
/// writer.eight_align();
/// assert!(!writer.is_error());
/// assert_eq!(writer.len(), 24);
/// ```
#[derive(Debug)]
pub struct ParcelWriter {
    buffer: BytesMut,
    limit: usize,
    error: bool,
}

impl Default for ParcelWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl ParcelWriter {
    /// Create a writer without a size limit.
    pub fn new() -> Self {
        Self::with_limit(usize::MAX)
    }

    /// Create a writer that fails once more than `limit` bytes would be written.
    pub fn with_limit(limit: usize) -> Self {
        let capacity = if limit == usize::MAX { 64 } else { limit.min(4096) };
        Self {
            buffer: BytesMut::with_capacity(capacity),
            limit,
            error: false,
        }
    }

    /// Returns true once any write has failed.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error
    }

    /// Number of bytes written so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Returns true if nothing was written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    fn reserve(&mut self, step: usize) -> bool {
        if self.error {
            return false;
        }
        match self.buffer.len().checked_add(step) {
            Some(end) if end <= self.limit => true,
            _ => {
                self.error = true;
                false
            }
        }
    }

    /// Write a single byte.
    pub fn write_u8(&mut self, value: u8) {
        if self.reserve(1) {
            self.buffer.put_u8(value);
        }
    }

    /// Write a bool as one byte.
    pub fn write_bool(&mut self, value: bool) {
        self.write_u8(u8::from(value));
    }

    /// Write a big-endian `u32`.
    pub fn write_u32(&mut self, value: u32) {
        if self.reserve(4) {
            self.buffer.put_u32(value);
        }
    }

    /// Write a big-endian `i32`.
    pub fn write_i32(&mut self, value: i32) {
        if self.reserve(4) {
            self.buffer.put_i32(value);
        }
    }

    /// Write a big-endian `u64`.
    pub fn write_u64(&mut self, value: u64) {
        if self.reserve(8) {
            self.buffer.put_u64(value);
        }
    }

    /// Write a big-endian `i64`.
    pub fn write_i64(&mut self, value: i64) {
        if self.reserve(8) {
            self.buffer.put_i64(value);
        }
    }

    /// Write a `u32` length prefix, the bytes, then zero padding to 8 bytes.
    pub fn write_bytes(&mut self, value: &[u8]) {
        let Ok(len) = u32::try_from(value.len()) else {
            self.error = true;
            return;
        };
        let step = vec_len(value.len());
        if !self.reserve(step) {
            return;
        }
        self.buffer.put_u32(len);
        self.buffer.put_slice(value);
        self.buffer.put_bytes(0, step - 4 - value.len());
    }

    /// Write a UTF-8 string with the same layout as [`ParcelWriter::write_bytes`].
    pub fn write_string(&mut self, value: &str) {
        debug_assert_eq!(string_len(value), vec_len(value.len()));
        self.write_bytes(value.as_bytes());
    }

    /// Pad with zeros up to the next multiple of eight.
    pub fn eight_align(&mut self) {
        let pad = eight_byte_align(self.buffer.len()) - self.buffer.len();
        if pad > 0 && self.reserve(pad) {
            self.buffer.put_bytes(0, pad);
        }
    }

    /// Consume the writer and return the encoded bytes.
    ///
    /// # Errors
    ///
    /// Returns `ParseFail` if any write failed.
    pub fn into_bytes(self) -> CodecResult<Bytes> {
        if self.error {
            return Err(CodecError::parse_fail(format!(
                "parcel write failed after {} bytes (limit {})",
                self.buffer.len(),
                self.limit
            )));
        }
        Ok(self.buffer.freeze())
    }
}
