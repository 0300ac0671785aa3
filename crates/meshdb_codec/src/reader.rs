//! Error-sticky parcel reader.

use crate::eight_byte_align;
use crate::error::{CodecError, CodecResult};
use bytes::Buf;

/// Reads values written by [`crate::ParcelWriter`].
///
/// Reads past the end or malformed lengths latch the error flag and make
/// every later read return a zero value.
#[derive(Debug)]
pub struct ParcelReader<'a> {
    buffer: &'a [u8],
    consumed: usize,
    error: bool,
}

impl<'a> ParcelReader<'a> {
    /// Create a reader over `buffer`.
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            consumed: 0,
            error: false,
        }
    }

    /// Returns true once any read has failed.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error
    }

    /// Returns true while unread bytes remain.
    #[must_use]
    pub fn is_continue_read(&self) -> bool {
        !self.error && !self.buffer.is_empty()
    }

    /// Number of bytes consumed so far.
    #[must_use]
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    fn take(&mut self, step: usize) -> Option<&'a [u8]> {
        if self.error || self.buffer.len() < step {
            self.error = true;
            return None;
        }
        let (head, tail) = self.buffer.split_at(step);
        self.buffer = tail;
        self.consumed += step;
        Some(head)
    }

    /// Read a single byte.
    pub fn read_u8(&mut self) -> u8 {
        self.take(1).map_or(0, |mut b| b.get_u8())
    }

    /// Read a bool written as one byte.
    pub fn read_bool(&mut self) -> bool {
        self.read_u8() != 0
    }

    /// Read a big-endian `u32`.
    pub fn read_u32(&mut self) -> u32 {
        self.take(4).map_or(0, |mut b| b.get_u32())
    }

    /// Read a big-endian `i32`.
    pub fn read_i32(&mut self) -> i32 {
        self.take(4).map_or(0, |mut b| b.get_i32())
    }

    /// Read a big-endian `u64`.
    pub fn read_u64(&mut self) -> u64 {
        self.take(8).map_or(0, |mut b| b.get_u64())
    }

    /// Read a big-endian `i64`.
    pub fn read_i64(&mut self) -> i64 {
        self.take(8).map_or(0, |mut b| b.get_i64())
    }

    /// Read a length-prefixed, eight-byte padded blob.
    pub fn read_bytes(&mut self) -> Vec<u8> {
        if self.error || self.buffer.len() < 4 {
            self.error = true;
            return Vec::new();
        }
        let head = &self.buffer[..4];
        let len = u32::from_be_bytes([head[0], head[1], head[2], head[3]]) as usize;
        let step = eight_byte_align(4 + len);
        match self.take(step) {
            Some(chunk) => chunk[4..4 + len].to_vec(),
            None => Vec::new(),
        }
    }

    /// Read a length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> String {
        let raw = self.read_bytes();
        match String::from_utf8(raw) {
            Ok(value) => value,
            Err(_) => {
                self.error = true;
                String::new()
            }
        }
    }

    /// Skip padding up to the next multiple of eight.
    pub fn eight_align(&mut self) {
        let pad = eight_byte_align(self.consumed) - self.consumed;
        if pad > 0 {
            let _ = self.take(pad);
        }
    }

    /// Convert the sticky error flag into a `ParseFail` naming `what`.
    ///
    /// # Errors
    ///
    /// Returns `ParseFail` if any read failed.
    pub fn check(&self, what: &str) -> CodecResult<()> {
        if self.error {
            return Err(CodecError::parse_fail(format!(
                "{what}: malformed parcel at byte {}",
                self.consumed
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ParcelWriter;

    #[test]
    fn reads_what_was_written() {
        let mut writer = ParcelWriter::new();
        writer.write_u32(3);
        writer.write_i64(-9);
        writer.write_string("peer");
        writer.write_bool(true);
        writer.eight_align();
        writer.write_bytes(&[9, 9]);
        let bytes = writer.into_bytes().unwrap();

        let mut reader = ParcelReader::new(&bytes);
        assert_eq!(reader.read_u32(), 3);
        assert_eq!(reader.read_i64(), -9);
        assert_eq!(reader.read_string(), "peer");
        assert!(reader.read_bool());
        reader.eight_align();
        assert_eq!(reader.read_bytes(), vec![9, 9]);
        assert!(!reader.is_continue_read());
        reader.check("mixed").unwrap();
    }

    #[test]
    fn truncated_blob_sets_error() {
        let mut writer = ParcelWriter::new();
        writer.write_bytes(b"0123456789");
        let bytes = writer.into_bytes().unwrap();

        let mut reader = ParcelReader::new(&bytes[..10]);
        assert!(reader.read_bytes().is_empty());
        assert!(reader.is_error());
        assert_eq!(reader.read_u32(), 0);
        assert!(reader.check("blob").is_err());
    }

    #[test]
    fn invalid_utf8_sets_error() {
        let mut writer = ParcelWriter::new();
        writer.write_bytes(&[0xff, 0xfe]);
        let bytes = writer.into_bytes().unwrap();

        let mut reader = ParcelReader::new(&bytes);
        assert_eq!(reader.read_string(), "");
        assert!(reader.is_error());
    }
}
