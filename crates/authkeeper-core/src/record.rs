//! Length-delimited record codec.
//!
//! One serializer backs both the on-disk state files (`password`, `policy`)
//! and the wire bodies exchanged over the endpoint sockets:
//!
//! - unsigned integers are 4-byte little-endian,
//! - signed integers are 4-byte little-endian two's complement,
//! - the expiry deadline is an 8-byte little-endian signed integer,
//! - booleans are a single byte (`0` or `1`),
//! - strings are a `u32` byte length followed by UTF-8 bytes,
//! - byte fields and sequences are a `u32` length/count followed by their
//!   elements.
//!
//! # Bounded Reads
//!
//! Every variable-length read validates the declared length against a cap
//! before allocating, so a corrupted file or hostile frame cannot trigger
//! memory exhaustion. Reads past the end of the buffer fail with
//! [`RecordError::Truncated`] rather than panicking.

use bytes::{BufMut, Bytes, BytesMut};

/// Upper bound for a single string or byte field.
///
/// Generous compared to the 32-byte password cap; it exists so a corrupted
/// length prefix fails fast instead of allocating gigabytes.
pub const MAX_FIELD_LEN: usize = 4096;

/// Upper bound for a sequence count (history entries, forbidden passwords).
pub const MAX_SEQUENCE_LEN: usize = 4096;

/// Errors raised while decoding a record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    /// The buffer ended before the field did.
    #[error("record truncated: needed {needed} more bytes, {available} available")]
    Truncated {
        /// Bytes the current field still required.
        needed: usize,
        /// Bytes left in the buffer.
        available: usize,
    },

    /// A declared length exceeded the permitted cap.
    #[error("field length {len} exceeds maximum of {max}")]
    FieldTooLarge {
        /// Declared length.
        len: usize,
        /// Permitted maximum.
        max: usize,
    },

    /// A string field held invalid UTF-8.
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    /// A boolean byte was neither 0 nor 1.
    #[error("invalid boolean byte {0}")]
    InvalidBool(u8),

    /// A discriminant did not name a known variant.
    #[error("unknown discriminant {0}")]
    UnknownDiscriminant(u32),
}

/// Append-only record builder.
#[derive(Debug, Default)]
pub struct RecordWriter {
    buf: BytesMut,
}

impl RecordWriter {
    /// Creates an empty writer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a writer with `capacity` bytes pre-reserved.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.put_u32_le(value);
    }

    pub fn put_i32(&mut self, value: i32) {
        self.buf.put_i32_le(value);
    }

    pub fn put_i64(&mut self, value: i64) {
        self.buf.put_i64_le(value);
    }

    pub fn put_bool(&mut self, value: bool) {
        self.buf.put_u8(u8::from(value));
    }

    /// Writes a length-prefixed byte field.
    pub fn put_bytes(&mut self, value: &[u8]) {
        debug_assert!(value.len() <= MAX_FIELD_LEN);
        self.put_u32(value.len() as u32);
        self.buf.put_slice(value);
    }

    /// Writes a length-prefixed UTF-8 string.
    pub fn put_str(&mut self, value: &str) {
        self.put_bytes(value.as_bytes());
    }

    /// Writes a sequence count; the caller then writes each element.
    pub fn put_count(&mut self, count: usize) {
        debug_assert!(count <= MAX_SEQUENCE_LEN);
        self.put_u32(count as u32);
    }

    /// Number of bytes written so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns `true` if nothing has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Finalizes the record.
    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Sequential record reader over a borrowed buffer.
#[derive(Debug)]
pub struct RecordReader<'a> {
    buf: &'a [u8],
}

impl<'a> RecordReader<'a> {
    /// Wraps `buf` for sequential decoding.
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Bytes not yet consumed.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    /// Returns `true` once every byte has been consumed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], RecordError> {
        if self.buf.len() < n {
            return Err(RecordError::Truncated {
                needed: n - self.buf.len(),
                available: self.buf.len(),
            });
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub fn get_u32(&mut self) -> Result<u32, RecordError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn get_i32(&mut self) -> Result<i32, RecordError> {
        let bytes = self.take(4)?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn get_i64(&mut self) -> Result<i64, RecordError> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(i64::from_le_bytes(raw))
    }

    pub fn get_bool(&mut self) -> Result<bool, RecordError> {
        match self.take(1)?[0] {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(RecordError::InvalidBool(other)),
        }
    }

    /// Reads a length-prefixed byte field, validating the length before
    /// allocating.
    pub fn get_bytes(&mut self) -> Result<Vec<u8>, RecordError> {
        let len = self.get_u32()? as usize;
        if len > MAX_FIELD_LEN {
            return Err(RecordError::FieldTooLarge {
                len,
                max: MAX_FIELD_LEN,
            });
        }
        Ok(self.take(len)?.to_vec())
    }

    /// Reads a length-prefixed UTF-8 string.
    pub fn get_str(&mut self) -> Result<String, RecordError> {
        let bytes = self.get_bytes()?;
        String::from_utf8(bytes).map_err(|_| RecordError::InvalidUtf8)
    }

    /// Reads a sequence count, validating it against [`MAX_SEQUENCE_LEN`].
    pub fn get_count(&mut self) -> Result<usize, RecordError> {
        let count = self.get_u32()? as usize;
        if count > MAX_SEQUENCE_LEN {
            return Err(RecordError::FieldTooLarge {
                len: count,
                max: MAX_SEQUENCE_LEN,
            });
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_round_trip() {
        let mut w = RecordWriter::new();
        w.put_u32(0xDEAD_BEEF);
        w.put_i32(-42);
        w.put_i64(i64::MAX);
        w.put_bool(true);
        w.put_bool(false);
        let bytes = w.into_bytes();

        let mut r = RecordReader::new(&bytes);
        assert_eq!(r.get_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(r.get_i32().unwrap(), -42);
        assert_eq!(r.get_i64().unwrap(), i64::MAX);
        assert!(r.get_bool().unwrap());
        assert!(!r.get_bool().unwrap());
        assert!(r.is_empty());
    }

    #[test]
    fn string_round_trip() {
        let mut w = RecordWriter::new();
        w.put_str("correct horse");
        w.put_str("");
        let bytes = w.into_bytes();

        let mut r = RecordReader::new(&bytes);
        assert_eq!(r.get_str().unwrap(), "correct horse");
        assert_eq!(r.get_str().unwrap(), "");
        assert!(r.is_empty());
    }

    #[test]
    fn integers_are_little_endian() {
        let mut w = RecordWriter::new();
        w.put_u32(1);
        assert_eq!(&w.into_bytes()[..], &[1, 0, 0, 0]);
    }

    #[test]
    fn truncated_read_fails() {
        let mut r = RecordReader::new(&[1, 2, 3]);
        let err = r.get_u32().unwrap_err();
        assert_eq!(
            err,
            RecordError::Truncated {
                needed: 1,
                available: 3
            }
        );
    }

    #[test]
    fn oversized_field_fails_before_allocation() {
        let mut w = RecordWriter::new();
        w.put_u32(u32::MAX); // length prefix pointing at 4 GiB
        let bytes = w.into_bytes();

        let mut r = RecordReader::new(&bytes);
        assert!(matches!(
            r.get_bytes(),
            Err(RecordError::FieldTooLarge { .. })
        ));
    }

    #[test]
    fn invalid_bool_fails() {
        let mut r = RecordReader::new(&[7]);
        assert_eq!(r.get_bool().unwrap_err(), RecordError::InvalidBool(7));
    }

    #[test]
    fn invalid_utf8_fails() {
        let mut w = RecordWriter::new();
        w.put_bytes(&[0xFF, 0xFE]);
        let bytes = w.into_bytes();

        let mut r = RecordReader::new(&bytes);
        assert_eq!(r.get_str().unwrap_err(), RecordError::InvalidUtf8);
    }
}
