//! Stored password values.
//!
//! A credential slot holds either nothing or the SHA-256 digest of the
//! password bytes. The digest is unsalted for compatibility with the
//! version-1 file format; see the crate-level notes on this limitation.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::record::{RecordError, RecordReader, RecordWriter};

/// Length of a SHA-256 digest in bytes.
pub const DIGEST_LEN: usize = 32;

/// On-disk discriminant for an empty slot.
const KIND_EMPTY: u32 = 0;
/// On-disk discriminant for a SHA-256 digest.
const KIND_SHA256: u32 = 1;

/// A stored password value: empty, or a SHA-256 digest of the UTF-8 bytes.
#[derive(Clone, PartialEq, Eq)]
pub enum PasswordValue {
    /// No password is set; matches only the empty challenge.
    Empty,
    /// SHA-256 digest of the password bytes.
    Sha256([u8; DIGEST_LEN]),
}

impl PasswordValue {
    /// Derives the stored form of `plaintext`. The empty string maps to
    /// [`PasswordValue::Empty`].
    #[must_use]
    pub fn from_plaintext(plaintext: &str) -> Self {
        if plaintext.is_empty() {
            Self::Empty
        } else {
            Self::Sha256(digest(plaintext))
        }
    }

    /// Returns `true` if no password is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Compares `challenge` against the stored value.
    ///
    /// An empty slot matches only an empty challenge. Digest comparison is
    /// constant-time so a mismatch position cannot be inferred from timing.
    #[must_use]
    pub fn matches(&self, challenge: &str) -> bool {
        match self {
            Self::Empty => challenge.is_empty(),
            Self::Sha256(stored) => {
                let candidate = digest(challenge);
                stored.as_slice().ct_eq(candidate.as_slice()).into()
            }
        }
    }

    /// Serializes the value as `discriminant [+ digest field]`.
    pub fn encode(&self, writer: &mut RecordWriter) {
        match self {
            Self::Empty => writer.put_u32(KIND_EMPTY),
            Self::Sha256(hash) => {
                writer.put_u32(KIND_SHA256);
                writer.put_bytes(hash);
            }
        }
    }

    /// Deserializes a value written by [`PasswordValue::encode`].
    pub fn decode(reader: &mut RecordReader<'_>) -> Result<Self, RecordError> {
        match reader.get_u32()? {
            KIND_EMPTY => Ok(Self::Empty),
            KIND_SHA256 => {
                let bytes = reader.get_bytes()?;
                let hash: [u8; DIGEST_LEN] = bytes.try_into().map_err(|bytes: Vec<u8>| {
                    RecordError::FieldTooLarge {
                        len: bytes.len(),
                        max: DIGEST_LEN,
                    }
                })?;
                Ok(Self::Sha256(hash))
            }
            other => Err(RecordError::UnknownDiscriminant(other)),
        }
    }
}

// Digest bytes stay out of logs and panic messages.
impl std::fmt::Debug for PasswordValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => f.write_str("PasswordValue::Empty"),
            Self::Sha256(_) => f.write_str("PasswordValue::Sha256(..)"),
        }
    }
}

fn digest(plaintext: &str) -> [u8; DIGEST_LEN] {
    Sha256::digest(plaintext.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_matches_only_empty_challenge() {
        let value = PasswordValue::Empty;
        assert!(value.matches(""));
        assert!(!value.matches("anything"));
    }

    #[test]
    fn derived_value_matches_its_plaintext() {
        let value = PasswordValue::from_plaintext("Abcd1234!");
        assert!(value.matches("Abcd1234!"));
        assert!(!value.matches("abcd1234!"));
        assert!(!value.matches(""));
    }

    #[test]
    fn empty_plaintext_derives_empty_value() {
        assert!(PasswordValue::from_plaintext("").is_empty());
    }

    #[test]
    fn encode_decode_round_trip() {
        for value in [PasswordValue::Empty, PasswordValue::from_plaintext("p")] {
            let mut w = RecordWriter::new();
            value.encode(&mut w);
            let bytes = w.into_bytes();
            let mut r = RecordReader::new(&bytes);
            assert_eq!(PasswordValue::decode(&mut r).unwrap(), value);
            assert!(r.is_empty());
        }
    }

    #[test]
    fn decode_rejects_unknown_discriminant() {
        let mut w = RecordWriter::new();
        w.put_u32(9);
        let bytes = w.into_bytes();
        let mut r = RecordReader::new(&bytes);
        assert!(matches!(
            PasswordValue::decode(&mut r),
            Err(RecordError::UnknownDiscriminant(9))
        ));
    }

    #[test]
    fn decode_rejects_short_digest() {
        let mut w = RecordWriter::new();
        w.put_u32(1);
        w.put_bytes(&[0u8; 16]);
        let bytes = w.into_bytes();
        let mut r = RecordReader::new(&bytes);
        assert!(PasswordValue::decode(&mut r).is_err());
    }

    #[test]
    fn debug_does_not_leak_digest_bytes() {
        let value = PasswordValue::from_plaintext("secret");
        assert_eq!(format!("{value:?}"), "PasswordValue::Sha256(..)");
    }
}
