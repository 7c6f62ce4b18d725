//! Wire protocol vocabulary shared by the processor, daemon, and client.
//!
//! Header codes, password kinds, policy flag bits, and the limits baked into
//! the protocol all live here. The numeric values are contractual: clients
//! built against any version of this table must keep working.

use crate::record::{RecordError, RecordReader, RecordWriter};

/// Maximum accepted password length in bytes.
pub const MAX_PASSWORD_LEN: usize = 32;

/// Maximum reuse-history size a policy may request.
pub const MAX_PASSWORD_HISTORY: u32 = 50;

/// `max_attempt` value meaning "no lockout".
pub const INFINITE_ATTEMPTS: u32 = 0;

/// `expire_days` value meaning "passwords never expire".
pub const INFINITE_EXPIRE_DAYS: u32 = 0;

/// Seconds-left sentinel reported when no expiration applies.
pub const NO_EXPIRATION: u32 = u32::MAX;

/// The four local endpoints requests arrive on. Each is served on its own
/// socket; which headers an endpoint accepts and how the caller's user is
/// resolved depend on the endpoint, not the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// Password verification and state queries; caller resolved by the
    /// transport.
    Check,
    /// Password rotation and reuse queries; caller resolved by the
    /// transport.
    Set,
    /// Administrative reset; target user carried in the body.
    Reset,
    /// Policy management; target user carried in the body.
    Policy,
}

impl Endpoint {
    /// Socket file name for this endpoint, relative to the daemon's
    /// runtime directory. Shared by the server and the client so the two
    /// cannot drift.
    #[must_use]
    pub const fn socket_name(self) -> &'static str {
        match self {
            Self::Check => "check.sock",
            Self::Set => "set.sock",
            Self::Reset => "reset.sock",
            Self::Policy => "policy.sock",
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Check => f.write_str("check"),
            Self::Set => f.write_str("set"),
            Self::Reset => f.write_str("reset"),
            Self::Policy => f.write_str("policy"),
        }
    }
}

/// Request discriminant, sent as a 4-byte signed integer ahead of each body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum RequestHeader {
    /// Verify a challenge against the stored password.
    CheckPassword = 0,
    /// Read-only snapshot of the password state.
    CheckPasswordState = 1,
    /// Ask whether a candidate password appears in the reuse history.
    CheckPasswordReused = 2,
    /// Rotate a credential, proving knowledge of the current one.
    SetPassword = 3,
    /// Rewrite the normal password by presenting the recovery password.
    SetPasswordRecovery = 4,
    /// Administrative reset without the current password.
    ResetPassword = 5,
    /// Install or update a per-user policy.
    SetPasswordPolicy = 6,
    /// Disable and clear a per-user policy.
    DisablePasswordPolicy = 7,
}

impl RequestHeader {
    /// The wire representation of this header.
    #[must_use]
    pub const fn code(self) -> i32 {
        self as i32
    }
}

impl TryFrom<i32> for RequestHeader {
    type Error = i32;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Self::CheckPassword),
            1 => Ok(Self::CheckPasswordState),
            2 => Ok(Self::CheckPasswordReused),
            3 => Ok(Self::SetPassword),
            4 => Ok(Self::SetPasswordRecovery),
            5 => Ok(Self::ResetPassword),
            6 => Ok(Self::SetPasswordPolicy),
            7 => Ok(Self::DisablePasswordPolicy),
            other => Err(other),
        }
    }
}

/// Which of the two per-user credentials an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PasswordKind {
    /// The login credential, subject to policy, history, and expiry.
    Normal = 0,
    /// The fallback credential used to rewrite Normal when no lockout is
    /// configured.
    Recovery = 1,
}

impl PasswordKind {
    /// The wire representation of this kind.
    #[must_use]
    pub const fn code(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for PasswordKind {
    type Error = u32;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Self::Normal),
            1 => Ok(Self::Recovery),
            other => Err(other),
        }
    }
}

/// Policy field indices for the `flags` bitmask of [`PolicyUpdate`].
///
/// Bit `1 << index` set means "this field is supplied"; cleared fields are
/// left untouched by a policy update.
pub mod policy_flag {
    pub const MAX_ATTEMPTS: u32 = 1;
    pub const VALID_PERIOD: u32 = 2;
    pub const HISTORY_SIZE: u32 = 3;
    pub const MIN_LENGTH: u32 = 4;
    pub const MIN_COMPLEX_CHARS: u32 = 5;
    pub const MAX_CHAR_OCCURRENCES: u32 = 6;
    pub const MAX_NUM_SEQ_LENGTH: u32 = 7;
    pub const QUALITY_TYPE: u32 = 8;
    pub const PATTERN: u32 = 9;
    pub const FORBIDDEN_PASSWORDS: u32 = 10;

    /// First defined field index.
    pub const FIRST: u32 = MAX_ATTEMPTS;
    /// Last defined field index.
    pub const LAST: u32 = FORBIDDEN_PASSWORDS;
}

/// Body of a `SetPasswordPolicy` request.
///
/// Field order on the wire matches the struct order below, preceded by
/// `flags` and `uid`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyUpdate {
    /// Bitmask of supplied fields; see [`policy_flag`].
    pub flags: u32,
    /// User the policy applies to.
    pub uid: u32,
    /// Lockout threshold; 0 disables the lockout.
    pub max_attempts: u32,
    /// Expiration period in days; 0 means passwords never expire.
    pub valid_days: u32,
    /// Reuse-history size; 0 disables history.
    pub history_size: u32,
    /// Minimum password length; 0 disables the check.
    pub min_length: u32,
    /// Minimum count of non-alphabetic characters; 0 disables the check.
    pub min_complex_chars: u32,
    /// Maximum occurrences of any single byte; 0 disables the check.
    pub max_char_occurrences: u32,
    /// Maximum run of consecutive/identical digits; 0 disables the check.
    pub max_num_seq_length: u32,
    /// Quality class discriminant; see [`crate::policy::QualityType`].
    pub quality: u32,
    /// POSIX-extended pattern the password must match; empty disables.
    pub pattern: String,
    /// Forbidden passwords to merge into the stored set; an empty entry
    /// clears the set.
    pub forbidden: Vec<String>,
}

impl PolicyUpdate {
    /// Returns `true` if the field at `index` was supplied.
    #[must_use]
    pub const fn has(&self, index: u32) -> bool {
        self.flags & (1 << index) != 0
    }

    /// Marks the field at `index` as supplied.
    pub fn set_flag(&mut self, index: u32) {
        self.flags |= 1 << index;
    }

    /// Decodes the wire body of a `SetPasswordPolicy` request.
    pub fn decode(reader: &mut RecordReader<'_>) -> Result<Self, RecordError> {
        let flags = reader.get_u32()?;
        let uid = reader.get_u32()?;
        let max_attempts = reader.get_u32()?;
        let valid_days = reader.get_u32()?;
        let history_size = reader.get_u32()?;
        let min_length = reader.get_u32()?;
        let min_complex_chars = reader.get_u32()?;
        let max_char_occurrences = reader.get_u32()?;
        let max_num_seq_length = reader.get_u32()?;
        let quality = reader.get_u32()?;
        let pattern = reader.get_str()?;
        let count = reader.get_count()?;
        let mut forbidden = Vec::with_capacity(count);
        for _ in 0..count {
            forbidden.push(reader.get_str()?);
        }
        Ok(Self {
            flags,
            uid,
            max_attempts,
            valid_days,
            history_size,
            min_length,
            min_complex_chars,
            max_char_occurrences,
            max_num_seq_length,
            quality,
            pattern,
            forbidden,
        })
    }

    /// Encodes the wire body of a `SetPasswordPolicy` request.
    pub fn encode(&self, writer: &mut RecordWriter) {
        writer.put_u32(self.flags);
        writer.put_u32(self.uid);
        writer.put_u32(self.max_attempts);
        writer.put_u32(self.valid_days);
        writer.put_u32(self.history_size);
        writer.put_u32(self.min_length);
        writer.put_u32(self.min_complex_chars);
        writer.put_u32(self.max_char_occurrences);
        writer.put_u32(self.max_num_seq_length);
        writer.put_u32(self.quality);
        writer.put_str(&self.pattern);
        writer.put_count(self.forbidden.len());
        for entry in &self.forbidden {
            writer.put_str(entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_codes_are_stable() {
        assert_eq!(RequestHeader::CheckPassword.code(), 0);
        assert_eq!(RequestHeader::CheckPasswordState.code(), 1);
        assert_eq!(RequestHeader::CheckPasswordReused.code(), 2);
        assert_eq!(RequestHeader::SetPassword.code(), 3);
        assert_eq!(RequestHeader::SetPasswordRecovery.code(), 4);
        assert_eq!(RequestHeader::ResetPassword.code(), 5);
        assert_eq!(RequestHeader::SetPasswordPolicy.code(), 6);
        assert_eq!(RequestHeader::DisablePasswordPolicy.code(), 7);
    }

    #[test]
    fn header_try_from_rejects_unknown_codes() {
        assert_eq!(RequestHeader::try_from(8), Err(8));
        assert_eq!(RequestHeader::try_from(-1), Err(-1));
    }

    #[test]
    fn password_kind_round_trips() {
        assert_eq!(PasswordKind::try_from(0), Ok(PasswordKind::Normal));
        assert_eq!(PasswordKind::try_from(1), Ok(PasswordKind::Recovery));
        assert_eq!(PasswordKind::try_from(2), Err(2));
    }

    #[test]
    fn policy_update_round_trips() {
        let mut update = PolicyUpdate {
            uid: 1001,
            min_length: 8,
            pattern: "^[A-Z].*".to_string(),
            forbidden: vec!["password".to_string(), "123456".to_string()],
            ..PolicyUpdate::default()
        };
        update.set_flag(policy_flag::MIN_LENGTH);
        update.set_flag(policy_flag::PATTERN);
        update.set_flag(policy_flag::FORBIDDEN_PASSWORDS);

        let mut w = RecordWriter::new();
        update.encode(&mut w);
        let bytes = w.into_bytes();

        let mut r = RecordReader::new(&bytes);
        let decoded = PolicyUpdate::decode(&mut r).unwrap();
        assert!(r.is_empty());
        assert_eq!(decoded, update);
    }

    #[test]
    fn flag_bits_select_fields() {
        let mut update = PolicyUpdate::default();
        assert!(!update.has(policy_flag::MIN_LENGTH));
        update.set_flag(policy_flag::MIN_LENGTH);
        assert!(update.has(policy_flag::MIN_LENGTH));
        assert!(!update.has(policy_flag::PATTERN));
    }
}
