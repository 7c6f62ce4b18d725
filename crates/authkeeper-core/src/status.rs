//! Status codes returned to clients.
//!
//! Every reply starts with one of these codes as a 4-byte signed integer.
//! The values are part of the wire contract and of the client-visible API;
//! they must never be renumbered.

/// Result code carried at the head of every reply frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum StatusCode {
    /// The operation completed.
    Success = 0,
    /// Transport-level failure (only produced at the socket boundary).
    Socket = -1,
    /// A request parameter was malformed or rejected by policy.
    InputParam = -2,
    /// Allocation failed while building a reply.
    OutOfMemory = -3,
    /// A caller-supplied output buffer was too small.
    BufferTooSmall = -4,
    /// Unanticipated internal failure inside the service.
    ServerError = -5,
    /// The caller is not allowed to perform the operation.
    AccessDenied = -6,
    /// The caller's user could not be resolved.
    NoUser = -8,
    /// No password of the requested type is set.
    NoPassword = -9,
    /// No recovery password is set.
    NoRecoveryPassword = -10,
    /// A password already exists where none was expected.
    PasswordExist = -11,
    /// The supplied password does not match the stored one.
    Mismatch = -12,
    /// The password does not satisfy the active policy.
    Invalid = -13,
    /// Called again within the retry ignore period.
    RetryTimer = -14,
    /// The persistent attempt counter exceeded the configured maximum.
    MaxAttemptsExceeded = -15,
    /// The password matched but is past its expiration deadline.
    Expired = -16,
    /// The new password is present in the reuse history.
    Reused = -17,
    /// Recovery-based reset is not allowed while max-attempts is set.
    RecoveryPasswordRestricted = -18,
    /// Catch-all for codes this build does not recognize.
    Unknown = -255,
}

impl StatusCode {
    /// The wire representation of this status.
    #[must_use]
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Maps a wire code back to a status, collapsing unrecognized values to
    /// [`StatusCode::Unknown`].
    #[must_use]
    pub const fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Success,
            -1 => Self::Socket,
            -2 => Self::InputParam,
            -3 => Self::OutOfMemory,
            -4 => Self::BufferTooSmall,
            -5 => Self::ServerError,
            -6 => Self::AccessDenied,
            -8 => Self::NoUser,
            -9 => Self::NoPassword,
            -10 => Self::NoRecoveryPassword,
            -11 => Self::PasswordExist,
            -12 => Self::Mismatch,
            -13 => Self::Invalid,
            -14 => Self::RetryTimer,
            -15 => Self::MaxAttemptsExceeded,
            -16 => Self::Expired,
            -17 => Self::Reused,
            -18 => Self::RecoveryPasswordRestricted,
            _ => Self::Unknown,
        }
    }

    /// Returns `true` for [`StatusCode::Success`].
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Success => "success",
            Self::Socket => "socket error",
            Self::InputParam => "invalid input parameter",
            Self::OutOfMemory => "out of memory",
            Self::BufferTooSmall => "buffer too small",
            Self::ServerError => "server error",
            Self::AccessDenied => "access denied",
            Self::NoUser => "no user",
            Self::NoPassword => "no password set",
            Self::NoRecoveryPassword => "no recovery password set",
            Self::PasswordExist => "password already exists",
            Self::Mismatch => "password mismatch",
            Self::Invalid => "password rejected by policy",
            Self::RetryTimer => "retry timer active",
            Self::MaxAttemptsExceeded => "maximum attempts exceeded",
            Self::Expired => "password expired",
            Self::Reused => "password reused",
            Self::RecoveryPasswordRestricted => "recovery password restricted",
            Self::Unknown => "unknown error",
        };
        write!(f, "{name} ({})", self.code())
    }
}
