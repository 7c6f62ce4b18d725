//! Per-user password and password-policy authority.
//!
//! This crate is the synchronous core of the authkeeper daemon. It owns, for
//! each numeric user ID independently:
//!
//! - the **password file** state machine (normal and recovery credentials,
//!   reuse history, persistent attempt counter, expiration clock, and an
//!   in-process retry guard),
//! - the **policy file** state machine (per-user quality rules with a
//!   versioned on-disk representation),
//! - the **request processor** that dispatches framed requests arriving on
//!   four endpoints and composes policy evaluation with password mutation.
//!
//! The transport (Unix sockets, framing, peer credentials) lives in the
//! daemon crate; this crate never blocks on anything but its own file
//! writes, and all of its operations run to completion synchronously.
//!
//! # Layering
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │            RequestProcessor              │  processor
//! ├────────────────────┬─────────────────────┤
//! │   PasswordStore    │     PolicyStore     │  password, policy
//! ├────────────────────┴─────────────────────┤
//! │   record codec · secret · fs · clock     │  record, secret, fs, time
//! └──────────────────────────────────────────┘
//! ```
//!
//! The two stores never reference each other; the processor is the only
//! component that composes them.
//!
//! # Security Considerations
//!
//! - Password material is persisted as unsalted SHA-256 digests for on-disk
//!   compatibility with the version-1 file format. This is a documented
//!   limitation, not an endorsement.
//! - Digest comparison is constant-time ([`subtle`]).
//! - Nothing in this crate logs plaintext passwords or digest bytes, and no
//!   operation returns digest bytes to a caller.

pub mod fs;
pub mod password;
pub mod policy;
pub mod processor;
pub mod protocol;
pub mod record;
pub mod secret;
pub mod status;
pub mod time;

pub use password::{CheckOutcome, CheckReply, PasswordError, PasswordStatus, PasswordStore};
pub use policy::{PolicyError, PolicyStore};
pub use processor::{ProtocolError, RequestProcessor};
pub use protocol::{Endpoint, PasswordKind, PolicyUpdate, RequestHeader};
pub use status::StatusCode;
pub use time::{ManualTimeSource, SystemTimeSource, TimeSource};
