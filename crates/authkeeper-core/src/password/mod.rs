//! Per-user password state: the on-disk file and the store that drives it.
//!
//! [`file::PasswordFile`] owns one user's credentials, history, counters,
//! and persistence. [`store::PasswordStore`] owns the map of files and
//! implements the operations the request processor calls. Policy state is
//! deliberately absent here; the processor composes the two stores.

mod file;
mod store;

pub use file::PasswordFile;
pub use store::{
    CheckOutcome, CheckReply, PasswordError, PasswordStatus, PasswordStore, RETRY_TIMEOUT,
};
