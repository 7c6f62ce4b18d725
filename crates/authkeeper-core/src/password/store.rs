//! Password operations over the per-user file map.
//!
//! The store lazily instantiates a [`PasswordFile`] on first reference to a
//! user and keeps it cached for the life of the process; within the process
//! it is the sole writer of that user's files. Operation semantics:
//!
//! - `check` / `set` enter through the 500 ms retry ignore guard and count
//!   Normal-password attempts persistently, writing the attempt file
//!   *before* a failure is reported so a crash cannot roll the counter
//!   back over a failed guess.
//! - `set_recovery` rewrites the Normal password via the recovery
//!   credential, but only while no lockout threshold is configured.
//! - `reset` is the administrative path with no current-password proof.
//! - the `set_max_attempts` / `set_validity` / `set_history` hooks apply
//!   policy-set side effects.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::fs::FsError;
use crate::password::file::{INFINITE_DEADLINE, PasswordFile};
use crate::protocol::{INFINITE_ATTEMPTS, INFINITE_EXPIRE_DAYS, NO_EXPIRATION, PasswordKind};
use crate::status::StatusCode;
use crate::time::TimeSource;

/// Ignore period applied between consecutive check/set calls per user.
pub const RETRY_TIMEOUT: Duration = Duration::from_millis(500);

const SECONDS_PER_DAY: i64 = 86_400;

/// Failures surfaced by password operations.
///
/// Storage failures are the only variant carrying a source; everything else
/// is a protocol-visible verdict.
#[derive(Debug, thiserror::Error)]
pub enum PasswordError {
    /// Called again within the retry ignore period.
    #[error("retry timer has not elapsed")]
    RetryTimer,

    /// The targeted credential is not set.
    #[error("no password of the requested type is set")]
    NoPassword,

    /// A parameter combination is not allowed.
    #[error("invalid input parameter")]
    InputParam,

    /// The supplied current password does not match.
    #[error("password mismatch")]
    Mismatch,

    /// The persistent attempt counter passed the lockout threshold.
    #[error("maximum attempts exceeded")]
    AttemptsExceeded,

    /// The new password appears in the reuse history.
    #[error("password found in reuse history")]
    Reused,

    /// Recovery-based rewrite is not allowed while a lockout threshold is
    /// configured.
    #[error("recovery password restricted")]
    RecoveryRestricted,

    /// State could not be persisted.
    #[error("state persistence failed: {0}")]
    Storage(#[from] FsError),
}

impl PasswordError {
    /// The wire status this failure maps to.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::RetryTimer => StatusCode::RetryTimer,
            Self::NoPassword => StatusCode::NoPassword,
            Self::InputParam => StatusCode::InputParam,
            Self::Mismatch => StatusCode::Mismatch,
            Self::AttemptsExceeded => StatusCode::MaxAttemptsExceeded,
            Self::Reused => StatusCode::Reused,
            Self::RecoveryRestricted => StatusCode::RecoveryPasswordRestricted,
            Self::Storage(_) => StatusCode::ServerError,
        }
    }
}

/// Verdict of a completed `check` call. These are the statuses whose reply
/// carries the attempt counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Challenge matched an unexpired password.
    Success,
    /// Challenge did not match.
    Mismatch,
    /// The attempt counter is past the lockout threshold.
    AttemptsExceeded,
    /// Challenge matched, but the password is past its deadline.
    Expired,
}

impl CheckOutcome {
    /// The wire status for this outcome.
    #[must_use]
    pub const fn status(self) -> StatusCode {
        match self {
            Self::Success => StatusCode::Success,
            Self::Mismatch => StatusCode::Mismatch,
            Self::AttemptsExceeded => StatusCode::MaxAttemptsExceeded,
            Self::Expired => StatusCode::Expired,
        }
    }
}

/// Outcome plus counters of a `check` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckReply {
    pub outcome: CheckOutcome,
    /// Attempt counter after this call.
    pub attempt: u32,
    /// Configured lockout threshold (0 = none).
    pub max_attempt: u32,
    /// Seconds until expiry, or [`NO_EXPIRATION`].
    pub seconds_left: u32,
}

impl CheckReply {
    fn without_counters(outcome: CheckOutcome) -> Self {
        Self {
            outcome,
            attempt: 0,
            max_attempt: 0,
            seconds_left: 0,
        }
    }
}

/// Read-only snapshot returned by [`PasswordStore::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PasswordStatus {
    pub attempt: u32,
    pub max_attempt: u32,
    pub seconds_left: u32,
}

/// Map of per-user password files plus the injected clock.
pub struct PasswordStore {
    data_dir: PathBuf,
    time: Arc<dyn TimeSource>,
    files: HashMap<u32, PasswordFile>,
}

impl PasswordStore {
    /// Creates a store rooted at `data_dir`. Directories and files are
    /// created lazily on first reference to each user.
    pub fn new(data_dir: impl Into<PathBuf>, time: Arc<dyn TimeSource>) -> Self {
        Self {
            data_dir: data_dir.into(),
            time,
            files: HashMap::new(),
        }
    }

    /// Exist-or-create lookup of a user's file.
    fn entry(&mut self, uid: u32) -> Result<&mut PasswordFile, PasswordError> {
        let now_monotonic = self.time.monotonic();
        match self.files.entry(uid) {
            Entry::Occupied(slot) => Ok(slot.into_mut()),
            Entry::Vacant(slot) => {
                let file = PasswordFile::open(&self.data_dir, uid, now_monotonic)?;
                Ok(slot.insert(file))
            }
        }
    }

    /// Evaluates `challenge` against the stored password of `kind`.
    ///
    /// For Normal, the attempt counter is incremented and persisted before
    /// the lockout and match checks, and reset (and persisted again) on a
    /// match. Recovery checks never touch the counter.
    ///
    /// # Errors
    ///
    /// [`PasswordError::RetryTimer`] inside the ignore period,
    /// [`PasswordError::NoPassword`] for a non-empty challenge against an
    /// inactive slot, [`PasswordError::Storage`] on persistence failure.
    pub fn check(
        &mut self,
        kind: PasswordKind,
        challenge: &str,
        uid: u32,
    ) -> Result<CheckReply, PasswordError> {
        let now_wall = self.time.wall_secs();
        let now_monotonic = self.time.monotonic();
        let file = self.entry(uid)?;

        if file.in_ignore_period(now_monotonic) {
            debug!(uid, "check rejected by retry timer");
            return Err(PasswordError::RetryTimer);
        }
        if !file.is_active(kind) && !challenge.is_empty() {
            return Err(PasswordError::NoPassword);
        }

        match kind {
            PasswordKind::Normal => {
                file.increment_attempt();
                file.save_attempt()?;

                let attempt = file.attempt();
                let max_attempt = file.max_attempt();
                let seconds_left = file.seconds_left(now_wall);
                let counters = |outcome, attempt| CheckReply {
                    outcome,
                    attempt,
                    max_attempt,
                    seconds_left,
                };

                if file.attempts_exceeded() {
                    debug!(uid, attempt, "check rejected: attempts exceeded");
                    return Ok(counters(CheckOutcome::AttemptsExceeded, attempt));
                }
                if !file.matches(PasswordKind::Normal, challenge) {
                    debug!(uid, attempt, "check rejected: mismatch");
                    return Ok(counters(CheckOutcome::Mismatch, attempt));
                }

                file.reset_attempt();
                file.save_attempt()?;

                if file.is_expired(now_wall) {
                    debug!(uid, "check matched an expired password");
                    return Ok(counters(CheckOutcome::Expired, 0));
                }
                Ok(counters(CheckOutcome::Success, 0))
            }
            PasswordKind::Recovery => {
                if file.matches(PasswordKind::Recovery, challenge) {
                    Ok(CheckReply::without_counters(CheckOutcome::Success))
                } else {
                    Ok(CheckReply::without_counters(CheckOutcome::Mismatch))
                }
            }
        }
    }

    /// Read-only state snapshot; never counts an attempt and never arms the
    /// retry timer.
    ///
    /// # Errors
    ///
    /// [`PasswordError::NoPassword`] when the slot is inactive.
    pub fn status(
        &mut self,
        kind: PasswordKind,
        uid: u32,
    ) -> Result<PasswordStatus, PasswordError> {
        let now_wall = self.time.wall_secs();
        let file = self.entry(uid)?;

        if !file.is_active(kind) {
            return Err(PasswordError::NoPassword);
        }

        Ok(match kind {
            PasswordKind::Normal => PasswordStatus {
                attempt: file.attempt(),
                max_attempt: file.max_attempt(),
                seconds_left: file.seconds_left(now_wall),
            },
            // Recovery passwords have no lockout and no expiry.
            PasswordKind::Recovery => PasswordStatus {
                attempt: INFINITE_ATTEMPTS,
                max_attempt: INFINITE_ATTEMPTS,
                seconds_left: NO_EXPIRATION,
            },
        })
    }

    /// Whether `candidate` appears in the user's reuse history. Always
    /// `false` while history is disabled, for empty candidates, and for the
    /// Recovery kind.
    pub fn is_reused(
        &mut self,
        kind: PasswordKind,
        candidate: &str,
        uid: u32,
    ) -> Result<bool, PasswordError> {
        let file = self.entry(uid)?;
        Ok(match kind {
            PasswordKind::Normal => {
                file.is_history_active() && !candidate.is_empty() && file.is_reused(candidate)
            }
            PasswordKind::Recovery => false,
        })
    }

    /// Rotates the credential of `kind`, requiring the current password.
    ///
    /// For Normal: the attempt counter is exercised exactly as in
    /// [`check`](Self::check); an empty `new_password` deactivates the
    /// credential but is refused with [`PasswordError::InputParam`] while a
    /// lockout threshold or expiration period is configured; history (when
    /// enabled) rejects a reused password before anything is installed.
    pub fn set(
        &mut self,
        kind: PasswordKind,
        current_password: &str,
        new_password: &str,
        uid: u32,
    ) -> Result<(), PasswordError> {
        let now_wall = self.time.wall_secs();
        let now_monotonic = self.time.monotonic();
        let file = self.entry(uid)?;

        if file.in_ignore_period(now_monotonic) {
            debug!(uid, "set rejected by retry timer");
            return Err(PasswordError::RetryTimer);
        }
        if !current_password.is_empty() && !file.is_active(kind) {
            return Err(PasswordError::NoPassword);
        }

        match kind {
            PasswordKind::Normal => {
                // A managed user cannot drop to "no password" while lockout
                // or expiry is in force.
                if new_password.is_empty()
                    && (file.max_attempt() != INFINITE_ATTEMPTS
                        || file.expire_days() != INFINITE_EXPIRE_DAYS)
                {
                    return Err(PasswordError::InputParam);
                }

                file.increment_attempt();
                file.save_attempt()?;

                if file.attempts_exceeded() {
                    return Err(PasswordError::AttemptsExceeded);
                }
                if !file.matches(PasswordKind::Normal, current_password) {
                    return Err(PasswordError::Mismatch);
                }

                // The caller knows the current password; the counter resets
                // before any further verdict.
                file.reset_attempt();
                file.save_attempt()?;

                if file.is_history_active()
                    && !new_password.is_empty()
                    && file.is_reused(new_password)
                {
                    return Err(PasswordError::Reused);
                }

                let deadline =
                    expire_deadline(new_password.is_empty(), file.expire_days(), now_wall);
                file.set_password(PasswordKind::Normal, new_password);
                file.set_expire_deadline(deadline);
                file.save()?;
                debug!(uid, "normal password updated");
                Ok(())
            }
            PasswordKind::Recovery => {
                if !file.matches(PasswordKind::Recovery, current_password) {
                    return Err(PasswordError::Mismatch);
                }
                file.set_password(PasswordKind::Recovery, new_password);
                file.save()?;
                debug!(uid, "recovery password updated");
                Ok(())
            }
        }
    }

    /// Rewrites the Normal password by presenting the recovery password.
    ///
    /// Only permitted while `max_attempt` is unlimited; a configured
    /// lockout makes the recovery path unusable by design, leaving
    /// [`reset`](Self::reset) as the sole unlock.
    pub fn set_recovery(
        &mut self,
        current_recovery: &str,
        new_password: &str,
        uid: u32,
    ) -> Result<(), PasswordError> {
        let now_wall = self.time.wall_secs();
        let now_monotonic = self.time.monotonic();
        let file = self.entry(uid)?;

        if file.in_ignore_period(now_monotonic) {
            debug!(uid, "set_recovery rejected by retry timer");
            return Err(PasswordError::RetryTimer);
        }
        if current_recovery.is_empty() || new_password.is_empty() {
            return Err(PasswordError::InputParam);
        }
        if !file.is_active(PasswordKind::Recovery) {
            return Err(PasswordError::NoPassword);
        }
        if file.max_attempt() != INFINITE_ATTEMPTS {
            debug!(uid, "set_recovery rejected: lockout is configured");
            return Err(PasswordError::RecoveryRestricted);
        }
        if !file.matches(PasswordKind::Recovery, current_recovery) {
            return Err(PasswordError::Mismatch);
        }
        if file.is_history_active() && file.is_reused(new_password) {
            return Err(PasswordError::Reused);
        }

        let deadline = expire_deadline(false, file.expire_days(), now_wall);
        file.reset_attempt();
        file.save_attempt()?;
        file.set_password(PasswordKind::Normal, new_password);
        file.set_expire_deadline(deadline);
        file.save()?;
        debug!(uid, "normal password rewritten via recovery");
        Ok(())
    }

    /// Administrative reset: installs `new_password` without any
    /// current-password proof, retry guard, or history check. For Normal,
    /// the attempt counter resets and the deadline is recomputed.
    pub fn reset(
        &mut self,
        kind: PasswordKind,
        new_password: &str,
        uid: u32,
    ) -> Result<(), PasswordError> {
        let now_wall = self.time.wall_secs();
        let file = self.entry(uid)?;

        match kind {
            PasswordKind::Normal => {
                let deadline =
                    expire_deadline(new_password.is_empty(), file.expire_days(), now_wall);
                file.reset_attempt();
                file.save_attempt()?;
                file.set_password(PasswordKind::Normal, new_password);
                file.set_expire_deadline(deadline);
                file.save()?;
            }
            PasswordKind::Recovery => {
                file.set_password(PasswordKind::Recovery, new_password);
                file.save()?;
            }
        }
        debug!(uid, "password reset by administrator");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Policy-set side effects
    // ------------------------------------------------------------------

    /// Installs a new lockout threshold and zeroes the attempt counter.
    pub fn set_max_attempts(&mut self, uid: u32, max_attempts: u32) -> Result<(), PasswordError> {
        let file = self.entry(uid)?;
        file.set_max_attempt(max_attempts);
        file.save()?;
        file.reset_attempt();
        file.save_attempt()?;
        Ok(())
    }

    /// Installs a new expiration period; an active Normal password gets its
    /// deadline recomputed from now.
    pub fn set_validity(&mut self, uid: u32, valid_days: u32) -> Result<(), PasswordError> {
        let now_wall = self.time.wall_secs();
        let file = self.entry(uid)?;

        let deadline = expire_deadline(false, valid_days, now_wall);
        if file.is_active(PasswordKind::Normal) {
            file.set_expire_deadline(deadline);
        }
        file.set_expire_days(valid_days);
        file.save()?;
        Ok(())
    }

    /// Resizes the reuse history.
    pub fn set_history(&mut self, uid: u32, history_size: u32) -> Result<(), PasswordError> {
        let file = self.entry(uid)?;
        file.set_max_history(history_size);
        file.save()?;
        Ok(())
    }
}

/// Absolute deadline for a password installed at `now`, or the infinite
/// sentinel when the password is being cleared or no period applies.
fn expire_deadline(clearing_password: bool, expire_days: u32, now: i64) -> i64 {
    if clearing_password || expire_days == INFINITE_EXPIRE_DAYS {
        INFINITE_DEADLINE
    } else {
        now.saturating_add(i64::from(expire_days) * SECONDS_PER_DAY)
    }
}
