//! One user's password file and attempt counter.
//!
//! # On-Disk Layout
//!
//! Per user, under `<data_dir>/<uid>/`:
//!
//! - `password` — versioned record: `(version, max_attempt, max_history,
//!   expire_days, expire_deadline, recovery_active, recovery,
//!   normal_active, normal, history)`, written atomically.
//! - `attempt` — raw little-endian `u32`, rewritten in place on every
//!   increment and reset. Keeping it out of the main record means a failed
//!   guess survives a crash without rewriting the larger file.
//! - `password.old` — pre-versioning record, ingested once and unlinked.
//!
//! # Recovery Rules
//!
//! A `password` file with the wrong version tag or a failing field is
//! treated as corrupt: state resets to defaults and the file is rewritten.
//! An unreadable `attempt` file resets the counter to zero. Neither case
//! surfaces an error to callers; only directory creation, write, and unlink
//! failures do.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

use crate::fs::{self, FsError};
use crate::protocol::{INFINITE_ATTEMPTS, INFINITE_EXPIRE_DAYS, NO_EXPIRATION, PasswordKind};
use crate::record::{RecordError, RecordReader, RecordWriter};
use crate::secret::{DIGEST_LEN, PasswordValue};

use super::store::RETRY_TIMEOUT;

const PASSWORD_FILE: &str = "password";
const LEGACY_PASSWORD_FILE: &str = "password.old";
const ATTEMPT_FILE: &str = "attempt";

/// Version tag of the current `password` record format.
pub const FILE_VERSION: u32 = 1;

/// Deadline sentinel meaning "never expires".
pub const INFINITE_DEADLINE: i64 = i64::MAX;

/// Size cap when reading state files back in.
const MAX_STATE_FILE: u64 = 64 * 1024;

/// A legacy record is a 4-byte length prefix plus a raw digest.
const LEGACY_RECORD_LEN: u64 = 4 + DIGEST_LEN as u64;
/// Fixed legacy prefix without the active flag: two `u32`s and an `i64`.
const LEGACY_PREFIX_LEN: u64 = 16;
/// Fixed legacy prefix with the trailing active flag byte.
const LEGACY_PREFIX_WITH_FLAG_LEN: u64 = LEGACY_PREFIX_LEN + 1;

/// In-memory image of one user's password file.
#[derive(Debug)]
pub struct PasswordFile {
    uid: u32,
    dir: PathBuf,

    max_attempt: u32,
    max_history: u32,
    expire_days: u32,
    expire_deadline: i64,
    recovery_active: bool,
    recovery: PasswordValue,
    normal_active: bool,
    normal: PasswordValue,
    history: VecDeque<PasswordValue>,

    /// Persisted separately in the `attempt` file.
    attempt: u32,

    /// Monotonic reading of the last check/set entry. In-memory only.
    retry_timer_start: Duration,
}

impl PasswordFile {
    /// Opens (or lazily creates) the password state for `uid`.
    ///
    /// Creates the data and per-user directories with mode 0700 as needed,
    /// ingests a legacy `password.old` file when the new-format file is
    /// absent, and resets-and-rewrites on a corrupt new-format file. The
    /// retry timer starts backdated so the first check is never rejected.
    ///
    /// # Errors
    ///
    /// Returns [`FsError`] only for unrecoverable filesystem failures
    /// (directory creation, write, unlink).
    pub fn open(data_dir: &Path, uid: u32, now_monotonic: Duration) -> Result<Self, FsError> {
        fs::ensure_dir(data_dir)?;
        let dir = data_dir.join(uid.to_string());
        fs::ensure_dir(&dir)?;

        let mut file = Self {
            uid,
            dir,
            max_attempt: INFINITE_ATTEMPTS,
            max_history: 0,
            expire_days: INFINITE_EXPIRE_DAYS,
            expire_deadline: INFINITE_DEADLINE,
            recovery_active: false,
            recovery: PasswordValue::Empty,
            normal_active: false,
            normal: PasswordValue::Empty,
            history: VecDeque::new(),
            attempt: 0,
            retry_timer_start: now_monotonic.saturating_sub(RETRY_TIMEOUT),
        };
        file.prepare_password_file()?;
        file.prepare_attempt_file()?;
        Ok(file)
    }

    fn password_path(&self) -> PathBuf {
        self.dir.join(PASSWORD_FILE)
    }

    fn legacy_path(&self) -> PathBuf {
        self.dir.join(LEGACY_PASSWORD_FILE)
    }

    fn attempt_path(&self) -> PathBuf {
        self.dir.join(ATTEMPT_FILE)
    }

    fn prepare_password_file(&mut self) -> Result<(), FsError> {
        if !self.password_path().exists() {
            if self.try_ingest_legacy() {
                self.save()?;
                std::fs::remove_file(self.legacy_path()).map_err(|e| FsError::Io {
                    context: "unlink legacy password file",
                    source: e,
                })?;
                debug!(uid = self.uid, "converted legacy password file");
                return Ok(());
            }
            debug!(uid = self.uid, "password file missing; creating");
            return self.save();
        }

        match self.load() {
            Ok(()) => {
                debug!(uid = self.uid, "loaded password file");
                Ok(())
            }
            Err(err) => {
                warn!(uid = self.uid, %err, "invalid password file; resetting to defaults");
                self.reset_state();
                self.save()
            }
        }
    }

    fn prepare_attempt_file(&mut self) -> Result<(), FsError> {
        if !self.attempt_path().exists() {
            return self.save_attempt();
        }
        match fs::bounded_read(&self.attempt_path(), MAX_STATE_FILE) {
            Ok(bytes) if bytes.len() >= 4 => {
                self.attempt = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            }
            Ok(_) => {
                warn!(uid = self.uid, "attempt file truncated; resetting counter");
                self.attempt = 0;
            }
            Err(err) => {
                warn!(uid = self.uid, %err, "attempt file unreadable; resetting counter");
                self.attempt = 0;
            }
        }
        Ok(())
    }

    /// Restores every field to its default. The attempt counter is managed
    /// by its own file and is left alone here.
    fn reset_state(&mut self) {
        self.max_attempt = INFINITE_ATTEMPTS;
        self.max_history = 0;
        self.expire_days = INFINITE_EXPIRE_DAYS;
        self.expire_deadline = INFINITE_DEADLINE;
        self.recovery_active = false;
        self.recovery = PasswordValue::Empty;
        self.normal_active = false;
        self.normal = PasswordValue::Empty;
        self.history.clear();
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Serializes the current image and writes it atomically.
    ///
    /// # Errors
    ///
    /// Returns [`FsError`] if the write fails; the previous on-disk image
    /// is then still intact.
    pub fn save(&self) -> Result<(), FsError> {
        let mut w = RecordWriter::with_capacity(128);
        w.put_u32(FILE_VERSION);
        w.put_u32(self.max_attempt);
        w.put_u32(self.max_history);
        w.put_u32(self.expire_days);
        w.put_i64(self.expire_deadline);
        w.put_bool(self.recovery_active);
        self.recovery.encode(&mut w);
        w.put_bool(self.normal_active);
        self.normal.encode(&mut w);
        w.put_count(self.history.len());
        for entry in &self.history {
            entry.encode(&mut w);
        }
        fs::atomic_write(&self.password_path(), &w.into_bytes())
    }

    fn load(&mut self) -> Result<(), LoadError> {
        let bytes = fs::bounded_read(&self.password_path(), MAX_STATE_FILE)?;
        let mut r = RecordReader::new(&bytes);

        let version = r.get_u32()?;
        if version != FILE_VERSION {
            return Err(LoadError::Version(version));
        }

        self.max_attempt = r.get_u32()?;
        self.max_history = r.get_u32()?;
        self.expire_days = r.get_u32()?;
        self.expire_deadline = r.get_i64()?;
        self.recovery_active = r.get_bool()?;
        self.recovery = PasswordValue::decode(&mut r)?;
        self.normal_active = r.get_bool()?;
        self.normal = PasswordValue::decode(&mut r)?;

        self.history.clear();
        let count = r.get_count()?;
        for _ in 0..count {
            self.history.push_back(PasswordValue::decode(&mut r)?);
        }
        Ok(())
    }

    /// Attempts to parse `password.old`. Returns `true` when the legacy
    /// image was loaded into memory; the caller persists it in the new
    /// format and unlinks the old file.
    ///
    /// The legacy layout is `max_attempt (u32), max_history (u32),
    /// deadline (i64), [active (u8)]` followed by digest records of
    /// `u32 length + 32 bytes`. The two prefix variants are told apart by
    /// the file size remainder over the 36-byte record length. The first
    /// record is the current password; the rest are history.
    fn try_ingest_legacy(&mut self) -> bool {
        let path = self.legacy_path();
        let Ok(meta) = std::fs::metadata(&path) else {
            return false;
        };

        let remainder = meta.len() % LEGACY_RECORD_LEN;
        let has_active_flag = match remainder {
            LEGACY_PREFIX_LEN => false,
            LEGACY_PREFIX_WITH_FLAG_LEN => true,
            _ => return false,
        };

        match self.parse_legacy(&path, has_active_flag) {
            Ok(()) => true,
            Err(err) => {
                warn!(uid = self.uid, %err, "invalid legacy password file");
                self.reset_state();
                false
            }
        }
    }

    fn parse_legacy(&mut self, path: &Path, has_active_flag: bool) -> Result<(), LoadError> {
        let bytes = fs::bounded_read(path, MAX_STATE_FILE)?;
        let mut r = RecordReader::new(&bytes);

        self.max_attempt = r.get_u32()?;
        self.max_history = r.get_u32()?;
        self.expire_deadline = r.get_i64()?;
        if self.expire_deadline == 0 {
            self.expire_deadline = INFINITE_DEADLINE;
        }
        self.normal_active = if has_active_flag { r.get_bool()? } else { true };

        let mut digests = Vec::new();
        while !r.is_empty() {
            let raw = r.get_bytes()?;
            let digest: [u8; DIGEST_LEN] =
                raw.try_into().map_err(|raw: Vec<u8>| RecordError::FieldTooLarge {
                    len: raw.len(),
                    max: DIGEST_LEN,
                })?;
            digests.push(PasswordValue::Sha256(digest));
        }

        self.history.clear();
        let mut digests = digests.into_iter();
        match digests.next() {
            Some(current) => self.normal = current,
            None => {
                self.normal = PasswordValue::Empty;
                self.normal_active = false;
            }
        }
        self.history.extend(digests);

        self.expire_days = INFINITE_EXPIRE_DAYS;
        self.recovery_active = false;
        self.recovery = PasswordValue::Empty;
        Ok(())
    }

    /// Persists the attempt counter.
    ///
    /// # Errors
    ///
    /// Returns [`FsError`] if the write fails.
    pub fn save_attempt(&self) -> Result<(), FsError> {
        fs::write_small(&self.attempt_path(), &self.attempt.to_le_bytes())
    }

    // ------------------------------------------------------------------
    // Credential state
    // ------------------------------------------------------------------

    /// Whether a password of `kind` is currently set.
    #[must_use]
    pub fn is_active(&self, kind: PasswordKind) -> bool {
        match kind {
            PasswordKind::Normal => self.normal_active,
            PasswordKind::Recovery => self.recovery_active,
        }
    }

    /// Compares `challenge` against the stored password of `kind`.
    #[must_use]
    pub fn matches(&self, kind: PasswordKind, challenge: &str) -> bool {
        match kind {
            PasswordKind::Normal => self.normal.matches(challenge),
            PasswordKind::Recovery => self.recovery.matches(challenge),
        }
    }

    /// Installs a new password of `kind`. An empty password clears the slot
    /// and its active flag. A new Normal password is also pushed onto the
    /// head of the history, evicting from the tail past `max_history`.
    pub fn set_password(&mut self, kind: PasswordKind, plaintext: &str) {
        let value = PasswordValue::from_plaintext(plaintext);
        match kind {
            PasswordKind::Normal => {
                if value.is_empty() {
                    self.normal = PasswordValue::Empty;
                    self.normal_active = false;
                } else {
                    self.normal = value.clone();
                    self.history.push_front(value);
                    self.trim_history();
                    self.normal_active = true;
                }
            }
            PasswordKind::Recovery => {
                if value.is_empty() {
                    self.recovery = PasswordValue::Empty;
                    self.recovery_active = false;
                } else {
                    self.recovery = value;
                    self.recovery_active = true;
                }
            }
        }
    }

    /// Whether `candidate` matches any history entry (the current Normal
    /// password is part of the history from the moment it is set).
    #[must_use]
    pub fn is_reused(&self, candidate: &str) -> bool {
        self.history.iter().any(|entry| entry.matches(candidate))
    }

    #[must_use]
    pub fn is_history_active(&self) -> bool {
        self.max_history != 0
    }

    /// Resizes the reuse history. Turning history on (0 → n) seeds it with
    /// the current Normal value so the credential in use cannot be set
    /// again immediately; shrinking evicts from the tail.
    pub fn set_max_history(&mut self, max_history: u32) {
        if self.max_history == 0 && max_history > 0 {
            self.history.push_front(self.normal.clone());
        }
        self.max_history = max_history;
        self.trim_history();
    }

    fn trim_history(&mut self) {
        while self.history.len() > self.max_history as usize {
            self.history.pop_back();
        }
    }

    #[must_use]
    pub fn max_history(&self) -> u32 {
        self.max_history
    }

    #[cfg(test)]
    pub(crate) fn history_len(&self) -> usize {
        self.history.len()
    }

    // ------------------------------------------------------------------
    // Attempt counter
    // ------------------------------------------------------------------

    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn increment_attempt(&mut self) {
        self.attempt = self.attempt.saturating_add(1);
    }

    pub fn reset_attempt(&mut self) {
        self.attempt = 0;
    }

    #[must_use]
    pub fn max_attempt(&self) -> u32 {
        self.max_attempt
    }

    pub fn set_max_attempt(&mut self, max_attempt: u32) {
        self.max_attempt = max_attempt;
    }

    /// Whether the counter has passed the configured lockout threshold.
    #[must_use]
    pub fn attempts_exceeded(&self) -> bool {
        self.max_attempt != INFINITE_ATTEMPTS && self.attempt > self.max_attempt
    }

    // ------------------------------------------------------------------
    // Expiration
    // ------------------------------------------------------------------

    #[must_use]
    pub fn expire_days(&self) -> u32 {
        self.expire_days
    }

    pub fn set_expire_days(&mut self, days: u32) {
        self.expire_days = days;
    }

    pub fn set_expire_deadline(&mut self, deadline: i64) {
        self.expire_deadline = deadline;
    }

    /// Seconds until expiry at `now`, clamped at zero, or [`NO_EXPIRATION`]
    /// when no deadline applies.
    #[must_use]
    pub fn seconds_left(&self, now: i64) -> u32 {
        if self.expire_deadline == INFINITE_DEADLINE {
            return NO_EXPIRATION;
        }
        let left = self.expire_deadline.saturating_sub(now);
        u32::try_from(left).unwrap_or(u32::MAX)
    }

    /// Whether the Normal password is past its deadline at `now`.
    #[must_use]
    pub fn is_expired(&self, now: i64) -> bool {
        self.expire_deadline != INFINITE_DEADLINE && now > self.expire_deadline
    }

    // ------------------------------------------------------------------
    // Retry ignore period
    // ------------------------------------------------------------------

    /// Records the entry time of a check/set call and reports whether it
    /// landed inside the ignore period. Every call moves the window, so a
    /// client hammering the socket keeps being rejected.
    pub fn in_ignore_period(&mut self, now_monotonic: Duration) -> bool {
        let delta = now_monotonic.saturating_sub(self.retry_timer_start);
        self.retry_timer_start = now_monotonic;
        delta < RETRY_TIMEOUT
    }
}

#[derive(Debug, thiserror::Error)]
enum LoadError {
    #[error("unsupported file version {0}")]
    Version(u32),
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error(transparent)]
    Fs(#[from] FsError),
}
