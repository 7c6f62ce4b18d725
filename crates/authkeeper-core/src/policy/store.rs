//! Policy operations over the per-user file map.
//!
//! `check` gates a password rotation against the stored rules; `set`
//! validates and applies a flag-gated update; `disable` clears everything.
//! The store never reads password state — the request processor forwards
//! the attempts/validity/history portions of an update to the password
//! store after a successful `set`.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;

use crate::fs::FsError;
use crate::policy::file::{PolicyFile, QualityType};
use crate::protocol::{
    MAX_PASSWORD_HISTORY, MAX_PASSWORD_LEN, PasswordKind, PolicyUpdate, policy_flag,
};
use crate::status::StatusCode;
use crate::time::TimeSource;

const SECONDS_PER_DAY: i64 = 86_400;

/// Failures surfaced by policy operations.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// A password or update field is out of bounds or fails a rule.
    #[error("invalid input parameter")]
    InputParam,

    /// State could not be persisted.
    #[error("state persistence failed: {0}")]
    Storage(#[from] FsError),
}

impl PolicyError {
    /// The wire status this failure maps to.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InputParam => StatusCode::InputParam,
            Self::Storage(_) => StatusCode::ServerError,
        }
    }
}

/// Map of per-user policy files plus the injected clock (used only for the
/// validity-period overflow guard).
pub struct PolicyStore {
    data_dir: PathBuf,
    time: Arc<dyn TimeSource>,
    files: HashMap<u32, PolicyFile>,
}

impl PolicyStore {
    /// Creates a store rooted at `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>, time: Arc<dyn TimeSource>) -> Self {
        Self {
            data_dir: data_dir.into(),
            time,
            files: HashMap::new(),
        }
    }

    /// Exist-or-create lookup of a user's file.
    fn entry(&mut self, uid: u32) -> Result<&mut PolicyFile, PolicyError> {
        match self.files.entry(uid) {
            Entry::Occupied(slot) => Ok(slot.into_mut()),
            Entry::Vacant(slot) => {
                let file = PolicyFile::open(&self.data_dir, uid)?;
                Ok(slot.insert(file))
            }
        }
    }

    /// Evaluates `new_password` against the user's policy.
    ///
    /// The 32-byte length cap applies to both passwords unconditionally;
    /// the remaining rules apply only to the Normal kind while the policy
    /// is enabled. Any violation maps to
    /// [`StatusCode::InputParam`](crate::StatusCode::InputParam).
    pub fn check(
        &mut self,
        kind: PasswordKind,
        current_password: &str,
        new_password: &str,
        uid: u32,
    ) -> Result<(), PolicyError> {
        if current_password.len() > MAX_PASSWORD_LEN || new_password.len() > MAX_PASSWORD_LEN {
            debug!(uid, "policy check failed: password too long");
            return Err(PolicyError::InputParam);
        }

        let file = self.entry(uid)?;
        if !file.is_enabled() || kind != PasswordKind::Normal {
            return Ok(());
        }

        let violated = if !file.check_min_length(new_password) {
            Some("min-length")
        } else if !file.check_min_complex_chars(new_password) {
            Some("min-complex-chars")
        } else if !file.check_max_char_occurrences(new_password) {
            Some("max-char-occurrences")
        } else if !file.check_max_num_seq_length(new_password) {
            Some("max-num-seq-length")
        } else if !file.check_quality(new_password) {
            Some("quality-type")
        } else if !file.check_pattern(new_password) {
            Some("pattern")
        } else if !file.check_forbidden(new_password) {
            Some("forbidden-password")
        } else {
            None
        };

        match violated {
            Some(rule) => {
                debug!(uid, rule, "policy check failed");
                Err(PolicyError::InputParam)
            }
            None => Ok(()),
        }
    }

    /// Validates and applies a flag-gated update, then enables the policy
    /// and persists it.
    ///
    /// Validation covers every supplied field before any field is applied,
    /// so a rejected update leaves the stored policy untouched. Fields
    /// whose flag bit is cleared are not validated and not modified.
    pub fn set(&mut self, update: &PolicyUpdate) -> Result<(), PolicyError> {
        let now = self.time.wall_secs();
        let file = self.entry(update.uid)?;

        // Bounds first, in field order.
        if update.has(policy_flag::VALID_PERIOD) {
            // The deadline is projected as now + days * 86400 and must stay
            // representable in the 32-bit seconds-left field.
            let headroom = (i64::from(u32::MAX) - now) / SECONDS_PER_DAY;
            if i64::from(update.valid_days) > headroom {
                debug!(uid = update.uid, "policy update rejected: validity overflows");
                return Err(PolicyError::InputParam);
            }
        }
        if update.has(policy_flag::HISTORY_SIZE) && update.history_size > MAX_PASSWORD_HISTORY {
            return Err(PolicyError::InputParam);
        }
        if update.has(policy_flag::MIN_LENGTH) && update.min_length > MAX_PASSWORD_LEN as u32 {
            return Err(PolicyError::InputParam);
        }
        if update.has(policy_flag::MIN_COMPLEX_CHARS)
            && update.min_complex_chars > MAX_PASSWORD_LEN as u32
        {
            return Err(PolicyError::InputParam);
        }
        if update.has(policy_flag::MAX_CHAR_OCCURRENCES)
            && update.max_char_occurrences > MAX_PASSWORD_LEN as u32
        {
            return Err(PolicyError::InputParam);
        }
        if update.has(policy_flag::MAX_NUM_SEQ_LENGTH)
            && update.max_num_seq_length > MAX_PASSWORD_LEN as u32
        {
            return Err(PolicyError::InputParam);
        }
        let quality = if update.has(policy_flag::QUALITY_TYPE) {
            match QualityType::try_from(update.quality) {
                Ok(quality) => Some(quality),
                Err(_) => return Err(PolicyError::InputParam),
            }
        } else {
            None
        };
        if update.has(policy_flag::PATTERN) && !PolicyFile::is_valid_pattern(&update.pattern) {
            debug!(uid = update.uid, "policy update rejected: pattern does not compile");
            return Err(PolicyError::InputParam);
        }

        // Apply the supplied fields. Attempts, validity, and history have
        // no policy-file representation; the processor forwards them to the
        // password store.
        if update.has(policy_flag::MIN_LENGTH) {
            file.set_min_length(update.min_length);
        }
        if update.has(policy_flag::MIN_COMPLEX_CHARS) {
            file.set_min_complex_chars(update.min_complex_chars);
        }
        if update.has(policy_flag::MAX_CHAR_OCCURRENCES) {
            file.set_max_char_occurrences(update.max_char_occurrences);
        }
        if update.has(policy_flag::MAX_NUM_SEQ_LENGTH) {
            file.set_max_num_seq_length(update.max_num_seq_length);
        }
        if let Some(quality) = quality {
            file.set_quality(quality);
        }
        if update.has(policy_flag::PATTERN) {
            file.set_pattern(&update.pattern);
        }
        if update.has(policy_flag::FORBIDDEN_PASSWORDS) {
            file.merge_forbidden(&update.forbidden);
        }

        file.enable();
        file.save()?;
        debug!(uid = update.uid, flags = update.flags, "policy updated");
        Ok(())
    }

    /// Disables the user's policy and resets every field; persists.
    pub fn disable(&mut self, uid: u32) -> Result<(), PolicyError> {
        let file = self.entry(uid)?;
        file.disable();
        file.save()?;
        debug!(uid, "policy disabled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualTimeSource;

    const UID: u32 = 1001;

    fn store_at(dir: &std::path::Path, wall: i64) -> PolicyStore {
        PolicyStore::new(dir, Arc::new(ManualTimeSource::new(wall)))
    }

    fn min_length_update(min_length: u32) -> PolicyUpdate {
        let mut update = PolicyUpdate {
            uid: UID,
            min_length,
            ..PolicyUpdate::default()
        };
        update.set_flag(policy_flag::MIN_LENGTH);
        update
    }

    #[test]
    fn disabled_policy_accepts_anything_within_length_cap() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_at(dir.path(), 1_000);

        store.check(PasswordKind::Normal, "", "x", UID).unwrap();
        store
            .check(PasswordKind::Normal, "", &"a".repeat(32), UID)
            .unwrap();
    }

    #[test]
    fn length_cap_applies_even_with_policy_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_at(dir.path(), 1_000);

        let long = "a".repeat(33);
        assert!(matches!(
            store.check(PasswordKind::Normal, "", &long, UID),
            Err(PolicyError::InputParam)
        ));
        assert!(matches!(
            store.check(PasswordKind::Normal, &long, "ok", UID),
            Err(PolicyError::InputParam)
        ));
    }

    #[test]
    fn recovery_kind_skips_the_rules() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_at(dir.path(), 1_000);
        store.set(&min_length_update(10)).unwrap();

        // Too short for the policy, but the rules bind Normal only.
        store.check(PasswordKind::Recovery, "", "short", UID).unwrap();
        assert!(matches!(
            store.check(PasswordKind::Normal, "", "short", UID),
            Err(PolicyError::InputParam)
        ));
    }

    #[test]
    fn enabled_policy_enforces_each_rule() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_at(dir.path(), 1_000);

        let mut update = PolicyUpdate {
            uid: UID,
            min_length: 6,
            min_complex_chars: 1,
            max_char_occurrences: 2,
            max_num_seq_length: 3,
            quality: QualityType::Alphanumeric.code(),
            forbidden: vec!["Password1".to_string()],
            ..PolicyUpdate::default()
        };
        update.set_flag(policy_flag::MIN_LENGTH);
        update.set_flag(policy_flag::MIN_COMPLEX_CHARS);
        update.set_flag(policy_flag::MAX_CHAR_OCCURRENCES);
        update.set_flag(policy_flag::MAX_NUM_SEQ_LENGTH);
        update.set_flag(policy_flag::QUALITY_TYPE);
        update.set_flag(policy_flag::FORBIDDEN_PASSWORDS);
        store.set(&update).unwrap();

        let reject = |store: &mut PolicyStore, pw: &str| {
            assert!(
                matches!(
                    store.check(PasswordKind::Normal, "", pw, UID),
                    Err(PolicyError::InputParam)
                ),
                "expected rejection of {pw:?}"
            );
        };

        reject(&mut store, "Ab12");      // below min length
        reject(&mut store, "Abcdef");    // no complex character
        reject(&mut store, "Aaa111");    // 'a' occurs three times
        reject(&mut store, "Ab1234");    // digit run of four
        reject(&mut store, "Abc_12");    // fails alphanumeric quality
        reject(&mut store, "Password1"); // forbidden

        store.check(PasswordKind::Normal, "", "Abc129", UID).unwrap();
    }

    #[test]
    fn boundary_password_lengths() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_at(dir.path(), 1_000);
        store.set(&min_length_update(1)).unwrap();

        store
            .check(PasswordKind::Normal, "", &"a".repeat(32), UID)
            .unwrap();
        assert!(matches!(
            store.check(PasswordKind::Normal, "", &"a".repeat(33), UID),
            Err(PolicyError::InputParam)
        ));
    }

    #[test]
    fn set_validates_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_at(dir.path(), 1_000);

        let mut update = PolicyUpdate {
            uid: UID,
            history_size: MAX_PASSWORD_HISTORY + 1,
            ..PolicyUpdate::default()
        };
        update.set_flag(policy_flag::HISTORY_SIZE);
        assert!(matches!(store.set(&update), Err(PolicyError::InputParam)));

        assert!(matches!(
            store.set(&min_length_update(33)),
            Err(PolicyError::InputParam)
        ));

        let mut update = PolicyUpdate {
            uid: UID,
            quality: 9,
            ..PolicyUpdate::default()
        };
        update.set_flag(policy_flag::QUALITY_TYPE);
        assert!(matches!(store.set(&update), Err(PolicyError::InputParam)));

        let mut update = PolicyUpdate {
            uid: UID,
            pattern: "([unclosed".to_string(),
            ..PolicyUpdate::default()
        };
        update.set_flag(policy_flag::PATTERN);
        assert!(matches!(store.set(&update), Err(PolicyError::InputParam)));
    }

    #[test]
    fn oversized_validity_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_at(dir.path(), 1_000);

        let headroom_days = ((i64::from(u32::MAX) - 1_000) / 86_400) as u32;
        let mut update = PolicyUpdate {
            uid: UID,
            valid_days: headroom_days + 1,
            ..PolicyUpdate::default()
        };
        update.set_flag(policy_flag::VALID_PERIOD);
        assert!(matches!(store.set(&update), Err(PolicyError::InputParam)));

        let mut update = PolicyUpdate {
            uid: UID,
            valid_days: headroom_days,
            ..PolicyUpdate::default()
        };
        update.set_flag(policy_flag::VALID_PERIOD);
        store.set(&update).unwrap();
    }

    #[test]
    fn cleared_flag_bits_leave_fields_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_at(dir.path(), 1_000);
        store.set(&min_length_update(8)).unwrap();

        // Update only the pattern; min_length is carried in the body but
        // its flag is cleared, so the stored value must survive.
        let mut update = PolicyUpdate {
            uid: UID,
            min_length: 1,
            pattern: "^[0-9]+$".to_string(),
            ..PolicyUpdate::default()
        };
        update.set_flag(policy_flag::PATTERN);
        store.set(&update).unwrap();

        assert!(matches!(
            store.check(PasswordKind::Normal, "", "1234567", UID),
            Err(PolicyError::InputParam)
        ));
        store.check(PasswordKind::Normal, "", "12345678", UID).unwrap();
    }

    #[test]
    fn rejected_update_leaves_policy_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_at(dir.path(), 1_000);
        store.set(&min_length_update(8)).unwrap();

        // min_length would pass validation, but the malformed pattern
        // rejects the whole update before anything is applied.
        let mut update = min_length_update(2);
        update.pattern = "([unclosed".to_string();
        update.set_flag(policy_flag::PATTERN);
        assert!(matches!(store.set(&update), Err(PolicyError::InputParam)));

        assert!(matches!(
            store.check(PasswordKind::Normal, "", "short", UID),
            Err(PolicyError::InputParam)
        ));
    }

    #[test]
    fn disable_then_set_matches_a_fresh_set() {
        let fresh_dir = tempfile::tempdir().unwrap();
        let reused_dir = tempfile::tempdir().unwrap();

        let mut fresh = store_at(fresh_dir.path(), 1_000);
        fresh.set(&min_length_update(8)).unwrap();

        let mut reused = store_at(reused_dir.path(), 1_000);
        let mut earlier = PolicyUpdate {
            uid: UID,
            min_complex_chars: 3,
            forbidden: vec!["old".to_string()],
            ..PolicyUpdate::default()
        };
        earlier.set_flag(policy_flag::MIN_COMPLEX_CHARS);
        earlier.set_flag(policy_flag::FORBIDDEN_PASSWORDS);
        reused.set(&earlier).unwrap();
        reused.disable(UID).unwrap();
        reused.set(&min_length_update(8)).unwrap();

        let fresh_bytes =
            std::fs::read(fresh_dir.path().join(UID.to_string()).join("policy")).unwrap();
        let reused_bytes =
            std::fs::read(reused_dir.path().join(UID.to_string()).join("policy")).unwrap();
        assert_eq!(fresh_bytes, reused_bytes);
    }

    #[test]
    fn forbidden_list_binds_set_time_only() {
        // The policy store itself only answers check(); a stored forbidden
        // entry rejects the candidate being set, not an existing password.
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_at(dir.path(), 1_000);

        let mut update = PolicyUpdate {
            uid: UID,
            forbidden: vec!["Current1".to_string()],
            ..PolicyUpdate::default()
        };
        update.set_flag(policy_flag::FORBIDDEN_PASSWORDS);
        store.set(&update).unwrap();

        // Forbidden as the new password.
        assert!(matches!(
            store.check(PasswordKind::Normal, "", "Current1", UID),
            Err(PolicyError::InputParam)
        ));
        // Fine as the current password.
        store.check(PasswordKind::Normal, "Current1", "Next2", UID).unwrap();
    }

    #[test]
    fn state_survives_a_store_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = store_at(dir.path(), 1_000);
            store.set(&min_length_update(8)).unwrap();
        }

        let mut store = store_at(dir.path(), 2_000);
        assert!(matches!(
            store.check(PasswordKind::Normal, "", "short", UID),
            Err(PolicyError::InputParam)
        ));
    }
}
