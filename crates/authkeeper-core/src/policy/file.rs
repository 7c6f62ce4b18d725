//! One user's policy file and the quality-check primitives.
//!
//! Persisted per user as `<data_dir>/<uid>/policy`: `(version, enabled,
//! min_length, min_complex_chars, max_char_occurrences, max_num_seq_length,
//! quality_type, pattern, forbidden_passwords)`. A file with the wrong
//! version or a failing field resets to defaults and is rewritten, the same
//! recovery rule the password file follows.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::fs::{self, FsError};
use crate::record::{RecordError, RecordReader, RecordWriter};

const POLICY_FILE: &str = "policy";

/// Version tag of the current `policy` record format.
const FILE_VERSION: u32 = 1;

/// Size cap when reading the policy file back in.
const MAX_STATE_FILE: u64 = 64 * 1024;

/// Password quality classes. Each maps to a fixed pattern; the pattern is
/// searched, so anchoring comes from the pattern text itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u32)]
pub enum QualityType {
    /// No constraint (`[.]*` matches everything, the empty string included).
    #[default]
    Unspecified = 0,
    /// At least one character.
    Something = 1,
    /// Digits only.
    Numeric = 2,
    /// ASCII letters only.
    Alphabetic = 3,
    /// ASCII letters and digits only.
    Alphanumeric = 4,
}

impl QualityType {
    /// The fixed pattern for this class.
    #[must_use]
    pub const fn pattern(self) -> &'static str {
        match self {
            Self::Unspecified => "[.]*",
            Self::Something => ".+",
            Self::Numeric => "^[0-9]+$",
            Self::Alphabetic => "^[A-Za-z]+$",
            Self::Alphanumeric => "^[A-Za-z0-9]+$",
        }
    }

    /// The wire representation of this class.
    #[must_use]
    pub const fn code(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for QualityType {
    type Error = u32;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Self::Unspecified),
            1 => Ok(Self::Something),
            2 => Ok(Self::Numeric),
            3 => Ok(Self::Alphabetic),
            4 => Ok(Self::Alphanumeric),
            other => Err(other),
        }
    }
}

/// In-memory image of one user's policy file.
#[derive(Debug)]
pub struct PolicyFile {
    uid: u32,
    dir: PathBuf,

    enabled: bool,
    min_length: u32,
    min_complex_chars: u32,
    max_char_occurrences: u32,
    max_num_seq_length: u32,
    quality: QualityType,
    pattern: String,
    forbidden: BTreeSet<String>,
}

impl PolicyFile {
    /// Opens (or lazily creates) the policy state for `uid`.
    ///
    /// # Errors
    ///
    /// Returns [`FsError`] for unrecoverable filesystem failures.
    pub fn open(data_dir: &Path, uid: u32) -> Result<Self, FsError> {
        fs::ensure_dir(data_dir)?;
        let dir = data_dir.join(uid.to_string());
        fs::ensure_dir(&dir)?;

        let mut file = Self {
            uid,
            dir,
            enabled: false,
            min_length: 0,
            min_complex_chars: 0,
            max_char_occurrences: 0,
            max_num_seq_length: 0,
            quality: QualityType::Unspecified,
            pattern: String::new(),
            forbidden: BTreeSet::new(),
        };

        if !file.policy_path().exists() {
            debug!(uid, "policy file missing; creating");
            file.save()?;
        } else if let Err(err) = file.load() {
            warn!(uid, %err, "invalid policy file; resetting to defaults");
            file.reset_state();
            file.save()?;
        }
        Ok(file)
    }

    fn policy_path(&self) -> PathBuf {
        self.dir.join(POLICY_FILE)
    }

    fn reset_state(&mut self) {
        self.enabled = false;
        self.min_length = 0;
        self.min_complex_chars = 0;
        self.max_char_occurrences = 0;
        self.max_num_seq_length = 0;
        self.quality = QualityType::Unspecified;
        self.pattern.clear();
        self.forbidden.clear();
    }

    /// Serializes the current image and writes it atomically.
    ///
    /// # Errors
    ///
    /// Returns [`FsError`] if the write fails.
    pub fn save(&self) -> Result<(), FsError> {
        let mut w = RecordWriter::with_capacity(64);
        w.put_u32(FILE_VERSION);
        w.put_bool(self.enabled);
        w.put_u32(self.min_length);
        w.put_u32(self.min_complex_chars);
        w.put_u32(self.max_char_occurrences);
        w.put_u32(self.max_num_seq_length);
        w.put_u32(self.quality.code());
        w.put_str(&self.pattern);
        w.put_count(self.forbidden.len());
        for entry in &self.forbidden {
            w.put_str(entry);
        }
        fs::atomic_write(&self.policy_path(), &w.into_bytes())
    }

    fn load(&mut self) -> Result<(), LoadError> {
        let bytes = fs::bounded_read(&self.policy_path(), MAX_STATE_FILE)?;
        let mut r = RecordReader::new(&bytes);

        let version = r.get_u32()?;
        if version != FILE_VERSION {
            return Err(LoadError::Version(version));
        }

        self.enabled = r.get_bool()?;
        self.min_length = r.get_u32()?;
        self.min_complex_chars = r.get_u32()?;
        self.max_char_occurrences = r.get_u32()?;
        self.max_num_seq_length = r.get_u32()?;
        self.quality = QualityType::try_from(r.get_u32()?).map_err(RecordError::UnknownDiscriminant)?;
        self.pattern = r.get_str()?;

        self.forbidden.clear();
        let count = r.get_count()?;
        for _ in 0..count {
            self.forbidden.insert(r.get_str()?);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Enablement
    // ------------------------------------------------------------------

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    /// Disables the policy and clears every field back to defaults.
    pub fn disable(&mut self) {
        self.reset_state();
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    // ------------------------------------------------------------------
    // Quality checks (each returns `true` when the rule passes; a rule
    // whose configured value is 0 always passes)
    // ------------------------------------------------------------------

    #[must_use]
    pub fn check_min_length(&self, password: &str) -> bool {
        password.len() >= self.min_length as usize
    }

    /// Counts bytes outside `[A-Za-z]` against the configured minimum.
    #[must_use]
    pub fn check_min_complex_chars(&self, password: &str) -> bool {
        if self.min_complex_chars == 0 {
            return true;
        }
        let complex = password
            .bytes()
            .filter(|b| !b.is_ascii_alphabetic())
            .count();
        complex >= self.min_complex_chars as usize
    }

    /// No single byte value may occur more often than the configured cap.
    #[must_use]
    pub fn check_max_char_occurrences(&self, password: &str) -> bool {
        if self.max_char_occurrences == 0 {
            return true;
        }
        let mut occurrences = [0u32; 256];
        for b in password.bytes() {
            occurrences[b as usize] += 1;
        }
        occurrences
            .iter()
            .all(|&count| count <= self.max_char_occurrences)
    }

    /// The longest run of digits forming an arithmetic progression with
    /// common difference −1, 0, or +1 must not exceed the configured cap.
    #[must_use]
    pub fn check_max_num_seq_length(&self, password: &str) -> bool {
        if self.max_num_seq_length == 0 {
            return true;
        }
        longest_numeric_run(password) <= self.max_num_seq_length
    }

    #[must_use]
    pub fn check_quality(&self, password: &str) -> bool {
        match regex::Regex::new(self.quality.pattern()) {
            Ok(re) => re.is_match(password),
            Err(_) => false,
        }
    }

    /// Whether `pattern` compiles. An empty pattern is valid (disabled).
    #[must_use]
    pub fn is_valid_pattern(pattern: &str) -> bool {
        pattern.is_empty() || regex::Regex::new(pattern).is_ok()
    }

    #[must_use]
    pub fn check_pattern(&self, password: &str) -> bool {
        if self.pattern.is_empty() {
            return true;
        }
        match regex::Regex::new(&self.pattern) {
            Ok(re) => re.is_match(password),
            Err(_) => false,
        }
    }

    /// Forbidden entries are exact, case-sensitive matches. The empty
    /// password is never forbidden (emptiness is governed elsewhere).
    #[must_use]
    pub fn check_forbidden(&self, password: &str) -> bool {
        password.is_empty() || !self.forbidden.contains(password)
    }

    // ------------------------------------------------------------------
    // Setters (used by the store when applying a flag-gated update)
    // ------------------------------------------------------------------

    pub fn set_min_length(&mut self, min_length: u32) {
        self.min_length = min_length;
    }

    pub fn set_min_complex_chars(&mut self, min_complex_chars: u32) {
        self.min_complex_chars = min_complex_chars;
    }

    pub fn set_max_char_occurrences(&mut self, max_char_occurrences: u32) {
        self.max_char_occurrences = max_char_occurrences;
    }

    pub fn set_max_num_seq_length(&mut self, max_num_seq_length: u32) {
        self.max_num_seq_length = max_num_seq_length;
    }

    pub fn set_quality(&mut self, quality: QualityType) {
        self.quality = quality;
    }

    pub fn set_pattern(&mut self, pattern: &str) {
        self.pattern = pattern.to_string();
    }

    /// Merges `entries` into the forbidden set. An empty entry clears the
    /// whole set; non-empty entries are deduplicated by the set itself.
    pub fn merge_forbidden(&mut self, entries: &[String]) {
        for entry in entries {
            if entry.is_empty() {
                self.forbidden.clear();
            } else {
                self.forbidden.insert(entry.clone());
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn forbidden_len(&self) -> usize {
        self.forbidden.len()
    }
}

/// Length of the longest digit run whose consecutive differences stay fixed
/// at −1, 0, or +1. A non-digit, or a change of difference, starts a new
/// run.
fn longest_numeric_run(password: &str) -> u32 {
    let mut longest = 0u32;
    let mut current = 0u32;
    let mut difference: Option<i32> = None;
    let mut previous: Option<u8> = None;

    for byte in password.bytes() {
        if byte.is_ascii_digit() {
            match (difference, previous) {
                // First digit after a reset.
                (None, None) => current = 1,
                // Second digit: try to establish the progression.
                (None, Some(prev)) => {
                    let step = i32::from(byte) - i32::from(prev);
                    if (-1..=1).contains(&step) {
                        difference = Some(step);
                        current = 2;
                    } else {
                        longest = longest.max(current);
                        current = 1;
                    }
                }
                // Progression established: either it continues or restarts.
                (Some(step), Some(prev)) => {
                    if i32::from(byte) == i32::from(prev) + step {
                        current += 1;
                    } else {
                        longest = longest.max(current);
                        difference = None;
                        current = 1;
                    }
                }
                (Some(_), None) => unreachable!("difference requires a previous digit"),
            }
            previous = Some(byte);
        } else {
            longest = longest.max(current);
            difference = None;
            current = 0;
            previous = None;
        }
    }
    longest.max(current)
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

#[cfg(test)]
mod tests {
    use super::*;

    fn open(dir: &Path, uid: u32) -> PolicyFile {
        PolicyFile::open(dir, uid).unwrap()
    }

    #[test]
    fn fresh_policy_is_disabled_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let file = open(dir.path(), 1001);
        assert!(!file.is_enabled());
        assert!(dir.path().join("1001").join("policy").exists());
    }

    #[test]
    fn save_load_round_trips_state() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut file = open(dir.path(), 1001);
            file.set_min_length(8);
            file.set_quality(QualityType::Alphanumeric);
            file.set_pattern("^[A-Z]");
            file.merge_forbidden(&["qwerty".to_string(), "123456".to_string()]);
            file.enable();
            file.save().unwrap();
        }

        let file = open(dir.path(), 1001);
        assert!(file.is_enabled());
        assert!(!file.check_min_length("short"));
        assert!(file.check_min_length("longenough"));
        assert!(!file.check_forbidden("qwerty"));
        assert!(file.check_forbidden("qwertz"));
        assert!(file.check_pattern("Abc"));
        assert!(!file.check_pattern("abc"));
    }

    #[test]
    fn serialize_deserialize_serialize_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut file = open(dir.path(), 3);
            file.set_min_length(6);
            file.merge_forbidden(&["b".to_string(), "a".to_string()]);
            file.enable();
            file.save().unwrap();
        }
        let first = std::fs::read(dir.path().join("3").join("policy")).unwrap();

        let file = open(dir.path(), 3);
        file.save().unwrap();
        let second = std::fs::read(dir.path().join("3").join("policy")).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn corrupt_policy_file_resets_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut file = open(dir.path(), 2);
            file.set_min_length(10);
            file.enable();
            file.save().unwrap();
        }

        let path = dir.path().join("2").join("policy");
        std::fs::write(&path, b"garbage").unwrap();

        let file = open(dir.path(), 2);
        assert!(!file.is_enabled());
        assert!(file.check_min_length(""));
    }

    #[test]
    fn disable_clears_all_fields() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = open(dir.path(), 1);
        file.set_min_length(10);
        file.merge_forbidden(&["secret".to_string()]);
        file.enable();

        file.disable();
        assert!(!file.is_enabled());
        assert!(file.check_min_length("x"));
        assert!(file.check_forbidden("secret"));
    }

    #[test]
    fn min_complex_chars_counts_non_alphabetic_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = open(dir.path(), 1);

        file.set_min_complex_chars(0);
        assert!(file.check_min_complex_chars("abc"));

        file.set_min_complex_chars(2);
        assert!(!file.check_min_complex_chars("abcdef"));
        assert!(!file.check_min_complex_chars("abc1ef"));
        assert!(file.check_min_complex_chars("abc12f"));
        assert!(file.check_min_complex_chars("a!c1ef"));
    }

    #[test]
    fn max_char_occurrences_counts_each_byte() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = open(dir.path(), 1);

        file.set_max_char_occurrences(2);
        assert!(file.check_max_char_occurrences("aabbcc"));
        assert!(!file.check_max_char_occurrences("aaabc"));

        file.set_max_char_occurrences(0);
        assert!(file.check_max_char_occurrences("aaaaaa"));
    }

    #[test]
    fn numeric_run_tracks_progressions_with_unit_steps() {
        assert_eq!(longest_numeric_run("1234"), 4);
        assert_eq!(longest_numeric_run("1111"), 4);
        assert_eq!(longest_numeric_run("9876"), 4);
        // +2 steps never form a progression.
        assert_eq!(longest_numeric_run("135"), 1);
        // Non-digits break the run.
        assert_eq!(longest_numeric_run("12a34"), 2);
        // A direction change starts a new run at the boundary digit.
        assert_eq!(longest_numeric_run("12321"), 3);
        assert_eq!(longest_numeric_run(""), 0);
        assert_eq!(longest_numeric_run("abc"), 0);
        assert_eq!(longest_numeric_run("a1b2c3"), 1);
    }

    #[test]
    fn max_num_seq_length_gates_on_the_longest_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = open(dir.path(), 1);

        file.set_max_num_seq_length(3);
        assert!(file.check_max_num_seq_length("ab123cd"));
        assert!(!file.check_max_num_seq_length("ab1234cd"));

        file.set_max_num_seq_length(0);
        assert!(file.check_max_num_seq_length("123456789"));
    }

    #[test]
    fn quality_patterns_classify_passwords() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = open(dir.path(), 1);

        file.set_quality(QualityType::Unspecified);
        assert!(file.check_quality(""));
        assert!(file.check_quality("anything"));

        file.set_quality(QualityType::Something);
        assert!(!file.check_quality(""));
        assert!(file.check_quality("x"));

        file.set_quality(QualityType::Numeric);
        assert!(file.check_quality("0451"));
        assert!(!file.check_quality("0451a"));

        file.set_quality(QualityType::Alphabetic);
        assert!(file.check_quality("abcXYZ"));
        assert!(!file.check_quality("abc1"));

        file.set_quality(QualityType::Alphanumeric);
        assert!(file.check_quality("abc123"));
        assert!(!file.check_quality("abc_123"));
    }

    #[test]
    fn forbidden_merge_deduplicates_and_empty_entry_clears() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = open(dir.path(), 1);

        file.merge_forbidden(&["a".to_string(), "b".to_string(), "a".to_string()]);
        assert_eq!(file.forbidden_len(), 2);

        // Later entries merge into the existing set.
        file.merge_forbidden(&["c".to_string()]);
        assert_eq!(file.forbidden_len(), 3);

        // An empty entry clears everything seen so far; following entries
        // repopulate.
        file.merge_forbidden(&[String::new(), "z".to_string()]);
        assert_eq!(file.forbidden_len(), 1);
        assert!(!file.check_forbidden("z"));
        assert!(file.check_forbidden("a"));
    }

    #[test]
    fn pattern_validation_accepts_empty_and_rejects_malformed() {
        assert!(PolicyFile::is_valid_pattern(""));
        assert!(PolicyFile::is_valid_pattern("^[0-9]{4}$"));
        assert!(!PolicyFile::is_valid_pattern("([unclosed"));
    }
}
