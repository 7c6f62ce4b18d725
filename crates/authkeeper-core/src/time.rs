//! Injected time for the stores.
//!
//! The password store needs two clocks: wall time in seconds for expiry
//! deadlines (which must survive restarts and are persisted), and a
//! monotonic reading for the 500 ms retry ignore period (which must not jump
//! when the wall clock is adjusted). Injecting both behind one trait lets
//! the expiry and ignore-period logic be driven deterministically in tests.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Source of wall-clock seconds and a monotonic reading.
pub trait TimeSource: Send + Sync {
    /// Seconds since the Unix epoch.
    fn wall_secs(&self) -> i64;

    /// Monotonic offset from an arbitrary fixed origin. Never decreases.
    fn monotonic(&self) -> Duration;
}

/// Production time source backed by [`SystemTime`] and [`Instant`].
#[derive(Debug)]
pub struct SystemTimeSource {
    origin: Instant,
}

impl SystemTimeSource {
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for SystemTimeSource {
    fn wall_secs(&self) -> i64 {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(elapsed) => elapsed.as_secs() as i64,
            // Pre-epoch clocks only occur on badly misconfigured hosts;
            // treat them as the epoch rather than panicking.
            Err(_) => 0,
        }
    }

    fn monotonic(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Hand-driven time source for tests.
///
/// Clones share the same underlying readings, so a store can hold one handle
/// while the test advances time through another.
#[derive(Debug, Clone)]
pub struct ManualTimeSource {
    state: Arc<Mutex<ManualState>>,
}

#[derive(Debug)]
struct ManualState {
    wall_secs: i64,
    monotonic: Duration,
}

impl ManualTimeSource {
    /// Creates a source at the given wall time with a monotonic origin well
    /// past zero, so backdated guards have room to subtract.
    #[must_use]
    pub fn new(wall_secs: i64) -> Self {
        Self {
            state: Arc::new(Mutex::new(ManualState {
                wall_secs,
                monotonic: Duration::from_secs(3600),
            })),
        }
    }

    /// Advances both clocks by `seconds`.
    pub fn advance_secs(&self, seconds: u64) {
        let mut state = self.lock();
        state.wall_secs += seconds as i64;
        state.monotonic += Duration::from_secs(seconds);
    }

    /// Advances both clocks by `duration` (wall time rounds down to whole
    /// seconds).
    pub fn advance(&self, duration: Duration) {
        let mut state = self.lock();
        state.wall_secs += duration.as_secs() as i64;
        state.monotonic += duration;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl TimeSource for ManualTimeSource {
    fn wall_secs(&self) -> i64 {
        self.lock().wall_secs
    }

    fn monotonic(&self) -> Duration {
        self.lock().monotonic
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_source_advances_both_clocks() {
        let time = ManualTimeSource::new(1_000);
        let mono = time.monotonic();

        time.advance_secs(120);
        assert_eq!(time.wall_secs(), 1_120);
        assert_eq!(time.monotonic() - mono, Duration::from_secs(120));
    }

    #[test]
    fn manual_clones_share_state() {
        let time = ManualTimeSource::new(0);
        let other = time.clone();
        other.advance(Duration::from_millis(1500));
        assert_eq!(time.wall_secs(), 1);
    }

    #[test]
    fn system_source_is_monotonic() {
        let time = SystemTimeSource::new();
        let a = time.monotonic();
        let b = time.monotonic();
        assert!(b >= a);
        assert!(time.wall_secs() > 0);
    }
}
