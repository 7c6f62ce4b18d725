//! Daemon configuration.
//!
//! Loaded from a TOML file when one exists; command-line flags override
//! individual fields. Defaults target a system installation; tests and
//! development point both directories somewhere disposable.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

use crate::framing::DEFAULT_MAX_FRAME_SIZE;

/// Daemon settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// Directory holding the four endpoint sockets.
    pub runtime_dir: PathBuf,

    /// Directory holding per-user state (`<data_dir>/<uid>/...`).
    pub data_dir: PathBuf,

    /// Maximum accepted frame size in bytes.
    pub max_frame_size: usize,

    /// Optional PID file location.
    pub pid_file: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            runtime_dir: PathBuf::from("/run/authkeeper"),
            data_dir: PathBuf::from("/var/lib/authkeeper"),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            pid_file: None,
        }
    }
}

impl DaemonConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or does not parse.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_point_at_system_paths() {
        let config = DaemonConfig::default();
        assert_eq!(config.runtime_dir, PathBuf::from("/run/authkeeper"));
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/authkeeper"));
        assert_eq!(config.max_frame_size, DEFAULT_MAX_FRAME_SIZE);
        assert!(config.pid_file.is_none());
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authkeeper.toml");
        std::fs::write(&path, "data_dir = \"/tmp/authkeeper-test\"\n").unwrap();

        let config = DaemonConfig::from_file(&path).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/authkeeper-test"));
        assert_eq!(config.runtime_dir, PathBuf::from("/run/authkeeper"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authkeeper.toml");
        std::fs::write(&path, "data_dirr = \"/oops\"\n").unwrap();

        assert!(DaemonConfig::from_file(&path).is_err());
    }
}
