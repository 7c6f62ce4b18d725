//! Filesystem primitives for the per-user state files.
//!
//! Three helpers cover every write the stores perform:
//!
//! 1. [`atomic_write`] — temp file in the target directory, write, flush,
//!    fsync, rename over the final path, fsync the parent directory. A crash
//!    at any point leaves either the old complete file or the new complete
//!    file, never a torn one. Used for the `password` and `policy` records.
//! 2. [`write_small`] — truncate, write, flush, fsync in place. Used for the
//!    4-byte `attempt` counter, which must be durable before a failed guess
//!    is reported but has no multi-field image to tear.
//! 3. [`bounded_read`] — checks the file size against a cap before reading,
//!    so a corrupted or hostile state file cannot exhaust memory.
//!
//! Files are created with mode 0600 and directories with mode 0700; state
//! belongs to the service account alone.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::Path;

/// Mode for state files: owner read/write only.
const FILE_MODE: u32 = 0o600;

/// Mode for per-user state directories.
const DIR_MODE: u32 = 0o700;

/// Errors from the filesystem helpers.
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    /// The target path has no parent directory to stage the temp file in.
    #[error("path has no parent directory: {}", path.display())]
    NoParentDirectory {
        /// Offending path.
        path: std::path::PathBuf,
    },

    /// The file exceeds the configured size cap.
    #[error("file too large: {size} bytes exceeds maximum of {max} bytes")]
    FileTooLarge {
        /// Actual size in bytes.
        size: u64,
        /// Permitted maximum in bytes.
        max: u64,
    },

    /// An I/O operation failed.
    #[error("I/O error during {context}: {source}")]
    Io {
        /// Operation that failed.
        context: &'static str,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl FsError {
    fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }
}

/// Creates `dir` (and missing ancestors) with mode 0700 if absent.
///
/// An existing directory is left untouched; its mode is not rewritten.
///
/// # Errors
///
/// Returns [`FsError::Io`] if creation fails.
pub fn ensure_dir(dir: &Path) -> Result<(), FsError> {
    if dir.is_dir() {
        return Ok(());
    }
    fs::DirBuilder::new()
        .recursive(true)
        .mode(DIR_MODE)
        .create(dir)
        .map_err(|e| FsError::io("create state directory", e))
}

/// Writes `data` to `path` via the temp + fsync + rename protocol.
///
/// The temp file is created in the parent directory of `path` (same
/// filesystem, so the rename is atomic) with mode 0600. After the rename the
/// parent directory is fsynced so the directory entry itself is durable.
///
/// # Errors
///
/// Returns [`FsError`] if any step fails; the final path is then either
/// untouched or already holds the complete new contents.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<(), FsError> {
    let parent = path.parent().ok_or_else(|| FsError::NoParentDirectory {
        path: path.to_path_buf(),
    })?;
    ensure_dir(parent)?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| FsError::io("create temp file", e))?;

    // NamedTempFile creates with 0600 already; make the invariant explicit
    // rather than inherited.
    tmp.as_file()
        .set_permissions(fs::Permissions::from_mode(FILE_MODE))
        .map_err(|e| FsError::io("set temp file mode", e))?;

    tmp.write_all(data)
        .map_err(|e| FsError::io("write temp file", e))?;
    tmp.flush().map_err(|e| FsError::io("flush temp file", e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| FsError::io("fsync temp file", e))?;

    tmp.persist(path)
        .map_err(|e| FsError::io("rename into place", e.error))?;

    fsync_dir(parent)
}

/// Truncate-write-flush-fsync for small single-field files.
///
/// # Errors
///
/// Returns [`FsError::Io`] if the write or sync fails.
pub fn write_small(path: &Path, data: &[u8]) -> Result<(), FsError> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(FILE_MODE)
        .open(path)
        .map_err(|e| FsError::io("open counter file", e))?;
    file.write_all(data)
        .map_err(|e| FsError::io("write counter file", e))?;
    file.flush()
        .map_err(|e| FsError::io("flush counter file", e))?;
    file.sync_all()
        .map_err(|e| FsError::io("fsync counter file", e))
}

/// Reads `path` fully, rejecting files larger than `max` bytes before any
/// allocation.
///
/// # Errors
///
/// Returns [`FsError::FileTooLarge`] for oversized files and
/// [`FsError::Io`] for read failures.
pub fn bounded_read(path: &Path, max: u64) -> Result<Vec<u8>, FsError> {
    let file = File::open(path).map_err(|e| FsError::io("open state file", e))?;
    let size = file
        .metadata()
        .map_err(|e| FsError::io("stat state file", e))?
        .len();
    if size > max {
        return Err(FsError::FileTooLarge { size, max });
    }

    let mut data = Vec::with_capacity(size as usize);
    // Cap the handle too in case the file grew between stat and read.
    let mut reader = file.take(max + 1);
    reader
        .read_to_end(&mut data)
        .map_err(|e| FsError::io("read state file", e))?;
    if data.len() as u64 > max {
        return Err(FsError::FileTooLarge {
            size: data.len() as u64,
            max,
        });
    }
    Ok(data)
}

/// Fsync a directory so a just-renamed entry is durable.
fn fsync_dir(dir: &Path) -> Result<(), FsError> {
    let handle = File::open(dir).map_err(|e| FsError::io("open parent directory", e))?;
    handle
        .sync_all()
        .map_err(|e| FsError::io("fsync parent directory", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");

        atomic_write(&path, b"first").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"first");

        atomic_write(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");
    }

    #[test]
    fn atomic_write_sets_owner_only_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");
        atomic_write(&path, b"data").unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn atomic_write_leaves_no_temp_files_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");
        atomic_write(&path, b"data").unwrap();

        let entries: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("state")]);
    }

    #[test]
    fn write_small_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attempt");
        write_small(&path, &7u32.to_le_bytes()).unwrap();
        assert_eq!(fs::read(&path).unwrap(), 7u32.to_le_bytes());

        write_small(&path, &0u32.to_le_bytes()).unwrap();
        assert_eq!(fs::read(&path).unwrap(), 0u32.to_le_bytes());
    }

    #[test]
    fn bounded_read_rejects_oversized_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");
        fs::write(&path, vec![0u8; 128]).unwrap();

        assert!(matches!(
            bounded_read(&path, 64),
            Err(FsError::FileTooLarge { size: 128, max: 64 })
        ));
        assert_eq!(bounded_read(&path, 128).unwrap().len(), 128);
    }

    #[test]
    fn ensure_dir_creates_with_restrictive_mode() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        ensure_dir(&nested).unwrap();

        let mode = fs::metadata(&nested).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }
}
