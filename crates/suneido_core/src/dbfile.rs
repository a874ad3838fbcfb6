//! Database file paths and locking.
//!
//! A database is a single file. Alongside it live:
//!
//! ```text
//! <file>          # the block log
//! <file>.lock     # advisory lock, exclusive for writers, shared for readers
//! <file>.tmp      # output of rebuild/compact before it replaces <file>
//! <file>.bak      # previous <file> after a replace
//! ```

use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::info;

/// Appends a suffix to a path's file name.
#[must_use]
pub fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Path of the lock file for `path`.
#[must_use]
pub fn lock_path(path: &Path) -> PathBuf {
    sibling(path, ".lock")
}

/// Path rebuild and compact write to before replacing `path`.
#[must_use]
pub fn temp_path(path: &Path) -> PathBuf {
    sibling(path, ".tmp")
}

/// Path the previous file is kept at after a replace.
#[must_use]
pub fn backup_path(path: &Path) -> PathBuf {
    sibling(path, ".bak")
}

/// An advisory lock on a database file, released on drop.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    _file: File,
}

impl FileLock {
    /// Takes an exclusive lock for writing.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseLocked` if any other handle holds a lock.
    pub fn exclusive(path: &Path) -> CoreResult<Self> {
        let file = Self::open(path)?;
        if file.try_lock_exclusive().is_err() {
            return Err(CoreError::DatabaseLocked);
        }
        Ok(Self {
            path: path.to_path_buf(),
            _file: file,
        })
    }

    /// Takes a shared lock for reading.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseLocked` if a writer holds the lock.
    pub fn shared(path: &Path) -> CoreResult<Self> {
        let file = Self::open(path)?;
        if file.try_lock_shared().is_err() {
            return Err(CoreError::DatabaseLocked);
        }
        Ok(Self {
            path: path.to_path_buf(),
            _file: file,
        })
    }

    fn open(path: &Path) -> CoreResult<File> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        Ok(OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path(path))?)
    }

    /// The locked database path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Moves `path` to `<path>.bak` and `replacement` to `path`.
///
/// # Errors
///
/// Returns an I/O error if either rename fails.
pub fn replace_keeping_backup(path: &Path, replacement: &Path) -> CoreResult<()> {
    let bak = backup_path(path);
    if bak.exists() {
        fs::remove_file(&bak)?;
    }
    if path.exists() {
        fs::rename(path, &bak)?;
    }
    fs::rename(replacement, path)?;
    info!(path = %path.display(), backup = %bak.display(), "replaced database file");
    Ok(())
}
