//! # Cross-Process File Lock
//!
//! Writers serialize on an OS advisory lock taken on a sibling lock file,
//! `<table file>.lock`, rather than on the table file itself. Compaction
//! replaces the table file by rename; a lock held on the old inode would
//! silently stop excluding anyone, while the sibling file never moves.
//!
//! ```text
//! users.jsonlt        ← data, read without locking
//! users.jsonlt.lock   ← empty, flock'd by whoever is writing
//! ```
//!
//! Acquisition polls `try_lock_exclusive` with a short back-off until the
//! timeout expires. The lock is released when the [`FileLock`] is dropped,
//! on every path including early returns with `?`.

use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;
use tracing::debug;

use crate::error::{Error, Result};

/// First sleep between attempts; doubles up to [`MAX_BACKOFF`].
const INITIAL_BACKOFF: Duration = Duration::from_millis(1);

const MAX_BACKOFF: Duration = Duration::from_millis(50);

/// Returns the lock file path for a table file.
pub fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_default();
    name.push(".lock");
    path.with_file_name(name)
}

/// An exclusive lock, held until dropped.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Takes the exclusive lock on `lock_path`, creating the file if needed.
    ///
    /// Fails with [`Error::LockTimeout`] if another holder keeps it longer
    /// than `timeout`. A zero timeout means a single attempt.
    pub fn acquire(lock_path: &Path, timeout: Duration) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(lock_path)
            .map_err(|e| Error::io(lock_path, e))?;

        let started = Instant::now();
        let mut backoff = INITIAL_BACKOFF;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    debug!(path = %lock_path.display(), waited = ?started.elapsed(), "lock acquired");
                    return Ok(Self {
                        file,
                        path: lock_path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => {}
                Err(e) => return Err(Error::io(lock_path, e)),
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(Error::LockTimeout {
                    path: lock_path.to_path_buf(),
                    timeout,
                });
            }
            thread::sleep(backoff.min(timeout - elapsed));
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// The lock file this guard holds.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // Closing the descriptor releases the lock as well; unlocking first
        // makes the release visible without waiting for the close.
        let _ = self.file.unlock();
        debug!(path = %self.path.display(), "lock released");
    }
}
