//! Node-wide mutual exclusion for backup and restore operations.
//!
//! The lock is an advisory `flock` held on an open file handle, so it is
//! released when the handle is dropped or the holding process dies. The lock
//! file itself is left in place.

use crate::utils::errors::{BackupError, Result};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Interval between attempts while waiting for a held lock
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// An acquired lock. Dropping it releases the lock.
pub struct GlobalLock {
    path: PathBuf,
    _file: Flock<File>,
}

impl GlobalLock {
    /// Acquire the lock on `path`.
    ///
    /// With `wait` unset this fails immediately with
    /// [`BackupError::LockUnavailable`] when another holder exists. With `wait`
    /// set it polls until the lock is free; callers bound the wait themselves.
    pub async fn acquire(path: &Path, wait: bool) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;

        loop {
            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(locked) => {
                    // Holder pid is informational only.
                    let _ = locked.set_len(0);
                    let _ = writeln!(&*locked, "{}", std::process::id());

                    info!(lock_file = %path.display(), "Acquired global lock");
                    return Ok(Self {
                        path: path.to_path_buf(),
                        _file: locked,
                    });
                }
                Err((returned, errno)) if errno == Errno::EWOULDBLOCK => {
                    if !wait {
                        return Err(BackupError::LockUnavailable(path.to_path_buf()));
                    }
                    debug!(lock_file = %path.display(), "Global lock is held, waiting");
                    file = returned;
                    tokio::time::sleep(LOCK_POLL_INTERVAL).await;
                }
                Err((_, errno)) => return Err(BackupError::Io(std::io::Error::from(errno))),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for GlobalLock {
    fn drop(&mut self) {
        debug!(lock_file = %self.path.display(), "Releasing global lock");
    }
}
