//! Advisory file locks shared between CLI invocations.
//!
//! The lock file lives next to the PID file (`<pid-file>.lock`) and carries no
//! data. Mutating commands take `LOCK_EX`, status takes `LOCK_SH`. The lock is
//! released when the guard is dropped.
//!
//! Acquisition polls with `LOCK_NB` so a waiter can give up when its
//! [`CancelToken`] fires instead of sitting in `flock` until the holder is done.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;

use tracing::{debug, warn};

use super::cancel::CancelToken;
use super::error::{Result, SupervisorError};

/// How often a contended waiter retries and checks for cancellation
const LOCK_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Exclusive,
    Shared,
}

/// RAII guard for an acquired lock
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    path: PathBuf,
    mode: LockMode,
}

impl LockGuard {
    /// Open (creating if needed) the lock file and wait until the lock is
    /// granted or `cancel` fires
    #[cfg(unix)]
    pub fn acquire(lock_path: &Path, mode: LockMode, cancel: &CancelToken) -> Result<Self> {
        if let Some(parent) = lock_path.parent()
            && !parent.exists()
        {
            fs::create_dir_all(parent).map_err(|e| {
                SupervisorError::io(format!("Failed to create directory {:?}", parent), e)
            })?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(lock_path)
            .map_err(|e| {
                SupervisorError::io(format!("Failed to open lock file {:?}", lock_path), e)
            })?;

        let op = match mode {
            LockMode::Exclusive => libc::LOCK_EX,
            LockMode::Shared => libc::LOCK_SH,
        };
        let fd = file.as_raw_fd();
        let mut contended = false;
        loop {
            if unsafe { libc::flock(fd, op | libc::LOCK_NB) } == 0 {
                break;
            }
            let err = std::io::Error::last_os_error();
            match err.kind() {
                std::io::ErrorKind::Interrupted => continue,
                std::io::ErrorKind::WouldBlock => {
                    if !contended {
                        debug!(path = ?lock_path, ?mode, "lock held elsewhere, waiting");
                        contended = true;
                    }
                    if cancel.is_cancelled() {
                        return Err(SupervisorError::Cancelled);
                    }
                    std::thread::sleep(LOCK_POLL);
                }
                _ => {
                    return Err(SupervisorError::Lock {
                        path: lock_path.to_path_buf(),
                        source: err,
                    });
                }
            }
        }

        debug!(path = ?lock_path, ?mode, "lock acquired");
        Ok(LockGuard {
            file,
            path: lock_path.to_path_buf(),
            mode,
        })
    }

    #[cfg(not(unix))]
    pub fn acquire(lock_path: &Path, _mode: LockMode, _cancel: &CancelToken) -> Result<Self> {
        Err(SupervisorError::Lock {
            path: lock_path.to_path_buf(),
            source: std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "advisory locks are only supported on Unix systems",
            ),
        })
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Release the lock now rather than at end of scope
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            // Closing the descriptor releases the lock too; unlock explicitly anyway
            let fd = self.file.as_raw_fd();
            if unsafe { libc::flock(fd, libc::LOCK_UN) } != 0 {
                warn!(
                    path = ?self.path,
                    error = %std::io::Error::last_os_error(),
                    "failed to unlock"
                );
            }
        }
    }
}
