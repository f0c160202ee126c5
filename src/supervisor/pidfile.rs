//! PID Store
//!
//! Lives at the configured PID file path. Content is either empty (not
//! running) or one positive decimal PID. The store does no locking of its
//! own: every call assumes the caller holds the lock from `lock.rs`.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

use super::error::{Result, SupervisorError};

#[cfg(unix)]
const PID_FILE_MODE: u32 = 0o644;

#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the recorded PID. Missing file or blank content means not running.
    pub fn read(&self) -> Result<Option<u32>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(SupervisorError::io(
                    format!("Failed to read PID file {:?}", self.path),
                    e,
                ));
            }
        };

        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }

        // pid_t is i32; anything outside 1..=i32::MAX cannot be a process
        match trimmed.parse::<i32>() {
            Ok(pid) if pid > 0 => Ok(Some(pid as u32)),
            _ => Err(SupervisorError::CorruptPidFile {
                path: self.path.clone(),
                content: trimmed.to_string(),
            }),
        }
    }

    pub fn write(&self, pid: u32) -> Result<()> {
        self.rewrite(pid.to_string().as_bytes())
    }

    pub fn clear(&self) -> Result<()> {
        self.rewrite(b"")
    }

    /// Truncate and rewrite the whole file, then fsync
    fn rewrite(&self, content: &[u8]) -> Result<()> {
        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(PID_FILE_MODE);

        let mut file = options.open(&self.path).map_err(|e| {
            SupervisorError::io(format!("Failed to open PID file {:?}", self.path), e)
        })?;
        file.write_all(content).map_err(|e| {
            SupervisorError::io(format!("Failed to write PID file {:?}", self.path), e)
        })?;
        file.sync_all().map_err(|e| {
            SupervisorError::io(format!("Failed to sync PID file {:?}", self.path), e)
        })?;
        Ok(())
    }

    /// Modification time of the record, used for uptime reporting
    pub fn modified(&self) -> Option<std::time::SystemTime> {
        fs::metadata(&self.path).and_then(|m| m.modified()).ok()
    }
}
