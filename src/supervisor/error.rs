use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Invalid supervisor config: {0}")]
    Config(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        source: std::io::Error,
    },

    #[error("Failed to acquire lock on {path:?}: {source}")]
    Lock {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Corrupt PID file {path:?}: invalid content {content:?}")]
    CorruptPidFile { path: PathBuf, content: String },

    #[error("Process {pid} is running but is not the expected binary, refusing to {action} it")]
    Ownership { pid: u32, action: &'static str },

    #[error("Daemon (PID {pid}) did not signal readiness within {timeout:?}")]
    ReadyTimeout { pid: u32, timeout: Duration },

    #[error("Daemon (PID {pid}) failed to become ready: {reason}")]
    NotReady { pid: u32, reason: String },

    #[error("Timeout waiting for daemon (PID {pid}) to stop within {timeout:?}, consider using 'kill'")]
    StopTimeout { pid: u32, timeout: Duration },

    #[error("Process {pid} still alive after SIGKILL")]
    StillAlive { pid: u32 },

    #[error("Operation cancelled")]
    Cancelled,
}

impl SupervisorError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        SupervisorError::Io {
            context: context.into(),
            source,
        }
    }

    /// Readiness and graceful-stop timeouts. The caller may escalate to a kill.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            SupervisorError::ReadyTimeout { .. } | SupervisorError::StopTimeout { .. }
        )
    }

    pub fn is_ownership(&self) -> bool {
        matches!(self, SupervisorError::Ownership { .. })
    }
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_classification() {
        let stop = SupervisorError::StopTimeout {
            pid: 42,
            timeout: Duration::from_secs(1),
        };
        assert!(stop.is_timeout());
        assert!(!stop.is_ownership());

        let owner = SupervisorError::Ownership {
            pid: 42,
            action: "stop",
        };
        assert!(owner.is_ownership());
        assert!(!owner.is_timeout());
        assert!(owner.to_string().contains("refusing to stop"));
    }

    #[test]
    fn test_corrupt_message_names_file_and_content() {
        let err = SupervisorError::CorruptPidFile {
            path: PathBuf::from("/tmp/x.pid"),
            content: "abc".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("/tmp/x.pid"));
        assert!(msg.contains("abc"));
    }
}
