//! Liveness and identity checks for recorded PIDs.
//!
//! A PID on disk proves nothing by itself: the process may have exited, or
//! the kernel may have handed the number to an unrelated program. Both checks
//! answer conservatively (`false`) whenever they cannot be sure.

use std::path::{Path, PathBuf};

/// Decides whether a live PID is an instance of our executable
pub trait BinaryIdentity: Send + Sync {
    fn is_same_binary(&self, pid: u32) -> bool;

    /// Short name for logs and status output
    fn name(&self) -> &'static str;
}

/// Compares `/proc/<pid>/exe` against a reference executable
#[derive(Debug, Clone)]
pub struct ProcExeIdentity {
    reference: PathBuf,
}

impl ProcExeIdentity {
    pub fn new(reference: impl Into<PathBuf>) -> Self {
        Self {
            reference: reference.into(),
        }
    }
}

impl BinaryIdentity for ProcExeIdentity {
    fn is_same_binary(&self, pid: u32) -> bool {
        if pid == 0 {
            return false;
        }
        match std::fs::read_link(format!("/proc/{}/exe", pid)) {
            Ok(target) => paths_match(&self.reference, &target),
            Err(_) => false,
        }
    }

    fn name(&self) -> &'static str {
        "proc-exe"
    }
}

/// Fallback for hosts without a way to inspect another process's image
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedIdentity;

impl BinaryIdentity for UnsupportedIdentity {
    fn is_same_binary(&self, _pid: u32) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "unsupported"
    }
}

/// The identity capability for this host, anchored at `reference`
pub fn default_identity(reference: &Path) -> Box<dyn BinaryIdentity> {
    if cfg!(target_os = "linux") {
        Box::new(ProcExeIdentity::new(reference))
    } else {
        Box::new(UnsupportedIdentity)
    }
}

/// Canonicalized comparison, falling back to the raw paths when either side
/// cannot be resolved (e.g. `/proc/<pid>/exe` pointing at a deleted file)
pub fn paths_match(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a_real), Ok(b_real)) => a_real == b_real,
        _ => a == b,
    }
}

/// Check whether `pid` runs the same executable as the current process
pub fn is_same_binary(pid: u32) -> bool {
    match std::env::current_exe() {
        Ok(own) => default_identity(&own).is_same_binary(pid),
        Err(_) => false,
    }
}

/// Check if a process is alive without affecting it.
///
/// If `pid` is an exited child of this process it is reaped first, otherwise
/// the zombie would keep answering the signal probe.
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    let pid_i32 = pid as i32;
    let reaped = unsafe { libc::waitpid(pid_i32, std::ptr::null_mut(), libc::WNOHANG) };
    if reaped == pid_i32 {
        return false;
    }
    let probed = unsafe { libc::kill(pid_i32, 0) } == 0;
    probed && !is_zombie(pid)
}

/// A zombie someone else has yet to reap, e.g. under a PID 1 that never waits
#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) else {
        return false;
    };
    // The command name may contain spaces or parens; the state follows the last ')'
    stat.rfind(')')
        .and_then(|i| stat[i + 1..].split_whitespace().next())
        .is_some_and(|state| state == "Z")
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_zombie(_pid: u32) -> bool {
    false
}

#[cfg(not(unix))]
pub fn is_alive(_pid: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_own_process_is_alive() {
        assert!(is_alive(std::process::id()));
    }

    #[test]
    fn test_unused_pid_is_not_alive() {
        assert!(!is_alive(999999999));
        assert!(!is_alive(0));
        assert!(!is_alive(u32::MAX));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_own_process_is_same_binary() {
        assert!(is_same_binary(std::process::id()));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_other_binary_is_rejected() {
        let mut child = std::process::Command::new("sleep")
            .arg("5")
            .spawn()
            .unwrap();
        assert!(is_alive(child.id()));
        assert!(!is_same_binary(child.id()));
        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_exited_child_is_reaped_and_dead() {
        let child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        // Give it time to exit and become a zombie
        std::thread::sleep(std::time::Duration::from_millis(200));
        assert!(!is_alive(pid));
    }

    #[test]
    fn test_unsupported_identity_is_conservative() {
        assert!(!UnsupportedIdentity.is_same_binary(std::process::id()));
        assert_eq!(UnsupportedIdentity.name(), "unsupported");
    }

    #[cfg(unix)]
    #[test]
    fn test_paths_match_through_symlink() {
        let temp_dir = TempDir::new().unwrap();
        let real = temp_dir.path().join("real");
        std::fs::write(&real, "x").unwrap();
        let link = temp_dir.path().join("link");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        assert!(paths_match(&real, &link));
        assert!(!paths_match(&real, &temp_dir.path().join("other")));
    }

    #[test]
    fn test_paths_match_raw_fallback() {
        let missing = Path::new("/nonexistent/warden (deleted)");
        assert!(paths_match(missing, missing));
        assert!(!paths_match(missing, Path::new("/nonexistent/other")));
    }
}
