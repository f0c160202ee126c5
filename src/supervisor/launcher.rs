//! Process Launcher & Readiness Gate
//!
//! The worker is spawned from the same executable with the write end of an
//! anonymous pipe placed at fd 3 and its own session. It writes a single `'1'`
//! once it is ready (see [`notify_ready`]). The parent races that byte against
//! the ready timeout.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

#[cfg(unix)]
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
#[cfg(unix)]
use std::os::unix::process::CommandExt;

use tracing::{debug, error, warn};

use super::cancel::CancelToken;
use super::error::{Result, SupervisorError};

/// Descriptor slot the child finds the readiness pipe in
#[cfg(unix)]
pub const READY_FD: RawFd = 3;

/// Tells the worker which descriptor to notify on
pub const NOTIFY_FD_ENV: &str = "WARDEN_NOTIFY_FD";

pub const READY_MARKER: u8 = b'1';

/// How often the readiness wait checks for cancellation
const CANCEL_POLL: Duration = Duration::from_millis(100);

/// How often teardown polls the child for exit
const TEARDOWN_POLL: Duration = Duration::from_millis(100);

/// Everything needed to spawn one worker
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// stdout/stderr of the worker are appended here; `/dev/null` if unset
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ReadyOutcome {
    Ready,
    Failed(String),
    TimedOut,
    Cancelled,
}

fn worker_output(spec: &LaunchSpec) -> Result<(Stdio, Stdio)> {
    let Some(path) = &spec.log_file else {
        return Ok((Stdio::null(), Stdio::null()));
    };
    if let Some(parent) = path.parent()
        && !parent.exists()
    {
        fs::create_dir_all(parent).map_err(|e| {
            SupervisorError::io(format!("Failed to create log directory {:?}", parent), e)
        })?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| SupervisorError::io(format!("Failed to open daemon log {:?}", path), e))?;
    let err_file = file
        .try_clone()
        .map_err(|e| SupervisorError::io("Failed to duplicate daemon log handle", e))?;
    Ok((Stdio::from(file), Stdio::from(err_file)))
}

/// Create a pipe with both ends close-on-exec: (read, write)
#[cfg(target_os = "linux")]
fn ready_pipe() -> std::io::Result<(File, OwnedFd)> {
    let mut fds: [libc::c_int; 2] = [0; 2];
    // Atomic O_CLOEXEC so a concurrent fork elsewhere cannot inherit the ends
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    let read_end = unsafe { File::from_raw_fd(fds[0]) };
    let write_end = unsafe { OwnedFd::from_raw_fd(fds[1]) };
    Ok((read_end, write_end))
}

#[cfg(all(unix, not(target_os = "linux")))]
fn ready_pipe() -> std::io::Result<(File, OwnedFd)> {
    let mut fds: [libc::c_int; 2] = [0; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    let read_end = unsafe { File::from_raw_fd(fds[0]) };
    let write_end = unsafe { OwnedFd::from_raw_fd(fds[1]) };
    for fd in fds {
        if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok((read_end, write_end))
}

/// Spawn the worker detached, returning the child and the pipe's read end
#[cfg(unix)]
pub fn spawn(spec: &LaunchSpec) -> Result<(Child, File)> {
    let (stdout, stderr) = worker_output(spec)?;
    let (read_end, write_end) = ready_pipe()
        .map_err(|e| SupervisorError::io("Failed to create readiness pipe", e))?;

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .env(NOTIFY_FD_ENV, READY_FD.to_string())
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr);

    let write_fd = write_end.as_raw_fd();
    // Runs in the forked child before exec: only async-signal-safe calls
    unsafe {
        cmd.pre_exec(move || {
            if write_fd == READY_FD {
                let flags = libc::fcntl(READY_FD, libc::F_GETFD);
                if flags < 0
                    || libc::fcntl(READY_FD, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0
                {
                    return Err(std::io::Error::last_os_error());
                }
            } else if libc::dup2(write_fd, READY_FD) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::setsid() < 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let spawned = cmd.spawn();
    // The parent's copy of the write end must go now, or a read on the pipe
    // never sees EOF after the child exits.
    drop(write_end);

    let child = spawned.map_err(|e| {
        SupervisorError::io(format!("Failed to start daemon process {:?}", spec.program), e)
    })?;
    debug!(pid = child.id(), program = ?spec.program, args = ?spec.args, "daemon process spawned");
    Ok((child, read_end))
}

#[cfg(not(unix))]
pub fn spawn(_spec: &LaunchSpec) -> Result<(Child, File)> {
    Err(SupervisorError::Config(
        "Daemon supervision is only supported on Unix systems".to_string(),
    ))
}

fn read_marker(mut read_end: File) -> std::result::Result<(), String> {
    let mut buf = [0u8; 1];
    loop {
        match read_end.read(&mut buf) {
            Ok(0) => return Err("readiness pipe closed without a signal".to_string()),
            Ok(_) if buf[0] == READY_MARKER => return Ok(()),
            Ok(_) => return Err(format!("invalid readiness signal {:?}", buf[0] as char)),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(format!("failed reading readiness pipe: {}", e)),
        }
    }
}

/// Wait for the readiness byte, the deadline, or cancellation.
///
/// The reader thread owns the read end and ends once the child writes or
/// every write end closes, so tearing the child down always releases it.
pub fn await_ready(read_end: File, timeout: Duration, cancel: &CancelToken) -> ReadyOutcome {
    let (tx, rx) = mpsc::channel();
    let spawned = thread::Builder::new()
        .name("ready-pipe".to_string())
        .spawn(move || {
            let _ = tx.send(read_marker(read_end));
        });
    if let Err(e) = spawned {
        return ReadyOutcome::Failed(format!("failed to start readiness listener: {}", e));
    }

    let deadline = Instant::now() + timeout;
    loop {
        if cancel.is_cancelled() {
            return ReadyOutcome::Cancelled;
        }
        let now = Instant::now();
        if now >= deadline {
            return ReadyOutcome::TimedOut;
        }
        match rx.recv_timeout(CANCEL_POLL.min(deadline - now)) {
            Ok(Ok(())) => return ReadyOutcome::Ready,
            Ok(Err(reason)) => return ReadyOutcome::Failed(reason),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                return ReadyOutcome::Failed("readiness listener exited".to_string());
            }
        }
    }
}

/// SIGTERM, wait up to `stop_timeout`, then SIGKILL; always reaps the child
pub fn teardown(child: &mut Child, stop_timeout: Duration) {
    let pid = child.id();
    match child.try_wait() {
        Ok(Some(status)) => {
            debug!(pid, %status, "daemon already exited");
            return;
        }
        Ok(None) => {}
        Err(e) => warn!(pid, error = %e, "failed to poll daemon process"),
    }

    #[cfg(unix)]
    if let Err(e) = super::signal::send(pid, super::signal::Signal::Term) {
        error!(pid, error = %e, "failed to send SIGTERM to daemon process");
    }

    let deadline = Instant::now() + stop_timeout;
    while Instant::now() < deadline {
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!(pid, %status, "daemon exited after SIGTERM");
                return;
            }
            Ok(None) => thread::sleep(TEARDOWN_POLL),
            Err(_) => break,
        }
    }

    warn!(pid, "daemon ignored SIGTERM, sending SIGKILL");
    if let Err(e) = child.kill() {
        error!(pid, error = %e, "failed to kill daemon process");
    }
    if let Err(e) = child.wait() {
        error!(pid, error = %e, "failed to wait for daemon process");
    }
}

static NOTIFIED: AtomicBool = AtomicBool::new(false);

/// Called by the worker once startup can no longer fail.
///
/// Writes the ready marker to the descriptor named by `WARDEN_NOTIFY_FD` and
/// closes it. Returns `Ok(false)` without doing anything when not started by
/// the supervisor (variable or descriptor absent) or when already notified.
#[cfg(unix)]
pub fn notify_ready() -> std::io::Result<bool> {
    let Some(fd) = std::env::var(NOTIFY_FD_ENV)
        .ok()
        .and_then(|v| v.trim().parse::<RawFd>().ok())
    else {
        return Ok(false);
    };
    if fd < 0 || NOTIFIED.swap(true, Ordering::SeqCst) {
        return Ok(false);
    }
    if unsafe { libc::fcntl(fd, libc::F_GETFD) } < 0 {
        return Ok(false);
    }

    // Takes ownership, the descriptor closes when `pipe` drops
    let mut pipe = unsafe { File::from_raw_fd(fd) };
    pipe.write_all(&[READY_MARKER])?;
    Ok(true)
}

#[cfg(not(unix))]
pub fn notify_ready() -> std::io::Result<bool> {
    Ok(false)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sh(script: &str) -> LaunchSpec {
        LaunchSpec {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
            env: Vec::new(),
            log_file: None,
        }
    }

    #[test]
    fn test_ready_signal_received() {
        let (mut child, read_end) = spawn(&sh("printf 1 >&3; sleep 30")).unwrap();
        let outcome = await_ready(read_end, Duration::from_secs(10), &CancelToken::new());
        assert_eq!(outcome, ReadyOutcome::Ready);
        teardown(&mut child, Duration::from_secs(2));
    }

    #[test]
    fn test_exit_without_signal_is_failure_not_hang() {
        let (mut child, read_end) = spawn(&sh("exit 0")).unwrap();
        let start = Instant::now();
        let outcome = await_ready(read_end, Duration::from_secs(10), &CancelToken::new());
        assert!(matches!(outcome, ReadyOutcome::Failed(_)), "{:?}", outcome);
        // EOF must arrive well before the deadline
        assert!(start.elapsed() < Duration::from_secs(5));
        teardown(&mut child, Duration::from_secs(1));
    }

    #[test]
    fn test_wrong_byte_is_failure() {
        let (mut child, read_end) = spawn(&sh("printf 0 >&3; sleep 30")).unwrap();
        let outcome = await_ready(read_end, Duration::from_secs(10), &CancelToken::new());
        match outcome {
            ReadyOutcome::Failed(reason) => assert!(reason.contains("invalid")),
            other => panic!("unexpected outcome {:?}", other),
        }
        teardown(&mut child, Duration::from_secs(1));
    }

    #[test]
    fn test_timeout_then_teardown_kills_child() {
        let (mut child, read_end) = spawn(&sh("sleep 30")).unwrap();
        let outcome = await_ready(read_end, Duration::from_millis(300), &CancelToken::new());
        assert_eq!(outcome, ReadyOutcome::TimedOut);
        teardown(&mut child, Duration::from_secs(2));
        assert!(child.try_wait().unwrap().is_some());
    }

    #[test]
    fn test_teardown_escalates_to_sigkill() {
        use std::os::unix::process::ExitStatusExt;

        let (mut child, read_end) =
            spawn(&sh("trap '' TERM; printf 1 >&3; while :; do sleep 1; done")).unwrap();
        // Ready means the trap is already in place
        assert_eq!(
            await_ready(read_end, Duration::from_secs(10), &CancelToken::new()),
            ReadyOutcome::Ready
        );

        let stop_timeout = Duration::from_millis(300);
        let start = Instant::now();
        teardown(&mut child, stop_timeout);
        assert!(start.elapsed() >= stop_timeout);

        let status = child.try_wait().unwrap().expect("child not reaped");
        assert_eq!(status.signal(), Some(libc::SIGKILL));
    }

    #[test]
    fn test_cancel_abandons_wait() {
        let (mut child, read_end) = spawn(&sh("sleep 30")).unwrap();
        let token = CancelToken::new();
        token.cancel();
        let outcome = await_ready(read_end, Duration::from_secs(30), &token);
        assert_eq!(outcome, ReadyOutcome::Cancelled);
        teardown(&mut child, Duration::from_secs(1));
    }

    #[test]
    fn test_child_runs_in_own_session() {
        let (mut child, read_end) = spawn(&sh("printf 1 >&3; sleep 30")).unwrap();
        assert_eq!(
            await_ready(read_end, Duration::from_secs(10), &CancelToken::new()),
            ReadyOutcome::Ready
        );
        let sid = unsafe { libc::getsid(child.id() as i32) };
        assert_eq!(sid, child.id() as i32);
        teardown(&mut child, Duration::from_secs(1));
    }

    #[test]
    fn test_output_goes_to_log_file() {
        let temp_dir = TempDir::new().unwrap();
        let log = temp_dir.path().join("logs").join("daemon.log");
        let mut spec = sh("echo hello-from-worker; printf 1 >&3; sleep 30");
        spec.log_file = Some(log.clone());
        let (mut child, read_end) = spawn(&spec).unwrap();
        assert_eq!(
            await_ready(read_end, Duration::from_secs(10), &CancelToken::new()),
            ReadyOutcome::Ready
        );
        teardown(&mut child, Duration::from_secs(1));
        let content = fs::read_to_string(&log).unwrap();
        assert!(content.contains("hello-from-worker"));
    }

    #[test]
    fn test_notify_ready_without_env_is_noop() {
        // The test harness is never started with the notify variable set
        if std::env::var_os(NOTIFY_FD_ENV).is_none() {
            assert!(!notify_ready().unwrap());
        }
    }
}
