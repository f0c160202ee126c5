//! Signal delivery and exit polling for processes we may not be the parent of.
//!
//! `Child::wait` only works for our own children, and the daemon outlives the
//! CLI that started it, so exit is detected by polling liveness.

use std::time::{Duration, Instant};

use super::cancel::CancelToken;
use super::verify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Term,
    Kill,
}

impl Signal {
    #[cfg(unix)]
    fn raw(self) -> i32 {
        match self {
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

/// Result of sending a signal
#[derive(Debug, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// ESRCH: the process exited before the signal arrived
    AlreadyGone,
}

#[cfg(unix)]
pub fn send(pid: u32, signal: Signal) -> std::io::Result<Delivery> {
    if unsafe { libc::kill(pid as i32, signal.raw()) } != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(Delivery::AlreadyGone);
        }
        return Err(err);
    }
    Ok(Delivery::Sent)
}

#[cfg(not(unix))]
pub fn send(_pid: u32, _signal: Signal) -> std::io::Result<Delivery> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "Process signals are only supported on Unix systems",
    ))
}

#[derive(Debug, PartialEq, Eq)]
pub enum Exit {
    Exited,
    TimedOut,
    Cancelled,
}

/// Poll `is_alive` every `interval` until the process is gone, `timeout`
/// elapses, or the token is cancelled.
pub fn wait_for_exit(
    pid: u32,
    timeout: Duration,
    interval: Duration,
    cancel: &CancelToken,
) -> Exit {
    let deadline = Instant::now() + timeout;
    loop {
        if !verify::is_alive(pid) {
            return Exit::Exited;
        }
        if cancel.is_cancelled() {
            return Exit::Cancelled;
        }
        let now = Instant::now();
        if now >= deadline {
            return Exit::TimedOut;
        }
        std::thread::sleep(interval.min(deadline - now));
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn test_term_then_exit() {
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        assert_eq!(send(pid, Signal::Term).unwrap(), Delivery::Sent);
        let exit = wait_for_exit(
            pid,
            Duration::from_secs(5),
            Duration::from_millis(20),
            &CancelToken::new(),
        );
        assert_eq!(exit, Exit::Exited);
    }

    #[test]
    fn test_signal_to_missing_process() {
        assert_eq!(send(999999999, Signal::Kill).unwrap(), Delivery::AlreadyGone);
    }

    #[test]
    fn test_wait_times_out_on_live_process() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let start = Instant::now();
        let exit = wait_for_exit(
            child.id(),
            Duration::from_millis(150),
            Duration::from_millis(20),
            &CancelToken::new(),
        );
        assert_eq!(exit, Exit::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(150));
        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn test_wait_abandons_on_cancel() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let token = CancelToken::new();
        token.cancel();
        let exit = wait_for_exit(
            child.id(),
            Duration::from_secs(30),
            Duration::from_millis(20),
            &token,
        );
        assert_eq!(exit, Exit::Cancelled);
        child.kill().unwrap();
        child.wait().unwrap();
    }
}
