//! Single-instance daemon supervisor
//!
//! Starts, monitors and stops exactly one worker process re-invoked from our
//! own executable. All state lives on disk (`<pid-file>` and
//! `<pid-file>.lock`), so concurrent CLI invocations coordinate through
//! advisory locks instead of shared memory.
//!
//! Every operation follows the same shape: lock, read the PID record, verify
//! liveness and identity, act, update the record, unlock.

pub mod cancel;
pub mod error;
pub mod health;
pub mod launcher;
pub mod lock;
pub mod pidfile;
pub mod signal;
pub mod verify;

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

pub use cancel::CancelToken;
pub use error::{Result, SupervisorError};
pub use health::{HealthProbe, HttpHealthProbe};
pub use launcher::{LaunchSpec, READY_MARKER, notify_ready};
pub use lock::{LockGuard, LockMode};
pub use pidfile::PidFile;
pub use verify::{BinaryIdentity, ProcExeIdentity, UnsupportedIdentity, is_alive, is_same_binary};

use launcher::ReadyOutcome;
use signal::{Delivery, Exit, Signal};

const LOCK_FILE_SUFFIX: &str = ".lock";

/// Liveness poll interval while waiting for a graceful stop
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// How long to wait for the kernel to reap a SIGKILLed process
const KILL_CONFIRM_TIMEOUT: Duration = Duration::from_secs(2);
const KILL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Pause between the stop and start halves of a restart
const RESTART_SETTLE: Duration = Duration::from_millis(250);

/// Supervisor settings. Validated once by [`Supervisor::new`].
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Absolute path of the PID file
    pub pid_file: PathBuf,
    /// Max time to wait for the readiness signal
    pub ready_timeout: Duration,
    /// Max time to wait for a graceful shutdown
    pub stop_timeout: Duration,
    /// Arguments that put the executable in worker mode, e.g. `["daemon", "run"]`
    pub run_args: Vec<String>,
    /// Probed by `status`; no URL means no health gate
    pub health_check_url: Option<String>,
    /// Worker executable; the current executable when unset
    pub program: Option<PathBuf>,
    /// Whether `kill` is offered at all
    pub kill_enabled: bool,
    /// Append the worker's stdout/stderr here
    pub log_file: Option<PathBuf>,
    /// Extra environment for the worker
    pub env: Vec<(String, String)>,
}

impl SupervisorConfig {
    pub fn new(pid_file: impl Into<PathBuf>, run_args: Vec<String>) -> Self {
        Self {
            pid_file: pid_file.into(),
            ready_timeout: Duration::from_secs(10),
            stop_timeout: Duration::from_secs(10),
            run_args,
            health_check_url: None,
            program: None,
            kill_enabled: true,
            log_file: None,
            env: Vec::new(),
        }
    }

    /// `<pid-file>.lock`
    pub fn lock_file(&self) -> PathBuf {
        let mut name = OsString::from(self.pid_file.as_os_str());
        name.push(LOCK_FILE_SUFFIX);
        PathBuf::from(name)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pid_file.as_os_str().is_empty() {
            return Err(SupervisorError::Config("pid_file must be provided".into()));
        }
        if !self.pid_file.is_absolute() {
            return Err(SupervisorError::Config(format!(
                "pid_file must be absolute, got {:?}",
                self.pid_file
            )));
        }
        if self.pid_file.file_name().is_none() {
            return Err(SupervisorError::Config(format!(
                "pid_file must name a file, got {:?}",
                self.pid_file
            )));
        }
        if self.ready_timeout.is_zero() {
            return Err(SupervisorError::Config("ready_timeout must be non-zero".into()));
        }
        if self.stop_timeout.is_zero() {
            return Err(SupervisorError::Config("stop_timeout must be non-zero".into()));
        }
        if self.run_args.is_empty() {
            return Err(SupervisorError::Config("run_args must be provided".into()));
        }
        if let Some(url) = &self.health_check_url {
            let parsed = reqwest::Url::parse(url).map_err(|e| {
                SupervisorError::Config(format!("invalid health_check_url {:?}: {}", url, e))
            })?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(SupervisorError::Config(format!(
                    "health_check_url must be http or https, got {:?}",
                    url
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum StartOutcome {
    Started { pid: u32 },
    AlreadyRunning { pid: u32 },
}

impl StartOutcome {
    pub fn pid(&self) -> u32 {
        match self {
            StartOutcome::Started { pid } | StartOutcome::AlreadyRunning { pid } => *pid,
        }
    }
}

/// Result of `stop` and `kill`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum StopOutcome {
    NotRunning,
    /// The recorded process was already dead; the record was cleared
    StaleCleared { pid: u32 },
    Stopped { pid: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestartOutcome {
    pub stop: StopOutcome,
    /// Whether the stop half had to escalate to SIGKILL
    pub escalated: bool,
    pub start: StartOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum Health {
    /// No health URL configured
    Unchecked,
    Healthy,
    Unhealthy(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DaemonStatus {
    NotRunning,
    Running {
        pid: u32,
        since: Option<DateTime<Utc>>,
        health: Health,
    },
    /// Alive, but not our executable. Reported, never corrected.
    IdentityMismatch { pid: u32 },
    /// Recorded process is dead. The record has been cleared.
    Stale { pid: u32 },
}

impl DaemonStatus {
    /// Short classification string printed by `status`
    pub fn classification(&self) -> &'static str {
        match self {
            DaemonStatus::NotRunning => "Not Running",
            DaemonStatus::Running { health, .. } => match health {
                Health::Unchecked => "Running",
                Health::Healthy => "Running (Healthy)",
                Health::Unhealthy(_) => "Running (Unhealthy)",
            },
            DaemonStatus::IdentityMismatch { .. } => "Identity Mismatch",
            DaemonStatus::Stale { .. } => "Stale",
        }
    }

    pub fn pid(&self) -> Option<u32> {
        match self {
            DaemonStatus::NotRunning => None,
            DaemonStatus::Running { pid, .. }
            | DaemonStatus::IdentityMismatch { pid }
            | DaemonStatus::Stale { pid } => Some(*pid),
        }
    }

    /// False for states that need an operator's attention
    pub fn is_ok(&self) -> bool {
        !matches!(
            self,
            DaemonStatus::IdentityMismatch { .. }
                | DaemonStatus::Running {
                    health: Health::Unhealthy(_),
                    ..
                }
        )
    }
}

/// What the verifier concluded about a recorded PID
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Liveness {
    Dead,
    Foreign,
    Ours,
}

pub struct Supervisor {
    config: SupervisorConfig,
    program: PathBuf,
    pids: PidFile,
    identity: Box<dyn BinaryIdentity>,
    health: Option<Box<dyn HealthProbe>>,
    cancel: CancelToken,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("config", &self.config)
            .field("program", &self.program)
            .field("identity", &self.identity.name())
            .field("health", &self.health.is_some())
            .finish()
    }
}

impl Supervisor {
    /// Validate the config and resolve the worker executable
    pub fn new(config: SupervisorConfig) -> Result<Self> {
        config.validate()?;

        let program = match &config.program {
            Some(p) => p.clone(),
            None => std::env::current_exe()
                .map_err(|e| SupervisorError::io("Failed to get current executable path", e))?,
        };
        let program = program.canonicalize().unwrap_or(program);

        let health: Option<Box<dyn HealthProbe>> = config
            .health_check_url
            .as_ref()
            .map(|url| Box::new(HttpHealthProbe::new(url.clone())) as Box<dyn HealthProbe>);

        Ok(Self {
            pids: PidFile::new(config.pid_file.clone()),
            identity: verify::default_identity(&program),
            program,
            health,
            cancel: CancelToken::new(),
            config,
        })
    }

    pub fn with_identity(mut self, identity: Box<dyn BinaryIdentity>) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_health_probe(mut self, probe: Box<dyn HealthProbe>) -> Self {
        self.health = Some(probe);
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Resolved worker executable
    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn pid_file(&self) -> &Path {
        self.pids.path()
    }

    /// Take the command lock. A cancel that lands while waiting, or just as
    /// the lock is granted, aborts before anything is touched.
    fn lock(&self, mode: LockMode) -> Result<LockGuard> {
        let guard = LockGuard::acquire(&self.config.lock_file(), mode, &self.cancel)?;
        if self.cancel.is_cancelled() {
            debug!("cancelled after acquiring lock");
            return Err(SupervisorError::Cancelled);
        }
        Ok(guard)
    }

    fn classify(&self, pid: u32) -> Liveness {
        if !verify::is_alive(pid) {
            Liveness::Dead
        } else if !self.identity.is_same_binary(pid) {
            Liveness::Foreign
        } else {
            Liveness::Ours
        }
    }

    fn launch_spec(&self) -> LaunchSpec {
        LaunchSpec {
            program: self.program.clone(),
            args: self.config.run_args.clone(),
            env: self.config.env.clone(),
            log_file: self.config.log_file.clone(),
        }
    }

    /// Launch the worker and wait for its readiness signal.
    ///
    /// A verified running worker makes this a no-op. The PID is recorded only
    /// after readiness; every failure path tears the child down.
    pub fn start(&self) -> Result<StartOutcome> {
        let _lock = self.lock(LockMode::Exclusive)?;

        if let Some(pid) = self.pids.read()? {
            match self.classify(pid) {
                Liveness::Ours => {
                    info!(pid, "daemon already running");
                    return Ok(StartOutcome::AlreadyRunning { pid });
                }
                state => {
                    warn!(pid, ?state, pid_file = ?self.pids.path(), "clearing stale PID record");
                    self.pids.clear()?;
                }
            }
        }

        let (mut child, read_end) = launcher::spawn(&self.launch_spec())?;
        let pid = child.id();

        let failure = match launcher::await_ready(read_end, self.config.ready_timeout, &self.cancel)
        {
            ReadyOutcome::Ready => match self.pids.write(pid) {
                Ok(()) => {
                    info!(pid, "daemon ready");
                    return Ok(StartOutcome::Started { pid });
                }
                Err(e) => {
                    // Never leave a partial record behind for an untracked worker
                    if let Err(clear_err) = self.pids.clear() {
                        error!(error = %clear_err, "failed to clear PID file after write failure");
                    }
                    e
                }
            },
            ReadyOutcome::Failed(reason) => SupervisorError::NotReady { pid, reason },
            ReadyOutcome::TimedOut => SupervisorError::ReadyTimeout {
                pid,
                timeout: self.config.ready_timeout,
            },
            ReadyOutcome::Cancelled => SupervisorError::Cancelled,
        };

        error!(pid, error = %failure, "daemon did not start cleanly, tearing down");
        launcher::teardown(&mut child, self.config.stop_timeout);
        Err(failure)
    }

    /// Classify the daemon. Takes a shared lock so status calls run
    /// concurrently with each other but never inside a mutating operation.
    pub fn status(&self) -> Result<DaemonStatus> {
        let _lock = self.lock(LockMode::Shared)?;

        let Some(pid) = self.pids.read()? else {
            debug!("PID file empty, daemon not running");
            return Ok(DaemonStatus::NotRunning);
        };

        match self.classify(pid) {
            Liveness::Dead => {
                warn!(pid, "recorded daemon is dead, clearing stale PID record");
                self.pids.clear()?;
                Ok(DaemonStatus::Stale { pid })
            }
            Liveness::Foreign => {
                warn!(pid, "recorded PID is alive but not our binary");
                Ok(DaemonStatus::IdentityMismatch { pid })
            }
            Liveness::Ours => {
                let since = self.pids.modified().map(DateTime::<Utc>::from);
                let health = match &self.health {
                    None => Health::Unchecked,
                    Some(probe) => match probe.check() {
                        Ok(()) => Health::Healthy,
                        Err(reason) => Health::Unhealthy(reason),
                    },
                };
                Ok(DaemonStatus::Running { pid, since, health })
            }
        }
    }

    /// Graceful stop: SIGTERM, then poll until exit or the stop timeout.
    ///
    /// On timeout the record stays in place, since the worker may still be
    /// alive; the caller decides whether to escalate with [`Supervisor::kill`].
    pub fn stop(&self) -> Result<StopOutcome> {
        let _lock = self.lock(LockMode::Exclusive)?;

        let pid = match self.owned_pid("stop")? {
            Owned::NotRunning => return Ok(StopOutcome::NotRunning),
            Owned::StaleCleared(pid) => return Ok(StopOutcome::StaleCleared { pid }),
            Owned::Ours(pid) => pid,
        };

        info!(pid, "sending SIGTERM to daemon");
        match signal::send(pid, Signal::Term) {
            Ok(Delivery::Sent) => {}
            Ok(Delivery::AlreadyGone) => {
                debug!(pid, "daemon exited before SIGTERM arrived");
                self.pids.clear()?;
                return Ok(StopOutcome::Stopped { pid });
            }
            Err(e) => {
                return Err(SupervisorError::io(
                    format!("Failed to send SIGTERM to PID {}", pid),
                    e,
                ));
            }
        }

        match signal::wait_for_exit(pid, self.config.stop_timeout, STOP_POLL_INTERVAL, &self.cancel)
        {
            Exit::Exited => {
                info!(pid, "daemon stopped gracefully");
                self.pids.clear()?;
                Ok(StopOutcome::Stopped { pid })
            }
            Exit::TimedOut => Err(SupervisorError::StopTimeout {
                pid,
                timeout: self.config.stop_timeout,
            }),
            Exit::Cancelled => Err(SupervisorError::Cancelled),
        }
    }

    /// Forceful stop with SIGKILL. Same ownership rules as `stop`.
    pub fn kill(&self) -> Result<StopOutcome> {
        if !self.config.kill_enabled {
            return Err(SupervisorError::Config(
                "kill is disabled by configuration".into(),
            ));
        }
        let _lock = self.lock(LockMode::Exclusive)?;

        let pid = match self.owned_pid("kill")? {
            Owned::NotRunning => return Ok(StopOutcome::NotRunning),
            Owned::StaleCleared(pid) => return Ok(StopOutcome::StaleCleared { pid }),
            Owned::Ours(pid) => pid,
        };

        info!(pid, "sending SIGKILL to daemon");
        let send_error = match signal::send(pid, Signal::Kill) {
            Ok(Delivery::Sent) => None,
            Ok(Delivery::AlreadyGone) => {
                debug!(pid, "daemon already gone before SIGKILL");
                None
            }
            Err(e) => Some(e),
        };

        // Confirm death even if the signal call failed; the record goes as soon as it is confirmed
        match signal::wait_for_exit(pid, KILL_CONFIRM_TIMEOUT, KILL_POLL_INTERVAL, &self.cancel) {
            Exit::Exited => {
                self.pids.clear()?;
                Ok(StopOutcome::Stopped { pid })
            }
            Exit::Cancelled => Err(SupervisorError::Cancelled),
            Exit::TimedOut => match send_error {
                Some(e) => Err(SupervisorError::io(
                    format!("Failed to send SIGKILL to PID {}", pid),
                    e,
                )),
                None => Err(SupervisorError::StillAlive { pid }),
            },
        }
    }

    /// Stop then start, each under its own lock acquisition.
    ///
    /// When the stop half times out, `escalate` decides whether to kill and
    /// carry on; declining returns the timeout error with the record intact.
    /// Any other stop failure aborts before starting.
    pub fn restart<F>(&self, mut escalate: F) -> Result<RestartOutcome>
    where
        F: FnMut(&SupervisorError) -> bool,
    {
        let (stop, escalated) = match self.stop() {
            Ok(outcome) => (outcome, false),
            Err(e) if e.is_timeout() => {
                warn!(error = %e, "graceful stop timed out during restart");
                if !escalate(&e) {
                    return Err(e);
                }
                (self.kill()?, true)
            }
            Err(e) => return Err(e),
        };

        if matches!(stop, StopOutcome::Stopped { .. }) {
            std::thread::sleep(RESTART_SETTLE);
        }

        let start = self.start()?;
        Ok(RestartOutcome {
            stop,
            escalated,
            start,
        })
    }

    /// Shared front half of stop and kill. Caller holds the exclusive lock.
    fn owned_pid(&self, action: &'static str) -> Result<Owned> {
        let Some(pid) = self.pids.read()? else {
            debug!("PID file empty, daemon not running");
            return Ok(Owned::NotRunning);
        };
        match self.classify(pid) {
            Liveness::Dead => {
                info!(pid, "recorded daemon already stopped, clearing stale PID record");
                self.pids.clear()?;
                Ok(Owned::StaleCleared(pid))
            }
            Liveness::Foreign => Err(SupervisorError::Ownership { pid, action }),
            Liveness::Ours => Ok(Owned::Ours(pid)),
        }
    }
}

enum Owned {
    NotRunning,
    StaleCleared(u32),
    Ours(u32),
}
