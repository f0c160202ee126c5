//! Daemon supervision commands
//!
//! Usage:
//!   warden daemon start     # Launch the daemon and wait until it is ready
//!   warden daemon status    # Classify the recorded daemon
//!   warden daemon stop      # SIGTERM, wait up to the stop timeout
//!   warden daemon kill      # SIGKILL
//!   warden daemon restart   # stop (optionally escalating to kill), then start
//!
//! Settings come from `<data-dir>/config.toml`:
//!   [daemon]
//!   ready_timeout_secs = 10
//!   stop_timeout_secs = 10
//!   health_check = true

use anyhow::{Context, Result};
use std::io::IsTerminal;
use std::path::Path;
use std::thread;

use warden::config::Config;
use warden::server;
use warden::supervisor::{
    CancelToken, DaemonStatus, Health, StartOutcome, StopOutcome, Supervisor, SupervisorError,
};

/// Conventional exit status for a SIGINT-terminated command
const INTERRUPTED_EXIT: i32 = 130;

/// Build the supervisor for `data_dir` and cancel its waits on Ctrl-C
pub fn supervisor(data_dir: &Path, config: &Config) -> Result<Supervisor> {
    let cancel = CancelToken::new();
    watch_ctrl_c(cancel.clone());
    let supervisor = Supervisor::new(config.supervisor_config(data_dir))
        .context("Failed to configure daemon supervisor")?
        .with_cancel_token(cancel);
    Ok(supervisor)
}

/// Cancel `token` on the first Ctrl-C and exit on the second. Runs a small
/// runtime on its own thread so the supervisor's blocking waits stay untouched.
///
/// The handler replaces the default SIGINT disposition, so every supervisor
/// wait (lock, readiness, stop) polls the token. The second press covers
/// anything that does not, such as a teardown the operator gave up on.
fn watch_ctrl_c(token: CancelToken) {
    let spawned = thread::Builder::new()
        .name("ctrl-c".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    tracing::warn!(error = %e, "Ctrl-C handling unavailable");
                    return;
                }
            };
            runtime.block_on(async {
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
                tracing::info!("Ctrl-C received, cancelling");
                token.cancel();
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("Interrupted");
                    std::process::exit(INTERRUPTED_EXIT);
                }
            });
        });
    if let Err(e) = spawned {
        tracing::warn!(error = %e, "failed to spawn Ctrl-C watcher");
    }
}

pub fn run_start(supervisor: &Supervisor, json: bool) -> Result<()> {
    let outcome = supervisor.start()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }
    match outcome {
        StartOutcome::Started { pid } => println!("Daemon ready (PID {})", pid),
        StartOutcome::AlreadyRunning { pid } => {
            println!("Daemon already running (PID {})", pid)
        }
    }
    Ok(())
}

pub fn run_status(supervisor: &Supervisor, json: bool) -> Result<()> {
    let status = supervisor.status()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("Daemon: {}", status.classification());
        match &status {
            DaemonStatus::NotRunning => {}
            DaemonStatus::Running { pid, since, health } => {
                println!("  PID: {}", pid);
                if let Some(since) = since {
                    let uptime = chrono::Utc::now().signed_duration_since(*since);
                    println!(
                        "  Uptime: {} (since {})",
                        format_duration(uptime.num_seconds().max(0)),
                        since.to_rfc3339()
                    );
                }
                if let Health::Unhealthy(reason) = health {
                    println!("  Health: {}", reason);
                }
            }
            DaemonStatus::IdentityMismatch { pid } => {
                println!("  PID {} is alive but is not this program", pid);
                println!("  Remove {} by hand if it is outdated", supervisor.pid_file().display());
            }
            DaemonStatus::Stale { pid } => {
                println!("  PID {} is dead, cleared the stale PID file", pid);
            }
        }
    }

    if !status.is_ok() {
        anyhow::bail!("Daemon needs attention: {}", status.classification());
    }
    Ok(())
}

pub fn run_stop(supervisor: &Supervisor, json: bool) -> Result<()> {
    let outcome = supervisor.stop()?;
    print_stop(&outcome, "stopped", json)
}

pub fn run_kill(supervisor: &Supervisor, json: bool) -> Result<()> {
    let outcome = supervisor.kill()?;
    print_stop(&outcome, "killed", json)
}

/// Restart, asking before escalating to SIGKILL unless `yes` is set
pub fn run_restart(supervisor: &Supervisor, yes: bool, json: bool) -> Result<()> {
    let outcome = supervisor.restart(|err| confirm_escalation(err, yes))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }
    match outcome.stop {
        StopOutcome::Stopped { pid } if outcome.escalated => println!("Daemon killed (PID {})", pid),
        StopOutcome::Stopped { pid } => println!("Daemon stopped (PID {})", pid),
        StopOutcome::StaleCleared { pid } => {
            println!("Daemon was not running (cleared stale PID {})", pid)
        }
        StopOutcome::NotRunning => println!("Daemon was not running"),
    }
    println!("Daemon ready (PID {})", outcome.start.pid());
    Ok(())
}

/// Worker entry point: serve until told to stop
pub fn run_worker(config: &Config) -> Result<()> {
    tracing::info!(pid = std::process::id(), "daemon worker starting");
    server::run_blocking(&config.server)
}

fn print_stop(outcome: &StopOutcome, verb: &str, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(outcome)?);
        return Ok(());
    }
    match outcome {
        StopOutcome::NotRunning => println!("Daemon not running"),
        StopOutcome::StaleCleared { pid } => {
            println!("Daemon not running (cleared stale PID {})", pid)
        }
        StopOutcome::Stopped { pid } => println!("Daemon {} (PID {})", verb, pid),
    }
    Ok(())
}

fn confirm_escalation(err: &SupervisorError, yes: bool) -> bool {
    eprintln!("{}", err);
    if yes {
        eprintln!("Force killing (--yes)");
        return true;
    }
    if !std::io::stdin().is_terminal() {
        eprintln!("Not a terminal, leaving the daemon running. Use --yes to force.");
        return false;
    }
    dialoguer::Confirm::new()
        .with_prompt("Force kill and continue restart?")
        .default(false)
        .interact()
        .unwrap_or(false)
}

/// Format a duration in seconds to human-readable string
fn format_duration(secs: i64) -> String {
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs < 86400 {
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        format!("{}h {}m", hours, mins)
    } else {
        let days = secs / 86400;
        let hours = (secs % 86400) / 3600;
        format!("{}d {}h", days, hours)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(5), "5s");
        assert_eq!(format_duration(125), "2m 5s");
        assert_eq!(format_duration(7260), "2h 1m");
        assert_eq!(format_duration(90000), "1d 1h");
    }

    #[test]
    fn test_escalation_auto_accepted_with_yes() {
        let err = SupervisorError::StopTimeout {
            pid: 1,
            timeout: std::time::Duration::from_secs(1),
        };
        assert!(confirm_escalation(&err, true));
    }

    #[test]
    fn test_stop_and_status_when_empty() {
        let temp_dir = TempDir::new().unwrap();
        let sup = supervisor(temp_dir.path(), &Config::default()).unwrap();
        assert!(run_stop(&sup, false).is_ok());
        assert!(run_kill(&sup, true).is_ok());
        assert!(run_status(&sup, false).is_ok());
    }

    #[test]
    fn test_status_fails_on_identity_mismatch() {
        let temp_dir = TempDir::new().unwrap();
        let sup = supervisor(temp_dir.path(), &Config::default())
            .unwrap()
            .with_identity(Box::new(warden::supervisor::UnsupportedIdentity));
        std::fs::write(sup.pid_file(), std::process::id().to_string()).unwrap();
        assert!(run_status(&sup, true).is_err());
    }
}
