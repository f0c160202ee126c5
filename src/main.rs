use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use warden::config::Config;

mod commands;

/// Environment variable consulted for the log filter when `--log` is absent
const LOG_ENV: &str = "WARDEN_LOG";

#[derive(Parser)]
#[command(name = "warden")]
#[command(about = "Warden - run and supervise a single background server")]
#[command(version)]
struct Cli {
    /// Path to the data directory (default: ~/.warden)
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    /// Output as JSON for machine consumption
    #[arg(long, global = true)]
    json: bool,

    /// Log filter, e.g. "debug" or "warden=trace" (overrides WARDEN_LOG and config)
    #[arg(long, global = true)]
    log: Option<String>,

    /// Answer yes to confirmation prompts
    #[arg(long, short = 'y', global = true)]
    yes: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the background daemon
    Daemon {
        #[command(subcommand)]
        command: DaemonCommands,
    },

    /// Run the server in the foreground
    Serve,

    /// View or modify configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,

        /// Create the default config file
        #[arg(long)]
        init: bool,

        /// Set server port
        #[arg(long)]
        port: Option<u16>,

        /// Set server bind address
        #[arg(long)]
        bind: Option<String>,

        /// Set default log level
        #[arg(long = "log-level")]
        log_level: Option<String>,

        /// Set readiness timeout in seconds
        #[arg(long = "ready-timeout")]
        ready_timeout: Option<u64>,

        /// Set graceful stop timeout in seconds
        #[arg(long = "stop-timeout")]
        stop_timeout: Option<u64>,
    },
}

#[derive(Subcommand)]
enum DaemonCommands {
    /// Start the daemon and wait until it reports ready
    Start,

    /// Show daemon status
    Status,

    /// Stop the daemon gracefully (SIGTERM)
    Stop,

    /// Stop then start the daemon
    Restart,

    /// Stop the daemon forcefully (SIGKILL)
    Kill,

    /// Run as the daemon worker (internal, started by `daemon start`)
    #[command(hide = true)]
    Run,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let data_dir = resolve_data_dir(cli.dir.as_deref())?;
    let config = Config::load(&data_dir);

    let default_level = config
        .as_ref()
        .map(|c| c.log_level.clone())
        .unwrap_or_else(|_| "warn".to_string());
    init_logging(cli.log.as_deref(), &default_level);

    match cli.command {
        Commands::Daemon { command } => {
            let config = config?;
            // The worker never supervises, so only build a supervisor on demand
            let supervisor = || commands::daemon::supervisor(&data_dir, &config);
            match command {
                DaemonCommands::Start => commands::daemon::run_start(&supervisor()?, cli.json),
                DaemonCommands::Status => commands::daemon::run_status(&supervisor()?, cli.json),
                DaemonCommands::Stop => commands::daemon::run_stop(&supervisor()?, cli.json),
                DaemonCommands::Restart => {
                    commands::daemon::run_restart(&supervisor()?, cli.yes, cli.json)
                }
                DaemonCommands::Kill => commands::daemon::run_kill(&supervisor()?, cli.json),
                DaemonCommands::Run => commands::daemon::run_worker(&config),
            }
        }
        Commands::Serve => commands::serve::run(&config?),
        Commands::Config {
            show,
            init,
            port,
            bind,
            log_level,
            ready_timeout,
            stop_timeout,
        } => {
            if init {
                commands::config_cmd::init(&data_dir)
            } else if show {
                commands::config_cmd::show(&data_dir, cli.json)
            } else {
                let updates = commands::config_cmd::Updates {
                    port,
                    bind: bind.as_deref(),
                    log_level: log_level.as_deref(),
                    ready_timeout,
                    stop_timeout,
                };
                commands::config_cmd::update(&data_dir, &updates)
            }
        }
    }
}

/// `--dir` (made absolute) or `~/.warden`
fn resolve_data_dir(dir: Option<&Path>) -> Result<PathBuf> {
    match dir {
        Some(d) if d.is_absolute() => Ok(d.to_path_buf()),
        Some(d) => Ok(std::env::current_dir()
            .context("Failed to get current directory")?
            .join(d)),
        None => dirs::home_dir()
            .map(|home| home.join(".warden"))
            .context("Could not determine home directory, use --dir"),
    }
}

/// Logs go to stderr. Filter precedence: `--log`, then `WARDEN_LOG`, then config.
fn init_logging(flag: Option<&str>, default_level: &str) {
    let filter = flag
        .and_then(|f| EnvFilter::try_new(f).ok())
        .or_else(|| EnvFilter::try_from_env(LOG_ENV).ok())
        .or_else(|| EnvFilter::try_new(default_level).ok())
        .unwrap_or_else(|| EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .init();
}
