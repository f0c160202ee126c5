//! Configuration for warden
//!
//! Configuration is stored in `<data-dir>/config.toml` and controls the
//! supervised daemon and the HTTP server it runs. Every field has a default,
//! so a missing file or a partial file is fine.

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::supervisor::SupervisorConfig;

pub const CONFIG_FILE: &str = "config.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config {path:?}: {source}")]
    Toml {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid bind address {0:?}: expected an IP address such as 127.0.0.1 or ::")]
    InvalidBind(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Default log filter when neither `--log` nor `WARDEN_LOG` is set
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Supervisor settings
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// HTTP server run by the worker
    #[serde(default)]
    pub server: ServerConfig,
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            daemon: DaemonConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// PID file location (default: `<data-dir>/warden.pid`).
    /// Relative paths are resolved against the data directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid_file: Option<PathBuf>,

    /// Seconds to wait for the worker's readiness signal
    #[serde(default = "default_timeout_secs")]
    pub ready_timeout_secs: u64,

    /// Seconds to wait for a graceful stop before giving up
    #[serde(default = "default_timeout_secs")]
    pub stop_timeout_secs: u64,

    /// Arguments that put the binary in worker mode
    #[serde(default = "default_run_args")]
    pub run_args: Vec<String>,

    /// Check the server's `/health` route in `status`
    #[serde(default = "default_true")]
    pub health_check: bool,

    /// Explicit health URL, overriding the one derived from `[server]`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check_url: Option<String>,

    #[serde(default = "default_true")]
    pub kill_enabled: bool,

    /// Worker output, relative to the data directory unless absolute
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_run_args() -> Vec<String> {
    vec!["daemon".to_string(), "run".to_string()]
}

fn default_true() -> bool {
    true
}

fn default_log_file() -> PathBuf {
    PathBuf::from("logs").join("daemon.log")
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            pid_file: None,
            ready_timeout_secs: default_timeout_secs(),
            stop_timeout_secs: default_timeout_secs(),
            run_args: default_run_args(),
            health_check: true,
            health_check_url: None,
            kill_enabled: true,
            log_file: default_log_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

impl ServerConfig {
    /// Address the server listens on
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self
            .bind
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidBind(self.bind.clone()))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    /// Address a local client should connect to. A wildcard bind is reached
    /// through the loopback address of the same family.
    pub fn connect_addr(&self) -> Result<SocketAddr, ConfigError> {
        let mut addr = self.socket_addr()?;
        if addr.ip().is_unspecified() {
            let loopback: IpAddr = match addr.ip() {
                IpAddr::V4(_) => Ipv4Addr::LOCALHOST.into(),
                IpAddr::V6(_) => Ipv6Addr::LOCALHOST.into(),
            };
            addr.set_ip(loopback);
        }
        Ok(addr)
    }
}

impl Config {
    pub fn path(data_dir: &Path) -> PathBuf {
        data_dir.join(CONFIG_FILE)
    }

    /// Load configuration from `<data-dir>/config.toml`.
    /// Returns default config if the file doesn't exist.
    pub fn load(data_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = Self::path(data_dir);

        let content = match fs::read_to_string(&config_path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: config_path,
                    source,
                });
            }
        };

        toml::from_str(&content).map_err(|source| ConfigError::Toml {
            path: config_path,
            source,
        })
    }

    pub fn save(&self, data_dir: &Path) -> Result<(), ConfigError> {
        let config_path = Self::path(data_dir);
        let content = toml::to_string_pretty(self)?;

        fs::create_dir_all(data_dir).map_err(|source| ConfigError::Io {
            path: data_dir.to_path_buf(),
            source,
        })?;
        fs::write(&config_path, content).map_err(|source| ConfigError::Io {
            path: config_path,
            source,
        })
    }

    /// Write the default config file if it doesn't exist. Returns whether a file was created.
    pub fn init(data_dir: &Path) -> Result<bool, ConfigError> {
        if Self::path(data_dir).exists() {
            return Ok(false);
        }
        Self::default().save(data_dir)?;
        Ok(true)
    }

    pub fn pid_file(&self, data_dir: &Path) -> PathBuf {
        match &self.daemon.pid_file {
            Some(p) => data_dir.join(p),
            None => data_dir.join("warden.pid"),
        }
    }

    pub fn log_file(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(&self.daemon.log_file)
    }

    /// URL checked by `status`, if health checking is on.
    ///
    /// An unusable `bind` disables the derived URL rather than failing, so
    /// stop, kill and status keep working on a misconfigured server.
    pub fn health_check_url(&self) -> Option<String> {
        if !self.daemon.health_check {
            return None;
        }
        if let Some(url) = &self.daemon.health_check_url
            && !url.trim().is_empty()
        {
            return Some(url.clone());
        }
        match self.server.connect_addr() {
            Ok(addr) => Some(format!("http://{}/health", addr)),
            Err(e) => {
                tracing::warn!(error = %e, "health check disabled");
                None
            }
        }
    }

    /// Map the file onto supervisor settings. The worker is always told
    /// where its data directory is, so it reads the same config.
    pub fn supervisor_config(&self, data_dir: &Path) -> SupervisorConfig {
        let mut run_args = vec!["--dir".to_string(), data_dir.display().to_string()];
        run_args.extend(self.daemon.run_args.iter().cloned());

        let mut config = SupervisorConfig::new(self.pid_file(data_dir), run_args);
        config.ready_timeout = Duration::from_secs(self.daemon.ready_timeout_secs);
        config.stop_timeout = Duration::from_secs(self.daemon.stop_timeout_secs);
        config.health_check_url = self.health_check_url();
        config.kill_enabled = self.daemon.kill_enabled;
        config.log_file = Some(self.log_file(data_dir));
        config
    }
}
