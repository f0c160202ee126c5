//! Configuration management commands

use anyhow::{Context, Result};
use std::net::IpAddr;
use std::path::Path;
use warden::config::Config;

/// Show current configuration
pub fn show(dir: &Path, json: bool) -> Result<()> {
    let config = Config::load(dir)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&config)?);
    } else {
        println!("Warden Configuration ({})", Config::path(dir).display());
        println!("========================");
        println!();
        println!("log_level = \"{}\"", config.log_level);
        println!();
        println!("[daemon]");
        println!("  pid_file = \"{}\"", config.pid_file(dir).display());
        println!("  ready_timeout_secs = {}", config.daemon.ready_timeout_secs);
        println!("  stop_timeout_secs = {}", config.daemon.stop_timeout_secs);
        println!("  run_args = {:?}", config.daemon.run_args);
        match config.health_check_url() {
            Some(url) => println!("  health_check = \"{}\"", url),
            None => println!("  health_check = off"),
        }
        println!("  kill_enabled = {}", config.daemon.kill_enabled);
        println!("  log_file = \"{}\"", config.log_file(dir).display());
        println!();
        println!("[server]");
        println!("  bind = \"{}\"", config.server.bind);
        println!("  port = {}", config.server.port);
    }

    Ok(())
}

/// Initialize default config file
pub fn init(dir: &Path) -> Result<()> {
    let path = Config::path(dir);
    if Config::init(dir)? {
        println!("Created default configuration at {}", path.display());
    } else {
        println!("Configuration already exists at {}", path.display());
    }
    Ok(())
}

/// Requested config changes; `None` leaves a value alone
#[derive(Debug, Default)]
pub struct Updates<'a> {
    pub port: Option<u16>,
    pub bind: Option<&'a str>,
    pub log_level: Option<&'a str>,
    pub ready_timeout: Option<u64>,
    pub stop_timeout: Option<u64>,
}

/// Update configuration values
pub fn update(dir: &Path, updates: &Updates) -> Result<()> {
    let mut config = Config::load(dir)?;
    let mut changed = false;

    if let Some(port) = updates.port {
        config.server.port = port;
        println!("Set server.port = {}", port);
        changed = true;
    }

    if let Some(bind) = updates.bind {
        let ip: IpAddr = bind
            .trim()
            .parse()
            .with_context(|| format!("Invalid bind address '{}', expected an IP address", bind))?;
        config.server.bind = ip.to_string();
        println!("Set server.bind = \"{}\"", ip);
        changed = true;
    }

    if let Some(level) = updates.log_level {
        tracing_subscriber::EnvFilter::try_new(level)
            .with_context(|| format!("Invalid log level '{}'", level))?;
        config.log_level = level.to_string();
        println!("Set log_level = \"{}\"", level);
        changed = true;
    }

    if let Some(secs) = updates.ready_timeout {
        anyhow::ensure!(secs > 0, "ready timeout must be at least 1 second");
        config.daemon.ready_timeout_secs = secs;
        println!("Set daemon.ready_timeout_secs = {}", secs);
        changed = true;
    }

    if let Some(secs) = updates.stop_timeout {
        anyhow::ensure!(secs > 0, "stop timeout must be at least 1 second");
        config.daemon.stop_timeout_secs = secs;
        println!("Set daemon.stop_timeout_secs = {}", secs);
        changed = true;
    }

    if changed {
        config.save(dir)?;
        println!("Configuration saved.");
    } else {
        println!("No changes specified. Use --show to view current config.");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_init_and_show() {
        let temp_dir = TempDir::new().unwrap();

        // Init should create config
        assert!(init(temp_dir.path()).is_ok());
        assert!(Config::path(temp_dir.path()).exists());

        // Show should work
        assert!(show(temp_dir.path(), false).is_ok());
        assert!(show(temp_dir.path(), true).is_ok());
    }

    #[test]
    fn test_update() {
        let temp_dir = TempDir::new().unwrap();
        init(temp_dir.path()).unwrap();

        let updates = Updates {
            port: Some(9090),
            bind: Some("0.0.0.0"),
            stop_timeout: Some(3),
            ..Default::default()
        };
        update(temp_dir.path(), &updates).unwrap();

        let config = Config::load(temp_dir.path()).unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.daemon.stop_timeout_secs, 3);
        assert_eq!(config.daemon.ready_timeout_secs, 10);
    }

    #[test]
    fn test_update_rejects_zero_timeout() {
        let temp_dir = TempDir::new().unwrap();
        let updates = Updates {
            ready_timeout: Some(0),
            ..Default::default()
        };
        assert!(update(temp_dir.path(), &updates).is_err());
        assert!(!Config::path(temp_dir.path()).exists());
    }

    #[test]
    fn test_update_bind_accepts_ipv6_and_rejects_hostnames() {
        let temp_dir = TempDir::new().unwrap();

        let updates = Updates {
            bind: Some("::"),
            ..Default::default()
        };
        update(temp_dir.path(), &updates).unwrap();
        let config = Config::load(temp_dir.path()).unwrap();
        assert_eq!(config.server.bind, "::");
        assert_eq!(
            config.health_check_url().as_deref(),
            Some("http://[::1]:8080/health")
        );

        let updates = Updates {
            bind: Some("not-an-ip"),
            port: Some(9999),
            ..Default::default()
        };
        assert!(update(temp_dir.path(), &updates).is_err());
        let config = Config::load(temp_dir.path()).unwrap();
        assert_eq!(config.server.bind, "::");
        assert_eq!(config.server.port, 8080);
    }
}
