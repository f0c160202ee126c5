pub mod config;
pub mod server;
pub mod supervisor;

#[cfg(any(test, feature = "test-support"))]
pub mod test_helpers;

pub use config::{Config, ConfigError, DaemonConfig, ServerConfig};
pub use supervisor::{
    BinaryIdentity, CancelToken, DaemonStatus, Health, HealthProbe, RestartOutcome,
    StartOutcome, StopOutcome, Supervisor, SupervisorConfig, SupervisorError, notify_ready,
};
