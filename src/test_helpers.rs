use crate::supervisor::SupervisorConfig;
use std::path::Path;
use std::time::Duration;

/// Worker that reports ready, closes its pipe end, then idles.
/// The loop keeps `sh` itself as the recorded process.
pub const READY_WORKER: &str = "printf 1 >&3; exec 3>&-; while :; do sleep 1; done";

/// Worker that never reports ready but keeps its pipe end open
pub const SILENT_WORKER: &str = "while :; do sleep 1; done";

/// Worker that reports ready and then ignores SIGTERM
pub const STUBBORN_WORKER: &str =
    "trap '' TERM; printf 1 >&3; exec 3>&-; while :; do sleep 1; done";

/// Worker that ignores SIGTERM and never reports ready
pub const DEAF_SILENT_WORKER: &str = "trap '' TERM; while :; do sleep 1; done";

/// Worker that writes the wrong readiness byte
pub const GARBLED_WORKER: &str = "printf x >&3; exec 3>&-; while :; do sleep 1; done";

/// A supervisor config running `/bin/sh -c <script>` with short timeouts,
/// PID file under `dir`.
pub fn sh_worker_config(dir: &Path, script: &str) -> SupervisorConfig {
    let mut config = SupervisorConfig::new(
        dir.join("worker.pid"),
        vec!["-c".to_string(), script.to_string()],
    );
    config.program = Some("/bin/sh".into());
    config.ready_timeout = Duration::from_secs(2);
    config.stop_timeout = Duration::from_secs(2);
    config.log_file = Some(dir.join("worker.log"));
    config
}
