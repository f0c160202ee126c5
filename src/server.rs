//! The HTTP server the daemon runs.
//!
//! Two routes: `/` and `/health`. Readiness is reported to the supervisor
//! only after the listener is bound, so a port conflict fails `start`
//! instead of producing a worker that is "ready" but serving nothing.

use anyhow::{Context, Result};
use axum::Router;
use axum::http::StatusCode;
use axum::routing::get;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::supervisor;

pub fn router() -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
}

async fn root() -> &'static str {
    "Hello World"
}

async fn health() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

/// Bind, report readiness, serve until SIGTERM or Ctrl-C.
pub async fn run(config: &ServerConfig) -> Result<()> {
    // Install handlers before reporting readiness so an early stop is graceful
    let shutdown = shutdown_signal()?;

    let addr = config.socket_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let local = listener.local_addr()?;
    info!(%local, "listening");

    match supervisor::notify_ready() {
        Ok(true) => info!("readiness reported to supervisor"),
        Ok(false) => {}
        Err(e) => warn!(error = %e, "failed to report readiness"),
    }

    axum::serve(listener, router())
        .with_graceful_shutdown(shutdown)
        .await
        .context("Server error")?;

    info!("server stopped");
    Ok(())
}

/// Run the server on a fresh multi-threaded runtime
pub fn run_blocking(config: &ServerConfig) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;
    runtime.block_on(run(config))
}

#[cfg(unix)]
fn shutdown_signal() -> Result<impl std::future::Future<Output = ()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    Ok(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received Ctrl-C, shutting down"),
            _ = terminate.recv() => info!("received SIGTERM, shutting down"),
        }
    })
}

#[cfg(not(unix))]
fn shutdown_signal() -> Result<impl std::future::Future<Output = ()>> {
    Ok(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received Ctrl-C, shutting down");
        }
    })
}
