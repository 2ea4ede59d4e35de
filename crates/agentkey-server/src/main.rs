//! Agent Key server entry point.
//!
//! Loads configuration, hardens the process, opens the broker, and serves
//! the HTTP API with graceful shutdown. The expiry sweep runs alongside the
//! server and is stopped on shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use agentkey_server::config::ServerConfig;
use agentkey_server::hardening;
use agentkey_server::routes;
use agentkey_server::state::AppState;
use agentkey_server::sweep;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();

    // Runs before the master key is read and before logging exists.
    apply_hardening(&config);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();

    info!(storage = ?config.storage_backend, "Agent Key starting");

    let state = AppState::open(&config).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sweep_handle = if config.sweep_interval_secs == 0 {
        info!("expiry sweep disabled; checkouts expire on read");
        None
    } else {
        Some(tokio::spawn(sweep::run(
            state.broker.clone(),
            Duration::from_secs(config.sweep_interval_secs),
            shutdown_rx,
        )))
    };

    let app = routes::router(Arc::clone(&state));

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.bind_addr))?;

    info!(addr = %config.bind_addr, "Agent Key listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .context("server error")?;

    if let Some(handle) = sweep_handle {
        info!("waiting for expiry sweep to stop");
        let _ = tokio::time::timeout(Duration::from_secs(10), handle).await;
    }

    info!("Agent Key stopped");
    Ok(())
}

/// Wait for SIGINT or SIGTERM, then broadcast shutdown.
async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            sig.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received, stopping server");
    let _ = shutdown_tx.send(true);
}

/// Disable core dumps and lock memory. Logging is not up yet, so warnings
/// go to stderr.
#[allow(clippy::print_stderr)]
fn apply_hardening(config: &ServerConfig) {
    if let Err(e) = hardening::disable_core_dumps() {
        eprintln!("WARNING: failed to disable core dumps: {e}");
    }

    if config.disable_mlock {
        eprintln!("WARNING: mlock disabled via AGENTKEY_DISABLE_MLOCK; credentials may be swapped to disk");
    } else if let Err(e) = hardening::lock_memory() {
        eprintln!("WARNING: failed to lock memory: {e} (set AGENTKEY_DISABLE_MLOCK=true for dev)");
    }
}
