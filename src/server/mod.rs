//! sevo-server: HTTP and WebSocket front end for the lifecycle engine.
//!
//! Accepts voice message uploads, serves the stored audio, pushes live
//! events to joined connections and runs the expiry sweeper in the
//! background.

pub mod config;
pub mod handlers;
pub mod router;
pub mod state;
pub mod utils;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::oneshot;

use crate::clock::SystemClock;
use crate::push::HttpPushSender;

use config::{Cli, Config};
use state::AppState;

/// Entry point: parse CLI, open storage, serve until Ctrl-C.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_cli_and_env(cli);

    crate::logging::init();

    tracing::info!("sevo-server starting");
    tracing::info!("  data directory: {}", config.data_dir.display());
    tracing::info!("  database: {}", config.db_path().display());
    tracing::info!("  public url: {}", config.public_url);
    tracing::info!(
        "  sweep every {}s, cleanup timeout {}s",
        config.sweep_interval.as_secs(),
        config.cleanup_timeout.as_secs()
    );

    let state = AppState::open(
        &config,
        Arc::new(SystemClock),
        Arc::new(HttpPushSender::new()),
    )?;

    let (sweep_tx, sweep_rx) = oneshot::channel();
    let sweeper = Arc::clone(&state.sweeper).spawn(sweep_rx);

    let app = router::build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!("sevo-server listening on http://{}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    let _ = sweep_tx.send(());
    if let Some(handle) = sweeper {
        let _ = handle.await;
    }
    tracing::info!("sevo-server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
