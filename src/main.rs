//! hopper server entry point.
//!
//! Parses CLI flags, initializes logging, restores the latest snapshot when
//! one exists, and serves the HTTP API. A background task periodically saves
//! broker state; SIGUSR1 triggers a final save followed by process exit.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use tokio::signal::unix::SignalKind;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use hopper::config::Config;
use hopper::mux::QueueStateMux;
use hopper::server::{self, AppState, SharedState};
use hopper::snapshot;

/// In-memory HTTP task broker.
#[derive(Parser)]
#[command(name = "hopper")]
#[command(about = "In-memory HTTP task broker with timeout-based redelivery")]
#[command(version)]
struct Cli {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0:8080")]
    addr: String,

    /// Prefix for URL paths; must begin and end with '/'.
    #[arg(long, default_value = "/")]
    path_prefix: String,

    /// Username for basic auth (auth disabled when username and password are
    /// both empty).
    #[arg(long, default_value = "")]
    auth_username: String,

    /// Password for basic auth.
    #[arg(long, default_value = "")]
    auth_password: String,

    /// If specified, path to periodically save state to.
    #[arg(long)]
    save_path: Option<std::path::PathBuf>,

    /// Seconds between periodic saves.
    #[arg(long, default_value_t = 300)]
    save_interval_secs: u64,

    /// Default timeout of individual tasks, in seconds.
    #[arg(long, default_value_t = 900)]
    timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --log-level.
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| cli.log_level.clone());
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_filter)))
        .init();

    let config = Config {
        addr: cli.addr,
        path_prefix: cli.path_prefix,
        auth_username: cli.auth_username,
        auth_password: cli.auth_password,
        save_path: cli.save_path,
        save_interval: Duration::from_secs(cli.save_interval_secs),
        timeout: Duration::from_secs(cli.timeout_secs),
    };
    config.validate()?;

    let queues = match &config.save_path {
        Some(path) if path.exists() => {
            tracing::info!(path = %path.display(), "loading state");
            let mux = snapshot::load_from_path(path, config.timeout)
                .with_context(|| format!("loading snapshot from {}", path.display()))?;
            tracing::info!(path = %path.display(), "loaded state");
            Arc::new(mux)
        }
        _ => Arc::new(QueueStateMux::new(config.timeout)),
    };

    let state = Arc::new(AppState::new(queues, config.clone()));
    spawn_save_loop(state.clone());

    let app = server::router(state);
    let listener = tokio::net::TcpListener::bind(&config.addr)
        .await
        .with_context(|| format!("binding {}", config.addr))?;
    tracing::info!(addr = %config.addr, prefix = %config.path_prefix, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

/// Periodically snapshots all queues to the configured save path.
///
/// Each round writes to a temp file and renames it into place. A SIGUSR1
/// round saves with the shutdown flag set (refusing all further operations)
/// and then exits the process. A failed save is fatal: continuing to serve
/// without durability would silently lose work.
fn spawn_save_loop(state: SharedState) {
    let Some(path) = state.config.save_path.clone() else {
        return;
    };
    let interval = state.config.save_interval;

    tokio::spawn(async move {
        let mut sigusr1 = match tokio::signal::unix::signal(SignalKind::user_defined1()) {
            Ok(signal) => signal,
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGUSR1 handler");
                std::process::exit(1);
            }
        };
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately; consume it so the loop waits
        // a full interval before the first save.
        ticker.tick().await;

        loop {
            let shutdown = tokio::select! {
                _ = ticker.tick() => false,
                _ = sigusr1.recv() => {
                    tracing::info!("caught SIGUSR1");
                    true
                }
            };

            tracing::info!(path = %path.display(), shutdown, "saving state");
            let started = Utc::now();
            let result = {
                let queues = state.queues.clone();
                let path = path.clone();
                tokio::task::spawn_blocking(move || snapshot::save_to_path(&queues, &path, shutdown))
                    .await
            };
            match result {
                Ok(Ok(())) => {
                    let finished = Utc::now();
                    let latency = (finished - started).to_std().unwrap_or_default();
                    state.record_save(finished, latency);
                    tracing::info!(
                        path = %path.display(),
                        latency_secs = latency.as_secs_f64(),
                        "saved state"
                    );
                }
                Ok(Err(err)) => {
                    tracing::error!(error = %err, "snapshot save failed");
                    std::process::exit(1);
                }
                Err(err) => {
                    tracing::error!(error = %err, "snapshot save task panicked");
                    std::process::exit(1);
                }
            }

            if shutdown {
                tracing::info!("exiting after shutdown save");
                std::process::exit(0);
            }
        }
    });
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };
    let terminate = async {
        tokio::signal::unix::signal(SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }
    tracing::info!("shutting down");
}
