//! noRSI - activity monitor daemon
//!
//! Tracks how long the user has been active inside a set of tracking
//! windows, resets them on sufficient breaks, and reports the state to
//! local clients over a Unix domain socket.

mod config;
mod daemon;
mod idle;
mod query;
mod tracker;

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::config::{Config, LoggingConfig};
use crate::daemon::{Daemon, UserActivity};
use crate::idle::{IdleEvent, IdleMonitor};
use crate::query::QueryServer;

/// Application version.
const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> Result<()> {
    // Parse command line arguments
    let config_path = std::env::args().nth(1).map(PathBuf::from);

    let config = Config::load(config_path.as_deref())?;
    config.validate()?;

    init_tracing(&config.logging)?;

    info!("Starting norsi v{}", VERSION);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    runtime.block_on(run(config))?;

    info!("norsi shutdown complete");
    Ok(())
}

async fn run(config: Config) -> Result<()> {
    info!(
        "Configuration loaded: idle threshold={}s, tick={}ms, {} tracking windows",
        config.idle.threshold_seconds,
        config.service.tick_ms,
        config.windows.len()
    );

    let tracker = config.build_tracker()?;

    // Start idle detection
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<IdleEvent>();
    let probe = idle::platform_probe().context("Failed to open idle source")?;
    let mut monitor = IdleMonitor::new(config.idle.threshold(), config.idle.check_interval());
    monitor.start(probe, event_tx)?;

    let server = if config.service.enabled {
        match QueryServer::bind(&config.service) {
            Ok(server) => Some(server),
            Err(e) => {
                error!("Query service unavailable, continuing without it: {}", e);
                None
            }
        }
    } else {
        info!("Query service disabled by configuration");
        None
    };

    let mut activity = UserActivity::new(config.idle.threshold_seconds);
    if config.idle.assume_active_at_start {
        activity.on_resumed(Instant::now());
    }

    let mut daemon = Daemon::new(tracker, activity, server, config.service.tick());
    daemon.run(&mut event_rx, shutdown_signal()).await;

    info!("Shutting down...");
    monitor.stop();
    daemon.shutdown();

    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => Some(terminate),
        Err(e) => {
            error!("Failed to install SIGTERM handler: {}", e);
            None
        }
    };

    let terminated = async {
        match terminate.as_mut() {
            Some(terminate) => {
                terminate.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    };

    let interrupted = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = interrupted => info!("Interrupt received"),
        _ = terminated => info!("Terminate signal received"),
    }
}

/// Initialize tracing subscriber from the logging section.
fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);
    if logging.json {
        registry
            .with(fmt::layer().json().with_target(true))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .try_init()
    }
    .context("Failed to initialize tracing")?;

    Ok(())
}
