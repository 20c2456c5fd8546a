// Copyright (c) 2025 The guapow developers
// SPDX-License-Identifier: MIT

//! guapow optimizer daemon.
//!
//! Loads the immutable settings once, binds the loopback service and runs
//! until SIGINT/SIGTERM, at which point live sessions get a bounded grace
//! period to roll their machine-wide changes back.

use anyhow::{Context, Result};
use clap::Parser;
use guapow::server::OptimizerServer;
use guapow::session::SessionContext;
use guapow::settings::Settings;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;

#[derive(Parser)]
#[command(name = "guapow-opt")]
#[command(author, version, about = "guapow optimizer daemon", long_about = None)]
struct Args {
    /// Configuration directory (overrides GUAPOW_CONFIG and the default
    /// /etc/guapow or ~/.config/guapow lookup)
    #[arg(long, value_name = "DIR")]
    config: Option<std::path::PathBuf>,

    /// Port to bind on 127.0.0.1 (overrides opt.conf)
    #[arg(short, long)]
    port: Option<u16>,
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

fn setup_logging() {
    // GUAPOW_OPT_LOG=0 silences the daemon entirely; GUAPOW_OPT_LOG_LEVEL
    // picks the level (default info).
    if std::env::var("GUAPOW_OPT_LOG").is_ok_and(|v| v == "0") {
        return;
    }
    let level = std::env::var("GUAPOW_OPT_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let env_filter = tracing_subscriber::EnvFilter::try_new(&level)
        .unwrap_or_else(|_| "info".parse().expect("static filter parses"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging();

    if let Some(config_dir) = &args.config {
        // Settings and profile resolution both honor this variable.
        // SAFETY: single-threaded, before any concurrent env access.
        unsafe { std::env::set_var("GUAPOW_CONFIG", config_dir) };
    }

    let mut settings = Settings::load()
        .await
        .context("could not load daemon settings")?;
    if let Some(port) = args.port {
        settings.port = port;
    }

    let ctx = SessionContext::new(settings);
    let server = OptimizerServer::bind(ctx)
        .await
        .context("could not start the optimizer service")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let _ = tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                tracing::error!("Could not install SIGTERM handler: {e}");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("SIGINT received"),
            _ = sigterm.recv() => tracing::info!("SIGTERM received"),
        }
        let _ = shutdown_tx.send(true);
    });

    server
        .run(shutdown_rx)
        .await
        .context("optimizer service failed")?;
    tracing::info!("Shutdown complete");
    Ok(())
}
