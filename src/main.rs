//! Process entry point for the download manager.
//!
//! Constructs the [`Scheduler`], reloads any persisted state, drains the
//! reloaded queue up to the concurrency cap, then blocks until `SIGINT` or
//! `SIGTERM` before running the shutdown sequence (cancel in-flight
//! attempts, wait for them to drain, flush a final save). There is no
//! network listener in this crate: the HTTP/SSE transport that submits
//! URLs and streams output to clients is a separate process concern that
//! embeds this scheduler.

use std::process::ExitCode;

use clap::Parser;
use manager_core::{Config, Scheduler};
use tracing::{debug, info};

mod cli;

use cli::Args;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!(?args, "CLI arguments parsed");

    let config = Config::new(args.max_concurrent, args.max_retries, args.download_dir.clone(), args.data_dir_path());

    info!(
        download_dir = %config.download_dir.display(),
        data_dir = ?config.data_dir,
        max_concurrent = config.max_concurrent,
        max_retries = config.max_retries,
        "download manager starting"
    );

    if let Err(e) = tokio::fs::create_dir_all(&config.download_dir).await {
        tracing::error!(download_dir = %config.download_dir.display(), error = %e, "failed to create download directory");
        return ExitCode::FAILURE;
    }
    if let Some(data_dir) = &config.data_dir {
        if let Err(e) = tokio::fs::create_dir_all(data_dir).await {
            tracing::error!(data_dir = %data_dir.display(), error = %e, "failed to create data directory");
            return ExitCode::FAILURE;
        }
    }

    let scheduler = Scheduler::new(config);
    scheduler.load().await;
    scheduler.drain_queue().await;

    info!("ready, awaiting shutdown signal");
    wait_for_shutdown_signal().await;

    info!("shutdown signal received, draining in-flight attempts");
    scheduler.shutdown().await;
    info!("shutdown complete");

    ExitCode::SUCCESS
}

/// Resolves once either `SIGINT` or `SIGTERM` arrives (Unix), or once
/// `Ctrl+C` arrives on platforms without Unix signal support.
#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "failed to install SIGTERM handler, falling back to ctrl_c only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
