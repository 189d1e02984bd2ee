//! Mirage - Interactive SSH Deception Server
//!
//! This is the main entry point for the Mirage application.

use anyhow::Result;
use clap::Parser;
use mirage::config::load_config;
use mirage::Server;
use std::path::PathBuf;
use tokio::sync::broadcast;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// Mirage - SSH deception server with a fabricated shell and filesystem
#[derive(Parser, Debug)]
#[command(name = "mirage")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging format
    #[arg(long)]
    json_log: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logging
    setup_logging(&args.log_level, args.json_log)?;

    // Load configuration
    let config = load_config(&args.config)?;

    info!("Mirage v{}", mirage::VERSION);
    info!("Configuration loaded from: {:?}", args.config);
    info!("Listening on: {}", config.server.bind_addr());
    info!("Accounts configured: {}", config.users.len());

    let server = Server::new(&config)?;

    // Setup shutdown signal
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    // Handle Ctrl+C and termination signals (cross-platform)
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx_clone.send(true);
    });

    server.listen_and_serve(shutdown_rx).await
}

/// Resolve on Ctrl+C, or SIGTERM on Unix
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Received Ctrl+C, shutting down...");
                    }
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM, shutting down...");
                    }
                }
                return;
            }
            Err(e) => {
                error!(error = %e, "Failed to setup SIGTERM handler, only Ctrl+C is handled");
            }
        }
    }

    let _ = tokio::signal::ctrl_c().await;
    info!("Received Ctrl+C, shutting down...");
}

/// Setup logging based on configuration
fn setup_logging(level: &str, json: bool) -> Result<()> {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    if json {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    Ok(())
}
