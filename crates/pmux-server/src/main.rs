//! pmux-server: terminal pane multiplexer.
//!
//! Runs commands on pseudo-terminals and multiplexes their output to any
//! number of WebSocket clients, with replay when a client reconnects.

mod config;
mod peer;
mod server;
mod session;
mod state;
mod transport;

use clap::Parser;
use config::ServerConfig;
use server::PmuxServer;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// pmux-server: terminal pane multiplexer
#[derive(Parser, Debug)]
#[command(name = "pmux-server", version, about = "Terminal pane multiplexer")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Replay history per pane, in bytes
    #[arg(long)]
    buffer_size: Option<usize>,

    /// Config file path
    #[arg(long, default_value = "~/.pmux/config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting pmux-server");

    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(
        Some(&config_path),
        cli.listen.as_deref(),
        cli.port,
        cli.buffer_size,
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let server = Arc::new(PmuxServer::new(server_config));

    tokio::select! {
        result = server.clone().run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    server.shutdown().await;
    info!("pmux-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
