//! chat-relay: a multi-user TCP chat server
//!
//! Clients connect over TCP and exchange newline-delimited UTF-8 lines:
//! - Plain lines are broadcast to everyone else in the room
//! - `/name <newname>` changes the display name
//! - `/list` shows who is online
//! - `/msg <user> <text>` sends a private message
//! - `/quit` leaves
//!
//! Configuration via CLI arguments or TOML file. Ctrl-C (or SIGTERM)
//! stops accepting, notifies every client, and closes their connections.

mod commands;
mod config;
mod connection;
mod protocol;
mod registry;
mod server;
mod session;

use config::Config;
use server::Server;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen_addr(),
        max_clients = config.max_clients,
        workers = ?config.workers,
        "Starting chat-relay server"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.build()?;

    let server = Server::new(config);
    runtime.block_on(server.run(shutdown_signal()))?;

    info!("Server stopped");
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Shutdown requested");
}
