//! Multi-Room WebSocket Chat Server - Entry Point
//!
//! Connects to the store, starts the Hub actor, and accepts WebSocket
//! connections. The store is a hard dependency: if the startup ping
//! fails, the process exits.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use roomcast::{handle_connection, Hub, RedisStore, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging with environment filter
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=roomcast=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("roomcast=info")),
        )
        .init();

    let config = Arc::new(ServerConfig::from_env()?);

    // The store must be reachable before anything is accepted.
    let store = Arc::new(RedisStore::connect(&config.redis_url).await?);

    // Create the hub event channel and start the actor
    let (events_tx, events_rx) = mpsc::channel(config.hub_queue);
    let hub = Hub::new(events_rx, events_tx.clone(), store);
    tokio::spawn(hub.run());
    info!("Hub actor started");

    let listener = TcpListener::bind(config.bind_addr()).await?;
    info!("WebSocket chat server listening on {}", config.bind_addr());

    // Connection accept loop
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("New connection from {}", addr);
                let events_tx = events_tx.clone();
                let config = config.clone();

                // Spawn handler task for each connection
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, events_tx, config).await {
                        error!("Connection handler error: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}
