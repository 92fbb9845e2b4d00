//! Parley relay server: development chat server for the Parley client.
//!
//! An axum server that speaks the Parley WebSocket event protocol at `/ws`
//! and serves the directory and history HTTP API under `/chat`.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:9000
//! cargo run --bin parley-relay
//!
//! # Run on custom address
//! cargo run --bin parley-relay -- --bind 127.0.0.1:8080
//!
//! # Or via environment variable
//! PARLEY_RELAY_ADDR=127.0.0.1:8080 cargo run --bin parley-relay
//! ```

use std::sync::Arc;

use clap::Parser;
use parley_relay::config::{RelayCliArgs, RelayConfig};
use parley_relay::relay::{self, RelayState};
use parley_relay::store::OfflineQueue;

#[tokio::main]
async fn main() {
    let cli = RelayCliArgs::parse();

    let config = match RelayConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!(addr = %config.bind_addr, users = config.users.len(), "starting parley relay server");

    let queue = OfflineQueue::with_max_queue_size(config.max_queue_size);
    let state = Arc::new(RelayState::with_config(
        config.max_frame_size,
        queue,
        config.users,
    ));

    match relay::start_server_with_state(&config.bind_addr, state).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "relay server listening");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "relay server task failed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start relay server");
            std::process::exit(1);
        }
    }
}
