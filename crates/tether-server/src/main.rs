//! # tether-server
//!
//! Local bridge between a linked messaging account and the caller's tools.
//!
//! This binary provides:
//! - the **synchronization bridge** (session, ingestion, media cache) over a
//!   local SQLite store
//! - a loopback-only **REST API** (axum) exposing sends, media downloads and
//!   read-only queries over the mirrored history

mod api;
mod config;
mod error;
mod transport;

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tether_bridge::Bridge;

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::transport::DetachedTransport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,tether_bridge=debug,tether_store=info,tether_server=debug")
        }))
        .init();

    info!("Starting Tether bridge v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load and check configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");
    config.validate()?;

    // -----------------------------------------------------------------------
    // 3. Open the store and start the link supervisor
    // -----------------------------------------------------------------------
    let bridge = Arc::new(Bridge::open(config.bridge.clone(), Arc::new(DetachedTransport)).await?);
    warn!("No protocol client attached: sends and media fetches will report the bridge unavailable");
    bridge.start();

    // -----------------------------------------------------------------------
    // 4. Run the HTTP API server until it fails or Ctrl+C arrives
    // -----------------------------------------------------------------------
    let state = AppState { bridge: bridge.clone() };
    let result = tokio::select! {
        result = api::serve(state, config.http_addr) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            Ok(())
        }
    };

    bridge.shutdown().await;

    if let Err(e) = &result {
        tracing::error!(error = %e, "HTTP server failed");
    }
    result
}
