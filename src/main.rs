//! hostproxy
//!
//! Host-based TCP reverse proxy.
//!
//! This binary:
//! - Loads env-driven configuration and a JSON route document
//! - Builds the hostname routing table (duplicates abort startup)
//! - Accepts TCP connections and routes them by SNI or Host header
//! - Relays bytes to the matched backend
//! - Drains in-flight sessions on ctrl-c before exiting

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use hostproxy::config::Config;
use hostproxy::proxy::{ListenerConfig, RoutingTable, SharedRoutingTable};
use hostproxy::server::Server;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to HOSTPROXY_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting hostproxy");

    let routes = config.load_routes()?;
    let table = RoutingTable::build(routes).context("Invalid route configuration")?;

    info!(
        listen_addr = %config.listen_addr,
        route_count = table.len(),
        max_connections = config.max_connections,
        "Configuration loaded"
    );

    let table = Arc::new(SharedRoutingTable::new(table));

    let mut listener_config = ListenerConfig::new(config.listen_addr);
    listener_config.max_connections = config.max_connections;
    listener_config.connect_timeout = config.connect_timeout;

    let server =
        Server::new(listener_config, table).with_drain_timeout(config.drain_timeout);

    let listen_addr = server.start().await.context("Failed to start server")?;
    info!(listen_addr = %listen_addr, "hostproxy running");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutdown signal received; draining");
    let active = server.status().await.active_sessions;
    if active > 0 {
        info!(active_sessions = active, "Waiting for in-flight sessions");
    }
    server.stop().await;

    Ok(())
}
