//! Proxy configuration (env-driven).
//!
//! The outer layer parses environment variables and the JSON route document;
//! the proxy core only ever sees the validated routing table and scalar
//! timeouts.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::proxy::{Route, DEFAULT_MAX_CONNECTIONS};

/// One entry in the route document.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteEntry {
    /// Hostname to match (normalized before table build).
    pub hostname: String,
    /// Backend address, `host:port`.
    pub backend: SocketAddr,
}

/// Proxy configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the proxy listens on.
    pub listen_addr: SocketAddr,

    /// Inline JSON route document (HOSTPROXY_ROUTES).
    pub routes_inline: Option<String>,

    /// Path to a JSON route document file (HOSTPROXY_ROUTES_FILE).
    pub routes_file: Option<PathBuf>,

    /// Maximum concurrent connections.
    pub max_connections: usize,

    /// Backend connect timeout.
    pub connect_timeout: Duration,

    /// Grace period for draining sessions on shutdown.
    pub drain_timeout: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let listen_addr: SocketAddr = std::env::var("HOSTPROXY_LISTEN_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()
            .context("HOSTPROXY_LISTEN_ADDR must be a host:port address.")?;

        let routes_inline = std::env::var("HOSTPROXY_ROUTES").ok();
        let routes_file = std::env::var("HOSTPROXY_ROUTES_FILE")
            .ok()
            .map(PathBuf::from);

        if routes_inline.is_none() && routes_file.is_none() {
            anyhow::bail!(
                "Missing routes. Set HOSTPROXY_ROUTES (inline JSON) or HOSTPROXY_ROUTES_FILE."
            );
        }

        let max_connections: usize = std::env::var("HOSTPROXY_MAX_CONNECTIONS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("HOSTPROXY_MAX_CONNECTIONS must be an integer.")?
            .unwrap_or(DEFAULT_MAX_CONNECTIONS)
            .max(1);

        let connect_timeout_ms: u64 = std::env::var("HOSTPROXY_CONNECT_TIMEOUT_MS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("HOSTPROXY_CONNECT_TIMEOUT_MS must be an integer (milliseconds).")?
            .unwrap_or(5000);

        let drain_timeout_ms: u64 = std::env::var("HOSTPROXY_DRAIN_TIMEOUT_MS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("HOSTPROXY_DRAIN_TIMEOUT_MS must be an integer (milliseconds).")?
            .unwrap_or(10_000);

        let log_level = std::env::var("HOSTPROXY_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            listen_addr,
            routes_inline,
            routes_file,
            max_connections,
            connect_timeout: Duration::from_millis(connect_timeout_ms.max(1)),
            drain_timeout: Duration::from_millis(drain_timeout_ms),
            log_level,
        })
    }

    /// Load and parse the route document into routes.
    ///
    /// Inline routes take precedence over the file when both are set.
    pub fn load_routes(&self) -> Result<Vec<Route>> {
        let document = if let Some(inline) = &self.routes_inline {
            inline.clone()
        } else if let Some(path) = &self.routes_file {
            std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read route file {}", path.display()))?
        } else {
            anyhow::bail!("No route source configured.");
        };

        let entries: Vec<RouteEntry> =
            serde_json::from_str(&document).context("Route document must be a JSON array.")?;

        Ok(entries
            .iter()
            .map(|e| Route::new(&e.hostname, e.backend))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_document_parses() {
        let config = Config {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            routes_inline: Some(
                r#"[
                    {"hostname": "App.Example.Test", "backend": "127.0.0.1:4000"},
                    {"hostname": "b.example.test", "backend": "127.0.0.1:4001"}
                ]"#
                .to_string(),
            ),
            routes_file: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connect_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(10),
            log_level: "info".to_string(),
        };

        let routes = config.load_routes().unwrap();
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].hostname, "app.example.test");
        assert_eq!(routes[0].backend_addr, "127.0.0.1:4000".parse().unwrap());
    }

    #[test]
    fn test_invalid_route_document_rejected() {
        let config = Config {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            routes_inline: Some(r#"{"hostname": "not-an-array"}"#.to_string()),
            routes_file: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connect_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(10),
            log_level: "info".to_string(),
        };

        assert!(config.load_routes().is_err());
    }
}
