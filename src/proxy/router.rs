//! Routing table: hostname to backend address.
//!
//! The table is built once from validated configuration and is immutable
//! afterwards. Lookups are exact hostname matches (no wildcards); hostnames
//! are normalized to lowercase with the trailing dot trimmed before matching.
//!
//! Reload replaces the whole table in a single atomic pointer swap. Sessions
//! that already resolved a backend keep using it; there is no in-place
//! mutation of routes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use thiserror::Error;
use tracing::info;

/// Errors raised while building a routing table.
#[derive(Debug, Error)]
pub enum RouteError {
    /// Two routes share a hostname. Configuration is rejected wholesale.
    #[error("duplicate hostname '{0}' in routing table")]
    DuplicateHostname(String),
}

/// A single hostname-to-backend mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Normalized hostname this route matches.
    pub hostname: String,
    /// Backend address connections are forwarded to.
    pub backend_addr: SocketAddr,
}

impl Route {
    /// Create a route, normalizing the hostname.
    pub fn new(hostname: &str, backend_addr: SocketAddr) -> Self {
        Self {
            hostname: normalize_hostname(hostname),
            backend_addr,
        }
    }
}

/// Normalize a hostname for matching.
///
/// - Convert to lowercase
/// - Trim trailing dot
pub fn normalize_hostname(hostname: &str) -> String {
    hostname.to_lowercase().trim_end_matches('.').to_string()
}

/// Immutable hostname routing table.
///
/// Thread-safe for concurrent reads because it never changes after
/// construction. Replacement happens through [`SharedRoutingTable`].
#[derive(Debug, Default)]
pub struct RoutingTable {
    by_hostname: HashMap<String, SocketAddr>,
}

impl RoutingTable {
    /// Build a table from an ordered sequence of routes.
    ///
    /// Fails with [`RouteError::DuplicateHostname`] if two routes share a
    /// hostname, regardless of order. Route hostnames are normalized before
    /// the uniqueness check, so `App.Example` and `app.example.` collide.
    pub fn build(routes: impl IntoIterator<Item = Route>) -> Result<Self, RouteError> {
        let mut by_hostname = HashMap::new();

        for route in routes {
            let hostname = normalize_hostname(&route.hostname);
            if by_hostname
                .insert(hostname.clone(), route.backend_addr)
                .is_some()
            {
                return Err(RouteError::DuplicateHostname(hostname));
            }
        }

        Ok(Self { by_hostname })
    }

    /// Look up the backend for a hostname. Exact match after normalization.
    pub fn lookup(&self, hostname: &str) -> Option<SocketAddr> {
        self.by_hostname
            .get(&normalize_hostname(hostname))
            .copied()
    }

    /// Number of routes in the table.
    pub fn len(&self) -> usize {
        self.by_hostname.len()
    }

    /// Check if the table has no routes.
    pub fn is_empty(&self) -> bool {
        self.by_hostname.is_empty()
    }

    /// All hostnames in the table, in arbitrary order.
    pub fn hostnames(&self) -> Vec<String> {
        self.by_hostname.keys().cloned().collect()
    }
}

/// Atomically swappable routing table reference.
///
/// Readers load a consistent snapshot without locking. A reload stores a new
/// table in one pointer swap; in-flight sessions finish against the snapshot
/// they loaded.
pub struct SharedRoutingTable {
    current: ArcSwap<RoutingTable>,
}

impl SharedRoutingTable {
    /// Wrap an initial table.
    pub fn new(table: RoutingTable) -> Self {
        Self {
            current: ArcSwap::from_pointee(table),
        }
    }

    /// Get the current table snapshot.
    pub fn load(&self) -> Arc<RoutingTable> {
        self.current.load_full()
    }

    /// Replace the table wholesale.
    pub fn replace(&self, table: RoutingTable) {
        let route_count = table.len();
        self.current.store(Arc::new(table));
        info!(route_count, "Routing table replaced");
    }
}

impl Default for SharedRoutingTable {
    fn default() -> Self {
        Self::new(RoutingTable::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn test_normalize_hostname() {
        assert_eq!(normalize_hostname("Example.COM"), "example.com");
        assert_eq!(normalize_hostname("example.com."), "example.com");
        assert_eq!(normalize_hostname("EXAMPLE.COM."), "example.com");
    }

    #[test]
    fn test_lookup_returns_build_time_backend() {
        let table = RoutingTable::build(vec![
            Route::new("a.example.test", addr(4000)),
            Route::new("b.example.test", addr(4001)),
        ])
        .unwrap();

        assert_eq!(table.lookup("a.example.test"), Some(addr(4000)));
        assert_eq!(table.lookup("b.example.test"), Some(addr(4001)));
        assert_eq!(table.lookup("c.example.test"), None);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let table = RoutingTable::build(vec![Route::new("App.Example.Test", addr(4000))]).unwrap();

        assert_eq!(table.lookup("app.example.test"), Some(addr(4000)));
        assert_eq!(table.lookup("APP.EXAMPLE.TEST"), Some(addr(4000)));
        assert_eq!(table.lookup("app.example.test."), Some(addr(4000)));
    }

    #[test]
    fn test_duplicate_hostname_rejected() {
        let result = RoutingTable::build(vec![
            Route::new("dup.example.test", addr(4000)),
            Route::new("dup.example.test", addr(4001)),
        ]);

        match result {
            Err(RouteError::DuplicateHostname(hostname)) => {
                assert_eq!(hostname, "dup.example.test");
            }
            Ok(_) => panic!("Expected DuplicateHostname"),
        }
    }

    #[test]
    fn test_duplicate_detected_after_normalization() {
        let result = RoutingTable::build(vec![
            Route::new("dup.example.test", addr(4000)),
            Route::new("DUP.Example.Test.", addr(4001)),
        ]);

        assert!(matches!(result, Err(RouteError::DuplicateHostname(_))));
    }

    #[test]
    fn test_shared_table_swap() {
        let shared = SharedRoutingTable::new(
            RoutingTable::build(vec![Route::new("old.example.test", addr(4000))]).unwrap(),
        );

        let before = shared.load();
        assert_eq!(before.lookup("old.example.test"), Some(addr(4000)));

        shared.replace(
            RoutingTable::build(vec![Route::new("new.example.test", addr(4001))]).unwrap(),
        );

        // Old snapshot is still valid for in-flight readers.
        assert_eq!(before.lookup("old.example.test"), Some(addr(4000)));

        let after = shared.load();
        assert_eq!(after.lookup("old.example.test"), None);
        assert_eq!(after.lookup("new.example.test"), Some(addr(4001)));
    }
}
