//! Host-based TCP proxy core.
//!
//! This module provides:
//! - Hostname routing table with atomic wholesale reload
//! - Hostname sniffing (TLS SNI and HTTP Host) with buffer-and-replay
//! - Backend connection forwarding with bounded connect timeout
//! - TCP listener with per-connection tasks and admission cap
//!
//! ## Architecture
//!
//! ```text
//! Client -> ProxyListener -> Sniffer -> RoutingTable -> Forwarder -> Backend
//! ```
//!
//! Per-connection failures (no route, unreachable backend, malformed first
//! bytes) close that connection only; the listener keeps accepting.

mod forwarder;
mod hostname;
mod listener;
mod router;

pub use forwarder::{Forwarder, RelayError, RelayStats, DEFAULT_CONNECT_TIMEOUT};
pub use hostname::{
    SniffConfig, SniffResult, Sniffer, DEFAULT_MAX_SNIFF_BYTES, DEFAULT_SNIFF_TIMEOUT,
};
pub use listener::{
    ListenerConfig, ListenerControl, ListenerStats, ProxyListener, DEFAULT_MAX_CONNECTIONS,
};
pub use router::{
    normalize_hostname, Route, RouteError, RoutingTable, SharedRoutingTable,
};
