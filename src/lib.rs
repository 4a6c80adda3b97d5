pub mod config;
pub mod proxy;
pub mod server;

pub use config::{Config, RouteEntry};
pub use proxy::{
    normalize_hostname, Forwarder, ListenerConfig, ListenerControl, ListenerStats, ProxyListener,
    RelayError, RelayStats, Route, RouteError, RoutingTable, SharedRoutingTable, SniffConfig,
    SniffResult, Sniffer,
};
pub use server::{Server, ServerError, ServerState, ServerStatus};
