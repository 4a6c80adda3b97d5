//! TCP listener and per-connection handling.
//!
//! The listener accepts inbound connections, sniffs the target hostname,
//! consults the routing table, and hands matched connections to the
//! forwarder. Each connection runs in its own task; per-connection failures
//! never stop the accept loop.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn, Instrument};

use super::forwarder::{Forwarder, RelayError, DEFAULT_CONNECT_TIMEOUT};
use super::hostname::{SniffConfig, SniffResult, Sniffer};
use super::router::SharedRoutingTable;

/// Default maximum concurrent connections per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Shutdown control broadcast from the server to the accept loop and every
/// in-flight session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerControl {
    /// Accept and serve connections.
    Accept,
    /// Stop accepting; in-flight sessions run to completion.
    Drain,
    /// Cancel in-flight sessions; their connection handles are closed.
    Cancel,
}

/// Configuration for a proxy listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Hostname sniffing bounds.
    pub sniff: SniffConfig,
    /// Backend connect timeout.
    pub connect_timeout: Duration,
}

impl ListenerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            sniff: SniffConfig::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Counters for a listener, shared with the server for drain accounting.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently being served.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections rejected at the admission cap.
    pub connections_rejected: AtomicU64,
    /// Hostname extraction successes.
    pub hostname_found: AtomicU64,
    /// Hostname extraction failures (malformed, timeout, no hostname).
    pub hostname_failed: AtomicU64,
    /// Lookups that matched a route.
    pub routes_matched: AtomicU64,
    /// Lookups with no matching route.
    pub no_route: AtomicU64,
    /// Successful backend relays.
    pub backend_connected: AtomicU64,
    /// Backend connect failures.
    pub backend_failed: AtomicU64,
    /// Bytes relayed client -> backend.
    pub bytes_to_backend: AtomicU64,
    /// Bytes relayed backend -> client.
    pub bytes_from_backend: AtomicU64,
}

impl ListenerStats {
    /// Number of sessions currently in flight.
    pub fn active_sessions(&self) -> u64 {
        self.connections_active.load(Ordering::Relaxed)
    }
}

/// A bound TCP listener routing connections by hostname.
///
/// The listening socket is owned here, not by the state sessions share, so
/// it closes as soon as the accept loop returns even while sessions are
/// still in flight.
pub struct ProxyListener {
    listener: TcpListener,
    local_addr: SocketAddr,
    shared: Arc<ListenerShared>,
}

/// State shared between the accept loop and every session task.
struct ListenerShared {
    config: ListenerConfig,
    table: Arc<SharedRoutingTable>,
    forwarder: Forwarder,
    sniffer: Sniffer,
    conn_semaphore: Arc<Semaphore>,
    stats: Arc<ListenerStats>,
}

impl ProxyListener {
    /// Bind the listener. Fails if the address is unavailable.
    pub async fn bind(config: ListenerConfig, table: Arc<SharedRoutingTable>) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            max_connections = config.max_connections,
            "Listener bound"
        );

        Ok(Self {
            listener,
            local_addr,
            shared: Arc::new(ListenerShared {
                conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
                sniffer: Sniffer::with_config(config.sniff.clone()),
                forwarder: Forwarder::with_timeout(config.connect_timeout),
                config,
                table,
                stats: Arc::new(ListenerStats::default()),
            }),
        })
    }

    /// The local address this listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shared statistics handle.
    pub fn stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.shared.stats)
    }

    /// Run the accept loop until the control channel leaves `Accept`.
    ///
    /// Consumes the listener: returning drops the listening socket, so
    /// backlogged and new connects are reset the moment draining starts.
    /// In-flight sessions keep running in their own tasks and watch the
    /// control channel for `Cancel`.
    pub async fn run(self, mut control: watch::Receiver<ListenerControl>) {
        info!(bind_addr = %self.local_addr, "Listener accepting");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            self.shared.admit(stream, peer_addr, control.clone());
                        }
                        Err(e) => {
                            error!(error = %e, "Accept error");
                            // Avoid a tight loop on persistent accept errors.
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
                changed = control.changed() => {
                    if changed.is_err() || *control.borrow() != ListenerControl::Accept {
                        break;
                    }
                }
            }
        }

        info!(bind_addr = %self.local_addr, "Listener stopped accepting");
    }

    /// The configured admission cap.
    pub fn max_connections(&self) -> usize {
        self.shared.config.max_connections
    }
}

impl ListenerShared {
    /// Admit a connection under the concurrency cap and spawn its session.
    fn admit(
        self: &Arc<Self>,
        stream: TcpStream,
        peer_addr: SocketAddr,
        mut control: watch::Receiver<ListenerControl>,
    ) {
        let permit = match self.conn_semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.stats
                    .connections_rejected
                    .fetch_add(1, Ordering::Relaxed);
                warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                return;
            }
        };

        self.stats
            .connections_accepted
            .fetch_add(1, Ordering::Relaxed);
        self.stats
            .connections_active
            .fetch_add(1, Ordering::Relaxed);

        let shared = Arc::clone(self);
        let stats = Arc::clone(&self.stats);

        tokio::spawn(
            async move {
                tokio::select! {
                    result = shared.handle_connection(stream, peer_addr) => {
                        if let Err(e) = result {
                            debug!(peer_addr = %peer_addr, error = %e, "Connection error");
                        }
                    }
                    _ = wait_for_cancel(&mut control) => {
                        // Dropping the session future drops both connection
                        // handles, unblocking any pending read or write.
                        debug!(peer_addr = %peer_addr, "Session cancelled");
                    }
                }

                stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                drop(permit);
            }
            .instrument(tracing::info_span!("session", peer = %peer_addr)),
        );
    }

    /// Serve one connection: sniff, route, relay.
    async fn handle_connection(
        &self,
        mut client: TcpStream,
        peer_addr: SocketAddr,
    ) -> io::Result<()> {
        let started_at = Instant::now();

        let mut sniff_buffer = Vec::new();
        let hostname = match self.sniffer.sniff(&mut client, &mut sniff_buffer).await {
            SniffResult::Found(hostname) => {
                self.stats.hostname_found.fetch_add(1, Ordering::Relaxed);
                debug!(hostname = %hostname, "Hostname extracted");
                hostname
            }
            result => {
                self.stats.hostname_failed.fetch_add(1, Ordering::Relaxed);
                debug!(peer_addr = %peer_addr, result = ?result, "Hostname extraction failed");
                return Ok(());
            }
        };

        let backend_addr = match self.table.load().lookup(&hostname) {
            Some(addr) => {
                self.stats.routes_matched.fetch_add(1, Ordering::Relaxed);
                addr
            }
            None => {
                self.stats.no_route.fetch_add(1, Ordering::Relaxed);
                debug!(hostname = %hostname, "No route for hostname");
                return Ok(());
            }
        };

        match self
            .forwarder
            .relay(&mut client, backend_addr, &sniff_buffer)
            .await
        {
            Ok(relay_stats) => {
                self.stats.backend_connected.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .bytes_to_backend
                    .fetch_add(relay_stats.bytes_to_backend, Ordering::Relaxed);
                self.stats
                    .bytes_from_backend
                    .fetch_add(relay_stats.bytes_from_backend, Ordering::Relaxed);

                debug!(
                    hostname = %hostname,
                    backend_addr = %backend_addr,
                    bytes_to_backend = relay_stats.bytes_to_backend,
                    bytes_from_backend = relay_stats.bytes_from_backend,
                    elapsed_ms = started_at.elapsed().as_millis() as u64,
                    "Session finished"
                );
            }
            Err(e @ RelayError::BackendUnreachable { .. }) => {
                self.stats.backend_failed.fetch_add(1, Ordering::Relaxed);
                warn!(hostname = %hostname, error = %e, "Backend unreachable");
            }
            Err(e) => {
                self.stats.backend_failed.fetch_add(1, Ordering::Relaxed);
                debug!(hostname = %hostname, error = %e, "Relay setup failed");
            }
        }

        Ok(())
    }
}

/// Resolve once the control channel reads `Cancel`.
async fn wait_for_cancel(control: &mut watch::Receiver<ListenerControl>) {
    loop {
        if *control.borrow() == ListenerControl::Cancel {
            return;
        }
        if control.changed().await.is_err() {
            // Sender gone; sessions finish naturally.
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::router::{Route, RoutingTable};

    #[test]
    fn test_listener_config_defaults() {
        let config = ListenerConfig::new("127.0.0.1:0".parse().unwrap());
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
    }

    #[tokio::test]
    async fn test_bind_reports_local_addr() {
        let table = Arc::new(SharedRoutingTable::new(
            RoutingTable::build(vec![Route::new(
                "a.test",
                "127.0.0.1:1".parse().unwrap(),
            )])
            .unwrap(),
        ));

        let config = ListenerConfig::new("127.0.0.1:0".parse().unwrap());
        let listener = ProxyListener::bind(config, table).await.unwrap();

        let addr = listener.local_addr();
        assert_ne!(addr.port(), 0);
        assert_eq!(listener.stats().active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_drain_closes_socket_while_session_in_flight() {
        let table = Arc::new(SharedRoutingTable::default());
        let mut config = ListenerConfig::new("127.0.0.1:0".parse().unwrap());
        // Long sniff window so a silent client holds its session open.
        config.sniff.timeout = Duration::from_secs(5);

        let listener = ProxyListener::bind(config, table).await.unwrap();
        let addr = listener.local_addr();
        let stats = listener.stats();

        let (control, control_rx) = watch::channel(ListenerControl::Accept);
        let accept_task = tokio::spawn(listener.run(control_rx));

        let idle = TcpStream::connect(addr).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while stats.active_sessions() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        control.send(ListenerControl::Drain).unwrap();
        accept_task.await.unwrap();

        // The in-flight session still holds listener state, but the
        // listening socket must be gone: new connects are reset.
        assert_eq!(stats.active_sessions(), 1);
        assert!(TcpStream::connect(addr).await.is_err());

        drop(idle);
        let _ = control.send(ListenerControl::Cancel);
    }

    #[tokio::test]
    async fn test_bind_address_in_use_fails() {
        let table = Arc::new(SharedRoutingTable::default());
        let first = ProxyListener::bind(
            ListenerConfig::new("127.0.0.1:0".parse().unwrap()),
            Arc::clone(&table),
        )
        .await
        .unwrap();

        let taken = first.local_addr();
        let second = ProxyListener::bind(ListenerConfig::new(taken), table).await;
        assert!(second.is_err());
    }
}
