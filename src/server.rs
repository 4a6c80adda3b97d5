//! Server lifecycle: startup, graceful shutdown, status.
//!
//! State machine: `Stopped -> Starting -> Accepting -> Draining -> Stopped`.
//! `start` binds the listener and spawns the accept loop; `stop` closes the
//! accept loop immediately, waits up to the drain timeout for in-flight
//! sessions, then cancels whatever remains.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::proxy::{
    ListenerConfig, ListenerControl, ListenerStats, ProxyListener, SharedRoutingTable,
};

/// Default grace period for draining in-flight sessions.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll interval for drain accounting.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Lifecycle errors.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Could not bind the listen address. Fatal at startup.
    #[error("failed to bind {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// `start` called while the server is not stopped.
    #[error("server is already running")]
    AlreadyRunning,
}

/// Lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Accepting,
    Draining,
}

/// Snapshot of the server for observability wrappers.
#[derive(Debug, Clone, Copy)]
pub struct ServerStatus {
    pub state: ServerState,
    pub is_accepting: bool,
    pub active_sessions: u64,
}

struct Running {
    control: watch::Sender<ListenerControl>,
    stats: Arc<ListenerStats>,
    local_addr: SocketAddr,
    accept_task: Option<JoinHandle<()>>,
}

struct Inner {
    running: Option<Running>,
}

/// Owns one listener and its lifecycle.
///
/// The lifecycle state lives in a `watch` channel so concurrent callers can
/// await transitions; all transitions happen while holding the inner lock.
pub struct Server {
    listener_config: ListenerConfig,
    table: Arc<SharedRoutingTable>,
    drain_timeout: Duration,
    state: watch::Sender<ServerState>,
    inner: Mutex<Inner>,
}

impl Server {
    pub fn new(listener_config: ListenerConfig, table: Arc<SharedRoutingTable>) -> Self {
        Self {
            listener_config,
            table,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            state: watch::Sender::new(ServerState::Stopped),
            inner: Mutex::new(Inner { running: None }),
        }
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    /// Bind the listener and start accepting.
    ///
    /// Returns the bound address (useful with port 0). Fails with
    /// [`ServerError::AlreadyRunning`] if the server is not stopped and
    /// [`ServerError::BindFailed`] if the address is unavailable; a bind
    /// failure is fatal and leaves the server stopped.
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        let mut inner = self.inner.lock().await;

        if *self.state.borrow() != ServerState::Stopped {
            return Err(ServerError::AlreadyRunning);
        }
        self.state.send_replace(ServerState::Starting);

        let listener =
            match ProxyListener::bind(self.listener_config.clone(), Arc::clone(&self.table)).await {
                Ok(listener) => listener,
                Err(source) => {
                    self.state.send_replace(ServerState::Stopped);
                    return Err(ServerError::BindFailed {
                        addr: self.listener_config.bind_addr,
                        source,
                    });
                }
            };

        let local_addr = listener.local_addr();
        let stats = listener.stats();
        let (control, control_rx) = watch::channel(ListenerControl::Accept);
        let accept_task = tokio::spawn(listener.run(control_rx));

        inner.running = Some(Running {
            control,
            stats,
            local_addr,
            accept_task: Some(accept_task),
        });
        self.state.send_replace(ServerState::Accepting);

        info!(listen_addr = %local_addr, "Server accepting connections");
        Ok(local_addr)
    }

    /// Stop accepting and drain in-flight sessions.
    ///
    /// New connections are refused as soon as this is called. Sessions get
    /// up to the drain timeout to finish on their own; stragglers are
    /// cancelled, which closes both of their connection handles. Idempotent:
    /// stopping a stopped server is a no-op, and a `stop` that arrives while
    /// another is mid-drain waits for that drain to finish.
    pub async fn stop(&self) {
        let (stats, accept_task, local_addr) = {
            let mut inner = self.inner.lock().await;
            let state = *self.state.borrow();
            match state {
                ServerState::Accepting => {}
                ServerState::Draining => {
                    // Another caller owns the drain; wait it out so every
                    // stop() returns only once sessions are settled.
                    let mut state_rx = self.state.subscribe();
                    drop(inner);
                    let _ = state_rx.wait_for(|s| *s != ServerState::Draining).await;
                    return;
                }
                _ => return,
            }
            self.state.send_replace(ServerState::Draining);

            let Some(running) = inner.running.as_mut() else {
                self.state.send_replace(ServerState::Stopped);
                return;
            };

            // The accept loop owns the listening socket; leaving `Accept`
            // makes it return and drop the socket, so backlogged connects
            // are reset rather than left dangling.
            let _ = running.control.send(ListenerControl::Drain);
            (
                Arc::clone(&running.stats),
                running.accept_task.take(),
                running.local_addr,
            )
        };

        if let Some(task) = accept_task {
            let _ = task.await;
        }

        let drained = wait_for_idle(&stats, self.drain_timeout).await;
        if !drained {
            let remaining = stats.active_sessions();
            warn!(remaining, "Drain timeout elapsed; cancelling sessions");

            let mut inner = self.inner.lock().await;
            if let Some(running) = inner.running.as_ref() {
                let _ = running.control.send(ListenerControl::Cancel);
            }
            drop(inner);

            // Cancellation drops session futures promptly; give them a
            // moment to unwind before declaring the server stopped.
            wait_for_idle(&stats, Duration::from_secs(1)).await;
        }

        let mut inner = self.inner.lock().await;
        inner.running = None;
        self.state.send_replace(ServerState::Stopped);
        info!(listen_addr = %local_addr, "Server stopped");
    }

    /// Current lifecycle status.
    pub async fn status(&self) -> ServerStatus {
        let inner = self.inner.lock().await;
        let state = *self.state.borrow();
        let active_sessions = inner
            .running
            .as_ref()
            .map(|r| r.stats.active_sessions())
            .unwrap_or(0);

        ServerStatus {
            state,
            is_accepting: state == ServerState::Accepting,
            active_sessions,
        }
    }

    /// Listener statistics, if the server is running.
    pub async fn stats(&self) -> Option<Arc<ListenerStats>> {
        let inner = self.inner.lock().await;
        inner.running.as_ref().map(|r| Arc::clone(&r.stats))
    }

    /// Bound address, if the server is running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        let inner = self.inner.lock().await;
        inner.running.as_ref().map(|r| r.local_addr)
    }
}

/// Wait until no sessions are active, up to `timeout`. Returns true if idle.
async fn wait_for_idle(stats: &ListenerStats, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;

    while stats.active_sessions() > 0 {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
    }

    true
}
