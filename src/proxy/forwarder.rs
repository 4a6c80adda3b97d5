//! Connection forwarding between an inbound client and its backend.
//!
//! The forwarder opens exactly one outbound TCP connection per inbound
//! connection, replays any sniffed bytes to the backend, then relays bytes
//! in both directions until either side closes. Both handles are dropped on
//! every exit path.
//!
//! Backend connect failures are reported to the caller, never retried;
//! silent retries would mask backend outages from the operator.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Default timeout for backend connect attempts.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const RELAY_BUF_SIZE: usize = 8192;

/// Errors raised while setting up a relay.
///
/// Mid-relay I/O errors are not represented here; once both connections are
/// established, an error in either direction just terminates the session.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Backend connect failed or timed out.
    #[error("backend {addr} unreachable: {reason}")]
    BackendUnreachable { addr: SocketAddr, reason: String },

    /// Replaying sniffed bytes to the backend failed.
    #[error("replay to backend {addr} failed: {source}")]
    ReplayFailed {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// Byte counters for one completed relay.
#[derive(Debug, Clone, Copy, Default)]
pub struct RelayStats {
    /// Bytes relayed client -> backend, including replayed sniff bytes.
    pub bytes_to_backend: u64,
    /// Bytes relayed backend -> client.
    pub bytes_from_backend: u64,
}

/// Forwarder establishing backend connections and relaying bytes.
#[derive(Debug, Clone)]
pub struct Forwarder {
    connect_timeout: Duration,
}

impl Forwarder {
    pub fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_timeout(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    /// Relay an inbound connection to `backend_addr`.
    ///
    /// `replay` holds the bytes consumed during hostname sniffing; they are
    /// written to the backend before the relay loop starts, so the backend
    /// sees the byte stream exactly as the client sent it.
    pub async fn relay(
        &self,
        client: &mut TcpStream,
        backend_addr: SocketAddr,
        replay: &[u8],
    ) -> Result<RelayStats, RelayError> {
        let mut backend = self.connect(backend_addr).await?;

        if !replay.is_empty() {
            backend
                .write_all(replay)
                .await
                .map_err(|source| RelayError::ReplayFailed {
                    addr: backend_addr,
                    source,
                })?;
        }

        let (client_read, client_write) = client.split();
        let (backend_read, backend_write) = backend.split();

        let (to_backend, from_backend) = tokio::join!(
            copy_half(client_read, backend_write),
            copy_half(backend_read, client_write),
        );

        // An error in one direction ends the session; report the bytes that
        // did make it through.
        let stats = RelayStats {
            bytes_to_backend: replay.len() as u64 + to_backend.unwrap_or(0),
            bytes_from_backend: from_backend.unwrap_or(0),
        };

        debug!(
            backend_addr = %backend_addr,
            bytes_to_backend = stats.bytes_to_backend,
            bytes_from_backend = stats.bytes_from_backend,
            "Relay finished"
        );

        Ok(stats)
    }

    /// Open the outbound connection with a bounded timeout.
    async fn connect(&self, addr: SocketAddr) -> Result<TcpStream, RelayError> {
        match timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(RelayError::BackendUnreachable {
                addr,
                reason: e.to_string(),
            }),
            Err(_) => Err(RelayError::BackendUnreachable {
                addr,
                reason: format!("connect timeout after {:?}", self.connect_timeout),
            }),
        }
    }
}

impl Default for Forwarder {
    fn default() -> Self {
        Self::new()
    }
}

/// Copy one direction until EOF or error, then half-close the write side.
///
/// Bytes are written in read order; no reordering within a direction.
async fn copy_half<R, W>(mut reader: R, mut writer: W) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUF_SIZE];
    let mut total = 0u64;

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                writer.write_all(&buf[..n]).await?;
                total += n as u64;
            }
            Err(e) => {
                let _ = writer.shutdown().await;
                return Err(e);
            }
        }
    }

    writer.shutdown().await?;
    Ok(total)
}
