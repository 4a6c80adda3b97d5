//! Hostname extraction from the first bytes of a connection.
//!
//! TCP offers no non-destructive peek, so the sniffer buffers everything it
//! consumes; the forwarder replays that buffer to the backend before the
//! relay starts, preserving the no-byte-loss guarantee.
//!
//! Two framings are recognized:
//! - TLS ClientHello (record type 0x16): the SNI extension hostname.
//! - HTTP/1.x request head: the `Host` header value, port stripped.
//!
//! Sniffing is bounded by a timeout and a maximum buffer size so a client
//! that trickles bytes cannot pin a connection slot indefinitely.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;

use super::router::normalize_hostname;

/// Default timeout for hostname sniffing.
pub const DEFAULT_SNIFF_TIMEOUT: Duration = Duration::from_millis(200);

/// Default maximum bytes to buffer while sniffing.
pub const DEFAULT_MAX_SNIFF_BYTES: usize = 8192;

const TLS_HANDSHAKE_RECORD: u8 = 0x16;
const TLS_CLIENT_HELLO: u8 = 0x01;
const TLS_EXT_SERVER_NAME: u16 = 0x0000;
const SNI_NAME_TYPE_HOST: u8 = 0x00;

/// Outcome of hostname sniffing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SniffResult {
    /// Hostname extracted and normalized.
    Found(String),
    /// Well-formed request head without a hostname (no SNI extension, or an
    /// HTTP head with no Host header).
    NoHostname,
    /// Data matched neither framing, or the framing was truncated/invalid.
    Malformed,
    /// Client did not send enough data within the sniff timeout.
    Timeout,
    /// I/O error while reading.
    Io(String),
}

/// Configuration for hostname sniffing.
#[derive(Debug, Clone)]
pub struct SniffConfig {
    /// Maximum time to wait for enough data.
    pub timeout: Duration,
    /// Maximum bytes to buffer.
    pub max_bytes: usize,
}

impl Default for SniffConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_SNIFF_TIMEOUT,
            max_bytes: DEFAULT_MAX_SNIFF_BYTES,
        }
    }
}

/// Hostname sniffer.
pub struct Sniffer {
    config: SniffConfig,
}

impl Sniffer {
    pub fn new() -> Self {
        Self {
            config: SniffConfig::default(),
        }
    }

    pub fn with_config(config: SniffConfig) -> Self {
        Self { config }
    }

    /// Sniff the hostname from a stream, buffering consumed bytes.
    ///
    /// Every byte read from the stream is appended to `buffer`; the caller
    /// must forward the buffer to the backend ahead of the relay.
    pub async fn sniff<R: AsyncRead + Unpin>(
        &self,
        stream: &mut R,
        buffer: &mut Vec<u8>,
    ) -> SniffResult {
        buffer.clear();

        match timeout(self.config.timeout, self.read_hostname(stream, buffer)).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => SniffResult::Io(e.to_string()),
            Err(_) => SniffResult::Timeout,
        }
    }

    async fn read_hostname<R: AsyncRead + Unpin>(
        &self,
        stream: &mut R,
        buffer: &mut Vec<u8>,
    ) -> io::Result<SniffResult> {
        if !fill(stream, buffer, 1, self.config.max_bytes).await? {
            return Ok(SniffResult::Malformed);
        }

        if buffer[0] == TLS_HANDSHAKE_RECORD {
            self.read_client_hello(stream, buffer).await
        } else {
            self.read_http_head(stream, buffer).await
        }
    }

    /// Read a full TLS record and parse the SNI extension out of it.
    async fn read_client_hello<R: AsyncRead + Unpin>(
        &self,
        stream: &mut R,
        buffer: &mut Vec<u8>,
    ) -> io::Result<SniffResult> {
        // Record header: type (1), version (2), length (2).
        if !fill(stream, buffer, 5, self.config.max_bytes).await? {
            return Ok(SniffResult::Malformed);
        }

        let record_len = u16::from_be_bytes([buffer[3], buffer[4]]) as usize;
        let target = (5 + record_len).min(self.config.max_bytes);

        if !fill(stream, buffer, target, self.config.max_bytes).await? {
            return Ok(SniffResult::Malformed);
        }

        Ok(parse_client_hello(buffer))
    }

    /// Read HTTP head lines until a Host header or the end of the head.
    async fn read_http_head<R: AsyncRead + Unpin>(
        &self,
        stream: &mut R,
        buffer: &mut Vec<u8>,
    ) -> io::Result<SniffResult> {
        loop {
            match scan_http_host(buffer) {
                HostScan::Found(host) => return Ok(SniffResult::Found(host)),
                HostScan::HeadEndedWithoutHost => return Ok(SniffResult::NoHostname),
                HostScan::NotHttp => return Ok(SniffResult::Malformed),
                HostScan::NeedMore => {}
            }

            if buffer.len() >= self.config.max_bytes {
                return Ok(SniffResult::Malformed);
            }

            let before = buffer.len();
            if !fill(stream, buffer, before + 1, self.config.max_bytes).await? {
                return Ok(SniffResult::Malformed);
            }
        }
    }
}

impl Default for Sniffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Read until the buffer holds at least `target` bytes (capped at `max`).
///
/// The buffer never grows past `max`; each read is sized to the remaining
/// allowance. Returns false on EOF before the target is reached.
async fn fill<R: AsyncRead + Unpin>(
    stream: &mut R,
    buffer: &mut Vec<u8>,
    target: usize,
    max: usize,
) -> io::Result<bool> {
    let target = target.min(max);
    let mut chunk = [0u8; 2048];

    while buffer.len() < target {
        let room = (max - buffer.len()).min(chunk.len());
        let n = stream.read(&mut chunk[..room]).await?;
        if n == 0 {
            return Ok(false);
        }
        buffer.extend_from_slice(&chunk[..n]);
    }

    Ok(true)
}

enum HostScan {
    Found(String),
    HeadEndedWithoutHost,
    NotHttp,
    NeedMore,
}

/// Scan buffered HTTP head data for a complete Host header line.
///
/// Only complete lines (terminated by CRLF) are considered, so a partially
/// received header never yields a truncated hostname.
fn scan_http_host(data: &[u8]) -> HostScan {
    let mut lines = data.split_inclusive(|&b| b == b'\n');

    // Request line. Reject anything that does not look like HTTP once the
    // first line is complete.
    match lines.next() {
        Some(line) if line.ends_with(b"\n") => {
            if !line.windows(6).any(|w| w.eq_ignore_ascii_case(b" http/")) {
                return HostScan::NotHttp;
            }
        }
        _ => return HostScan::NeedMore,
    }

    for line in lines {
        if !line.ends_with(b"\n") {
            return HostScan::NeedMore;
        }

        let trimmed = trim_line(line);
        if trimmed.is_empty() {
            return HostScan::HeadEndedWithoutHost;
        }

        if let Some(value) = header_value(trimmed, b"host") {
            let host = strip_port(value.trim());
            if host.is_empty() {
                return HostScan::NotHttp;
            }
            return HostScan::Found(normalize_hostname(host));
        }
    }

    HostScan::NeedMore
}

fn trim_line(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Extract the value of `name: value` if the line carries that header.
fn header_value<'a>(line: &'a [u8], name: &[u8]) -> Option<&'a str> {
    let colon = line.iter().position(|&b| b == b':')?;
    if !line[..colon].trim_ascii().eq_ignore_ascii_case(name) {
        return None;
    }
    std::str::from_utf8(&line[colon + 1..]).ok()
}

/// Strip a `:port` suffix from a Host header value.
///
/// Bracketed IPv6 literals keep their brackets stripped as well, so the
/// result matches a plain hostname form.
fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return &rest[..end];
        }
        return host;
    }

    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Sequential reader over a byte slice; every take is bounds-checked.
struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        if end > self.data.len() {
            return None;
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Some(slice)
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        self.take(n).map(|_| ())
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|s| s[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|s| u16::from_be_bytes([s[0], s[1]]))
    }
}

/// Parse the SNI hostname from a buffered TLS ClientHello.
fn parse_client_hello(data: &[u8]) -> SniffResult {
    match try_parse_client_hello(data) {
        Some(result) => result,
        None => SniffResult::Malformed,
    }
}

/// Walk the ClientHello structure. `None` means truncated or inconsistent.
fn try_parse_client_hello(data: &[u8]) -> Option<SniffResult> {
    let mut rd = ByteReader::new(data);

    // TLS record header: type, version, length.
    if rd.u8()? != TLS_HANDSHAKE_RECORD {
        return Some(SniffResult::Malformed);
    }
    rd.skip(2)?;
    rd.skip(2)?;

    // Handshake header: type, 24-bit length.
    if rd.u8()? != TLS_CLIENT_HELLO {
        return Some(SniffResult::Malformed);
    }
    rd.skip(3)?;

    // Client version and random.
    rd.skip(2)?;
    rd.skip(32)?;

    let session_id_len = rd.u8()? as usize;
    rd.skip(session_id_len)?;

    let cipher_suites_len = rd.u16()? as usize;
    rd.skip(cipher_suites_len)?;

    let compression_len = rd.u8()? as usize;
    rd.skip(compression_len)?;

    let extensions_len = rd.u16()? as usize;
    let mut ext = ByteReader::new(rd.take(extensions_len)?);

    while let Some(ext_type) = ext.u16() {
        let ext_len = ext.u16()? as usize;
        let body = ext.take(ext_len)?;

        if ext_type == TLS_EXT_SERVER_NAME {
            return parse_server_name_list(body);
        }
    }

    Some(SniffResult::NoHostname)
}

/// Parse the server_name extension body: a list of typed name entries.
fn parse_server_name_list(data: &[u8]) -> Option<SniffResult> {
    let mut rd = ByteReader::new(data);
    let list_len = rd.u16()? as usize;
    let mut list = ByteReader::new(rd.take(list_len)?);

    while let Some(name_type) = list.u8() {
        let name_len = list.u16()? as usize;
        let name = list.take(name_len)?;

        if name_type == SNI_NAME_TYPE_HOST {
            return match std::str::from_utf8(name) {
                Ok(hostname) => Some(SniffResult::Found(normalize_hostname(hostname))),
                Err(_) => Some(SniffResult::Malformed),
            };
        }
    }

    Some(SniffResult::NoHostname)
}
