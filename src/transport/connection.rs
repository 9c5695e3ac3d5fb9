//! TCP/TLS transport.
//!
//! [`TcpTransport`] owns one socket to the server. It resolves the host,
//! falls back across address candidates, connects with a bounded number of
//! attempts and moves bytes in paced chunks.
//!
//! # Receiving
//!
//! Readability is checked by polling one read without waiting. Bytes obtained
//! by a poll are kept and handed out by the next [`Transport::receive`].
//!
//! - Data sockets accumulate until a poll comes back empty, which ends the
//!   response burst. The first bytes are awaited for at most
//!   `response_timeout`.
//! - Stream sockets return as soon as one non-empty chunk arrived.

// ============================================================================
// Imports
// ============================================================================

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt, Interest};
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::{Instant, sleep, timeout};
use tokio_rustls::client::TlsStream;
use tracing::{debug, error, info, trace, warn};

use crate::config::{ChannelKind, ClientConfig};
use crate::error::{Error, Result};

use super::address::{self, AddressCandidate, next_candidate};
use super::{Readiness, Transport, tls};

// ============================================================================
// ConnectionSettings
// ============================================================================

/// Static settings of one transport.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Server host, also the TLS server name.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Wrap the socket in TLS.
    pub tls: bool,
    /// Push-stream socket.
    pub streaming: bool,
    /// Optional socket timeout, bounds connect and handshake.
    pub timeout: Option<Duration>,
    /// Pause between paced operations.
    pub interval: Duration,
    /// Connect attempts per open.
    pub max_fails: u32,
    /// Outgoing chunk size in bytes.
    pub bytes_out: usize,
    /// Incoming chunk size in bytes.
    pub bytes_in: usize,
    /// Bound on waiting for the first bytes of a response.
    pub response_timeout: Duration,
}

impl ConnectionSettings {
    /// Derives transport settings for a channel from the client configuration.
    #[must_use]
    pub fn from_config(config: &ClientConfig, kind: ChannelKind) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port(kind),
            tls: config.tls,
            streaming: kind == ChannelKind::Stream,
            timeout: config.timeout(),
            interval: config.send_interval(),
            max_fails: config.max_connection_fails,
            bytes_out: config.max_send_data,
            bytes_in: config.max_receive_data,
            response_timeout: config.response_timeout(),
        }
    }

    /// Sockets without a timeout are treated as blocking.
    #[inline]
    #[must_use]
    pub fn is_blocking(&self) -> bool {
        self.timeout.is_none()
    }
}

// ============================================================================
// Socket
// ============================================================================

/// A connected stream, plain or TLS.
enum Socket {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Socket {
    /// Underlying TCP stream.
    fn tcp(&self) -> &TcpStream {
        match self {
            Self::Plain(stream) => stream,
            Self::Tls(stream) => stream.get_ref().0,
        }
    }

    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(stream) => stream.read(buf).await,
            Self::Tls(stream) => stream.read(buf).await,
        }
    }

    /// Writes part of `buf` and flushes it to the wire.
    async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(stream) => {
                let written = stream.write(buf).await?;
                stream.flush().await?;
                Ok(written)
            }
            Self::Tls(stream) => {
                let written = stream.write(buf).await?;
                stream.flush().await?;
                Ok(written)
            }
        }
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(stream) => stream.shutdown().await,
            Self::Tls(stream) => stream.shutdown().await,
        }
    }
}

/// Socket lifecycle.
enum SocketState {
    /// No socket.
    Closed,
    /// Socket created for a candidate, not yet connected.
    Prepared(TcpSocket),
    /// Connected, TLS already negotiated if enabled.
    Connected(Socket),
}

// ============================================================================
// TcpTransport
// ============================================================================

/// Transport over one TCP socket, optionally wrapped in TLS.
///
/// # Example
///
/// ```no_run
/// use xapi_link::config::{ChannelKind, ClientConfig};
/// use xapi_link::transport::{TcpTransport, Transport};
///
/// # async fn example(config: ClientConfig) -> xapi_link::Result<()> {
/// let mut transport = TcpTransport::from_config(&config, ChannelKind::Data);
/// transport.open().await?;
/// transport.send(r#"{"command":"ping"}"#).await?;
/// let reply = transport.receive().await?;
/// transport.close().await;
/// # Ok(())
/// # }
/// ```
pub struct TcpTransport {
    /// Static settings.
    settings: ConnectionSettings,
    /// Addresses that produced a socket, most recent last.
    used_addresses: Vec<SocketAddr>,
    /// Candidate of the current socket.
    candidate: Option<AddressCandidate>,
    /// Socket lifecycle.
    state: SocketState,
    /// Bytes read by a readiness check, not yet handed out.
    pending: Vec<u8>,
    /// Peer closed its side.
    eof: bool,
    /// Lazily built TLS configuration.
    tls_config: Option<Arc<rustls::ClientConfig>>,
}

impl TcpTransport {
    /// Creates an unopened transport.
    #[must_use]
    pub fn new(settings: ConnectionSettings) -> Self {
        Self {
            settings,
            used_addresses: Vec::new(),
            candidate: None,
            state: SocketState::Closed,
            pending: Vec::new(),
            eof: false,
            tls_config: None,
        }
    }

    /// Creates an unopened transport for a channel.
    #[must_use]
    pub fn from_config(config: &ClientConfig, kind: ChannelKind) -> Self {
        Self::new(ConnectionSettings::from_config(config, kind))
    }

    /// Returns the transport settings.
    #[inline]
    #[must_use]
    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    /// Returns the candidate of the current socket.
    #[inline]
    #[must_use]
    pub fn candidate(&self) -> Option<&AddressCandidate> {
        self.candidate.as_ref()
    }

    /// Returns `true` while a connected socket is held.
    #[inline]
    #[must_use]
    pub fn is_connected(&self) -> bool {
        matches!(self.state, SocketState::Connected(_))
    }
}

// ============================================================================
// TcpTransport - Readiness
// ============================================================================

impl TcpTransport {
    fn check_basic(&self) -> bool {
        let socket = match &self.state {
            SocketState::Closed => return false,
            SocketState::Prepared(_) => return true,
            SocketState::Connected(socket) => socket,
        };

        if self.eof {
            return false;
        }

        let tcp = socket.tcp();
        match tcp.take_error() {
            Ok(None) => {}
            Ok(Some(e)) => {
                debug!(error = %e, "Socket reports error");
                return false;
            }
            Err(e) => {
                debug!(error = %e, "Socket error query failed");
                return false;
            }
        }

        match tcp
            .ready(Interest::READABLE | Interest::WRITABLE)
            .now_or_never()
        {
            Some(Ok(ready)) => !(ready.is_read_closed() || ready.is_write_closed()),
            Some(Err(e)) => {
                debug!(error = %e, "Readiness check failed");
                false
            }
            None => true,
        }
    }

    fn check_readable(&mut self) -> bool {
        if !self.pending.is_empty() || self.eof {
            return true;
        }

        let SocketState::Connected(socket) = &mut self.state else {
            return false;
        };

        let mut buf = vec![0u8; self.settings.bytes_in];
        let polled = socket.read(&mut buf).now_or_never();

        match polled {
            None => false,
            Some(Ok(0)) => {
                debug!("Peer closed connection");
                self.eof = true;
                true
            }
            Some(Ok(read)) => {
                self.pending.extend_from_slice(&buf[..read]);
                true
            }
            Some(Err(e)) => {
                debug!(error = %e, "Read poll failed");
                false
            }
        }
    }

    fn check_writable(&self) -> bool {
        let SocketState::Connected(socket) = &self.state else {
            return false;
        };

        match socket.tcp().ready(Interest::WRITABLE).now_or_never() {
            Some(Ok(ready)) => ready.is_writable(),
            Some(Err(e)) => {
                debug!(error = %e, "Write poll failed");
                false
            }
            None => false,
        }
    }
}

// ============================================================================
// TcpTransport - Connect
// ============================================================================

impl TcpTransport {
    /// Makes sure a TLS configuration exists when TLS is enabled.
    fn prepare_tls(&mut self) -> Result<()> {
        if !self.settings.tls {
            return Ok(());
        }

        tls::server_name(&self.settings.host)?;
        if self.tls_config.is_none() {
            self.tls_config = Some(tls::client_config()?);
        }
        Ok(())
    }

    /// Connects a prepared socket and runs the TLS handshake.
    async fn connect(&self, socket: TcpSocket, candidate: &AddressCandidate) -> Result<Socket> {
        let connecting = socket.connect(candidate.address);
        let stream = match self.settings.timeout {
            Some(limit) => timeout(limit, connecting)
                .await
                .map_err(|_| Error::connection_timeout(limit.as_millis() as u64))??,
            None => connecting.await?,
        };

        if !self.settings.tls {
            return Ok(Socket::Plain(stream));
        }

        let config = match &self.tls_config {
            Some(config) => Arc::clone(config),
            None => tls::client_config()?,
        };

        let handshake = tls::wrap(stream, &self.settings.host, config);
        let stream = match self.settings.timeout {
            Some(limit) => timeout(limit, handshake)
                .await
                .map_err(|_| Error::connection_timeout(limit.as_millis() as u64))??,
            None => handshake.await?,
        };

        debug!("TLS handshake completed");
        Ok(Socket::Tls(Box::new(stream)))
    }

    fn reset_socket(&mut self) {
        self.state = SocketState::Closed;
        self.pending.clear();
        self.eof = false;
    }
}

// ============================================================================
// Transport Implementation
// ============================================================================

#[async_trait]
impl Transport for TcpTransport {
    fn check_ready(&mut self, mode: Readiness) -> bool {
        match mode {
            Readiness::Basic => self.check_basic(),
            Readiness::Readable => self.check_readable(),
            Readiness::Writable => self.check_writable(),
        }
    }

    async fn create(&mut self) -> Result<()> {
        let host = self.settings.host.clone();
        let port = self.settings.port;
        info!(%host, port, "Creating socket");

        let candidates = match address::resolve(&host, port).await {
            Ok(candidates) => candidates,
            Err(e) => {
                error!(error = %e, "Failed to query address info");
                return Err(e);
            }
        };
        info!(count = candidates.len(), "Addresses found");

        self.reset_socket();

        let mut tried = Vec::with_capacity(candidates.len());
        while let Some(index) = next_candidate(&candidates, &self.used_addresses, &tried) {
            let candidate = candidates[index].clone();
            tried.push(candidate.address);

            info!(
                family = %candidate.family,
                canonical_name = %candidate.canonical_name,
                address = %candidate.address,
                "Selected candidate"
            );

            let socket = match candidate.socket() {
                Ok(socket) => socket,
                Err(e) => {
                    warn!(address = %candidate.address, error = %e, "Failed to create socket");
                    continue;
                }
            };

            if let Err(e) = self.prepare_tls() {
                warn!(address = %candidate.address, error = %e, "Failed to prepare TLS");
                continue;
            }

            debug!(
                blocking = self.settings.is_blocking(),
                tls = self.settings.tls,
                "Socket created"
            );

            // most recent last, so `close` releases this address
            self.used_addresses.retain(|a| *a != candidate.address);
            self.used_addresses.push(candidate.address);
            self.candidate = Some(candidate);
            self.state = SocketState::Prepared(socket);
            return Ok(());
        }

        // Every candidate failed, allow a fresh round next time
        self.used_addresses.clear();

        error!(%host, port, "All attempts to create socket failed");
        Err(Error::connection(format!(
            "no usable address for {host}:{port}"
        )))
    }

    async fn open(&mut self) -> Result<()> {
        info!("Opening connection");

        if self.is_connected() && self.check_basic() {
            debug!("Socket already connected");
            return Ok(());
        }

        if !self.check_basic() {
            warn!("Socket failed, creating again");
            self.create().await?;
        }

        let Some(candidate) = self.candidate.clone() else {
            return Err(Error::ConnectionClosed);
        };

        for attempt in 1..=self.settings.max_fails {
            let socket = match std::mem::replace(&mut self.state, SocketState::Closed) {
                SocketState::Prepared(socket) => socket,
                _ => match candidate.socket() {
                    Ok(socket) => socket,
                    Err(e) => {
                        warn!(attempt, error = %e, "Failed to recreate socket");
                        sleep(self.settings.interval).await;
                        continue;
                    }
                },
            };

            match self.connect(socket, &candidate).await {
                Ok(socket) => {
                    self.state = SocketState::Connected(socket);
                    self.pending.clear();
                    self.eof = false;
                    info!(address = %candidate.address, attempt, "Socket connected");
                    return Ok(());
                }
                Err(e) => {
                    warn!(address = %candidate.address, attempt, error = %e, "Connect failed");
                    sleep(self.settings.interval).await;
                }
            }
        }

        error!(
            address = %candidate.address,
            attempts = self.settings.max_fails,
            "Could not open connection"
        );
        Err(Error::connection(format!(
            "connect to {} failed after {} attempts",
            candidate.address, self.settings.max_fails
        )))
    }

    async fn send(&mut self, message: &str) -> Result<()> {
        let bytes = message.as_bytes();
        let mut sent = 0;

        while sent < bytes.len() {
            let size = self.settings.bytes_out.min(bytes.len() - sent);

            if !self.check_writable() {
                error!("Connection to socket broken");
                return Err(Error::NotWritable);
            }

            let SocketState::Connected(socket) = &mut self.state else {
                return Err(Error::ConnectionClosed);
            };

            let written = match socket.write(&bytes[sent..sent + size]).await {
                Ok(0) => return Err(Error::ConnectionClosed),
                Ok(written) => written,
                Err(e) => {
                    error!(error = %e, "Error sending message");
                    return Err(e.into());
                }
            };

            sent += written;
            trace!(written, sent, total = bytes.len(), "Chunk sent");

            sleep(self.settings.interval).await;
        }

        debug!(bytes = bytes.len(), "Message sent");
        Ok(())
    }

    async fn receive(&mut self) -> Result<String> {
        let deadline = Instant::now() + self.settings.response_timeout;
        let mut received: Vec<u8> = Vec::new();

        loop {
            if self.check_readable() {
                let chunk = std::mem::take(&mut self.pending);

                // A readable socket without bytes has reached end-of-file
                if chunk.is_empty() {
                    if received.is_empty() {
                        warn!("Connection closed by peer");
                        return Err(Error::ConnectionClosed);
                    }
                    break;
                }

                trace!(bytes = chunk.len(), "Chunk received");
                received.extend_from_slice(&chunk);

                if self.settings.streaming {
                    break;
                }
            } else if !received.is_empty() {
                break;
            } else if !self.is_connected() {
                return Err(Error::ConnectionClosed);
            } else if Instant::now() >= deadline {
                let waited = self.settings.response_timeout.as_millis() as u64;
                warn!(waited_ms = waited, "No data received");
                return Err(Error::connection_timeout(waited));
            }

            sleep(self.settings.interval).await;
        }

        debug!(bytes = received.len(), "Message received");
        String::from_utf8(received).map_err(|e| Error::malformed(e.to_string()))
    }

    async fn close(&mut self) {
        info!("Closing connection");

        match std::mem::replace(&mut self.state, SocketState::Closed) {
            SocketState::Closed => {
                debug!("Socket is already closed");
                return;
            }
            SocketState::Prepared(_) => {}
            SocketState::Connected(mut socket) => {
                if let Err(e) = socket.shutdown().await {
                    warn!(error = %e, "Error shutting down socket");
                }
            }
        }

        self.pending.clear();
        self.eof = false;
        // The address served a clean session, it is free for the next round
        self.used_addresses.pop();

        info!("Socket closed");
    }

    fn is_streaming(&self) -> bool {
        self.settings.streaming
    }
}

// ============================================================================
// Tests
// ============================================================================
