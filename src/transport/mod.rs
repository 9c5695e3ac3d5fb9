//! Raw socket transport.
//!
//! This module owns the bytes-on-the-wire side of a handler: resolving and
//! falling back across addresses, connecting with bounded retries, optional
//! TLS, chunked paced sending, and receiving either a whole response burst
//! or a single pushed packet.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐   Box<dyn Transport>   ┌──────────────────┐
//! │ ProtocolChannel  │───────────────────────►│  TcpTransport    │──► TCP / TLS
//! │  (ping lock)     │                        │  (one socket)    │
//! └──────────────────┘                        └──────────────────┘
//! ```
//!
//! # Lifecycle
//!
//! 1. `create` - resolve, pick a candidate, prepare a socket
//! 2. `open` - connect (up to `max_fails` attempts), TLS handshake
//! 3. `send` / `receive` - paced chunked I/O
//! 4. `close` - shutdown, release the address
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `address` | Address candidates and fallback order |
//! | `connection` | TCP/TLS transport implementation |
//! | `tls` | rustls client configuration and handshake |

// ============================================================================
// Submodules
// ============================================================================

/// Address candidates and fallback order.
pub mod address;

/// TCP/TLS transport implementation.
pub mod connection;

/// TLS wrapping.
pub(crate) mod tls;

/// Scripted transport for tests.
#[cfg(test)]
pub(crate) mod mock;

// ============================================================================
// Imports
// ============================================================================

use async_trait::async_trait;

use crate::config::{ChannelKind, ClientConfig};
use crate::error::Result;

// ============================================================================
// Re-exports
// ============================================================================

pub use address::{AddressCandidate, AddressFamily};
pub use connection::TcpTransport;

// ============================================================================
// Readiness
// ============================================================================

/// State reported by [`Transport::check_ready`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Socket exists and shows no error.
    Basic,
    /// Bytes (or end-of-file) can be read without waiting.
    Readable,
    /// A chunk can be written without waiting.
    Writable,
}

// ============================================================================
// Transport
// ============================================================================

/// One socket and the operations the protocol layer needs on it.
///
/// Implementations are owned by exactly one handler and only ever used
/// while that handler's ping lock is held.
#[async_trait]
pub trait Transport: Send {
    /// Zero-timeout readiness check. Never fails, problems read as `false`.
    fn check_ready(&mut self, mode: Readiness) -> bool;

    /// Resolves the host and prepares a socket on the best candidate.
    async fn create(&mut self) -> Result<()>;

    /// Connects, recreating the socket first if it is unhealthy.
    async fn open(&mut self) -> Result<()>;

    /// Sends a message in paced chunks.
    async fn send(&mut self, message: &str) -> Result<()>;

    /// Receives one response burst, or one packet in streaming mode.
    async fn receive(&mut self) -> Result<String>;

    /// Closes the socket. Idempotent.
    async fn close(&mut self);

    /// Returns `true` for push-stream sockets.
    fn is_streaming(&self) -> bool;
}

// ============================================================================
// TransportFactory
// ============================================================================

/// Builds transports for new handlers.
pub trait TransportFactory: Send + Sync {
    /// Returns an unopened transport for the given channel.
    fn transport(&self, kind: ChannelKind) -> Box<dyn Transport>;
}

/// Builds [`TcpTransport`]s from a [`ClientConfig`].
#[derive(Debug, Clone)]
pub struct TcpTransportFactory {
    /// Settings shared by every transport.
    config: ClientConfig,
}

impl TcpTransportFactory {
    /// Creates a factory.
    #[inline]
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }
}

impl TransportFactory for TcpTransportFactory {
    fn transport(&self, kind: ChannelKind) -> Box<dyn Transport> {
        Box::new(TcpTransport::from_config(&self.config, kind))
    }
}
