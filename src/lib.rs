//! xAPI link - Session engine for the XTB xAPI trading protocol.
//!
//! This library keeps authenticated request/response sessions and push
//! streams to an xAPI server alive over plain TCP or TLS.
//!
//! # Architecture
//!
//! The engine is layered bottom-up:
//!
//! - **Transport**: one socket with address fallback, bounded connect retry,
//!   chunked paced sends and bounded receives
//! - **Protocol channel**: serialized exchanges, keepalive and single-shot
//!   reconnect-and-retry
//! - **Handlers**: [`Session`] (login, data requests) and
//!   [`StreamMultiplexer`] (many subscriptions on one streaming socket)
//! - **Pool**: [`HandlerPool`] allocates handlers under a global
//!   connection budget
//!
//! Key design principles:
//!
//! - The wire has no correlation id, so every exchange holds its handler's
//!   ping lock from send to receive
//! - Only transport failures trigger a reconnect; `status: false` replies
//!   are returned to the caller untouched
//! - Repair of a session and its multiplexers is serialized by one
//!   reconnect lock per session
//!
//! # Quick Start
//!
//! ```no_run
//! use xapi_link::{AccountType, ClientConfig, HandlerPool, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = ClientConfig::builder()
//!         .account(AccountType::Demo)
//!         .credentials("1000", "secret")
//!         .build()?;
//!
//!     let pool = HandlerPool::new(config)?;
//!
//!     // Data requests
//!     let session = pool.provide_session().await?;
//!     let version = session.fetch_data("Version", None).await?;
//!     println!("Server version: {version}");
//!
//!     // Push streams
//!     let mux = pool.provide_multiplexer().await?;
//!     mux.subscribe("Balance", None).await?;
//!     if let Some(mut packets) = mux.take_packets() {
//!         while let Some(packet) = packets.recv().await {
//!             println!("{:?}: {}", packet.command, packet.data);
//!         }
//!     }
//!
//!     pool.delete().await;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`config`] | Engine configuration and builder |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`handler`] | Sessions, multiplexers and the pool |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`protocol`] | Requests, responses, channel and keepalive |
//! | [`transport`] | Sockets, address fallback and TLS |

// ============================================================================
// Modules
// ============================================================================

/// Engine configuration.
///
/// Use [`ClientConfig::builder()`] for validated construction.
pub mod config;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Sessions, stream multiplexers and the handler pool.
pub mod handler;

/// Type-safe identifiers for handlers and subscriptions.
///
/// Newtype wrappers prevent mixing incompatible IDs at compile time.
pub mod identifiers;

/// Wire messages and the serialized protocol channel.
pub mod protocol;

/// Socket transport layer.
///
/// Address fallback, connect retry, chunked I/O and TLS.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Configuration types
pub use config::{AccountType, ChannelKind, ClientConfig, ClientConfigBuilder, Credentials};

// Error types
pub use error::{Error, Result};

// Handler types
pub use handler::{
    HandlerPool, HandlerStatus, KEEP_ALIVE, RepairOutcome, Session, StreamMultiplexer,
    StreamPacket,
};

// Identifier types
pub use identifiers::{HandlerId, SubscriptionId};

// Protocol types
pub use protocol::{Arguments, Request, Response};

// Transport types
pub use transport::{TcpTransport, TcpTransportFactory, Transport, TransportFactory};
