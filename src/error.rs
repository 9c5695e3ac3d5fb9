//! Error types for the xAPI link.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use xapi_link::{Result, Session};
//!
//! async fn balance(session: &Session) -> Result<serde_json::Value> {
//!     session.fetch_data("MarginLevel", None).await
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants | Recovery |
//! |----------|----------|----------|
//! | Configuration | [`Error::Config`] | none |
//! | Transport | [`Error::Connection`], [`Error::ConnectionTimeout`], [`Error::ConnectionClosed`], [`Error::AddressResolution`], [`Error::NotWritable`], [`Error::Tls`], [`Error::MalformedResponse`], [`Error::Io`] | one reconnect, one retry |
//! | Protocol | [`Error::Server`], [`Error::MissingField`], [`Error::Protocol`] | none, connection is healthy |
//! | Session state | [`Error::NotLoggedIn`], [`Error::KeepAliveRequired`], [`Error::HandlerDeleted`], [`Error::ReconnectUnavailable`] | none |
//! | Capacity | [`Error::ConnectionLimit`], [`Error::SubscriptionLimit`] | none |
//! | External | [`Error::Json`] | none |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when client configuration is invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // Transport Errors
    // ========================================================================
    /// Socket could not be created, connected or used.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// Connect or first-response wait exceeded its bound.
    #[error("Connection timeout after {timeout_ms}ms")]
    ConnectionTimeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// Socket closed by the peer or never opened.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Host name resolution yielded no usable address.
    #[error("Address resolution failed for {host}:{port}: {message}")]
    AddressResolution {
        /// Host that was resolved.
        host: String,
        /// Port that was resolved.
        port: u16,
        /// Description of the resolution failure.
        message: String,
    },

    /// Socket did not report writability before a chunk was sent.
    #[error("Socket not writable")]
    NotWritable,

    /// TLS setup or handshake failed.
    #[error("TLS error: {message}")]
    Tls {
        /// Description of the TLS failure.
        message: String,
    },

    /// Received bytes did not decode into a JSON message.
    #[error("Malformed response: {message}")]
    MalformedResponse {
        /// Description of the decode failure.
        message: String,
    },

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Server answered with `status: false`.
    #[error("Server rejected request: [{code}] {description}")]
    Server {
        /// Server error code (`errorCode`).
        code: String,
        /// Server error description (`errorDescr`).
        description: String,
    },

    /// A required response field was absent.
    #[error("Response missing field: {field}")]
    MissingField {
        /// Name of the missing field.
        field: &'static str,
    },

    /// Protocol violation or unexpected message shape.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    // ========================================================================
    // Session State Errors
    // ========================================================================
    /// Operation needs a session token but none is held.
    #[error("No session token, log in first")]
    NotLoggedIn,

    /// A subscription was issued before the keepalive stream.
    #[error("Keepalive stream must be subscribed before {command}")]
    KeepAliveRequired {
        /// Command that was rejected.
        command: String,
    },

    /// Handler was already deleted.
    #[error("Handler {name} is deleted")]
    HandlerDeleted {
        /// Name of the deleted handler.
        name: String,
    },

    /// The reconnect strategy is no longer alive.
    #[error("Reconnect strategy unavailable")]
    ReconnectUnavailable,

    // ========================================================================
    // Capacity Errors
    // ========================================================================
    /// Global connection budget exhausted.
    #[error("Connection limit reached: {limit}")]
    ConnectionLimit {
        /// Configured maximum.
        limit: usize,
    },

    /// Per-multiplexer subscription budget exhausted.
    #[error("Subscription limit reached: {limit}")]
    SubscriptionLimit {
        /// Configured maximum.
        limit: usize,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a connection timeout error.
    #[inline]
    pub fn connection_timeout(timeout_ms: u64) -> Self {
        Self::ConnectionTimeout { timeout_ms }
    }

    /// Creates an address resolution error.
    #[inline]
    pub fn address_resolution(
        host: impl Into<String>,
        port: u16,
        message: impl Into<String>,
    ) -> Self {
        Self::AddressResolution {
            host: host.into(),
            port,
            message: message.into(),
        }
    }

    /// Creates a TLS error.
    #[inline]
    pub fn tls(message: impl Into<String>) -> Self {
        Self::Tls {
            message: message.into(),
        }
    }

    /// Creates a malformed response error.
    #[inline]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedResponse {
            message: message.into(),
        }
    }

    /// Creates a server rejection error.
    #[inline]
    pub fn server(code: impl Into<String>, description: impl Into<String>) -> Self {
        Self::Server {
            code: code.into(),
            description: description.into(),
        }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates a keepalive ordering error.
    #[inline]
    pub fn keep_alive_required(command: impl Into<String>) -> Self {
        Self::KeepAliveRequired {
            command: command.into(),
        }
    }

    /// Creates a handler deleted error.
    #[inline]
    pub fn handler_deleted(name: impl Into<String>) -> Self {
        Self::HandlerDeleted { name: name.into() }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if the failure lies in the socket or the framing.
    ///
    /// Only these errors trigger the reconnect-and-retry policy.
    #[inline]
    #[must_use]
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::ConnectionTimeout { .. }
                | Self::ConnectionClosed
                | Self::AddressResolution { .. }
                | Self::NotWritable
                | Self::Tls { .. }
                | Self::MalformedResponse { .. }
                | Self::Io(_)
        )
    }

    /// Returns `true` if the server rejected the request.
    #[inline]
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        matches!(self, Self::Server { .. })
    }

    /// Returns `true` if a connection or subscription budget is exhausted.
    #[inline]
    #[must_use]
    pub fn is_capacity_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLimit { .. } | Self::SubscriptionLimit { .. }
        )
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::ErrorKind;

    #[test]
    fn test_error_display() {
        let err = Error::connection("failed to connect");
        assert_eq!(err.to_string(), "Connection failed: failed to connect");
    }

    #[test]
    fn test_server_error_display() {
        let err = Error::server("E1", "bad");
        assert_eq!(err.to_string(), "Server rejected request: [E1] bad");
    }

    #[test]
    fn test_is_transport_error() {
        assert!(Error::ConnectionClosed.is_transport_error());
        assert!(Error::NotWritable.is_transport_error());
        assert!(Error::malformed("eof").is_transport_error());
        assert!(!Error::server("E1", "bad").is_transport_error());
        assert!(!Error::MissingField { field: "status" }.is_transport_error());
        assert!(!Error::NotLoggedIn.is_transport_error());
    }

    #[test]
    fn test_is_server_error() {
        assert!(Error::server("BE005", "userPasswordCheck").is_server_error());
        assert!(!Error::config("test").is_server_error());
    }

    #[test]
    fn test_is_capacity_error() {
        assert!(Error::ConnectionLimit { limit: 2 }.is_capacity_error());
        assert!(Error::SubscriptionLimit { limit: 5 }.is_capacity_error());
        assert!(!Error::ConnectionClosed.is_capacity_error());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = IoError::new(ErrorKind::BrokenPipe, "pipe");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.is_transport_error());
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<String>("invalid").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }
}
