//! Connection and account configuration.
//!
//! [`ClientConfig`] carries every knob the engine needs: where to connect,
//! how to pace traffic, how many sockets may be open and which account to
//! log in with. Loading it from a file is left to the application; the
//! struct deserializes with `serde`, every field defaulted.
//!
//! # Example
//!
//! ```
//! use xapi_link::ClientConfig;
//!
//! let config: ClientConfig = serde_json::from_str(
//!     r#"{ "send_interval_ms": 250, "credentials": { "user_id": "123", "password": "pw" } }"#,
//! ).unwrap();
//!
//! assert_eq!(config.max_streams_per_multiplexer(), 4);
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

use super::builder::ClientConfigBuilder;

// ============================================================================
// Constants
// ============================================================================

/// Default API host.
pub const DEFAULT_HOST: &str = "xapi.xtb.com";

/// Default pause between paced socket operations.
pub const DEFAULT_SEND_INTERVAL_MS: u64 = 200;

/// Default global connection budget.
pub const DEFAULT_MAX_CONNECTIONS: usize = 50;

/// Default number of connect attempts per open.
pub const DEFAULT_MAX_CONNECTION_FAILS: u32 = 10;

/// Default outgoing chunk size in bytes.
pub const DEFAULT_MAX_SEND_DATA: usize = 1024;

/// Default incoming chunk size in bytes.
pub const DEFAULT_MAX_RECEIVE_DATA: usize = 4096;

/// Default keepalive period, just under the server's ten minute idle cut.
pub const DEFAULT_PING_INTERVAL_MS: u64 = 594_000;

/// Default bound on waiting for the first bytes of a response.
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 30_000;

// ============================================================================
// AccountType
// ============================================================================

/// Which server family to talk to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    /// Demo accounts.
    #[default]
    Demo,
    /// Real-money accounts.
    Real,
}

// ============================================================================
// ChannelKind
// ============================================================================

/// Request/response socket or push-stream socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Request/response traffic of a session.
    Data,
    /// Pushed rows of a stream multiplexer.
    Stream,
}

// ============================================================================
// PortSet
// ============================================================================

/// The four server ports (demo/real x data/stream).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PortSet {
    /// Demo request/response port.
    pub demo: u16,
    /// Demo streaming port.
    pub demo_stream: u16,
    /// Real request/response port.
    pub real: u16,
    /// Real streaming port.
    pub real_stream: u16,
}

impl Default for PortSet {
    fn default() -> Self {
        Self {
            demo: 5124,
            demo_stream: 5125,
            real: 5112,
            real_stream: 5113,
        }
    }
}

impl PortSet {
    /// Selects the port for an account and channel.
    #[inline]
    #[must_use]
    pub const fn select(&self, account: AccountType, kind: ChannelKind) -> u16 {
        match (account, kind) {
            (AccountType::Demo, ChannelKind::Data) => self.demo,
            (AccountType::Demo, ChannelKind::Stream) => self.demo_stream,
            (AccountType::Real, ChannelKind::Data) => self.real,
            (AccountType::Real, ChannelKind::Stream) => self.real_stream,
        }
    }
}

// ============================================================================
// Credentials
// ============================================================================

/// Login credentials.
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Credentials {
    /// Account number.
    pub user_id: String,
    /// Account password.
    pub password: String,
}

impl Credentials {
    /// Creates credentials.
    #[inline]
    #[must_use]
    pub fn new(user_id: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user_id", &self.user_id)
            .field("password", &"<redacted>")
            .finish()
    }
}

// ============================================================================
// ClientConfig
// ============================================================================

/// Complete engine configuration.
///
/// Use [`ClientConfig::builder()`] for validated construction.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server host name, also used as TLS server name.
    pub host: String,

    /// Server ports.
    pub ports: PortSet,

    /// Demo or real account.
    pub account: AccountType,

    /// Wrap sockets in TLS.
    pub tls: bool,

    /// Pause between paced socket operations (milliseconds).
    pub send_interval_ms: u64,

    /// Global budget of open sessions plus multiplexers.
    pub max_connections: usize,

    /// Connect attempts per open.
    pub max_connection_fails: u32,

    /// Outgoing chunk size in bytes.
    pub max_send_data: usize,

    /// Incoming chunk size in bytes.
    pub max_receive_data: usize,

    /// Keepalive period (milliseconds).
    pub ping_interval_ms: u64,

    /// Optional socket timeout (milliseconds).
    ///
    /// When set, connects are bounded by it and the socket is considered
    /// non-blocking.
    pub timeout_ms: Option<u64>,

    /// Bound on waiting for the first bytes of a response (milliseconds).
    pub response_timeout_ms: u64,

    /// Login credentials.
    pub credentials: Credentials,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            ports: PortSet::default(),
            account: AccountType::Demo,
            tls: true,
            send_interval_ms: DEFAULT_SEND_INTERVAL_MS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_connection_fails: DEFAULT_MAX_CONNECTION_FAILS,
            max_send_data: DEFAULT_MAX_SEND_DATA,
            max_receive_data: DEFAULT_MAX_RECEIVE_DATA,
            ping_interval_ms: DEFAULT_PING_INTERVAL_MS,
            timeout_ms: None,
            response_timeout_ms: DEFAULT_RESPONSE_TIMEOUT_MS,
            credentials: Credentials::default(),
        }
    }
}

// ============================================================================
// ClientConfig - Public API
// ============================================================================

impl ClientConfig {
    /// Creates a configuration builder.
    #[inline]
    #[must_use]
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }

    /// Pause between paced socket operations.
    #[inline]
    #[must_use]
    pub fn send_interval(&self) -> Duration {
        Duration::from_millis(self.send_interval_ms)
    }

    /// Keepalive period.
    #[inline]
    #[must_use]
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    /// Socket timeout, if any.
    #[inline]
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Bound on waiting for the first bytes of a response.
    #[inline]
    #[must_use]
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// Port for the configured account and the given channel.
    #[inline]
    #[must_use]
    pub fn port(&self, kind: ChannelKind) -> u16 {
        self.ports.select(self.account, kind)
    }

    /// Subscription budget of one multiplexer: `floor(1000 / send_interval_ms)`.
    ///
    /// The server accepts roughly one streamed command per send interval
    /// and second.
    #[inline]
    #[must_use]
    pub fn max_streams_per_multiplexer(&self) -> usize {
        if self.send_interval_ms == 0 {
            return 0;
        }
        (1000 / self.send_interval_ms) as usize
    }

    /// Checks the configuration for values the engine cannot work with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::config("host must not be empty"));
        }

        if self.send_interval_ms == 0 || self.send_interval_ms > 1000 {
            return Err(Error::config(format!(
                "send_interval_ms must be within 1..=1000, got {}",
                self.send_interval_ms
            )));
        }

        if self.max_connections == 0 {
            return Err(Error::config("max_connections must be at least 1"));
        }

        if self.max_connection_fails == 0 {
            return Err(Error::config("max_connection_fails must be at least 1"));
        }

        if self.max_send_data == 0 || self.max_receive_data == 0 {
            return Err(Error::config("chunk sizes must be positive"));
        }

        if self.credentials.user_id.is_empty() || self.credentials.password.is_empty() {
            return Err(Error::config("credentials are required"));
        }

        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
