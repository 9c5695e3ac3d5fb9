//! Builder pattern for client configuration.
//!
//! Provides a fluent API for assembling a validated [`ClientConfig`].
//!
//! # Example
//!
//! ```
//! use xapi_link::ClientConfig;
//!
//! # fn example() -> xapi_link::Result<()> {
//! let config = ClientConfig::builder()
//!     .credentials("12345", "password")
//!     .send_interval_ms(250)
//!     .max_connections(10)
//!     .build()?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use crate::error::Result;

use super::options::{AccountType, ClientConfig, Credentials, PortSet};

// ============================================================================
// ClientConfigBuilder
// ============================================================================

/// Builder for configuring a [`ClientConfig`].
///
/// Use [`ClientConfig::builder()`] to create a new builder.
#[derive(Debug, Default, Clone)]
pub struct ClientConfigBuilder {
    /// Configuration under construction.
    config: ClientConfig,
}

// ============================================================================
// ClientConfigBuilder Implementation
// ============================================================================

impl ClientConfigBuilder {
    /// Creates a builder seeded with defaults.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the server host.
    #[inline]
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    /// Sets all four server ports.
    #[inline]
    #[must_use]
    pub fn ports(mut self, ports: PortSet) -> Self {
        self.config.ports = ports;
        self
    }

    /// Selects demo or real servers.
    #[inline]
    #[must_use]
    pub fn account(mut self, account: AccountType) -> Self {
        self.config.account = account;
        self
    }

    /// Enables or disables TLS.
    #[inline]
    #[must_use]
    pub fn tls(mut self, enabled: bool) -> Self {
        self.config.tls = enabled;
        self
    }

    /// Sets the pause between paced socket operations.
    #[inline]
    #[must_use]
    pub fn send_interval_ms(mut self, millis: u64) -> Self {
        self.config.send_interval_ms = millis;
        self
    }

    /// Sets the global connection budget.
    #[inline]
    #[must_use]
    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = max;
        self
    }

    /// Sets the number of connect attempts per open.
    #[inline]
    #[must_use]
    pub fn max_connection_fails(mut self, max: u32) -> Self {
        self.config.max_connection_fails = max;
        self
    }

    /// Sets the outgoing and incoming chunk sizes.
    #[inline]
    #[must_use]
    pub fn chunk_sizes(mut self, send: usize, receive: usize) -> Self {
        self.config.max_send_data = send;
        self.config.max_receive_data = receive;
        self
    }

    /// Sets the keepalive period.
    #[inline]
    #[must_use]
    pub fn ping_interval_ms(mut self, millis: u64) -> Self {
        self.config.ping_interval_ms = millis;
        self
    }

    /// Sets the socket timeout.
    #[inline]
    #[must_use]
    pub fn timeout_ms(mut self, millis: u64) -> Self {
        self.config.timeout_ms = Some(millis);
        self
    }

    /// Sets the bound on waiting for the first bytes of a response.
    #[inline]
    #[must_use]
    pub fn response_timeout_ms(mut self, millis: u64) -> Self {
        self.config.response_timeout_ms = millis;
        self
    }

    /// Sets the login credentials.
    #[inline]
    #[must_use]
    pub fn credentials(mut self, user_id: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.credentials = Credentials::new(user_id, password);
        self
    }

    /// Builds the configuration with validation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`](crate::Error::Config) if a field is out of range
    /// or credentials are missing.
    pub fn build(self) -> Result<ClientConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

// ============================================================================
// Tests
// ============================================================================
