//! Client configuration.
//!
//! # Components
//!
//! | Type | Description |
//! |------|-------------|
//! | [`ClientConfig`] | Host, ports, pacing, budgets and credentials |
//! | [`ClientConfigBuilder`] | Fluent, validating builder |
//! | [`Credentials`] | Login pair, password redacted in `Debug` |
//! | [`PortSet`] | Demo/real x data/stream ports |

// ============================================================================
// Submodules
// ============================================================================

/// Fluent builder pattern for configuration.
pub mod builder;

/// Configuration values and derived settings.
pub mod options;

// ============================================================================
// Re-exports
// ============================================================================

pub use builder::ClientConfigBuilder;
pub use options::{AccountType, ChannelKind, ClientConfig, Credentials, PortSet};
