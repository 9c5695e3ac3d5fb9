//! Shared utilities for demos.
//!
//! Provides common functionality used across all demos:
//! - Command-line argument parsing
//! - Logging initialization
//! - Configuration from the environment

#![allow(dead_code)]

// ============================================================================
// Imports
// ============================================================================

use tracing_subscriber::EnvFilter;
use xapi_link::{AccountType, ClientConfig, Result};

// ============================================================================
// Constants
// ============================================================================

/// Environment variable holding the account id.
pub const USER_ENV: &str = "XAPI_USER";

/// Environment variable holding the account password.
pub const PASSWORD_ENV: &str = "XAPI_PASSWORD";

// ============================================================================
// Types
// ============================================================================

/// Command-line arguments for demos.
#[derive(Debug, Clone)]
pub struct Args {
    pub debug: bool,
    pub real: bool,
    pub plain: bool,
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse() -> Self {
        let args: Vec<String> = std::env::args().collect();
        Self {
            debug: args.iter().any(|a| a == "--debug"),
            real: args.iter().any(|a| a == "--real"),
            plain: args.iter().any(|a| a == "--plain"),
        }
    }
}

// ============================================================================
// Functions
// ============================================================================

/// Initialize tracing/logging.
pub fn init_logging(debug: bool) {
    let filter = if debug {
        "xapi_link=debug"
    } else {
        "xapi_link=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .init();
}

/// Builds a configuration from `args` and the credential variables.
pub fn config(args: &Args) -> Result<ClientConfig> {
    let user = std::env::var(USER_ENV).unwrap_or_default();
    let password = std::env::var(PASSWORD_ENV).unwrap_or_default();

    let account = if args.real {
        AccountType::Real
    } else {
        AccountType::Demo
    };

    ClientConfig::builder()
        .account(account)
        .tls(!args.plain)
        .credentials(user, password)
        .build()
}
