//! Wrapping connected sockets with TLS.
//!
//! Uses `rustls` with the `ring` provider and the bundled webpki trust
//! anchors. The configured host doubles as the TLS server name.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

use crate::error::{Error, Result};

// ============================================================================
// Functions
// ============================================================================

/// Builds the client TLS configuration.
///
/// # Errors
///
/// Returns [`Error::Tls`] if the provider rejects the protocol versions.
pub(crate) fn client_config() -> Result<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(Arc::new(config))
}

/// Converts the configured host into a TLS server name.
///
/// # Errors
///
/// Returns [`Error::Tls`] if the host is not a valid DNS name or IP.
pub(crate) fn server_name(host: &str) -> Result<ServerName<'static>> {
    // rustls expects IPv6 literals without brackets
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    ServerName::try_from(host.to_string())
        .map_err(|_| Error::tls(format!("invalid server name: {host}")))
}

/// Runs the TLS handshake over a connected stream.
///
/// # Errors
///
/// Returns [`Error::Tls`] if the handshake fails.
pub(crate) async fn wrap(
    stream: TcpStream,
    host: &str,
    config: Arc<ClientConfig>,
) -> Result<TlsStream<TcpStream>> {
    let domain = server_name(host)?;
    TlsConnector::from(config)
        .connect(domain, stream)
        .await
        .map_err(|e| Error::tls(e.to_string()))
}

// ============================================================================
// Tests
// ============================================================================
