//! Address candidates and fallback order.
//!
//! A host resolves to several socket addresses. The transport walks them in
//! an order that prefers addresses it has never used successfully, so a route
//! that went bad is not retried ahead of fresh ones. Only when every
//! candidate has been tried does the used history get cleared.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::SocketAddr;

use tokio::net::{TcpSocket, lookup_host};

use crate::error::{Error, Result};

// ============================================================================
// AddressFamily
// ============================================================================

/// IP family of a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    /// IPv4.
    Ipv4,
    /// IPv6.
    Ipv6,
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ipv4 => f.write_str("ipv4"),
            Self::Ipv6 => f.write_str("ipv6"),
        }
    }
}

// ============================================================================
// AddressCandidate
// ============================================================================

/// One resolved stream/TCP address for `(host, port)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressCandidate {
    /// IP family.
    pub family: AddressFamily,
    /// Name the candidate was resolved from.
    pub canonical_name: String,
    /// Resolved socket address.
    pub address: SocketAddr,
}

impl AddressCandidate {
    /// Creates a candidate for an address resolved from `name`.
    #[must_use]
    pub fn new(canonical_name: impl Into<String>, address: SocketAddr) -> Self {
        let family = if address.is_ipv4() {
            AddressFamily::Ipv4
        } else {
            AddressFamily::Ipv6
        };

        Self {
            family,
            canonical_name: canonical_name.into(),
            address,
        }
    }

    /// Opens an unconnected socket of the candidate's family.
    pub(crate) fn socket(&self) -> Result<TcpSocket> {
        let socket = match self.family {
            AddressFamily::Ipv4 => TcpSocket::new_v4()?,
            AddressFamily::Ipv6 => TcpSocket::new_v6()?,
        };
        Ok(socket)
    }
}

// ============================================================================
// Resolution
// ============================================================================

/// Resolves every stream address of `(host, port)` across families.
///
/// Duplicates are dropped, resolver order is kept.
///
/// # Errors
///
/// Returns [`Error::AddressResolution`] if the lookup fails or is empty.
pub async fn resolve(host: &str, port: u16) -> Result<Vec<AddressCandidate>> {
    let resolved = lookup_host((host, port))
        .await
        .map_err(|e| Error::address_resolution(host, port, e.to_string()))?;

    let mut candidates: Vec<AddressCandidate> = Vec::new();
    for address in resolved {
        if !candidates.iter().any(|c| c.address == address) {
            candidates.push(AddressCandidate::new(host, address));
        }
    }

    if candidates.is_empty() {
        return Err(Error::address_resolution(host, port, "no addresses found"));
    }

    Ok(candidates)
}

// ============================================================================
// Selection
// ============================================================================

/// Picks the next candidate to try.
///
/// Candidates neither tried in this round nor previously used come first.
/// Once those run out, any untried candidate is returned. `None` means
/// every candidate was tried.
#[must_use]
pub fn next_candidate(
    candidates: &[AddressCandidate],
    used: &[SocketAddr],
    tried: &[SocketAddr],
) -> Option<usize> {
    let untried = |c: &&AddressCandidate| !tried.contains(&c.address);

    candidates
        .iter()
        .position(|c| untried(&c) && !used.contains(&c.address))
        .or_else(|| candidates.iter().position(|c| untried(&c)))
}

// ============================================================================
// Tests
// ============================================================================
