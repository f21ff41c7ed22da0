//! Dial and resolution errors.

/// Errors from destination dialing and DNS resolution.
#[derive(Debug, thiserror::Error)]
pub enum DnsError {
    /// Underlying socket error (refused, unreachable, resolver failure).
    #[error("dial failed: {0}")]
    Io(#[from] std::io::Error),

    /// Fallback DNS lookup failed.
    #[error("dns lookup failed: {0}")]
    Lookup(#[from] hickory_resolver::ResolveError),

    /// Fallback DNS lookup returned no addresses.
    #[error("dns lookup returned no results for {0}")]
    NoResults(String),

    /// Invalid address format (missing port, bad IPv6 brackets).
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Connect or dial budget exceeded.
    #[error("dial timed out for {0}")]
    Timeout(String),
}
