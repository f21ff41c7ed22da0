//! Destination dialing for the relay engine, with a DNS fallback path.
//!
//! Relay destinations arrive as `host:port` strings chosen by the remote
//! peer, so resolution failures are routine: captive resolvers, broken
//! home-router DNS, transient SERVFAILs. The dial path therefore tries the
//! system resolver first and, only when the failure looks like a
//! resolution problem, re-resolves through a fixed public nameserver
//! before giving up.
//!
//! ```rust,no_run
//! use vyx_dns::FallbackResolver;
//!
//! # async fn example() -> Result<(), vyx_dns::DnsError> {
//! let resolver = FallbackResolver::new();
//! let stream = vyx_dns::dial_with_fallback("example.com:80", &resolver).await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod resolver;

pub use error::DnsError;
pub use resolver::FallbackResolver;

use std::time::Duration;

use tokio::net::TcpStream;
use tracing::debug;

/// Per-attempt TCP connect deadline.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Total budget for the whole dial, both resolution paths included.
pub const DIAL_BUDGET: Duration = Duration::from_secs(10);

/// Dial `addr` (`host:port`), falling back to the public resolver when the
/// system resolver cannot produce an address.
///
/// Non-resolution failures (refused, unreachable, timeout) are returned
/// as-is without a second attempt. When the fallback resolution itself
/// fails, the original error is returned so the caller sees the primary
/// failure mode.
pub async fn dial_with_fallback(
    addr: &str,
    resolver: &FallbackResolver,
) -> Result<TcpStream, DnsError> {
    tokio::time::timeout(DIAL_BUDGET, dial_inner(addr, resolver))
        .await
        .map_err(|_| DnsError::Timeout(addr.to_string()))?
}

async fn dial_inner(addr: &str, resolver: &FallbackResolver) -> Result<TcpStream, DnsError> {
    let first = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await;

    let err = match first {
        Ok(Ok(stream)) => return Ok(stream),
        Ok(Err(e)) => e,
        Err(_) => return Err(DnsError::Timeout(addr.to_string())),
    };

    if !is_resolution_failure(&err) {
        return Err(DnsError::Io(err));
    }

    debug!(error = %err, "system resolution failed, trying fallback resolver");

    let (host, port) = split_host_port(addr)?;
    let ip = match resolver.lookup_first(host).await {
        Ok(ip) => ip,
        // Fallback resolution failed too; surface the original error.
        Err(_) => return Err(DnsError::Io(err)),
    };

    let resolved = std::net::SocketAddr::new(ip, port);
    match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(resolved)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(DnsError::Io(e)),
        Err(_) => Err(DnsError::Timeout(addr.to_string())),
    }
}

/// Whether an I/O error from `TcpStream::connect` indicates a name
/// resolution failure rather than an unreachable destination.
///
/// There is no dedicated `ErrorKind` for getaddrinfo failures, so this
/// matches the messages the platform resolvers actually produce.
pub fn is_resolution_failure(err: &std::io::Error) -> bool {
    let msg = err.to_string().to_ascii_lowercase();
    msg.contains("failed to lookup address")
        || msg.contains("no such host")
        || msg.contains("name or service not known")
        || msg.contains("temporary failure in name resolution")
        || msg.contains("nodename nor servname provided")
}

/// Split `"host:port"` into (host, port).
///
/// Handles IPv6 bracket notation: `"[::1]:443"` → `("::1", 443)`.
pub fn split_host_port(addr: &str) -> Result<(&str, u16), DnsError> {
    if let Some(rest) = addr.strip_prefix('[') {
        if let Some((host, port_str)) = rest.split_once("]:") {
            let port = port_str
                .parse::<u16>()
                .map_err(|_| DnsError::InvalidAddress(addr.to_string()))?;
            return Ok((host, port));
        }
        return Err(DnsError::InvalidAddress(addr.to_string()));
    }

    match addr.rsplit_once(':') {
        Some((host, port_str)) if !host.contains(':') => {
            let port = port_str
                .parse::<u16>()
                .map_err(|_| DnsError::InvalidAddress(addr.to_string()))?;
            Ok((host, port))
        }
        _ => Err(DnsError::InvalidAddress(format!(
            "missing port in address: {addr}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error, ErrorKind};

    #[test]
    fn split_host_port_basic() {
        let (host, port) = split_host_port("example.com:443").unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, 443);
    }

    #[test]
    fn split_host_port_ipv6() {
        let (host, port) = split_host_port("[::1]:8080").unwrap();
        assert_eq!(host, "::1");
        assert_eq!(port, 8080);
    }

    #[test]
    fn split_host_port_rejects_missing_port() {
        split_host_port("example.com").unwrap_err();
        split_host_port("::1").unwrap_err();
    }

    #[test]
    fn resolution_failure_classification() {
        let lookup = Error::new(
            ErrorKind::Other,
            "failed to lookup address information: Name or service not known",
        );
        assert!(is_resolution_failure(&lookup));

        let transient = Error::new(
            ErrorKind::Other,
            "Temporary failure in name resolution",
        );
        assert!(is_resolution_failure(&transient));

        let refused = Error::new(ErrorKind::ConnectionRefused, "connection refused");
        assert!(!is_resolution_failure(&refused));

        let timeout = Error::new(ErrorKind::TimedOut, "connection timed out");
        assert!(!is_resolution_failure(&timeout));
    }

    #[tokio::test]
    async fn dial_ip_literal_succeeds() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let resolver = FallbackResolver::new();
        let stream = dial_with_fallback(&addr.to_string(), &resolver)
            .await
            .unwrap();
        assert_eq!(stream.peer_addr().unwrap(), addr);
    }

    #[tokio::test]
    async fn dial_refused_is_not_retried() {
        // Port 1 on loopback is essentially never listening; a refused
        // connection must come back as an I/O error without consulting
        // the fallback resolver.
        let resolver = FallbackResolver::new();
        let start = tokio::time::Instant::now();
        let err = dial_with_fallback("127.0.0.1:1", &resolver)
            .await
            .unwrap_err();
        assert!(matches!(err, DnsError::Io(_) | DnsError::Timeout(_)));
        assert!(start.elapsed() < DIAL_BUDGET);
    }
}
