//! Fixed-nameserver fallback resolver backed by hickory-resolver.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::xfer::Protocol;
use hickory_resolver::Resolver;
use hickory_resolver::config::{
    NameServerConfig, NameServerConfigGroup, ResolverConfig, ResolverOpts,
};
use hickory_resolver::name_server::TokioConnectionProvider;
use tracing::debug;

use crate::error::DnsError;

/// Public nameserver consulted when the system resolver fails.
const FALLBACK_NAMESERVER: SocketAddr =
    SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::new(8, 8, 8, 8)), 53);

/// Per-lookup deadline on the fallback path.
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(3);

/// Resolver pinned to a known-good public nameserver.
///
/// Deliberately bypasses the system configuration: it exists precisely for
/// the case where that configuration is broken. Thread-safe and cheaply
/// cloneable.
#[derive(Clone)]
pub struct FallbackResolver {
    inner: Arc<Resolver<TokioConnectionProvider>>,
}

impl std::fmt::Debug for FallbackResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackResolver")
            .field("nameserver", &FALLBACK_NAMESERVER)
            .finish()
    }
}

impl Default for FallbackResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl FallbackResolver {
    /// Build the resolver. Call once at startup and share via `Clone`.
    pub fn new() -> Self {
        let nameserver = NameServerConfig {
            socket_addr: FALLBACK_NAMESERVER,
            protocol: Protocol::Udp,
            tls_dns_name: None,
            http_endpoint: None,
            trust_negative_responses: false,
            bind_addr: None,
        };
        let config =
            ResolverConfig::from_parts(None, vec![], NameServerConfigGroup::from(vec![nameserver]));

        let mut opts = ResolverOpts::default();
        opts.timeout = LOOKUP_TIMEOUT;
        opts.attempts = 1;

        let mut builder =
            Resolver::builder_with_config(config, TokioConnectionProvider::default());
        *builder.options_mut() = opts;

        Self {
            inner: Arc::new(builder.build()),
        }
    }

    /// Resolve `host` and return the first address, IP literals short-circuit.
    pub async fn lookup_first(&self, host: &str) -> Result<IpAddr, DnsError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }

        let response = self.inner.lookup_ip(host).await?;
        match response.iter().next() {
            Some(ip) => {
                debug!(host = %host, resolved = %ip, "fallback dns resolved");
                Ok(ip)
            }
            None => Err(DnsError::NoResults(host.to_string())),
        }
    }
}
