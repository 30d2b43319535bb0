//! Host name resolution
//!
//! Every lookup the proxy makes goes through the [`DnsCache`], which keeps
//! per-host TTL entries, collapses concurrent lookups of one host into a
//! single query and tracks the resolved address of each tunnel server.
//! The cache calls a [`Resolve`] backend: the system resolver, or a list of
//! upstream UDP resolvers.

mod cache;
#[cfg(feature = "dns-upstream")]
mod upstream;

pub use cache::{DnsCache, DnsCacheSettings};
#[cfg(feature = "dns-upstream")]
pub use upstream::UpstreamResolver;

use crate::config::DnsConfig;
use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// DNS errors
#[derive(Debug, Error)]
pub enum DnsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Host not found: {0}")]
    NotFound(String),

    #[error("Lookup timed out: {0}")]
    Timeout(String),

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Invalid resolver address: {0}")]
    InvalidServer(String),
}

/// Name resolution backend
#[async_trait]
pub trait Resolve: Send + Sync {
    /// Resolve a host name to its addresses
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, DnsError>;
}

/// Operating system resolver
#[derive(Debug, Default, Clone)]
pub struct SystemResolver;

#[async_trait]
impl Resolve for SystemResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, DnsError> {
        let addrs = tokio::net::lookup_host((host, 0))
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::TimedOut => DnsError::Timeout(host.to_string()),
                _ => DnsError::NotFound(format!("{}: {}", host, e)),
            })?;

        let ips: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
        if ips.is_empty() {
            return Err(DnsError::NotFound(host.to_string()));
        }
        Ok(ips)
    }
}

/// Pick the first IPv4 answer, otherwise the first answer
pub fn preferred(ips: &[IpAddr]) -> Option<IpAddr> {
    ips.iter()
        .find(|ip| ip.is_ipv4())
        .or_else(|| ips.first())
        .copied()
}

/// Build the resolver backend named by the configuration
pub fn resolver_from_config(config: &DnsConfig) -> Result<Arc<dyn Resolve>, DnsError> {
    if config.servers.is_empty() {
        return Ok(Arc::new(SystemResolver));
    }

    #[cfg(feature = "dns-upstream")]
    {
        let servers = config
            .servers
            .iter()
            .map(|s| upstream::parse_server(s))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Arc::new(UpstreamResolver::new(
            servers,
            Duration::from_millis(config.query_timeout_ms),
        )))
    }

    #[cfg(not(feature = "dns-upstream"))]
    {
        let _ = Duration::from_millis(config.query_timeout_ms);
        tracing::warn!("Upstream DNS support not compiled in; using the system resolver");
        Ok(Arc::new(SystemResolver))
    }
}
