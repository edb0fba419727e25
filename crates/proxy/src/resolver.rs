//! DNS resolver seam
//!
//! The session engine only needs "hostname → addresses" with
//! cancellation on drop, so the resolver is a small trait: production
//! uses the runtime's lookup, tests substitute synthetic answers.

use std::io;
use std::net::IpAddr;

use async_trait::async_trait;

#[async_trait(?Send)]
pub trait Resolver {
    async fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>>;
}

/// System resolver backed by `tokio::net::lookup_host`.
pub struct SystemResolver;

#[async_trait(?Send)]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, 0u16)).await?;
        Ok(addrs.map(|sa| sa.ip()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_system_resolver_localhost() {
        let resolver = SystemResolver;
        let addrs = resolver.resolve("localhost").await.unwrap();
        assert!(!addrs.is_empty());
        assert!(addrs.iter().all(|ip| ip.is_loopback()));
    }

    #[tokio::test]
    async fn test_system_resolver_failure() {
        let resolver = SystemResolver;
        assert!(resolver.resolve("no-such-host.invalid").await.is_err());
    }
}
