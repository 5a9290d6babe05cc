//! Host name resolution for STUN/TURN servers

use std::net::IpAddr;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{IceError, Result};

/// Resolves a server host name (with an optional alternate) to an ordered
/// address list. Addresses for `host` come first.
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn resolve(&self, host: &str, alt_host: Option<&str>) -> Result<Vec<IpAddr>>;
}

/// Resolver backed by the system's `getaddrinfo` through tokio
#[derive(Debug, Clone, Default)]
pub struct SystemResolver;

impl SystemResolver {
    async fn lookup(host: &str) -> Result<Vec<IpAddr>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        // Port is irrelevant; lookup_host wants one.
        let addrs = tokio::net::lookup_host((host, 0))
            .await
            .map_err(|e| IceError::dns(host, e.to_string()))?;
        Ok(addrs.map(|a| a.ip()).collect())
    }
}

#[async_trait]
impl HostResolver for SystemResolver {
    async fn resolve(&self, host: &str, alt_host: Option<&str>) -> Result<Vec<IpAddr>> {
        let mut out: Vec<IpAddr> = Vec::new();
        let mut first_error = None;

        let hosts = std::iter::once(host).chain(alt_host.filter(|h| !h.is_empty()));
        for name in hosts {
            match Self::lookup(name).await {
                Ok(ips) => {
                    debug!("Resolved {} to {:?}", name, ips);
                    for ip in ips {
                        if !out.contains(&ip) {
                            out.push(ip);
                        }
                    }
                }
                Err(e) => {
                    warn!("Failed to resolve {}: {}", name, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match (out.is_empty(), first_error) {
            (true, Some(e)) => Err(e),
            _ => Ok(out),
        }
    }
}
