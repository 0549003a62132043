use async_trait::async_trait;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::system_conf::read_system_conf;
use hickory_resolver::TokioAsyncResolver;
use std::net::IpAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use crate::addr::{is_ignored_mon_addr, parse_mon_addr};

/// Network lookups made during a pass. Both operations absorb every failure.
#[async_trait]
pub trait NetworkProbe: Send + Sync {
    /// Short hostname for an IP, or `None` if the lookup fails.
    async fn reverse_resolve(&self, ip: &str) -> Option<String>;

    /// Whether a TCP connection to the monitor address succeeds.
    async fn mon_reachable(&self, mon_addr: &str) -> bool;
}

/// First name without a domain separator; otherwise the first name cut at
/// its first `.`.
pub fn pick_short_name(names: &[String]) -> Option<String> {
    if let Some(short) = names.iter().find(|n| !n.is_empty() && !n.contains('.')) {
        return Some(short.clone());
    }
    names
        .iter()
        .find(|n| !n.is_empty())
        .and_then(|n| n.split('.').next())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Short name from the names a PTR lookup returned, ignoring the root dot.
pub fn short_name_from_ptrs<I>(names: I) -> Option<String>
where
    I: IntoIterator<Item = String>,
{
    let names: Vec<String> = names
        .into_iter()
        .map(|n| n.trim_end_matches('.').to_string())
        .collect();
    pick_short_name(&names)
}

/// Probes real sockets and the system resolver.
#[derive(Clone)]
pub struct SystemNetwork {
    resolver: TokioAsyncResolver,
    mon_timeout: Duration,
    dns_timeout: Duration,
}

impl SystemNetwork {
    pub fn new(mon_timeout: Duration, dns_timeout: Duration) -> Self {
        let (config, mut opts) = match read_system_conf() {
            Ok(conf) => conf,
            Err(e) => {
                tracing::warn!(error = %e, "no system resolver configuration, using defaults");
                (ResolverConfig::default(), ResolverOpts::default())
            }
        };
        opts.timeout = dns_timeout;

        Self {
            resolver: TokioAsyncResolver::tokio(config, opts),
            mon_timeout,
            dns_timeout,
        }
    }
}

#[async_trait]
impl NetworkProbe for SystemNetwork {
    async fn reverse_resolve(&self, ip: &str) -> Option<String> {
        let addr: IpAddr = match ip.parse() {
            Ok(addr) => addr,
            Err(_) => {
                tracing::debug!(ip, "not an IP address, skipping reverse lookup");
                return None;
            }
        };

        match tokio::time::timeout(self.dns_timeout, self.resolver.reverse_lookup(addr)).await {
            Ok(Ok(lookup)) => short_name_from_ptrs(lookup.iter().map(|ptr| ptr.to_string())),
            Ok(Err(e)) => {
                tracing::debug!(ip, error = %e, "reverse lookup failed");
                None
            }
            Err(_) => {
                tracing::debug!(ip, "reverse lookup timed out");
                None
            }
        }
    }

    async fn mon_reachable(&self, mon_addr: &str) -> bool {
        probe_mon(mon_addr, self.mon_timeout).await
    }
}

/// TCP reachability check for a monitor address.
pub async fn probe_mon(mon_addr: &str, timeout: Duration) -> bool {
    let Some((host, port)) = parse_mon_addr(mon_addr) else {
        tracing::debug!(mon_addr, "unparseable monitor address");
        return false;
    };
    if is_ignored_mon_addr(&host) {
        return false;
    }

    let ip: IpAddr = match host.parse() {
        Ok(ip) => ip,
        Err(_) => return false,
    };

    match tokio::time::timeout(timeout, tokio::net::TcpStream::connect((ip, port))).await {
        Ok(Ok(mut stream)) => {
            // A failed shutdown does not make the monitor unreachable.
            if let Err(e) = stream.shutdown().await {
                tracing::trace!(mon_addr, error = %e, "error closing probe socket");
            }
            true
        }
        Ok(Err(e)) => {
            tracing::debug!(mon_addr, error = %e, "monitor connect failed");
            false
        }
        Err(_) => {
            tracing::debug!(mon_addr, "monitor connect timed out");
            false
        }
    }
}
