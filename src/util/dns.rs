//! Destination resolution with a short-lived cache.

use crate::util::{AnyTlsError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io::{Error, ErrorKind};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::lookup_host;
use tracing::{debug, info, trace};
use trust_dns_resolver::TokioAsyncResolver;
use trust_dns_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};

/// TTL for cached entries.
const DEFAULT_TTL: Duration = Duration::from_secs(60);
/// Timeout for a single lookup.
const DNS_TIMEOUT: Duration = Duration::from_secs(10);
/// Cached hostnames kept at most; expired entries are pruned first.
const CACHE_CAPACITY: usize = 4096;

struct CacheEntry {
    ips: Vec<IpAddr>,
    expires_at: Instant,
    next_index: usize,
}

/// Hostname resolver shared by every relay of the node.
///
/// Uses the system resolver unless custom name servers were configured.
/// Cached entries rotate through the returned addresses.
pub struct Resolver {
    upstream: Option<TokioAsyncResolver>,
    cache: RwLock<HashMap<String, CacheEntry>>,
}

impl Resolver {
    /// Resolver backed by the operating system (`getaddrinfo`)
    pub fn system() -> Self {
        Self {
            upstream: None,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolver that queries the given servers over UDP and TCP.
    ///
    /// An empty list falls back to [`Resolver::system`].
    pub fn with_servers(servers: &[String]) -> Result<Self> {
        let mut parsed = Vec::with_capacity(servers.len());
        for raw in servers {
            let socket = parse_dns_server(raw).map_err(|err| {
                AnyTlsError::Config(format!("Invalid DNS server '{}': {}", raw, err))
            })?;
            parsed.push(socket);
        }

        if parsed.is_empty() {
            return Ok(Self::system());
        }

        let mut resolver_config = ResolverConfig::new();
        for server in &parsed {
            resolver_config.add_name_server(NameServerConfig::new(*server, Protocol::Udp));
            resolver_config.add_name_server(NameServerConfig::new(*server, Protocol::Tcp));
        }

        info!(
            "[DNS] Custom DNS servers configured: {}",
            parsed
                .iter()
                .map(|addr| addr.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );

        Ok(Self {
            upstream: Some(TokioAsyncResolver::tokio(
                resolver_config,
                ResolverOpts::default(),
            )),
            cache: RwLock::new(HashMap::new()),
        })
    }

    fn cached(&self, host: &str) -> Option<IpAddr> {
        let mut cache = self.cache.write();
        let entry = cache.get_mut(host)?;
        if Instant::now() > entry.expires_at || entry.ips.is_empty() {
            return None;
        }
        let ip = entry.ips[entry.next_index % entry.ips.len()];
        entry.next_index = entry.next_index.wrapping_add(1);
        trace!("[DNS] Cache hit for {} -> {}", host, ip);
        Some(ip)
    }

    /// Resolve `host:port`. IP literals are returned without a lookup.
    pub async fn resolve(&self, host: &str, port: u16) -> Result<SocketAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, port));
        }

        if let Some(ip) = self.cached(host) {
            return Ok(SocketAddr::new(ip, port));
        }

        let mut ips = self.lookup(host).await?;
        if ips.is_empty() {
            return Err(AnyTlsError::Protocol(format!("No address found for {}", host)));
        }

        // IPv4 first, stable order across lookups
        ips.sort_unstable_by_key(|ip| match ip {
            IpAddr::V4(v4) => (0, v4.octets().to_vec()),
            IpAddr::V6(v6) => (1, v6.octets().to_vec()),
        });

        debug!(
            "[DNS] Resolved {} -> {} entries (ttl={}s)",
            host,
            ips.len(),
            DEFAULT_TTL.as_secs()
        );

        let first = ips[0];
        self.store(host, ips);
        Ok(SocketAddr::new(first, port))
    }

    fn store(&self, host: &str, ips: Vec<IpAddr>) {
        let now = Instant::now();
        let mut cache = self.cache.write();

        if cache.len() >= CACHE_CAPACITY && !cache.contains_key(host) {
            cache.retain(|_, entry| entry.expires_at > now);
            if cache.len() >= CACHE_CAPACITY
                && let Some(oldest) = cache
                    .iter()
                    .min_by_key(|(_, entry)| entry.expires_at)
                    .map(|(key, _)| key.clone())
            {
                cache.remove(&oldest);
            }
            trace!("[DNS] Cache pruned to {} entries", cache.len());
        }

        cache.insert(
            host.to_string(),
            CacheEntry {
                ips,
                expires_at: now + DEFAULT_TTL,
                next_index: 1,
            },
        );
    }

    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>> {
        let timeout_err = || {
            AnyTlsError::Protocol(format!(
                "DNS resolution timeout ({}s) for {}",
                DNS_TIMEOUT.as_secs(),
                host
            ))
        };
        let failed = |err: &dyn std::fmt::Display| {
            AnyTlsError::Io(Error::other(format!(
                "DNS resolution failed for {}: {}",
                host, err
            )))
        };

        match &self.upstream {
            Some(resolver) => {
                let lookup = tokio::time::timeout(DNS_TIMEOUT, resolver.lookup_ip(host))
                    .await
                    .map_err(|_| timeout_err())?
                    .map_err(|err| failed(&err))?;
                Ok(lookup.iter().collect())
            }
            None => {
                let addrs = tokio::time::timeout(DNS_TIMEOUT, lookup_host((host, 0)))
                    .await
                    .map_err(|_| timeout_err())?
                    .map_err(|err| failed(&err))?;
                Ok(addrs.map(|addr| addr.ip()).collect())
            }
        }
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::system()
    }
}

fn parse_dns_server(entry: &str) -> std::io::Result<SocketAddr> {
    let trimmed = entry.trim();
    if trimmed.is_empty() {
        return Err(Error::new(
            ErrorKind::InvalidInput,
            "DNS server address is empty",
        ));
    }

    if let Ok(addr) = trimmed.parse::<SocketAddr>() {
        return Ok(addr);
    }

    if let Ok(ip) = trimmed.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, 53));
    }

    if trimmed.starts_with('[')
        && trimmed.ends_with(']')
        && let Ok(ip) = trimmed[1..trimmed.len() - 1].parse::<IpAddr>()
    {
        return Ok(SocketAddr::new(ip, 53));
    }

    Err(Error::new(
        ErrorKind::InvalidInput,
        format!("invalid DNS server '{}'", entry),
    ))
}
