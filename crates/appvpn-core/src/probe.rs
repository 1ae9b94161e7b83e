//! Proxy Reachability Probe
//!
//! Bounded-time TCP connect checks against the proxy endpoint, used both as
//! the startup preflight and as the recurring health check while connected.
//!
//! # Budget
//!
//! The host is resolved to every candidate address and the total budget is
//! split evenly across them, with a floor per attempt, so one blackholed
//! address cannot eat the whole budget:
//!
//! ```text
//! per_attempt = max(budget / addresses, floor)
//! ```
//!
//! Time spent resolving comes out of the same budget. If resolution yields
//! nothing, a single attempt with the unresolved name gets what is left.

use crate::config::TunnelTimings;
use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Default per-attempt floor
const DEFAULT_ATTEMPT_FLOOR: Duration = Duration::from_millis(500);

/// Reachability check seam
#[async_trait]
pub trait Probe: Send + Sync {
    /// True when a TCP connection to `host:port` succeeds within `budget`
    async fn probe(&self, host: &str, port: u16, budget: Duration) -> bool;
}

/// TCP connect prober backed by the hickory resolver
pub struct TcpProber {
    resolver: TokioAsyncResolver,
    attempt_floor: Duration,
}

impl TcpProber {
    /// Create a prober using the system resolver configuration
    pub fn new() -> Self {
        let resolver = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|e| {
            warn!("System DNS config unavailable ({}), using Cloudflare", e);
            TokioAsyncResolver::tokio(ResolverConfig::cloudflare(), ResolverOpts::default())
        });

        Self {
            resolver,
            attempt_floor: DEFAULT_ATTEMPT_FLOOR,
        }
    }

    /// Prober using the configured per-attempt floor
    pub fn from_timings(timings: &TunnelTimings) -> Self {
        Self::new().with_attempt_floor(timings.attempt_floor())
    }

    /// Override the per-attempt floor
    pub fn with_attempt_floor(mut self, floor: Duration) -> Self {
        self.attempt_floor = floor;
        self
    }

    /// Resolve to all candidate addresses; empty on failure
    async fn resolve(&self, host: &str, budget: Duration) -> Vec<IpAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return vec![ip];
        }

        match tokio::time::timeout(budget, self.resolver.lookup_ip(host)).await {
            Ok(Ok(lookup)) => lookup.iter().collect(),
            Ok(Err(e)) => {
                warn!("DNS resolve failed for {}: {}", host, e);
                Vec::new()
            }
            Err(_) => {
                warn!("DNS resolve timed out for {}", host);
                Vec::new()
            }
        }
    }
}

impl Default for TcpProber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Probe for TcpProber {
    async fn probe(&self, host: &str, port: u16, budget: Duration) -> bool {
        debug!("Probe: try TCP {}:{} (budget={:?})", host, port, budget);

        let started = Instant::now();
        let addrs = self.resolve(host, budget).await;
        let remaining = budget.saturating_sub(started.elapsed());

        if addrs.is_empty() {
            // Let the system resolver have a go within what is left
            let reachable = connect_within((host, port), remaining).await;
            debug!("Probe: fallback {}:{} -> {}", host, port, reachable);
            return reachable;
        }

        let per_attempt = per_attempt_budget(remaining, addrs.len(), self.attempt_floor);
        for addr in addrs {
            if connect_within(SocketAddr::new(addr, port), per_attempt).await {
                debug!("Probe: success via {}", addr);
                return true;
            }
            debug!("Probe: attempt failed via {}", addr);
        }

        info!("Probe: all attempts failed to {}:{}", host, port);
        false
    }
}

/// Time given to each of `candidates` addresses
pub fn per_attempt_budget(budget: Duration, candidates: usize, floor: Duration) -> Duration {
    let divisor = u32::try_from(candidates.max(1)).unwrap_or(u32::MAX);
    (budget / divisor).max(floor)
}

async fn connect_within<A>(addr: A, limit: Duration) -> bool
where
    A: tokio::net::ToSocketAddrs,
{
    matches!(
        tokio::time::timeout(limit, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}
