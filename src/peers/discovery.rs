//! Tiered chain-peer discovery.
//!
//! Tiers are tried in order and the first one yielding a reachable address
//! wins: a configured trusted IPv4 address, loopback, a LAN hostname, and
//! finally the DNS seeds. Reachability is a bare TCP connect.

use super::PeerConfig;
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

const DNS_CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerTier {
    Trusted,
    Loopback,
    Lan,
    Dns,
}

impl PeerTier {
    /// Tiers preferred when heights tie.
    pub fn is_preferred(self) -> bool {
        !matches!(self, PeerTier::Dns)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCandidate {
    pub addr: SocketAddr,
    pub tier: PeerTier,
    pub reachable: bool,
    pub peak_height: Option<u64>,
}

impl PeerCandidate {
    fn reachable(addr: SocketAddr, tier: PeerTier) -> Self {
        Self {
            addr,
            tier,
            reachable: true,
            peak_height: None,
        }
    }
}

#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>> {
        let addrs = tokio::net::lookup_host((host, port))
            .await
            .map_err(|err| SyncError::network(host, err))?;
        Ok(addrs.collect())
    }
}

#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn is_reachable(&self, addr: SocketAddr) -> bool;
}

/// TCP connect probe; the stream is dropped immediately.
#[derive(Debug, Clone, Copy)]
pub struct TcpProbe {
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ReachabilityProbe for TcpProbe {
    async fn is_reachable(&self, addr: SocketAddr) -> bool {
        matches!(
            timeout(self.timeout, TcpStream::connect(addr)).await,
            Ok(Ok(_))
        )
    }
}

/// Outcome of one discovery pass.
#[derive(Debug, Default)]
pub struct DiscoveryRound {
    pub candidates: Vec<PeerCandidate>,
    /// Addresses that failed the reachability probe.
    pub unreachable: Vec<SocketAddr>,
}

pub struct PeerDiscovery {
    config: PeerConfig,
    resolver: Arc<dyn Resolver>,
    probe: Arc<dyn ReachabilityProbe>,
    dns_cache: Mutex<HashMap<String, (Instant, Vec<SocketAddr>)>>,
}

impl PeerDiscovery {
    pub fn new(
        config: PeerConfig,
        resolver: Arc<dyn Resolver>,
        probe: Arc<dyn ReachabilityProbe>,
    ) -> Self {
        Self {
            config,
            resolver,
            probe,
            dns_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn clear_dns_cache(&self) {
        self.dns_cache.lock().clear();
    }

    /// Run the tiers in order, skipping `excluded` addresses.
    pub async fn discover(&self, excluded: &HashSet<SocketAddr>) -> Result<DiscoveryRound> {
        let mut round = DiscoveryRound::default();
        let port = self.config.chain_port;

        if let Some(trusted) = self.config.trusted_peer.as_deref() {
            match trusted.trim().parse::<Ipv4Addr>() {
                Ok(ip) => {
                    let addr = SocketAddr::new(IpAddr::V4(ip), port);
                    if self.try_single(addr, excluded, &mut round).await {
                        round
                            .candidates
                            .push(PeerCandidate::reachable(addr, PeerTier::Trusted));
                        return Ok(round);
                    }
                }
                Err(_) => warn!(trusted, "trusted peer is not an IPv4 address; ignoring"),
            }
        }

        let loopback = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        if self.try_single(loopback, excluded, &mut round).await {
            round
                .candidates
                .push(PeerCandidate::reachable(loopback, PeerTier::Loopback));
            return Ok(round);
        }

        if let Some(host) = self.config.lan_hostname.as_deref() {
            let addrs = self.resolve_cached(host).await;
            for addr in addrs {
                if self.try_single(addr, excluded, &mut round).await {
                    round
                        .candidates
                        .push(PeerCandidate::reachable(addr, PeerTier::Lan));
                }
            }
            if !round.candidates.is_empty() {
                return Ok(round);
            }
        }

        for seed in &self.config.dns_seeds {
            let mut addrs: Vec<SocketAddr> = self
                .resolve_cached(seed)
                .await
                .into_iter()
                .filter(|addr| !excluded.contains(addr))
                .collect();
            addrs.shuffle(&mut rand::thread_rng());

            let reachable = self.probe_until(addrs, &mut round).await;
            if !reachable.is_empty() {
                debug!(seed, count = reachable.len(), "dns seed yielded reachable peers");
                round.candidates.extend(
                    reachable
                        .into_iter()
                        .map(|addr| PeerCandidate::reachable(addr, PeerTier::Dns)),
                );
                return Ok(round);
            }
            trace!(seed, "dns seed yielded no reachable peers");
        }

        Err(SyncError::NoPeersAvailable)
    }

    async fn try_single(
        &self,
        addr: SocketAddr,
        excluded: &HashSet<SocketAddr>,
        round: &mut DiscoveryRound,
    ) -> bool {
        if excluded.contains(&addr) {
            return false;
        }
        if self.probe.is_reachable(addr).await {
            true
        } else {
            round.unreachable.push(addr);
            false
        }
    }

    /// Probe `addrs` in fan-out sized chunks until `dns_keep` answer.
    async fn probe_until(
        &self,
        addrs: Vec<SocketAddr>,
        round: &mut DiscoveryRound,
    ) -> Vec<SocketAddr> {
        let keep = self.config.dns_keep.max(1);
        let mut reachable = Vec::new();
        for chunk in addrs.chunks(self.config.probe_fanout.max(1)) {
            let results = join_all(chunk.iter().map(|addr| self.probe.is_reachable(*addr))).await;
            for (addr, ok) in chunk.iter().zip(results) {
                if !ok {
                    round.unreachable.push(*addr);
                } else if reachable.len() < keep {
                    reachable.push(*addr);
                }
            }
            if reachable.len() >= keep {
                break;
            }
        }
        reachable
    }

    async fn resolve_cached(&self, host: &str) -> Vec<SocketAddr> {
        let cached = self
            .dns_cache
            .lock()
            .get(host)
            .filter(|(at, _)| at.elapsed() < DNS_CACHE_TTL)
            .map(|(_, addrs)| addrs.clone());
        if let Some(addrs) = cached {
            return addrs;
        }
        match self.resolver.resolve(host, self.config.chain_port).await {
            Ok(addrs) => {
                self.dns_cache
                    .lock()
                    .insert(host.to_string(), (Instant::now(), addrs.clone()));
                addrs
            }
            Err(err) => {
                debug!(host, error = %err, "resolution failed");
                Vec::new()
            }
        }
    }
}
