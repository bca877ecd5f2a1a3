//! Chain-peer health and selection.
//!
//! `PeerHealthManager` owns every peer-related cache: the selected peer and
//! when it was chosen, the deprioritized address set, and (through
//! [`PeerDiscovery`]) memoized DNS results. Calls through the selected peer
//! are raced against a call timeout and fail over to a fresh selection once.

pub mod discovery;
pub mod failover;

pub use discovery::{
    DiscoveryRound, PeerCandidate, PeerDiscovery, PeerTier, ReachabilityProbe, Resolver,
    SystemResolver, TcpProbe,
};
pub use failover::FailoverPeer;

use crate::batch::map_in_batches;
use crate::chain::{ChainPeer, PeerConnector};
use crate::cli::{
    DEFAULT_CALL_TIMEOUT_SECS, DEFAULT_CHAIN_PORT, DEFAULT_DNS_KEEP, DEFAULT_DNS_SEEDS,
    DEFAULT_LAN_HOSTNAME, DEFAULT_PEER_CACHE_TTL_SECS, DEFAULT_PROBE_FANOUT,
    DEFAULT_PROBE_TIMEOUT_MS,
};
use crate::error::{Result, SyncError};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub trusted_peer: Option<String>,
    pub lan_hostname: Option<String>,
    pub dns_seeds: Vec<String>,
    pub chain_port: u16,
    pub probe_timeout: Duration,
    pub call_timeout: Duration,
    /// Lifetime of a peer selection.
    pub cache_ttl: Duration,
    /// Reachable addresses kept per DNS seed.
    pub dns_keep: usize,
    pub probe_fanout: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            trusted_peer: None,
            lan_hostname: Some(DEFAULT_LAN_HOSTNAME.to_string()),
            dns_seeds: DEFAULT_DNS_SEEDS.iter().map(|s| s.to_string()).collect(),
            chain_port: DEFAULT_CHAIN_PORT,
            probe_timeout: Duration::from_millis(DEFAULT_PROBE_TIMEOUT_MS),
            call_timeout: Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS),
            cache_ttl: Duration::from_secs(DEFAULT_PEER_CACHE_TTL_SECS),
            dns_keep: DEFAULT_DNS_KEEP,
            probe_fanout: DEFAULT_PROBE_FANOUT,
        }
    }
}

#[derive(Clone)]
struct SelectedPeer {
    addr: SocketAddr,
    peer: Arc<dyn ChainPeer>,
    selected_at: Instant,
}

#[derive(Default)]
struct PeerState {
    selected: Option<SelectedPeer>,
    deprioritized: HashSet<SocketAddr>,
}

/// Candidate plus the connection used to probe its height.
struct ProbedPeer {
    candidate: PeerCandidate,
    peer: Arc<dyn ChainPeer>,
}

pub struct PeerHealthManager {
    config: PeerConfig,
    discovery: PeerDiscovery,
    connector: Arc<dyn PeerConnector>,
    state: Mutex<PeerState>,
}

impl PeerHealthManager {
    pub fn new(
        config: PeerConfig,
        connector: Arc<dyn PeerConnector>,
        resolver: Arc<dyn Resolver>,
        probe: Arc<dyn ReachabilityProbe>,
    ) -> Self {
        let discovery = PeerDiscovery::new(config.clone(), resolver, probe);
        Self {
            config,
            discovery,
            connector,
            state: Mutex::new(PeerState::default()),
        }
    }

    /// Manager backed by system DNS and TCP reachability probes.
    pub fn with_system_network(config: PeerConfig, connector: Arc<dyn PeerConnector>) -> Self {
        let probe = Arc::new(TcpProbe::new(config.probe_timeout));
        Self::new(config, connector, Arc::new(SystemResolver), probe)
    }

    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    /// Currently selected peer, reselecting when the cached one has expired.
    pub async fn connection(&self) -> Result<(SocketAddr, Arc<dyn ChainPeer>)> {
        if let Some(selected) = self.cached() {
            return Ok((selected.addr, selected.peer));
        }
        self.select().await
    }

    pub fn selected_addr(&self) -> Option<SocketAddr> {
        self.cached().map(|selected| selected.addr)
    }

    /// Drop the cached selection.
    pub fn invalidate(&self) {
        self.state.lock().selected = None;
    }

    /// Forget deprioritized addresses and memoized DNS results.
    pub fn clear_caches(&self) {
        self.state.lock().deprioritized.clear();
        self.discovery.clear_dns_cache();
    }

    pub fn deprioritize(&self, addr: SocketAddr) {
        self.state.lock().deprioritized.insert(addr);
    }

    pub fn is_deprioritized(&self, addr: &SocketAddr) -> bool {
        self.state.lock().deprioritized.contains(addr)
    }

    /// Run `op` against the selected peer under the call timeout. A timeout
    /// or connection-level error invalidates the selection, clears caches,
    /// and retries once against a freshly selected peer.
    pub async fn with_failover<T, F, Fut>(&self, operation: &str, op: F) -> Result<T>
    where
        F: Fn(Arc<dyn ChainPeer>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let (addr, peer) = self.connection().await?;
        let err = match self.call(operation, &op, peer).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_connection_level() => err,
            Err(err) => return Err(err),
        };

        warn!(peer = %addr, operation, error = %err, "chain peer call failed; failing over");
        self.invalidate();
        self.clear_caches();

        let (addr, peer) = self.select().await?;
        debug!(peer = %addr, operation, "retrying on failover peer");
        self.call(operation, &op, peer).await
    }

    async fn call<T, F, Fut>(&self, operation: &str, op: &F, peer: Arc<dyn ChainPeer>) -> Result<T>
    where
        F: Fn(Arc<dyn ChainPeer>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match timeout(self.config.call_timeout, op(peer)).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::timeout(operation, self.config.call_timeout)),
        }
    }

    fn cached(&self) -> Option<SelectedPeer> {
        let mut state = self.state.lock();
        match state.selected.as_ref() {
            Some(selected) if selected.selected_at.elapsed() < self.config.cache_ttl => {
                Some(selected.clone())
            }
            Some(_) => {
                state.selected = None;
                None
            }
            None => None,
        }
    }

    /// Discover candidates and probe their chain heights concurrently.
    /// Failing candidates are deprioritized.
    pub async fn probe_candidates(&self) -> Result<Vec<PeerCandidate>> {
        Ok(self
            .probe_heights()
            .await?
            .into_iter()
            .map(|probed| probed.candidate)
            .collect())
    }

    async fn probe_heights(&self) -> Result<Vec<ProbedPeer>> {
        let excluded = self.state.lock().deprioritized.clone();
        let round = self.discovery.discover(&excluded).await?;
        {
            let mut state = self.state.lock();
            state.deprioritized.extend(round.unreachable.iter().copied());
        }

        let results = map_in_batches(round.candidates, self.config.probe_fanout, |candidate| {
            self.probe_height(candidate)
        })
        .await;

        let mut probed = Vec::new();
        for result in results {
            match result {
                Ok(peer) => probed.push(peer),
                Err((addr, err)) => {
                    debug!(peer = %addr, error = %err, "height probe failed; deprioritizing");
                    self.deprioritize(addr);
                }
            }
        }
        Ok(probed)
    }

    async fn probe_height(
        &self,
        mut candidate: PeerCandidate,
    ) -> std::result::Result<ProbedPeer, (SocketAddr, SyncError)> {
        let addr = candidate.addr;
        let probe = async {
            let peer = self.connector.connect(addr).await?;
            let height = peer.peak_height().await?;
            Ok::<_, SyncError>((peer, height))
        };
        match timeout(self.config.call_timeout, probe).await {
            Ok(Ok((peer, height))) => {
                candidate.peak_height = Some(height);
                Ok(ProbedPeer { candidate, peer })
            }
            Ok(Err(err)) => Err((addr, err)),
            Err(_) => Err((
                addr,
                SyncError::timeout("peak height probe", self.config.call_timeout),
            )),
        }
    }

    async fn select(&self) -> Result<(SocketAddr, Arc<dyn ChainPeer>)> {
        let mut probed = self.probe_heights().await?;
        let candidates: Vec<PeerCandidate> =
            probed.iter().map(|probed| probed.candidate.clone()).collect();
        let index = choose_best(&candidates).ok_or(SyncError::NoPeersAvailable)?;
        let chosen = probed.swap_remove(index);

        let selected = SelectedPeer {
            addr: chosen.candidate.addr,
            peer: chosen.peer,
            selected_at: Instant::now(),
        };
        info!(
            peer = %selected.addr,
            tier = ?chosen.candidate.tier,
            height = chosen.candidate.peak_height,
            "selected chain peer"
        );
        self.state.lock().selected = Some(selected.clone());
        Ok((selected.addr, selected.peer))
    }
}

/// Index of the candidate to use: highest peak height, preferring
/// trusted/loopback/LAN tiers at that height, otherwise random.
pub fn choose_best(candidates: &[PeerCandidate]) -> Option<usize> {
    let max = candidates.iter().filter_map(|c| c.peak_height).max()?;
    let at_max: Vec<usize> = candidates
        .iter()
        .enumerate()
        .filter(|(_, c)| c.peak_height == Some(max))
        .map(|(index, _)| index)
        .collect();
    if let Some(index) = at_max
        .iter()
        .copied()
        .find(|index| candidates[*index].tier.is_preferred())
    {
        return Some(index);
    }
    at_max.choose(&mut rand::thread_rng()).copied()
}
