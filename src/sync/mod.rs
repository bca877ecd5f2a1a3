//! Store synchronization.
//!
//! One `sync_store` call walks the on-chain root history of a store, picks
//! the newest root that is not on disk yet, finds a content peer that holds
//! it, and downloads and verifies every file before persisting the root
//! descriptor. Older missing roots are left for later calls.

pub mod blacklist;
pub mod upload;

pub use blacklist::Blacklist;
pub use upload::{StoreUploader, UploadOutcome, UploadReport};

use crate::batch::map_in_batches;
use crate::chain::{ChainPeer, ChainState, IntegrityVerifier, PeerSampler, RootHistoryItem};
use crate::cli::{
    DEFAULT_CONTENT_PORT, DEFAULT_DATA_DIR, DEFAULT_PEER_SAMPLE_SIZE, DEFAULT_PROPAGATION_PORT,
};
use crate::error::{Result, SyncError};
use crate::http::content_server::ContentServer;
use crate::http::{HttpsEndpoints, PeerEndpoints, ResilientFetcher};
use crate::storage::{parse_manifest, HeightPointer, RootDescriptor, StoreDirectory};
use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub data_dir: PathBuf,
    pub content_port: u16,
    pub propagation_port: u16,
    /// Content peers requested from the sampler per selection round.
    pub peer_sample_size: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            content_port: DEFAULT_CONTENT_PORT,
            propagation_port: DEFAULT_PROPAGATION_PORT,
            peer_sample_size: DEFAULT_PEER_SAMPLE_SIZE,
        }
    }
}

impl OrchestratorConfig {
    pub fn endpoints(&self) -> HttpsEndpoints {
        HttpsEndpoints {
            content_port: self.content_port,
            propagation_port: self.propagation_port,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Hex-encoded key the chosen peer must also report holding.
    pub required_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    FetchingHeightPointer,
    SelectingRootsToSync,
    SelectingPeer,
    DownloadingRootDescriptor,
    VerifyingFiles,
    PersistingRoot,
    FetchingManifest,
    Complete,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::FetchingHeightPointer => "fetching_height_pointer",
            Self::SelectingRootsToSync => "selecting_roots",
            Self::SelectingPeer => "selecting_peer",
            Self::DownloadingRootDescriptor => "downloading_root_descriptor",
            Self::VerifyingFiles => "verifying_files",
            Self::PersistingRoot => "persisting_root",
            Self::FetchingManifest => "fetching_manifest",
            Self::Complete => "complete",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Every on-chain root is already on disk.
    UpToDate { latest_root: Option<String> },
    Synced {
        root_hash: String,
        peer: IpAddr,
        files: usize,
        /// Older missing roots left for later calls.
        deferred: usize,
    },
}

/// Root chosen for this invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootSelection {
    pub item: RootHistoryItem,
    pub deferred: usize,
}

/// Newest root (by timestamp, then generation) for which `is_local` is false.
pub fn select_root_to_sync(
    history: &[RootHistoryItem],
    is_local: impl Fn(&str) -> bool,
) -> Option<RootSelection> {
    let mut missing: Vec<(usize, &RootHistoryItem)> = history
        .iter()
        .enumerate()
        .filter(|(_, item)| !is_local(&item.root_hash))
        .collect();
    missing.sort_by(|(ia, a), (ib, b)| b.timestamp.cmp(&a.timestamp).then(ib.cmp(ia)));
    let deferred = missing.len().saturating_sub(1);
    missing.first().map(|(_, item)| RootSelection {
        item: (*item).clone(),
        deferred,
    })
}

/// True when `manifest` is a prefix of the root history.
pub fn manifest_is_prefix(manifest: &[String], history: &[RootHistoryItem]) -> bool {
    manifest.len() <= history.len()
        && manifest
            .iter()
            .zip(history)
            .all(|(entry, item)| *entry == item.root_hash)
}

pub struct StoreSyncOrchestrator {
    config: OrchestratorConfig,
    fetcher: ResilientFetcher,
    chain: Arc<dyn ChainPeer>,
    chain_state: Arc<dyn ChainState>,
    sampler: Arc<dyn PeerSampler>,
    verifier: Arc<dyn IntegrityVerifier>,
    endpoints: Arc<dyn PeerEndpoints>,
}

impl StoreSyncOrchestrator {
    /// `chain` is normally a [`crate::peers::FailoverPeer`].
    pub fn new(
        config: OrchestratorConfig,
        fetcher: ResilientFetcher,
        chain: Arc<dyn ChainPeer>,
        chain_state: Arc<dyn ChainState>,
        sampler: Arc<dyn PeerSampler>,
        verifier: Arc<dyn IntegrityVerifier>,
    ) -> Self {
        let endpoints = Arc::new(config.endpoints());
        Self {
            config,
            fetcher,
            chain,
            chain_state,
            sampler,
            verifier,
            endpoints,
        }
    }

    pub fn with_endpoints(mut self, endpoints: Arc<dyn PeerEndpoints>) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn store_directory(&self, store_id: &str) -> StoreDirectory {
        StoreDirectory::new(&self.config.data_dir, store_id)
    }

    pub async fn sync_store(&self, store_id: &str, options: &SyncOptions) -> Result<SyncOutcome> {
        let span = tracing::info_span!("sync_store", store_id);
        self.sync_store_inner(store_id, options).instrument(span).await
    }

    async fn sync_store_inner(&self, store_id: &str, options: &SyncOptions) -> Result<SyncOutcome> {
        let store = self.store_directory(store_id);

        phase(SyncPhase::FetchingHeightPointer);
        let height = self.chain.peak_height().await?;
        let hash = self.chain.header_hash(height).await?;
        store.write_height(&HeightPointer { height, hash }).await?;

        phase(SyncPhase::SelectingRootsToSync);
        let history = self.chain_state.root_history(store_id).await?;
        let Some(selection) = select_root_to_sync(&history, |root| store.has_root(root)) else {
            let latest_root = history.last().map(|item| item.root_hash.clone());
            debug!(roots = history.len(), "all roots present locally");
            return Ok(SyncOutcome::UpToDate { latest_root });
        };
        let root_hash = selection.item.root_hash.clone();
        if selection.deferred > 0 {
            debug!(
                root_hash,
                deferred = selection.deferred,
                "deferring older missing roots"
            );
        }

        // Failed peers are only excluded for the rest of this run.
        let mut blacklist = Blacklist::default();
        let span = tracing::debug_span!("sync_root", root_hash = %root_hash);
        let (peer, server, files) = self
            .sync_root(store_id, &store, &root_hash, options, &mut blacklist)
            .instrument(span)
            .await?;

        phase(SyncPhase::FetchingManifest);
        self.refresh_manifest(&server, &store, &history).await;

        phase(SyncPhase::Complete);
        info!(
            root_hash,
            peer = %peer,
            files,
            deferred = selection.deferred,
            "store root synchronized"
        );
        Ok(SyncOutcome::Synced {
            root_hash,
            peer,
            files,
            deferred: selection.deferred,
        })
    }

    /// Select a peer and download `root_hash`, moving on to another peer
    /// whenever the current one serves bad or unreachable data.
    async fn sync_root(
        &self,
        store_id: &str,
        store: &StoreDirectory,
        root_hash: &str,
        options: &SyncOptions,
        blacklist: &mut Blacklist,
    ) -> Result<(IpAddr, ContentServer, usize)> {
        let mut last_failure = None;
        loop {
            phase(SyncPhase::SelectingPeer);
            let (peer, server) = match self
                .find_peer(store_id, root_hash, options.required_key.as_deref(), blacklist)
                .await
            {
                Ok(found) => found,
                // Surface the last peer fault rather than the exhaustion.
                Err(err @ SyncError::PeersExhausted { .. }) => {
                    return Err(last_failure.unwrap_or(err));
                }
                Err(err) => return Err(err),
            };

            match self.download_root(&server, store, root_hash).await {
                Ok(files) => return Ok((peer, server, files)),
                Err(err) if is_peer_fault(&err) => {
                    warn!(peer = %peer, root_hash, error = %err, "peer failed root download; blacklisting");
                    blacklist.add(store_id, peer);
                    last_failure = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// First sampled peer that reports holding `root_hash` (and
    /// `required_key`, if any). Failing peers are blacklisted for the root.
    async fn find_peer(
        &self,
        store_id: &str,
        root_hash: &str,
        required_key: Option<&str>,
        blacklist: &mut Blacklist,
    ) -> Result<(IpAddr, ContentServer)> {
        loop {
            let mut exclude = blacklist.peers(root_hash);
            exclude.extend(blacklist.peers(store_id));
            let sampled = self
                .sampler
                .sample_peers(self.config.peer_sample_size, &exclude)
                .await?;
            let mut seen = HashSet::new();
            let fresh: Vec<IpAddr> = sampled
                .into_iter()
                .filter(|ip| !exclude.contains(ip) && seen.insert(*ip))
                .collect();
            if fresh.is_empty() {
                return Err(SyncError::PeersExhausted {
                    resource: format!("{store_id}/{root_hash}"),
                });
            }

            let probes = map_in_batches(fresh, self.config.peer_sample_size, |ip| {
                let server = self.content_server(ip, store_id);
                async move {
                    let result = probe_peer(&server, root_hash, required_key).await;
                    (ip, server, result)
                }
            })
            .await;

            let mut chosen = None;
            for (ip, server, result) in probes {
                match result {
                    Ok(true) if chosen.is_none() => chosen = Some((ip, server)),
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(peer = %ip, root_hash, "peer does not hold root");
                        blacklist.add(root_hash, ip);
                    }
                    Err(err) => {
                        debug!(peer = %ip, root_hash, error = %err, "peer probe failed");
                        blacklist.add(root_hash, ip);
                    }
                }
            }
            if let Some(found) = chosen {
                return Ok(found);
            }
        }
    }

    fn content_server(&self, ip: IpAddr, store_id: &str) -> ContentServer {
        ContentServer::with_base_url(
            self.fetcher.clone(),
            self.endpoints.content_url(ip),
            store_id,
        )
    }

    /// Download the descriptor and every file it references, verifying each
    /// file before moving on. The descriptor is persisted last.
    async fn download_root(
        &self,
        server: &ContentServer,
        store: &StoreDirectory,
        root_hash: &str,
    ) -> Result<usize> {
        phase(SyncPhase::DownloadingRootDescriptor);
        let (descriptor, raw) = server.root_descriptor_with_bytes(root_hash).await?;

        phase(SyncPhase::VerifyingFiles);
        for (key, entry) in &descriptor.files {
            self.fetch_verified(server, store, &descriptor, root_hash, key, &entry.sha256)
                .await?;
        }

        phase(SyncPhase::PersistingRoot);
        store.write_root_descriptor_bytes(root_hash, &raw).await?;
        Ok(descriptor.files.len())
    }

    async fn fetch_verified(
        &self,
        server: &ContentServer,
        store: &StoreDirectory,
        descriptor: &RootDescriptor,
        root_hash: &str,
        key: &str,
        sha256: &str,
    ) -> Result<()> {
        let dest = store.data_file_path(sha256)?;
        if dest.is_file()
            && self
                .verifier
                .verify(key, sha256, descriptor, root_hash, store.path())
                .await?
        {
            debug!(key, sha256, "data file already present");
            return Ok(());
        }

        server.download_data_file(sha256, &dest).await?;
        let verified = self
            .verifier
            .verify(key, sha256, descriptor, root_hash, store.path())
            .await;
        if matches!(verified, Ok(true)) {
            return Ok(());
        }

        // Nothing unverified stays at a content-addressed path.
        store.remove_data_file(sha256).await?;
        verified?;
        Err(SyncError::IntegrityVerificationFailed {
            key: key.to_string(),
            sha256: sha256.to_string(),
            root_hash: root_hash.to_string(),
        })
    }

    /// Replace the local manifest with the peer's when it is a prefix of the
    /// on-chain history. Failures are logged; the root itself is already
    /// persisted.
    async fn refresh_manifest(
        &self,
        server: &ContentServer,
        store: &StoreDirectory,
        history: &[RootHistoryItem],
    ) {
        let bytes = match server.manifest().await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(error = %err, "failed to fetch manifest");
                return;
            }
        };
        let entries = parse_manifest(&String::from_utf8_lossy(&bytes));
        if !manifest_is_prefix(&entries, history) {
            warn!(
                entries = entries.len(),
                roots = history.len(),
                "manifest is not a prefix of on-chain root history; keeping local copy"
            );
            return;
        }
        if let Err(err) = store.write_manifest(&bytes).await {
            warn!(error = %err, "failed to write manifest");
        }
    }
}

async fn probe_peer(
    server: &ContentServer,
    root_hash: &str,
    required_key: Option<&str>,
) -> Result<bool> {
    if !server.has_root_hash(root_hash).await? {
        return Ok(false);
    }
    match required_key {
        Some(key) => server.has_key(key, root_hash).await,
        None => Ok(true),
    }
}

/// Errors attributable to the serving peer rather than local state.
fn is_peer_fault(err: &SyncError) -> bool {
    matches!(
        err,
        SyncError::IntegrityVerificationFailed { .. }
            | SyncError::Network { .. }
            | SyncError::Timeout { .. }
            | SyncError::RedirectLimitExceeded { .. }
            | SyncError::Parse { .. }
    )
}

fn phase(phase: SyncPhase) {
    debug!(%phase, "sync phase");
}
