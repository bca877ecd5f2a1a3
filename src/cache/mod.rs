//! Background refresh of cached chain state for tracked stores.
//!
//! Every tick takes the cache directory's advisory lock without blocking.
//! A contended tick does nothing. Otherwise each cached store is advanced
//! to the chain tip independently, and the whole update is bounded by the
//! refresh interval so the lock is never held past it.

pub mod lock;

pub use lock::{AdvisoryLock, LockGuard, LockHolder};

use crate::chain::{ChainPeer, StoreCodec, StoreInfo};
use crate::cli::{DEFAULT_CACHE_DIR, DEFAULT_REFRESH_INTERVAL_SECS};
use crate::error::{Result, SyncError};
use crate::storage::write_atomic;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn, Instrument};

const ENTRY_EXTENSION: &str = "json";

#[derive(Debug, Clone)]
pub struct RefreshConfig {
    pub cache_dir: PathBuf,
    pub interval: Duration,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
            interval: Duration::from_secs(DEFAULT_REFRESH_INTERVAL_SECS),
        }
    }
}

/// Last-known chain state of one store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedStoreState {
    /// Hex of the codec's serialized store info.
    pub serialized_store_info: String,
    pub latest_height: u64,
    pub latest_hash: String,
}

/// `{cache_dir}/{store_id}.json` entries.
#[derive(Debug, Clone)]
pub struct CacheStore {
    dir: PathBuf,
}

impl CacheStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, store_id: &str) -> PathBuf {
        self.dir.join(format!("{store_id}.{ENTRY_EXTENSION}"))
    }

    /// Store ids with a cache entry, sorted.
    pub fn keys(&self) -> Result<Vec<String>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut keys = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(ENTRY_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                keys.push(stem.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }

    pub async fn load(&self, store_id: &str) -> Result<CachedStoreState> {
        let bytes = tokio::fs::read(self.entry_path(store_id)).await?;
        serde_json::from_slice(&bytes)
            .map_err(|err| SyncError::parse(format!("cache entry {store_id}"), err))
    }

    pub async fn save(&self, store_id: &str, state: &CachedStoreState) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(state)
            .map_err(|err| SyncError::parse(format!("cache entry {store_id}"), err))?;
        write_atomic(&self.entry_path(store_id), &bytes).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Another holder has the lock; nothing was touched.
    Contended,
    Refreshed { updated: usize, failed: usize },
}

pub struct CacheRefresher {
    config: RefreshConfig,
    cache: CacheStore,
    lock: AdvisoryLock,
    chain: Arc<dyn ChainPeer>,
    codec: Arc<dyn StoreCodec>,
}

impl CacheRefresher {
    /// `chain` is normally a [`crate::peers::FailoverPeer`] so each call is
    /// timeout-bounded.
    pub fn new(
        config: RefreshConfig,
        chain: Arc<dyn ChainPeer>,
        codec: Arc<dyn StoreCodec>,
    ) -> Self {
        let cache = CacheStore::new(config.cache_dir.clone());
        let lock = AdvisoryLock::in_dir(&config.cache_dir);
        Self {
            config,
            cache,
            lock,
            chain,
            codec,
        }
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    /// Record a store for tracking from its current chain state.
    pub async fn track(
        &self,
        store_id: &str,
        store: &StoreInfo,
        latest_height: u64,
        latest_hash: &str,
    ) -> Result<()> {
        let state = CachedStoreState {
            serialized_store_info: hex::encode(self.codec.serialize(store)?),
            latest_height,
            latest_hash: latest_hash.to_string(),
        };
        self.cache.save(store_id, &state).await
    }

    /// One tick: skip when contended, otherwise refresh every entry.
    pub async fn refresh_once(&self) -> Result<RefreshOutcome> {
        let Some(guard) = self.lock.try_acquire()? else {
            debug!(holder = ?self.lock.holder(), "refresh lock held elsewhere; skipping tick");
            return Ok(RefreshOutcome::Contended);
        };

        let span = tracing::debug_span!("refresh_tick", pid = guard.holder().pid);
        let result = timeout(self.config.interval, self.refresh_all().instrument(span)).await;
        drop(guard);
        match result {
            Ok(outcome) => outcome,
            Err(_) => Err(SyncError::timeout("cache refresh", self.config.interval)),
        }
    }

    async fn refresh_all(&self) -> Result<RefreshOutcome> {
        let keys = self.cache.keys()?;
        let mut updated = 0;
        let mut failed = 0;
        for key in keys {
            match self.refresh_key(&key).await {
                Ok(height) => {
                    debug!(store_id = %key, height, "cache entry refreshed");
                    updated += 1;
                }
                Err(err) => {
                    warn!(store_id = %key, error = %err, "cache entry refresh failed");
                    failed += 1;
                }
            }
        }
        Ok(RefreshOutcome::Refreshed { updated, failed })
    }

    async fn refresh_key(&self, store_id: &str) -> Result<u64> {
        let state = self.cache.load(store_id).await?;
        let bytes = hex::decode(&state.serialized_store_info)
            .map_err(|err| SyncError::parse(format!("cache entry {store_id}"), err))?;
        let store = self.codec.deserialize(&bytes)?;

        let synced = self
            .chain
            .sync_store(&store, Some(state.latest_height), Some(&state.latest_hash))
            .await?;

        let next = CachedStoreState {
            serialized_store_info: hex::encode(self.codec.serialize(&synced.store)?),
            latest_height: synced.latest_height,
            latest_hash: synced.latest_hash,
        };
        self.cache.save(store_id, &next).await?;
        Ok(next.latest_height)
    }

    /// Spawn the interval loop. The first tick runs immediately.
    pub fn start(self: Arc<Self>) -> RefresherHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let interval = self.config.interval;
        let handle = tokio::spawn(async move {
            loop {
                if *stop_rx.borrow() {
                    break;
                }
                tokio::select! {
                    result = self.refresh_once() => match result {
                        Ok(outcome) => debug!(?outcome, "refresh tick finished"),
                        Err(err) => warn!(error = %err, "refresh tick failed"),
                    },
                    _ = stop_rx.changed() => break,
                }
                tokio::select! {
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                    }
                    _ = sleep(interval) => {}
                }
            }
            info!("cache refresher stopped");
        });
        RefresherHandle { handle, stop_tx }
    }
}

/// Running refresher. Dropping the handle also ends the loop.
pub struct RefresherHandle {
    handle: JoinHandle<()>,
    stop_tx: watch::Sender<bool>,
}

impl RefresherHandle {
    /// Signal the loop and wait for it. An in-flight update is abandoned,
    /// which releases the lock.
    pub async fn stop(self) -> std::result::Result<(), JoinError> {
        let _ = self.stop_tx.send(true);
        self.handle.await
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
