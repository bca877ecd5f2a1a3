//! Chain-side collaborators and the root-history data model.
//!
//! Blockchain transport, coin-spend logic, epoch sampling, and Merkle proofs
//! live outside this crate; only their interfaces are defined here.

use crate::error::{Result, SyncError};
use crate::storage::RootDescriptor;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;

/// One entry of a store's on-chain root history. The generation index is the
/// entry's position in the history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootHistoryItem {
    pub root_hash: String,
    pub timestamp: u64,
}

/// Generation index of `root_hash`, if it appears in `history`.
pub fn generation_index(history: &[RootHistoryItem], root_hash: &str) -> Option<usize> {
    history.iter().position(|item| item.root_hash == root_hash)
}

/// Chain-anchored state of a store, as tracked by the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreInfo {
    pub launcher_id: String,
    pub coin_id: String,
    pub root_hash: String,
}

/// Result of an incremental store sync against a chain peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSync {
    pub store: StoreInfo,
    pub latest_height: u64,
    pub latest_hash: String,
}

/// Connection to a blockchain full node.
#[async_trait]
pub trait ChainPeer: Send + Sync {
    async fn peak_height(&self) -> Result<u64>;

    async fn header_hash(&self, height: u64) -> Result<String>;

    async fn is_coin_spent(&self, coin_id: &str, last_height: u64, last_hash: &str)
        -> Result<bool>;

    /// Advance `store` from the last known height/hash to the chain tip.
    async fn sync_store(
        &self,
        store: &StoreInfo,
        last_height: Option<u64>,
        last_hash: Option<&str>,
    ) -> Result<StoreSync>;
}

#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(&self, addr: SocketAddr) -> Result<Arc<dyn ChainPeer>>;
}

#[async_trait]
pub trait ChainState: Send + Sync {
    /// Root history in generation order, oldest first.
    async fn root_history(&self, store_id: &str) -> Result<Vec<RootHistoryItem>>;
}

/// Epoch-based content peer sampling.
#[async_trait]
pub trait PeerSampler: Send + Sync {
    async fn sample_peers(&self, count: usize, exclude: &HashSet<IpAddr>) -> Result<Vec<IpAddr>>;
}

/// Proves that a downloaded file matches its declared hash under a root.
#[async_trait]
pub trait IntegrityVerifier: Send + Sync {
    async fn verify(
        &self,
        key: &str,
        sha256: &str,
        descriptor: &RootDescriptor,
        root_hash: &str,
        data_dir: &Path,
    ) -> Result<bool>;
}

/// Opaque serialization of [`StoreInfo`].
pub trait StoreCodec: Send + Sync {
    fn serialize(&self, store: &StoreInfo) -> Result<Vec<u8>>;
    fn deserialize(&self, bytes: &[u8]) -> Result<StoreInfo>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonStoreCodec;

impl StoreCodec for JsonStoreCodec {
    fn serialize(&self, store: &StoreInfo) -> Result<Vec<u8>> {
        serde_json::to_vec(store).map_err(|err| SyncError::parse("store info", err))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<StoreInfo> {
        serde_json::from_slice(bytes).map_err(|err| SyncError::parse("store info", err))
    }
}
