use super::PeerHealthManager;
use crate::chain::{ChainPeer, StoreInfo, StoreSync};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// `ChainPeer` that routes every call through the manager's
/// timeout-and-failover path.
#[derive(Clone)]
pub struct FailoverPeer {
    manager: Arc<PeerHealthManager>,
}

impl FailoverPeer {
    pub fn new(manager: Arc<PeerHealthManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<PeerHealthManager> {
        &self.manager
    }
}

#[async_trait]
impl ChainPeer for FailoverPeer {
    async fn peak_height(&self) -> Result<u64> {
        self.manager
            .with_failover("peak_height", |peer| async move { peer.peak_height().await })
            .await
    }

    async fn header_hash(&self, height: u64) -> Result<String> {
        self.manager
            .with_failover("header_hash", |peer| async move {
                peer.header_hash(height).await
            })
            .await
    }

    async fn is_coin_spent(
        &self,
        coin_id: &str,
        last_height: u64,
        last_hash: &str,
    ) -> Result<bool> {
        self.manager
            .with_failover("is_coin_spent", |peer| async move {
                peer.is_coin_spent(coin_id, last_height, last_hash).await
            })
            .await
    }

    async fn sync_store(
        &self,
        store: &StoreInfo,
        last_height: Option<u64>,
        last_hash: Option<&str>,
    ) -> Result<StoreSync> {
        self.manager
            .with_failover("sync_store", |peer| async move {
                peer.sync_store(store, last_height, last_hash).await
            })
            .await
    }
}
