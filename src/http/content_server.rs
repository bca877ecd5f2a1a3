//! Typed client for a peer's content server.

use super::{https_base_url, HeadResponse, ResilientFetcher};
use crate::error::{Result, SyncError};
use crate::storage::{data_file_relative_path, RootDescriptor, MANIFEST_FILE};
use serde_json::Value;
use std::net::IpAddr;
use std::path::Path;
use tracing::trace;

/// One peer's content server, scoped to a single store.
#[derive(Debug, Clone)]
pub struct ContentServer {
    fetcher: ResilientFetcher,
    base_url: String,
    store_id: String,
}

impl ContentServer {
    pub fn for_peer(fetcher: ResilientFetcher, ip: IpAddr, port: u16, store_id: &str) -> Self {
        Self::with_base_url(fetcher, https_base_url(ip, port), store_id)
    }

    pub fn with_base_url(fetcher: ResilientFetcher, base_url: String, store_id: &str) -> Self {
        Self {
            fetcher,
            base_url: base_url.trim_end_matches('/').to_string(),
            store_id: store_id.to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn store_id(&self) -> &str {
        &self.store_id
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Content of `key` (hex-encoded) under `root_hash`.
    pub async fn get_key(
        &self,
        key: &str,
        root_hash: &str,
        challenge: Option<&str>,
    ) -> Result<Vec<u8>> {
        let mut url = self.url(&format!("/chia.{}.{}/{}", self.store_id, root_hash, key));
        if let Some(challenge) = challenge {
            url.push_str("?challenge=");
            url.push_str(challenge);
        }
        self.fetcher.fetch(&url).await
    }

    pub async fn well_known(&self) -> Result<Value> {
        self.fetcher.fetch_json(&self.url("/.well-known")).await
    }

    pub async fn known_stores(&self) -> Result<Value> {
        self.fetcher.fetch_json(&self.url("/.well-known/stores")).await
    }

    pub async fn store_index(&self) -> Result<Value> {
        self.fetcher.fetch_json(&self.url("/")).await
    }

    /// Key index of the store, optionally pinned to one root.
    pub async fn key_index(&self, root_hash: Option<&str>) -> Result<Value> {
        let path = match root_hash {
            Some(root) => format!("/chia.{}.{}", self.store_id, root),
            None => format!("/chia.{}", self.store_id),
        };
        self.fetcher.fetch_json(&self.url(&path)).await
    }

    pub async fn store_exists(&self) -> Result<bool> {
        let head = self
            .fetcher
            .head(&self.url(&format!("/chia.{}", self.store_id)))
            .await?;
        Ok(head.success)
    }

    /// Whether the peer reports holding `root_hash` for this store.
    pub async fn has_root_hash(&self, root_hash: &str) -> Result<bool> {
        let url = self.url(&format!("/chia.{}?hasRootHash={}", self.store_id, root_hash));
        let head = self.fetcher.head(&url).await?;
        Ok(reports_root(&head))
    }

    /// Whether `key` (hex-encoded) exists under `root_hash`.
    pub async fn has_key(&self, key: &str, root_hash: &str) -> Result<bool> {
        let url = self.url(&format!("/chia.{}.{}/{}", self.store_id, root_hash, key));
        let head = self.fetcher.head(&url).await?;
        Ok(head.success && head.flag("x-key-exists"))
    }

    fn store_file_url(&self, relative: &str) -> String {
        self.url(&format!("/{}/{}", self.store_id, relative))
    }

    pub async fn root_descriptor(&self, root_hash: &str) -> Result<RootDescriptor> {
        let (descriptor, _) = self.root_descriptor_with_bytes(root_hash).await?;
        Ok(descriptor)
    }

    /// Parsed descriptor plus the exact bytes served, for persisting as-is.
    pub async fn root_descriptor_with_bytes(
        &self,
        root_hash: &str,
    ) -> Result<(RootDescriptor, Vec<u8>)> {
        let url = self.store_file_url(&format!("{root_hash}.dat"));
        let body = self.fetcher.fetch(&url).await?;
        let descriptor = RootDescriptor::from_slice(&body)
            .map_err(|err| SyncError::parse(format!("root descriptor {root_hash}"), err))?;
        Ok((descriptor, body))
    }

    /// Raw manifest bytes; newline-delimited root hashes.
    pub async fn manifest(&self) -> Result<Vec<u8>> {
        self.fetcher.fetch(&self.store_file_url(MANIFEST_FILE)).await
    }

    /// Stream the data file for `sha256` into `dest`.
    pub async fn download_data_file(&self, sha256: &str, dest: &Path) -> Result<u64> {
        let relative = data_file_relative_path(sha256)?;
        let url = self.store_file_url(&relative);
        trace!(store_id = %self.store_id, sha256, url, "downloading data file");
        self.fetcher.fetch_to_file(&url, dest).await
    }
}

fn reports_root(head: &HeadResponse) -> bool {
    head.success && (head.flag("x-has-root-hash") || head.flag("x-has-roothash"))
}
