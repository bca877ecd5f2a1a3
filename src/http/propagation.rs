//! Client for a peer's propagation (upload) server.

use super::{https_base_url, Payload, ResilientFetcher};
use crate::error::{Result, SyncError};
use crate::storage::{parse_manifest, MANIFEST_FILE};
use serde::Deserialize;
use std::net::IpAddr;

/// Last generation a peer accepted for a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStoreStatus {
    /// `None` when the peer does not hold the store yet.
    pub last_root_hash: Option<String>,
    /// `-1` when the peer does not hold the store yet.
    pub generation_index: i64,
}

impl RemoteStoreStatus {
    pub fn absent() -> Self {
        Self {
            last_root_hash: None,
            generation_index: -1,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadSession {
    session_id: String,
}

#[derive(Debug, Clone)]
pub struct PropagationServer {
    fetcher: ResilientFetcher,
    base_url: String,
}

impl PropagationServer {
    pub fn for_peer(fetcher: ResilientFetcher, ip: IpAddr, port: u16) -> Self {
        Self::with_base_url(fetcher, https_base_url(ip, port))
    }

    pub fn with_base_url(fetcher: ResilientFetcher, base_url: String) -> Self {
        Self {
            fetcher,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn store_status(&self, store_id: &str) -> Result<RemoteStoreStatus> {
        let url = self.url(&format!("/{store_id}"));
        let head = self.fetcher.head(&url).await?;
        if !head.success {
            return Ok(RemoteStoreStatus::absent());
        }
        let generation_index = match head.header("x-generation-index") {
            Some(raw) => raw
                .trim()
                .parse::<i64>()
                .map_err(|err| SyncError::parse("x-generation-index", err))?,
            None => -1,
        };
        let last_root_hash = head
            .header("x-generation-hash")
            .map(str::trim)
            .filter(|hash| !hash.is_empty())
            .map(str::to_string);
        Ok(RemoteStoreStatus {
            last_root_hash,
            generation_index,
        })
    }

    /// Remote manifest entries; a missing manifest is empty.
    pub async fn manifest(&self, store_id: &str) -> Result<Vec<String>> {
        let url = self.url(&format!("/{store_id}/{MANIFEST_FILE}"));
        match self.fetcher.fetch(&url).await {
            Ok(body) => Ok(parse_manifest(&String::from_utf8_lossy(&body))),
            Err(SyncError::Network {
                status: Some(404), ..
            }) => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }

    pub async fn start_upload(&self, store_id: &str) -> Result<String> {
        let url = self.url(&format!("/upload/{store_id}"));
        let body = self.fetcher.post(&url, None).await?;
        let session: UploadSession =
            serde_json::from_slice(&body).map_err(|err| SyncError::parse(url.as_str(), err))?;
        Ok(session.session_id)
    }

    pub async fn upload_file(
        &self,
        store_id: &str,
        session_id: &str,
        relative: &str,
        body: impl Into<Payload>,
    ) -> Result<()> {
        let url = self.url(&format!("/upload/{store_id}/{session_id}/{relative}"));
        self.fetcher.put(&url, body.into()).await
    }

    pub async fn commit(&self, store_id: &str, session_id: &str) -> Result<()> {
        let url = self.url(&format!("/commit/{store_id}/{session_id}"));
        self.fetcher.post(&url, None).await.map(|_| ())
    }

    pub async fn abort(&self, store_id: &str, session_id: &str) -> Result<()> {
        let url = self.url(&format!("/abort/{store_id}/{session_id}"));
        self.fetcher.post(&url, None).await.map(|_| ())
    }
}
