//! Outbound propagation of a store's newest generation.
//!
//! The uploader is the source of truth, so nothing here is verified against
//! a commitment. What is checked is that the target peer is exactly one
//! generation behind and agrees with the on-chain history up to that point.

use super::Blacklist;
use crate::batch::map_in_batches;
use crate::chain::{ChainState, RootHistoryItem};
use crate::error::{ConsistencyError, Result, SyncError};
use crate::http::propagation::{PropagationServer, RemoteStoreStatus};
use crate::http::{Payload, PeerEndpoints, ResilientFetcher};
use crate::storage::{
    data_file_relative_path, render_manifest, RootDescriptor, StoreDirectory, MANIFEST_FILE,
};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Uploaded {
        root_hash: String,
        files: usize,
    },
    /// Transfer failed; the session was aborted.
    PeerFailed { peer: IpAddr, error: String },
    /// The peer already failed earlier in the same propagation round.
    Skipped { peer: IpAddr },
}

#[derive(Debug)]
pub struct UploadReport {
    pub peer: IpAddr,
    pub outcome: Result<UploadOutcome>,
}

/// Compare the peer's last accepted generation with local history.
pub fn preflight(
    store_id: &str,
    history: &[RootHistoryItem],
    remote: &RemoteStoreStatus,
) -> std::result::Result<(), ConsistencyError> {
    let Some(latest) = history.last() else {
        return Err(ConsistencyError::EmptyHistory {
            store_id: store_id.to_string(),
        });
    };
    let local_index = (history.len() - 1) as u64;
    let Ok(remote_index) = u64::try_from(remote.generation_index) else {
        // Peer does not hold the store yet.
        return Ok(());
    };
    let remote_hash = remote.last_root_hash.clone().unwrap_or_default();

    if remote_index > local_index {
        return Err(ConsistencyError::PeerAhead {
            remote_index,
            local_index,
        });
    }
    let local_hash = &history[remote_index as usize].root_hash;
    if *local_hash != remote_hash {
        return Err(ConsistencyError::GenerationMismatch {
            index: remote_index,
            local: local_hash.clone(),
            remote: remote_hash,
        });
    }
    if remote_index == local_index {
        return Err(ConsistencyError::AlreadyCurrent {
            root_hash: latest.root_hash.clone(),
        });
    }
    Ok(())
}

/// The remote manifest must hold exactly the on-chain roots before the newest.
pub fn check_manifest(
    remote_manifest: &[String],
    history: &[RootHistoryItem],
) -> std::result::Result<(), ConsistencyError> {
    let expected = history.len().saturating_sub(1);
    if remote_manifest.len() != expected {
        return Err(ConsistencyError::ManifestLength {
            expected,
            actual: remote_manifest.len(),
        });
    }
    for (index, (entry, item)) in remote_manifest.iter().zip(history).enumerate() {
        if *entry != item.root_hash {
            return Err(ConsistencyError::ManifestPrefix {
                index,
                expected: item.root_hash.clone(),
                actual: entry.clone(),
            });
        }
    }
    Ok(())
}

/// One file of the delta for the newest generation.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingFile {
    relative: String,
    payload: Payload,
}

pub struct StoreUploader {
    fetcher: ResilientFetcher,
    chain_state: Arc<dyn ChainState>,
    endpoints: Arc<dyn PeerEndpoints>,
    data_dir: PathBuf,
    fanout: usize,
}

impl StoreUploader {
    pub fn new(
        fetcher: ResilientFetcher,
        chain_state: Arc<dyn ChainState>,
        endpoints: Arc<dyn PeerEndpoints>,
        data_dir: PathBuf,
        fanout: usize,
    ) -> Self {
        Self {
            fetcher,
            chain_state,
            endpoints,
            data_dir,
            fanout: fanout.max(1),
        }
    }

    /// Push the newest generation of `store_id` to `peer`.
    pub async fn upload_store_head(&self, store_id: &str, peer: IpAddr) -> Result<UploadOutcome> {
        let history = self.chain_state.root_history(store_id).await?;
        let server =
            PropagationServer::with_base_url(self.fetcher.clone(), self.endpoints.propagation_url(peer));

        let status = server.store_status(store_id).await?;
        preflight(store_id, &history, &status)?;
        let remote_manifest = server.manifest(store_id).await?;
        check_manifest(&remote_manifest, &history)?;

        let store = StoreDirectory::new(&self.data_dir, store_id);
        let files = delta_files(&store, &history).await?;
        let latest = history
            .last()
            .map(|item| item.root_hash.clone())
            .unwrap_or_default();
        debug!(store_id, peer = %peer, root_hash = %latest, files = files.len(), "uploading delta");

        let session_id = match server.start_upload(store_id).await {
            Ok(session_id) => session_id,
            Err(err) => return Ok(peer_failed(store_id, peer, err)),
        };
        for file in &files {
            if let Err(err) = server
                .upload_file(store_id, &session_id, &file.relative, file.payload.clone())
                .await
            {
                abort_quietly(&server, store_id, &session_id).await;
                // A local file that cannot be read is not the peer's fault.
                if matches!(err, SyncError::Io(_)) {
                    return Err(err);
                }
                return Ok(peer_failed(store_id, peer, err));
            }
        }
        if let Err(err) = server.commit(store_id, &session_id).await {
            abort_quietly(&server, store_id, &session_id).await;
            return Ok(peer_failed(store_id, peer, err));
        }

        info!(store_id, peer = %peer, root_hash = %latest, files = files.len(), "store head uploaded");
        Ok(UploadOutcome::Uploaded {
            root_hash: latest,
            files: files.len(),
        })
    }

    /// Upload to every peer in `peers` and report per peer. A peer whose
    /// transfer fails is blacklisted for the rest of this round only.
    pub async fn propagate_store_head(&self, store_id: &str, peers: &[IpAddr]) -> Vec<UploadReport> {
        let blacklist = Mutex::new(Blacklist::default());
        let blacklist = &blacklist;
        map_in_batches(peers.to_vec(), self.fanout, |peer| async move {
            let outcome = if blacklist.lock().contains(store_id, &peer) {
                Ok(UploadOutcome::Skipped { peer })
            } else {
                self.upload_store_head(store_id, peer).await
            };
            match &outcome {
                Ok(UploadOutcome::PeerFailed { .. }) => {
                    blacklist.lock().add(store_id, peer);
                }
                Err(err) => debug!(store_id, peer = %peer, error = %err, "upload not performed"),
                Ok(_) => {}
            }
            UploadReport { peer, outcome }
        })
        .await
    }
}

fn peer_failed(store_id: &str, peer: IpAddr, err: SyncError) -> UploadOutcome {
    warn!(store_id, peer = %peer, error = %err, "upload transfer failed");
    UploadOutcome::PeerFailed {
        peer,
        error: err.to_string(),
    }
}

async fn abort_quietly(server: &PropagationServer, store_id: &str, session_id: &str) {
    if let Err(err) = server.abort(store_id, session_id).await {
        debug!(store_id, session_id, error = %err, "abort failed");
    }
}

/// Data files new in the newest generation, its descriptor, and the
/// manifest covering the whole history, in upload order.
async fn delta_files(store: &StoreDirectory, history: &[RootHistoryItem]) -> Result<Vec<PendingFile>> {
    let Some(latest) = history.last() else {
        return Ok(Vec::new());
    };
    if !store.has_root(&latest.root_hash) {
        return Err(ConsistencyError::MissingRoot {
            root_hash: latest.root_hash.clone(),
        }
        .into());
    }
    let current = store.read_root_descriptor(&latest.root_hash).await?;
    let previous = match history.len().checked_sub(2).map(|index| &history[index]) {
        Some(item) if store.has_root(&item.root_hash) => {
            store.read_root_descriptor(&item.root_hash).await?
        }
        _ => RootDescriptor::default(),
    };
    let known: BTreeSet<&str> = previous.data_hashes();

    let mut files = Vec::new();
    for sha256 in current.data_hashes() {
        if known.contains(sha256) {
            continue;
        }
        files.push(PendingFile {
            relative: data_file_relative_path(sha256)?,
            payload: Payload::File(store.data_file_path(sha256)?),
        });
    }
    files.push(PendingFile {
        relative: format!("{}.dat", latest.root_hash),
        payload: Payload::File(store.root_descriptor_path(&latest.root_hash)),
    });
    let roots: Vec<String> = history.iter().map(|item| item.root_hash.clone()).collect();
    files.push(PendingFile {
        relative: MANIFEST_FILE.to_string(),
        payload: Payload::Bytes(Bytes::from(render_manifest(&roots))),
    });
    Ok(files)
}
