//! Error taxonomy shared by the fetch, peer, sync, and cache layers.

use std::time::Duration;
use thiserror::Error;

pub type Result<T, E = SyncError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SyncError {
    /// Bad status or a refused/broken connection. `status` is `None` when the
    /// request never produced a response.
    #[error("network error for {url}{}: {message}", status.map(|s| format!(" (status {s})")).unwrap_or_default())]
    Network {
        url: String,
        status: Option<u16>,
        message: String,
    },

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("redirect limit of {limit} exceeded for {url}")]
    RedirectLimitExceeded { url: String, limit: usize },

    #[error("failed to parse {context}: {message}")]
    Parse { context: String, message: String },

    #[error("integrity verification failed for key {key} (sha256 {sha256}) under root {root_hash}")]
    IntegrityVerificationFailed {
        key: String,
        sha256: String,
        root_hash: String,
    },

    #[error("no peers available")]
    NoPeersAvailable,

    #[error("peers exhausted for {resource}")]
    PeersExhausted { resource: String },

    #[error(transparent)]
    Consistency(#[from] ConsistencyError),

    #[error("chain transport error: {0}")]
    Transport(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Manifest, root-history, or generation disagreement between a peer and the
/// local view. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ConsistencyError {
    #[error("peer is ahead at generation {remote_index} (local latest {local_index}); pull first")]
    PeerAhead { remote_index: u64, local_index: u64 },

    #[error("peer already holds the latest root {root_hash}")]
    AlreadyCurrent { root_hash: String },

    #[error("generation {index} differs: local {local}, remote {remote}; manual intervention required")]
    GenerationMismatch {
        index: u64,
        local: String,
        remote: String,
    },

    #[error("remote manifest has {actual} entries, expected {expected}")]
    ManifestLength { expected: usize, actual: usize },

    #[error("remote manifest entry {index} is {actual}, on-chain root is {expected}")]
    ManifestPrefix {
        index: usize,
        expected: String,
        actual: String,
    },

    #[error("store {store_id} has no on-chain root history")]
    EmptyHistory { store_id: String },

    #[error("root {root_hash} is not present locally")]
    MissingRoot { root_hash: String },
}

impl SyncError {
    pub(crate) fn network(url: impl Into<String>, message: impl ToString) -> Self {
        Self::Network {
            url: url.into(),
            status: None,
            message: message.to_string(),
        }
    }

    pub(crate) fn status(url: impl Into<String>, status: u16) -> Self {
        Self::Network {
            url: url.into(),
            status: Some(status),
            message: "unexpected status".to_string(),
        }
    }

    pub(crate) fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }

    pub(crate) fn parse(context: impl Into<String>, err: impl ToString) -> Self {
        Self::Parse {
            context: context.into(),
            message: err.to_string(),
        }
    }

    /// Errors the fetcher retries with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::Timeout { .. })
    }

    /// Errors that indicate the peer itself is unusable and should trigger
    /// failover to a freshly selected peer.
    pub fn is_connection_level(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Transport(_) => true,
            Self::Network { status, .. } => status.is_none(),
            _ => false,
        }
    }
}
