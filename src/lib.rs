//! Chain-anchored synchronization of content-addressed data stores.
//!
//! A store's authoritative root history lives on chain; its files live on
//! HTTP content servers. This crate finds healthy chain peers, mirrors
//! store roots from content peers with integrity checks, pushes local heads
//! to propagation servers, and keeps a cross-process cache of chain state
//! for tracked stores.

pub mod batch;
pub mod cache;
pub mod chain;
pub mod cli;
pub mod error;
pub mod http;
pub mod logging;
pub mod peers;
pub mod storage;
pub mod sync;

#[cfg(test)]
mod test_utils;

pub use error::{ConsistencyError, Result, SyncError};
pub use http::content_server::ContentServer;
pub use http::propagation::PropagationServer;
pub use http::{FetchConfig, Payload, ResilientFetcher};
pub use peers::{FailoverPeer, PeerHealthManager};
pub use sync::{StoreSyncOrchestrator, StoreUploader, SyncOutcome};
