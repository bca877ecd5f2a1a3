//! CLI and config handling.

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::cache::RefreshConfig;
use crate::http::FetchConfig;
use crate::peers::PeerConfig;
use crate::sync::OrchestratorConfig;

pub const DEFAULT_DATA_DIR: &str = "stores";
pub const DEFAULT_CACHE_DIR: &str = "store-cache";
pub const DEFAULT_LAN_HOSTNAME: &str = "chia-node";
pub const DEFAULT_DNS_SEEDS: &[&str] = &[
    "dns-introducer.chia.net",
    "chia.ctrlaltdel.ch",
    "seeder.dexie.space",
    "chia.hoffmang.com",
];
pub const DEFAULT_CHAIN_PORT: u16 = 8444;
pub const DEFAULT_CONTENT_PORT: u16 = 4161;
pub const DEFAULT_PROPAGATION_PORT: u16 = 4159;
pub const DEFAULT_FETCH_RETRIES: u32 = 1;
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 2_000;
pub const DEFAULT_BACKOFF_FACTOR: f64 = 1.5;
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 10_000;
pub const DEFAULT_INACTIVITY_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_MAX_REDIRECTS: usize = 5;
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_PEER_CACHE_TTL_SECS: u64 = 30;
pub const DEFAULT_DNS_KEEP: usize = 5;
pub const DEFAULT_PROBE_FANOUT: usize = 8;
pub const DEFAULT_PEER_SAMPLE_SIZE: usize = 5;
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 300;

/// Operator commands.
#[derive(Subcommand, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Command {
    /// Run peer discovery and list reachable chain peers.
    Discover,
    /// Ask a content server whether it holds a root of a store.
    HasRoot {
        #[arg(long)]
        peer: String,
        #[arg(long)]
        store_id: String,
        #[arg(long)]
        root_hash: String,
    },
    /// Ask a content server whether a key exists under a root.
    HasKey {
        #[arg(long)]
        peer: String,
        #[arg(long)]
        store_id: String,
        #[arg(long)]
        root_hash: String,
        /// Hex-encoded key.
        #[arg(long)]
        key: String,
    },
    /// List the stores a content server knows about.
    Stores {
        #[arg(long)]
        peer: String,
    },
}

/// Store sync configuration.
#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[command(name = "store-sync", about = "Chain-anchored store synchronization")]
pub struct SyncConfig {
    /// Base directory holding one subdirectory per store.
    #[arg(long, default_value = DEFAULT_DATA_DIR)]
    pub data_dir: PathBuf,
    /// Directory for cached chain state of tracked stores.
    #[arg(long, default_value = DEFAULT_CACHE_DIR)]
    pub cache_dir: PathBuf,
    /// Trusted chain peer (IPv4 literal) tried before any other tier.
    #[arg(long)]
    pub trusted_peer: Option<String>,
    /// Hostname of a chain node on the local network.
    #[arg(long, default_value = DEFAULT_LAN_HOSTNAME)]
    pub lan_hostname: String,
    /// DNS seeds, in priority order.
    #[arg(long = "dns-seed", value_delimiter = ',', default_values_t = DEFAULT_DNS_SEEDS.iter().map(|s| s.to_string()).collect::<Vec<_>>())]
    pub dns_seeds: Vec<String>,
    #[arg(long, default_value_t = DEFAULT_CHAIN_PORT)]
    pub chain_port: u16,
    #[arg(long, default_value_t = DEFAULT_CONTENT_PORT)]
    pub content_port: u16,
    #[arg(long, default_value_t = DEFAULT_PROPAGATION_PORT)]
    pub propagation_port: u16,
    /// Retries per fetch after the first attempt.
    #[arg(long, default_value_t = DEFAULT_FETCH_RETRIES)]
    pub fetch_retries: u32,
    /// Abort a response body after this long without data.
    #[arg(long, default_value_t = DEFAULT_INACTIVITY_TIMEOUT_MS)]
    pub inactivity_timeout_ms: u64,
    /// Timeout applied to each call made through the selected chain peer.
    #[arg(long, default_value_t = DEFAULT_CALL_TIMEOUT_SECS)]
    pub call_timeout_secs: u64,
    /// How long a selected chain peer is reused before reselection.
    #[arg(long, default_value_t = DEFAULT_PEER_CACHE_TTL_SECS)]
    pub peer_cache_ttl_secs: u64,
    /// Interval between cache refresh ticks.
    #[arg(long, default_value_t = DEFAULT_REFRESH_INTERVAL_SECS)]
    pub refresh_interval_secs: u64,
    /// Verbosity: -v debug, -vv trace.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbosity: u8,
    /// Also write JSON-lines logs to this file.
    #[arg(long)]
    pub log_json: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Option<Command>,
}

impl SyncConfig {
    /// Parse configuration from CLI args.
    pub fn from_args() -> Self {
        Self::parse()
    }

    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig {
            max_retries: self.fetch_retries,
            inactivity_timeout: Duration::from_millis(self.inactivity_timeout_ms),
            ..FetchConfig::default()
        }
    }

    pub fn peer_config(&self) -> PeerConfig {
        PeerConfig {
            trusted_peer: self.trusted_peer.clone(),
            lan_hostname: Some(self.lan_hostname.clone()),
            dns_seeds: self.dns_seeds.clone(),
            chain_port: self.chain_port,
            call_timeout: Duration::from_secs(self.call_timeout_secs),
            cache_ttl: Duration::from_secs(self.peer_cache_ttl_secs),
            ..PeerConfig::default()
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            data_dir: self.data_dir.clone(),
            content_port: self.content_port,
            propagation_port: self.propagation_port,
            ..OrchestratorConfig::default()
        }
    }

    pub fn refresh_config(&self) -> RefreshConfig {
        RefreshConfig {
            cache_dir: self.cache_dir.clone(),
            interval: Duration::from_secs(self.refresh_interval_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_flow_into_component_configs() {
        let config = SyncConfig::parse_from(["store-sync"]);
        assert_eq!(config.dns_seeds.len(), DEFAULT_DNS_SEEDS.len());

        let fetch = config.fetch_config();
        assert_eq!(fetch.max_retries, 1);
        assert_eq!(fetch.inactivity_timeout, Duration::from_secs(5));
        assert_eq!(fetch.max_redirects, 5);

        let peers = config.peer_config();
        assert_eq!(peers.call_timeout, Duration::from_secs(60));
        assert_eq!(peers.cache_ttl, Duration::from_secs(30));
        assert_eq!(peers.chain_port, 8444);

        let refresh = config.refresh_config();
        assert_eq!(refresh.interval, Duration::from_secs(300));
    }

    #[test]
    fn parses_subcommand_and_seed_list() {
        let config = SyncConfig::parse_from([
            "store-sync",
            "--dns-seed",
            "a.example,b.example",
            "--trusted-peer",
            "10.0.0.7",
            "has-root",
            "--peer",
            "10.0.0.8",
            "--store-id",
            "ab",
            "--root-hash",
            "cd",
        ]);
        assert_eq!(config.dns_seeds, vec!["a.example", "b.example"]);
        assert_eq!(config.trusted_peer.as_deref(), Some("10.0.0.7"));
        assert_eq!(
            config.command,
            Some(Command::HasRoot {
                peer: "10.0.0.8".into(),
                store_id: "ab".into(),
                root_hash: "cd".into(),
            })
        );
    }
}
