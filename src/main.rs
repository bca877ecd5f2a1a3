use eyre::{eyre, Result, WrapErr};
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use store_sync::cli::{Command, SyncConfig};
use store_sync::http::content_server::ContentServer;
use store_sync::logging::init_tracing;
use store_sync::peers::{PeerDiscovery, SystemResolver, TcpProbe};
use store_sync::ResilientFetcher;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = SyncConfig::from_args();
    init_tracing(config.verbosity, config.log_json.as_deref());

    let Some(command) = config.command.clone() else {
        warn!("no command given; see --help");
        return Ok(());
    };

    tokio::select! {
        result = run(&config, command) => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("shutdown signal received");
            Ok(())
        }
    }
}

async fn run(config: &SyncConfig, command: Command) -> Result<()> {
    match command {
        Command::Discover => {
            let peer_config = config.peer_config();
            let probe = TcpProbe::new(peer_config.probe_timeout);
            let discovery = PeerDiscovery::new(peer_config, Arc::new(SystemResolver), Arc::new(probe));
            let round = discovery
                .discover(&HashSet::new())
                .await
                .wrap_err("peer discovery failed")?;
            info!(
                candidates = round.candidates.len(),
                unreachable = round.unreachable.len(),
                "discovery finished"
            );
            for candidate in round.candidates {
                println!("{}\t{:?}", candidate.addr, candidate.tier);
            }
        }
        Command::HasRoot {
            peer,
            store_id,
            root_hash,
        } => {
            let server = content_server(config, &peer, &store_id)?;
            let present = server.has_root_hash(&root_hash).await?;
            println!("{present}");
        }
        Command::HasKey {
            peer,
            store_id,
            root_hash,
            key,
        } => {
            let server = content_server(config, &peer, &store_id)?;
            let present = server.has_key(&key, &root_hash).await?;
            println!("{present}");
        }
        Command::Stores { peer } => {
            let server = content_server(config, &peer, "")?;
            let stores = server.known_stores().await?;
            println!("{}", serde_json::to_string_pretty(&stores)?);
        }
    }
    Ok(())
}

fn content_server(config: &SyncConfig, peer: &str, store_id: &str) -> Result<ContentServer> {
    let ip: IpAddr = peer
        .parse()
        .map_err(|_| eyre!("peer must be an IP address: {peer}"))?;
    let fetcher = ResilientFetcher::new(config.fetch_config())?;
    Ok(ContentServer::for_peer(fetcher, ip, config.content_port, store_id))
}
