use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use deaddrop_core::{
    HttpPeerApi, LocalHeaderCache, MessageStore, NodeConfig, PeerApi, ShardSector,
};
use rand::Rng;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod routes;
mod ws_net;

#[derive(Parser)]
#[command(name = "deaddrop-node")]
#[command(about = "Store-and-forward node for anonymous encrypted messages")]
struct Args {
    /// Token service advertised port number
    #[arg(long, default_value_t = 7764)]
    tokenport: u16,
    /// Message service advertised hostname/ip
    #[arg(long, default_value = "")]
    exthost: String,
    /// Message service advertised port number
    #[arg(long, default_value_t = 8080)]
    extport: u16,
    /// Message service listen port number
    #[arg(long, default_value_t = 8080)]
    listenport: u16,
    /// Ring exponent of the shard sector; the node stores 2^ring of the
    /// 1024 bins
    #[arg(long, default_value_t = 1)]
    ring: u32,
    /// Bootstrap gossip peers
    #[arg(long = "peer", value_name = "HOST:PORT")]
    peers: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let pubkey_hex = hex::encode(ephemeral_pubkey());
    info!(pubkey = %pubkey_hex, "ephemeral node key");

    let api: Arc<dyn PeerApi> = Arc::new(HttpPeerApi::new()?);
    let local_cache =
        LocalHeaderCache::open("./headers", api.clone()).context("opening header cache")?;

    // land somewhere in the upper half of the ring; operators rebalance
    // with --ring, not by picking start bins
    let start_bin: u16 = 0x200 + rand::thread_rng().gen_range(0..0x200);
    let config = NodeConfig {
        ext_host: args.exthost.clone(),
        msg_port: args.extport,
        tok_port: args.tokenport,
        pubkey_hex,
        ..NodeConfig::default()
    };
    let store = MessageStore::open("./messages", local_cache, start_bin, api, config)
        .context("opening message store")?;
    store.set_target(ShardSector {
        start: start_bin,
        ring: args.ring,
    });

    for peer in &args.peers {
        let (host, port) = parse_peer(peer)?;
        store.local_cache().add_peer(&host, port)?;
        ws_net::spawn_peer_dialer(store.clone(), host, port);
    }

    store.clone().spawn_refresh();

    let app = routes::router(store.clone());
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", args.listenport))
        .await
        .with_context(|| format!("binding port {}", args.listenport))?;
    info!(port = args.listenport, start_bin, ring = args.ring, "node listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down");
    store.close().await;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Placeholder compressed-point key: the node only advertises it, all
/// real cryptography lives with the clients.
fn ephemeral_pubkey() -> [u8; 33] {
    let mut key = [0u8; 33];
    rand::thread_rng().fill(&mut key[..]);
    key[0] = 0x02 | (key[0] & 1);
    key
}

fn parse_peer(entry: &str) -> anyhow::Result<(String, u16)> {
    let (host, port) = entry
        .split_once(':')
        .with_context(|| format!("peer {entry:?} is not HOST:PORT"))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("peer {entry:?} has an invalid port"))?;
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_flag_parses_host_and_port() {
        let (host, port) = parse_peer("indigo.example:7754").expect("parse");
        assert_eq!(host, "indigo.example");
        assert_eq!(port, 7754);
        assert!(parse_peer("no-port").is_err());
        assert!(parse_peer("host:not-a-port").is_err());
    }

    #[test]
    fn ephemeral_pubkey_is_compressed_point_shaped() {
        for _ in 0..32 {
            let key = ephemeral_pubkey();
            assert!(key[0] == 0x02 || key[0] == 0x03);
        }
    }
}
