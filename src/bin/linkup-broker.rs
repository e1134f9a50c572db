use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use linkup::config::{BrokerConfig, RpcConfig, DEFAULT_PORT};
use linkup::Broker;

#[derive(Parser)]
#[clap(name = "linkup-broker")]
#[clap(about = "Signaling broker that relays handshakes between peers")]
struct Args {
    /// Address to listen on
    #[clap(long, default_value = "0.0.0.0")]
    bind: String,

    /// Port to listen on
    #[clap(long, env = "PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Seconds a request waits for its response
    #[clap(long, default_value = "50")]
    request_timeout_secs: u64,

    /// Enable verbose logging (overridden by RUST_LOG)
    #[clap(short, long)]
    verbose: bool,

    /// Join a broker cluster over iroh-gossip
    #[cfg(feature = "gossip")]
    #[clap(long, env = "LINKUP_CLUSTER")]
    cluster: bool,

    /// Node ids of running cluster members to join through (comma separated)
    #[cfg(feature = "gossip")]
    #[clap(long, env = "LINKUP_BOOTSTRAP", value_delimiter = ',')]
    bootstrap: Vec<iroh::PublicKey>,

    /// Pub/sub channel shared by the cluster members
    #[cfg(feature = "gossip")]
    #[clap(long, default_value = linkup::config::DEFAULT_CLUSTER_CHANNEL)]
    cluster_channel: String,
}

/// Gossip node backing the cluster; kept alive while the broker runs.
#[cfg(feature = "gossip")]
struct ClusterNode {
    router: iroh::protocol::Router,
}

#[cfg(feature = "gossip")]
async fn clustered_broker(args: &Args, mut config: BrokerConfig) -> Result<(Broker, ClusterNode)> {
    use std::sync::Arc;

    use iroh_gossip::net::{Gossip, GOSSIP_ALPN};
    use linkup::cluster::gossip::GossipSubstrate;

    let endpoint = iroh::Endpoint::builder()
        .bind()
        .await
        .context("failed to bind iroh endpoint")?;
    let gossip = Gossip::builder().spawn(endpoint.clone());
    let router = iroh::protocol::Router::builder(endpoint.clone())
        .accept(GOSSIP_ALPN, gossip.clone())
        .spawn();
    info!(
        node = %endpoint.id(),
        bootstrap = args.bootstrap.len(),
        channel = %args.cluster_channel,
        "joining broker cluster"
    );

    config.cluster.channel = args.cluster_channel.clone();
    let substrate = GossipSubstrate::new(gossip, args.bootstrap.clone());
    let broker = Broker::with_cluster(config, Arc::new(substrate)).await;
    Ok((broker, ClusterNode { router }))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", args.bind, args.port))?;

    let config = BrokerConfig {
        rpc: RpcConfig {
            request_timeout: Duration::from_secs(args.request_timeout_secs),
        },
        ..BrokerConfig::default()
    };

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("starting linkup broker on ws://{addr}");

    #[cfg(feature = "gossip")]
    let (broker, node) = if args.cluster || !args.bootstrap.is_empty() {
        let (broker, node) = clustered_broker(&args, config).await?;
        (broker, Some(node))
    } else {
        (Broker::new(config), None)
    };
    #[cfg(not(feature = "gossip"))]
    let broker = Broker::new(config);

    tokio::select! {
        served = broker.serve(listener) => served?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }

    #[cfg(feature = "gossip")]
    if let Some(node) = node {
        if let Err(e) = node.router.shutdown().await {
            tracing::warn!("failed to shut down gossip node: {e}");
        }
    }
    Ok(())
}
