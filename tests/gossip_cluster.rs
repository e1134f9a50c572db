#![cfg(feature = "gossip")]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use iroh::endpoint::RelayMode;
use iroh::protocol::Router;
use iroh::{Endpoint, EndpointAddr, TransportAddr};
use iroh_gossip::net::{Gossip, GOSSIP_ALPN};
use serde_json::json;
use tokio::time::timeout;

use linkup::cluster::gossip::GossipSubstrate;
use linkup::cluster::{Substrate, SubstrateError};
use linkup::config::{BrokerConfig, ClusterConfig, PeerConfig};
use linkup::{Broker, Cluster, MemoryChannelHub, Peer, PeerEvent};

/// Create a local-only endpoint with relays and discovery disabled for testing.
async fn local_endpoint() -> Endpoint {
    Endpoint::builder()
        .relay_mode(RelayMode::Disabled)
        .clear_discovery()
        .bind()
        .await
        .unwrap()
}

/// Address of `endpoint` with unspecified bind addresses mapped to localhost.
fn localhost_addr(endpoint: &Endpoint) -> EndpointAddr {
    let addrs = endpoint.bound_sockets().into_iter().map(|addr| {
        let local = match addr {
            SocketAddr::V4(v4) if v4.ip().is_unspecified() => SocketAddr::new(
                std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
                v4.port(),
            ),
            SocketAddr::V6(v6) if v6.ip().is_unspecified() => SocketAddr::new(
                std::net::IpAddr::V6(std::net::Ipv6Addr::LOCALHOST),
                v6.port(),
            ),
            other => other,
        };
        TransportAddr::Ip(local)
    });
    EndpointAddr::new(endpoint.id()).with_addrs(addrs)
}

async fn gossip_node() -> (Endpoint, Gossip, Router) {
    let endpoint = local_endpoint().await;
    let gossip = Gossip::builder().spawn(endpoint.clone());
    let router = Router::builder(endpoint.clone())
        .accept(GOSSIP_ALPN, gossip.clone())
        .spawn();
    (endpoint, gossip, router)
}

async fn registered(peer: &Peer) {
    timeout(Duration::from_secs(10), peer.wait_until_registered())
        .await
        .expect("registration timed out")
        .expect("registration failed");
}

/// Repeat `exists` until the gossip mesh has formed and the answer is positive.
async fn eventually_exists(cluster: &Cluster, id: &str) {
    timeout(Duration::from_secs(30), async {
        while !cluster.exists(id).await {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{id} never became visible through the cluster"));
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn test_brokers_cluster_over_gossip() {
    let (ep1, gossip1, router1) = gossip_node().await;
    let (ep2, gossip2, router2) = gossip_node().await;

    // teach node 2 where node 1 listens so it can join through it by id
    let conn = timeout(Duration::from_secs(5), ep2.connect(localhost_addr(&ep1), GOSSIP_ALPN))
        .await
        .expect("connection timed out")
        .expect("connection failed");
    drop(conn);

    let config = BrokerConfig {
        cluster: ClusterConfig {
            exists_timeout: Duration::from_millis(500),
            ..ClusterConfig::default()
        },
        ..BrokerConfig::default()
    };
    let substrate1 = Arc::new(GossipSubstrate::new(gossip1, vec![]));
    let substrate2 = Arc::new(GossipSubstrate::new(gossip2, vec![ep1.id()]));
    let b1 = Broker::with_cluster(config.clone(), substrate1.clone()).await;
    let b2 = Broker::with_cluster(config, substrate2.clone()).await;

    assert!(matches!(
        substrate1.subscriber_count("linkup").await,
        Err(SubstrateError::CountUnavailable)
    ));

    let hub = Arc::new(MemoryChannelHub::new());
    let peer1 = Peer::with_socket(
        "peer1",
        Arc::new(b1.connect_local()),
        hub.clone(),
        PeerConfig::default(),
    );
    let peer2 = Peer::with_socket(
        "peer2",
        Arc::new(b2.connect_local()),
        hub,
        PeerConfig::default(),
    );
    let mut events = peer2.subscribe();
    registered(&peer1).await;
    registered(&peer2).await;

    let c1 = b1.cluster().expect("clustered");
    let c2 = b2.cluster().expect("clustered");
    eventually_exists(c2, "peer1").await;
    eventually_exists(c1, "peer2").await;

    // without a subscriber count a miss can only end at the timeout
    let started = Instant::now();
    assert!(!c1.exists("ghost").await);
    assert!(started.elapsed() >= Duration::from_millis(500));

    // handshake payloads cross the gossip topic in both directions
    timeout(Duration::from_secs(10), peer1.send("peer2", "across"))
        .await
        .expect("send timed out")
        .expect("send failed");
    let (from, message) = timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(PeerEvent::Message { from, message }) = events.recv().await {
                return (from, message);
            }
        }
    })
    .await
    .expect("no message arrived");
    assert_eq!(from, "peer1");
    assert_eq!(message, json!("across"));

    peer1.close().await;
    peer2.close().await;
    router1.shutdown().await.unwrap();
    router2.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_publish_before_subscribe_is_unavailable() {
    let (_endpoint, gossip, router) = gossip_node().await;
    let substrate = GossipSubstrate::new(gossip, vec![]);
    assert!(matches!(
        substrate.publish("linkup", "hello".into()).await,
        Err(SubstrateError::Unavailable(_))
    ));
    router.shutdown().await.unwrap();
}
