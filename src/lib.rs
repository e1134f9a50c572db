//! Signaling broker and client for bootstrapping peer-to-peer connections.
//!
//! Peers register an id at a broker over a persistent socket and exchange
//! opaque handshake payloads through it until their direct data channel is
//! up. Several broker instances can form one logical broker through a shared
//! publish/subscribe [`cluster::Substrate`].

#![deny(missing_docs)]

pub mod client;
pub mod cluster;
pub mod config;
pub mod envelope;
pub mod error;
pub mod peer;
pub mod registry;
pub mod rpc;
pub mod server;
pub mod transport;

// Re-export key types
pub use client::{BrokerClient, BrokerEvent};
pub use cluster::{Cluster, MemoryBus, Substrate};
pub use config::{BrokerConfig, ClusterConfig, PeerConfig, ReconnectConfig, RpcConfig};
pub use error::{Error, Result};
pub use peer::{create_peer, Connection, MemoryChannelHub, Peer, PeerEvent};
pub use registry::Registry;
pub use rpc::RpcPeer;
pub use server::{Broker, ConnectionHandler};
pub use transport::{MemorySocket, ReadyState, Socket, SocketEvent, WsSocket};
