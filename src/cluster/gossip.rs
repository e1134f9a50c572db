//! Cluster substrate over iroh-gossip.
//!
//! Each cluster channel maps to a gossip topic derived from its name, so
//! broker processes on different hosts form a cluster by joining the same
//! topic through a shared set of bootstrap nodes.
//!
//! ```no_run
//! use std::sync::Arc;
//! use linkup::cluster::gossip::GossipSubstrate;
//! use linkup::{Broker, BrokerConfig};
//!
//! # async fn run(gossip: iroh_gossip::net::Gossip, bootstrap: Vec<iroh::PublicKey>) {
//! let substrate = GossipSubstrate::new(gossip, bootstrap);
//! let broker = Broker::with_cluster(BrokerConfig::default(), Arc::new(substrate)).await;
//! # }
//! ```
//!
//! Gossip cannot report how many nodes listen on a topic, so existence
//! queries over this substrate always run until their timeout unless a
//! positive answer arrives first.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use iroh_gossip::api::{Event, GossipSender};
use iroh_gossip::net::Gossip;
use iroh_gossip::proto::TopicId;
use parking_lot::Mutex;
use tracing::Instrument;

use super::{Substrate, SubstrateError, SubstrateStream};

/// Derive the gossip topic for a cluster channel name.
pub fn topic_for_channel(channel: &str) -> TopicId {
    let path = format!("linkup.cluster/{channel}");
    TopicId::from(*blake3::hash(path.as_bytes()).as_bytes())
}

/// [`Substrate`] backed by an iroh-gossip instance.
pub struct GossipSubstrate {
    gossip: Gossip,
    bootstrap: Vec<iroh::PublicKey>,
    senders: Mutex<HashMap<String, GossipSender>>,
}

impl std::fmt::Debug for GossipSubstrate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GossipSubstrate")
            .field("bootstrap", &self.bootstrap.len())
            .field("channels", &self.senders.lock().len())
            .finish()
    }
}

impl GossipSubstrate {
    /// Wrap `gossip`, joining topics through `bootstrap`.
    pub fn new(gossip: Gossip, bootstrap: Vec<iroh::PublicKey>) -> Self {
        Self {
            gossip,
            bootstrap,
            senders: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Substrate for GossipSubstrate {
    async fn publish(&self, channel: &str, message: String) -> Result<(), SubstrateError> {
        let sender = self.senders.lock().get(channel).cloned();
        let Some(sender) = sender else {
            return Err(SubstrateError::Unavailable(format!(
                "not subscribed to {channel:?}"
            )));
        };

        let span = tracing::trace_span!("gossip_broadcast", bytes = message.len());
        sender
            .broadcast(Bytes::from(message))
            .instrument(span)
            .await
            .map_err(|e| SubstrateError::Unavailable(e.to_string()))
    }

    async fn subscribe(&self, channel: &str) -> Result<SubstrateStream, SubstrateError> {
        let topic_id = topic_for_channel(channel);
        let topic = self
            .gossip
            .subscribe(topic_id, self.bootstrap.clone())
            .await
            .map_err(|e| SubstrateError::Unavailable(e.to_string()))?;

        let (sender, receiver) = topic.split();
        self.senders.lock().insert(channel.to_string(), sender);

        let stream = receiver.filter_map(|event| async move {
            match event {
                Ok(Event::Received(msg)) => match String::from_utf8(msg.content.to_vec()) {
                    Ok(text) => Some(Ok(text)),
                    Err(_) => {
                        tracing::debug!(
                            from = %msg.delivered_from.fmt_short(),
                            "ignoring non-utf8 gossip message"
                        );
                        None
                    }
                },
                Ok(Event::NeighborUp(peer)) => {
                    tracing::debug!("gossip neighbor up: {}", peer.fmt_short());
                    None
                }
                Ok(Event::NeighborDown(peer)) => {
                    tracing::debug!("gossip neighbor down: {}", peer.fmt_short());
                    None
                }
                Ok(Event::Lagged) => Some(Err(SubstrateError::Lagged(0))),
                Err(e) => Some(Err(SubstrateError::Unavailable(e.to_string()))),
            }
        });
        Ok(stream.boxed())
    }

    async fn subscriber_count(&self, _channel: &str) -> Result<usize, SubstrateError> {
        Err(SubstrateError::CountUnavailable)
    }
}
