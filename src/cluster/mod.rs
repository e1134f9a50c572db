//! Cluster coordination across broker instances.
//!
//! Instances share two facts over a publish/subscribe [`Substrate`]: "I know
//! peer X" (`find`/`found`) and "relay this signal to peer X" (`signal`).
//! Every message on the channel is JSON of the form `{"type": ..., "data": ...}`.
//!
//! Substrate failures are logged and degrade the coordinator instead of
//! failing it: `exists` falls back to waiting for its timeout and signals stop
//! reaching other instances.

pub mod memory;

#[cfg(feature = "gossip")]
pub mod gossip;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace, warn, Instrument};
use uuid::Uuid;

use crate::config::ClusterConfig;
use crate::envelope::SignalParams;
use crate::{Error, Result};

pub use memory::MemoryBus;

/// Stream of raw messages received on a channel.
pub type SubstrateStream =
    Pin<Box<dyn Stream<Item = std::result::Result<String, SubstrateError>> + Send>>;

/// Errors reported by a pub/sub substrate.
#[derive(Debug, thiserror::Error)]
pub enum SubstrateError {
    /// The substrate cannot be reached.
    #[error("substrate unavailable: {0}")]
    Unavailable(String),
    /// The substrate cannot tell how many instances are subscribed.
    #[error("subscriber count unavailable")]
    CountUnavailable,
    /// The subscription fell behind and dropped messages.
    #[error("subscription lagged by {0} messages")]
    Lagged(u64),
}

/// Publish/subscribe mechanism shared by all broker instances.
#[async_trait]
pub trait Substrate: Send + Sync + 'static {
    /// Publish a message to every subscriber of `channel`.
    async fn publish(&self, channel: &str, message: String)
        -> std::result::Result<(), SubstrateError>;

    /// Subscribe to `channel`.
    async fn subscribe(&self, channel: &str) -> std::result::Result<SubstrateStream, SubstrateError>;

    /// Number of instances currently subscribed to `channel`.
    async fn subscriber_count(&self, channel: &str) -> std::result::Result<usize, SubstrateError>;
}

/// Local view of the peers registered at this broker instance.
pub trait Directory: Send + Sync + 'static {
    /// Whether `id` is registered locally.
    fn contains(&self, id: &str) -> bool;

    /// Deliver a relayed signal to a local peer. Returns `false` if the
    /// target is not registered here.
    fn deliver(&self, signal: SignalParams) -> bool;
}

/// Existence query published to the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindQuery {
    /// Peer being looked up.
    pub id: String,
    /// Correlation id of the query.
    #[serde(default)]
    pub query: Option<String>,
}

/// Answer to a [`FindQuery`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoundAnswer {
    /// Peer that was looked up.
    pub id: String,
    /// Correlation id copied from the query.
    #[serde(default)]
    pub query: Option<String>,
    /// Whether the answering instance has the peer registered.
    pub found: bool,
}

/// Messages exchanged between broker instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum ClusterMessage {
    /// Relay a signal to whichever instance knows `to`.
    Signal(SignalParams),
    /// Ask every instance whether it knows a peer.
    Find(FindQuery),
    /// Answer to a `find`.
    Found(FoundAnswer),
}

struct Query {
    peer_id: String,
    answers: mpsc::UnboundedSender<bool>,
}

type Queries = Arc<Mutex<HashMap<String, Query>>>;

/// Deregisters an existence query the moment it resolves.
struct QueryGuard {
    queries: Queries,
    query: String,
}

impl Drop for QueryGuard {
    fn drop(&mut self) {
        self.queries.lock().remove(&self.query);
    }
}

struct ClusterInner {
    substrate: Arc<dyn Substrate>,
    channel: String,
    outbound: mpsc::UnboundedSender<ClusterMessage>,
    queries: Queries,
    exists_timeout: Duration,
    shutdown_tx: broadcast::Sender<()>,
}

impl Drop for ClusterInner {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Coordinator that lets independent broker instances act as one.
///
/// Cheap to clone. The background tasks stop when the last clone is dropped.
#[derive(Clone)]
pub struct Cluster {
    inner: Arc<ClusterInner>,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("channel", &self.inner.channel)
            .field("pending_queries", &self.pending_queries())
            .finish()
    }
}

impl Cluster {
    /// Subscribe to the cluster channel and start relaying.
    ///
    /// `directory` answers `find` queries and receives relayed signals for
    /// peers registered at this instance. A failed subscription is logged and
    /// leaves the coordinator running without inbound traffic.
    pub async fn spawn(
        substrate: Arc<dyn Substrate>,
        config: &ClusterConfig,
        directory: Arc<dyn Directory>,
    ) -> Self {
        let channel = config.channel.clone();
        let (shutdown_tx, _) = broadcast::channel(1);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let queries: Queries = Arc::new(Mutex::new(HashMap::new()));

        let span = tracing::debug_span!("cluster", channel = %channel);

        match substrate.subscribe(&channel).await {
            Ok(stream) => {
                tokio::spawn(
                    run_inbound(
                        stream,
                        directory,
                        Arc::clone(&queries),
                        outbound.clone(),
                        shutdown_tx.subscribe(),
                    )
                    .instrument(span.clone()),
                );
            }
            Err(e) => {
                tracing::error!(%channel, "failed to subscribe to cluster channel: {e}");
            }
        }

        tokio::spawn(
            run_publisher(Arc::clone(&substrate), channel.clone(), outbound_rx).instrument(span),
        );

        Self {
            inner: Arc::new(ClusterInner {
                substrate,
                channel,
                outbound,
                queries,
                exists_timeout: config.exists_timeout,
                shutdown_tx,
            }),
        }
    }

    /// Relay a signal to every instance; the one that knows `to` delivers it.
    pub fn signal(&self, params: SignalParams) -> Result<()> {
        trace!(from = %params.from, to = %params.to, "relaying signal to cluster");
        self.inner
            .outbound
            .send(ClusterMessage::Signal(params))
            .map_err(|_| Error::transport("cluster publisher stopped"))
    }

    /// Ask the other instances whether any of them knows `id`.
    ///
    /// Resolves `true` on the first positive answer, `false` once every
    /// subscribed instance answered negatively, and `false` when the timeout
    /// elapses first.
    pub async fn exists(&self, id: &str) -> bool {
        let expected = match self.inner.substrate.subscriber_count(&self.inner.channel).await {
            Ok(count) => Some(count),
            Err(e) => {
                warn!("cannot count cluster subscribers, waiting for timeout instead: {e}");
                None
            }
        };

        let query = Uuid::new_v4().to_string();
        let (tx, mut answers) = mpsc::unbounded_channel();
        self.inner.queries.lock().insert(
            query.clone(),
            Query {
                peer_id: id.to_string(),
                answers: tx,
            },
        );
        let _guard = QueryGuard {
            queries: Arc::clone(&self.inner.queries),
            query: query.clone(),
        };

        let find = ClusterMessage::Find(FindQuery {
            id: id.to_string(),
            query: Some(query),
        });
        if self.inner.outbound.send(find).is_err() {
            warn!("cluster publisher stopped, treating {id:?} as unknown");
            return false;
        }

        let collect = async {
            if expected == Some(0) {
                return false;
            }
            let mut received = 0usize;
            while let Some(found) = answers.recv().await {
                received += 1;
                if found {
                    return true;
                }
                if expected.is_some_and(|n| received >= n) {
                    return false;
                }
            }
            false
        };

        let found = tokio::time::timeout(self.inner.exists_timeout, collect)
            .await
            .unwrap_or(false);
        debug!(%id, found, ?expected, "cluster existence query resolved");
        found
    }

    /// Number of existence queries still waiting for answers.
    pub fn pending_queries(&self) -> usize {
        self.inner.queries.lock().len()
    }
}

async fn run_publisher(
    substrate: Arc<dyn Substrate>,
    channel: String,
    mut outbound: mpsc::UnboundedReceiver<ClusterMessage>,
) {
    while let Some(message) = outbound.recv().await {
        let text = match serde_json::to_string(&message) {
            Ok(text) => text,
            Err(e) => {
                warn!("failed to encode cluster message: {e}");
                continue;
            }
        };
        trace!(message = %text, "publish");
        if let Err(e) = substrate.publish(&channel, text).await {
            warn!("failed to publish cluster message: {e}");
        }
    }
    debug!("cluster publisher stopped");
}

async fn run_inbound(
    mut stream: SubstrateStream,
    directory: Arc<dyn Directory>,
    queries: Queries,
    outbound: mpsc::UnboundedSender<ClusterMessage>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!("cluster received shutdown signal");
                break;
            }
            message = stream.next() => {
                match message {
                    Some(Ok(text)) => handle_message(&text, directory.as_ref(), &queries, &outbound),
                    Some(Err(e)) => warn!("cluster subscription error: {e}"),
                    None => {
                        warn!("cluster subscription ended");
                        break;
                    }
                }
            }
        }
    }
}

fn handle_message(
    text: &str,
    directory: &dyn Directory,
    queries: &Queries,
    outbound: &mpsc::UnboundedSender<ClusterMessage>,
) {
    let message: ClusterMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            debug!("ignoring malformed cluster message: {e}");
            return;
        }
    };
    trace!(?message, "receive");

    match message {
        ClusterMessage::Signal(params) => {
            let to = params.to.clone();
            if !directory.deliver(params) {
                trace!(%to, "signal target not registered here, dropping");
            }
        }
        ClusterMessage::Find(FindQuery { id, query }) => {
            let found = directory.contains(&id);
            let _ = outbound.send(ClusterMessage::Found(FoundAnswer { id, query, found }));
        }
        ClusterMessage::Found(answer) => {
            let queries = queries.lock();
            match &answer.query {
                Some(query) => {
                    if let Some(entry) = queries.get(query) {
                        let _ = entry.answers.send(answer.found);
                    }
                }
                None => {
                    for entry in queries.values().filter(|q| q.peer_id == answer.id) {
                        let _ = entry.answers.send(answer.found);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;
    use tokio::time::Instant;

    #[derive(Default)]
    struct TestDirectory {
        ids: Mutex<HashSet<String>>,
        delivered: Mutex<Vec<SignalParams>>,
    }

    impl TestDirectory {
        fn with(ids: &[&str]) -> Arc<Self> {
            let dir = Self::default();
            dir.ids.lock().extend(ids.iter().map(|s| s.to_string()));
            Arc::new(dir)
        }
    }

    impl Directory for TestDirectory {
        fn contains(&self, id: &str) -> bool {
            self.ids.lock().contains(id)
        }

        fn deliver(&self, signal: SignalParams) -> bool {
            if !self.contains(&signal.to) {
                return false;
            }
            self.delivered.lock().push(signal);
            true
        }
    }

    /// Wraps a bus and lies about the subscriber count.
    struct CountOverride {
        bus: MemoryBus,
        count: Option<usize>,
    }

    #[async_trait]
    impl Substrate for CountOverride {
        async fn publish(
            &self,
            channel: &str,
            message: String,
        ) -> std::result::Result<(), SubstrateError> {
            self.bus.publish(channel, message).await
        }

        async fn subscribe(
            &self,
            channel: &str,
        ) -> std::result::Result<SubstrateStream, SubstrateError> {
            self.bus.subscribe(channel).await
        }

        async fn subscriber_count(&self, _: &str) -> std::result::Result<usize, SubstrateError> {
            self.count.ok_or(SubstrateError::CountUnavailable)
        }
    }

    fn config() -> ClusterConfig {
        ClusterConfig::default()
    }

    #[test]
    fn message_wire_format() {
        let msg = ClusterMessage::Find(FindQuery {
            id: "peer1".into(),
            query: None,
        });
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "find", "data": {"id": "peer1", "query": null}})
        );

        let parsed: ClusterMessage =
            serde_json::from_value(json!({"type": "found", "data": {"id": "x", "found": true}}))
                .unwrap();
        assert_eq!(
            parsed,
            ClusterMessage::Found(FoundAnswer {
                id: "x".into(),
                query: None,
                found: true
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_exists_finds_peer_on_other_instance() {
        let bus = Arc::new(MemoryBus::new());
        let b1 = Cluster::spawn(bus.clone(), &config(), TestDirectory::with(&["peer1"])).await;
        let b2 = Cluster::spawn(bus.clone(), &config(), TestDirectory::with(&["peer2"])).await;

        assert!(b2.exists("peer1").await);
        assert!(b1.exists("peer2").await);
        assert_eq!(b1.pending_queries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exists_resolves_false_once_everyone_answered() {
        let bus = Arc::new(MemoryBus::new());
        let b1 = Cluster::spawn(bus.clone(), &config(), TestDirectory::with(&["peer1"])).await;
        let _b2 = Cluster::spawn(bus.clone(), &config(), TestDirectory::with(&["peer2"])).await;

        let start = Instant::now();
        assert!(!b1.exists("peer3").await);
        assert!(start.elapsed() < config().exists_timeout);
        assert_eq!(b1.pending_queries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exists_waits_for_timeout_without_count() {
        let bus = MemoryBus::new();
        let substrate = Arc::new(CountOverride {
            bus: bus.clone(),
            count: None,
        });
        let b1 = Cluster::spawn(substrate, &config(), TestDirectory::with(&[])).await;

        let start = Instant::now();
        assert!(!b1.exists("peer3").await);
        assert!(start.elapsed() >= config().exists_timeout);
        assert_eq!(b1.pending_queries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exists_true_before_all_answer() {
        let bus = MemoryBus::new();
        let substrate = Arc::new(CountOverride {
            bus: bus.clone(),
            count: Some(10),
        });
        let b1 = Cluster::spawn(substrate, &config(), TestDirectory::with(&[])).await;
        let _b2 = Cluster::spawn(Arc::new(bus.clone()), &config(), TestDirectory::with(&["peer2"]))
            .await;

        let start = Instant::now();
        assert!(b1.exists("peer2").await);
        assert!(start.elapsed() < config().exists_timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exists_with_no_responders() {
        let bus = MemoryBus::new();
        let substrate = Arc::new(CountOverride {
            bus,
            count: Some(0),
        });
        let b1 = Cluster::spawn(substrate, &config(), TestDirectory::with(&[])).await;
        assert!(!b1.exists("anyone").await);
    }

    #[tokio::test]
    async fn test_signal_is_delivered_by_owning_instance() {
        let bus = Arc::new(MemoryBus::new());
        let dir1 = TestDirectory::with(&["peer1"]);
        let dir2 = TestDirectory::with(&["peer2"]);
        let b1 = Cluster::spawn(bus.clone(), &config(), dir1.clone()).await;
        let _b2 = Cluster::spawn(bus.clone(), &config(), dir2.clone()).await;

        let signal = SignalParams {
            from: "peer1".into(),
            to: "peer2".into(),
            payload: json!({"type": "offer"}),
        };
        b1.signal(signal.clone()).unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while dir2.delivered.lock().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("signal not delivered");

        assert_eq!(dir2.delivered.lock().as_slice(), &[signal]);
        assert!(dir1.delivered.lock().is_empty());
    }
}
