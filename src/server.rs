//! Broker: per-connection handler exposing the registry and cluster as
//! protocol methods, plus the WebSocket accept loop.
//!
//! Methods served on every connection:
//!
//! | method | params | result |
//! |---|---|---|
//! | `ping` | any | `"pong"` |
//! | `register` | `{id}` | the bound id |
//! | `unregister` | any | `null` |
//! | `find` / `exists` | `{id}` | `bool` |
//! | `signal` | `{from, to, payload}` | `null` |

use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, Instrument};

use crate::cluster::{Cluster, Directory, Substrate};
use crate::config::BrokerConfig;
use crate::envelope::{IdParams, SignalParams};
use crate::registry::Registry;
use crate::rpc::RpcPeer;
use crate::transport::MemorySocket;
use crate::{Error, Result};

const ACCEPT_BACKOFF_BASE: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Registry key for one inbound connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: u64,
    rpc: RpcPeer,
}

impl ConnectionHandle {
    /// Process-unique connection number.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ConnectionHandle {}

impl Hash for ConnectionHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Lifecycle of an inbound connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Channel open, no identity yet.
    Connected,
    /// A `register` call bound this id.
    Identified(String),
    /// Terminal.
    Closed,
}

impl ConnectionState {
    /// Id bound to the connection, if identified.
    pub fn bound_id(&self) -> Option<&str> {
        match self {
            ConnectionState::Identified(id) => Some(id),
            _ => None,
        }
    }
}

/// State shared by every connection of one broker instance.
struct Shared {
    config: BrokerConfig,
    registry: Mutex<Registry<ConnectionHandle>>,
    next_connection: AtomicU64,
}

impl Directory for Shared {
    fn contains(&self, id: &str) -> bool {
        self.registry.lock().contains(id)
    }

    fn deliver(&self, signal: SignalParams) -> bool {
        let target = self.registry.lock().find(&signal.to).cloned();
        let Some(target) = target else {
            return false;
        };
        match serde_json::to_value(&signal) {
            Ok(params) => {
                if let Err(e) = target.rpc.notify("signal", params) {
                    debug!(to = %signal.to, "failed to deliver relayed signal: {e}");
                }
            }
            Err(e) => debug!("failed to encode relayed signal: {e}"),
        }
        true
    }
}

/// One broker instance.
///
/// Cheap to clone. Attach a [`Cluster`] with [`Broker::with_cluster`] to
/// share registrations and relay signals across instances.
#[derive(Clone)]
pub struct Broker {
    shared: Arc<Shared>,
    cluster: Option<Cluster>,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("registered", &self.registered())
            .field("cluster", &self.cluster)
            .finish()
    }
}

impl Broker {
    /// Create a standalone broker.
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            shared: Self::shared(config),
            cluster: None,
        }
    }

    /// Create a broker that joins the cluster formed over `substrate`.
    pub async fn with_cluster(config: BrokerConfig, substrate: Arc<dyn Substrate>) -> Self {
        let cluster_config = config.cluster.clone();
        let shared = Self::shared(config);
        let directory: Arc<dyn Directory> = shared.clone();
        let cluster = Cluster::spawn(substrate, &cluster_config, directory).await;
        Self {
            shared,
            cluster: Some(cluster),
        }
    }

    fn shared(config: BrokerConfig) -> Arc<Shared> {
        Arc::new(Shared {
            config,
            registry: Mutex::new(Registry::new()),
            next_connection: AtomicU64::new(1),
        })
    }

    /// Cluster coordinator, if attached.
    pub fn cluster(&self) -> Option<&Cluster> {
        self.cluster.as_ref()
    }

    /// Number of peers registered at this instance.
    pub fn registered(&self) -> usize {
        self.shared.registry.lock().len()
    }

    /// Whether `id` is registered at this instance.
    pub fn is_registered(&self, id: &str) -> bool {
        self.shared.registry.lock().contains(id)
    }

    /// Start handling a new inbound connection whose outbound messages are
    /// written to `outbound`.
    pub fn accept(&self, outbound: mpsc::UnboundedSender<String>) -> ConnectionHandler {
        let id = self.shared.next_connection.fetch_add(1, Ordering::Relaxed);
        let rpc = RpcPeer::new(&self.shared.config.rpc, move |text| {
            outbound
                .send(text)
                .map_err(|_| Error::closed("connection gone"))
        });
        let handle = ConnectionHandle {
            id,
            rpc: rpc.clone(),
        };
        let state = Arc::new(Mutex::new(ConnectionState::Connected));

        let context = Context {
            shared: Arc::clone(&self.shared),
            cluster: self.cluster.clone(),
            handle: handle.clone(),
            state: Arc::clone(&state),
        };
        context.install(&rpc);

        debug!(connection = id, "peer connected");
        ConnectionHandler {
            handle,
            state,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Open an in-process connection to this broker.
    pub fn connect_local(&self) -> MemorySocket {
        MemorySocket::new(self.clone())
    }

    /// Accept WebSocket connections forever.
    ///
    /// Accept errors (e.g. running out of file descriptors) are logged and
    /// retried after a growing pause.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        info!("broker listening on {}", listener.local_addr()?);
        let mut failures = 0u32;
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    failures = 0;
                    let broker = self.clone();
                    let span = tracing::debug_span!("connection", %addr);
                    tokio::spawn(
                        async move {
                            if let Err(e) = broker.handle_socket(stream, addr).await {
                                debug!("connection ended with error: {e}");
                            }
                        }
                        .instrument(span),
                    );
                }
                Err(e) => {
                    let pause = accept_backoff(failures);
                    failures = failures.saturating_add(1);
                    error!(?pause, "accept error: {e}");
                    tokio::time::sleep(pause).await;
                }
            }
        }
    }

    async fn handle_socket(&self, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        let socket = tokio_tungstenite::accept_async(stream).await?;
        debug!(%addr, "websocket handshake complete");

        let (mut sink, mut source) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let connection = self.accept(tx);

        let outcome = async {
            loop {
                tokio::select! {
                    outbound = rx.recv() => match outbound {
                        Some(text) => sink.send(Message::Text(text)).await?,
                        None => break,
                    },
                    inbound = source.next() => match inbound {
                        Some(Ok(Message::Text(text))) => connection.receive(&text),
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(Error::from(e)),
                    },
                }
            }
            Ok::<(), Error>(())
        }
        .await;

        connection.close();
        outcome
    }
}

/// Pause before retrying `accept` after `failures` consecutive errors.
fn accept_backoff(failures: u32) -> Duration {
    ACCEPT_BACKOFF_BASE
        .saturating_mul(2u32.saturating_pow(failures))
        .min(ACCEPT_BACKOFF_MAX)
}

/// Server side of one inbound connection.
///
/// Closing (or dropping) the handler releases its registration and rejects
/// the connection's own pending requests.
pub struct ConnectionHandler {
    handle: ConnectionHandle,
    state: Arc<Mutex<ConnectionState>>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ConnectionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandler")
            .field("id", &self.handle.id)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl ConnectionHandler {
    /// Feed raw inbound data from the connection.
    pub fn receive(&self, data: &str) {
        self.handle.rpc.receive(data);
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state.lock().clone()
    }

    /// Id bound to this connection, if any.
    pub fn peer_id(&self) -> Option<String> {
        self.state.lock().bound_id().map(str::to_owned)
    }

    /// Release the registration and shut the protocol instance down. Idempotent.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state == ConnectionState::Closed {
                return;
            }
            *state = ConnectionState::Closed;
        }
        if let Some(id) = self.shared.registry.lock().unregister(&self.handle) {
            info!(connection = self.handle.id, %id, "unregistered on disconnect");
        }
        self.handle.rpc.close("connection closed");
        debug!(connection = self.handle.id, "peer disconnected");
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        self.close();
    }
}

/// Everything a method handler needs about its connection.
#[derive(Clone)]
struct Context {
    shared: Arc<Shared>,
    cluster: Option<Cluster>,
    handle: ConnectionHandle,
    state: Arc<Mutex<ConnectionState>>,
}

impl Context {
    fn install(&self, rpc: &RpcPeer) {
        rpc.on("ping", |_| async { Ok(json!("pong")) });

        let ctx = self.clone();
        rpc.on("register", move |params| {
            let ctx = ctx.clone();
            async move { ctx.register(params).await }
        });

        let ctx = self.clone();
        rpc.on("unregister", move |_| std::future::ready(Ok(ctx.unregister())));

        for method in ["find", "exists"] {
            let ctx = self.clone();
            rpc.on(method, move |params| {
                let ctx = ctx.clone();
                async move {
                    let IdParams { id } = serde_json::from_value(params)?;
                    Ok(Value::Bool(ctx.exists(&id).await))
                }
            });
        }

        // signals are routed inside the closure so they keep their arrival order
        let ctx = self.clone();
        rpc.on("signal", move |params| std::future::ready(ctx.signal(params)));
    }

    async fn register(&self, params: Value) -> Result<Value> {
        let IdParams { id } = serde_json::from_value(params)?;

        let owner = self.shared.registry.lock().find(&id).cloned();
        match owner {
            Some(owner) if owner == self.handle => return Ok(json!(id)),
            Some(_) => return Err(Error::IdentifierTaken(id)),
            None => {}
        }

        if let Some(cluster) = &self.cluster {
            if cluster.exists(&id).await {
                debug!(%id, "id is registered at another instance");
                return Err(Error::IdentifierTaken(id));
            }
        }

        let mut registry = self.shared.registry.lock();
        let mut state = self.state.lock();
        if *state == ConnectionState::Closed {
            return Err(Error::closed("connection closed"));
        }
        let outcome = registry.register(&self.handle, &id);
        *state = match registry.id_of(&self.handle) {
            Some(bound) => ConnectionState::Identified(bound.to_string()),
            None => ConnectionState::Connected,
        };
        let id = outcome?;
        info!(connection = self.handle.id, %id, "registered");
        Ok(json!(id))
    }

    fn unregister(&self) -> Value {
        let released = self.shared.registry.lock().unregister(&self.handle);
        let mut state = self.state.lock();
        if *state != ConnectionState::Closed {
            *state = ConnectionState::Connected;
        }
        if let Some(id) = released {
            info!(connection = self.handle.id, %id, "unregistered");
        }
        Value::Null
    }

    async fn exists(&self, id: &str) -> bool {
        if self.shared.registry.lock().contains(id) {
            return true;
        }
        match &self.cluster {
            Some(cluster) => cluster.exists(id).await,
            None => false,
        }
    }

    fn signal(&self, params: Value) -> Result<Value> {
        let params: SignalParams = serde_json::from_value(params)?;

        let bound = self.state.lock().bound_id().map(str::to_owned);
        if bound.as_deref() != Some(params.from.as_str()) {
            return Err(Error::InvalidSender {
                from: params.from,
                bound,
            });
        }

        let target = self.shared.registry.lock().find(&params.to).cloned();
        if let Some(target) = target {
            target.rpc.notify("signal", serde_json::to_value(&params)?)?;
            return Ok(Value::Null);
        }

        if let Some(cluster) = &self.cluster {
            cluster.signal(params)?;
            return Ok(Value::Null);
        }

        Err(Error::PeerNotFound(params.to))
    }
}
