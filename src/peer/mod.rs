//! Client-side orchestrator.
//!
//! A [`Peer`] registers its id at a broker and keeps one [`Connection`] per
//! remote peer. Connections are created lazily: as the offering side on
//! [`Peer::connect`] or [`Peer::send`], and as the answering side when the
//! first signal from an unknown remote arrives.
//!
//! ```no_run
//! use std::sync::Arc;
//! use linkup::peer::{create_peer, MemoryChannelHub, PeerEvent};
//!
//! # async fn run() -> linkup::Result<()> {
//! let hub = Arc::new(MemoryChannelHub::new());
//! let peer1 = create_peer("peer1", "ws://localhost:5000", hub.clone());
//! let peer2 = create_peer("peer2", "ws://localhost:5000", hub);
//!
//! let mut events = peer2.subscribe();
//! peer1.send("peer2", "hi").await?;
//! while let Ok(event) = events.recv().await {
//!     if let PeerEvent::Message { from, message } = event {
//!         println!("{from}: {message}");
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod channel;
mod connection;

pub use channel::{DataChannel, DataChannelEvent, DataChannelFactory, MemoryChannelHub};
pub use connection::{Connection, ConnectionState};

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, trace, Instrument};

use crate::client::{BrokerClient, BrokerEvent};
use crate::config::{PeerConfig, ReconnectConfig};
use crate::envelope::SignalParams;
use crate::transport::{ReadyState, Socket, WsSocket};
use crate::{Error, Result};

/// Buffered orchestrator events per subscriber.
pub const EVENT_CAPACITY: usize = 256;

/// Something a [`Peer`] reports to its subscribers.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// Data received from a remote peer.
    Message {
        /// Remote peer id.
        from: String,
        /// Decoded message.
        message: Value,
    },
    /// An asynchronous failure with no caller to report it to.
    Error(Arc<Error>),
    /// A connection to this remote peer was created.
    Connection(String),
    /// The broker accepted this peer's id.
    Register(String),
}

/// Outcome of the latest registration attempt.
#[derive(Debug, Clone)]
enum Registration {
    /// Waiting for the socket to open or for the broker to answer.
    Pending,
    Registered,
    /// The broker refused the id. Kept until the socket opens again.
    Failed(Arc<Error>),
    /// [`Peer::close`] ran. Terminal.
    Closed,
}

struct PeerInner {
    id: String,
    broker: BrokerClient,
    factory: Arc<dyn DataChannelFactory>,
    connections: Mutex<HashMap<String, Arc<Connection>>>,
    registration: watch::Sender<Registration>,
    events: broadcast::Sender<PeerEvent>,
}

/// Create a peer that talks to the broker at `broker_url` over WebSocket.
///
/// Must be called from within a tokio runtime.
pub fn create_peer(
    id: impl Into<String>,
    broker_url: &str,
    factory: Arc<dyn DataChannelFactory>,
) -> Peer {
    let socket = WsSocket::connect(broker_url, ReconnectConfig::default());
    Peer::with_socket(id, Arc::new(socket), factory, PeerConfig::default())
}

/// Handle for one peer identity and all of its remote connections.
///
/// Cheap to clone.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.inner.id)
            .field("registered", &self.is_registered())
            .field("connections", &self.connected_peers())
            .finish()
    }
}

impl Peer {
    /// Create a peer on top of an already constructed broker socket.
    ///
    /// The peer registers `id` every time the socket opens. Must be called
    /// from within a tokio runtime.
    pub fn with_socket(
        id: impl Into<String>,
        socket: Arc<dyn Socket>,
        factory: Arc<dyn DataChannelFactory>,
        config: PeerConfig,
    ) -> Self {
        let id = id.into();
        let (broker, broker_events) = BrokerClient::new(socket, &config);
        let inner = Arc::new(PeerInner {
            id: id.clone(),
            broker,
            factory,
            connections: Mutex::new(HashMap::new()),
            registration: watch::Sender::new(Registration::Pending),
            events: broadcast::channel(EVENT_CAPACITY).0,
        });

        tokio::spawn(
            run_broker_events(Arc::downgrade(&inner), broker_events)
                .instrument(tracing::debug_span!("peer", %id)),
        );
        Self { inner }
    }

    /// This peer's id.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Subscribe to events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.inner.events.subscribe()
    }

    /// Whether the broker currently has this peer's id registered.
    pub fn is_registered(&self) -> bool {
        matches!(*self.inner.registration.borrow(), Registration::Registered)
    }

    /// Resolve with the id once registration at the broker completed.
    ///
    /// Fails with the broker's error if the latest attempt was refused, and
    /// with [`Error::TransportClosed`] once the peer or its socket is closed.
    pub async fn wait_until_registered(&self) -> Result<String> {
        self.inner.wait_until_registered().await
    }

    /// Remote ids with a live connection.
    pub fn connected_peers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.connections.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Live connection to `remote_id`, if any.
    pub fn connection(&self, remote_id: &str) -> Option<Arc<Connection>> {
        self.inner.live_connection(remote_id)
    }

    /// Connect to `remote_id`, reusing a live connection if there is one.
    pub async fn connect(&self, remote_id: &str) -> Result<Arc<Connection>> {
        if remote_id == self.inner.id {
            return Err(Error::SelfConnect);
        }
        if let Some(connection) = self.inner.live_connection(remote_id) {
            return Ok(connection);
        }

        self.inner.wait_until_registered().await?;
        if !self.inner.broker.exists(remote_id).await? {
            return Err(Error::PeerNotFound(remote_id.to_string()));
        }

        // an inbound signal may have created the connection meanwhile
        Ok(PeerInner::get_or_create(&self.inner, remote_id, true))
    }

    /// Send `message` as JSON to `remote_id`, connecting first if needed.
    pub async fn send<T: Serialize + ?Sized>(&self, remote_id: &str, message: &T) -> Result<()> {
        trace!(to = %remote_id, "sending message");
        let connection = self.connect(remote_id).await?;
        connection.send(message).await
    }

    /// Close the connection to `remote_id`. No-op without one.
    pub async fn disconnect(&self, remote_id: &str) {
        let connection = self.inner.connections.lock().remove(remote_id);
        if let Some(connection) = connection {
            debug!(remote = %remote_id, "disconnecting");
            connection.close().await;
        }
    }

    /// Close the broker connection, then every peer connection.
    pub async fn close(&self) {
        self.inner.broker.close();
        self.inner.registration.send_replace(Registration::Closed);

        let connections: Vec<Arc<Connection>> = self
            .inner
            .connections
            .lock()
            .drain()
            .map(|(_, connection)| connection)
            .collect();
        join_all(connections.iter().map(|connection| connection.close())).await;
        debug!(id = %self.inner.id, "peer closed");
    }
}

impl PeerInner {
    fn emit(&self, event: PeerEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn emit_error(&self, error: Error) {
        debug!("peer error: {error}");
        self.emit(PeerEvent::Error(Arc::new(error)));
    }

    async fn wait_until_registered(&self) -> Result<String> {
        if matches!(
            self.broker.ready_state(),
            ReadyState::Closing | ReadyState::Closed
        ) {
            return Err(Error::closed("broker socket is closed"));
        }
        let mut rx = self.registration.subscribe();
        let outcome = rx
            .wait_for(|state| !matches!(state, Registration::Pending))
            .await
            .map_err(|_| Error::closed("peer dropped"))?
            .clone();
        match outcome {
            Registration::Registered => Ok(self.id.clone()),
            Registration::Failed(e) => Err(replay(&e)),
            Registration::Closed | Registration::Pending => Err(Error::closed("peer closed")),
        }
    }

    /// Move to `next` unless the peer is already closed.
    fn set_registration(&self, next: Registration) {
        self.registration.send_if_modified(|state| {
            if matches!(state, Registration::Closed) {
                return false;
            }
            *state = next;
            true
        });
    }

    /// Registration goes back to pending on a drop, or ends for good when
    /// the socket itself was closed.
    fn socket_dropped(&self) {
        match self.broker.ready_state() {
            ReadyState::Closing | ReadyState::Closed => {
                self.registration.send_replace(Registration::Closed);
            }
            _ => self.set_registration(Registration::Pending),
        }
    }

    fn live_connection(&self, remote_id: &str) -> Option<Arc<Connection>> {
        self.connections
            .lock()
            .get(remote_id)
            .filter(|connection| !connection.is_closed())
            .cloned()
    }

    /// Return the live connection to `remote_id` or create one.
    fn get_or_create(this: &Arc<Self>, remote_id: &str, initiator: bool) -> Arc<Connection> {
        let (connection, events) = {
            let mut connections = this.connections.lock();
            if let Some(existing) = connections.get(remote_id).filter(|c| !c.is_closed()) {
                return Arc::clone(existing);
            }
            let (channel, events) = this.factory.create(initiator);
            let connection = Arc::new(Connection::new(remote_id.to_string(), initiator, channel));
            connections.insert(remote_id.to_string(), Arc::clone(&connection));
            (connection, events)
        };

        debug!(remote = %remote_id, initiator, "connection created");
        tokio::spawn(
            run_connection(Arc::downgrade(this), Arc::clone(&connection), events)
                .instrument(tracing::debug_span!("connection", remote = %remote_id)),
        );
        this.emit(PeerEvent::Connection(remote_id.to_string()));
        connection
    }

    fn register(this: &Arc<Self>) {
        this.set_registration(Registration::Pending);
        let weak = Arc::downgrade(this);
        let broker = this.broker.clone();
        let id = this.id.clone();
        tokio::spawn(async move {
            let outcome = broker.register(&id).await;
            let Some(this) = weak.upgrade() else {
                return;
            };
            match outcome {
                Ok(id) => {
                    info!(%id, "registered at broker");
                    this.set_registration(Registration::Registered);
                    this.emit(PeerEvent::Register(id));
                }
                Err(e) => {
                    debug!("registration failed: {e}");
                    let e = Arc::new(e);
                    this.set_registration(Registration::Failed(Arc::clone(&e)));
                    this.emit(PeerEvent::Error(e));
                }
            }
        });
    }

    fn handle_signal(this: &Arc<Self>, signal: SignalParams) {
        if signal.to != this.id {
            trace!(to = %signal.to, "ignoring signal addressed to another peer");
            return;
        }
        let connection = Self::get_or_create(this, &signal.from, false);
        if let Err(e) = connection.signal(signal.payload) {
            this.emit_error(e);
        }
    }

    fn evict(&self, connection: &Arc<Connection>) {
        let mut connections = self.connections.lock();
        let current = connections.get(connection.remote_id());
        if current.is_some_and(|current| Arc::ptr_eq(current, connection)) {
            connections.remove(connection.remote_id());
            debug!(remote = %connection.remote_id(), "connection evicted");
        }
    }
}

/// Rebuild a shared error for another caller.
fn replay(error: &Error) -> Error {
    match error {
        Error::TransportClosed(reason) => Error::TransportClosed(reason.clone()),
        Error::Transport(reason) => Error::Transport(reason.clone()),
        Error::Timeout => Error::Timeout,
        other => Error::from(other.to_rpc_error()),
    }
}

async fn run_broker_events(peer: Weak<PeerInner>, mut events: mpsc::UnboundedReceiver<BrokerEvent>) {
    while let Some(event) = events.recv().await {
        let Some(peer) = peer.upgrade() else {
            break;
        };
        match event {
            BrokerEvent::Open => PeerInner::register(&peer),
            BrokerEvent::Close => peer.socket_dropped(),
            BrokerEvent::Error(e) => {
                peer.emit(PeerEvent::Error(e));
            }
            BrokerEvent::Signal(signal) => PeerInner::handle_signal(&peer, signal),
        }
    }
    trace!("broker event stream ended");
}

async fn run_connection(
    peer: Weak<PeerInner>,
    connection: Arc<Connection>,
    mut events: mpsc::UnboundedReceiver<DataChannelEvent>,
) {
    let remote_id = connection.remote_id().to_string();
    while let Some(event) = events.recv().await {
        let Some(peer) = peer.upgrade() else {
            break;
        };
        match event {
            DataChannelEvent::Signal(payload) => {
                let signal = SignalParams {
                    from: peer.id.clone(),
                    to: remote_id.clone(),
                    payload,
                };
                // awaited in place so the remote side sees payloads in order
                if let Err(e) = peer.broker.signal(signal).await {
                    peer.emit_error(e);
                }
            }
            DataChannelEvent::Connect => {
                debug!("connected");
                connection.mark_open();
            }
            DataChannelEvent::Data(text) => {
                let message =
                    serde_json::from_str(&text).unwrap_or_else(|_| Value::String(text));
                peer.emit(PeerEvent::Message {
                    from: remote_id.clone(),
                    message,
                });
            }
            DataChannelEvent::Close => {
                debug!("disconnected");
                connection.mark_closed();
                peer.evict(&connection);
                break;
            }
            DataChannelEvent::Error(e) => peer.emit_error(Error::transport(e)),
        }
    }
    connection.mark_closed();
}
