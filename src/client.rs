//! Client-side wrapper around the broker connection.
//!
//! [`BrokerClient`] puts a protocol instance on top of a [`Socket`], keeps the
//! socket alive with periodic pings and exposes the broker's methods as typed
//! calls. Inbound signals and socket lifecycle changes are reported on an
//! event channel returned alongside the client.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, Interval};
use tracing::{debug, trace, warn, Instrument};

use crate::config::PeerConfig;
use crate::envelope::SignalParams;
use crate::rpc::RpcPeer;
use crate::transport::{ReadyState, Socket, SocketEvent};
use crate::{Error, Result};

/// Lifecycle and inbound traffic of a broker connection.
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    /// The socket opened (initially or after a reconnect).
    Open,
    /// The socket dropped.
    Close,
    /// Transport or keepalive failure with no caller to report it to.
    Error(Arc<Error>),
    /// A signal relayed by the broker.
    Signal(SignalParams),
}

struct ClientInner {
    socket: Arc<dyn Socket>,
    rpc: RpcPeer,
    shutdown_tx: broadcast::Sender<()>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Protocol client for one broker.
///
/// Cheap to clone. Stops pumping socket events once the last clone is dropped.
#[derive(Clone)]
pub struct BrokerClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for BrokerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerClient")
            .field("ready_state", &self.ready_state())
            .field("rpc", &self.inner.rpc)
            .finish()
    }
}

impl BrokerClient {
    /// Attach to `socket`. Must be called from within a tokio runtime.
    pub fn new(
        socket: Arc<dyn Socket>,
        config: &PeerConfig,
    ) -> (Self, mpsc::UnboundedReceiver<BrokerEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let sender = Arc::clone(&socket);
        let rpc = RpcPeer::new(&config.rpc, move |text| sender.send(text));

        let signals = events_tx.clone();
        rpc.on("signal", move |params| {
            let delivered = serde_json::from_value::<SignalParams>(params)
                .map_err(Error::from)
                .map(|signal| {
                    trace!(from = %signal.from, "signal received");
                    let _ = signals.send(BrokerEvent::Signal(signal));
                });
            std::future::ready(delivered.map(|_| Value::Null))
        });

        let (shutdown_tx, _) = broadcast::channel(1);
        let (state, socket_events) = socket.subscribe();
        tokio::spawn(
            run_client(
                rpc.clone(),
                state,
                socket_events,
                events_tx,
                config.ping_interval,
                shutdown_tx.subscribe(),
            )
            .instrument(tracing::debug_span!("broker_client")),
        );

        let client = Self {
            inner: Arc::new(ClientInner {
                socket,
                rpc,
                shutdown_tx,
            }),
        };
        (client, events_rx)
    }

    /// Readiness of the underlying socket.
    pub fn ready_state(&self) -> ReadyState {
        self.inner.socket.ready_state()
    }

    /// Resolve once the socket is open.
    ///
    /// Returns at once when already open, waits while connecting, and fails
    /// with [`Error::TransportClosed`] when closing or closed.
    pub async fn wait_until_connected(&self) -> Result<()> {
        let (state, mut events) = self.inner.socket.subscribe();
        match state {
            ReadyState::Open => return Ok(()),
            ReadyState::Closing => return Err(Error::closed("socket is closing")),
            ReadyState::Closed => return Err(Error::closed("socket is closed")),
            ReadyState::Connecting => {}
        }
        loop {
            match events.recv().await {
                Ok(SocketEvent::Open) => return Ok(()),
                Ok(SocketEvent::Close) | Err(broadcast::error::RecvError::Lagged(_)) => {
                    match self.ready_state() {
                        ReadyState::Open => return Ok(()),
                        ReadyState::Connecting => {}
                        _ => return Err(Error::closed("socket is closed")),
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(Error::closed("socket is closed"))
                }
            }
        }
    }

    /// Register `id` at the broker and return the id it bound.
    pub async fn register(&self, id: &str) -> Result<String> {
        self.wait_until_connected().await?;
        let result = self.inner.rpc.request("register", json!({ "id": id })).await?;
        serde_json::from_value(result).map_err(Error::from)
    }

    /// Release this connection's id at the broker.
    pub async fn unregister(&self) -> Result<()> {
        self.wait_until_connected().await?;
        self.inner.rpc.request("unregister", json!({})).await?;
        Ok(())
    }

    /// Whether `id` is registered anywhere in the broker's cluster.
    pub async fn exists(&self, id: &str) -> Result<bool> {
        self.wait_until_connected().await?;
        let result = self.inner.rpc.request("find", json!({ "id": id })).await?;
        Ok(match result {
            Value::Bool(found) => found,
            Value::Null => false,
            _ => true,
        })
    }

    /// Relay a signaling payload to another peer through the broker.
    pub async fn signal(&self, params: SignalParams) -> Result<()> {
        self.wait_until_connected().await?;
        self.inner
            .rpc
            .request("signal", serde_json::to_value(&params)?)
            .await?;
        Ok(())
    }

    /// Close the socket and reject everything still in flight.
    pub fn close(&self) {
        self.inner.socket.close();
        self.inner.rpc.close("broker client closed");
        let _ = self.inner.shutdown_tx.send(());
    }
}

fn keepalive(period: Duration) -> Interval {
    tokio::time::interval_at(Instant::now() + period, period)
}

async fn run_client(
    rpc: RpcPeer,
    initial: ReadyState,
    mut socket_events: broadcast::Receiver<SocketEvent>,
    events: mpsc::UnboundedSender<BrokerEvent>,
    ping_interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut ping = keepalive(ping_interval);
    let mut open = initial == ReadyState::Open;
    if open {
        let _ = events.send(BrokerEvent::Open);
    }

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!("broker client received shutdown signal");
                break;
            }
            _ = ping.tick(), if open => {
                trace!("sending keepalive ping");
                let call = rpc.request("ping", json!({}));
                let events = events.clone();
                tokio::spawn(async move {
                    if let Err(e) = call.await {
                        let _ = events.send(BrokerEvent::Error(Arc::new(e)));
                    }
                });
            }
            event = socket_events.recv() => match event {
                Ok(SocketEvent::Open) => {
                    debug!("connected to broker");
                    ping.reset();
                    open = true;
                    let _ = events.send(BrokerEvent::Open);
                }
                Ok(SocketEvent::Close) => {
                    debug!("disconnected from broker");
                    open = false;
                    rpc.fail_pending("broker socket closed");
                    let _ = events.send(BrokerEvent::Close);
                }
                Ok(SocketEvent::Error(e)) => {
                    debug!("broker socket error: {e}");
                    let _ = events.send(BrokerEvent::Error(Arc::new(Error::transport(e))));
                }
                Ok(SocketEvent::Message(text)) => rpc.receive(&text),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    // skipped messages may have carried responses
                    warn!(skipped = n, "broker client fell behind socket events");
                    rpc.fail_pending("broker client fell behind socket events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;
    use crate::server::Broker;

    fn client(broker: &Broker, config: &PeerConfig) -> (BrokerClient, mpsc::UnboundedReceiver<BrokerEvent>) {
        BrokerClient::new(Arc::new(broker.connect_local()), config)
    }

    #[tokio::test]
    async fn test_register_exists_unregister() {
        let broker = Broker::new(BrokerConfig::default());
        let (alice, _) = client(&broker, &PeerConfig::default());
        let (bob, _) = client(&broker, &PeerConfig::default());

        assert_eq!(alice.register("alice").await.unwrap(), "alice");
        assert!(bob.exists("alice").await.unwrap());
        assert!(!bob.exists("carol").await.unwrap());

        alice.unregister().await.unwrap();
        assert!(!bob.exists("alice").await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_register_maps_to_typed_error() {
        let broker = Broker::new(BrokerConfig::default());
        let (alice, _) = client(&broker, &PeerConfig::default());
        let (mallory, _) = client(&broker, &PeerConfig::default());

        alice.register("alice").await.unwrap();
        let err = mallory.register("alice").await.unwrap_err();
        assert!(matches!(err, Error::IdentifierTaken(id) if id == "alice"));
    }

    #[tokio::test]
    async fn test_signal_reaches_target_as_event() {
        let broker = Broker::new(BrokerConfig::default());
        let (alice, _) = client(&broker, &PeerConfig::default());
        let (bob, mut bob_events) = client(&broker, &PeerConfig::default());
        alice.register("alice").await.unwrap();
        bob.register("bob").await.unwrap();

        let params = SignalParams {
            from: "alice".into(),
            to: "bob".into(),
            payload: json!({"type": "offer"}),
        };
        alice.signal(params.clone()).await.unwrap();

        loop {
            let event = tokio::time::timeout(Duration::from_secs(1), bob_events.recv())
                .await
                .unwrap()
                .unwrap();
            if let BrokerEvent::Signal(received) = event {
                assert_eq!(received, params);
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_closed_client_fails_fast() {
        let broker = Broker::new(BrokerConfig::default());
        let (alice, _) = client(&broker, &PeerConfig::default());
        alice.close();
        assert_eq!(alice.ready_state(), ReadyState::Closed);
        assert!(matches!(
            alice.wait_until_connected().await,
            Err(Error::TransportClosed(_))
        ));
        assert!(alice.register("alice").await.is_err());
    }

    /// Always-open socket whose events are pushed by the test.
    struct ScriptedSocket {
        events: broadcast::Sender<SocketEvent>,
        sent: mpsc::UnboundedSender<String>,
    }

    impl Socket for ScriptedSocket {
        fn send(&self, data: String) -> Result<()> {
            self.sent.send(data).map_err(|_| Error::closed("gone"))
        }

        fn ready_state(&self) -> ReadyState {
            ReadyState::Open
        }

        fn subscribe(&self) -> (ReadyState, broadcast::Receiver<SocketEvent>) {
            (ReadyState::Open, self.events.subscribe())
        }

        fn close(&self) {}
    }

    #[tokio::test]
    async fn test_lagging_behind_socket_fails_pending_requests() {
        let (sent, mut outbound) = mpsc::unbounded_channel();
        let socket = Arc::new(ScriptedSocket {
            events: broadcast::channel(2).0,
            sent,
        });
        let (client, _events) = BrokerClient::new(socket.clone(), &PeerConfig::default());

        let call = tokio::spawn({
            let client = client.clone();
            async move { client.exists("anyone").await }
        });
        outbound.recv().await.expect("request was sent");

        for i in 0..8 {
            let _ = socket.events.send(SocketEvent::Message(format!("noise {i}")));
        }
        let outcome = tokio::time::timeout(Duration::from_secs(1), call)
            .await
            .expect("pending request was not failed")
            .unwrap();
        assert!(matches!(outcome, Err(Error::TransportClosed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_pings_while_open() {
        let broker = Broker::new(BrokerConfig::default());
        let config = PeerConfig {
            ping_interval: Duration::from_secs(45),
            ..PeerConfig::default()
        };
        let socket = broker.connect_local();
        let (_, mut raw) = socket.subscribe();
        let (_client, mut events) = BrokerClient::new(Arc::new(socket), &config);
        assert!(matches!(events.recv().await, Some(BrokerEvent::Open)));

        tokio::time::sleep(Duration::from_secs(46)).await;
        let reply = tokio::time::timeout(Duration::from_secs(1), raw.recv())
            .await
            .expect("no keepalive reply")
            .unwrap();
        match reply {
            SocketEvent::Message(text) => assert!(text.contains("pong"), "got {text}"),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
