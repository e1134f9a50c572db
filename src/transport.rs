//! Client-side socket boundary.
//!
//! A [`Socket`] is a persistent text channel to a broker with a readiness
//! state and a stream of [`SocketEvent`]s. Two implementations ship here:
//! [`WsSocket`] dials a broker over WebSocket and reconnects with backoff,
//! [`MemorySocket`] attaches to a [`Broker`] in the same process.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace, Instrument};

use crate::config::ReconnectConfig;
use crate::server::{Broker, ConnectionHandler};
use crate::{Error, Result};

/// Buffered socket events per subscriber.
pub const EVENT_CAPACITY: usize = 1024;

/// Readiness of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// Dialing, or waiting to redial after a drop.
    Connecting,
    /// Messages can be sent.
    Open,
    /// `close()` was called and the socket is shutting down.
    Closing,
    /// Terminal.
    Closed,
}

/// Something that happened on a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// The socket became open.
    Open,
    /// The socket dropped. It may open again unless its state is `Closed`.
    Close,
    /// A transport-level failure.
    Error(String),
    /// Inbound text.
    Message(String),
}

/// Persistent message channel to a broker.
pub trait Socket: Send + Sync + 'static {
    /// Send text. Fails unless the socket is open.
    fn send(&self, data: String) -> Result<()>;

    /// Current readiness.
    fn ready_state(&self) -> ReadyState;

    /// Current readiness together with a receiver for every later event.
    ///
    /// Both are captured atomically: an event observed on the receiver
    /// always happened after the returned state.
    fn subscribe(&self) -> (ReadyState, broadcast::Receiver<SocketEvent>);

    /// Close the socket for good.
    fn close(&self);
}

/// Readiness plus event fan-out, updated together.
#[derive(Debug)]
struct SocketCore {
    state: Mutex<ReadyState>,
    events: broadcast::Sender<SocketEvent>,
}

impl SocketCore {
    fn new(state: ReadyState) -> Self {
        Self {
            state: Mutex::new(state),
            events: broadcast::channel(EVENT_CAPACITY).0,
        }
    }

    fn transition(&self, next: ReadyState, event: Option<SocketEvent>) {
        let mut state = self.state.lock();
        *state = next;
        if let Some(event) = event {
            let _ = self.events.send(event);
        }
    }

    fn emit(&self, event: SocketEvent) {
        let _ = self.events.send(event);
    }

    fn get(&self) -> ReadyState {
        *self.state.lock()
    }

    fn subscribe(&self) -> (ReadyState, broadcast::Receiver<SocketEvent>) {
        let state = self.state.lock();
        (*state, self.events.subscribe())
    }
}

// ============================================================================
// WebSocket
// ============================================================================

type Outbound = Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>;

/// WebSocket client that redials with exponential backoff until closed.
#[derive(Debug)]
pub struct WsSocket {
    core: Arc<SocketCore>,
    outbound: Outbound,
    shutdown_tx: broadcast::Sender<()>,
}

impl WsSocket {
    /// Start dialing `url`. Must be called from within a tokio runtime.
    pub fn connect(url: impl Into<String>, config: ReconnectConfig) -> Self {
        let url = url.into();
        let core = Arc::new(SocketCore::new(ReadyState::Connecting));
        let outbound: Outbound = Arc::new(Mutex::new(None));
        let (shutdown_tx, _) = broadcast::channel(1);

        let span = tracing::debug_span!("ws_socket", url = %url);
        tokio::spawn(
            run_ws(
                url,
                config,
                Arc::clone(&core),
                Arc::clone(&outbound),
                shutdown_tx.subscribe(),
            )
            .instrument(span),
        );

        Self {
            core,
            outbound,
            shutdown_tx,
        }
    }
}

impl Socket for WsSocket {
    fn send(&self, data: String) -> Result<()> {
        let outbound = self.outbound.lock();
        let tx = outbound
            .as_ref()
            .ok_or_else(|| Error::closed("websocket not open"))?;
        tx.send(data).map_err(|_| Error::closed("websocket not open"))
    }

    fn ready_state(&self) -> ReadyState {
        self.core.get()
    }

    fn subscribe(&self) -> (ReadyState, broadcast::Receiver<SocketEvent>) {
        self.core.subscribe()
    }

    fn close(&self) {
        {
            let mut state = self.core.state.lock();
            if *state == ReadyState::Closed {
                return;
            }
            *state = ReadyState::Closing;
        }
        let _ = self.shutdown_tx.send(());
    }
}

impl Drop for WsSocket {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

async fn run_ws(
    url: String,
    config: ReconnectConfig,
    core: Arc<SocketCore>,
    outbound: Outbound,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut attempt = 0u32;
    loop {
        if core.get() != ReadyState::Closing {
            core.transition(ReadyState::Connecting, None);
        }

        let dialed = tokio::select! {
            _ = shutdown_rx.recv() => break,
            dialed = tokio_tungstenite::connect_async(url.as_str()) => dialed,
        };

        match dialed {
            Ok((socket, _)) => {
                debug!("connected");
                attempt = 0;
                let (tx, rx) = mpsc::unbounded_channel();
                *outbound.lock() = Some(tx);
                core.transition(ReadyState::Open, Some(SocketEvent::Open));

                let stop = pump_ws(socket, rx, &core, &mut shutdown_rx).await;
                *outbound.lock() = None;
                if stop {
                    break;
                }
                debug!("disconnected");
                core.transition(ReadyState::Connecting, Some(SocketEvent::Close));
            }
            Err(e) => {
                debug!(attempt, "connect failed: {e}");
                core.emit(SocketEvent::Error(e.to_string()));
            }
        }

        let delay = config.delay(attempt);
        attempt = attempt.saturating_add(1);
        trace!(?delay, "waiting before reconnect");
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    *outbound.lock() = None;
    core.transition(ReadyState::Closed, Some(SocketEvent::Close));
    debug!("websocket closed");
}

/// Shuttle messages until the connection drops. Returns `true` on shutdown.
async fn pump_ws<S>(
    socket: WebSocketStream<S>,
    mut rx: mpsc::UnboundedReceiver<String>,
    core: &SocketCore,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> bool
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut source) = socket.split();
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                core.transition(ReadyState::Closing, None);
                let _ = sink.close().await;
                return true;
            }
            outbound = rx.recv() => match outbound {
                Some(text) => {
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        core.emit(SocketEvent::Error(e.to_string()));
                        return false;
                    }
                }
                None => return false,
            },
            inbound = source.next() => match inbound {
                Some(Ok(Message::Text(text))) => core.emit(SocketEvent::Message(text)),
                Some(Ok(Message::Close(_))) | None => return false,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    core.emit(SocketEvent::Error(e.to_string()));
                    return false;
                }
            },
        }
    }
}

// ============================================================================
// In-process
// ============================================================================

/// Socket attached directly to a [`Broker`] in the same process.
///
/// Opens immediately. [`reconnect`](MemorySocket::reconnect) simulates a
/// dropped connection being re-established: the broker sees a disconnect
/// followed by a fresh connection.
#[derive(Debug, Clone)]
pub struct MemorySocket {
    inner: Arc<MemoryInner>,
}

#[derive(Debug)]
struct MemoryInner {
    broker: Broker,
    core: Arc<SocketCore>,
    link: Mutex<Option<MemoryLink>>,
}

#[derive(Debug)]
struct MemoryLink {
    connection: ConnectionHandler,
    pump: JoinHandle<()>,
}

impl Drop for MemoryLink {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

impl MemorySocket {
    /// Open a new connection to `broker`. Must be called from within a tokio runtime.
    pub fn new(broker: Broker) -> Self {
        let socket = Self {
            inner: Arc::new(MemoryInner {
                broker,
                core: Arc::new(SocketCore::new(ReadyState::Connecting)),
                link: Mutex::new(None),
            }),
        };
        socket.open();
        socket
    }

    fn open(&self) {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let connection = self.inner.broker.accept(tx);

        let mut link = self.inner.link.lock();
        self.inner
            .core
            .transition(ReadyState::Open, Some(SocketEvent::Open));
        let core = Arc::clone(&self.inner.core);
        let pump = tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                core.emit(SocketEvent::Message(text));
            }
        });
        *link = Some(MemoryLink { connection, pump });
    }

    /// Drop the current connection and open a new one.
    pub fn reconnect(&self) {
        if self.inner.core.get() != ReadyState::Open {
            return;
        }
        let old = self.inner.link.lock().take();
        drop(old);
        self.inner
            .core
            .transition(ReadyState::Connecting, Some(SocketEvent::Close));
        self.open();
    }
}

impl Socket for MemorySocket {
    fn send(&self, data: String) -> Result<()> {
        let link = self.inner.link.lock();
        match link.as_ref() {
            Some(link) if self.inner.core.get() == ReadyState::Open => {
                link.connection.receive(&data);
                Ok(())
            }
            _ => Err(Error::closed("socket not open")),
        }
    }

    fn ready_state(&self) -> ReadyState {
        self.inner.core.get()
    }

    fn subscribe(&self) -> (ReadyState, broadcast::Receiver<SocketEvent>) {
        self.inner.core.subscribe()
    }

    fn close(&self) {
        if self.inner.core.get() == ReadyState::Closed {
            return;
        }
        self.inner.core.transition(ReadyState::Closing, None);
        let old = self.inner.link.lock().take();
        drop(old);
        self.inner
            .core
            .transition(ReadyState::Closed, Some(SocketEvent::Close));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;
    use serde_json::{json, Value};
    use std::time::Duration;

    async fn next_event(rx: &mut broadcast::Receiver<SocketEvent>) -> SocketEvent {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("no socket event")
            .expect("event stream closed")
    }

    #[tokio::test]
    async fn test_memory_socket_round_trip() {
        let broker = Broker::new(BrokerConfig::default());
        let socket = broker.connect_local();
        let (state, mut events) = socket.subscribe();
        assert_eq!(state, ReadyState::Open);

        socket
            .send(json!({"id": "1", "method": "ping", "params": {}}).to_string())
            .unwrap();
        match next_event(&mut events).await {
            SocketEvent::Message(text) => {
                let reply: Value = serde_json::from_str(&text).unwrap();
                assert_eq!(reply["result"], "pong");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_memory_socket_reconnect_drops_registration() {
        let broker = Broker::new(BrokerConfig::default());
        let socket = broker.connect_local();
        let (_, mut events) = socket.subscribe();

        socket
            .send(json!({"id": "1", "method": "register", "params": {"id": "peer1"}}).to_string())
            .unwrap();
        assert!(matches!(next_event(&mut events).await, SocketEvent::Message(_)));
        assert!(broker.is_registered("peer1"));

        socket.reconnect();
        assert_eq!(next_event(&mut events).await, SocketEvent::Close);
        assert_eq!(next_event(&mut events).await, SocketEvent::Open);
        assert!(!broker.is_registered("peer1"));
        assert_eq!(socket.ready_state(), ReadyState::Open);
    }

    #[tokio::test]
    async fn test_memory_socket_close_is_terminal() {
        let broker = Broker::new(BrokerConfig::default());
        let socket = broker.connect_local();
        let (_, mut events) = socket.subscribe();

        socket.close();
        assert_eq!(next_event(&mut events).await, SocketEvent::Close);
        assert_eq!(socket.ready_state(), ReadyState::Closed);
        assert!(socket.send("{}".into()).is_err());

        socket.reconnect();
        assert_eq!(socket.ready_state(), ReadyState::Closed);
    }

    #[tokio::test]
    async fn test_ws_socket_gives_up_after_close() {
        // nothing listens on port 9 of localhost
        let socket = WsSocket::connect(
            "ws://127.0.0.1:9",
            ReconnectConfig {
                initial_delay: Duration::from_millis(10),
                ..ReconnectConfig::default()
            },
        );
        let (_, mut events) = socket.subscribe();
        assert!(matches!(next_event(&mut events).await, SocketEvent::Error(_)));
        assert!(socket.send("{}".into()).is_err());

        socket.close();
        loop {
            if next_event(&mut events).await == SocketEvent::Close {
                break;
            }
        }
        assert_eq!(socket.ready_state(), ReadyState::Closed);
    }
}
