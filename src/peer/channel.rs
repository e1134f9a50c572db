//! Data-channel boundary.
//!
//! A [`DataChannel`] is the point-to-point transport a [`Peer`](super::Peer)
//! bootstraps through the broker. It produces opaque signaling payloads that
//! must reach the remote side, consumes the payloads the remote side produced,
//! and eventually connects. Nothing in this crate looks inside a payload.
//!
//! [`MemoryChannelHub`] is an in-process implementation: the offering side
//! emits `{"type": "offer", "token": n}`, the answering side replies with
//! `{"type": "answer", "token": n}` and both connect.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::trace;

use crate::{Error, Result};

/// Something that happened on a data channel.
#[derive(Debug, Clone, PartialEq)]
pub enum DataChannelEvent {
    /// A signaling payload to relay to the remote side.
    Signal(Value),
    /// The channel connected and data may flow.
    Connect,
    /// Inbound data.
    Data(String),
    /// The channel closed. Terminal.
    Close,
    /// A failure.
    Error(String),
}

/// Point-to-point transport under a peer connection.
#[async_trait]
pub trait DataChannel: Send + Sync + 'static {
    /// Feed a signaling payload produced by the remote side.
    fn signal(&self, payload: Value) -> Result<()>;

    /// Send data. Fails unless connected.
    fn send(&self, data: String) -> Result<()>;

    /// Tear the channel down; resolves once closed.
    async fn close(&self);
}

/// Creates data channels for new peer connections.
pub trait DataChannelFactory: Send + Sync + 'static {
    /// Create a channel. The initiator starts by emitting signaling payloads;
    /// the other side waits for the initiator's first payload.
    fn create(
        &self,
        initiator: bool,
    ) -> (Box<dyn DataChannel>, mpsc::UnboundedReceiver<DataChannelEvent>);
}

#[derive(Default)]
struct EndpointState {
    remote: Weak<Endpoint>,
    connected: bool,
    closed: bool,
}

struct Endpoint {
    events: mpsc::UnboundedSender<DataChannelEvent>,
    state: Mutex<EndpointState>,
}

impl Endpoint {
    fn shut(&self) -> Option<Arc<Endpoint>> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        state.closed = true;
        state.connected = false;
        let remote = std::mem::take(&mut state.remote).upgrade();
        drop(state);
        let _ = self.events.send(DataChannelEvent::Close);
        remote
    }
}

#[derive(Default)]
struct HubState {
    next_token: u64,
    offers: HashMap<u64, Weak<Endpoint>>,
}

/// In-process [`DataChannelFactory`]. Share one hub between all peers that
/// should be able to reach each other.
#[derive(Clone, Default)]
pub struct MemoryChannelHub {
    state: Arc<Mutex<HubState>>,
}

impl std::fmt::Debug for MemoryChannelHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryChannelHub")
            .field("open_offers", &self.state.lock().offers.len())
            .finish()
    }
}

impl MemoryChannelHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of offers still waiting for an answering side.
    pub fn open_offers(&self) -> usize {
        self.state.lock().offers.len()
    }

    fn withdraw(&self, token: u64) {
        if self.state.lock().offers.remove(&token).is_some() {
            trace!(token, "offer withdrawn");
        }
    }
}

impl DataChannelFactory for MemoryChannelHub {
    fn create(
        &self,
        initiator: bool,
    ) -> (Box<dyn DataChannel>, mpsc::UnboundedReceiver<DataChannelEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let endpoint = Arc::new(Endpoint {
            events,
            state: Mutex::new(EndpointState::default()),
        });

        let mut offer = None;
        if initiator {
            let token = {
                let mut hub = self.state.lock();
                hub.next_token += 1;
                let token = hub.next_token;
                hub.offers.insert(token, Arc::downgrade(&endpoint));
                token
            };
            trace!(token, "offering");
            offer = Some(token);
            let _ = endpoint
                .events
                .send(DataChannelEvent::Signal(json!({"type": "offer", "token": token})));
        }

        let channel = MemoryChannel {
            hub: self.clone(),
            endpoint,
            offer,
        };
        (Box::new(channel), rx)
    }
}

struct MemoryChannel {
    hub: MemoryChannelHub,
    endpoint: Arc<Endpoint>,
    offer: Option<u64>,
}

impl MemoryChannel {
    fn shut(&self) {
        if let Some(token) = self.offer {
            self.hub.withdraw(token);
        }
        if let Some(remote) = self.endpoint.shut() {
            remote.shut();
        }
    }
}

#[async_trait]
impl DataChannel for MemoryChannel {
    fn signal(&self, payload: Value) -> Result<()> {
        let token = payload["token"]
            .as_u64()
            .ok_or_else(|| Error::InvalidParams("signal without token".into()))?;

        match payload["type"].as_str() {
            Some("offer") => {
                let offerer = self
                    .hub
                    .state
                    .lock()
                    .offers
                    .remove(&token)
                    .and_then(|offer| offer.upgrade())
                    .ok_or_else(|| Error::closed(format!("offer {token} is gone")))?;

                offerer.state.lock().remote = Arc::downgrade(&self.endpoint);
                {
                    let mut state = self.endpoint.state.lock();
                    state.remote = Arc::downgrade(&offerer);
                    state.connected = true;
                }
                let _ = self.endpoint.events.send(DataChannelEvent::Signal(
                    json!({"type": "answer", "token": token}),
                ));
                let _ = self.endpoint.events.send(DataChannelEvent::Connect);
                Ok(())
            }
            Some("answer") => {
                let mut state = self.endpoint.state.lock();
                if state.closed || state.remote.upgrade().is_none() {
                    return Err(Error::closed("answer for a channel that is gone"));
                }
                if !state.connected {
                    state.connected = true;
                    drop(state);
                    let _ = self.endpoint.events.send(DataChannelEvent::Connect);
                }
                Ok(())
            }
            other => Err(Error::InvalidParams(format!(
                "unknown signal type {other:?}"
            ))),
        }
    }

    fn send(&self, data: String) -> Result<()> {
        let state = self.endpoint.state.lock();
        if !state.connected {
            return Err(Error::closed("data channel not connected"));
        }
        let remote = state
            .remote
            .upgrade()
            .ok_or_else(|| Error::closed("remote side is gone"))?;
        remote
            .events
            .send(DataChannelEvent::Data(data))
            .map_err(|_| Error::closed("remote side is gone"))
    }

    async fn close(&self) {
        self.shut();
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        self.shut();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expect_signal(rx: &mut mpsc::UnboundedReceiver<DataChannelEvent>) -> Value {
        match rx.try_recv() {
            Ok(DataChannelEvent::Signal(payload)) => payload,
            other => panic!("expected a signal, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_offer_answer_connects_both_sides() {
        let hub = MemoryChannelHub::new();
        let (offerer, mut offer_rx) = hub.create(true);
        let (answerer, mut answer_rx) = hub.create(false);

        let offer = expect_signal(&mut offer_rx);
        assert_eq!(offer["type"], "offer");
        assert!(offerer.send("early".into()).is_err());

        answerer.signal(offer).unwrap();
        let answer = expect_signal(&mut answer_rx);
        assert_eq!(answer_rx.try_recv().unwrap(), DataChannelEvent::Connect);

        offerer.signal(answer).unwrap();
        assert_eq!(offer_rx.try_recv().unwrap(), DataChannelEvent::Connect);

        offerer.send("hi".into()).unwrap();
        answerer.send("hello".into()).unwrap();
        assert_eq!(answer_rx.try_recv().unwrap(), DataChannelEvent::Data("hi".into()));
        assert_eq!(offer_rx.try_recv().unwrap(), DataChannelEvent::Data("hello".into()));
    }

    #[tokio::test]
    async fn test_closing_one_side_closes_both() {
        let hub = MemoryChannelHub::new();
        let (offerer, mut offer_rx) = hub.create(true);
        let (answerer, mut answer_rx) = hub.create(false);
        answerer.signal(expect_signal(&mut offer_rx)).unwrap();
        offerer.signal(expect_signal(&mut answer_rx)).unwrap();
        let _ = offer_rx.try_recv();
        let _ = answer_rx.try_recv();

        answerer.close().await;
        assert_eq!(answer_rx.try_recv().unwrap(), DataChannelEvent::Close);
        assert_eq!(offer_rx.try_recv().unwrap(), DataChannelEvent::Close);
        assert!(offerer.send("late".into()).is_err());

        // a second close is a no-op
        offerer.close().await;
        assert!(offer_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unanswered_offer_is_withdrawn() {
        let hub = MemoryChannelHub::new();
        let (closed, _closed_rx) = hub.create(true);
        let (dropped, _dropped_rx) = hub.create(true);
        assert_eq!(hub.open_offers(), 2);

        closed.close().await;
        assert_eq!(hub.open_offers(), 1);
        drop(dropped);
        assert_eq!(hub.open_offers(), 0);

        let (offerer, mut offer_rx) = hub.create(true);
        let (answerer, _answer_rx) = hub.create(false);
        answerer.signal(expect_signal(&mut offer_rx)).unwrap();
        assert_eq!(hub.open_offers(), 0);
        drop(offerer);
    }

    #[tokio::test]
    async fn test_unknown_offer_is_rejected() {
        let hub = MemoryChannelHub::new();
        let (answerer, _rx) = hub.create(false);
        let err = answerer
            .signal(json!({"type": "offer", "token": 42}))
            .unwrap_err();
        assert!(matches!(err, Error::TransportClosed(_)));
    }
}
