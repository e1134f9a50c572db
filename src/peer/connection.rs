use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;

use super::channel::DataChannel;
use crate::{Error, Result};

/// Lifecycle of a connection to one remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Exchanging handshake payloads through the broker.
    Signaling,
    /// Data may be sent.
    Open,
    /// Terminal.
    Closed,
}

/// Connection to one remote peer over a [`DataChannel`].
pub struct Connection {
    remote_id: String,
    initiator: bool,
    channel: Box<dyn DataChannel>,
    state: watch::Sender<ConnectionState>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("remote_id", &self.remote_id)
            .field("initiator", &self.initiator)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    pub(crate) fn new(remote_id: String, initiator: bool, channel: Box<dyn DataChannel>) -> Self {
        Self {
            remote_id,
            initiator,
            channel,
            state: watch::Sender::new(ConnectionState::Signaling),
        }
    }

    /// Id of the remote peer.
    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    /// Whether this side offered the connection.
    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Whether the connection reached its terminal state.
    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    pub(crate) fn mark_open(&self) {
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Signaling {
                *state = ConnectionState::Open;
                true
            } else {
                false
            }
        });
    }

    pub(crate) fn mark_closed(&self) {
        self.state.send_replace(ConnectionState::Closed);
    }

    /// Deliver a handshake payload from the remote peer.
    pub fn signal(&self, payload: Value) -> Result<()> {
        if self.is_closed() {
            return Err(Error::closed("connection closed"));
        }
        self.channel.signal(payload)
    }

    /// Resolve once open; fail if the connection closes first.
    pub async fn wait_until_open(&self) -> Result<()> {
        let mut rx = self.state.subscribe();
        let state = *rx
            .wait_for(|state| *state != ConnectionState::Signaling)
            .await
            .map_err(|_| Error::closed("connection dropped"))?;
        match state {
            ConnectionState::Open => Ok(()),
            _ => Err(Error::closed(format!(
                "connection to {} is closed",
                self.remote_id
            ))),
        }
    }

    /// Send `message` as JSON once the connection is open.
    pub async fn send<T: Serialize + ?Sized>(&self, message: &T) -> Result<()> {
        self.wait_until_open().await?;
        let text = serde_json::to_string(message)?;
        self.channel.send(text)
    }

    /// Close the underlying channel.
    pub async fn close(&self) {
        self.channel.close().await;
        self.mark_closed();
    }
}
