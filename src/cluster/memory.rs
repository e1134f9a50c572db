//! In-process pub/sub substrate.
//!
//! Lets several brokers in one process form a cluster. Like a Redis channel,
//! every subscriber (the publisher included) receives every message.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use super::{Substrate, SubstrateError, SubstrateStream};

/// Default per-channel buffer before slow subscribers start lagging.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Broadcast-channel backed [`Substrate`].
#[derive(Debug, Clone)]
pub struct MemoryBus {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<String>>>>,
    capacity: usize,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl MemoryBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a bus whose channels buffer `capacity` messages.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
            capacity,
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .lock()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

#[async_trait]
impl Substrate for MemoryBus {
    async fn publish(&self, channel: &str, message: String) -> Result<(), SubstrateError> {
        // no subscribers is not an error, the message is simply lost
        let _ = self.sender(channel).send(message);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<SubstrateStream, SubstrateError> {
        let rx = self.sender(channel).subscribe();
        let stream = BroadcastStream::new(rx).map(|item| {
            item.map_err(|BroadcastStreamRecvError::Lagged(n)| SubstrateError::Lagged(n))
        });
        Ok(stream.boxed())
    }

    async fn subscriber_count(&self, channel: &str) -> Result<usize, SubstrateError> {
        Ok(self.sender(channel).receiver_count())
    }
}
