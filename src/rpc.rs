//! Request/response/notify layer over a raw message channel.
//!
//! An [`RpcPeer`] wraps a send primitive and is fed inbound data through
//! [`RpcPeer::receive`]:
//!
//! ```no_run
//! use linkup::rpc::RpcPeer;
//! use linkup::config::RpcConfig;
//! use serde_json::json;
//!
//! # async fn run() -> linkup::Result<()> {
//! let (tx, _rx) = tokio::sync::mpsc::unbounded_channel::<String>();
//! let rpc = RpcPeer::new(&RpcConfig::default(), move |text| {
//!     tx.send(text).map_err(|_| linkup::Error::closed("socket gone"))
//! });
//!
//! rpc.on("greeting", |params| async move {
//!     Ok(json!(format!("hello {}", params["name"].as_str().unwrap_or("?"))))
//! });
//!
//! // feed inbound socket data with `rpc.receive(&text)`
//! let result = rpc.request("ping", json!({})).await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn, Instrument};
use uuid::Uuid;

use crate::config::RpcConfig;
use crate::envelope::{Incoming, RequestEnvelope, ResponseEnvelope};
use crate::{Error, Result};

/// Future returned by a method handler.
pub type HandlerFuture = BoxFuture<'static, Result<Value>>;

type Handler = Arc<dyn Fn(Value) -> HandlerFuture + Send + Sync>;
type SendFn = Box<dyn Fn(String) -> Result<()> + Send + Sync>;
type Waiter = oneshot::Sender<Result<Value>>;

struct Inner {
    send: SendFn,
    pending: Mutex<HashMap<String, Waiter>>,
    methods: RwLock<HashMap<String, Handler>>,
    timeout: Duration,
    closed: AtomicBool,
}

/// One end of a request/response channel.
///
/// Cheap to clone; all clones share the pending-request table and handlers.
#[derive(Clone)]
pub struct RpcPeer {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RpcPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcPeer")
            .field("pending", &self.inner.pending.lock().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Removes a pending entry when the request resolves, times out or is dropped.
struct PendingGuard {
    inner: Arc<Inner>,
    id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.inner.pending.lock().remove(&self.id);
    }
}

impl RpcPeer {
    /// Create a peer that writes outbound envelopes through `send`.
    pub fn new<F>(config: &RpcConfig, send: F) -> Self
    where
        F: Fn(String) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                send: Box::new(send),
                pending: Mutex::new(HashMap::new()),
                methods: RwLock::new(HashMap::new()),
                timeout: config.request_timeout,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Register the handler for `method`, replacing any previous one.
    ///
    /// The closure itself runs synchronously inside [`receive`](Self::receive),
    /// in message order; the future it returns runs on its own task.
    pub fn on<F, Fut>(&self, method: &str, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |params| Box::pin(handler(params)));
        self.inner
            .methods
            .write()
            .insert(method.to_string(), handler);
    }

    /// Send a request and wait for its response.
    ///
    /// The envelope is written before this returns, so requests issued in
    /// sequence hit the wire in that order even if their futures are spawned.
    pub fn request(
        &self,
        method: &str,
        params: Value,
    ) -> impl Future<Output = Result<Value>> + Send + 'static {
        let started = self.start_request(method, &params);
        let timeout = self.inner.timeout;
        let method = method.to_string();

        async move {
            let (rx, guard) = started?;
            let outcome = tokio::time::timeout(timeout, rx).await;
            drop(guard);
            match outcome {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(Error::closed("request abandoned")),
                Err(_) => {
                    debug!(%method, "request timed out");
                    Err(Error::Timeout)
                }
            }
        }
    }

    fn start_request(
        &self,
        method: &str,
        params: &Value,
    ) -> Result<(oneshot::Receiver<Result<Value>>, PendingGuard)> {
        if self.is_closed() {
            return Err(Error::closed("rpc peer closed"));
        }

        let id = Uuid::new_v4().to_string();
        let text = serde_json::to_string(&RequestEnvelope::request(&id, method, params))?;

        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(id.clone(), tx);
        let guard = PendingGuard {
            inner: Arc::clone(&self.inner),
            id,
        };

        trace!(%method, id = %guard.id, "sending request");
        (self.inner.send)(text)?;
        Ok((rx, guard))
    }

    /// Send a one-way notification. Fails only if the underlying send fails.
    pub fn notify(&self, method: &str, params: Value) -> Result<()> {
        if self.is_closed() {
            return Err(Error::closed("rpc peer closed"));
        }
        let text = serde_json::to_string(&RequestEnvelope::notification(method, &params))?;
        trace!(%method, "sending notification");
        (self.inner.send)(text)
    }

    /// Feed raw inbound data.
    ///
    /// Non-envelope data and responses to unknown ids are ignored.
    pub fn receive(&self, data: &str) {
        let Some(message) = Incoming::decode(data) else {
            trace!("ignoring non-envelope data");
            return;
        };

        if let Some(key) = message.id_key() {
            let waiter = self.inner.pending.lock().remove(&key);
            if let Some(waiter) = waiter {
                let outcome = match message.error {
                    Some(err) => Err(Error::from(err)),
                    None => Ok(message.result),
                };
                // the requester may have given up already
                let _ = waiter.send(outcome);
                return;
            }
        }

        match message.method {
            Some(method) => {
                let id = message.id.filter(|id| !id.is_null());
                self.dispatch(id, method, message.params);
            }
            None => trace!(id = ?message.id, "ignoring response without a pending request"),
        }
    }

    fn dispatch(&self, id: Option<Value>, method: String, params: Value) {
        let handler = self.inner.methods.read().get(&method).cloned();
        let call: HandlerFuture = match handler {
            Some(handler) => handler(params),
            None => Box::pin(std::future::ready(Err(Error::MethodNotFound(method.clone())))),
        };

        let this = self.clone();
        let span = tracing::debug_span!("rpc_call", %method);
        tokio::spawn(
            async move {
                let outcome = call.await;
                match id {
                    Some(id) => {
                        let response = match outcome {
                            Ok(result) => ResponseEnvelope::success(id, result),
                            Err(err) => {
                                debug!("handler failed: {err}");
                                ResponseEnvelope::error(id, err.to_rpc_error())
                            }
                        };
                        if let Err(e) = this.send_json(&response) {
                            debug!("failed to send response: {e}");
                        }
                    }
                    None => {
                        if let Err(e) = outcome {
                            warn!("notification handler failed: {e}");
                        }
                    }
                }
            }
            .instrument(span),
        );
    }

    fn send_json<T: Serialize>(&self, value: &T) -> Result<()> {
        if self.is_closed() {
            return Err(Error::closed("rpc peer closed"));
        }
        let text = serde_json::to_string(value)?;
        (self.inner.send)(text)
    }

    /// Reject all pending requests of this peer and drop its handlers.
    pub fn close(&self, reason: &str) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let pending: Vec<Waiter> = self.inner.pending.lock().drain().map(|(_, w)| w).collect();
        if !pending.is_empty() {
            debug!(count = pending.len(), "rejecting pending requests");
        }
        for waiter in pending {
            let _ = waiter.send(Err(Error::closed(reason)));
        }
        self.inner.methods.write().clear();
    }

    /// Reject in-flight requests without closing the peer, e.g. when the
    /// socket underneath dropped but will be replaced.
    pub fn fail_pending(&self, reason: &str) {
        let pending: Vec<Waiter> = self.inner.pending.lock().drain().map(|(_, w)| w).collect();
        for waiter in pending {
            let _ = waiter.send(Err(Error::closed(reason)));
        }
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Number of requests awaiting a response.
    pub fn pending_len(&self) -> usize {
        self.inner.pending.lock().len()
    }
}
