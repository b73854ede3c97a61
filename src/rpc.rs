//! Duplex RPC over the framed socket.
//!
//! Both peers may issue `CALL` messages and must answer each with a
//! `RESPONSE` carrying the same id. Calls this host issues are typed by
//! [`ServerMethod`] markers; inbound calls are routed to handlers registered
//! under [`HostMethod`] names, with inputs and returns validated by serde on
//! both sides. Unknown methods, malformed inputs, and handler failures are
//! logged and dropped; they never take the connection down.
//!
//! The pending-call table lives in the client, not the socket, so a
//! reconnect can rebind the transport while calls issued on the old
//! connection complete from responses arriving on the new one.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        Mutex as StdMutex,
        Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use futures_util::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::{
    socket::{FramedSocket, SocketError},
    wire::{DuplexMessage, HostMethod, MessageKind, ServerMethod},
};

/// Type-erased handler for one inbound method.
pub type RpcHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Errors surfaced to RPC callers.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The framed transport failed before the call was acknowledged.
    #[error(transparent)]
    Socket(#[from] SocketError),
    /// The inputs could not be serialised into the method schema.
    #[error("serialising {method} inputs failed: {source}")]
    InvalidInputs {
        /// Method being called.
        method: &'static str,
        /// Underlying serde failure.
        source: serde_json::Error,
    },
    /// The response body did not match the method's return schema.
    #[error("response for {method} did not match its schema: {source}")]
    InvalidResponse {
        /// Method being called.
        method: &'static str,
        /// Underlying serde failure.
        source: serde_json::Error,
    },
    /// The client was dropped before a response arrived.
    #[error("client dropped before a response arrived")]
    Dropped,
}

struct Inner {
    socket: StdMutex<Arc<FramedSocket>>,
    next_id: AtomicU64,
    pending: StdMutex<HashMap<String, oneshot::Sender<Value>>>,
    handlers: StdMutex<HashMap<&'static str, RpcHandler>>,
}

/// A symmetric request/response client bound to one framed socket at a time.
pub struct DuplexRpcClient {
    inner: Arc<Inner>,
}

impl DuplexRpcClient {
    /// Build a client bound to the given socket.
    #[must_use]
    pub fn new(socket: Arc<FramedSocket>) -> Arc<Self> {
        let client = Arc::new(Self {
            inner: Arc::new(Inner {
                socket: StdMutex::new(Arc::clone(&socket)),
                next_id: AtomicU64::new(0),
                pending: StdMutex::new(HashMap::new()),
                handlers: StdMutex::new(HashMap::new()),
            }),
        });
        client.bind_transport(socket);
        client
    }

    /// Swap the underlying transport, keeping the pending-call table.
    ///
    /// Calls in flight across a reconnect complete when their responses
    /// arrive on the new connection.
    pub fn bind_transport(&self, socket: Arc<FramedSocket>) {
        let weak = Arc::downgrade(&self.inner);
        socket.set_on_message(Some(Arc::new(move |data: String| {
            let weak: Weak<Inner> = weak.clone();
            Box::pin(async move {
                if let Some(inner) = weak.upgrade() {
                    handle_message(&inner, data).await;
                }
            })
        })));
        *lock_or_poisoned(&self.inner.socket) = socket;
    }

    /// Register the handler for one inbound method.
    pub fn respond_to<M, F, Fut>(&self, handler: F)
    where
        M: HostMethod + 'static,
        F: Fn(M::Inputs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<M::Returns>> + Send + 'static,
    {
        let wrapped: RpcHandler = Arc::new(move |data: Value| {
            match serde_json::from_value::<M::Inputs>(data) {
                Ok(inputs) => {
                    let fut = handler(inputs);
                    Box::pin(async move {
                        let returns = fut.await?;
                        Ok(serde_json::to_value(returns)?)
                    })
                }
                Err(err) => Box::pin(async move {
                    Err(anyhow::Error::new(err).context("call inputs failed validation"))
                }),
            }
        });
        let _ = lock_or_poisoned(&self.inner.handlers).insert(M::NAME, wrapped);
    }

    /// Issue a call and wait for its typed response.
    ///
    /// The send is bounded by the framed socket's acknowledgement timeout;
    /// the response itself is awaited without a deadline, because it may
    /// legitimately arrive after a reconnect.
    ///
    /// # Errors
    /// Returns transport failures, schema mismatches on either side, or
    /// [`RpcError::Dropped`] when the client goes away mid-call.
    pub async fn call<M: ServerMethod>(&self, inputs: M::Inputs) -> Result<M::Returns, RpcError> {
        let id = (self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1).to_string();
        let data = serde_json::to_value(inputs).map_err(|source| RpcError::InvalidInputs {
            method: M::NAME,
            source,
        })?;
        let message = DuplexMessage {
            id: id.clone(),
            method_name: M::NAME.to_owned(),
            data,
            kind: MessageKind::Call,
        };
        let text = serde_json::to_string(&message).map_err(|source| RpcError::InvalidInputs {
            method: M::NAME,
            source,
        })?;

        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = lock_or_poisoned(&self.inner.pending).insert(id.clone(), reply_tx);

        let socket = Arc::clone(&lock_or_poisoned(&self.inner.socket));
        if let Err(err) = socket.send(text).await {
            let _ = lock_or_poisoned(&self.inner.pending).remove(&id);
            return Err(err.into());
        }

        let value = reply_rx.await.map_err(|_| RpcError::Dropped)?;
        serde_json::from_value(value).map_err(|source| RpcError::InvalidResponse {
            method: M::NAME,
            source,
        })
    }
}

fn lock_or_poisoned<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

async fn handle_message(inner: &Arc<Inner>, data: String) {
    let message: DuplexMessage = match serde_json::from_str(&data) {
        Ok(message) => message,
        Err(err) => {
            debug!(error = %err, "skipping malformed duplex message");
            return;
        }
    };

    match message.kind {
        MessageKind::Response => {
            let sender = lock_or_poisoned(&inner.pending).remove(&message.id);
            match sender {
                Some(sender) => {
                    let _ = sender.send(message.data);
                }
                None => debug!(id = %message.id, "response without a pending call"),
            }
        }
        MessageKind::Call => {
            let handler = lock_or_poisoned(&inner.handlers)
                .get(message.method_name.as_str())
                .cloned();
            let Some(handler) = handler else {
                warn!(method = %message.method_name, "received unsupported call");
                return;
            };
            match handler(message.data).await {
                Ok(returns) => {
                    let response = DuplexMessage {
                        id: message.id,
                        method_name: message.method_name,
                        data: returns,
                        kind: MessageKind::Response,
                    };
                    let Ok(text) = serde_json::to_string(&response) else {
                        error!("failed serialising response");
                        return;
                    };
                    let socket = Arc::clone(&lock_or_poisoned(&inner.socket));
                    if let Err(err) = socket.send(text).await {
                        warn!(error = %err, method = %response.method_name,
                            "failed sending call response");
                    }
                }
                Err(err) => {
                    error!(method = %message.method_name, error = %err, "call handler failed");
                }
            }
        }
    }
}
