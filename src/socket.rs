//! Framed websocket transport with per-message acknowledgement.
//!
//! Every application payload travels as a `MESSAGE` frame carrying a fresh
//! id; the receiving peer answers with an `ACK` frame for that id before it
//! processes any later message. Outbound frames pass through a bounded queue
//! drained by one or more producer workers, while a single consumer task
//! parses inbound frames, completes pending acknowledgements, and dispatches
//! application payloads without blocking the read loop.
//!
//! The dashboard authenticates the upgrade headers out of band and then
//! sends a single `MESSAGE` whose data is `authenticated`; `connect` blocks
//! on that frame before reporting success.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        Mutex as StdMutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use futures_util::{SinkExt, StreamExt, future::BoxFuture, stream::SplitSink};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    net::TcpStream,
    sync::{Mutex, mpsc, oneshot},
    time::timeout,
};
use tokio_tungstenite::{
    MaybeTlsStream,
    WebSocketStream,
    tungstenite::Message as WsMessage,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Websocket stream type produced by dialling the dashboard.
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Payload announcing a successfully authenticated upgrade.
const AUTHENTICATED: &str = "authenticated";

/// Liveness probe payload.
const PING: &str = "ping";

/// Capacity of the outbound frame queue.
const OUT_QUEUE_CAPACITY: usize = 256;

/// Callback invoked when the connection workers start.
pub type OpenHandler = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Callback invoked with each inbound application payload.
pub type MessageHandler = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

/// Callback invoked once when the connection ends, with close code and
/// reason.
pub type CloseHandler = Arc<dyn Fn(u16, String) -> BoxFuture<'static, ()> + Send + Sync>;

/// Frame discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FrameKind {
    /// An application payload awaiting acknowledgement.
    Message,
    /// Acknowledgement of the frame with the same id.
    Ack,
}

/// One framed websocket message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    /// Frame id; acknowledgements echo the id they acknowledge.
    pub id: Uuid,
    /// Frame discriminator.
    #[serde(rename = "type")]
    pub kind: FrameKind,
    /// Application payload; `None` for acknowledgements.
    pub data: Option<String>,
}

impl Frame {
    /// Build a `MESSAGE` frame with a fresh id.
    #[must_use]
    pub fn message(data: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: FrameKind::Message,
            data: Some(data.into()),
        }
    }

    /// Build the `ACK` frame for the given id.
    #[must_use]
    pub const fn ack(id: Uuid) -> Self {
        Self {
            id,
            kind: FrameKind::Ack,
            data: None,
        }
    }
}

/// Errors surfaced by the framed socket.
#[derive(Debug, Error)]
pub enum SocketError {
    /// The socket was never connected or has been closed.
    #[error("socket is not connected")]
    NotConnected,
    /// No acknowledgement arrived within the send timeout.
    #[error("timed out awaiting acknowledgement")]
    AckTimeout,
    /// The dashboard did not authenticate within the connect timeout.
    #[error("timed out awaiting authentication")]
    AuthenticationTimeout,
    /// The connection ended while the operation was in flight.
    #[error("connection closed")]
    Closed,
}

/// Tunables for one framed socket.
#[derive(Debug, Clone)]
pub struct SocketOptions {
    /// How long `send` waits for its acknowledgement.
    pub send_timeout: Duration,
    /// How long `connect` waits for the authentication message.
    pub connect_timeout: Duration,
    /// How long `ping` waits for its acknowledgement.
    pub ping_timeout: Duration,
    /// Number of producer workers draining the outbound queue.
    pub num_producers: usize,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(3),
            connect_timeout: Duration::from_secs(10),
            ping_timeout: Duration::from_secs(3),
            num_producers: 1,
        }
    }
}

struct Inner {
    id: Uuid,
    options: SocketOptions,
    out_tx: mpsc::Sender<Frame>,
    out_rx: StdMutex<Option<mpsc::Receiver<Frame>>>,
    stream: Mutex<Option<WsStream>>,
    sink: Mutex<Option<SplitSink<WsStream, WsMessage>>>,
    pending: StdMutex<HashMap<Uuid, oneshot::Sender<()>>>,
    authenticated_tx: StdMutex<Option<oneshot::Sender<()>>>,
    on_open: StdMutex<Option<OpenHandler>>,
    on_message: StdMutex<Option<MessageHandler>>,
    on_close: StdMutex<Option<CloseHandler>>,
    closed: AtomicBool,
    close_emitted: AtomicBool,
    cancel: CancellationToken,
}

/// A websocket wrapped in the per-message acknowledgement protocol.
pub struct FramedSocket {
    inner: Arc<Inner>,
}

impl FramedSocket {
    /// Wrap an already-dialled websocket stream.
    #[must_use]
    pub fn new(id: Uuid, stream: WsStream, options: SocketOptions) -> Self {
        let (out_tx, out_rx) = mpsc::channel(OUT_QUEUE_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                id,
                options,
                out_tx,
                out_rx: StdMutex::new(Some(out_rx)),
                stream: Mutex::new(Some(stream)),
                sink: Mutex::new(None),
                pending: StdMutex::new(HashMap::new()),
                authenticated_tx: StdMutex::new(None),
                on_open: StdMutex::new(None),
                on_message: StdMutex::new(None),
                on_close: StdMutex::new(None),
                closed: AtomicBool::new(false),
                close_emitted: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Socket identity; stable across the life of the wrapper.
    #[must_use]
    pub fn id(&self) -> Uuid { self.inner.id }

    /// True once `close` has been called or the peer has gone away.
    #[must_use]
    pub fn is_closed(&self) -> bool { self.inner.closed.load(Ordering::SeqCst) }

    /// Install the connection-started callback.
    pub fn set_on_open(&self, handler: Option<OpenHandler>) {
        *lock_or_poisoned(&self.inner.on_open) = handler;
    }

    /// Install the inbound payload callback.
    pub fn set_on_message(&self, handler: Option<MessageHandler>) {
        *lock_or_poisoned(&self.inner.on_message) = handler;
    }

    /// Install the close callback, invoked at most once.
    pub fn set_on_close(&self, handler: Option<CloseHandler>) {
        *lock_or_poisoned(&self.inner.on_close) = handler;
    }

    /// Start the consumer and producer workers, then wait for the
    /// authentication message.
    ///
    /// # Errors
    /// Returns [`SocketError::NotConnected`] when called twice and
    /// [`SocketError::AuthenticationTimeout`] when the dashboard stays
    /// silent.
    pub async fn connect(&self) -> Result<(), SocketError> {
        let stream = self
            .inner
            .stream
            .lock()
            .await
            .take()
            .ok_or(SocketError::NotConnected)?;
        let on_open = lock_or_poisoned(&self.inner.on_open).clone();
        if let Some(on_open) = on_open {
            on_open().await;
        }
        let (sink, read) = stream.split();
        *self.inner.sink.lock().await = Some(sink);

        let (auth_tx, auth_rx) = oneshot::channel();
        *lock_or_poisoned(&self.inner.authenticated_tx) = Some(auth_tx);

        let consumer = Arc::clone(&self.inner);
        tokio::spawn(async move { consumer_loop(consumer, read).await });

        let shared_rx = lock_or_poisoned(&self.inner.out_rx)
            .take()
            .map(|rx| Arc::new(Mutex::new(rx)))
            .ok_or(SocketError::NotConnected)?;
        for _ in 0..self.inner.options.num_producers.max(1) {
            let producer = Arc::clone(&self.inner);
            let rx = Arc::clone(&shared_rx);
            tokio::spawn(async move { producer_loop(producer, rx).await });
        }

        match timeout(self.inner.options.connect_timeout, auth_rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SocketError::Closed),
            Err(_) => Err(SocketError::AuthenticationTimeout),
        }
    }

    /// Send an application payload and wait for its acknowledgement.
    ///
    /// # Errors
    /// Fails with [`SocketError::AckTimeout`] when no acknowledgement
    /// arrives in time, or [`SocketError::Closed`] when the connection ends
    /// first. The caller decides whether to retry.
    pub async fn send(&self, data: impl Into<String> + Send) -> Result<(), SocketError> {
        self.send_with_timeout(data.into(), self.inner.options.send_timeout)
            .await
    }

    /// Probe connection liveness with a `ping` payload.
    ///
    /// # Errors
    /// Same failure modes as [`FramedSocket::send`], bounded by the ping
    /// timeout.
    pub async fn ping(&self) -> Result<(), SocketError> {
        self.send_with_timeout(PING.to_owned(), self.inner.options.ping_timeout)
            .await
    }

    async fn send_with_timeout(&self, data: String, wait: Duration) -> Result<(), SocketError> {
        if self.is_closed() {
            return Err(SocketError::NotConnected);
        }

        let frame = Frame::message(data);
        let id = frame.id;
        let (ack_tx, ack_rx) = oneshot::channel();
        let _ = lock_or_poisoned(&self.inner.pending).insert(id, ack_tx);

        if self.inner.out_tx.send(frame).await.is_err() {
            let _ = lock_or_poisoned(&self.inner.pending).remove(&id);
            return Err(SocketError::Closed);
        }

        match timeout(wait, ack_rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SocketError::Closed),
            Err(_) => {
                let _ = lock_or_poisoned(&self.inner.pending).remove(&id);
                Err(SocketError::AckTimeout)
            }
        }
    }

    /// Stop the workers, close the websocket, and emit the close event.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.cancel.cancel();
        if let Some(sink) = self.inner.sink.lock().await.as_mut() {
            let _ = sink.close().await;
        }
        emit_close(&self.inner, 1000, "Closed by client".to_owned());
    }
}

fn lock_or_poisoned<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Complete the close event exactly once: fail every pending send and run the
/// close callback on its own task.
fn emit_close(inner: &Arc<Inner>, code: u16, reason: String) {
    if inner.close_emitted.swap(true, Ordering::SeqCst) {
        return;
    }
    inner.closed.store(true, Ordering::SeqCst);
    inner.cancel.cancel();
    lock_or_poisoned(&inner.pending).clear();
    let handler = lock_or_poisoned(&inner.on_close).clone();
    if let Some(handler) = handler {
        tokio::spawn(handler(code, reason));
    }
}

async fn consumer_loop(
    inner: Arc<Inner>,
    mut read: futures_util::stream::SplitStream<WsStream>,
) {
    loop {
        let next = tokio::select! {
            () = inner.cancel.cancelled() => break,
            next = read.next() => next,
        };
        match next {
            Some(Ok(WsMessage::Text(text))) => handle_frame(&inner, &text).await,
            Some(Ok(WsMessage::Close(frame))) => {
                let (code, reason) = frame
                    .map(|f| (u16::from(f.code), f.reason.into_owned()))
                    .unwrap_or((1005, String::new()));
                emit_close(&inner, code, reason);
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                warn!(error = %err, "websocket read failed");
                emit_close(&inner, 1006, err.to_string());
                break;
            }
            None => {
                emit_close(&inner, 1006, "connection closed".to_owned());
                break;
            }
        }
    }
}

async fn handle_frame(inner: &Arc<Inner>, text: &str) {
    let frame: Frame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            debug!(error = %err, "skipping malformed frame");
            return;
        }
    };

    match frame.kind {
        FrameKind::Ack => {
            let sender = lock_or_poisoned(&inner.pending).remove(&frame.id);
            if let Some(sender) = sender {
                let _ = sender.send(());
            }
        }
        FrameKind::Message => {
            // the acknowledgement is queued before any dispatch work
            if inner.out_tx.send(Frame::ack(frame.id)).await.is_err() {
                return;
            }
            let Some(data) = frame.data else { return };
            if data == AUTHENTICATED {
                let sender = lock_or_poisoned(&inner.authenticated_tx).take();
                if let Some(sender) = sender {
                    let _ = sender.send(());
                }
                return;
            }
            let handler = lock_or_poisoned(&inner.on_message).clone();
            if let Some(handler) = handler {
                tokio::spawn(handler(data));
            }
        }
    }
}

async fn producer_loop(inner: Arc<Inner>, rx: Arc<Mutex<mpsc::Receiver<Frame>>>) {
    loop {
        let frame = tokio::select! {
            () = inner.cancel.cancelled() => break,
            frame = async { rx.lock().await.recv().await } => frame,
        };
        let Some(frame) = frame else { break };
        let text = match serde_json::to_string(&frame) {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "dropping unserialisable frame");
                continue;
            }
        };
        let mut sink = inner.sink.lock().await;
        if let Some(sink) = sink.as_mut() {
            if let Err(err) = sink.send(WsMessage::Text(text)).await {
                debug!(error = %err, "websocket write failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    #[rstest]
    fn message_frames_carry_their_payload() {
        let frame = Frame::message("hello");
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value.get("type"), Some(&json!("MESSAGE")));
        assert_eq!(value.get("data"), Some(&json!("hello")));
        assert!(value.get("id").and_then(serde_json::Value::as_str).is_some());
    }

    #[rstest]
    fn ack_frames_have_null_data() {
        let id = Uuid::new_v4();
        let value = serde_json::to_value(Frame::ack(id)).unwrap();
        assert_eq!(value.get("type"), Some(&json!("ACK")));
        assert_eq!(value.get("data"), Some(&json!(null)));
        assert_eq!(value.get("id"), Some(&json!(id.to_string())));
    }

    #[rstest]
    fn frames_parse_from_wire_text() {
        let id = Uuid::new_v4();
        let text = format!(r#"{{"id":"{id}","type":"MESSAGE","data":"authenticated"}}"#);
        let frame: Frame = serde_json::from_str(&text).unwrap();
        assert_eq!(frame.kind, FrameKind::Message);
        assert_eq!(frame.data.as_deref(), Some("authenticated"));
        assert_eq!(frame.id, id);
    }
}
