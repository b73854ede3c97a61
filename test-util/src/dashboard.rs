//! An in-process dashboard speaking the framed duplex protocol.

#![allow(
    clippy::expect_used,
    reason = "test infrastructure fails loudly on protocol violations"
)]
#![allow(clippy::missing_panics_doc, reason = "test helpers panic by design")]

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc,
        Mutex as StdMutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use futures_util::{SinkExt, StreamExt};
use interval_host::{
    socket::{Frame, FrameKind},
    wire::{DuplexMessage, MessageKind},
};
use serde_json::{Value, json};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{Mutex, mpsc, oneshot},
    task::JoinHandle,
    time::timeout,
};
use tokio_tungstenite::tungstenite::{
    Message as WsMessage,
    handshake::server::{ErrorResponse, Request, Response},
};
use tracing::debug;

/// One `CALL` received from the host, in arrival order.
#[derive(Debug, Clone)]
pub struct ReceivedCall {
    /// Catalogue method name.
    pub method: String,
    /// Raw call inputs.
    pub data: Value,
}

struct Conn {
    out: mpsc::UnboundedSender<String>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

struct State {
    calls_tx: mpsc::UnboundedSender<ReceivedCall>,
    responses: StdMutex<HashMap<String, Value>>,
    pending: StdMutex<HashMap<String, oneshot::Sender<Value>>>,
    conns: StdMutex<Vec<Conn>>,
    instance_ids: StdMutex<Vec<String>>,
    next_id: AtomicU64,
    authenticate: bool,
    ack_count: AtomicU64,
}

/// A scriptable stand-in for the dashboard service.
pub struct MockDashboard {
    addr: SocketAddr,
    state: Arc<State>,
    calls: Mutex<mpsc::UnboundedReceiver<ReceivedCall>>,
    accept_task: JoinHandle<()>,
}

impl MockDashboard {
    /// Start a dashboard that authenticates every connection.
    pub async fn start() -> Self { Self::start_inner(true).await }

    /// Start a dashboard that never sends `authenticated`.
    pub async fn start_silent() -> Self { Self::start_inner(false).await }

    async fn start_inner(authenticate: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock dashboard");
        let addr = listener.local_addr().expect("local addr");
        let (calls_tx, calls_rx) = mpsc::unbounded_channel();
        let state = Arc::new(State {
            calls_tx,
            responses: StdMutex::new(HashMap::new()),
            pending: StdMutex::new(HashMap::new()),
            conns: StdMutex::new(Vec::new()),
            instance_ids: StdMutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            authenticate,
            ack_count: AtomicU64::new(0),
        });

        let accept_state = Arc::clone(&state);
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let conn_state = Arc::clone(&accept_state);
                tokio::spawn(async move {
                    handle_connection(conn_state, stream).await;
                });
            }
        });

        Self {
            addr,
            state,
            calls: Mutex::new(calls_rx),
            accept_task,
        }
    }

    /// The websocket endpoint hosts should dial.
    #[must_use]
    pub fn endpoint(&self) -> String { format!("ws://{}/websocket", self.addr) }

    /// Override the response returned for one method.
    pub fn set_response(&self, method: &str, value: Value) {
        let _ = lock(&self.state.responses).insert(method.to_owned(), value);
    }

    /// The `x-instance-id` header of every accepted connection, in order.
    #[must_use]
    pub fn instance_ids(&self) -> Vec<String> { lock(&self.state.instance_ids).clone() }

    /// Number of `ACK` frames received from the host.
    #[must_use]
    pub fn ack_count(&self) -> u64 { self.state.ack_count.load(Ordering::SeqCst) }

    /// Wait for the next call from the host.
    pub async fn next_call(&self) -> ReceivedCall {
        timeout(Duration::from_secs(5), async {
            self.calls.lock().await.recv().await.expect("call stream closed")
        })
        .await
        .expect("timed out awaiting a call from the host")
    }

    /// Wait for the next call with the given method, skipping others.
    pub async fn next_call_named(&self, method: &str) -> ReceivedCall {
        loop {
            let call = self.next_call().await;
            if call.method == method {
                return call;
            }
            debug!(method = %call.method, "skipping interleaved call");
        }
    }

    /// True when a call is waiting without blocking.
    pub async fn try_next_call(&self) -> Option<ReceivedCall> {
        self.calls.lock().await.try_recv().ok()
    }

    /// Invoke a method on the host and wait for its response body.
    pub async fn call_host(&self, method: &str, data: Value) -> Value {
        let id = format!("s{}", self.state.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let message = DuplexMessage {
            id: id.clone(),
            method_name: method.to_owned(),
            data,
            kind: MessageKind::Call,
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = lock(&self.state.pending).insert(id, reply_tx);

        let text = serde_json::to_string(&message).expect("serialise call");
        let out = lock(&self.state.conns)
            .last()
            .map(|conn| conn.out.clone())
            .expect("no live connection to the host");
        out.send(frame_text(&Frame::message(text)))
            .expect("connection writer closed");

        timeout(Duration::from_secs(5), reply_rx)
            .await
            .expect("timed out awaiting host response")
            .expect("host response channel dropped")
    }

    /// Deliver an `IO_RESPONSE` for a transaction or page session.
    pub async fn send_io_response(
        &self,
        transaction_id: &str,
        input_group_key: Value,
        kind: &str,
        values: Value,
    ) {
        let body = json!({
            "id": uuid::Uuid::new_v4(),
            "inputGroupKey": input_group_key,
            "transactionId": transaction_id,
            "kind": kind,
            "values": values,
        });
        let _ = self
            .call_host(
                "IO_RESPONSE",
                json!({
                    "value": body.to_string(),
                    "transactionId": transaction_id,
                }),
            )
            .await;
    }

    /// Sever every live connection, as a network drop would.
    pub fn drop_connections(&self) {
        let conns: Vec<Conn> = lock(&self.state.conns).drain(..).collect();
        for conn in conns {
            conn.reader.abort();
            conn.writer.abort();
        }
    }

    /// Number of connections accepted so far.
    #[must_use]
    pub fn connection_count(&self) -> usize { lock(&self.state.instance_ids).len() }
}

impl Drop for MockDashboard {
    fn drop(&mut self) {
        self.accept_task.abort();
        self.drop_connections();
    }
}

async fn handle_connection(state: Arc<State>, stream: TcpStream) {
    let header_state = Arc::clone(&state);
    let callback = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        if let Some(id) = request
            .headers()
            .get("x-instance-id")
            .and_then(|v| v.to_str().ok())
        {
            lock(&header_state.instance_ids).push(id.to_owned());
        }
        Ok(response)
    };

    let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
        return;
    };
    let (mut write, mut read) = ws.split();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if write.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
    });

    if state.authenticate {
        let _ = out_tx.send(frame_text(&Frame::message("authenticated")));
    }

    let reader_state = Arc::clone(&state);
    let reader_out = out_tx.clone();
    let reader = tokio::spawn(async move {
        while let Some(Ok(message)) = read.next().await {
            let WsMessage::Text(text) = message else { continue };
            let Ok(frame) = serde_json::from_str::<Frame>(&text) else {
                continue;
            };
            match frame.kind {
                FrameKind::Ack => {
                    let _ = reader_state.ack_count.fetch_add(1, Ordering::SeqCst);
                }
                FrameKind::Message => {
                    let _ = reader_out.send(frame_text(&Frame::ack(frame.id)));
                    let Some(data) = frame.data else { continue };
                    if data == "ping" {
                        continue;
                    }
                    handle_duplex(&reader_state, &reader_out, &data);
                }
            }
        }
    });

    lock(&state.conns).push(Conn {
        out: out_tx,
        reader,
        writer,
    });
}

fn handle_duplex(state: &Arc<State>, out: &mpsc::UnboundedSender<String>, data: &str) {
    let Ok(message) = serde_json::from_str::<DuplexMessage>(data) else {
        return;
    };
    match message.kind {
        MessageKind::Call => {
            let _ = state.calls_tx.send(ReceivedCall {
                method: message.method_name.clone(),
                data: message.data,
            });
            let response = lock(&state.responses)
                .get(&message.method_name)
                .cloned()
                .unwrap_or_else(|| default_response(&message.method_name));
            let reply = DuplexMessage {
                id: message.id,
                method_name: message.method_name,
                data: response,
                kind: MessageKind::Response,
            };
            let text = serde_json::to_string(&reply).expect("serialise response");
            let _ = out.send(frame_text(&Frame::message(text)));
        }
        MessageKind::Response => {
            let sender = lock(&state.pending).remove(&message.id);
            if let Some(sender) = sender {
                let _ = sender.send(message.data);
            }
        }
    }
}

fn default_response(method: &str) -> Value {
    match method {
        "INITIALIZE_HOST" => json!({
            "type": "success",
            "environment": "development",
            "invalidSlugs": [],
            "organization": { "name": "Test Organization", "slug": "test-org" },
            "dashboardUrl": "http://localhost/dashboard/test-org",
            "warnings": [],
        }),
        _ => json!(true),
    }
}

fn frame_text(frame: &Frame) -> String {
    serde_json::to_string(frame).expect("serialise frame")
}

/// Dial an endpoint and wrap the stream in a framed socket, without
/// connecting it.
pub async fn framed_socket(
    endpoint: &str,
    options: interval_host::socket::SocketOptions,
) -> interval_host::socket::FramedSocket {
    let (stream, _) = tokio_tungstenite::connect_async(endpoint)
        .await
        .expect("dial mock dashboard");
    interval_host::socket::FramedSocket::new(uuid::Uuid::new_v4(), stream, options)
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
