//! # truenas-testing
//!
//! An in-process fake of the appliance's websocket endpoint for integration
//! tests. [`FakeServer`] binds `127.0.0.1:0`, speaks the DDP-style wire
//! protocol and lets a test script method replies, refuse topics, push
//! collection updates, reorder results and inspect every frame it received.
//!
//! ```ignore
//! let server = FakeServer::start().await;
//! server.on_result("system.info", json!({"version": "TrueNAS-13.0"}));
//! let conn = Connection::connect(&server.url(), &creds, &opts).await?;
//! ```

#![deny(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

/// How a method handler answers.
#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    /// `{"msg":"result","id":..,"result":<value>}`.
    Result(Value),
    /// `{"msg":"result","id":..,"error":{"error":errno,"reason":..}}`.
    Error {
        /// Numeric errno.
        errno: i64,
        /// Reason string.
        reason: String,
    },
    /// Never answer.
    Silent,
}

/// How the server answers `connect`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HandshakeMode {
    /// Reply `connected`.
    #[default]
    Accept,
    /// Reply `failed`.
    Reject,
    /// Reply with a message that is not `connected`.
    Unexpected,
    /// Never reply.
    Silent,
}

/// A scripted method handler: receives the call's params.
pub type Handler = Arc<dyn Fn(&[Value]) -> Reply + Send + Sync>;

/// One `sub` the server accepted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubRecord {
    /// Server-side client number.
    pub client: usize,
    /// Subscription id chosen by the client.
    pub id: String,
    /// Topic name.
    pub name: String,
}

enum Outgoing {
    Frame(Message),
    Disconnect,
}

struct Client {
    id: usize,
    tx: mpsc::UnboundedSender<Outgoing>,
}

struct Hold {
    count: usize,
    held: Vec<(mpsc::UnboundedSender<Outgoing>, Value)>,
}

#[derive(Default)]
struct Shared {
    handlers: Mutex<HashMap<String, Handler>>,
    handshake: Mutex<HandshakeMode>,
    clients: Mutex<Vec<Client>>,
    frames: Mutex<Vec<Value>>,
    subs: Mutex<Vec<SubRecord>>,
    refused_topics: Mutex<HashSet<String>>,
    hold: Mutex<Option<Hold>>,
    next_client: AtomicUsize,
}

/// Fake appliance endpoint. Stops accepting when dropped.
pub struct FakeServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
    accept_task: JoinHandle<()>,
}

const POLL_INTERVAL: Duration = Duration::from_millis(10);

impl FakeServer {
    /// Bind an ephemeral port and start accepting.
    ///
    /// The three login methods accept any credentials until overridden.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake server");
        let addr = listener.local_addr().expect("fake server address");
        let shared = Arc::new(Shared::default());
        let server = Self {
            addr,
            shared: Arc::clone(&shared),
            accept_task: tokio::spawn(accept_loop(listener, shared)),
        };
        for method in ["auth.login", "auth.login_with_api_key", "auth.token"] {
            server.on_result(method, json!(true));
        }
        server
    }

    /// Bound address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// `host:port`, for settings.
    pub fn host(&self) -> String {
        self.addr.to_string()
    }

    /// `ws://host:port/websocket`.
    pub fn url(&self) -> String {
        format!("ws://{}/websocket", self.addr)
    }

    // ── Scripting ───────────────────────────────────────────────────────

    /// Answer `method` with `handler`.
    pub fn on(&self, method: &str, handler: impl Fn(&[Value]) -> Reply + Send + Sync + 'static) {
        let _ = self
            .shared
            .handlers
            .lock()
            .insert(method.to_string(), Arc::new(handler));
    }

    /// Answer `method` with a fixed result.
    pub fn on_result(&self, method: &str, result: Value) {
        self.on(method, move |_| Reply::Result(result.clone()));
    }

    /// Answer `method` with a fixed error.
    pub fn on_error(&self, method: &str, errno: i64, reason: &str) {
        let reason = reason.to_string();
        self.on(method, move |_| Reply::Error {
            errno,
            reason: reason.clone(),
        });
    }

    /// Never answer `method`.
    pub fn on_silent(&self, method: &str) {
        self.on(method, |_| Reply::Silent);
    }

    /// Choose how `connect` is answered for new handshakes.
    pub fn set_handshake(&self, mode: HandshakeMode) {
        *self.shared.handshake.lock() = mode;
    }

    /// Answer `sub` for `topic` with `nosub`.
    pub fn refuse_topic(&self, topic: &str) {
        let _ = self.shared.refused_topics.lock().insert(topic.to_string());
    }

    /// Hold the next `count` non-login results and then release them in
    /// reverse order.
    pub fn hold_results(&self, count: usize) {
        *self.shared.hold.lock() = Some(Hold {
            count,
            held: Vec::new(),
        });
    }

    // ── Server-initiated frames ─────────────────────────────────────────

    /// Send an `added` push to every client.
    pub fn push_added(&self, collection: &str, id: Value, fields: Value) {
        self.broadcast(&json!({"msg": "added", "collection": collection, "id": id, "fields": fields}));
    }

    /// Send a `changed` push to every client.
    pub fn push_changed(&self, collection: &str, id: Value, fields: Value) {
        self.broadcast(&json!({"msg": "changed", "collection": collection, "id": id, "fields": fields}));
    }

    /// Send a `ping` to every client.
    pub fn ping(&self, id: &str) {
        self.broadcast(&json!({"msg": "ping", "id": id}));
    }

    /// Send a JSON frame to every client.
    pub fn broadcast(&self, frame: &Value) {
        self.send_all(|| Message::Text(frame.to_string().into()));
    }

    /// Send raw text to every client, valid JSON or not.
    pub fn send_raw(&self, text: &str) {
        self.send_all(|| Message::Text(text.to_string().into()));
    }

    /// Send a binary frame to every client.
    pub fn send_binary(&self, bytes: &[u8]) {
        self.send_all(|| Message::Binary(bytes.to_vec().into()));
    }

    fn send_all(&self, make: impl Fn() -> Message) {
        for client in self.shared.clients.lock().iter() {
            let _ = client.tx.send(Outgoing::Frame(make()));
        }
    }

    /// Close every client socket.
    pub fn disconnect_all(&self) {
        for client in self.shared.clients.lock().iter() {
            let _ = client.tx.send(Outgoing::Disconnect);
        }
    }

    // ── Inspection ──────────────────────────────────────────────────────

    /// Every frame received so far, in arrival order.
    pub fn frames(&self) -> Vec<Value> {
        self.shared.frames.lock().clone()
    }

    /// Received frames whose `msg` tag is `kind`.
    pub fn frames_of(&self, kind: &str) -> Vec<Value> {
        self.frames()
            .into_iter()
            .filter(|f| f["msg"] == kind)
            .collect()
    }

    /// Received `method` frames calling `method`.
    pub fn calls_to(&self, method: &str) -> Vec<Value> {
        self.frames_of("method")
            .into_iter()
            .filter(|f| f["method"] == method)
            .collect()
    }

    /// Subscriptions currently held by connected clients.
    pub fn subscriptions(&self) -> Vec<SubRecord> {
        self.shared.subs.lock().clone()
    }

    /// Number of connected clients.
    pub fn client_count(&self) -> usize {
        self.shared.clients.lock().len()
    }

    /// Wait until a received frame satisfies `pred`, up to `timeout`.
    pub async fn wait_for_frame(
        &self,
        timeout: Duration,
        pred: impl Fn(&Value) -> bool,
    ) -> Option<Value> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(found) = self.shared.frames.lock().iter().find(|f| pred(f)).cloned() {
                return Some(found);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Wait until exactly `count` clients are connected, up to `timeout`.
    pub async fn wait_for_clients(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.client_count() != count {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        true
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.accept_task.abort();
        self.disconnect_all();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Server side
// ─────────────────────────────────────────────────────────────────────────────

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    while let Ok((stream, peer)) = listener.accept().await {
        let client = shared.next_client.fetch_add(1, Ordering::Relaxed);
        debug!(%peer, client, "fake server accepted");
        let _ = tokio::spawn(serve_client(Arc::clone(&shared), stream, client));
    }
}

async fn serve_client(shared: Arc<Shared>, stream: TcpStream, client: usize) {
    let Ok(ws) = accept_async(stream).await else {
        return;
    };
    let (mut sink, mut source) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel();
    shared.clients.lock().push(Client {
        id: client,
        tx: tx.clone(),
    });

    loop {
        tokio::select! {
            out = rx.recv() => match out {
                Some(Outgoing::Frame(msg)) => {
                    if sink.send(msg).await.is_err() {
                        break;
                    }
                }
                Some(Outgoing::Disconnect) | None => {
                    let _ = sink.close().await;
                    break;
                }
            },
            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => handle_text(&shared, &tx, client, &text),
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    shared.clients.lock().retain(|c| c.id != client);
    shared.subs.lock().retain(|s| s.client != client);
    debug!(client, "fake server client gone");
}

fn reply(tx: &mpsc::UnboundedSender<Outgoing>, frame: &Value) {
    let _ = tx.send(Outgoing::Frame(Message::Text(frame.to_string().into())));
}

fn handle_text(shared: &Shared, tx: &mpsc::UnboundedSender<Outgoing>, client: usize, text: &str) {
    let Ok(frame) = serde_json::from_str::<Value>(text) else {
        return;
    };
    shared.frames.lock().push(frame.clone());
    let id = frame["id"].clone();

    match frame["msg"].as_str().unwrap_or_default() {
        "connect" => match *shared.handshake.lock() {
            HandshakeMode::Accept => {
                reply(tx, &json!({"msg": "connected", "session": format!("session-{client}")}));
            }
            HandshakeMode::Reject => reply(tx, &json!({"msg": "failed", "version": "1"})),
            HandshakeMode::Unexpected => reply(tx, &json!({"msg": "ready", "subs": []})),
            HandshakeMode::Silent => {}
        },
        "method" => {
            let method = frame["method"].as_str().unwrap_or_default().to_string();
            let params = frame["params"].as_array().cloned().unwrap_or_default();
            let handler = shared.handlers.lock().get(&method).cloned();
            let answer = match handler {
                Some(handler) => handler(&params),
                None => Reply::Error {
                    errno: 2,
                    reason: format!("[ENOMETHOD] Method {method} not found"),
                },
            };
            let out = match answer {
                Reply::Result(result) => json!({"msg": "result", "id": id, "result": result}),
                Reply::Error { errno, reason } => json!({
                    "msg": "result",
                    "id": id,
                    "error": {"error": errno, "reason": reason, "type": null, "trace": null},
                }),
                Reply::Silent => return,
            };
            if !method.starts_with("auth.") && hold_or_release(shared, tx, &out) {
                return;
            }
            reply(tx, &out);
        }
        "sub" => {
            let name = frame["name"].as_str().unwrap_or_default().to_string();
            if shared.refused_topics.lock().contains(&name) {
                reply(
                    tx,
                    &json!({"msg": "nosub", "id": id, "error": {"error": 404, "reason": format!("Subscription {name} not found")}}),
                );
                return;
            }
            shared.subs.lock().push(SubRecord {
                client,
                id: id.as_str().unwrap_or_default().to_string(),
                name,
            });
            reply(tx, &json!({"msg": "ready", "subs": [id]}));
        }
        "unsub" => {
            let id = id.as_str().unwrap_or_default();
            shared
                .subs
                .lock()
                .retain(|s| !(s.client == client && s.id == id));
        }
        _ => {}
    }
}

/// Returns `true` if the reply was taken by an active hold.
fn hold_or_release(shared: &Shared, tx: &mpsc::UnboundedSender<Outgoing>, out: &Value) -> bool {
    let mut hold = shared.hold.lock();
    let Some(active) = hold.as_mut() else {
        return false;
    };
    active.held.push((tx.clone(), out.clone()));
    if active.held.len() >= active.count {
        let released = std::mem::take(&mut active.held);
        *hold = None;
        for (tx, frame) in released.into_iter().rev() {
            reply(&tx, &frame);
        }
    }
    true
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
