//! Connection handle and handshake.
//!
//! [`Connection::connect`] opens the socket, runs the `connect` / `connected`
//! exchange, spawns the dispatch task and logs in. The returned handle is a
//! thin front for the task: every call sends a command with a oneshot reply
//! slot and waits on that slot only, so concurrent callers never block each
//! other.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use truenas_core::{ClientError, Credentials, FieldValue, Result, SessionId};

use crate::dispatch::{Command, dispatch_loop};
use crate::invoker::MethodInvoker;
use crate::message::{Inbound, Outbound, PROTOCOL_VERSION, decode_frame};
use crate::registry::SubscriptionQueue;
use crate::state::{ConnectionState, advance};
use crate::transport::{self, WsTransport, transport_error};

/// Tunables for [`Connection::connect`].
#[derive(Clone, Debug)]
pub struct ConnectOptions {
    /// How long to wait for `connected` after sending `connect`.
    pub handshake_timeout: Duration,
    /// Capacity of the command channel into the dispatch task.
    pub command_buffer: usize,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            command_buffer: 64,
        }
    }
}

/// One logical, authenticated connection.
///
/// Opened once and closed once. Dropping every handle also closes it.
pub struct Connection {
    cmd_tx: mpsc::Sender<Command>,
    state: Arc<watch::Sender<ConnectionState>>,
    session: SessionId,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Open a websocket to `url`, handshake and authenticate.
    pub async fn connect(url: &str, credentials: &Credentials, options: &ConnectOptions) -> Result<Self> {
        let state = new_state();
        let _ = advance(&state, ConnectionState::Connecting);
        info!(%url, "connecting");
        let ws = match transport::open(url).await {
            Ok(ws) => ws,
            Err(e) => {
                let _ = advance(&state, ConnectionState::Closed);
                return Err(e);
            }
        };
        Self::establish(ws, state, credentials, options).await
    }

    /// Handshake and authenticate over an already-open transport.
    pub async fn over<S: WsTransport>(
        transport: S,
        credentials: &Credentials,
        options: &ConnectOptions,
    ) -> Result<Self> {
        let state = new_state();
        let _ = advance(&state, ConnectionState::Connecting);
        Self::establish(transport, state, credentials, options).await
    }

    async fn establish<S: WsTransport>(
        mut ws: S,
        state: Arc<watch::Sender<ConnectionState>>,
        credentials: &Credentials,
        options: &ConnectOptions,
    ) -> Result<Self> {
        let session = match handshake(&mut ws, &state, options.handshake_timeout).await {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "handshake failed");
                let _ = ws.close().await;
                let _ = advance(&state, ConnectionState::Closed);
                return Err(e);
            }
        };
        let _ = advance(&state, ConnectionState::Authenticating);

        let (cmd_tx, cmd_rx) = mpsc::channel(options.command_buffer.max(1));
        let task = tokio::spawn(dispatch_loop(ws, cmd_rx, Arc::clone(&state)));
        let conn = Self {
            cmd_tx,
            state,
            session,
            task: Mutex::new(Some(task)),
        };

        conn.authenticate(credentials).await?;
        if !advance(&conn.state, ConnectionState::Open) {
            return Err(ClientError::ConnectionClosed);
        }
        info!(session = %conn.session, "connection open");
        Ok(conn)
    }

    async fn authenticate(&self, credentials: &Credentials) -> Result<()> {
        let (method, params) = credentials.login_call();
        debug!(kind = credentials.kind(), "authenticating");
        match self.call(method, params).await {
            Ok(result) if result.is_truthy() => Ok(()),
            Ok(_) => {
                warn!(kind = credentials.kind(), "credentials rejected");
                self.close().await;
                Err(ClientError::Authentication)
            }
            Err(e) => {
                self.close().await;
                Err(e)
            }
        }
    }

    // ── State ───────────────────────────────────────────────────────────

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// A receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Session id handed out by the server.
    pub fn session(&self) -> &SessionId {
        &self.session
    }

    /// Whether the connection reached `Closed`.
    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Wait until the connection reaches `Closed`.
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == ConnectionState::Closed).await;
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state().is_open() {
            Ok(())
        } else {
            Err(ClientError::ConnectionClosed)
        }
    }

    // ── Calls ───────────────────────────────────────────────────────────

    /// Invoke a remote method and wait for its result.
    ///
    /// Fails with [`ClientError::RemoteMethod`] when the server answers with
    /// an error, and with [`ClientError::ConnectionClosed`] when the
    /// connection is not open or closes before the answer arrives.
    pub async fn invoke(&self, method: &str, params: Vec<Value>) -> Result<FieldValue> {
        self.ensure_open()?;
        self.call(method, params).await
    }

    async fn call(&self, method: &str, params: Vec<Value>) -> Result<FieldValue> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::Invoke {
            method: method.to_string(),
            params,
            reply,
        })
        .await?;
        rx.await.map_err(|_| ClientError::ConnectionClosed)?
    }

    /// Subscribe to `topic` and wait for the server to mark it ready.
    ///
    /// A topic that already has an active (or in-flight) subscription on this
    /// connection is rejected with [`ClientError::ProtocolViolation`].
    pub async fn subscribe(&self, topic: &str) -> Result<SubscriptionQueue> {
        self.ensure_open()?;
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::Subscribe {
            topic: topic.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| ClientError::ConnectionClosed)?
    }

    /// Cancel the active subscription to `topic`.
    ///
    /// Local state is dropped immediately; the server sends no acknowledgment.
    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.ensure_open()?;
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::Unsubscribe {
            topic: topic.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| ClientError::ConnectionClosed)?
    }

    async fn send_command(&self, cmd: Command) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| ClientError::ConnectionClosed)
    }

    /// Close the connection, releasing every outstanding waiter.
    ///
    /// Idempotent; returns once the connection is `Closed`.
    pub async fn close(&self) {
        let _ = self.cmd_tx.send(Command::Close).await;
        let task = self.task.lock().take();
        match task {
            Some(task) => {
                if let Err(e) = task.await {
                    warn!(error = %e, "dispatch task failed");
                    let _ = advance(&self.state, ConnectionState::Closed);
                }
            }
            None => self.closed().await,
        }
    }
}

#[async_trait]
impl MethodInvoker for Connection {
    async fn invoke(&self, method: &str, params: Vec<Value>) -> Result<FieldValue> {
        Connection::invoke(self, method, params).await
    }
}

fn new_state() -> Arc<watch::Sender<ConnectionState>> {
    Arc::new(watch::Sender::new(ConnectionState::Disconnected))
}

/// Send `connect` and wait for `connected`.
async fn handshake<S: WsTransport>(
    ws: &mut S,
    state: &watch::Sender<ConnectionState>,
    timeout: Duration,
) -> Result<SessionId> {
    let connect = Outbound::connect().to_text()?;
    ws.send(Message::Text(connect.into()))
        .await
        .map_err(|e| transport_error(&e))?;
    let _ = advance(state, ConnectionState::AwaitingConnectAck);

    let reply = tokio::time::timeout(timeout, first_text(ws))
        .await
        .map_err(|_| {
            ClientError::Handshake(format!(
                "no connected reply within {}ms",
                timeout.as_millis()
            ))
        })??;

    match decode_frame(&reply) {
        Ok(Inbound::Connected { session }) => {
            debug!(%session, "handshake complete");
            Ok(session)
        }
        Ok(Inbound::Failed { version }) => Err(ClientError::Handshake(format!(
            "server rejected protocol version {}",
            version.as_deref().unwrap_or(PROTOCOL_VERSION)
        ))),
        Ok(other) => Err(ClientError::Handshake(format!(
            "expected connected, got {}",
            other.kind()
        ))),
        Err(e) => Err(ClientError::Handshake(format!("unreadable reply: {e:?}"))),
    }
}

/// Next text frame, skipping control frames.
async fn first_text<S: WsTransport>(ws: &mut S) -> Result<String> {
    loop {
        match ws.next().await {
            None => return Err(ClientError::Handshake("transport closed during handshake".into())),
            Some(Err(e)) => return Err(transport_error(&e)),
            Some(Ok(Message::Text(text))) => return Ok(text.to_string()),
            Some(Ok(Message::Binary(_))) => {
                return Err(ClientError::Handshake("binary frame during handshake".into()));
            }
            Some(Ok(Message::Close(_))) => {
                return Err(ClientError::Handshake("server closed during handshake".into()));
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
        }
    }
}
