//! The dispatch task.
//!
//! One task per connection owns the socket, the pending-call table and the
//! [`SubscriptionRegistry`]. Callers reach it only through [`Command`]s
//! carrying oneshot reply slots, so the tables have a single writer and need
//! no locks.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, warn};
use truenas_core::{ClientError, CorrelationId, FieldValue, Result};

use crate::message::{FrameError, Inbound, Outbound, decode_frame};
use crate::registry::{ReadyOutcome, SubscribeReply, SubscriptionRegistry};
use crate::state::{ConnectionState, advance};
use crate::transport::{WsTransport, transport_error};

/// Reply slot of a pending method call.
pub(crate) type InvokeReply = oneshot::Sender<Result<FieldValue>>;

/// Request from a [`Connection`](crate::Connection) handle to the task.
pub(crate) enum Command {
    /// Send a method call.
    Invoke {
        method: String,
        params: Vec<Value>,
        reply: InvokeReply,
    },
    /// Send a subscribe request.
    Subscribe { topic: String, reply: SubscribeReply },
    /// Drop an active subscription and tell the server.
    Unsubscribe {
        topic: String,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Shut the connection down.
    Close,
}

struct PendingCall {
    method: String,
    reply: InvokeReply,
}

type Stop = ControlFlow<&'static str>;

struct Dispatcher<S: WsTransport> {
    sink: SplitSink<S, Message>,
    pending: HashMap<CorrelationId, PendingCall>,
    registry: SubscriptionRegistry,
    state: Arc<watch::Sender<ConnectionState>>,
}

/// Run until the caller closes, every handle is dropped, or the transport ends.
pub(crate) async fn dispatch_loop<S: WsTransport>(
    ws: S,
    mut cmd_rx: mpsc::Receiver<Command>,
    state: Arc<watch::Sender<ConnectionState>>,
) {
    let (sink, mut stream) = ws.split();
    let mut dispatcher = Dispatcher {
        sink,
        pending: HashMap::new(),
        registry: SubscriptionRegistry::default(),
        state,
    };

    let reason = loop {
        let flow = tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(cmd) => dispatcher.handle_command(cmd).await,
                None => ControlFlow::Break("all connection handles dropped"),
            },
            frame = stream.next() => dispatcher.handle_frame(frame).await,
        };
        if let ControlFlow::Break(reason) = flow {
            break reason;
        }
    };

    debug!(reason, "dispatch loop stopping");
    dispatcher.shutdown().await;
}

impl<S: WsTransport> Dispatcher<S> {
    async fn send(&mut self, frame: &Outbound) -> Result<()> {
        let text = frame.to_text()?;
        self.sink
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| transport_error(&e))
    }

    async fn send_or_stop(&mut self, frame: &Outbound) -> Stop {
        match self.send(frame).await {
            Ok(()) => ControlFlow::Continue(()),
            Err(e) => {
                warn!(error = %e, "send failed");
                ControlFlow::Break("send failed")
            }
        }
    }

    // ── Commands ────────────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: Command) -> Stop {
        match cmd {
            Command::Invoke {
                method,
                params,
                reply,
            } => {
                let id = CorrelationId::new();
                debug!(%id, %method, "invoke");
                let frame = Outbound::Method {
                    id: id.clone(),
                    method: method.clone(),
                    params,
                };
                let _ = self.pending.insert(id, PendingCall { method, reply });
                self.send_or_stop(&frame).await
            }
            Command::Subscribe { topic, reply } => {
                let id = CorrelationId::new();
                if let Err((err, reply)) = self.registry.request(id.clone(), topic.clone(), reply) {
                    let _ = reply.send(Err(err));
                    return ControlFlow::Continue(());
                }
                debug!(%id, %topic, "subscribe");
                self.send_or_stop(&Outbound::Sub { id, name: topic }).await
            }
            Command::Unsubscribe { topic, reply } => {
                let Some(id) = self.registry.remove(&topic) else {
                    let _ = reply.send(Err(ClientError::ProtocolViolation(format!(
                        "topic {topic} is not subscribed"
                    ))));
                    return ControlFlow::Continue(());
                };
                debug!(%id, %topic, "unsubscribe");
                let _ = reply.send(Ok(()));
                self.send_or_stop(&Outbound::Unsub { id }).await
            }
            Command::Close => ControlFlow::Break("closed by caller"),
        }
    }

    // ── Frames ──────────────────────────────────────────────────────────

    async fn handle_frame(&mut self, frame: Option<std::result::Result<Message, WsError>>) -> Stop {
        let msg = match frame {
            None => return ControlFlow::Break("transport ended"),
            Some(Err(e)) => {
                warn!(error = %e, "transport error");
                return ControlFlow::Break("transport error");
            }
            Some(Ok(msg)) => msg,
        };

        match msg {
            Message::Text(text) => match decode_frame(&text) {
                Ok(inbound) => self.dispatch(inbound).await,
                Err(FrameError::Malformed(reason)) => {
                    error!(%reason, "malformed frame, closing connection");
                    ControlFlow::Break("malformed frame")
                }
                Err(FrameError::Shape { id, reason }) => {
                    warn!(?id, %reason, "frame does not match its kind");
                    if let Some(call) = id.and_then(|id| self.pending.remove(&id)) {
                        let _ = call.reply.send(Err(ClientError::ProtocolViolation(format!(
                            "bad reply to {}: {reason}",
                            call.method
                        ))));
                    }
                    ControlFlow::Continue(())
                }
            },
            Message::Binary(_) => {
                error!("binary frame, closing connection");
                ControlFlow::Break("binary frame")
            }
            Message::Close(frame) => {
                debug!(?frame, "server closed the socket");
                ControlFlow::Break("closed by server")
            }
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => ControlFlow::Continue(()),
        }
    }

    async fn dispatch(&mut self, inbound: Inbound) -> Stop {
        match inbound {
            Inbound::Result { id, outcome } => {
                let Some(call) = self.pending.remove(&id) else {
                    warn!(%id, "result for unknown call id");
                    return ControlFlow::Continue(());
                };
                let result = outcome.map_err(|e| e.into_client_error(&call.method));
                if let Err(e) = &result {
                    debug!(%id, method = %call.method, error = %e, "remote method failed");
                }
                let _ = call.reply.send(result);
            }
            Inbound::Ready { subs } => {
                for id in subs {
                    match self.registry.ready(&id) {
                        ReadyOutcome::Delivered => {}
                        ReadyOutcome::Orphaned(id) => {
                            if self.send_or_stop(&Outbound::Unsub { id }).await.is_break() {
                                return ControlFlow::Break("send failed");
                            }
                        }
                        ReadyOutcome::Unknown => debug!(%id, "ready for unknown subscription id"),
                    }
                }
            }
            Inbound::NoSub { id, error } => match self.registry.nosub(&id, error) {
                Some(topic) => debug!(%id, %topic, "subscription ended by server"),
                None => debug!(%id, "nosub for unknown subscription id"),
            },
            Inbound::Push(event) => {
                let _ = self.registry.deliver(event);
            }
            Inbound::Ping { id } => return self.send_or_stop(&Outbound::Pong { id }).await,
            Inbound::Removed { collection, id } => {
                debug!(%collection, ?id, "ignoring removed");
            }
            other @ (Inbound::Connected { .. } | Inbound::Failed { .. }) => {
                warn!(kind = other.kind(), "handshake message after handshake, ignoring");
            }
            Inbound::Unknown { kind } => warn!(%kind, "ignoring unknown message kind"),
        }
        ControlFlow::Continue(())
    }

    // ── Shutdown ────────────────────────────────────────────────────────

    async fn shutdown(mut self) {
        let _ = advance(&self.state, ConnectionState::Closing);
        let abandoned = self.pending.len();
        for (_, call) in self.pending.drain() {
            let _ = call.reply.send(Err(ClientError::ConnectionClosed));
        }
        self.registry.abandon_all();
        if let Err(e) = self.sink.close().await {
            debug!(error = %e, "socket close");
        }
        let _ = advance(&self.state, ConnectionState::Closed);
        debug!(abandoned, "connection closed");
    }
}
