//! Wire messages.
//!
//! Every frame is a JSON object with a `msg` tag. Outbound frames are built
//! from [`Outbound`]; inbound text frames are decoded by [`decode_frame`]
//! into [`Inbound`], with payloads converted to [`FieldValue`] on the way in.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use truenas_core::{ClientError, CorrelationId, FieldMap, FieldValue, SessionId};

/// Protocol version sent in `connect`.
pub const PROTOCOL_VERSION: &str = "1";

// ─────────────────────────────────────────────────────────────────────────────
// Outbound
// ─────────────────────────────────────────────────────────────────────────────

/// A client → server frame.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "msg", rename_all = "lowercase")]
pub enum Outbound {
    /// Open the handshake.
    Connect {
        /// Preferred protocol version.
        version: String,
        /// All versions the client can speak.
        support: Vec<String>,
    },
    /// Invoke a remote method.
    Method {
        /// Correlation id echoed back in `result`.
        id: CorrelationId,
        /// Method name, e.g. `pool.query`.
        method: String,
        /// Ordered arguments.
        params: Vec<Value>,
    },
    /// Request a live feed.
    Sub {
        /// Correlation id echoed back in `ready`.
        id: CorrelationId,
        /// Topic name.
        name: String,
    },
    /// Cancel a live feed by its original subscription id.
    Unsub {
        /// Subscription id.
        id: CorrelationId,
    },
    /// Reply to a server `ping`.
    Pong {
        /// Id carried by the ping, if any.
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
}

impl Outbound {
    /// The `connect` frame for [`PROTOCOL_VERSION`].
    #[must_use]
    pub fn connect() -> Self {
        Self::Connect {
            version: PROTOCOL_VERSION.to_string(),
            support: vec![PROTOCOL_VERSION.to_string()],
        }
    }

    /// Serialize to the text sent on the socket.
    pub fn to_text(&self) -> Result<String, ClientError> {
        Ok(serde_json::to_string(self)?)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Inbound
// ─────────────────────────────────────────────────────────────────────────────

/// Kind of a pushed collection update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushKind {
    /// A document entered the collection.
    Added,
    /// Fields of a document changed.
    Changed,
}

/// One `added` / `changed` push for a subscribed topic.
#[derive(Clone, Debug, PartialEq)]
pub struct PushEvent {
    /// Added or changed.
    pub kind: PushKind,
    /// Topic (collection) name.
    pub collection: String,
    /// Entity id; [`FieldValue::Null`] when the server sent none.
    pub id: FieldValue,
    /// Payload fields.
    pub fields: FieldMap,
}

/// Error payload attached to a `result` or `nosub`.
#[derive(Clone, Debug, PartialEq)]
pub struct RemoteError {
    /// Human-readable reason.
    pub message: String,
    /// Numeric errno, when the server supplied one.
    pub errno: Option<i64>,
    /// Server-side error class, when supplied.
    pub error_type: Option<String>,
    /// Server-side traceback, when supplied.
    pub trace: Option<Value>,
}

impl RemoteError {
    /// Interpret a raw error payload.
    ///
    /// Objects are read as `{error, reason, type, trace}`; anything else is
    /// stringified into the message.
    #[must_use]
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(obj) => {
                let message = obj
                    .get("reason")
                    .and_then(Value::as_str)
                    .map_or_else(|| Value::Object(obj.clone()).to_string(), str::to_owned);
                Self {
                    message,
                    errno: obj.get("error").and_then(Value::as_i64),
                    error_type: obj.get("type").and_then(Value::as_str).map(str::to_owned),
                    trace: obj.get("trace").filter(|t| !t.is_null()).cloned(),
                }
            }
            Value::String(message) => Self {
                message,
                errno: None,
                error_type: None,
                trace: None,
            },
            other => Self {
                message: other.to_string(),
                errno: None,
                error_type: None,
                trace: None,
            },
        }
    }

    /// Convert into [`ClientError::RemoteMethod`] for `method`.
    #[must_use]
    pub fn into_client_error(self, method: &str) -> ClientError {
        ClientError::RemoteMethod {
            method: method.to_string(),
            message: self.message,
            errno: self.errno,
        }
    }
}

/// A decoded server → client frame.
#[derive(Clone, Debug, PartialEq)]
pub enum Inbound {
    /// Handshake accepted.
    Connected {
        /// Server-assigned session id.
        session: SessionId,
    },
    /// Handshake rejected.
    Failed {
        /// Version the server would accept.
        version: Option<String>,
    },
    /// Outcome of a method call.
    Result {
        /// Correlation id of the call.
        id: CorrelationId,
        /// Result payload or server error.
        outcome: Result<FieldValue, RemoteError>,
    },
    /// Subscriptions that became active.
    Ready {
        /// Subscription ids.
        subs: Vec<CorrelationId>,
    },
    /// A subscription was refused or terminated by the server.
    NoSub {
        /// Subscription id.
        id: CorrelationId,
        /// Reason, when supplied.
        error: Option<RemoteError>,
    },
    /// Collection update for a subscribed topic.
    Push(PushEvent),
    /// A document left a collection.
    Removed {
        /// Topic (collection) name.
        collection: String,
        /// Entity id.
        id: FieldValue,
    },
    /// Keep-alive probe.
    Ping {
        /// Id to echo in `pong`.
        id: Option<String>,
    },
    /// Any message kind this client does not handle.
    Unknown {
        /// The `msg` tag.
        kind: String,
    },
}

impl Inbound {
    /// The `msg` tag this frame was decoded from.
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Failed { .. } => "failed",
            Self::Result { .. } => "result",
            Self::Ready { .. } => "ready",
            Self::NoSub { .. } => "nosub",
            Self::Push(PushEvent { kind: PushKind::Added, .. }) => "added",
            Self::Push(PushEvent { kind: PushKind::Changed, .. }) => "changed",
            Self::Removed { .. } => "removed",
            Self::Ping { .. } => "ping",
            Self::Unknown { kind } => kind,
        }
    }
}

/// Why an inbound text frame could not be decoded.
#[derive(Clone, Debug, PartialEq)]
pub enum FrameError {
    /// Not JSON at all. Fatal to the connection.
    Malformed(String),
    /// Valid JSON of the wrong shape. Fatal only to the call named by `id`.
    Shape {
        /// Correlation id found in the frame, if any.
        id: Option<CorrelationId>,
        /// What was wrong.
        reason: String,
    },
}

impl FrameError {
    /// Whether this error must close the connection.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Malformed(_))
    }
}

/// Raw serde shape of the kinds [`Inbound`] understands.
#[derive(Deserialize)]
#[serde(tag = "msg", rename_all = "lowercase")]
enum RawInbound {
    Connected {
        session: SessionId,
    },
    Failed {
        #[serde(default)]
        version: Option<String>,
    },
    Result {
        id: CorrelationId,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<Value>,
    },
    Ready {
        subs: Vec<CorrelationId>,
    },
    Nosub {
        id: CorrelationId,
        #[serde(default)]
        error: Option<Value>,
    },
    Added(RawPush),
    Changed(RawPush),
    Removed {
        collection: String,
        #[serde(default)]
        id: Value,
    },
    Ping {
        #[serde(default)]
        id: Option<String>,
    },
}

#[derive(Deserialize)]
struct RawPush {
    collection: String,
    #[serde(default)]
    id: Value,
    #[serde(default)]
    fields: Option<Value>,
}

const KNOWN_KINDS: &[&str] = &[
    "connected", "failed", "result", "ready", "nosub", "added", "changed", "removed", "ping",
];

/// Decode one inbound text frame.
pub fn decode_frame(text: &str) -> Result<Inbound, FrameError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| FrameError::Malformed(e.to_string()))?;

    let Some(kind) = value.get("msg").and_then(Value::as_str) else {
        return Err(FrameError::Shape {
            id: frame_id(&value),
            reason: "missing msg tag".into(),
        });
    };
    if !KNOWN_KINDS.contains(&kind) {
        return Ok(Inbound::Unknown {
            kind: kind.to_string(),
        });
    }

    let id = frame_id(&value);
    let raw: RawInbound = serde_json::from_value(value).map_err(|e| FrameError::Shape {
        id,
        reason: e.to_string(),
    })?;

    Ok(match raw {
        RawInbound::Connected { session } => Inbound::Connected { session },
        RawInbound::Failed { version } => Inbound::Failed { version },
        RawInbound::Result { id, result, error } => Inbound::Result {
            id,
            outcome: match error {
                Some(err) if !err.is_null() => Err(RemoteError::from_value(err)),
                _ => Ok(result.map_or(FieldValue::Null, FieldValue::from)),
            },
        },
        RawInbound::Ready { subs } => Inbound::Ready { subs },
        RawInbound::Nosub { id, error } => Inbound::NoSub {
            id,
            error: error.filter(|e| !e.is_null()).map(RemoteError::from_value),
        },
        RawInbound::Added(push) => Inbound::Push(push.into_event(PushKind::Added)),
        RawInbound::Changed(push) => Inbound::Push(push.into_event(PushKind::Changed)),
        RawInbound::Removed { collection, id } => Inbound::Removed {
            collection,
            id: FieldValue::from(id),
        },
        RawInbound::Ping { id } => Inbound::Ping { id },
    })
}

impl RawPush {
    fn into_event(self, kind: PushKind) -> PushEvent {
        let fields = match self.fields.map(FieldValue::from) {
            Some(FieldValue::Map(map)) => map,
            _ => FieldMap::new(),
        };
        PushEvent {
            kind,
            collection: self.collection,
            id: FieldValue::from(self.id),
            fields,
        }
    }
}

fn frame_id(value: &Value) -> Option<CorrelationId> {
    value
        .get("id")
        .and_then(Value::as_str)
        .map(CorrelationId::from)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
