//! Error hierarchy for the TrueNAS client.
//!
//! [`ClientError`] is shared by the protocol engine and the caching layer.
//! Its variants map onto the failure classes a caller has to tell apart:
//!
//! - connection setup: [`ClientError::Handshake`], [`ClientError::Authentication`]
//! - per-call: [`ClientError::RemoteMethod`], [`ClientError::ProtocolViolation`]
//! - lifecycle: [`ClientError::ConnectionClosed`], [`ClientError::Cancelled`]
//! - local: [`ClientError::Precondition`], [`ClientError::Decode`]

use thiserror::Error;

use crate::ids::JobId;

/// Errors surfaced by the TrueNAS client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The server did not complete the `connect` / `connected` exchange.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The server rejected the supplied credentials.
    #[error("authentication rejected by server")]
    Authentication,

    /// The server answered a method call with an error payload.
    #[error("remote method {method} failed: {message}")]
    RemoteMethod {
        /// Method that was invoked.
        method: String,
        /// Server-provided message.
        message: String,
        /// Server-provided errno, when present.
        errno: Option<i64>,
    },

    /// The connection closed before (or instead of) answering.
    #[error("connection closed")]
    ConnectionClosed,

    /// The server sent something the protocol does not allow, or the caller
    /// asked for something the protocol state does not allow.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A read or operation was attempted on an entity in the wrong state.
    #[error("precondition violated: {0}")]
    Precondition(String),

    /// Transport-level failure (socket, websocket framing).
    #[error("transport error: {0}")]
    Transport(String),

    /// A server payload could not be decoded into a typed entity.
    #[error("failed to decode {entity}.{field}: {reason}")]
    Decode {
        /// Entity kind being decoded (e.g. "disk").
        entity: &'static str,
        /// Field that failed.
        field: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A lookup by key found nothing on the server.
    #[error("{kind} {key} not found")]
    NotFound {
        /// Entity kind.
        kind: &'static str,
        /// Key that was looked up.
        key: String,
    },

    /// A second waiter was registered for a job that already has one.
    #[error("already waiting for job {0}")]
    DuplicateJobWait(JobId),

    /// A job reached a terminal state carrying an error.
    #[error("job {id} failed: {message}")]
    JobFailed {
        /// Job id.
        id: JobId,
        /// Error reported by the job.
        message: String,
    },

    /// A wait was abandoned because its event source went away.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Client configuration could not be turned into a connection.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// JSON (de)serialization failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClientError {
    /// Build a [`ClientError::Decode`].
    #[must_use]
    pub fn decode(entity: &'static str, field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Decode {
            entity,
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Whether the error means the connection itself is unusable.
    ///
    /// Per-call failures (remote errors, protocol violations tied to one
    /// call, local preconditions) leave the connection open.
    #[must_use]
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(
            self,
            Self::Handshake(_) | Self::Authentication | Self::ConnectionClosed | Self::Transport(_)
        )
    }

    /// Machine-readable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Handshake(_) => "HANDSHAKE_FAILED",
            Self::Authentication => "AUTHENTICATION_FAILED",
            Self::RemoteMethod { .. } => "REMOTE_METHOD_ERROR",
            Self::ConnectionClosed => "CONNECTION_CLOSED",
            Self::ProtocolViolation(_) => "PROTOCOL_VIOLATION",
            Self::Precondition(_) => "PRECONDITION_VIOLATION",
            Self::Transport(_) => "TRANSPORT_ERROR",
            Self::Decode { .. } => "DECODE_ERROR",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::DuplicateJobWait(_) => "DUPLICATE_JOB_WAIT",
            Self::JobFailed { .. } => "JOB_FAILED",
            Self::Cancelled(_) => "CANCELLED",
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::Json(_) => "JSON_ERROR",
        }
    }
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
