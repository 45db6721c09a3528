//! Connection lifecycle state.

use std::fmt;

use tokio::sync::watch;
use tracing::{debug, warn};

/// Lifecycle of one [`Connection`](crate::Connection).
///
/// `Disconnected → Connecting → AwaitingConnectAck → Authenticating → Open →
/// Closing → Closed`. Any state may jump to `Closing` or `Closed` on failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Nothing has happened yet.
    Disconnected,
    /// Transport is being opened.
    Connecting,
    /// `connect` sent, waiting for `connected`.
    AwaitingConnectAck,
    /// Handshake done, login call in flight.
    Authenticating,
    /// Ready for calls and subscriptions.
    Open,
    /// Waiters are being released and the socket shut down.
    Closing,
    /// Terminal.
    Closed,
}

impl ConnectionState {
    /// Lowercase name for logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::AwaitingConnectAck => "awaiting_connect_ack",
            Self::Authenticating => "authenticating",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }

    /// Whether calls may be issued.
    #[must_use]
    pub fn is_open(self) -> bool {
        self == Self::Open
    }

    /// Whether the connection has reached (or is heading to) `Closed`.
    #[must_use]
    pub fn is_closing_or_closed(self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }

    /// Whether `next` is a legal successor of `self`.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use ConnectionState::{
            AwaitingConnectAck, Authenticating, Closed, Closing, Connecting, Disconnected, Open,
        };
        match (self, next) {
            (Disconnected, Connecting)
            | (Connecting, AwaitingConnectAck)
            | (AwaitingConnectAck, Authenticating)
            | (Authenticating, Open)
            | (Closing, Closed) => true,
            (Closed, _) => false,
            (_, Closing | Closed) => self != Closing || next == Closed,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Move the shared state to `next`, ignoring illegal transitions.
///
/// Returns whether the state changed.
pub(crate) fn advance(state: &watch::Sender<ConnectionState>, next: ConnectionState) -> bool {
    state.send_if_modified(|current| {
        if *current == next {
            return false;
        }
        if !current.can_transition_to(next) {
            warn!(from = %current, to = %next, "ignoring illegal connection state transition");
            return false;
        }
        debug!(from = %current, to = %next, "connection state");
        *current = next;
        true
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    #[test]
    fn happy_path_is_legal() {
        let path = [
            Disconnected,
            Connecting,
            AwaitingConnectAck,
            Authenticating,
            Open,
            Closing,
            Closed,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn cannot_skip_authentication() {
        assert!(!AwaitingConnectAck.can_transition_to(Open));
        assert!(!Connecting.can_transition_to(Open));
    }

    #[test]
    fn any_live_state_can_close() {
        for s in [Connecting, AwaitingConnectAck, Authenticating, Open] {
            assert!(s.can_transition_to(Closing));
            assert!(s.can_transition_to(Closed));
        }
    }

    #[test]
    fn closed_is_terminal() {
        for s in [Disconnected, Connecting, Open, Closing] {
            assert!(!Closed.can_transition_to(s));
        }
        assert!(!Closing.can_transition_to(Open));
    }

    #[test]
    fn advance_rejects_illegal_moves() {
        let (tx, rx) = watch::channel(Disconnected);
        assert!(advance(&tx, Connecting));
        assert!(!advance(&tx, Open));
        assert_eq!(*rx.borrow(), Connecting);
        assert!(advance(&tx, Closed));
        assert!(!advance(&tx, Closing));
        assert_eq!(*rx.borrow(), Closed);
    }

    #[test]
    fn display_names() {
        assert_eq!(AwaitingConnectAck.to_string(), "awaiting_connect_ack");
        assert!(Open.is_open());
        assert!(Closing.is_closing_or_closed());
    }
}
