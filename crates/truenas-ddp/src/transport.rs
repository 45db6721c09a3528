//! Websocket transport.
//!
//! The engine runs over any [`WsTransport`]; [`open`] produces the usual one,
//! a `tokio-tungstenite` client socket. `wss://` URLs need the `tls` feature.

use futures::{Sink, Stream};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;
use truenas_core::{ClientError, Result};

/// Client socket returned by [`open`].
pub type WebSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A duplex websocket message channel the engine can own.
pub trait WsTransport:
    Sink<Message, Error = WsError> + Stream<Item = std::result::Result<Message, WsError>> + Unpin + Send + 'static
{
}

impl<T> WsTransport for T where
    T: Sink<Message, Error = WsError>
        + Stream<Item = std::result::Result<Message, WsError>>
        + Unpin
        + Send
        + 'static
{
}

/// Endpoint URL for `host`: `ws[s]://<host>/websocket`.
#[must_use]
pub fn endpoint_url(host: &str, secure: bool) -> String {
    let scheme = if secure { "wss" } else { "ws" };
    format!("{scheme}://{host}/websocket")
}

/// Open a websocket to `url`.
pub async fn open(url: &str) -> Result<WebSocket> {
    let (ws, response) = connect_async(url)
        .await
        .map_err(|e| ClientError::Transport(format!("connect {url}: {e}")))?;
    debug!(%url, status = %response.status(), "websocket open");
    Ok(ws)
}

/// Map a websocket error into [`ClientError::Transport`].
pub(crate) fn transport_error(err: &WsError) -> ClientError {
    ClientError::Transport(err.to_string())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
