//! WebSocket client for the progress socket endpoint.
//!
//! [`SocketClient`] holds the derived `ws(s)://{host}/ws` URL. Call
//! [`SocketClient::connect`] to open a live [`WsStream`].

use tokio_tungstenite::{connect_async, MaybeTlsStream};

/// The raw WebSocket stream for reading/writing frames.
pub type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Connection configuration for the progress socket.
#[derive(Debug, Clone)]
pub struct SocketClient {
    url: String,
}

impl SocketClient {
    /// Target a socket host.
    ///
    /// * `host`   - host and optional port, e.g. `127.0.0.1:7860`.
    /// * `secure` - use `wss` instead of `ws`.
    pub fn new(host: &str, secure: bool) -> Self {
        Self {
            url: derive_socket_url(host, secure),
        }
    }

    /// Target a fully-formed `ws://` / `wss://` URL.
    pub fn from_url(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Socket URL, e.g. `ws://host:7860/ws`.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Open a connection to the socket endpoint.
    pub async fn connect(&self) -> Result<WsStream, SocketClientError> {
        let (ws_stream, _response) = connect_async(self.url.as_str()).await.map_err(|e| {
            SocketClientError::Connection(format!(
                "Failed to connect to progress socket at {}: {e}",
                self.url
            ))
        })?;

        tracing::debug!(url = %self.url, "Progress socket opened");
        Ok(ws_stream)
    }
}

/// Build `ws(s)://{host}/ws`, tolerating a scheme or trailing slash on
/// `host`.
pub fn derive_socket_url(host: &str, secure: bool) -> String {
    let bare = host
        .trim_start_matches("http://")
        .trim_start_matches("https://")
        .trim_start_matches("ws://")
        .trim_start_matches("wss://")
        .trim_end_matches('/');
    let scheme = if secure { "wss" } else { "ws" };
    format!("{scheme}://{bare}/ws")
}

/// Errors that can occur when working with the WebSocket client.
#[derive(Debug, thiserror::Error)]
pub enum SocketClientError {
    /// Failed to establish the WebSocket connection.
    #[error("Connection error: {0}")]
    Connection(String),
}
