//! Socket seam between the event client and the network.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::{ORIGIN, USER_AGENT};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, trace};

use crate::error::{BliveError, Result};
use crate::http::{DEFAULT_UA, LIVE_REFERER, install_rustls_provider};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A connected, message-oriented socket.
///
/// `recv` must be cancel-safe: the client polls it inside `select!` alongside
/// the heartbeat timer and the shutdown signal.
#[async_trait]
pub trait DanmuTransport: Send {
    async fn send(&mut self, frame: Bytes) -> Result<()>;

    /// Next binary message. `None` once the peer has closed the connection.
    async fn recv(&mut self) -> Option<Result<Bytes>>;

    async fn close(&mut self) -> Result<()>;
}

/// Opens transports to gateway URLs.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn DanmuTransport>>;
}

/// WebSocket transport over tokio-tungstenite.
pub struct WebSocketTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl DanmuTransport for WebSocketTransport {
    async fn send(&mut self, frame: Bytes) -> Result<()> {
        self.stream
            .send(Message::Binary(frame))
            .await
            .map_err(|e| BliveError::connection(format!("Failed to send frame: {e}")))
    }

    async fn recv(&mut self) -> Option<Result<Bytes>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Binary(data)) => return Some(Ok(data)),
                Ok(Message::Text(text)) => {
                    return Some(Ok(Bytes::copy_from_slice(text.as_bytes())));
                }
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "Server closed the connection");
                    return None;
                }
                Ok(other) => trace!(?other, "Skipping control message"),
                Err(e) => {
                    return Some(Err(BliveError::connection(format!(
                        "WebSocket receive failed: {e}"
                    ))));
                }
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        match self.stream.close(None).await {
            Ok(()) => Ok(()),
            Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed)
            | Err(tokio_tungstenite::tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(BliveError::connection(format!("Failed to close: {e}"))),
        }
    }
}

/// Connects with browser-like upgrade headers.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    user_agent: String,
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_UA.to_string(),
        }
    }
}

impl WebSocketConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }
}

#[async_trait]
impl TransportConnector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn DanmuTransport>> {
        install_rustls_provider();

        let mut request = url
            .into_client_request()
            .map_err(|e| BliveError::connection(format!("Invalid gateway URL {url}: {e}")))?;
        let headers = request.headers_mut();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&self.user_agent)
                .map_err(|e| BliveError::other(format!("Invalid user agent: {e}")))?,
        );
        headers.insert(ORIGIN, HeaderValue::from_static(LIVE_REFERER));

        let (stream, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(request))
            .await
            .map_err(|_| BliveError::connection(format!("Timed out connecting to {url}")))?
            .map_err(|e| BliveError::connection(format!("Failed to connect to {url}: {e}")))?;

        debug!(url, "WebSocket connected");
        Ok(Box::new(WebSocketTransport { stream }))
    }
}
