//! Real-time transport seam.
//!
//! The session manager only needs "open", "send a frame", "next frame" and
//! "close". [`WsTransport`] provides them over a WebSocket; tests swap in an
//! in-memory implementation.

use std::future::Future;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use megatrade_protocol::{ClientMessage, ServerMessage};

use crate::error::ConnectionError;

/// Opens connections to a room URL.
pub trait Transport: Send + Sync + 'static {
    type Connection: Connection;

    fn connect(
        &self,
        url: &str,
    ) -> impl Future<Output = Result<Self::Connection, ConnectionError>> + Send;
}

/// One open connection to a room.
pub trait Connection: Send + 'static {
    fn send(
        &mut self,
        msg: ClientMessage,
    ) -> impl Future<Output = Result<(), ConnectionError>> + Send;

    /// Next inbound event. `None` once the peer has closed the stream.
    /// Must be cancel-safe: the manager polls it inside `select!`.
    fn recv(&mut self) -> impl Future<Output = Option<Result<ServerMessage, ConnectionError>>> + Send;

    /// Close the connection. Consumes it, so it runs at most once.
    fn close(self) -> impl Future<Output = ()> + Send;
}

// ---------------------------------------------------------------------------
// WebSocket implementation
// ---------------------------------------------------------------------------

/// WebSocket transport with optional bearer token passed as `?token=`.
#[derive(Debug, Clone, Default)]
pub struct WsTransport {
    auth_token: Option<String>,
}

impl WsTransport {
    pub fn new(auth_token: Option<String>) -> Self {
        Self {
            auth_token: auth_token.filter(|t| !t.trim().is_empty()),
        }
    }
}

fn with_token(url: &str, token: Option<&str>) -> String {
    match token {
        Some(token) => {
            let sep = if url.contains('?') { '&' } else { '?' };
            format!("{url}{sep}token={}", urlencoding::encode(token))
        }
        None => url.to_string(),
    }
}

impl Transport for WsTransport {
    type Connection = WsConnection;

    async fn connect(&self, url: &str) -> Result<WsConnection, ConnectionError> {
        let target = with_token(url, self.auth_token.as_deref());
        let (stream, _) = tokio_tungstenite::connect_async(target.as_str())
            .await
            .map_err(|e| ConnectionError::Connect {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        debug!(
            component = "transport",
            event = "transport.connected",
            url = %url,
        );
        Ok(WsConnection { stream })
    }
}

pub struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Connection for WsConnection {
    async fn send(&mut self, msg: ClientMessage) -> Result<(), ConnectionError> {
        let event = msg.event_name();
        let json = serde_json::to_string(&msg).map_err(|e| ConnectionError::Send {
            event,
            reason: e.to_string(),
        })?;
        self.stream
            .send(WsMessage::Text(json.into()))
            .await
            .map_err(|e| ConnectionError::Send {
                event,
                reason: e.to_string(),
            })
    }

    async fn recv(&mut self) -> Option<Result<ServerMessage, ConnectionError>> {
        loop {
            let frame = match self.stream.next().await? {
                Ok(frame) => frame,
                Err(e) => return Some(Err(ConnectionError::Lost(e.to_string()))),
            };

            match frame {
                WsMessage::Text(text) => match serde_json::from_str::<ServerMessage>(text.as_str())
                {
                    Ok(msg) => return Some(Ok(msg)),
                    Err(e) => {
                        warn!(
                            component = "transport",
                            event = "transport.frame.parse_failed",
                            error = %e,
                            payload_bytes = text.len(),
                            "Dropping undecodable frame"
                        );
                    }
                },
                WsMessage::Close(_) => return None,
                _ => {}
            }
        }
    }

    async fn close(mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!(
                component = "transport",
                event = "transport.close.failed",
                error = %e,
            );
        }
    }
}
