//! Upstream WebSocket connector.
//!
//! [`UpstreamConnector`] opens one WebSocket per relay session to the
//! configured control server, rewriting the `Upgrade` header of the
//! handshake. The resulting [`UpstreamConnection`] is split into a send
//! half and a receive half so two session tasks can own them.

use std::fmt;
use std::time::Duration;

use axum::http::{HeaderMap, HeaderValue};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use super::headers::{forward_handshake_headers, rewrite_upgrade};
use crate::config::RelayConfig;
use crate::domain::Frame;
use crate::error::RelayError;

type UpstreamStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens WebSocket connections to the upstream control server.
#[derive(Debug, Clone)]
pub struct UpstreamConnector {
    url: Url,
    upgrade_token: Option<HeaderValue>,
    connect_timeout: Duration,
}

impl UpstreamConnector {
    /// Creates a connector for `url` (`ws://` or `wss://`).
    #[must_use]
    pub fn new(url: Url, upgrade_token: Option<HeaderValue>, connect_timeout: Duration) -> Self {
        Self {
            url,
            upgrade_token,
            connect_timeout,
        }
    }

    /// Creates a connector for the upstream WebSocket endpoint in `config`.
    #[must_use]
    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(
            config.upstream_ws_url(),
            config.upgrade_token.clone(),
            config.upstream_connect_timeout,
        )
    }

    /// URL this connector dials.
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Opens one WebSocket connection upstream.
    ///
    /// `client_headers` are the downstream handshake headers; end-to-end
    /// ones are forwarded and the `Upgrade` header is rewritten.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::UpstreamUnreachable`] if the request cannot be
    /// built, the TCP connect or WebSocket handshake fails, or the connect
    /// timeout elapses.
    pub async fn connect(&self, client_headers: &HeaderMap) -> Result<UpstreamConnection, RelayError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| RelayError::UpstreamUnreachable(e.to_string()))?;

        let headers = request.headers_mut();
        for (name, value) in &forward_handshake_headers(client_headers) {
            headers.append(name.clone(), value.clone());
        }
        rewrite_upgrade(headers, self.upgrade_token.as_ref());

        let connect = tokio_tungstenite::connect_async(request);
        let (stream, response) = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| {
                RelayError::UpstreamUnreachable(format!(
                    "no handshake within {:?}",
                    self.connect_timeout
                ))
            })?
            .map_err(|e| RelayError::UpstreamUnreachable(e.to_string()))?;

        tracing::debug!(
            url = %self.url,
            status = %response.status(),
            "upstream websocket connected"
        );

        let (sink, stream) = stream.split();
        Ok(UpstreamConnection {
            sender: UpstreamSender { sink, closed: false },
            receiver: UpstreamReceiver { stream },
        })
    }
}

/// One open WebSocket connection to the upstream.
pub struct UpstreamConnection {
    sender: UpstreamSender,
    receiver: UpstreamReceiver,
}

impl UpstreamConnection {
    /// Separates the send and receive halves.
    #[must_use]
    pub fn into_split(self) -> (UpstreamSender, UpstreamReceiver) {
        (self.sender, self.receiver)
    }
}

impl fmt::Debug for UpstreamConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamConnection")
            .field("sender", &self.sender)
            .finish_non_exhaustive()
    }
}

/// Write half of an upstream connection.
pub struct UpstreamSender {
    sink: SplitSink<UpstreamStream, Message>,
    closed: bool,
}

impl UpstreamSender {
    /// Sends one frame upstream.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::UpstreamSendFailed`] if [`Self::close`] was
    /// called or the write fails. A failed write marks the sender closed.
    pub async fn send(&mut self, frame: Frame) -> Result<(), RelayError> {
        if self.closed {
            return Err(RelayError::UpstreamSendFailed(
                "connection already closed".to_string(),
            ));
        }
        let message = match frame {
            Frame::Text(text) => Message::text(text),
            Frame::Binary(data) => Message::binary(data),
        };
        self.sink.send(message).await.map_err(|e| {
            self.closed = true;
            RelayError::UpstreamSendFailed(e.to_string())
        })
    }

    /// Sends a close frame and flushes. Idempotent; errors are ignored since
    /// the peer may already be gone.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.sink.close().await {
            tracing::trace!(error = %e, "upstream close handshake incomplete");
        }
    }
}

impl fmt::Debug for UpstreamSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamSender")
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

/// Read half of an upstream connection.
pub struct UpstreamReceiver {
    stream: SplitStream<UpstreamStream>,
}

impl UpstreamReceiver {
    /// Receives the next data frame from upstream.
    ///
    /// Ping and pong frames are answered by the WebSocket layer and skipped
    /// here. Returns `None` when the upstream closes cleanly (close frame or
    /// end of stream) and `Some(Err(RelayError::UpstreamReceiveFailed))`
    /// when the connection fails.
    pub async fn receive(&mut self) -> Option<Result<Frame, RelayError>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(RelayError::UpstreamReceiveFailed(e.to_string()))),
            };
            match message {
                Message::Text(text) => return Some(Ok(Frame::from(text.as_str().to_owned()))),
                Message::Binary(data) => return Some(Ok(Frame::from(data))),
                Message::Close(frame) => {
                    tracing::debug!(?frame, "upstream sent close frame");
                    return None;
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }
}

impl fmt::Debug for UpstreamReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamReceiver").finish_non_exhaustive()
    }
}
