//! WebSocket transport for Parlor.
//!
//! Wraps `tokio-tungstenite`: the bearer credential is attached as an
//! `Authorization` header at handshake time, the stream is split, and a
//! background reader task forwards inbound text frames to the session's
//! listener channel, tagged with the connection epoch. The reader emits
//! exactly one [`SocketEvent::Closed`] when the socket ends, whether by
//! server close frame, read error, or stream exhaustion.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{StatusCode, header};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use super::{AuthToken, Conn, Epoch, Inbound, SocketEvent, Transport, TransportError};

/// Type alias for the write half of a WebSocket connection.
type WsSink = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// Type alias for the read half of a WebSocket connection.
type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// WebSocket transport implementing the [`Transport`] trait.
///
/// Holds the server endpoint and a liveness guard ensuring at most one
/// underlying socket exists at a time. Cheap to clone-construct per session;
/// the session calls [`Transport::open`] on every (re)connect attempt.
pub struct WsTransport {
    /// WebSocket endpoint (ws:// or wss://).
    endpoint: Url,
    /// Set while a connection from this transport is live.
    live: Arc<AtomicBool>,
}

impl WsTransport {
    /// Create a transport for the given endpoint.
    #[must_use]
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            live: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The endpoint this transport connects to.
    #[must_use]
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

impl Transport for WsTransport {
    type Conn = WsConn;

    /// Open a WebSocket connection with the bearer credential attached.
    ///
    /// # Errors
    ///
    /// - [`TransportError::AlreadyOpen`] while a previous connection is live.
    /// - [`TransportError::AuthRejected`] when the server answers the
    ///   handshake with 401/403.
    /// - [`TransportError::Io`] / [`TransportError::Handshake`] for network
    ///   and protocol failures.
    async fn open(
        &self,
        auth: &AuthToken,
        epoch: Epoch,
        listener: mpsc::Sender<Inbound>,
    ) -> Result<WsConn, TransportError> {
        if self.live.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyOpen);
        }

        let result = self.open_inner(auth, epoch, listener).await;
        if result.is_err() {
            self.live.store(false, Ordering::SeqCst);
        }
        result
    }
}

impl WsTransport {
    async fn open_inner(
        &self,
        auth: &AuthToken,
        epoch: Epoch,
        listener: mpsc::Sender<Inbound>,
    ) -> Result<WsConn, TransportError> {
        let mut request = self
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Handshake(format!("invalid endpoint: {e}")))?;

        let bearer = format!("Bearer {}", auth.expose());
        let value = bearer
            .parse()
            .map_err(|_| TransportError::Handshake("credential is not header-safe".into()))?;
        request.headers_mut().insert(header::AUTHORIZATION, value);

        let (stream, _response) = connect_async(request).await.map_err(|e| {
            tracing::warn!(endpoint = %self.endpoint, err = %e, "WebSocket connect failed");
            map_connect_error(e)
        })?;

        tracing::debug!(endpoint = %self.endpoint, epoch, "WebSocket connection established");

        let (sink, reader) = stream.split();
        let live = Arc::clone(&self.live);
        let reader_handle = tokio::spawn(reader_loop(reader, epoch, listener, Arc::clone(&live)));

        Ok(WsConn {
            sink,
            live,
            reader_handle,
        })
    }
}

/// Live WebSocket connection: the outbound half plus the reader task handle.
pub struct WsConn {
    /// Write half of the socket.
    sink: WsSink,
    /// Shared liveness flag, cleared when either half shuts down.
    live: Arc<AtomicBool>,
    /// Background reader; aborted when the connection is closed or dropped.
    reader_handle: tokio::task::JoinHandle<()>,
}

impl std::fmt::Debug for WsConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConn")
            .field("live", &self.live.load(Ordering::SeqCst))
            .finish()
    }
}

impl Conn for WsConn {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        if !self.live.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }

        self.sink.send(Message::Text(text.into())).await.map_err(|e| {
            tracing::warn!(err = %e, "WebSocket send failed");
            self.live.store(false, Ordering::SeqCst);
            TransportError::ConnectionClosed
        })
    }

    async fn close(&mut self) {
        let _ = self.sink.send(Message::Close(None)).await;
        let _ = self.sink.close().await;
        self.reader_handle.abort();
        self.live.store(false, Ordering::SeqCst);
    }
}

impl Drop for WsConn {
    fn drop(&mut self) {
        self.reader_handle.abort();
        self.live.store(false, Ordering::SeqCst);
    }
}

/// Background task: read WebSocket messages and forward them to the session.
///
/// Text frames become [`SocketEvent::Frame`]; binary, ping, and pong frames
/// are ignored at this layer. Exactly one [`SocketEvent::Closed`] is emitted
/// when the socket ends. The liveness flag is cleared on exit so the owning
/// transport can open a replacement connection.
async fn reader_loop(
    mut reader: WsReader,
    epoch: Epoch,
    listener: mpsc::Sender<Inbound>,
    live: Arc<AtomicBool>,
) {
    let mut close_reason: Option<String> = None;

    while let Some(msg) = reader.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let event = SocketEvent::Frame(String::from(text.as_str()));
                if listener.send(Inbound { epoch, event }).await.is_err() {
                    // Session dropped its receiver; nothing left to notify.
                    live.store(false, Ordering::SeqCst);
                    return;
                }
            }
            Ok(Message::Close(frame)) => {
                close_reason = Some(
                    frame.map_or_else(|| "closed by server".to_string(), |f| f.reason.to_string()),
                );
                break;
            }
            Ok(Message::Binary(_) | Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
            Err(e) => {
                tracing::warn!(err = %e, "WebSocket read error");
                close_reason = Some(e.to_string());
                break;
            }
        }
    }

    live.store(false, Ordering::SeqCst);
    let reason = close_reason.unwrap_or_else(|| "stream ended".to_string());
    tracing::debug!(epoch, reason = %reason, "WebSocket reader exiting");
    let _ = listener
        .send(Inbound {
            epoch,
            event: SocketEvent::Closed { reason },
        })
        .await;
}

/// Map a `tokio_tungstenite` connection error to a [`TransportError`].
///
/// An explicit 401/403 from the server is an authentication rejection and
/// must not be retried; everything else is a recoverable transport fault.
fn map_connect_error(err: tokio_tungstenite::tungstenite::Error) -> TransportError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Http(response) => {
            let status = response.status();
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                TransportError::AuthRejected {
                    status: status.as_u16(),
                }
            } else {
                TransportError::Handshake(format!("server HTTP error: status {status}"))
            }
        }
        WsError::Io(io_err) => TransportError::Io(io_err),
        WsError::Tls(_) => TransportError::Handshake(format!("TLS error: {err}")),
        other => TransportError::Handshake(format!("connection error: {other}")),
    }
}
