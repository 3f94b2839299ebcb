//! Transport layer abstraction for Parlor.
//!
//! Defines the [`Transport`] trait that all connection implementations must
//! satisfy. Concrete implementations:
//! - [`ws::WsTransport`] — the production WebSocket connection
//! - [`loopback::LoopbackTransport`] — in-process channel-based transport
//!   for testing, with scriptable failures
//!
//! A transport owns exactly one underlying socket-like resource at a time
//! and carries no retry logic: a closed or errored connection is terminal
//! until a new [`Transport::open`] call. Everything above the transport —
//! liveness, reconnection, frame semantics — lives in the session layer.

pub mod loopback;
pub mod ws;

use tokio::sync::mpsc;

/// Monotonic connection-epoch counter value.
///
/// Incremented by the session on every connect attempt; every event a
/// connection emits is tagged with the epoch it was opened under, so events
/// from a superseded connection can be recognized and discarded.
pub type Epoch = u64;

/// Bearer credential attached at connection-open time.
#[derive(Clone)]
pub struct AuthToken(String);

impl AuthToken {
    /// Wrap a raw bearer token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Return the raw token for header construction.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never leak the credential into logs.
        f.write_str("AuthToken(***)")
    }
}

/// Raw event emitted by a live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// A text frame arrived from the server.
    Frame(String),
    /// The connection closed or errored; terminal for this connection.
    Closed {
        /// Human-readable close reason, for diagnostics only.
        reason: String,
    },
}

/// A [`SocketEvent`] tagged with the epoch of the connection that produced
/// it. The session discards inbound events whose epoch is not current.
#[derive(Debug)]
pub struct Inbound {
    /// Epoch the connection was opened under.
    pub epoch: Epoch,
    /// The event itself.
    pub event: SocketEvent,
}

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// `open` was called while a previous connection is still live.
    #[error("transport already has a live connection")]
    AlreadyOpen,

    /// The server explicitly rejected the credential during the handshake.
    /// Fatal to the session; never retried automatically.
    #[error("authentication rejected by server (HTTP {status})")]
    AuthRejected {
        /// HTTP status returned by the handshake.
        status: u16,
    },

    /// A send was attempted on a connection that is no longer live.
    #[error("transport is not connected")]
    NotConnected,

    /// The connection dropped mid-flight.
    #[error("connection closed")]
    ConnectionClosed,

    /// The handshake failed for a reason other than authentication.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// An underlying I/O error occurred.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether this failure is an explicit credential rejection, which the
    /// session surfaces to the caller instead of entering the reconnect path.
    #[must_use]
    pub const fn is_auth_rejection(&self) -> bool {
        matches!(self, Self::AuthRejected { .. })
    }
}

/// Factory for persistent connections.
///
/// `open` attaches the bearer credential, registers the single event
/// listener, and resolves once the connection is established. Events from
/// the returned connection flow into `listener` tagged with `epoch` until
/// the connection closes, at which point exactly one
/// [`SocketEvent::Closed`] is emitted (unless the connection was dropped
/// locally first).
pub trait Transport: Send + Sync + 'static {
    /// The live-connection handle type.
    type Conn: Conn;

    /// Open a new connection.
    ///
    /// Rejected with [`TransportError::AlreadyOpen`] while a previous
    /// connection from this transport is still live.
    fn open(
        &self,
        auth: &AuthToken,
        epoch: Epoch,
        listener: mpsc::Sender<Inbound>,
    ) -> impl std::future::Future<Output = Result<Self::Conn, TransportError>> + Send;
}

/// A live connection handle: the outbound half of an open socket.
///
/// Dropping the handle tears the connection down without emitting further
/// events.
pub trait Conn: Send + Sync + 'static {
    /// Send one text frame.
    fn send(
        &mut self,
        text: String,
    ) -> impl std::future::Future<Output = Result<(), TransportError>> + Send;

    /// Close the connection. Terminal; subsequent sends fail with
    /// [`TransportError::NotConnected`].
    fn close(&mut self) -> impl std::future::Future<Output = ()> + Send;
}
