//! Loopback transport for testing.
//!
//! Uses in-process channels to stand in for the server side of the
//! persistent connection. [`LoopbackTransport::pair`] returns the transport
//! (handed to a session) and a [`LoopbackServer`] handle that a test drives:
//! pushing frames at the client, reading what the client sent, severing the
//! link, and scripting open failures or credential rejection.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use tokio::sync::{mpsc, watch};

use parlor_proto::codec;
use parlor_proto::frame::Frame;

use super::{AuthToken, Conn, Epoch, Inbound, SocketEvent, Transport, TransportError};

/// The currently open link, as seen from the server side.
struct ActiveLink {
    /// Epoch the link was opened under.
    epoch: Epoch,
    /// Listener channel into the session.
    listener: mpsc::Sender<Inbound>,
    /// Shared liveness flag with the client-side [`LoopbackConn`].
    live: Arc<AtomicBool>,
}

/// State shared between the transport, its conns, and the server handle.
struct Shared {
    /// Frames the client has sent, in order.
    outbound_tx: mpsc::UnboundedSender<String>,
    /// The live link, if any.
    link: parking_lot::Mutex<Option<ActiveLink>>,
    /// Count of successful opens, observable by tests.
    opens: watch::Sender<u32>,
    /// Number of upcoming open attempts to fail with a handshake error.
    fail_opens: AtomicU32,
    /// When set, every open is rejected as an authentication failure.
    reject_auth: AtomicBool,
    /// The token presented at the most recent open attempt.
    last_token: parking_lot::Mutex<Option<String>>,
}

/// In-process transport backed by channels, implementing [`Transport`].
pub struct LoopbackTransport {
    shared: Arc<Shared>,
}

/// Test-side handle for a [`LoopbackTransport`].
pub struct LoopbackServer {
    shared: Arc<Shared>,
    outbound_rx: mpsc::UnboundedReceiver<String>,
}

impl LoopbackTransport {
    /// Create a connected transport/server pair.
    #[must_use]
    pub fn pair() -> (Self, LoopbackServer) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (opens, _) = watch::channel(0);
        let shared = Arc::new(Shared {
            outbound_tx,
            link: parking_lot::Mutex::new(None),
            opens,
            fail_opens: AtomicU32::new(0),
            reject_auth: AtomicBool::new(false),
            last_token: parking_lot::Mutex::new(None),
        });
        (
            Self {
                shared: Arc::clone(&shared),
            },
            LoopbackServer {
                shared,
                outbound_rx,
            },
        )
    }
}

impl Transport for LoopbackTransport {
    type Conn = LoopbackConn;

    async fn open(
        &self,
        auth: &AuthToken,
        epoch: Epoch,
        listener: mpsc::Sender<Inbound>,
    ) -> Result<LoopbackConn, TransportError> {
        *self.shared.last_token.lock() = Some(auth.expose().to_string());

        if self.shared.reject_auth.load(Ordering::SeqCst) {
            return Err(TransportError::AuthRejected { status: 401 });
        }

        loop {
            let remaining = self.shared.fail_opens.load(Ordering::SeqCst);
            if remaining == 0 {
                break;
            }
            if self
                .shared
                .fail_opens
                .compare_exchange(remaining, remaining - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Err(TransportError::Handshake("scripted open failure".into()));
            }
        }

        let live = Arc::new(AtomicBool::new(true));
        {
            let mut link = self.shared.link.lock();
            if let Some(existing) = link.as_ref()
                && existing.live.load(Ordering::SeqCst)
            {
                return Err(TransportError::AlreadyOpen);
            }
            *link = Some(ActiveLink {
                epoch,
                listener,
                live: Arc::clone(&live),
            });
        }

        self.shared.opens.send_modify(|n| *n += 1);

        Ok(LoopbackConn {
            shared: Arc::clone(&self.shared),
            live,
        })
    }
}

/// Client-side handle of an open loopback link.
pub struct LoopbackConn {
    shared: Arc<Shared>,
    live: Arc<AtomicBool>,
}

impl std::fmt::Debug for LoopbackConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackConn")
            .field("live", &self.live.load(Ordering::SeqCst))
            .finish()
    }
}

impl Conn for LoopbackConn {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        if !self.live.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.shared
            .outbound_tx
            .send(text)
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self) {
        self.live.store(false, Ordering::SeqCst);
    }
}

impl Drop for LoopbackConn {
    fn drop(&mut self) {
        self.live.store(false, Ordering::SeqCst);
    }
}

impl LoopbackServer {
    /// Deliver a frame to the client over the current link. A frame pushed
    /// while no link is open is silently dropped, like a real network.
    pub async fn push(&self, frame: &Frame) {
        let Ok(text) = codec::encode(frame) else {
            tracing::warn!(kind = frame.kind(), "failed to encode test frame");
            return;
        };
        self.push_raw(text).await;
    }

    /// Deliver raw text to the client, bypassing the codec. Lets tests
    /// exercise malformed-frame handling.
    pub async fn push_raw(&self, text: String) {
        let target = {
            let link = self.shared.link.lock();
            link.as_ref()
                .filter(|l| l.live.load(Ordering::SeqCst))
                .map(|l| (l.epoch, l.listener.clone()))
        };
        match target {
            Some((epoch, listener)) => {
                let _ = listener
                    .send(Inbound {
                        epoch,
                        event: SocketEvent::Frame(text),
                    })
                    .await;
            }
            None => tracing::debug!("push with no live link, dropping"),
        }
    }

    /// Sever the current link from the server side, emitting a close event
    /// the way a dropped TCP connection would.
    pub async fn sever(&self, reason: &str) {
        let target = {
            let mut link = self.shared.link.lock();
            link.take().map(|l| {
                l.live.store(false, Ordering::SeqCst);
                (l.epoch, l.listener)
            })
        };
        if let Some((epoch, listener)) = target {
            let _ = listener
                .send(Inbound {
                    epoch,
                    event: SocketEvent::Closed {
                        reason: reason.to_string(),
                    },
                })
                .await;
        }
    }

    /// Next frame the client sent, decoded. Malformed payloads are skipped.
    pub async fn next_outbound(&mut self) -> Option<Frame> {
        loop {
            let raw = self.outbound_rx.recv().await?;
            match codec::decode(&raw) {
                Ok(frame) => return Some(frame),
                Err(e) => tracing::warn!(err = %e, "client sent undecodable frame"),
            }
        }
    }

    /// Next frame the client sent, skipping heartbeats.
    pub async fn next_non_heartbeat(&mut self) -> Option<Frame> {
        loop {
            match self.next_outbound().await? {
                Frame::Heartbeat { .. } => {}
                other => return Some(other),
            }
        }
    }

    /// Fail the next `n` open attempts with a handshake error.
    pub fn fail_next_opens(&self, n: u32) {
        self.shared.fail_opens.store(n, Ordering::SeqCst);
    }

    /// Reject every subsequent open as an authentication failure.
    pub fn reject_auth(&self, reject: bool) {
        self.shared.reject_auth.store(reject, Ordering::SeqCst);
    }

    /// Number of successful opens so far.
    #[must_use]
    pub fn open_count(&self) -> u32 {
        *self.shared.opens.borrow()
    }

    /// Wait until at least `n` opens have succeeded.
    pub async fn wait_for_opens(&self, n: u32) {
        let mut rx = self.shared.opens.subscribe();
        let _ = rx.wait_for(|count| *count >= n).await;
    }

    /// The bearer token presented at the most recent open attempt.
    #[must_use]
    pub fn last_token(&self) -> Option<String> {
        self.shared.last_token.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parlor_proto::ids::{Timestamp, UserId};

    fn listener() -> (mpsc::Sender<Inbound>, mpsc::Receiver<Inbound>) {
        mpsc::channel(32)
    }

    #[tokio::test]
    async fn open_then_push_delivers_tagged_frame() {
        let (transport, server) = LoopbackTransport::pair();
        let (tx, mut rx) = listener();
        let _conn = transport.open(&AuthToken::new("t"), 5, tx).await.unwrap();

        server
            .push(&Frame::HeartbeatAck {
                timestamp: Timestamp::from_millis(1),
            })
            .await;

        let inbound = rx.recv().await.unwrap();
        assert_eq!(inbound.epoch, 5);
        assert!(matches!(inbound.event, SocketEvent::Frame(_)));
    }

    #[tokio::test]
    async fn outbound_frames_visible_to_server() {
        let (transport, mut server) = LoopbackTransport::pair();
        let (tx, _rx) = listener();
        let mut conn = transport.open(&AuthToken::new("t"), 1, tx).await.unwrap();

        let frame = Frame::Join {
            sender_id: UserId::new("me"),
        };
        conn.send(codec::encode(&frame).unwrap()).await.unwrap();

        assert_eq!(server.next_outbound().await, Some(frame));
    }

    #[tokio::test]
    async fn sever_emits_closed_and_kills_sends() {
        let (transport, server) = LoopbackTransport::pair();
        let (tx, mut rx) = listener();
        let mut conn = transport.open(&AuthToken::new("t"), 1, tx).await.unwrap();

        server.sever("test disconnect").await;

        let inbound = rx.recv().await.unwrap();
        assert!(matches!(inbound.event, SocketEvent::Closed { .. }));

        let result = conn.send("{}".to_string()).await;
        assert!(matches!(result, Err(TransportError::NotConnected)));
    }

    #[tokio::test]
    async fn second_open_while_live_is_rejected() {
        let (transport, _server) = LoopbackTransport::pair();
        let (tx, _rx) = listener();
        let _conn = transport
            .open(&AuthToken::new("t"), 1, tx.clone())
            .await
            .unwrap();

        let second = transport.open(&AuthToken::new("t"), 2, tx).await;
        assert!(matches!(second, Err(TransportError::AlreadyOpen)));
    }

    #[tokio::test]
    async fn reopen_after_conn_dropped() {
        let (transport, server) = LoopbackTransport::pair();
        let (tx, _rx) = listener();
        let conn = transport
            .open(&AuthToken::new("t"), 1, tx.clone())
            .await
            .unwrap();
        drop(conn);

        let second = transport.open(&AuthToken::new("t"), 2, tx).await;
        assert!(second.is_ok());
        assert_eq!(server.open_count(), 2);
    }

    #[tokio::test]
    async fn scripted_open_failures_then_success() {
        let (transport, server) = LoopbackTransport::pair();
        server.fail_next_opens(2);
        let (tx, _rx) = listener();

        for epoch in 1..=2 {
            let result = transport.open(&AuthToken::new("t"), epoch, tx.clone()).await;
            assert!(matches!(result, Err(TransportError::Handshake(_))));
        }
        let result = transport.open(&AuthToken::new("t"), 3, tx).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn auth_rejection_is_scripted() {
        let (transport, server) = LoopbackTransport::pair();
        server.reject_auth(true);
        let (tx, _rx) = listener();

        let result = transport.open(&AuthToken::new("bad"), 1, tx).await;
        assert!(result.unwrap_err().is_auth_rejection());
        assert_eq!(server.last_token().as_deref(), Some("bad"));
    }
}
