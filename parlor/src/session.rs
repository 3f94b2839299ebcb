//! Session lifecycle: connect → join → ready, liveness, reconnection.
//!
//! [`ChatSession`] is the caller-facing handle; all methods return
//! immediately. Behind it a single driver task owns the connection, the
//! liveness timers, and every [`ChatState`] mutation triggered by inbound
//! traffic, so frames are processed strictly in arrival order.
//!
//! The driver is a phase machine:
//!
//! ```text
//! disconnected → connecting → connected → (closed|stale) → reconnecting
//!                    ↑                                          |
//!                    └──────────────── backoff ─────────────────┘
//! ```
//!
//! `disconnected` is terminal only on explicit caller disconnect; transport
//! loss and liveness timeouts re-enter `connecting` indefinitely with
//! exponential backoff. Every connect attempt increments a monotonic epoch;
//! inbound events from a superseded connection are recognized by their
//! stale epoch and dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use parlor_proto::codec;
use parlor_proto::frame::Frame;
use parlor_proto::ids::{ClientMessageId, ServerMessageId, Timestamp, UserId};

use crate::config::SessionConfig;
use crate::history::HistoryClient;
use crate::liveness::LivenessMonitor;
use crate::reconcile::{Notice, Reconciler};
use crate::state::{ChatState, DeliveryStatus, Direction, Message};
use crate::transport::{AuthToken, Conn, Epoch, Inbound, SocketEvent, Transport, TransportError};

/// Connection phase of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// No connection and none wanted (initial state, or after an explicit
    /// disconnect / fatal auth failure).
    Disconnected,
    /// A connect attempt is in flight.
    Connecting,
    /// Live connection, frames flowing.
    Connected,
    /// Connection lost; waiting out the backoff before retrying.
    Reconnecting,
}

/// Notifications for the embedding view. State is read separately through
/// [`ChatState`] snapshots; events only say that something happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The session phase changed.
    PhaseChanged(SessionPhase),
    /// A peer message was appended to the state.
    MessageReceived {
        /// Who sent it.
        from: UserId,
        /// Local handle of the appended row.
        client_id: ClientMessageId,
    },
    /// A pending message was confirmed by the server.
    MessageConfirmed {
        /// The confirmed message.
        client_id: ClientMessageId,
        /// Server-assigned id, when provided.
        server_id: Option<ServerMessageId>,
    },
    /// A message could not be transmitted; the view may offer retry.
    MessageFailed {
        /// The failed message.
        client_id: ClientMessageId,
    },
    /// A peer has read our messages up to the given time.
    ReadReceipt {
        /// The peer who read them.
        reader: UserId,
        /// Read-up-to watermark.
        up_to: Timestamp,
    },
    /// The server pushed an error frame.
    ServerError {
        /// Human-readable description.
        message: String,
        /// Machine-readable code, when provided.
        code: Option<String>,
    },
    /// The server rejected the credential. Terminal: the caller must
    /// re-authenticate and call [`ChatSession::connect`] again.
    AuthFailed {
        /// HTTP status from the handshake.
        status: u16,
    },
}

/// Commands from the handle to the driver task.
#[derive(Debug)]
enum Command {
    Connect,
    Disconnect,
    Transmit {
        client_id: ClientMessageId,
        to: UserId,
        body: String,
    },
    MarkRead {
        peer: UserId,
    },
    Select {
        peer: Option<UserId>,
    },
    RetryNow,
}

/// State shared between the handle and the driver.
struct Shared {
    phase: parking_lot::Mutex<SessionPhase>,
    attempt: AtomicU32,
}

impl Shared {
    fn new() -> Self {
        Self {
            phase: parking_lot::Mutex::new(SessionPhase::Disconnected),
            attempt: AtomicU32::new(0),
        }
    }

    fn phase(&self) -> SessionPhase {
        *self.phase.lock()
    }

    fn swap_phase(&self, next: SessionPhase) -> SessionPhase {
        std::mem::replace(&mut *self.phase.lock(), next)
    }

    fn attempt(&self) -> u32 {
        self.attempt.load(Ordering::SeqCst)
    }

    fn bump_attempt(&self) {
        self.attempt.fetch_add(1, Ordering::SeqCst);
    }

    fn reset_attempt(&self) {
        self.attempt.store(0, Ordering::SeqCst);
    }
}

/// Caller-facing session handle.
///
/// Owned by the embedding application; collaborators receive clones of the
/// [`ChatState`] handle for reads. No method blocks: completion and failure
/// are observed through [`SessionEvent`]s and state snapshots.
pub struct ChatSession {
    local_id: UserId,
    cmd_tx: mpsc::Sender<Command>,
    event_tx: mpsc::Sender<SessionEvent>,
    state: Arc<ChatState>,
    shared: Arc<Shared>,
}

impl ChatSession {
    /// Spawn a session driver and return the handle plus the event stream.
    ///
    /// The session starts in `disconnected`; call [`connect`](Self::connect)
    /// to bring it up. `history` is optional — without it the session skips
    /// roster and conversation seeding.
    pub fn spawn<T: Transport>(
        local_id: UserId,
        auth: AuthToken,
        transport: T,
        history: Option<HistoryClient>,
        config: SessionConfig,
    ) -> (Self, mpsc::Receiver<SessionEvent>) {
        let state = Arc::new(ChatState::new());
        let shared = Arc::new(Shared::new());
        let (cmd_tx, cmd_rx) = mpsc::channel(config.channel_capacity);
        let (event_tx, event_rx) = mpsc::channel(config.channel_capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.channel_capacity);

        let reconciler = Reconciler::new(
            local_id.clone(),
            Arc::clone(&state),
            config.pending_retention,
        );

        let driver = Driver {
            transport,
            auth,
            local_id: local_id.clone(),
            config,
            state: Arc::clone(&state),
            shared: Arc::clone(&shared),
            reconciler,
            history,
            cmd_rx,
            inbound_tx,
            inbound_rx,
            event_tx: event_tx.clone(),
            epoch: 0,
            conn: None,
        };
        tokio::spawn(driver.run());

        (
            Self {
                local_id,
                cmd_tx,
                event_tx,
                state,
                shared,
            },
            event_rx,
        )
    }

    /// The local identity this session authenticates as.
    #[must_use]
    pub fn local_id(&self) -> &UserId {
        &self.local_id
    }

    /// Shared chat state for snapshot reads.
    #[must_use]
    pub fn state(&self) -> Arc<ChatState> {
        Arc::clone(&self.state)
    }

    /// Current connection phase.
    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        self.shared.phase()
    }

    /// Consecutive reconnect attempts since the last successful connect.
    #[must_use]
    pub fn reconnect_attempt(&self) -> u32 {
        self.shared.attempt()
    }

    /// Bring the session up. No-op while already connecting or connected.
    pub fn connect(&self) {
        self.send_command(Command::Connect);
    }

    /// Tear the session down. Terminal: no automatic reconnects occur until
    /// [`connect`](Self::connect) is called again.
    pub fn disconnect(&self) {
        self.send_command(Command::Disconnect);
    }

    /// Host signal that connectivity or foreground visibility returned:
    /// interrupts a pending backoff wait and retries immediately.
    pub fn retry_now(&self) {
        self.send_command(Command::RetryNow);
    }

    /// Send a chat message to `to`.
    ///
    /// The message is appended to the state as `pending` immediately
    /// (optimistic) and transmitted by the driver. When the session is not
    /// connected the message is marked `failed` at once and nothing is
    /// transmitted; a [`SessionEvent::MessageFailed`] is emitted so the
    /// view can offer retry. Returns the message's local handle.
    pub fn send_message(&self, to: &UserId, body: impl Into<String>) -> ClientMessageId {
        let body = body.into();
        let client_id = ClientMessageId::new();
        self.state.append_message(Message {
            client_id,
            server_id: None,
            peer: to.clone(),
            direction: Direction::Outgoing,
            body: body.clone(),
            sent_at: Timestamp::now(),
            status: DeliveryStatus::Pending,
        });

        let connected = self.shared.phase() == SessionPhase::Connected;
        let dispatched = connected
            && self
                .cmd_tx
                .try_send(Command::Transmit {
                    client_id,
                    to: to.clone(),
                    body,
                })
                .is_ok();

        if !dispatched {
            tracing::warn!(%client_id, to = %to, "send while not connected, marking failed");
            self.state.fail_message(client_id);
            let _ = self.event_tx.try_send(SessionEvent::MessageFailed { client_id });
        }
        client_id
    }

    /// Seed or replace the roster directly, for embedders that fetch the
    /// roster themselves instead of configuring a history API. The selected
    /// conversation's counter stays pinned at zero.
    pub fn seed_roster(&self, users: Vec<crate::state::User>) {
        self.state.replace_roster(users);
    }

    /// Mark `peer` as the currently viewed conversation (or clear with
    /// `None`). Selecting pins that peer's unread counter to zero, tells
    /// the server the messages were read, and seeds the conversation from
    /// the history API when one is configured.
    pub fn select_conversation(&self, peer: Option<UserId>) {
        self.state.select(peer.clone());
        self.send_command(Command::Select { peer });
    }

    /// Tell the server that `peer`'s messages have been read, without
    /// changing the selection.
    pub fn mark_read(&self, peer: &UserId) {
        self.send_command(Command::MarkRead { peer: peer.clone() });
    }

    fn send_command(&self, command: Command) {
        if let Err(e) = self.cmd_tx.try_send(command) {
            tracing::warn!(err = %e, "session command dropped");
        }
    }
}

/// Outcome of a single connect attempt, resolved outside the borrow scope
/// of the in-flight open future.
enum ConnectOutcome<C> {
    Opened(C),
    Failed,
    AuthFailed(u16),
    TimedOut,
    Cancelled,
    HandleDropped,
}

/// Whether the connected loop keeps running after handling a command.
#[derive(PartialEq)]
enum Flow {
    Continue,
    Exit,
}

/// The driver task: single logical owner of the connection, its inbound
/// frames, and the liveness timers.
struct Driver<T: Transport> {
    transport: T,
    auth: AuthToken,
    local_id: UserId,
    config: SessionConfig,
    state: Arc<ChatState>,
    shared: Arc<Shared>,
    reconciler: Reconciler,
    history: Option<HistoryClient>,
    cmd_rx: mpsc::Receiver<Command>,
    inbound_tx: mpsc::Sender<Inbound>,
    inbound_rx: mpsc::Receiver<Inbound>,
    event_tx: mpsc::Sender<SessionEvent>,
    epoch: Epoch,
    conn: Option<T::Conn>,
}

impl<T: Transport> Driver<T> {
    async fn run(mut self) {
        loop {
            match self.shared.phase() {
                SessionPhase::Disconnected => {
                    if !self.idle().await {
                        tracing::debug!("session handle dropped, driver exiting");
                        return;
                    }
                }
                SessionPhase::Connecting => self.connect_once().await,
                SessionPhase::Connected => {
                    if self.run_connected().await == Flow::Exit {
                        return;
                    }
                }
                SessionPhase::Reconnecting => {
                    if self.backoff_wait().await == Flow::Exit {
                        return;
                    }
                }
            }
        }
    }

    /// Wait for work while disconnected. Returns `false` when the handle is
    /// gone and the driver should exit.
    async fn idle(&mut self) -> bool {
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    None => return false,
                    Some(Command::Connect) => {
                        self.set_phase(SessionPhase::Connecting);
                        return true;
                    }
                    Some(Command::Transmit { client_id, .. }) => {
                        // The handle raced a phase change; fail it here.
                        self.fail_transmit(client_id);
                    }
                    Some(Command::MarkRead { peer }) => {
                        tracing::debug!(peer = %peer, "mark-read while disconnected, dropped");
                    }
                    Some(
                        Command::Disconnect
                        | Command::RetryNow
                        | Command::Select { .. },
                    ) => {}
                },
                inbound = self.inbound_rx.recv() => drop_stale(inbound),
            }
        }
    }

    /// One connect attempt under the connect-timeout guard.
    async fn connect_once(&mut self) {
        self.conn = None;
        self.epoch += 1;
        let epoch = self.epoch;
        tracing::info!(epoch, attempt = self.shared.attempt(), "opening connection");

        let outcome = {
            let open = self
                .transport
                .open(&self.auth, epoch, self.inbound_tx.clone());
            tokio::pin!(open);
            let guard = tokio::time::sleep(self.config.connect_timeout);
            tokio::pin!(guard);

            loop {
                tokio::select! {
                    () = &mut guard => break ConnectOutcome::TimedOut,
                    result = &mut open => break match result {
                        Ok(conn) => ConnectOutcome::Opened(conn),
                        Err(TransportError::AuthRejected { status }) => {
                            ConnectOutcome::AuthFailed(status)
                        }
                        Err(e) => {
                            tracing::warn!(err = %e, epoch, "connect attempt failed");
                            ConnectOutcome::Failed
                        }
                    },
                    cmd = self.cmd_rx.recv() => match cmd {
                        None => break ConnectOutcome::HandleDropped,
                        Some(Command::Disconnect) => break ConnectOutcome::Cancelled,
                        Some(Command::Transmit { client_id, .. }) => {
                            self.state.fail_message(client_id);
                            let _ = self
                                .event_tx
                                .try_send(SessionEvent::MessageFailed { client_id });
                        }
                        // Connect while connecting is a no-op; the rest
                        // cannot act without a live connection.
                        Some(_) => {}
                    },
                    inbound = self.inbound_rx.recv() => drop_stale(inbound),
                }
            }
        };

        match outcome {
            ConnectOutcome::Opened(conn) => self.on_connected(conn).await,
            ConnectOutcome::Failed => self.note_failure(),
            ConnectOutcome::TimedOut => {
                tracing::warn!(epoch, "connect attempt timed out");
                self.note_failure();
            }
            ConnectOutcome::AuthFailed(status) => {
                tracing::warn!(status, "authentication rejected, not retrying");
                let _ = self
                    .event_tx
                    .try_send(SessionEvent::AuthFailed { status });
                self.set_phase(SessionPhase::Disconnected);
            }
            ConnectOutcome::Cancelled | ConnectOutcome::HandleDropped => {
                // Abandon the in-flight attempt; its epoch is already stale
                // for any events that straggle in.
                self.set_phase(SessionPhase::Disconnected);
            }
        }
    }

    /// Successful open: announce presence, seed the roster, go connected.
    async fn on_connected(&mut self, mut conn: T::Conn) {
        let join = Frame::Join {
            sender_id: self.local_id.clone(),
        };
        if let Err(e) = send_frame(&mut conn, &join).await {
            tracing::warn!(err = %e, "join announcement failed");
            self.note_failure();
            return;
        }
        self.conn = Some(conn);
        self.shared.reset_attempt();

        if let Some(history) = &self.history {
            match history.roster_with_unread(&self.local_id).await {
                Ok(roster) => self.state.replace_roster(roster),
                Err(e) => {
                    // Live traffic still works without the seed.
                    tracing::warn!(err = %e, "roster seed failed, continuing");
                }
            }
        }

        self.set_phase(SessionPhase::Connected);
        tracing::info!(epoch = self.epoch, "session connected");
    }

    /// The connected loop: inbound frames, heartbeat emit/check ticks, and
    /// caller commands. Returns [`Flow::Exit`] when the driver should stop
    /// entirely (handle dropped); phase changes are signalled through
    /// shared state.
    async fn run_connected(&mut self) -> Flow {
        let mut liveness = LivenessMonitor::new(&self.config.liveness);
        let period = self.config.liveness.emit_interval;
        let start = tokio::time::Instant::now() + period;
        let mut emit = tokio::time::interval_at(start, period);
        emit.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut check = tokio::time::interval_at(start, period);
        check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                inbound = self.inbound_rx.recv() => {
                    let Some(inbound) = inbound else { continue };
                    if inbound.epoch != self.epoch {
                        tracing::trace!(stale = inbound.epoch, current = self.epoch, "stale event dropped");
                        continue;
                    }
                    liveness.record_frame();
                    match inbound.event {
                        SocketEvent::Frame(text) => self.handle_frame(&text),
                        SocketEvent::Closed { reason } => {
                            tracing::warn!(reason = %reason, "connection closed");
                            self.conn = None;
                            self.note_failure();
                            return Flow::Continue;
                        }
                    }
                }
                _ = emit.tick() => {
                    let heartbeat = Frame::Heartbeat { timestamp: Timestamp::now() };
                    if self.send_current(&heartbeat).await.is_err() {
                        tracing::warn!("heartbeat send failed");
                        self.conn = None;
                        self.note_failure();
                        return Flow::Continue;
                    }
                }
                _ = check.tick() => {
                    if liveness.is_stale() {
                        tracing::warn!(
                            silence = ?liveness.silence(),
                            "no inbound traffic within silence window, presuming dead"
                        );
                        self.conn = None;
                        self.note_failure();
                        return Flow::Continue;
                    }
                }
                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        self.shutdown_conn().await;
                        return Flow::Exit;
                    };
                    match self.handle_command(cmd).await {
                        Flow::Exit => return Flow::Continue,
                        Flow::Continue => {}
                    }
                }
            }
        }
    }

    /// Decode and reconcile one inbound text frame.
    fn handle_frame(&mut self, text: &str) {
        match codec::decode(text) {
            Ok(frame) => {
                if let Some(notice) = self.reconciler.apply(frame) {
                    self.emit_notice(notice);
                }
            }
            Err(e) => {
                // Malformed frames never affect connection state.
                tracing::warn!(err = %e, "discarding malformed frame");
            }
        }
    }

    /// Handle one command while connected. `Flow::Exit` here means "leave
    /// the connected loop", not "stop the driver".
    async fn handle_command(&mut self, cmd: Command) -> Flow {
        match cmd {
            Command::Connect | Command::RetryNow => Flow::Continue,
            Command::Disconnect => {
                self.shutdown_conn().await;
                // Cancel the epoch so in-flight reader events no-op.
                self.epoch += 1;
                self.set_phase(SessionPhase::Disconnected);
                tracing::info!("session disconnected by caller");
                Flow::Exit
            }
            Command::Transmit { client_id, to, body } => {
                self.reconciler.track_pending(client_id);
                let frame = Frame::Message {
                    id: None,
                    client_message_id: Some(client_id),
                    sender_id: self.local_id.clone(),
                    receiver_id: to,
                    content: body,
                    sent_time: Some(Timestamp::now()),
                };
                if self.send_current(&frame).await.is_err() {
                    self.fail_transmit(client_id);
                    self.conn = None;
                    self.note_failure();
                    return Flow::Exit;
                }
                Flow::Continue
            }
            Command::MarkRead { peer } => {
                let frame = Frame::MarkAsRead { sender_id: peer };
                if self.send_current(&frame).await.is_err() {
                    self.conn = None;
                    self.note_failure();
                    return Flow::Exit;
                }
                Flow::Continue
            }
            Command::Select { peer } => {
                let Some(peer) = peer else { return Flow::Continue };
                let frame = Frame::MarkAsRead {
                    sender_id: peer.clone(),
                };
                if self.send_current(&frame).await.is_err() {
                    self.conn = None;
                    self.note_failure();
                    return Flow::Exit;
                }
                self.seed_conversation(&peer).await;
                Flow::Continue
            }
        }
    }

    /// Seed the selected conversation from the history API, when configured.
    async fn seed_conversation(&self, peer: &UserId) {
        let Some(history) = &self.history else { return };
        match history.conversation(&self.local_id, peer).await {
            Ok(messages) => self.state.set_conversation(peer, messages),
            Err(e) => tracing::warn!(err = %e, peer = %peer, "conversation seed failed"),
        }
    }

    /// Wait out the backoff delay, interruptible by an explicit retry or
    /// disconnect. Returns [`Flow::Exit`] when the handle is gone.
    async fn backoff_wait(&mut self) -> Flow {
        let prior_failures = self.shared.attempt().saturating_sub(1);
        let delay = self.config.backoff.next_delay(prior_failures);
        tracing::info!(attempt = self.shared.attempt(), ?delay, "backing off before reconnect");

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                () = &mut sleep => {
                    self.set_phase(SessionPhase::Connecting);
                    return Flow::Continue;
                }
                cmd = self.cmd_rx.recv() => match cmd {
                    None => return Flow::Exit,
                    Some(Command::Disconnect) => {
                        self.epoch += 1;
                        self.set_phase(SessionPhase::Disconnected);
                        return Flow::Continue;
                    }
                    Some(Command::Connect | Command::RetryNow) => {
                        tracing::info!("backoff interrupted, retrying now");
                        self.set_phase(SessionPhase::Connecting);
                        return Flow::Continue;
                    }
                    Some(Command::Transmit { client_id, .. }) => {
                        self.fail_transmit(client_id);
                    }
                    Some(Command::MarkRead { peer }) => {
                        tracing::debug!(peer = %peer, "mark-read while reconnecting, dropped");
                    }
                    Some(Command::Select { .. }) => {}
                },
                inbound = self.inbound_rx.recv() => drop_stale(inbound),
            }
        }
    }

    /// Send a frame over the current connection.
    async fn send_current(&mut self, frame: &Frame) -> Result<(), TransportError> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(TransportError::NotConnected);
        };
        send_frame(conn, frame).await
    }

    /// Mark a message failed in state, table, and events.
    fn fail_transmit(&mut self, client_id: ClientMessageId) {
        self.state.fail_message(client_id);
        self.reconciler.mark_resolved(client_id);
        let _ = self
            .event_tx
            .try_send(SessionEvent::MessageFailed { client_id });
    }

    /// Record a failed attempt and enter the reconnect path.
    fn note_failure(&mut self) {
        self.conn = None;
        self.shared.bump_attempt();
        self.set_phase(SessionPhase::Reconnecting);
    }

    async fn shutdown_conn(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.close().await;
        }
    }

    fn set_phase(&mut self, phase: SessionPhase) {
        if self.shared.swap_phase(phase) != phase {
            let _ = self.event_tx.try_send(SessionEvent::PhaseChanged(phase));
        }
    }

    fn emit_notice(&self, notice: Notice) {
        let event = match notice {
            Notice::MessageReceived { from, client_id } => {
                SessionEvent::MessageReceived { from, client_id }
            }
            Notice::MessageConfirmed {
                client_id,
                server_id,
            } => SessionEvent::MessageConfirmed {
                client_id,
                server_id,
            },
            Notice::ReadReceipt { reader, up_to } => {
                SessionEvent::ReadReceipt { reader, up_to }
            }
            Notice::ServerError { message, code } => {
                SessionEvent::ServerError { message, code }
            }
        };
        let _ = self.event_tx.try_send(event);
    }
}

/// Encode and send one frame. Encode failures are programming errors; the
/// frame is dropped with a diagnostic rather than killing the connection.
async fn send_frame<C: Conn>(conn: &mut C, frame: &Frame) -> Result<(), TransportError> {
    match codec::encode(frame) {
        Ok(text) => conn.send(text).await,
        Err(e) => {
            tracing::error!(err = %e, kind = frame.kind(), "failed to encode outbound frame");
            Ok(())
        }
    }
}

/// Drain handler for inbound events that arrive while no connection is
/// current: everything here is stale by construction.
fn drop_stale(inbound: Option<Inbound>) {
    if let Some(inbound) = inbound {
        tracing::trace!(epoch = inbound.epoch, "dropping event from stale connection");
    }
}
