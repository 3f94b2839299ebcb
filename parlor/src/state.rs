//! In-memory projection of the chat: roster, messages, selection.
//!
//! [`ChatState`] is the single place conversation data lives. The session
//! and the reconciler are its only writers; readers (the embedding UI) get
//! cloned snapshots and never observe a half-applied update. All status
//! transitions go through the crate-private mutators, which enforce the
//! message lifecycle invariant: `pending` moves only to `confirmed` or
//! `failed`, and never back.

use parking_lot::RwLock;

use parlor_proto::ids::{ClientMessageId, ServerMessageId, Timestamp, UserId};

/// Online/offline flag for a roster member, as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    /// The peer has an active session.
    Online,
    /// The peer is disconnected (or timed out server-side).
    Offline,
}

/// A conversation partner.
///
/// Created when the roster is seeded, updated in place, never removed
/// during a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    /// Opaque stable identity.
    pub id: UserId,
    /// Name to display for this user.
    pub display_name: String,
    /// Last announced presence.
    pub presence: Presence,
    /// Messages from this user not yet read locally.
    pub unread: u32,
}

impl User {
    /// A roster entry in its initial state: offline, nothing unread.
    #[must_use]
    pub fn new(id: UserId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            presence: Presence::Offline,
            unread: 0,
        }
    }
}

/// Whether a message originated locally or from a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Sent by the local user.
    Outgoing,
    /// Received from a peer.
    Incoming,
}

/// Delivery lifecycle of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// Sent locally, awaiting server confirmation.
    Pending,
    /// The server acknowledged our send.
    Confirmed,
    /// The send failed; the view may offer retry.
    Failed,
    /// Received from the server; never had a pending phase.
    Delivered,
}

/// One chat message as held locally.
///
/// `client_id` is the local handle for every row; for incoming messages it
/// is generated at append time and never travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Local identity of this row.
    pub client_id: ClientMessageId,
    /// Server-assigned id, recorded on confirmation or delivery.
    pub server_id: Option<ServerMessageId>,
    /// The conversation partner (recipient for outgoing, sender for incoming).
    pub peer: UserId,
    /// Outgoing or incoming.
    pub direction: Direction,
    /// Message body.
    pub body: String,
    /// When the message was created or received.
    pub sent_at: Timestamp,
    /// Current delivery status.
    pub status: DeliveryStatus,
}

struct Inner {
    users: Vec<User>,
    messages: Vec<Message>,
    selected: Option<UserId>,
}

/// Shared, lock-protected chat state. Constructed once per session and
/// shared via `Arc`.
pub struct ChatState {
    inner: RwLock<Inner>,
}

impl Default for ChatState {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatState {
    /// Create empty state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                users: Vec::new(),
                messages: Vec::new(),
                selected: None,
            }),
        }
    }

    // -- snapshot readers ---------------------------------------------------

    /// Snapshot of the roster.
    #[must_use]
    pub fn roster(&self) -> Vec<User> {
        self.inner.read().users.clone()
    }

    /// Snapshot of one roster entry.
    #[must_use]
    pub fn user(&self, id: &UserId) -> Option<User> {
        self.inner.read().users.iter().find(|u| &u.id == id).cloned()
    }

    /// Snapshot of all messages exchanged with `peer`, in arrival order.
    #[must_use]
    pub fn conversation(&self, peer: &UserId) -> Vec<Message> {
        self.inner
            .read()
            .messages
            .iter()
            .filter(|m| &m.peer == peer)
            .cloned()
            .collect()
    }

    /// Snapshot of one message by its local handle.
    #[must_use]
    pub fn message(&self, client_id: ClientMessageId) -> Option<Message> {
        self.inner
            .read()
            .messages
            .iter()
            .find(|m| m.client_id == client_id)
            .cloned()
    }

    /// The currently viewed conversation, if any.
    #[must_use]
    pub fn selected(&self) -> Option<UserId> {
        self.inner.read().selected.clone()
    }

    /// Sum of unread counters across the roster.
    #[must_use]
    pub fn unread_total(&self) -> u32 {
        self.inner.read().users.iter().map(|u| u.unread).sum()
    }

    // -- mutators (session / reconciler only) -------------------------------

    /// Replace the roster wholesale, as seeded from the server. The selected
    /// conversation's counter stays pinned at zero regardless of the seeded
    /// value.
    pub(crate) fn replace_roster(&self, users: Vec<User>) {
        let mut inner = self.inner.write();
        inner.users = users;
        if let Some(selected) = inner.selected.clone() {
            pin_zero(&mut inner, &selected);
        }
    }

    /// Append a message.
    pub(crate) fn append_message(&self, message: Message) {
        self.inner.write().messages.push(message);
    }

    /// Replace the stored conversation with `peer` by fetched history.
    /// Messages with other peers are untouched, and so are unresolved
    /// optimistic rows (`pending`/`failed`) — a confirmation arriving after
    /// a reseed must still find its pending entry.
    pub(crate) fn set_conversation(&self, peer: &UserId, history: Vec<Message>) {
        let mut inner = self.inner.write();
        inner.messages.retain(|m| {
            &m.peer != peer
                || matches!(m.status, DeliveryStatus::Pending | DeliveryStatus::Failed)
        });
        inner.messages.extend(history);
    }

    /// Transition a pending message to `confirmed`, recording the server id.
    /// Returns `false` when no matching pending entry exists (duplicate or
    /// late confirmation) — the caller logs and discards.
    pub(crate) fn resolve_pending(
        &self,
        client_id: ClientMessageId,
        server_id: Option<ServerMessageId>,
    ) -> bool {
        let mut inner = self.inner.write();
        match inner
            .messages
            .iter_mut()
            .find(|m| m.client_id == client_id && m.status == DeliveryStatus::Pending)
        {
            Some(message) => {
                message.status = DeliveryStatus::Confirmed;
                message.server_id = server_id;
                true
            }
            None => false,
        }
    }

    /// Transition a pending message to `failed`. Returns `false` when the
    /// message is absent or already resolved.
    pub(crate) fn fail_message(&self, client_id: ClientMessageId) -> bool {
        let mut inner = self.inner.write();
        match inner
            .messages
            .iter_mut()
            .find(|m| m.client_id == client_id && m.status == DeliveryStatus::Pending)
        {
            Some(message) => {
                message.status = DeliveryStatus::Failed;
                true
            }
            None => false,
        }
    }

    /// Overwrite a user's unread counter. The selected conversation is
    /// exempt: local "currently viewing" truth beats the server value.
    pub(crate) fn set_unread(&self, peer: &UserId, count: u32) {
        let mut inner = self.inner.write();
        if inner.selected.as_ref() == Some(peer) {
            pin_zero(&mut inner, peer);
            return;
        }
        if let Some(user) = inner.users.iter_mut().find(|u| &u.id == peer) {
            user.unread = count;
        }
    }

    /// Apply the unread rule for one inbound message from `peer`: pinned to
    /// zero while selected, incremented by one otherwise. Returns the
    /// resulting counter when the peer is on the roster.
    pub(crate) fn bump_unread(&self, peer: &UserId) -> Option<u32> {
        let mut inner = self.inner.write();
        let selected = inner.selected.as_ref() == Some(peer);
        let user = inner.users.iter_mut().find(|u| &u.id == peer)?;
        if selected {
            user.unread = 0;
        } else {
            user.unread = user.unread.saturating_add(1);
        }
        Some(user.unread)
    }

    /// Replace every roster member's presence by membership in the online
    /// set.
    pub(crate) fn apply_online_set(&self, online: &[UserId]) {
        let mut inner = self.inner.write();
        for user in &mut inner.users {
            user.presence = if online.contains(&user.id) {
                Presence::Online
            } else {
                Presence::Offline
            };
        }
    }

    /// Mark a conversation as currently viewed (or clear the selection).
    /// Selecting pins that peer's unread counter to zero.
    pub(crate) fn select(&self, peer: Option<UserId>) {
        let mut inner = self.inner.write();
        inner.selected = peer.clone();
        if let Some(peer) = peer {
            pin_zero(&mut inner, &peer);
        }
    }
}

fn pin_zero(inner: &mut Inner, peer: &UserId) {
    if let Some(user) = inner.users.iter_mut().find(|u| &u.id == peer) {
        user.unread = 0;
    }
}
