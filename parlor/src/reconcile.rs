//! Inbound frame reconciliation.
//!
//! [`Reconciler`] classifies every decoded frame and is the sole mutator of
//! message status transitions and unread counters. Frames are applied
//! strictly in arrival order by the single session driver task; nothing here
//! is concurrent.
//!
//! Confirmation matching: when a `message` frame's sender is the local
//! identity, it is the server echoing a message we sent. The frame's
//! `clientMessageId` correlates it back to the pending entry; a
//! confirmation with no matching pending message is a reconciliation miss —
//! expected under duplicate delivery, logged and discarded, never an error.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use parlor_proto::frame::Frame;
use parlor_proto::ids::{ClientMessageId, ServerMessageId, Timestamp, UserId};

use crate::state::{ChatState, DeliveryStatus, Direction, Message};

/// Notification produced by applying a frame, for the embedding view to
/// consume. State mutations have already happened by the time one of these
/// is emitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// A peer message was appended to the state.
    MessageReceived {
        /// Who sent it.
        from: UserId,
        /// Local handle of the appended row.
        client_id: ClientMessageId,
    },
    /// A previously pending message was confirmed by the server.
    MessageConfirmed {
        /// The confirmed message.
        client_id: ClientMessageId,
        /// Server-assigned id, when the server provided one.
        server_id: Option<ServerMessageId>,
    },
    /// A peer has read our messages up to the given point in time. No chat
    /// state changes; this is purely for the view layer.
    ReadReceipt {
        /// The peer who read them.
        reader: UserId,
        /// Read-up-to watermark.
        up_to: Timestamp,
    },
    /// The server reported an error frame.
    ServerError {
        /// Human-readable description.
        message: String,
        /// Machine-readable code, when provided.
        code: Option<String>,
    },
}

/// Bookkeeping for one optimistically sent message.
struct PendingEntry {
    /// When the entry resolved (confirmed or failed); `None` while pending.
    resolved_at: Option<Instant>,
}

/// Applies inbound frames to [`ChatState`] and tracks the reconciliation
/// table of in-flight sends.
///
/// Resolved entries are kept for a retention window (so late duplicates can
/// be recognized cheaply in diagnostics) and then evicted to bound growth.
pub struct Reconciler {
    local_id: UserId,
    state: Arc<ChatState>,
    pending: HashMap<ClientMessageId, PendingEntry>,
    retention: Duration,
}

impl Reconciler {
    /// Create a reconciler for the given local identity.
    pub fn new(local_id: UserId, state: Arc<ChatState>, retention: Duration) -> Self {
        Self {
            local_id,
            state,
            pending: HashMap::new(),
            retention,
        }
    }

    /// Register a freshly sent message in the reconciliation table.
    pub fn track_pending(&mut self, client_id: ClientMessageId) {
        self.pending.insert(client_id, PendingEntry { resolved_at: None });
    }

    /// Mark a tracked message as resolved without confirmation (send
    /// failure). The entry ages out after the retention window.
    pub fn mark_resolved(&mut self, client_id: ClientMessageId) {
        if let Some(entry) = self.pending.get_mut(&client_id) {
            entry.resolved_at = Some(Instant::now());
        }
    }

    /// Number of tracked entries, resolved or not. Test hook.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.pending.len()
    }

    /// Apply one inbound frame in arrival order.
    ///
    /// Returns a [`Notice`] when the frame warrants notifying the view.
    pub fn apply(&mut self, frame: Frame) -> Option<Notice> {
        self.sweep();
        let kind = frame.kind();

        match frame {
            Frame::Message {
                id,
                client_message_id,
                sender_id,
                receiver_id,
                content,
                sent_time,
            } => {
                if sender_id == self.local_id {
                    self.apply_confirmation(client_message_id, id)
                } else {
                    self.apply_delivery(id, sender_id, &receiver_id, content, sent_time)
                }
            }
            Frame::HeartbeatAck { timestamp } => {
                tracing::trace!(%timestamp, "heartbeat ack");
                None
            }
            Frame::UnreadCount {
                sender_id,
                unread_count,
            } => {
                self.state.set_unread(&sender_id, unread_count);
                None
            }
            Frame::OnlineUsers { content } => {
                self.state.apply_online_set(&content);
                None
            }
            Frame::ReadReceipt {
                reader_id,
                timestamp,
            } => Some(Notice::ReadReceipt {
                reader: reader_id,
                up_to: timestamp,
            }),
            Frame::Error {
                message,
                error_code,
            } => {
                tracing::warn!(code = ?error_code, %message, "server error frame");
                Some(Notice::ServerError {
                    message,
                    code: error_code,
                })
            }
            // Outbound-only frame kinds arriving inbound: tolerated, ignored.
            Frame::Heartbeat { .. } | Frame::Join { .. } | Frame::MarkAsRead { .. } => {
                tracing::debug!(kind, "ignoring unexpected inbound frame");
                None
            }
        }
    }

    /// The server echoed one of our own messages: confirm the pending entry.
    fn apply_confirmation(
        &mut self,
        client_message_id: Option<ClientMessageId>,
        server_id: Option<ServerMessageId>,
    ) -> Option<Notice> {
        let Some(client_id) = client_message_id else {
            tracing::debug!("confirmation frame without client message id, discarding");
            return None;
        };

        if self.state.resolve_pending(client_id, server_id) {
            self.mark_resolved(client_id);
            Some(Notice::MessageConfirmed {
                client_id,
                server_id,
            })
        } else {
            // Duplicate or late confirmation for an already resolved
            // message. Expected under at-least-once delivery.
            tracing::debug!(%client_id, "reconciliation miss, discarding");
            None
        }
    }

    /// A peer sent us a message: append it and apply the unread rule.
    fn apply_delivery(
        &mut self,
        server_id: Option<ServerMessageId>,
        sender_id: UserId,
        receiver_id: &UserId,
        content: String,
        sent_time: Option<Timestamp>,
    ) -> Option<Notice> {
        if receiver_id != &self.local_id {
            tracing::debug!(
                sender = %sender_id,
                receiver = %receiver_id,
                "message not addressed to us, ignoring"
            );
            return None;
        }

        let message = Message {
            client_id: ClientMessageId::new(),
            server_id,
            peer: sender_id.clone(),
            direction: Direction::Incoming,
            body: content,
            sent_at: sent_time.unwrap_or_else(Timestamp::now),
            status: DeliveryStatus::Delivered,
        };
        let client_id = message.client_id;
        self.state.append_message(message);

        // Selected conversation stays pinned at zero (the message is read
        // by virtue of being viewed); anyone else gains one unread.
        if self.state.bump_unread(&sender_id).is_none() {
            tracing::debug!(sender = %sender_id, "sender not on roster, counter unchanged");
        }

        Some(Notice::MessageReceived {
            from: sender_id,
            client_id,
        })
    }

    /// Evict resolved entries older than the retention window.
    fn sweep(&mut self) {
        let retention = self.retention;
        self.pending.retain(|_, entry| {
            entry
                .resolved_at
                .is_none_or(|resolved| resolved.elapsed() < retention)
        });
    }
}
