//! HTTP collaborator for seeding chat state.
//!
//! The persistent connection only carries live traffic; everything that
//! happened before the session opened comes from the server's REST API:
//! the roster with per-conversation unread counts at session start, and
//! paginated conversation history when a conversation is selected. This
//! module is a thin boundary wrapper — it has no invariants of its own and
//! seeding failures are survivable (the session logs and continues).

use reqwest::StatusCode;
use serde::Deserialize;
use url::Url;

use parlor_proto::ids::{ClientMessageId, ServerMessageId, Timestamp, UserId};

use crate::state::{DeliveryStatus, Direction, Message, Presence, User};
use crate::transport::AuthToken;

/// Errors from the history API.
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    /// The request could not be performed or the body could not be decoded.
    #[error("history request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("history request rejected: HTTP {status}")]
    Status {
        /// The HTTP status code.
        status: StatusCode,
    },

    /// The configured base URL cannot take path segments.
    #[error("history api base url cannot be extended with a path")]
    BaseUrl,
}

/// One roster entry as returned by `/users/with-unread-count/{me}`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RosterEntryDto {
    user: UserDto,
    #[serde(default)]
    unread_count: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserDto {
    id: UserId,
    username: String,
    #[serde(default)]
    nickname: Option<String>,
    #[serde(default)]
    is_online: bool,
}

/// One past message as returned by `/messages/between/{me}/{peer}`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryMessageDto {
    #[serde(default)]
    id: Option<ServerMessageId>,
    sender_id: UserId,
    receiver_id: UserId,
    content: String,
    #[serde(default)]
    sent_time: Option<Timestamp>,
}

/// Client for the server's history/roster REST API.
pub struct HistoryClient {
    http: reqwest::Client,
    base: Url,
    token: AuthToken,
}

impl HistoryClient {
    /// Create a client for the given API base URL. The bearer credential is
    /// attached to every request.
    #[must_use]
    pub fn new(base: Url, token: AuthToken) -> Self {
        Self {
            http: reqwest::Client::new(),
            base,
            token,
        }
    }

    /// Fetch the roster with per-conversation unread counts, mapped into
    /// local [`User`] records.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError`] on network, status, or decode failure.
    pub async fn roster_with_unread(&self, me: &UserId) -> Result<Vec<User>, HistoryError> {
        let url = self.endpoint(&["users", "with-unread-count", me.as_str()])?;
        let entries: Vec<RosterEntryDto> = self.get_json(url).await?;

        Ok(entries
            .into_iter()
            .map(|entry| {
                let display_name = entry
                    .user
                    .nickname
                    .unwrap_or_else(|| entry.user.username.clone());
                User {
                    id: entry.user.id,
                    display_name,
                    presence: if entry.user.is_online {
                        Presence::Online
                    } else {
                        Presence::Offline
                    },
                    unread: entry.unread_count,
                }
            })
            .collect())
    }

    /// Fetch the ordered message history between the local user and `peer`,
    /// mapped into local [`Message`] records (outgoing rows are `confirmed`,
    /// incoming rows `delivered` — history never contains pending sends).
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError`] on network, status, or decode failure.
    pub async fn conversation(
        &self,
        me: &UserId,
        peer: &UserId,
    ) -> Result<Vec<Message>, HistoryError> {
        let url = self.endpoint(&["messages", "between", me.as_str(), peer.as_str()])?;
        let messages: Vec<HistoryMessageDto> = self.get_json(url).await?;

        Ok(messages
            .into_iter()
            .map(|dto| {
                let outgoing = dto.sender_id == *me;
                Message {
                    client_id: ClientMessageId::new(),
                    server_id: dto.id,
                    peer: if outgoing { dto.receiver_id } else { dto.sender_id },
                    direction: if outgoing {
                        Direction::Outgoing
                    } else {
                        Direction::Incoming
                    },
                    body: dto.content,
                    sent_at: dto.sent_time.unwrap_or_else(Timestamp::now),
                    status: if outgoing {
                        DeliveryStatus::Confirmed
                    } else {
                        DeliveryStatus::Delivered
                    },
                }
            })
            .collect())
    }

    /// Refresh the unread count for messages `sender` sent to `receiver`.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError`] on network, status, or decode failure.
    pub async fn unread_between(
        &self,
        sender: &UserId,
        receiver: &UserId,
    ) -> Result<u32, HistoryError> {
        let url = self.endpoint(&[
            "messages",
            "unread",
            "count",
            sender.as_str(),
            receiver.as_str(),
        ])?;
        self.get_json(url).await
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: Url) -> Result<T, HistoryError> {
        let response = self
            .http
            .get(url)
            .bearer_auth(self.token.expose())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(HistoryError::Status { status });
        }
        Ok(response.json().await?)
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, HistoryError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| HistoryError::BaseUrl)?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}
