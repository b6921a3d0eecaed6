//! Core message types shared by every layer of the sync engine.
//!
//! Identifiers, timestamps, the delivery status lifecycle and the
//! [`Message`] record itself. The lifecycle-specific wrappers (draft,
//! optimistic, remote) live in [`crate::record`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum allowed message content size in bytes (64 KB).
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Prefix carried by every client-generated temporary message id.
pub const TEMP_ID_PREFIX: &str = "tmp-";

/// Identifier of a message.
///
/// Server-assigned ids are opaque strings chosen by the Remote Store.
/// Locally authored messages carry a temporary id derived from their
/// [`ClientId`] until the remote record replaces them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Wraps an id assigned by the Remote Store.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Builds the temporary id for a locally authored message.
    #[must_use]
    pub fn temporary(client_id: &ClientId) -> Self {
        Self(format!("{TEMP_ID_PREFIX}{client_id}"))
    }

    /// Whether this id was generated locally and has no server counterpart.
    #[must_use]
    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMP_ID_PREFIX)
    }

    /// Returns the string form of this id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable client-generated identity of a locally authored message.
///
/// Sent alongside the message so the Remote Store can keep it on the
/// record; reconciliation matches on it before falling back to the
/// sender/content/time heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(Uuid);

impl ClientId {
    /// Creates a new time-ordered client id (UUID v7).
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates a `ClientId` from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the inner UUID value.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Parses the hyphenated UUID form produced by `Display`.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a conversation (direct thread or group).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationId(String);

impl ConversationId {
    /// Wraps a conversation id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string form of this id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies the user who authored a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SenderId(String);

impl SenderId {
    /// Wraps a user id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string form of this id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SenderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Millisecond-precision UTC timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a timestamp for the current instant.
    #[must_use]
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Creates a timestamp from milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    /// Absolute distance between two timestamps in milliseconds.
    #[must_use]
    pub const fn abs_diff(&self, other: Self) -> u64 {
        self.0.abs_diff(other.0)
    }

    /// Milliseconds elapsed from `earlier` to `self`, zero if `earlier` is later.
    #[must_use]
    pub const fn millis_since(&self, earlier: Self) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Delivery lifecycle of a message.
///
/// ```text
/// composing ─┬─> sending ──> sent ──> delivered ──> read
///            └─> queued ──> sending
/// sending ──(network failure)──> queued
/// sending ──(rejection)──> failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Authored locally, not yet handed to any delivery path.
    Composing,
    /// Waiting in the Offline Queue for a sync attempt.
    Queued,
    /// A delivery attempt is in flight.
    Sending,
    /// Acknowledged by the Remote Store.
    Sent,
    /// Delivered to the recipient's device (remote-driven).
    Delivered,
    /// Read by the recipient (remote-driven).
    Read,
    /// Terminal failure; only an explicit user retry revives it.
    Failed,
}

impl MessageStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [Self; 7] = [
        Self::Composing,
        Self::Queued,
        Self::Sending,
        Self::Sent,
        Self::Delivered,
        Self::Read,
        Self::Failed,
    ];

    /// Lowercase name used in storage and logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Composing => "composing",
            Self::Queued => "queued",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Failed => "failed",
        }
    }

    /// Whether the Remote Store has acknowledged the message.
    #[must_use]
    pub const fn is_confirmed(&self) -> bool {
        matches!(self, Self::Sent | Self::Delivered | Self::Read)
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown status name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown message status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for MessageStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

/// A message as stored locally and exchanged with the Remote Store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Server-assigned id, or a temporary id for unconfirmed local messages.
    pub id: MessageId,
    /// Conversation the message belongs to.
    pub conversation_id: ConversationId,
    /// Author of the message.
    pub sender_id: SenderId,
    /// Text content.
    pub content: String,
    /// Opaque reference to an uploaded attachment, if any.
    pub attachment_ref: Option<String>,
    /// Authoring time.
    pub timestamp: Timestamp,
    /// Current delivery status.
    pub status: MessageStatus,
    /// Language tag filled in by an external detector.
    pub detected_language: Option<String>,
    /// Number of failed automatic delivery attempts.
    pub retry_count: u32,
    /// When the last failed attempt happened.
    pub last_retry_at: Option<Timestamp>,
    /// Reason recorded for the last failure.
    pub error_reason: Option<String>,
    /// Stable client identity; absent on legacy remote records.
    pub client_id: Option<ClientId>,
}

/// Error returned when a message fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Neither text content nor an attachment was supplied.
    #[error("message content is empty")]
    Empty,
    /// Message content exceeds the maximum allowed size.
    #[error("message too large ({size} bytes, max {max} bytes)")]
    TooLarge {
        /// Actual size of the content in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },
}

/// Validates outgoing content before it enters any delivery path.
///
/// Whitespace-only text without an attachment counts as empty.
///
/// # Errors
///
/// Returns [`ValidationError::Empty`] if there is nothing to send, or
/// [`ValidationError::TooLarge`] if the text exceeds [`MAX_MESSAGE_SIZE`].
pub fn validate_content(content: &str, attachment_ref: Option<&str>) -> Result<(), ValidationError> {
    let has_attachment = attachment_ref.is_some_and(|a| !a.trim().is_empty());
    if content.trim().is_empty() && !has_attachment {
        return Err(ValidationError::Empty);
    }
    let size = content.len();
    if size > MAX_MESSAGE_SIZE {
        return Err(ValidationError::TooLarge {
            size,
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(())
}
