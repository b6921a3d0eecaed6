//! Lifecycle variants of a message and the conversions between them.
//!
//! A message moves through four shapes:
//!
//! ```text
//! Draft ──into_optimistic──> OptimisticMessage ──to_persisted──> Message (Persisted)
//!                                                                  ^
//! RemoteMessage ─────────────────into_persisted────────────────────┘
//! ```
//!
//! [`MessageRecord`] is the sum of all four and is what the merged
//! conversation view is made of.

use serde::{Deserialize, Serialize};

use crate::message::{
    ClientId, ConversationId, Message, MessageId, MessageStatus, SenderId, Timestamp,
    ValidationError, validate_content,
};

/// A message being composed, before it has an id or any delivery state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Draft {
    /// Conversation the message will be sent to.
    pub conversation_id: ConversationId,
    /// Local author.
    pub sender_id: SenderId,
    /// Text content.
    pub content: String,
    /// Optional uploaded attachment reference.
    pub attachment_ref: Option<String>,
    /// When the user hit send.
    pub created_at: Timestamp,
}

impl Draft {
    /// Validates the draft for sending.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] if the draft is empty or too large.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_content(&self.content, self.attachment_ref.as_deref())
    }

    /// Assigns a fresh client identity and temporary id.
    ///
    /// The result starts in [`MessageStatus::Composing`]; the caller moves
    /// it to `Sending` or `Queued` depending on connectivity.
    #[must_use]
    pub fn into_optimistic(self) -> OptimisticMessage {
        let client_id = ClientId::new();
        OptimisticMessage {
            client_id,
            confirmed_id: None,
            message: Message {
                id: MessageId::temporary(&client_id),
                conversation_id: self.conversation_id,
                sender_id: self.sender_id,
                content: self.content,
                attachment_ref: self.attachment_ref,
                timestamp: self.created_at,
                status: MessageStatus::Composing,
                detected_language: None,
                retry_count: 0,
                last_retry_at: None,
                error_reason: None,
                client_id: Some(client_id),
            },
        }
    }
}

/// A locally authored message shown before the Remote Store confirms it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimisticMessage {
    client_id: ClientId,
    /// Server id learned from a direct send acknowledgment, if any.
    confirmed_id: Option<MessageId>,
    message: Message,
}

impl OptimisticMessage {
    /// Rebuilds an optimistic entry from a locally persisted row.
    ///
    /// Returns `None` unless the row has a temporary id and a client id.
    #[must_use]
    pub fn from_persisted(message: Message) -> Option<Self> {
        if !message.id.is_temporary() {
            return None;
        }
        let client_id = message.client_id?;
        Some(Self {
            client_id,
            confirmed_id: None,
            message,
        })
    }

    /// Temporary id of this message.
    #[must_use]
    pub const fn id(&self) -> &MessageId {
        &self.message.id
    }

    /// Stable client identity.
    #[must_use]
    pub const fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Server id, once a direct acknowledgment has been seen.
    #[must_use]
    pub const fn confirmed_id(&self) -> Option<&MessageId> {
        self.confirmed_id.as_ref()
    }

    /// The underlying message.
    #[must_use]
    pub const fn message(&self) -> &Message {
        &self.message
    }

    /// Current delivery status.
    #[must_use]
    pub const fn status(&self) -> MessageStatus {
        self.message.status
    }

    /// Moves the message to a new status.
    pub const fn set_status(&mut self, status: MessageStatus) {
        self.message.status = status;
    }

    /// Marks the message failed with a reason.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.message.status = MessageStatus::Failed;
        self.message.error_reason = Some(reason.into());
    }

    /// Records the acknowledgment of a direct send.
    ///
    /// The entry stays visible (as `sent`) until a remote snapshot
    /// containing the confirmed record is reconciled.
    pub fn confirm(&mut self, remote_id: MessageId) {
        self.confirmed_id = Some(remote_id);
        self.message.status = MessageStatus::Sent;
        self.message.error_reason = None;
    }

    /// Copies retry bookkeeping onto the visible message.
    pub fn record_attempt(&mut self, retry_count: u32, at: Timestamp, reason: Option<String>) {
        self.message.retry_count = retry_count;
        self.message.last_retry_at = Some(at);
        self.message.error_reason = reason;
    }

    /// Puts the message back in the queue with a fresh retry budget.
    pub fn requeue(&mut self) {
        self.message.status = MessageStatus::Queued;
        self.message.retry_count = 0;
        self.message.last_retry_at = None;
        self.message.error_reason = None;
    }

    /// The row written to the Persistent Local Store for this message.
    #[must_use]
    pub fn to_persisted(&self) -> Message {
        self.message.clone()
    }
}

/// A record observed in a Remote Store snapshot or send acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMessage(Message);

impl RemoteMessage {
    /// Wraps a record received from the Remote Store.
    #[must_use]
    pub const fn new(message: Message) -> Self {
        Self(message)
    }

    /// Server-assigned id.
    #[must_use]
    pub const fn id(&self) -> &MessageId {
        &self.0.id
    }

    /// The underlying message.
    #[must_use]
    pub const fn message(&self) -> &Message {
        &self.0
    }

    /// The row written to the Persistent Local Store for this record.
    #[must_use]
    pub fn into_persisted(self) -> Message {
        self.0
    }
}

/// Any lifecycle shape of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageRecord {
    /// Not yet sent.
    Draft(Draft),
    /// Locally authored, awaiting remote confirmation.
    Optimistic(OptimisticMessage),
    /// Read back from the Persistent Local Store.
    Persisted(Message),
    /// Authoritative record from the Remote Store.
    Remote(RemoteMessage),
}

impl MessageRecord {
    /// Message id; drafts have none.
    #[must_use]
    pub const fn id(&self) -> Option<&MessageId> {
        match self {
            Self::Draft(_) => None,
            Self::Optimistic(m) => Some(m.id()),
            Self::Persisted(m) => Some(&m.id),
            Self::Remote(m) => Some(m.id()),
        }
    }

    /// Authoring time (or remote timestamp for remote records).
    #[must_use]
    pub const fn timestamp(&self) -> Timestamp {
        match self {
            Self::Draft(d) => d.created_at,
            Self::Optimistic(m) => m.message.timestamp,
            Self::Persisted(m) => m.timestamp,
            Self::Remote(m) => m.0.timestamp,
        }
    }

    /// Delivery status.
    #[must_use]
    pub const fn status(&self) -> MessageStatus {
        match self {
            Self::Draft(_) => MessageStatus::Composing,
            Self::Optimistic(m) => m.message.status,
            Self::Persisted(m) => m.status,
            Self::Remote(m) => m.0.status,
        }
    }

    /// Author.
    #[must_use]
    pub const fn sender_id(&self) -> &SenderId {
        match self {
            Self::Draft(d) => &d.sender_id,
            Self::Optimistic(m) => &m.message.sender_id,
            Self::Persisted(m) => &m.sender_id,
            Self::Remote(m) => &m.0.sender_id,
        }
    }

    /// Text content.
    #[must_use]
    pub fn content(&self) -> &str {
        match self {
            Self::Draft(d) => &d.content,
            Self::Optimistic(m) => &m.message.content,
            Self::Persisted(m) => &m.content,
            Self::Remote(m) => &m.0.content,
        }
    }

    /// Whether this entry is still awaiting remote confirmation.
    #[must_use]
    pub const fn is_optimistic(&self) -> bool {
        matches!(self, Self::Optimistic(_))
    }
}

impl From<Draft> for MessageRecord {
    fn from(draft: Draft) -> Self {
        Self::Draft(draft)
    }
}

impl From<OptimisticMessage> for MessageRecord {
    fn from(message: OptimisticMessage) -> Self {
        Self::Optimistic(message)
    }
}

impl From<RemoteMessage> for MessageRecord {
    fn from(message: RemoteMessage) -> Self {
        Self::Remote(message)
    }
}

impl From<Message> for MessageRecord {
    fn from(message: Message) -> Self {
        Self::Persisted(message)
    }
}
