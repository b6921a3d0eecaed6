//! Durable record of a not-yet-delivered outgoing message.

use serde::{Deserialize, Serialize};

use crate::message::{ClientId, ConversationId, Message, MessageId, MessageStatus, SenderId, Timestamp};
use crate::record::OptimisticMessage;

/// One row of the Offline Queue.
///
/// Mirrors the outgoing message plus retry bookkeeping. Deleted on
/// confirmed delivery or when the entry is abandoned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Temporary message id (primary key).
    pub id: MessageId,
    /// Conversation the message belongs to.
    pub conversation_id: ConversationId,
    /// Local author.
    pub sender_id: SenderId,
    /// Text content.
    pub content: String,
    /// Optional attachment reference.
    pub attachment_ref: Option<String>,
    /// Original send time; drain order key.
    pub timestamp: Timestamp,
    /// Stable client identity sent with the message.
    pub temp_id: ClientId,
    /// Failed automatic attempts so far.
    pub retry_count: u32,
    /// Time of the last failed attempt.
    pub last_retry_at: Option<Timestamp>,
    /// Reason recorded for the last failure.
    pub error: Option<String>,
    /// When the entry was enqueued.
    pub created_at: Timestamp,
}

impl QueueEntry {
    /// Builds a fresh entry (zero retries) for an optimistic message.
    #[must_use]
    pub fn from_optimistic(message: &OptimisticMessage, created_at: Timestamp) -> Self {
        let m = message.message();
        Self {
            id: m.id.clone(),
            conversation_id: m.conversation_id.clone(),
            sender_id: m.sender_id.clone(),
            content: m.content.clone(),
            attachment_ref: m.attachment_ref.clone(),
            timestamp: m.timestamp,
            temp_id: message.client_id(),
            retry_count: 0,
            last_retry_at: None,
            error: None,
            created_at,
        }
    }

    /// The message handed to the Remote Store for this entry.
    #[must_use]
    pub fn to_outgoing(&self) -> Message {
        Message {
            id: self.id.clone(),
            conversation_id: self.conversation_id.clone(),
            sender_id: self.sender_id.clone(),
            content: self.content.clone(),
            attachment_ref: self.attachment_ref.clone(),
            timestamp: self.timestamp,
            status: MessageStatus::Sending,
            detected_language: None,
            retry_count: self.retry_count,
            last_retry_at: self.last_retry_at,
            error_reason: self.error.clone(),
            client_id: Some(self.temp_id),
        }
    }
}
