//! Durable on-device storage: the Persistent Local Store and the Offline Queue.
//!
//! Defines the [`MessageStore`] and [`OfflineQueue`] traits plus two
//! backends that implement both:
//!
//! - [`sqlite::SqliteStorage`] — file-backed, survives process restarts
//! - [`memory::InMemoryStorage`] — in-process, for tests and demos
//!
//! Storage failures are fatal to the calling operation: they are surfaced
//! as [`StorageError`] and never retried inside this layer.

pub mod memory;
pub mod schema;
pub mod sqlite;

use std::future::Future;

use msgsync_proto::message::{ConversationId, Message, MessageId, MessageStatus, Timestamp};
use msgsync_proto::queue::QueueEntry;
use msgsync_proto::record::OptimisticMessage;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The underlying storage cannot be opened or is unavailable.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// A SQL statement failed.
    #[error("query failed: {0}")]
    Query(#[from] rusqlite::Error),

    /// A stored row could not be decoded.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// The requested item was not found.
    #[error("not found: {0}")]
    NotFound(String),
}

/// The Persistent Local Store: durable table of messages keyed by id.
pub trait MessageStore: Send + Sync {
    /// Inserts or replaces a message by id. Applying the same payload twice
    /// leaves the store unchanged.
    fn upsert(&self, message: &Message) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Fetches one message by id.
    fn get(
        &self,
        id: &MessageId,
    ) -> impl Future<Output = Result<Option<Message>, StorageError>> + Send;

    /// Lists messages of a conversation, most recent first.
    fn list(
        &self,
        conversation: &ConversationId,
        limit: usize,
        offset: usize,
    ) -> impl Future<Output = Result<Vec<Message>, StorageError>> + Send;

    /// Updates only the status of an existing message.
    ///
    /// Returns [`StorageError::NotFound`] if no row has this id.
    fn update_status(
        &self,
        id: &MessageId,
        status: MessageStatus,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Deletes a message. Deleting a missing id is not an error.
    fn delete(&self, id: &MessageId) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Lists every locally authored message not yet replaced by its remote
    /// record (temporary ids), oldest first.
    fn list_unconfirmed(&self) -> impl Future<Output = Result<Vec<Message>, StorageError>> + Send;
}

/// The Offline Queue: durable table of not-yet-delivered messages.
///
/// FIFO is guaranteed within a conversation because [`dequeue_all`]
/// orders by original send timestamp; interleaving across conversations
/// is permitted.
///
/// [`dequeue_all`]: OfflineQueue::dequeue_all
pub trait OfflineQueue: Send + Sync {
    /// Persists a [`QueueEntry`] for the message with zero retries.
    ///
    /// Enqueuing an id that is already queued resets its retry bookkeeping.
    fn enqueue(
        &self,
        message: &OptimisticMessage,
        now: Timestamp,
    ) -> impl Future<Output = Result<QueueEntry, StorageError>> + Send;

    /// Fetches one entry by id.
    fn entry(
        &self,
        id: &MessageId,
    ) -> impl Future<Output = Result<Option<QueueEntry>, StorageError>> + Send;

    /// Returns all entries ordered ascending by original send timestamp.
    ///
    /// Entries are not removed; delivery confirmation does that.
    fn dequeue_all(&self) -> impl Future<Output = Result<Vec<QueueEntry>, StorageError>> + Send;

    /// Removes an entry. Returns whether a row was removed.
    fn remove(&self, id: &MessageId) -> impl Future<Output = Result<bool, StorageError>> + Send;

    /// Increments the retry count and stores the failure time and reason.
    ///
    /// Returns the updated entry, or [`StorageError::NotFound`].
    fn record_failure(
        &self,
        id: &MessageId,
        reason: &str,
        at: Timestamp,
    ) -> impl Future<Output = Result<QueueEntry, StorageError>> + Send;

    /// Number of queued entries.
    fn len(&self) -> impl Future<Output = Result<usize, StorageError>> + Send;
}
