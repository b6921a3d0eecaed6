//! In-memory implementation of [`MessageStore`] and [`OfflineQueue`].
//!
//! Same ordering contracts as the SQLite backend, without persistence.
//! Used by unit tests and the `demo` command.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use msgsync_proto::message::{ConversationId, Message, MessageId, MessageStatus, Timestamp};
use msgsync_proto::queue::QueueEntry;
use msgsync_proto::record::OptimisticMessage;

use super::{MessageStore, OfflineQueue, StorageError};

#[derive(Default)]
struct Tables {
    messages: HashMap<MessageId, Message>,
    /// Queue rows with their insertion sequence, used as a final tiebreak.
    queue: HashMap<MessageId, (u64, QueueEntry)>,
    next_seq: u64,
}

/// Non-persistent storage backend. Clones share the same tables.
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    tables: Arc<Mutex<Tables>>,
}

impl InMemoryStorage {
    /// Create a new, empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessageStore for InMemoryStorage {
    async fn upsert(&self, message: &Message) -> Result<(), StorageError> {
        self.tables
            .lock()
            .await
            .messages
            .insert(message.id.clone(), message.clone());
        Ok(())
    }

    async fn get(&self, id: &MessageId) -> Result<Option<Message>, StorageError> {
        Ok(self.tables.lock().await.messages.get(id).cloned())
    }

    async fn list(
        &self,
        conversation: &ConversationId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>, StorageError> {
        let mut results: Vec<Message> = self
            .tables
            .lock()
            .await
            .messages
            .values()
            .filter(|m| m.conversation_id == *conversation)
            .cloned()
            .collect();

        results.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.id.cmp(&a.id)));
        Ok(results.into_iter().skip(offset).take(limit).collect())
    }

    async fn update_status(&self, id: &MessageId, status: MessageStatus) -> Result<(), StorageError> {
        let mut tables = self.tables.lock().await;
        match tables.messages.get_mut(id) {
            Some(message) => {
                message.status = status;
                Ok(())
            }
            None => Err(StorageError::NotFound(format!("message {id}"))),
        }
    }

    async fn delete(&self, id: &MessageId) -> Result<(), StorageError> {
        self.tables.lock().await.messages.remove(id);
        Ok(())
    }

    async fn list_unconfirmed(&self) -> Result<Vec<Message>, StorageError> {
        let mut results: Vec<Message> = self
            .tables
            .lock()
            .await
            .messages
            .values()
            .filter(|m| m.id.is_temporary())
            .cloned()
            .collect();
        results.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(results)
    }
}

impl OfflineQueue for InMemoryStorage {
    async fn enqueue(
        &self,
        message: &OptimisticMessage,
        now: Timestamp,
    ) -> Result<QueueEntry, StorageError> {
        let entry = QueueEntry::from_optimistic(message, now);
        let mut tables = self.tables.lock().await;
        let seq = tables.next_seq;
        tables.next_seq += 1;
        tables.queue.insert(entry.id.clone(), (seq, entry.clone()));
        Ok(entry)
    }

    async fn entry(&self, id: &MessageId) -> Result<Option<QueueEntry>, StorageError> {
        Ok(self
            .tables
            .lock()
            .await
            .queue
            .get(id)
            .map(|(_, entry)| entry.clone()))
    }

    async fn dequeue_all(&self) -> Result<Vec<QueueEntry>, StorageError> {
        let mut rows: Vec<(u64, QueueEntry)> =
            self.tables.lock().await.queue.values().cloned().collect();
        rows.sort_by(|(seq_a, a), (seq_b, b)| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| seq_a.cmp(seq_b))
        });
        Ok(rows.into_iter().map(|(_, entry)| entry).collect())
    }

    async fn remove(&self, id: &MessageId) -> Result<bool, StorageError> {
        Ok(self.tables.lock().await.queue.remove(id).is_some())
    }

    async fn record_failure(
        &self,
        id: &MessageId,
        reason: &str,
        at: Timestamp,
    ) -> Result<QueueEntry, StorageError> {
        let mut tables = self.tables.lock().await;
        let (_, entry) = tables
            .queue
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("queue entry {id}")))?;
        entry.retry_count += 1;
        entry.last_retry_at = Some(at);
        entry.error = Some(reason.to_string());
        Ok(entry.clone())
    }

    async fn len(&self) -> Result<usize, StorageError> {
        Ok(self.tables.lock().await.queue.len())
    }
}
