//! Optimistic Buffer: locally authored messages awaiting remote confirmation.
//!
//! Entries are grouped per conversation in insertion order and indexed by
//! temporary id. The buffer is owned by exactly one [`SyncEngine`]; all
//! mutation happens on the engine task, so there is no interior locking.
//!
//! [`SyncEngine`]: crate::engine::SyncEngine

use std::collections::HashMap;

use msgsync_proto::message::{ConversationId, MessageId, MessageStatus, Timestamp};
use msgsync_proto::record::OptimisticMessage;

/// In-memory set of optimistic entries, per conversation.
#[derive(Debug, Default)]
pub struct OptimisticBuffer {
    conversations: HashMap<ConversationId, Vec<OptimisticMessage>>,
    index: HashMap<MessageId, ConversationId>,
}

impl OptimisticBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entry, replacing any entry with the same temporary id.
    pub fn insert(&mut self, message: OptimisticMessage) {
        let id = message.id().clone();
        let conversation = message.message().conversation_id.clone();
        if let Some(existing) = self.get_mut(&id) {
            *existing = message;
            return;
        }
        self.index.insert(id, conversation.clone());
        self.conversations
            .entry(conversation)
            .or_default()
            .push(message);
    }

    /// Looks up an entry by temporary id.
    #[must_use]
    pub fn get(&self, id: &MessageId) -> Option<&OptimisticMessage> {
        let conversation = self.index.get(id)?;
        self.conversations
            .get(conversation)?
            .iter()
            .find(|m| m.id() == id)
    }

    fn get_mut(&mut self, id: &MessageId) -> Option<&mut OptimisticMessage> {
        let conversation = self.index.get(id)?;
        self.conversations
            .get_mut(conversation)?
            .iter_mut()
            .find(|m| m.id() == id)
    }

    /// Entries of a conversation, in insertion order.
    #[must_use]
    pub fn entries(&self, conversation: &ConversationId) -> &[OptimisticMessage] {
        self.conversations
            .get(conversation)
            .map_or(&[], Vec::as_slice)
    }

    fn update(&mut self, id: &MessageId, f: impl FnOnce(&mut OptimisticMessage)) -> bool {
        let Some(message) = self.get_mut(id) else {
            return false;
        };
        f(message);
        true
    }

    /// Moves an entry to `status`. Returns `false` if the id is unknown.
    pub fn set_status(&mut self, id: &MessageId, status: MessageStatus) -> bool {
        self.update(id, |m| m.set_status(status))
    }

    /// Marks an entry failed. Returns `false` if the id is unknown.
    pub fn fail(&mut self, id: &MessageId, reason: &str) -> bool {
        self.update(id, |m| m.fail(reason))
    }

    /// Records a direct acknowledgment. Returns `false` if the id is unknown.
    pub fn confirm(&mut self, id: &MessageId, remote_id: MessageId) -> bool {
        self.update(id, |m| m.confirm(remote_id))
    }

    /// Copies retry bookkeeping onto an entry.
    pub fn record_attempt(
        &mut self,
        id: &MessageId,
        retry_count: u32,
        at: Timestamp,
        reason: Option<String>,
    ) -> bool {
        self.update(id, |m| m.record_attempt(retry_count, at, reason))
    }

    /// Removes the given entries, returning the ones that were present.
    pub fn retire(&mut self, ids: &[MessageId]) -> Vec<OptimisticMessage> {
        let mut retired = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(conversation) = self.index.remove(id) else {
                continue;
            };
            if let Some(entries) = self.conversations.get_mut(&conversation) {
                if let Some(pos) = entries.iter().position(|m| m.id() == id) {
                    retired.push(entries.remove(pos));
                }
                if entries.is_empty() {
                    self.conversations.remove(&conversation);
                }
            }
        }
        retired
    }

    /// Total number of entries across conversations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether the buffer holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}
