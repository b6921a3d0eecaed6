//! In-process Remote Store.
//!
//! Keeps one append-only log per conversation and pushes a full snapshot to
//! every subscriber after each change. Failure injection hooks let tests
//! simulate an unreachable store, slow calls, and permission rejections.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use msgsync_proto::message::{ConversationId, Message, MessageId, MessageStatus};
use msgsync_proto::record::RemoteMessage;

use crate::clock::{Clock, SystemClock};

use super::{RemoteError, RemoteStore, RemoteSubscription, Snapshot};

#[derive(Default)]
struct State {
    logs: HashMap<ConversationId, Vec<Message>>,
    subscribers: HashMap<ConversationId, Vec<(u64, mpsc::UnboundedSender<Snapshot>)>>,
    next_subscriber: u64,
    next_id: u64,
    unreachable: bool,
    transient_failures: u32,
    rejected: HashSet<ConversationId>,
    strip_client_ids: bool,
    latency: Option<Duration>,
    /// Every accepted send, in arrival order across conversations.
    arrivals: Vec<MessageId>,
}

/// Shared in-memory message log. Clones share state.
#[derive(Clone)]
pub struct InMemoryRemote {
    state: Arc<Mutex<State>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRemote {
    /// Creates an empty store stamping records with the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates an empty store stamping records with `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            clock,
        }
    }

    /// Makes every call fail with [`RemoteError::Unavailable`] while `false`.
    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().unreachable = !reachable;
    }

    /// Fails the next `count` sends with [`RemoteError::Unavailable`].
    pub fn fail_next_sends(&self, count: u32) {
        self.state.lock().transient_failures = count;
    }

    /// Rejects every send to `conversation` with [`RemoteError::Rejected`].
    pub fn reject_conversation(&self, conversation: &ConversationId) {
        self.state.lock().rejected.insert(conversation.clone());
    }

    /// Undoes [`reject_conversation`](Self::reject_conversation).
    pub fn allow_conversation(&self, conversation: &ConversationId) {
        self.state.lock().rejected.remove(conversation);
    }

    /// Drops client ids from stored records, as a legacy backend would.
    pub fn strip_client_ids(&self, strip: bool) {
        self.state.lock().strip_client_ids = strip;
    }

    /// Delays every send by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state.lock().latency = latency;
    }

    /// Appends a record authored elsewhere (another participant) verbatim.
    pub fn inject(&self, message: Message) {
        let mut state = self.state.lock();
        state
            .logs
            .entry(message.conversation_id.clone())
            .or_default()
            .push(message.clone());
        Self::broadcast(&mut state, &message.conversation_id);
    }

    /// Records of a conversation in arrival order.
    #[must_use]
    pub fn log(&self, conversation: &ConversationId) -> Vec<Message> {
        self.state
            .lock()
            .logs
            .get(conversation)
            .cloned()
            .unwrap_or_default()
    }

    /// Contents of accepted sends in arrival order across all conversations.
    #[must_use]
    pub fn arrival_order(&self) -> Vec<String> {
        let state = self.state.lock();
        state
            .arrivals
            .iter()
            .filter_map(|id| {
                state
                    .logs
                    .values()
                    .flatten()
                    .find(|m| &m.id == id)
                    .map(|m| m.content.clone())
            })
            .collect()
    }

    /// Number of live snapshot subscriptions for a conversation.
    #[must_use]
    pub fn subscriber_count(&self, conversation: &ConversationId) -> usize {
        self.state
            .lock()
            .subscribers
            .get(conversation)
            .map_or(0, Vec::len)
    }

    fn snapshot(state: &State, conversation: &ConversationId) -> Snapshot {
        let mut messages: Vec<Message> = state.logs.get(conversation).cloned().unwrap_or_default();
        messages.sort_by_key(|m| m.timestamp);
        Snapshot {
            conversation_id: conversation.clone(),
            messages: messages.into_iter().map(RemoteMessage::new).collect(),
        }
    }

    fn broadcast(state: &mut State, conversation: &ConversationId) {
        let snapshot = Self::snapshot(state, conversation);
        if let Some(subscribers) = state.subscribers.get_mut(conversation) {
            subscribers.retain(|(_, sink)| sink.send(snapshot.clone()).is_ok());
        }
    }

    fn check_reachable(state: &State) -> Result<(), RemoteError> {
        if state.unreachable {
            return Err(RemoteError::Unavailable("remote store unreachable".into()));
        }
        Ok(())
    }
}

impl RemoteStore for InMemoryRemote {
    async fn send(&self, message: &Message) -> Result<RemoteMessage, RemoteError> {
        let latency = self.state.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock();
        Self::check_reachable(&state)?;
        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return Err(RemoteError::Unavailable("connection reset".into()));
        }
        if state.rejected.contains(&message.conversation_id) {
            return Err(RemoteError::Rejected("permission denied".into()));
        }

        state.next_id += 1;
        let record = Message {
            id: MessageId::new(format!("R{}", state.next_id)),
            timestamp: self.clock.now(),
            status: MessageStatus::Sent,
            retry_count: 0,
            last_retry_at: None,
            error_reason: None,
            client_id: if state.strip_client_ids {
                None
            } else {
                message.client_id
            },
            ..message.clone()
        };

        state.arrivals.push(record.id.clone());
        state
            .logs
            .entry(record.conversation_id.clone())
            .or_default()
            .push(record.clone());
        Self::broadcast(&mut state, &record.conversation_id);
        drop(state);

        tracing::trace!(message_id = %record.id, "remote accepted message");
        Ok(RemoteMessage::new(record))
    }

    async fn subscribe(
        &self,
        conversation: &ConversationId,
        sink: mpsc::UnboundedSender<Snapshot>,
    ) -> Result<RemoteSubscription, RemoteError> {
        let mut state = self.state.lock();
        Self::check_reachable(&state)?;

        let id = state.next_subscriber;
        state.next_subscriber += 1;
        // The initial snapshot is delivered before any change notification.
        let _ = sink.send(Self::snapshot(&state, conversation));
        state
            .subscribers
            .entry(conversation.clone())
            .or_default()
            .push((id, sink));
        drop(state);

        let weak = Arc::downgrade(&self.state);
        let conversation = conversation.clone();
        Ok(RemoteSubscription::new(move || {
            if let Some(state) = weak.upgrade()
                && let Some(subscribers) = state.lock().subscribers.get_mut(&conversation)
            {
                subscribers.retain(|(sub_id, _)| *sub_id != id);
            }
        }))
    }

    async fn update_status(
        &self,
        conversation: &ConversationId,
        message_id: &MessageId,
        status: MessageStatus,
    ) -> Result<(), RemoteError> {
        let mut state = self.state.lock();
        Self::check_reachable(&state)?;
        let record = state
            .logs
            .get_mut(conversation)
            .and_then(|log| log.iter_mut().find(|m| &m.id == message_id))
            .ok_or_else(|| RemoteError::Rejected(format!("no such message {message_id}")))?;
        record.status = status;
        Self::broadcast(&mut state, conversation);
        Ok(())
    }
}
