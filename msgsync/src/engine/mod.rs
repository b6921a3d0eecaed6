//! The sync session: one object owning every moving part.
//!
//! [`SyncEngine`] owns the Optimistic Buffer, the latest remote snapshot of
//! every watched conversation, and handles to the Local Store, the Offline
//! Queue, the Remote Store and the Network Monitor. It is driven by exactly
//! one task (see [`actor`]); nothing inside it is shared, so the FIFO and
//! at-most-one-in-flight guarantees need no locks.
//!
//! # Send pipeline
//!
//! ```text
//! submit ── validate ── Local Store ──┬─ online ─> deliver ──ok──> sent
//!                                      │                    └─err─> Offline Queue
//!                                      └─ offline ─────────────────> Offline Queue
//! ```
//!
//! Every change to the buffer or to a snapshot re-runs [`reconcile`] for
//! the conversation and publishes the merged view on its watch channel.

pub mod actor;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use msgsync_proto::message::{
    ConversationId, Message, MessageId, MessageStatus, SenderId, ValidationError,
};
use msgsync_proto::queue::QueueEntry;
use msgsync_proto::record::{Draft, MessageRecord, OptimisticMessage, RemoteMessage};

use crate::buffer::OptimisticBuffer;
use crate::clock::Clock;
use crate::network::NetworkMonitor;
use crate::reconcile::{DEFAULT_MATCH_WINDOW_MS, reconcile};
use crate::remote::{RemoteStore, RemoteSubscription, Snapshot, send_with_timeout};
use crate::storage::{MessageStore, OfflineQueue, StorageError};
use crate::sync::{Outcome, OutcomeSink, RetryPolicy, SyncDriver, SyncReport};

/// How many cached messages seed a conversation view before the first snapshot.
const CACHED_HISTORY_LIMIT: usize = 1000;

/// Errors surfaced by engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The message was rejected before entering any delivery path.
    #[error("invalid message: {0}")]
    Validation(#[from] ValidationError),

    /// The Local Store or the Offline Queue failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// No locally authored message has this id.
    #[error("unknown message: {0}")]
    NotFound(MessageId),

    /// The engine task is no longer running.
    #[error("sync engine has stopped")]
    Closed,
}

/// Settings of one sync session.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Author of every message sent through this session.
    pub sender_id: SenderId,
    /// Retry ceiling and backoff schedule.
    pub retry: RetryPolicy,
    /// Upper bound on a single remote send.
    pub send_timeout: Duration,
    /// Fuzzy reconciliation window in milliseconds.
    pub match_window_ms: u64,
    /// How long connectivity must stay up before a reconnect sync runs.
    pub reconnect_debounce: Duration,
    /// Capacity of the command channel into the engine task.
    pub channel_capacity: usize,
}

impl EngineConfig {
    /// Default settings for `sender_id`.
    #[must_use]
    pub fn new(sender_id: SenderId) -> Self {
        Self {
            sender_id,
            retry: RetryPolicy::default(),
            send_timeout: Duration::from_secs(10),
            match_window_ms: DEFAULT_MATCH_WINDOW_MS,
            reconnect_debounce: Duration::from_millis(500),
            channel_capacity: 256,
        }
    }
}

/// What [`SyncEngine::restore`] found in durable storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreReport {
    /// Unconfirmed messages put back into the Optimistic Buffer.
    pub restored: usize,
    /// Messages that had lost their queue entry and were queued again.
    pub requeued: usize,
}

struct Watched {
    snapshot: Vec<RemoteMessage>,
    view: watch::Sender<Vec<MessageRecord>>,
    subscription: Option<RemoteSubscription>,
}

/// Offline-first synchronization session.
pub struct SyncEngine<S, Q, R> {
    config: EngineConfig,
    store: S,
    queue: Q,
    remote: R,
    network: NetworkMonitor,
    clock: Arc<dyn Clock>,
    driver: SyncDriver,
    buffer: OptimisticBuffer,
    conversations: HashMap<ConversationId, Watched>,
    snapshot_tx: mpsc::UnboundedSender<Snapshot>,
}

impl<S, Q, R> SyncEngine<S, Q, R>
where
    S: MessageStore,
    Q: OfflineQueue,
    R: RemoteStore,
{
    /// Creates a session.
    ///
    /// Remote snapshots for watched conversations arrive on the returned
    /// receiver and must be fed back through [`apply_snapshot`](Self::apply_snapshot).
    pub fn new(
        config: EngineConfig,
        store: S,
        queue: Q,
        remote: R,
        network: NetworkMonitor,
        clock: Arc<dyn Clock>,
    ) -> (Self, mpsc::UnboundedReceiver<Snapshot>) {
        let (snapshot_tx, snapshot_rx) = mpsc::unbounded_channel();
        let driver = SyncDriver::new(config.retry, config.send_timeout);
        let engine = Self {
            config,
            store,
            queue,
            remote,
            network,
            clock,
            driver,
            buffer: OptimisticBuffer::new(),
            conversations: HashMap::new(),
            snapshot_tx,
        };
        (engine, snapshot_rx)
    }

    /// Session settings.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The monitor this session follows.
    #[must_use]
    pub const fn network(&self) -> &NetworkMonitor {
        &self.network
    }

    /// Whether a delivery attempt can be made right now.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.network.current_status().is_online()
    }

    /// The Optimistic Buffer entry for a temporary id.
    #[must_use]
    pub fn optimistic(&self, id: &MessageId) -> Option<&OptimisticMessage> {
        self.buffer.get(id)
    }

    /// Rebuilds in-memory state from durable storage after a restart.
    ///
    /// Unconfirmed local messages go back into the Optimistic Buffer. A
    /// message that was `composing`, `sending` or `queued` but has no queue
    /// entry (the process died mid-send) is queued again. Queue entries whose
    /// local row went missing get their row back.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Storage`] if durable storage cannot be read.
    pub async fn restore(&mut self) -> Result<RestoreReport, EngineError> {
        let now = self.clock.now();
        let mut queued: HashMap<MessageId, QueueEntry> = self
            .queue
            .dequeue_all()
            .await?
            .into_iter()
            .map(|entry| (entry.id.clone(), entry))
            .collect();
        let mut report = RestoreReport::default();

        for row in self.store.list_unconfirmed().await? {
            let id = row.id.clone();
            let Some(mut message) = OptimisticMessage::from_persisted(row) else {
                tracing::warn!(message_id = %id, "unconfirmed row without client id skipped");
                continue;
            };

            match queued.remove(&id) {
                Some(entry) => {
                    message.set_status(MessageStatus::Queued);
                    if let Some(at) = entry.last_retry_at {
                        message.record_attempt(entry.retry_count, at, entry.error);
                    }
                }
                None if matches!(
                    message.status(),
                    MessageStatus::Composing | MessageStatus::Sending | MessageStatus::Queued
                ) =>
                {
                    message.requeue();
                    self.queue.enqueue(&message, now).await?;
                    self.store.upsert(&message.to_persisted()).await?;
                    report.requeued += 1;
                    tracing::info!(message_id = %id, "interrupted send queued again");
                }
                None => {}
            }

            self.buffer.insert(message);
            report.restored += 1;
        }

        for (id, entry) in queued {
            let mut row = entry.to_outgoing();
            row.status = MessageStatus::Queued;
            let Some(message) = OptimisticMessage::from_persisted(row) else {
                continue;
            };
            self.store.upsert(&message.to_persisted()).await?;
            self.buffer.insert(message);
            report.restored += 1;
            tracing::info!(message_id = %id, "local row rebuilt from queue entry");
        }

        tracing::info!(
            restored = report.restored,
            requeued = report.requeued,
            "sync state restored"
        );
        Ok(report)
    }

    /// Accepts a user send: validates, persists, and shows it optimistically.
    ///
    /// The returned message is `sending` when it can go out right away (hand
    /// it to [`deliver`](Self::deliver) next). It is `queued` when offline,
    /// or when an earlier message of the same conversation is still waiting
    /// for delivery, so it cannot overtake that message.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Validation`] for empty or oversized content,
    /// or [`EngineError::Storage`] if the message cannot be persisted.
    pub async fn submit(
        &mut self,
        conversation: ConversationId,
        content: String,
        attachment_ref: Option<String>,
    ) -> Result<OptimisticMessage, EngineError> {
        let draft = Draft {
            conversation_id: conversation,
            sender_id: self.config.sender_id.clone(),
            content,
            attachment_ref,
            created_at: self.clock.now(),
        };
        draft.validate()?;

        let online = self.is_online();
        let direct = online && !self.delivery_pending(&draft.conversation_id, None).await?;
        if online && !direct {
            tracing::debug!(
                conversation = %draft.conversation_id,
                "earlier messages still pending, send queued behind them"
            );
        }

        let mut message = draft.into_optimistic();
        message.set_status(if direct {
            MessageStatus::Sending
        } else {
            MessageStatus::Queued
        });

        self.store.upsert(&message.to_persisted()).await?;
        if !direct {
            self.queue.enqueue(&message, self.clock.now()).await?;
        }
        self.buffer.insert(message.clone());

        tracing::info!(
            message_id = %message.id(),
            conversation = %message.message().conversation_id,
            status = %message.status(),
            "message accepted"
        );
        self.refresh(&message.message().conversation_id).await?;
        Ok(message)
    }

    /// Delivers a `sending` message directly to the Remote Store.
    ///
    /// A transient failure moves it to the Offline Queue with one failed
    /// attempt recorded; a rejection marks it `failed`. Any other status is
    /// returned unchanged without contacting the store.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] for an unknown id, or
    /// [`EngineError::Storage`] if bookkeeping cannot be persisted.
    pub async fn deliver(&mut self, id: &MessageId) -> Result<MessageStatus, EngineError> {
        let message = self
            .buffer
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(id.clone()))?;
        if message.status() != MessageStatus::Sending {
            return Ok(message.status());
        }

        let outgoing = message.to_persisted();
        match send_with_timeout(&self.remote, &outgoing, self.config.send_timeout).await {
            Ok(record) => {
                tracing::info!(message_id = %id, remote_id = %record.id(), "message delivered");
                apply_confirmed(&self.store, &mut self.buffer, id, &record).await?;
            }
            Err(error) if error.is_transient() => {
                let now = self.clock.now();
                let reason = error.to_string();
                let mut queued = message.clone();
                queued.set_status(MessageStatus::Queued);
                self.queue.enqueue(&queued, now).await?;
                let entry = self.queue.record_failure(id, &reason, now).await?;
                queued.record_attempt(entry.retry_count, now, Some(reason.clone()));
                if self.driver.policy().is_exhausted(entry.retry_count) {
                    self.queue.remove(id).await?;
                    queued.fail(reason);
                    tracing::warn!(message_id = %id, error = %error, "direct send failed, retry budget exhausted");
                } else {
                    tracing::warn!(message_id = %id, error = %error, "direct send failed, message queued");
                }
                self.buffer.insert(queued.clone());
                self.store.upsert(&queued.to_persisted()).await?;
            }
            Err(error) => {
                self.buffer.fail(id, &error.to_string());
                persist(&self.store, &self.buffer, id).await?;
                tracing::warn!(message_id = %id, error = %error, "message rejected by remote store");
            }
        }

        self.refresh(&outgoing.conversation_id).await?;
        Ok(self.buffer.get(id).map_or(MessageStatus::Sent, OptimisticMessage::status))
    }

    /// Sends a message end to end: [`submit`](Self::submit) then
    /// [`deliver`](Self::deliver) when online.
    ///
    /// # Errors
    ///
    /// See [`submit`](Self::submit) and [`deliver`](Self::deliver).
    pub async fn send_message(
        &mut self,
        conversation: ConversationId,
        content: String,
        attachment_ref: Option<String>,
    ) -> Result<Message, EngineError> {
        let message = self.submit(conversation, content, attachment_ref).await?;
        if message.status() == MessageStatus::Sending {
            self.deliver(message.id()).await?;
        }
        Ok(self
            .buffer
            .get(message.id())
            .map_or_else(|| message.to_persisted(), OptimisticMessage::to_persisted))
    }

    /// Retries one message on explicit user request, bypassing its backoff.
    ///
    /// A queued message keeps its retry count. A failed message gets a
    /// fresh retry budget. When online, delivery is attempted immediately,
    /// unless an earlier message of the same conversation is still queued:
    /// then a sync pass runs in which only this message skips its backoff,
    /// and it goes out after the earlier ones. Confirmed messages are left
    /// alone.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] if no unconfirmed local message has
    /// this id, or [`EngineError::Storage`] on storage failure.
    pub async fn retry_message(&mut self, id: &MessageId) -> Result<MessageStatus, EngineError> {
        let message = match self.buffer.get(id) {
            Some(message) => message.clone(),
            None => self
                .store
                .get(id)
                .await?
                .and_then(OptimisticMessage::from_persisted)
                .ok_or_else(|| EngineError::NotFound(id.clone()))?,
        };
        if message.status().is_confirmed() {
            return Ok(message.status());
        }
        let conversation = message.message().conversation_id.clone();

        let entry = if let Some(entry) = self.queue.entry(id).await? {
            if self.buffer.get(id).is_none() {
                self.buffer.insert(message);
            }
            entry
        } else {
            let mut requeued = message;
            requeued.requeue();
            let entry = self.queue.enqueue(&requeued, self.clock.now()).await?;
            self.store.upsert(&requeued.to_persisted()).await?;
            self.buffer.insert(requeued);
            entry
        };
        tracing::info!(message_id = %id, retry_count = entry.retry_count, "user retry");

        if self.is_online() {
            if self.delivery_pending(&conversation, Some(id)).await? {
                tracing::debug!(message_id = %id, "earlier messages queued, retry joins a sync pass");
                self.pass(Some(id)).await?;
            } else {
                let mut sink = ApplyOutcomes::new(&self.store, &mut self.buffer);
                sink.attempting(&entry).await?;
                let outcome = self
                    .driver
                    .attempt(&self.queue, &self.remote, self.clock.as_ref(), entry)
                    .await?;
                sink.settled(&outcome).await?;
            }
        }

        self.refresh(&conversation).await?;
        Ok(self.buffer.get(id).map_or(MessageStatus::Sent, OptimisticMessage::status))
    }

    /// Marks received messages as read.
    ///
    /// The Local Store is updated first; the Remote Store is told when
    /// online. Read receipts are best-effort: remote failures are logged and
    /// never queued. Temporary ids are ignored.
    ///
    /// Returns how many local rows were updated.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Storage`] if the Local Store fails.
    pub async fn mark_as_read(
        &mut self,
        conversation: &ConversationId,
        ids: &[MessageId],
    ) -> Result<usize, EngineError> {
        let targets: Vec<&MessageId> = ids.iter().filter(|id| !id.is_temporary()).collect();
        let mut updated: HashSet<MessageId> = HashSet::new();

        for id in &targets {
            match self.store.update_status(id, MessageStatus::Read).await {
                Ok(()) => {
                    updated.insert((*id).clone());
                }
                Err(StorageError::NotFound(_)) => {
                    tracing::debug!(message_id = %id, "read receipt for uncached message");
                }
                Err(e) => return Err(e.into()),
            }
        }

        if let Some(watched) = self.conversations.get_mut(conversation) {
            for record in &mut watched.snapshot {
                if updated.contains(record.id()) {
                    *record = RemoteMessage::new(Message {
                        status: MessageStatus::Read,
                        ..record.message().clone()
                    });
                }
            }
        }

        if self.is_online() {
            for id in &targets {
                if let Err(error) = self
                    .remote
                    .update_status(conversation, id, MessageStatus::Read)
                    .await
                {
                    tracing::warn!(message_id = %id, error = %error, "read receipt not delivered");
                }
            }
        }

        self.refresh(conversation).await?;
        Ok(updated.len())
    }

    /// Starts following a conversation and returns its merged view.
    ///
    /// The view is seeded from the Local Store cache so it is useful
    /// offline; the remote subscription replaces it as soon as the first
    /// snapshot arrives. A failed subscription is retried on reconnect.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Storage`] if the cache cannot be read.
    pub async fn watch(
        &mut self,
        conversation: &ConversationId,
    ) -> Result<watch::Receiver<Vec<MessageRecord>>, EngineError> {
        if let Some(watched) = self.conversations.get(conversation) {
            return Ok(watched.view.subscribe());
        }

        let mut cached: Vec<RemoteMessage> = self
            .store
            .list(conversation, CACHED_HISTORY_LIMIT, 0)
            .await?
            .into_iter()
            .filter(|m| !m.id.is_temporary())
            .map(RemoteMessage::new)
            .collect();
        cached.reverse();

        let (view, receiver) = watch::channel(Vec::new());
        self.conversations.insert(
            conversation.clone(),
            Watched {
                snapshot: cached,
                view,
                subscription: None,
            },
        );
        self.subscribe_remote(conversation).await;
        self.refresh(conversation).await?;
        Ok(receiver)
    }

    /// Stops following a conversation and drops its remote subscription.
    pub fn unwatch(&mut self, conversation: &ConversationId) {
        if self.conversations.remove(conversation).is_some() {
            tracing::debug!(conversation = %conversation, "conversation unwatched");
        }
    }

    async fn subscribe_remote(&mut self, conversation: &ConversationId) {
        match self
            .remote
            .subscribe(conversation, self.snapshot_tx.clone())
            .await
        {
            Ok(subscription) => {
                if let Some(watched) = self.conversations.get_mut(conversation) {
                    watched.subscription = Some(subscription);
                }
            }
            Err(error) => {
                tracing::warn!(
                    conversation = %conversation,
                    error = %error,
                    "remote subscription failed, will retry on reconnect"
                );
            }
        }
    }

    /// Takes in a full remote snapshot of a watched conversation.
    ///
    /// Changed records are cached in the Local Store, then the conversation
    /// is reconciled. Snapshots for conversations no longer watched are
    /// dropped.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Storage`] if the cache cannot be written.
    pub async fn apply_snapshot(&mut self, snapshot: Snapshot) -> Result<(), EngineError> {
        let Snapshot {
            conversation_id,
            messages,
        } = snapshot;
        let Some(watched) = self.conversations.get_mut(&conversation_id) else {
            tracing::trace!(conversation = %conversation_id, "snapshot for unwatched conversation dropped");
            return Ok(());
        };

        let previous: HashMap<MessageId, RemoteMessage> = std::mem::take(&mut watched.snapshot)
            .into_iter()
            .map(|record| (record.id().clone(), record))
            .collect();
        watched.snapshot = messages
            .into_iter()
            .map(|record| carry_identity(record, &previous))
            .collect();
        for record in &watched.snapshot {
            if previous.get(record.id()) != Some(record) {
                self.store.upsert(record.message()).await?;
            }
        }
        tracing::debug!(
            conversation = %conversation_id,
            records = watched.snapshot.len(),
            "remote snapshot applied"
        );

        self.refresh(&conversation_id).await
    }

    /// Runs a sync pass over the Offline Queue if online.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Storage`] if the queue or the Local Store fails.
    pub async fn sync_pass(&mut self) -> Result<SyncReport, EngineError> {
        if !self.is_online() {
            tracing::debug!("offline, sync pass skipped");
            return Ok(SyncReport::default());
        }
        self.pass(None).await
    }

    async fn pass(&mut self, expedite: Option<&MessageId>) -> Result<SyncReport, EngineError> {
        let mut sink = ApplyOutcomes::new(&self.store, &mut self.buffer);
        let report = self
            .driver
            .drain_expediting(
                &self.queue,
                &self.remote,
                self.clock.as_ref(),
                &mut sink,
                expedite,
            )
            .await?;
        let touched = sink.touched;

        for conversation in touched {
            self.refresh(&conversation).await?;
        }
        Ok(report)
    }

    /// Whether a message of `conversation` is in flight, or queued ahead of
    /// `before` (anywhere in the queue when `before` is `None`).
    async fn delivery_pending(
        &self,
        conversation: &ConversationId,
        before: Option<&MessageId>,
    ) -> Result<bool, EngineError> {
        let in_flight = self
            .buffer
            .entries(conversation)
            .iter()
            .any(|message| message.status() == MessageStatus::Sending && Some(message.id()) != before);
        if in_flight {
            return Ok(true);
        }
        Ok(self
            .queue
            .dequeue_all()
            .await?
            .iter()
            .take_while(|entry| Some(&entry.id) != before)
            .any(|entry| &entry.conversation_id == conversation))
    }

    /// Handles a debounced reconnect: resubscribes conversations whose
    /// subscription failed, then drains the queue.
    ///
    /// # Errors
    ///
    /// See [`sync_pass`](Self::sync_pass).
    pub async fn on_reconnect(&mut self) -> Result<SyncReport, EngineError> {
        let unsubscribed: Vec<ConversationId> = self
            .conversations
            .iter()
            .filter(|(_, watched)| watched.subscription.is_none())
            .map(|(conversation, _)| conversation.clone())
            .collect();
        for conversation in &unsubscribed {
            self.subscribe_remote(conversation).await;
        }
        tracing::info!(resubscribed = unsubscribed.len(), "reconnected");
        self.sync_pass().await
    }

    /// Time until the next sync pass would attempt a delivery.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Storage`] if the queue cannot be read.
    pub async fn next_retry_delay(&self) -> Result<Option<Duration>, EngineError> {
        Ok(self.driver.next_due(&self.queue, self.clock.as_ref()).await?)
    }

    /// The merged, ordered view of a conversation right now.
    #[must_use]
    pub fn merged_view(&self, conversation: &ConversationId) -> Vec<MessageRecord> {
        let snapshot = self
            .conversations
            .get(conversation)
            .map_or(&[][..], |watched| watched.snapshot.as_slice());
        reconcile(
            self.buffer.entries(conversation),
            snapshot,
            self.config.match_window_ms,
        )
        .merged
    }

    /// Queue entries, optionally limited to one conversation, in drain order.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Storage`] if the queue cannot be read.
    pub async fn queued(
        &self,
        conversation: Option<&ConversationId>,
    ) -> Result<Vec<QueueEntry>, EngineError> {
        let mut entries = self.queue.dequeue_all().await?;
        if let Some(conversation) = conversation {
            entries.retain(|entry| &entry.conversation_id == conversation);
        }
        Ok(entries)
    }

    /// Drops every subscription and view.
    pub fn close(&mut self) {
        self.conversations.clear();
    }

    /// Re-runs reconciliation for a conversation, applies retirements and
    /// publishes the merged view.
    async fn refresh(&mut self, conversation: &ConversationId) -> Result<(), EngineError> {
        let snapshot = self
            .conversations
            .get(conversation)
            .map_or(&[][..], |watched| watched.snapshot.as_slice());
        let outcome = reconcile(
            self.buffer.entries(conversation),
            snapshot,
            self.config.match_window_ms,
        );

        // A record matched by content alone is bound to the entry it
        // retired, so later runs cannot hand it to another entry.
        if let Some(watched) = self.conversations.get_mut(conversation) {
            for (remote_id, client_id) in &outcome.identified {
                let Some(record) = watched
                    .snapshot
                    .iter_mut()
                    .find(|record| record.id() == remote_id)
                else {
                    continue;
                };
                let stamped = Message {
                    client_id: Some(*client_id),
                    ..record.message().clone()
                };
                self.store.upsert(&stamped).await?;
                *record = RemoteMessage::new(stamped);
            }
        }

        for retired in self.buffer.retire(&outcome.retired) {
            self.store.delete(retired.id()).await?;
            if self.queue.remove(retired.id()).await? {
                tracing::debug!(message_id = %retired.id(), "queue entry superseded by remote record");
            }
            tracing::debug!(message_id = %retired.id(), "optimistic message reconciled");
        }

        if let Some(watched) = self.conversations.get(conversation) {
            watched.view.send_replace(outcome.merged);
        }
        Ok(())
    }
}

/// Keeps the client id a record was stamped with when a new snapshot
/// delivers it without one.
fn carry_identity(
    record: RemoteMessage,
    previous: &HashMap<MessageId, RemoteMessage>,
) -> RemoteMessage {
    if record.message().client_id.is_some() {
        return record;
    }
    match previous.get(record.id()).and_then(|prior| prior.message().client_id) {
        Some(client_id) => RemoteMessage::new(Message {
            client_id: Some(client_id),
            ..record.into_persisted()
        }),
        None => record,
    }
}

/// Writes the buffered state of `id` to the Local Store, if buffered.
async fn persist<S: MessageStore>(
    store: &S,
    buffer: &OptimisticBuffer,
    id: &MessageId,
) -> Result<(), StorageError> {
    if let Some(message) = buffer.get(id) {
        store.upsert(&message.to_persisted()).await?;
    }
    Ok(())
}

/// Replaces the temporary row with the confirmed record and marks the
/// optimistic entry `sent` until a snapshot reconciles it away.
async fn apply_confirmed<S: MessageStore>(
    store: &S,
    buffer: &mut OptimisticBuffer,
    id: &MessageId,
    record: &RemoteMessage,
) -> Result<(), StorageError> {
    store.delete(id).await?;
    store.upsert(record.message()).await?;
    buffer.confirm(id, record.id().clone());
    Ok(())
}

/// Mirrors sync pass progress into the Local Store and the Optimistic Buffer.
struct ApplyOutcomes<'a, S> {
    store: &'a S,
    buffer: &'a mut OptimisticBuffer,
    touched: HashSet<ConversationId>,
}

impl<'a, S: MessageStore> ApplyOutcomes<'a, S> {
    fn new(store: &'a S, buffer: &'a mut OptimisticBuffer) -> Self {
        Self {
            store,
            buffer,
            touched: HashSet::new(),
        }
    }
}

impl<S: MessageStore> OutcomeSink for ApplyOutcomes<'_, S> {
    async fn attempting(&mut self, entry: &QueueEntry) -> Result<(), StorageError> {
        self.buffer.set_status(&entry.id, MessageStatus::Sending);
        persist(self.store, self.buffer, &entry.id).await?;
        self.touched.insert(entry.conversation_id.clone());
        Ok(())
    }

    async fn settled(&mut self, outcome: &Outcome) -> Result<(), StorageError> {
        let entry = outcome.entry();
        match outcome {
            Outcome::Sent { record, .. } => {
                apply_confirmed(self.store, self.buffer, &entry.id, record).await?;
            }
            Outcome::Retrying { error, .. } => {
                self.buffer.set_status(&entry.id, MessageStatus::Queued);
                if let Some(at) = entry.last_retry_at {
                    self.buffer
                        .record_attempt(&entry.id, entry.retry_count, at, Some(error.to_string()));
                }
                persist(self.store, self.buffer, &entry.id).await?;
            }
            Outcome::Abandoned { reason, .. } => {
                if let Some(at) = entry.last_retry_at {
                    self.buffer
                        .record_attempt(&entry.id, entry.retry_count, at, None);
                }
                if self.buffer.fail(&entry.id, reason) {
                    persist(self.store, self.buffer, &entry.id).await?;
                } else {
                    match self.store.update_status(&entry.id, MessageStatus::Failed).await {
                        Ok(()) | Err(StorageError::NotFound(_)) => {}
                        Err(e) => return Err(e),
                    }
                }
            }
            Outcome::Waiting { .. } | Outcome::Held { .. } => return Ok(()),
        }
        self.touched.insert(entry.conversation_id.clone());
        Ok(())
    }
}
