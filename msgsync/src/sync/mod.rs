//! Sync Driver: drains the Offline Queue into the Remote Store.
//!
//! A pass walks the queue in FIFO order and processes entries strictly one
//! at a time. Per entry:
//!
//! ```text
//! Queued ──decide──> Attempting ──ok──────────> Sent       (entry removed)
//!   │                    ├──transient error──> Queued     (retry_count + 1)
//!   │                    └──rejected─────────> Abandoned  (entry removed)
//!   ├──inside backoff──> Waiting
//!   └──budget spent────> Abandoned
//! ```
//!
//! Once an entry of a conversation waits or fails, the later entries of
//! that conversation are held until the next pass, so a message never
//! overtakes an earlier one from the same conversation.
//!
//! The driver only touches the queue and the Remote Store. Everything the
//! rest of the engine has to learn about a pass (status changes, confirmed
//! records) is reported through an [`OutcomeSink`].

pub mod backoff;

pub use backoff::{Decision, RetryPolicy};

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use msgsync_proto::message::{ConversationId, MessageId};
use msgsync_proto::queue::QueueEntry;
use msgsync_proto::record::RemoteMessage;

use crate::clock::Clock;
use crate::remote::{RemoteError, RemoteStore, send_with_timeout};
use crate::storage::{OfflineQueue, StorageError};

/// How one queue entry left a sync pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Delivered; the entry was removed from the queue.
    Sent {
        /// The entry as it was attempted.
        entry: QueueEntry,
        /// The record as stored remotely.
        record: RemoteMessage,
    },
    /// Transient failure recorded; the entry stays queued.
    Retrying {
        /// The entry with updated retry bookkeeping.
        entry: QueueEntry,
        /// What went wrong.
        error: RemoteError,
    },
    /// No further automatic attempts; the entry was removed from the queue.
    Abandoned {
        /// The entry at the time it was abandoned.
        entry: QueueEntry,
        /// Reason shown to the user.
        reason: String,
    },
    /// Still inside its backoff window.
    Waiting {
        /// The untouched entry.
        entry: QueueEntry,
        /// Time left until it becomes eligible.
        remaining: Duration,
    },
    /// Held behind an earlier entry of the same conversation.
    Held {
        /// The untouched entry.
        entry: QueueEntry,
    },
}

impl Outcome {
    /// The queue entry this outcome is about.
    #[must_use]
    pub const fn entry(&self) -> &QueueEntry {
        match self {
            Self::Sent { entry, .. }
            | Self::Retrying { entry, .. }
            | Self::Abandoned { entry, .. }
            | Self::Waiting { entry, .. }
            | Self::Held { entry } => entry,
        }
    }

    /// Whether later entries of the same conversation must wait.
    const fn blocks_conversation(&self) -> bool {
        matches!(
            self,
            Self::Retrying { .. } | Self::Waiting { .. } | Self::Held { .. }
        )
    }
}

/// Summary of one sync pass, ids in processing order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Delivered entries.
    pub sent: Vec<MessageId>,
    /// Entries that failed transiently and stay queued.
    pub retrying: Vec<MessageId>,
    /// Entries that will not be retried automatically.
    pub abandoned: Vec<MessageId>,
    /// Entries still inside their backoff window.
    pub waiting: Vec<MessageId>,
    /// Entries held behind an earlier entry of their conversation.
    pub held: Vec<MessageId>,
}

impl SyncReport {
    fn record(&mut self, outcome: &Outcome) {
        let id = outcome.entry().id.clone();
        match outcome {
            Outcome::Sent { .. } => self.sent.push(id),
            Outcome::Retrying { .. } => self.retrying.push(id),
            Outcome::Abandoned { .. } => self.abandoned.push(id),
            Outcome::Waiting { .. } => self.waiting.push(id),
            Outcome::Held { .. } => self.held.push(id),
        }
    }

    /// Number of delivery attempts made during the pass.
    #[must_use]
    pub fn attempted(&self) -> usize {
        self.sent.len() + self.retrying.len()
    }

    /// Whether the pass left nothing behind in the queue.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.retrying.is_empty() && self.waiting.is_empty() && self.held.is_empty()
    }
}

/// Receives per-entry progress of a sync pass.
pub trait OutcomeSink: Send {
    /// Called right before delivery of `entry` is attempted.
    fn attempting(
        &mut self,
        entry: &QueueEntry,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Called once for every entry the pass looked at.
    fn settled(
        &mut self,
        outcome: &Outcome,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;
}

/// Sink that ignores progress.
impl OutcomeSink for () {
    async fn attempting(&mut self, _entry: &QueueEntry) -> Result<(), StorageError> {
        Ok(())
    }

    async fn settled(&mut self, _outcome: &Outcome) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Drains the Offline Queue with bounded exponential backoff.
#[derive(Debug, Clone)]
pub struct SyncDriver {
    policy: RetryPolicy,
    send_timeout: Duration,
}

impl SyncDriver {
    /// Creates a driver with a retry policy and a per-call send timeout.
    #[must_use]
    pub const fn new(policy: RetryPolicy, send_timeout: Duration) -> Self {
        Self {
            policy,
            send_timeout,
        }
    }

    /// The retry policy in effect.
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs one pass over the whole queue.
    ///
    /// Remote failures are recorded against their entry and never end the
    /// pass early; only storage failures do.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the queue cannot be read or updated, or
    /// if the sink fails.
    pub async fn drain<Q, R, K>(
        &self,
        queue: &Q,
        remote: &R,
        clock: &dyn Clock,
        sink: &mut K,
    ) -> Result<SyncReport, StorageError>
    where
        Q: OfflineQueue,
        R: RemoteStore,
        K: OutcomeSink,
    {
        self.drain_expediting(queue, remote, clock, sink, None).await
    }

    /// Runs one pass in which `expedite`, if given, ignores its backoff.
    ///
    /// The expedited entry still waits behind earlier entries of its
    /// conversation: if one of them waits or fails, it is held.
    ///
    /// # Errors
    ///
    /// See [`drain`](Self::drain).
    pub async fn drain_expediting<Q, R, K>(
        &self,
        queue: &Q,
        remote: &R,
        clock: &dyn Clock,
        sink: &mut K,
        expedite: Option<&MessageId>,
    ) -> Result<SyncReport, StorageError>
    where
        Q: OfflineQueue,
        R: RemoteStore,
        K: OutcomeSink,
    {
        let entries = queue.dequeue_all().await?;
        tracing::debug!(entries = entries.len(), "sync pass started");

        let mut blocked: HashSet<ConversationId> = HashSet::new();
        let mut report = SyncReport::default();

        for entry in entries {
            let outcome = if blocked.contains(&entry.conversation_id) {
                Outcome::Held { entry }
            } else {
                let decision = if expedite == Some(&entry.id) {
                    Decision::Attempt
                } else {
                    self.policy.decide(&entry, clock.now())
                };
                match decision {
                    Decision::Abandon => {
                        let reason = entry
                            .error
                            .clone()
                            .unwrap_or_else(|| "retry limit reached".to_string());
                        self.abandon(queue, entry, reason).await?
                    }
                    Decision::Wait { remaining } => Outcome::Waiting { entry, remaining },
                    Decision::Attempt => {
                        sink.attempting(&entry).await?;
                        self.attempt(queue, remote, clock, entry).await?
                    }
                }
            };

            if outcome.blocks_conversation() {
                blocked.insert(outcome.entry().conversation_id.clone());
            }
            sink.settled(&outcome).await?;
            report.record(&outcome);
        }

        tracing::debug!(
            sent = report.sent.len(),
            retrying = report.retrying.len(),
            abandoned = report.abandoned.len(),
            waiting = report.waiting.len(),
            held = report.held.len(),
            "sync pass finished"
        );
        Ok(report)
    }

    /// Attempts delivery of one entry, ignoring its backoff window.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the queue cannot be updated.
    pub async fn attempt<Q, R>(
        &self,
        queue: &Q,
        remote: &R,
        clock: &dyn Clock,
        entry: QueueEntry,
    ) -> Result<Outcome, StorageError>
    where
        Q: OfflineQueue,
        R: RemoteStore,
    {
        match send_with_timeout(remote, &entry.to_outgoing(), self.send_timeout).await {
            Ok(record) => {
                queue.remove(&entry.id).await?;
                tracing::info!(
                    message_id = %entry.id,
                    remote_id = %record.id(),
                    conversation = %entry.conversation_id,
                    "queued message delivered"
                );
                Ok(Outcome::Sent { entry, record })
            }
            Err(error) if error.is_transient() => {
                let reason = error.to_string();
                let updated = queue.record_failure(&entry.id, &reason, clock.now()).await?;
                if self.policy.is_exhausted(updated.retry_count) {
                    return self.abandon(queue, updated, reason).await;
                }
                tracing::warn!(
                    message_id = %entry.id,
                    retry_count = updated.retry_count,
                    error = %error,
                    "delivery failed, will retry"
                );
                Ok(Outcome::Retrying {
                    entry: updated,
                    error,
                })
            }
            Err(error) => self.abandon(queue, entry, error.to_string()).await,
        }
    }

    async fn abandon<Q: OfflineQueue>(
        &self,
        queue: &Q,
        entry: QueueEntry,
        reason: String,
    ) -> Result<Outcome, StorageError> {
        queue.remove(&entry.id).await?;
        tracing::warn!(
            message_id = %entry.id,
            retry_count = entry.retry_count,
            reason = %reason,
            "delivery abandoned"
        );
        Ok(Outcome::Abandoned { entry, reason })
    }

    /// Time until the next pass has something to attempt, if anything.
    ///
    /// Only the head entry of each conversation counts, since the entries
    /// behind it are held until it leaves the queue.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the queue cannot be read.
    pub async fn next_due<Q: OfflineQueue>(
        &self,
        queue: &Q,
        clock: &dyn Clock,
    ) -> Result<Option<Duration>, StorageError> {
        let now = clock.now();
        let mut seen: HashSet<ConversationId> = HashSet::new();
        let mut due: Option<Duration> = None;
        for entry in queue.dequeue_all().await? {
            if !seen.insert(entry.conversation_id.clone()) {
                continue;
            }
            let delay = match self.policy.decide(&entry, now) {
                Decision::Attempt | Decision::Abandon => Duration::ZERO,
                Decision::Wait { remaining } => remaining,
            };
            due = Some(due.map_or(delay, |d| d.min(delay)));
        }
        Ok(due)
    }
}
