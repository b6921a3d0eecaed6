//! Single-writer task owning a [`SyncEngine`].
//!
//! Callers talk to the engine through a cloneable [`EngineHandle`] that
//! sends [`EngineCommand`]s over a bounded channel. The task also receives
//! remote snapshots and network transitions, so every mutation of the
//! queue and the buffer happens on this one task.
//!
//! ```text
//! EngineHandle ── EngineCommand ──┐
//! RemoteStore  ── Snapshot ───────┼──> run loop ──> SyncEngine
//! NetworkMonitor ── status ───────┘        │
//!                        reconnect debounce / retry timer
//! ```

use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Sleep};

use msgsync_proto::message::{ConversationId, Message, MessageId, MessageStatus};
use msgsync_proto::queue::QueueEntry;
use msgsync_proto::record::MessageRecord;

use super::{EngineError, SyncEngine};
use crate::remote::{RemoteStore, Snapshot};
use crate::storage::{MessageStore, OfflineQueue};
use crate::sync::SyncReport;

type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

/// Requests handled by the engine task.
#[derive(Debug)]
pub enum EngineCommand {
    /// Send a message. Answered as soon as it is accepted locally.
    Send {
        /// Target conversation.
        conversation: ConversationId,
        /// Text content.
        content: String,
        /// Optional attachment reference.
        attachment_ref: Option<String>,
        /// Receives the optimistic (`sending`) or `queued` record.
        reply: Reply<Message>,
    },
    /// Retry one message now, bypassing its backoff.
    Retry {
        /// Temporary id of the message.
        id: MessageId,
        /// Receives the status after the attempt.
        reply: Reply<MessageStatus>,
    },
    /// Mark received messages as read.
    MarkAsRead {
        /// Conversation the messages belong to.
        conversation: ConversationId,
        /// Ids to mark.
        ids: Vec<MessageId>,
        /// Receives the number of local rows updated.
        reply: Reply<usize>,
    },
    /// Start following a conversation.
    Watch {
        /// Conversation to follow.
        conversation: ConversationId,
        /// Receives the merged-view channel.
        reply: Reply<watch::Receiver<Vec<MessageRecord>>>,
    },
    /// Stop following a conversation.
    Unwatch {
        /// Conversation to drop.
        conversation: ConversationId,
    },
    /// Run a sync pass now.
    SyncNow {
        /// Receives the pass report.
        reply: Reply<SyncReport>,
    },
    /// List queue entries.
    Queued {
        /// Restrict to one conversation.
        conversation: Option<ConversationId>,
        /// Receives the entries in drain order.
        reply: Reply<Vec<QueueEntry>>,
    },
    /// Stop the engine task.
    Shutdown,
}

/// Cloneable front end of a running engine task.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> EngineCommand,
    ) -> Result<T, EngineError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| EngineError::Closed)?;
        response.await.map_err(|_| EngineError::Closed)?
    }

    /// Sends a message; resolves with the locally accepted record.
    ///
    /// # Errors
    ///
    /// Validation and storage errors, or [`EngineError::Closed`].
    pub async fn send_message(
        &self,
        conversation: ConversationId,
        content: impl Into<String>,
        attachment_ref: Option<String>,
    ) -> Result<Message, EngineError> {
        let content = content.into();
        self.request(|reply| EngineCommand::Send {
            conversation,
            content,
            attachment_ref,
            reply,
        })
        .await
    }

    /// Retries one message immediately.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`] for unknown ids, storage errors, or
    /// [`EngineError::Closed`].
    pub async fn retry_message(&self, id: MessageId) -> Result<MessageStatus, EngineError> {
        self.request(|reply| EngineCommand::Retry { id, reply }).await
    }

    /// Marks messages as read.
    ///
    /// # Errors
    ///
    /// Storage errors, or [`EngineError::Closed`].
    pub async fn mark_as_read(
        &self,
        conversation: ConversationId,
        ids: Vec<MessageId>,
    ) -> Result<usize, EngineError> {
        self.request(|reply| EngineCommand::MarkAsRead {
            conversation,
            ids,
            reply,
        })
        .await
    }

    /// Follows a conversation and returns its merged view.
    ///
    /// # Errors
    ///
    /// Storage errors, or [`EngineError::Closed`].
    pub async fn watch(
        &self,
        conversation: ConversationId,
    ) -> Result<watch::Receiver<Vec<MessageRecord>>, EngineError> {
        self.request(|reply| EngineCommand::Watch {
            conversation,
            reply,
        })
        .await
    }

    /// Stops following a conversation.
    ///
    /// # Errors
    ///
    /// [`EngineError::Closed`] if the task has stopped.
    pub async fn unwatch(&self, conversation: ConversationId) -> Result<(), EngineError> {
        self.commands
            .send(EngineCommand::Unwatch { conversation })
            .await
            .map_err(|_| EngineError::Closed)
    }

    /// Runs a sync pass now, if online.
    ///
    /// # Errors
    ///
    /// Storage errors, or [`EngineError::Closed`].
    pub async fn sync_now(&self) -> Result<SyncReport, EngineError> {
        self.request(|reply| EngineCommand::SyncNow { reply }).await
    }

    /// Queue entries in drain order, optionally for one conversation.
    ///
    /// # Errors
    ///
    /// Storage errors, or [`EngineError::Closed`].
    pub async fn queued(
        &self,
        conversation: Option<ConversationId>,
    ) -> Result<Vec<QueueEntry>, EngineError> {
        self.request(|reply| EngineCommand::Queued {
            conversation,
            reply,
        })
        .await
    }

    /// Asks the task to stop. Pending commands ahead of it are still served.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(EngineCommand::Shutdown).await;
    }
}

/// Spawns the engine task.
///
/// `snapshots` is the receiver returned by [`SyncEngine::new`].
pub fn spawn<S, Q, R>(
    engine: SyncEngine<S, Q, R>,
    snapshots: mpsc::UnboundedReceiver<Snapshot>,
) -> (EngineHandle, JoinHandle<()>)
where
    S: MessageStore + 'static,
    Q: OfflineQueue + 'static,
    R: RemoteStore + 'static,
{
    let (commands_tx, commands_rx) = mpsc::channel(engine.config().channel_capacity.max(1));
    let task = tokio::spawn(run(engine, commands_rx, snapshots));
    let handle = EngineHandle {
        commands: commands_tx,
    };
    (handle, task)
}

async fn run<S, Q, R>(
    mut engine: SyncEngine<S, Q, R>,
    mut commands: mpsc::Receiver<EngineCommand>,
    mut snapshots: mpsc::UnboundedReceiver<Snapshot>,
) where
    S: MessageStore,
    Q: OfflineQueue,
    R: RemoteStore,
{
    if let Err(e) = engine.restore().await {
        tracing::error!(error = %e, "failed to restore sync state");
    }

    let debounce = engine.config().reconnect_debounce;
    let mut network = engine.network().subscribe();
    let mut network_open = true;
    let mut online = network.borrow_and_update().is_online();

    let reconnect = tokio::time::sleep(Duration::ZERO);
    tokio::pin!(reconnect);
    let mut reconnect_armed = false;

    let retry = tokio::time::sleep(Duration::ZERO);
    tokio::pin!(retry);

    if online {
        run_pass(&mut engine, "startup").await;
    }
    let mut retry_armed = schedule_retry(&engine, online && !reconnect_armed, retry.as_mut()).await;

    tracing::info!(online, "sync engine started");

    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else { break };
                if !handle_command(&mut engine, command).await {
                    break;
                }
            }
            Some(snapshot) = snapshots.recv() => {
                let conversation = snapshot.conversation_id.clone();
                if let Err(e) = engine.apply_snapshot(snapshot).await {
                    tracing::warn!(conversation = %conversation, error = %e, "failed to apply snapshot");
                }
            }
            changed = network.changed(), if network_open => {
                if changed.is_err() {
                    network_open = false;
                    continue;
                }
                let now_online = network.borrow_and_update().is_online();
                match (online, now_online) {
                    (false, true) => {
                        reconnect.as_mut().reset(Instant::now() + debounce);
                        reconnect_armed = true;
                        tracing::debug!(?debounce, "connectivity restored, waiting for it to settle");
                    }
                    (true, false) => {
                        if reconnect_armed {
                            tracing::debug!("connectivity lost before settling, reconnect cancelled");
                        }
                        reconnect_armed = false;
                    }
                    _ => {}
                }
                online = now_online;
            }
            () = &mut reconnect, if reconnect_armed => {
                reconnect_armed = false;
                match engine.on_reconnect().await {
                    Ok(report) => log_report("reconnect", &report),
                    Err(e) => tracing::warn!(error = %e, "reconnect sync failed"),
                }
            }
            () = &mut retry, if retry_armed => {
                run_pass(&mut engine, "retry").await;
            }
        }

        retry_armed = schedule_retry(&engine, online && !reconnect_armed, retry.as_mut()).await;
    }

    engine.close();
    tracing::info!("sync engine stopped");
}

/// Serves one command. Returns `false` when the task should stop.
async fn handle_command<S, Q, R>(engine: &mut SyncEngine<S, Q, R>, command: EngineCommand) -> bool
where
    S: MessageStore,
    Q: OfflineQueue,
    R: RemoteStore,
{
    match command {
        EngineCommand::Send {
            conversation,
            content,
            attachment_ref,
            reply,
        } => match engine.submit(conversation, content, attachment_ref).await {
            Ok(message) => {
                let _ = reply.send(Ok(message.to_persisted()));
                if message.status() == MessageStatus::Sending
                    && let Err(e) = engine.deliver(message.id()).await
                {
                    tracing::error!(message_id = %message.id(), error = %e, "delivery bookkeeping failed");
                }
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        },
        EngineCommand::Retry { id, reply } => {
            let _ = reply.send(engine.retry_message(&id).await);
        }
        EngineCommand::MarkAsRead {
            conversation,
            ids,
            reply,
        } => {
            let _ = reply.send(engine.mark_as_read(&conversation, &ids).await);
        }
        EngineCommand::Watch {
            conversation,
            reply,
        } => {
            let _ = reply.send(engine.watch(&conversation).await);
        }
        EngineCommand::Unwatch { conversation } => engine.unwatch(&conversation),
        EngineCommand::SyncNow { reply } => {
            let _ = reply.send(engine.sync_pass().await);
        }
        EngineCommand::Queued {
            conversation,
            reply,
        } => {
            let _ = reply.send(engine.queued(conversation.as_ref()).await);
        }
        EngineCommand::Shutdown => {
            tracing::info!("sync engine shutting down");
            return false;
        }
    }
    true
}

async fn run_pass<S, Q, R>(engine: &mut SyncEngine<S, Q, R>, trigger: &'static str)
where
    S: MessageStore,
    Q: OfflineQueue,
    R: RemoteStore,
{
    match engine.sync_pass().await {
        Ok(report) => log_report(trigger, &report),
        Err(e) => tracing::warn!(trigger, error = %e, "sync pass failed"),
    }
}

fn log_report(trigger: &'static str, report: &SyncReport) {
    if report.attempted() > 0 || !report.abandoned.is_empty() {
        tracing::info!(
            trigger,
            sent = report.sent.len(),
            retrying = report.retrying.len(),
            abandoned = report.abandoned.len(),
            "sync pass complete"
        );
    }
}

/// Arms the retry timer for the next due queue entry. Returns whether it
/// was armed.
async fn schedule_retry<S, Q, R>(
    engine: &SyncEngine<S, Q, R>,
    enabled: bool,
    timer: std::pin::Pin<&mut Sleep>,
) -> bool
where
    S: MessageStore,
    Q: OfflineQueue,
    R: RemoteStore,
{
    if !enabled || !engine.is_online() {
        return false;
    }
    match engine.next_retry_delay().await {
        Ok(Some(delay)) => {
            timer.reset(Instant::now() + delay);
            true
        }
        Ok(None) => false,
        Err(e) => {
            tracing::warn!(error = %e, "could not schedule retry");
            false
        }
    }
}
