//! Remote Message Store interface.
//!
//! The Remote Store is the authoritative, append-only, per-conversation
//! log shared by every participant. This crate only consumes it; the
//! [`RemoteStore`] trait is the seam. Concrete implementations:
//! - [`memory::InMemoryRemote`] — in-process log with real-time snapshots,
//!   used by tests and the `demo` command

pub mod memory;

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;

use msgsync_proto::message::{ConversationId, Message, MessageId, MessageStatus};
use msgsync_proto::record::RemoteMessage;

/// Errors returned by Remote Store calls.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// The store could not be reached (offline, connection reset, 5xx).
    #[error("remote store unavailable: {0}")]
    Unavailable(String),

    /// The call did not complete within the per-call timeout.
    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),

    /// The store refused the request (permission denied, invalid payload).
    #[error("remote store rejected the request: {0}")]
    Rejected(String),
}

impl RemoteError {
    /// Whether retrying the same request later may succeed.
    ///
    /// Transient failures consume retry budget; rejections abandon the
    /// message immediately.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}

/// Full ordered content of one conversation, pushed on every change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Conversation the snapshot describes.
    pub conversation_id: ConversationId,
    /// Every record of the conversation.
    pub messages: Vec<RemoteMessage>,
}

/// Keeps a snapshot subscription alive; dropping it unsubscribes.
pub struct RemoteSubscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl RemoteSubscription {
    /// Wraps the store-specific cancellation action.
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Stops receiving snapshots now.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for RemoteSubscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for RemoteSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSubscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Async access to the authoritative message log.
pub trait RemoteStore: Send + Sync {
    /// Appends a message and returns the record as stored remotely
    /// (server id, server timestamp, `sent` status).
    fn send(
        &self,
        message: &Message,
    ) -> impl Future<Output = Result<RemoteMessage, RemoteError>> + Send;

    /// Streams full snapshots of a conversation into `sink`, starting with
    /// the current content, until the returned subscription is dropped.
    fn subscribe(
        &self,
        conversation: &ConversationId,
        sink: mpsc::UnboundedSender<Snapshot>,
    ) -> impl Future<Output = Result<RemoteSubscription, RemoteError>> + Send;

    /// Updates the status of a stored record (delivery and read receipts).
    fn update_status(
        &self,
        conversation: &ConversationId,
        message_id: &MessageId,
        status: MessageStatus,
    ) -> impl Future<Output = Result<(), RemoteError>> + Send;
}

/// Sends through `remote`, turning an expired `limit` into [`RemoteError::Timeout`].
///
/// # Errors
///
/// Returns the store's error, or `Timeout` if the call took longer than `limit`.
pub async fn send_with_timeout<R: RemoteStore>(
    remote: &R,
    message: &Message,
    limit: Duration,
) -> Result<RemoteMessage, RemoteError> {
    tokio::time::timeout(limit, remote.send(message))
        .await
        .map_err(|_| RemoteError::Timeout(limit))?
}
