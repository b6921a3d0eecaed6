//! Integration tests for sending while offline.
//!
//! A message sent without connectivity must be visible as `queued` at once,
//! be delivered by the first sync pass after reconnect, and disappear from
//! the optimistic layer once the remote snapshot carries its record.
//!
//! Verification command: `cargo test --test offline_send`

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use msgsync::clock::{Clock, ManualClock};
use msgsync::engine::{EngineConfig, EngineError, SyncEngine};
use msgsync::network::{NetworkMonitor, NetworkStatus};
use msgsync::remote::Snapshot;
use msgsync::remote::memory::InMemoryRemote;
use msgsync::storage::memory::InMemoryStorage;
use msgsync::storage::{MessageStore, OfflineQueue};
use msgsync_proto::message::{
    ConversationId, MAX_MESSAGE_SIZE, Message, MessageId, MessageStatus, SenderId, Timestamp,
    ValidationError,
};
use msgsync_proto::record::MessageRecord;

// =============================================================================
// Test helpers
// =============================================================================

struct Session {
    engine: SyncEngine<InMemoryStorage, InMemoryStorage, InMemoryRemote>,
    snapshots: mpsc::UnboundedReceiver<Snapshot>,
    storage: InMemoryStorage,
    remote: InMemoryRemote,
    network: NetworkMonitor,
    clock: ManualClock,
}

impl Session {
    fn offline() -> Self {
        let clock = ManualClock::new(Timestamp::from_millis(1_700_000_000_000));
        let storage = InMemoryStorage::new();
        let remote = InMemoryRemote::with_clock(Arc::new(clock.clone()));
        let network = NetworkMonitor::new(NetworkStatus::OFFLINE);
        let (engine, snapshots) = SyncEngine::new(
            EngineConfig::new(SenderId::new("U")),
            storage.clone(),
            storage.clone(),
            remote.clone(),
            network.clone(),
            Arc::new(clock.clone()),
        );
        Self {
            engine,
            snapshots,
            storage,
            remote,
            network,
            clock,
        }
    }

    /// Feeds every pending remote snapshot into the engine.
    async fn pump(&mut self) {
        while let Ok(snapshot) = self.snapshots.try_recv() {
            self.engine.apply_snapshot(snapshot).await.unwrap();
        }
    }

    async fn reconnect(&mut self) {
        self.network.set_status(NetworkStatus::ONLINE);
        self.engine.on_reconnect().await.unwrap();
        self.pump().await;
    }
}

fn general() -> ConversationId {
    ConversationId::new("general")
}

fn current(view: &watch::Receiver<Vec<MessageRecord>>) -> Vec<MessageRecord> {
    view.borrow().clone()
}

// =============================================================================
// Offline send and reconciliation
// =============================================================================

#[tokio::test]
async fn offline_message_is_queued_then_delivered_and_reconciled() {
    let mut s = Session::offline();
    let view = s.engine.watch(&general()).await.unwrap();
    s.pump().await;

    let sent = s
        .engine
        .send_message(general(), "Hello".into(), None)
        .await
        .unwrap();
    assert_eq!(sent.status, MessageStatus::Queued);
    assert!(sent.id.is_temporary());

    let shown = current(&view);
    assert_eq!(shown.len(), 1);
    assert!(shown[0].is_optimistic());
    assert_eq!(shown[0].status(), MessageStatus::Queued);
    assert_eq!(OfflineQueue::len(&s.storage).await.unwrap(), 1);
    assert!(s.remote.log(&general()).is_empty());

    s.clock.advance(3_000);
    s.reconnect().await;

    let shown = current(&view);
    assert_eq!(shown.len(), 1, "exactly one record after convergence");
    assert!(!shown[0].is_optimistic());
    assert_eq!(shown[0].status(), MessageStatus::Sent);
    assert_eq!(shown[0].content(), "Hello");
    assert_eq!(OfflineQueue::len(&s.storage).await.unwrap(), 0);

    // The temporary row was replaced by the remote record.
    assert!(s.storage.get(&sent.id).await.unwrap().is_none());
    assert!(s.storage.list_unconfirmed().await.unwrap().is_empty());
    assert_eq!(s.storage.list(&general(), 10, 0).await.unwrap().len(), 1);
}

#[tokio::test]
async fn lost_acknowledgment_is_reconciled_and_not_resent() {
    let mut s = Session::offline();
    let view = s.engine.watch(&general()).await.unwrap();

    let sent = s
        .engine
        .send_message(general(), "hi".into(), None)
        .await
        .unwrap();

    // The store accepted an earlier attempt but the reply never arrived,
    // and it keeps no client ids.
    s.remote.inject(Message {
        id: MessageId::new("R1"),
        client_id: None,
        status: MessageStatus::Sent,
        timestamp: Timestamp::from_millis(sent.timestamp.as_millis() + 2),
        ..sent.clone()
    });
    // The snapshot lands before connectivity is reported back.
    s.pump().await;
    assert_eq!(OfflineQueue::len(&s.storage).await.unwrap(), 0);
    s.reconnect().await;

    let shown = current(&view);
    assert_eq!(shown.len(), 1);
    assert_eq!(shown[0].id(), Some(&MessageId::new("R1")));
    assert!(!shown[0].is_optimistic());
    assert_eq!(OfflineQueue::len(&s.storage).await.unwrap(), 0);
    assert_eq!(s.remote.log(&general()).len(), 1, "no duplicate send");
}

#[tokio::test]
async fn repeated_content_is_not_swallowed_by_one_legacy_record() {
    let mut s = Session::offline();
    let view = s.engine.watch(&general()).await.unwrap();

    let first = s
        .engine
        .send_message(general(), "ok".into(), None)
        .await
        .unwrap();
    s.clock.advance(1_000);
    let second = s
        .engine
        .send_message(general(), "ok".into(), None)
        .await
        .unwrap();

    s.remote.inject(Message {
        id: MessageId::new("R1"),
        client_id: None,
        status: MessageStatus::Sent,
        timestamp: Timestamp::from_millis(second.timestamp.as_millis() + 1),
        ..second.clone()
    });
    s.pump().await;
    assert!(s.storage.entry(&second.id).await.unwrap().is_none());

    // Another snapshot re-runs reconciliation with only the first entry left.
    s.remote.inject(Message {
        id: MessageId::new("B1"),
        conversation_id: general(),
        sender_id: SenderId::new("V"),
        content: "unrelated".into(),
        attachment_ref: None,
        timestamp: s.clock.now(),
        status: MessageStatus::Delivered,
        detected_language: None,
        retry_count: 0,
        last_retry_at: None,
        error_reason: None,
        client_id: None,
    });
    s.pump().await;

    let shown = current(&view);
    assert_eq!(shown.len(), 3);
    assert!(shown.iter().any(|r| r.id() == Some(&first.id)));
    assert!(s.storage.entry(&first.id).await.unwrap().is_some());
    let cached = s.storage.get(&MessageId::new("R1")).await.unwrap().unwrap();
    assert_eq!(cached.client_id, second.client_id);
}

#[tokio::test]
async fn acknowledged_send_reconciles_even_outside_the_match_window() {
    let mut s = Session::offline();
    s.remote.strip_client_ids(true);
    let view = s.engine.watch(&general()).await.unwrap();

    s.engine
        .send_message(general(), "late".into(), None)
        .await
        .unwrap();
    // Far beyond the fuzzy window: only the acknowledged id can match.
    s.clock.advance(60_000);
    s.reconnect().await;

    let shown = current(&view);
    assert_eq!(shown.len(), 1);
    assert!(!shown[0].is_optimistic());
}

#[tokio::test]
async fn view_stays_ordered_with_messages_from_others() {
    let mut s = Session::offline();
    let view = s.engine.watch(&general()).await.unwrap();

    s.engine
        .send_message(general(), "mine".into(), None)
        .await
        .unwrap();
    s.remote.inject(Message {
        id: MessageId::new("B1"),
        conversation_id: general(),
        sender_id: SenderId::new("V"),
        content: "earlier".into(),
        attachment_ref: None,
        timestamp: Timestamp::from_millis(1_600_000_000_000),
        status: MessageStatus::Delivered,
        detected_language: None,
        retry_count: 0,
        last_retry_at: None,
        error_reason: None,
        client_id: None,
    });

    s.reconnect().await;
    let shown = current(&view);
    assert_eq!(shown.len(), 2);
    assert!(
        shown
            .windows(2)
            .all(|pair| pair[0].timestamp() <= pair[1].timestamp())
    );
    assert_eq!(shown[0].content(), "earlier");
    assert_eq!(shown[1].content(), "mine");
}

// =============================================================================
// Validation
// =============================================================================

#[tokio::test]
async fn empty_content_is_rejected_before_queueing() {
    let mut s = Session::offline();
    let err = s
        .engine
        .send_message(general(), "   ".into(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(ValidationError::Empty)));
    assert_eq!(OfflineQueue::len(&s.storage).await.unwrap(), 0);
    assert!(s.storage.list(&general(), 10, 0).await.unwrap().is_empty());
}

#[tokio::test]
async fn oversized_content_is_rejected() {
    let mut s = Session::offline();
    let err = s
        .engine
        .send_message(general(), "x".repeat(MAX_MESSAGE_SIZE + 1), None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Validation(ValidationError::TooLarge { .. })
    ));
}

#[tokio::test]
async fn attachment_only_message_is_accepted() {
    let mut s = Session::offline();
    let sent = s
        .engine
        .send_message(general(), String::new(), Some("blob://photo-1".into()))
        .await
        .unwrap();
    assert_eq!(sent.status, MessageStatus::Queued);
    assert_eq!(sent.attachment_ref.as_deref(), Some("blob://photo-1"));

    s.reconnect().await;
    let delivered = s.remote.log(&general());
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].attachment_ref.as_deref(), Some("blob://photo-1"));
}

#[tokio::test]
async fn offline_view_works_without_a_remote_subscription() {
    let mut s = Session::offline();
    s.remote.set_reachable(false);
    let view = s.engine.watch(&general()).await.unwrap();
    assert_eq!(s.remote.subscriber_count(&general()), 0);

    s.engine
        .send_message(general(), "Hello".into(), None)
        .await
        .unwrap();
    assert_eq!(current(&view).len(), 1);

    s.remote.set_reachable(true);
    s.reconnect().await;
    assert_eq!(s.remote.subscriber_count(&general()), 1);
    let shown = current(&view);
    assert_eq!(shown.len(), 1);
    assert!(!shown[0].is_optimistic());
}
