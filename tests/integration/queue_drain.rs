//! Integration tests for draining the Offline Queue.
//!
//! Covers FIFO delivery within a conversation, head-of-line holds, backoff,
//! the retry ceiling, terminal rejections, and user-triggered retry.
//!
//! Verification command: `cargo test --test queue_drain`

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use msgsync::clock::{ManualClock, TokioClock};
use msgsync::engine::{EngineConfig, SyncEngine};
use msgsync::network::{NetworkMonitor, NetworkStatus};
use msgsync::remote::Snapshot;
use msgsync::remote::memory::InMemoryRemote;
use msgsync::storage::memory::InMemoryStorage;
use msgsync::storage::{MessageStore, OfflineQueue};
use msgsync::sync::SyncReport;
use msgsync_proto::message::{ConversationId, Message, MessageStatus, SenderId, Timestamp};

// =============================================================================
// Test helpers
// =============================================================================

struct Session {
    engine: SyncEngine<InMemoryStorage, InMemoryStorage, InMemoryRemote>,
    _snapshots: mpsc::UnboundedReceiver<Snapshot>,
    storage: InMemoryStorage,
    remote: InMemoryRemote,
    network: NetworkMonitor,
    clock: ManualClock,
}

impl Session {
    fn offline() -> Self {
        let clock = ManualClock::new(Timestamp::from_millis(1_000_000));
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
            _snapshots: snapshots,
            storage,
            remote,
            network,
            clock,
        }
    }

    /// Sends while offline; each message gets a distinct timestamp.
    async fn queue(&mut self, conversation: &str, content: &str) -> Message {
        let message = self
            .engine
            .send_message(ConversationId::new(conversation), content.into(), None)
            .await
            .unwrap();
        assert_eq!(message.status, MessageStatus::Queued);
        self.clock.advance(1);
        message
    }

    fn go_online(&self) {
        self.network.set_status(NetworkStatus::ONLINE);
    }

    async fn pass(&mut self) -> SyncReport {
        self.engine.sync_pass().await.unwrap()
    }

    async fn status_of(&self, message: &Message) -> MessageStatus {
        self.storage.get(&message.id).await.unwrap().unwrap().status
    }
}

fn arrivals(remote: &InMemoryRemote) -> Vec<String> {
    remote.arrival_order()
}

// =============================================================================
// FIFO
// =============================================================================

#[tokio::test]
async fn offline_sends_arrive_in_send_order() {
    let mut s = Session::offline();
    s.queue("c1", "A").await;
    s.queue("c1", "B").await;

    s.go_online();
    let report = s.engine.on_reconnect().await.unwrap();

    assert_eq!(report.sent.len(), 2);
    assert_eq!(arrivals(&s.remote), vec!["A", "B"]);
    assert!(report.is_drained());
    assert_eq!(OfflineQueue::len(&s.storage).await.unwrap(), 0);
}

#[tokio::test]
async fn failed_head_holds_the_rest_of_its_conversation() {
    let mut s = Session::offline();
    let a = s.queue("c1", "A").await;
    let b = s.queue("c1", "B").await;
    let c = s.queue("c1", "C").await;
    s.go_online();
    s.remote.fail_next_sends(1);

    let report = s.pass().await;
    assert_eq!(report.retrying, vec![a.id.clone()]);
    assert_eq!(report.held, vec![b.id.clone(), c.id.clone()]);
    assert!(arrivals(&s.remote).is_empty());

    // Second failure of A is 2s away.
    assert_eq!(
        s.engine.next_retry_delay().await.unwrap(),
        Some(Duration::from_millis(2000))
    );
    let report = s.pass().await;
    assert_eq!(report.waiting, vec![a.id.clone()]);
    assert_eq!(report.held.len(), 2);

    s.clock.advance(2000);
    let report = s.pass().await;
    assert_eq!(report.sent.len(), 3);
    assert_eq!(arrivals(&s.remote), vec!["A", "B", "C"]);
}

#[tokio::test]
async fn send_after_reconnect_waits_behind_queued_messages() {
    let mut s = Session::offline();
    let a = s.queue("c1", "A").await;
    s.go_online();

    // Connectivity is back but no pass has run yet.
    let b = s
        .engine
        .send_message(ConversationId::new("c1"), "B".into(), None)
        .await
        .unwrap();
    assert_eq!(b.status, MessageStatus::Queued);
    assert!(arrivals(&s.remote).is_empty());

    let report = s.pass().await;
    assert_eq!(report.sent, vec![a.id.clone(), b.id.clone()]);
    assert_eq!(arrivals(&s.remote), vec!["A", "B"]);
}

#[tokio::test]
async fn send_to_another_conversation_is_not_held_back() {
    let mut s = Session::offline();
    s.queue("c1", "A").await;
    s.go_online();

    let x = s
        .engine
        .send_message(ConversationId::new("c2"), "X".into(), None)
        .await
        .unwrap();
    assert_eq!(x.status, MessageStatus::Sent);
    assert_eq!(arrivals(&s.remote), vec!["X"]);
}

#[tokio::test]
async fn user_retry_does_not_overtake_an_earlier_message() {
    let mut s = Session::offline();
    let a = s.queue("c1", "A").await;
    let b = s.queue("c1", "B").await;
    s.go_online();
    s.remote.fail_next_sends(1);

    let report = s.pass().await;
    assert_eq!(report.retrying, vec![a.id.clone()]);
    assert_eq!(report.held, vec![b.id.clone()]);

    // A is still inside its backoff window, so B stays behind it.
    let status = s.engine.retry_message(&b.id).await.unwrap();
    assert_eq!(status, MessageStatus::Queued);
    assert!(arrivals(&s.remote).is_empty());
    assert_eq!(OfflineQueue::len(&s.storage).await.unwrap(), 2);

    // Once A is due, the retried B follows it in the same pass.
    s.clock.advance(2000);
    let status = s.engine.retry_message(&b.id).await.unwrap();
    assert_eq!(status, MessageStatus::Sent);
    assert_eq!(arrivals(&s.remote), vec!["A", "B"]);
}

#[tokio::test]
async fn user_retry_of_the_head_skips_its_backoff() {
    let mut s = Session::offline();
    let a = s.queue("c1", "A").await;
    let b = s.queue("c1", "B").await;
    s.go_online();
    s.remote.fail_next_sends(1);
    s.pass().await;

    let status = s.engine.retry_message(&a.id).await.unwrap();
    assert_eq!(status, MessageStatus::Sent);
    assert_eq!(arrivals(&s.remote), vec!["A"]);
    assert_eq!(s.status_of(&b).await, MessageStatus::Queued);
}

#[tokio::test]
async fn conversations_drain_independently() {
    let mut s = Session::offline();
    let a = s.queue("c1", "A").await;
    let x = s.queue("c2", "X").await;
    s.go_online();
    s.remote.fail_next_sends(1);

    let report = s.pass().await;
    assert_eq!(report.retrying, vec![a.id.clone()]);
    assert_eq!(report.sent, vec![x.id.clone()]);
    assert_eq!(arrivals(&s.remote), vec!["X"]);
    assert_eq!(s.status_of(&a).await, MessageStatus::Queued);
}

// =============================================================================
// Failures
// =============================================================================

#[tokio::test]
async fn rejection_fails_immediately_without_spending_retries() {
    let mut s = Session::offline();
    let a = s.queue("locked", "A").await;
    let b = s.queue("locked", "B").await;
    s.go_online();
    s.remote.reject_conversation(&ConversationId::new("locked"));

    let report = s.pass().await;
    assert_eq!(report.abandoned, vec![a.id.clone(), b.id.clone()]);
    assert_eq!(OfflineQueue::len(&s.storage).await.unwrap(), 0);

    let row = s.storage.get(&a.id).await.unwrap().unwrap();
    assert_eq!(row.status, MessageStatus::Failed);
    assert_eq!(row.retry_count, 0);
    assert!(row.error_reason.unwrap().contains("permission denied"));
}

#[tokio::test]
async fn ceiling_stops_automatic_retry_until_the_user_asks() {
    let mut s = Session::offline();
    let a = s.queue("c1", "A").await;
    s.go_online();
    s.remote.set_reachable(false);

    let mut abandoned = Vec::new();
    for _ in 0..3 {
        let report = s.pass().await;
        abandoned.extend(report.abandoned);
        s.clock.advance(30_000);
    }
    assert_eq!(abandoned, vec![a.id.clone()]);

    let row = s.storage.get(&a.id).await.unwrap().unwrap();
    assert_eq!(row.status, MessageStatus::Failed);
    assert_eq!(row.retry_count, 3);

    // Nothing is retried automatically any more.
    s.remote.set_reachable(true);
    let report = s.pass().await;
    assert_eq!(report.attempted(), 0);
    assert_eq!(s.engine.next_retry_delay().await.unwrap(), None);
    assert!(arrivals(&s.remote).is_empty());

    let status = s.engine.retry_message(&a.id).await.unwrap();
    assert_eq!(status, MessageStatus::Sent);
    assert_eq!(arrivals(&s.remote), vec!["A"]);
}

#[tokio::test]
async fn user_retry_while_offline_only_requeues() {
    let mut s = Session::offline();
    let a = s.queue("locked", "A").await;
    s.go_online();
    s.remote.reject_conversation(&ConversationId::new("locked"));
    s.pass().await;
    assert_eq!(s.status_of(&a).await, MessageStatus::Failed);

    s.network.set_status(NetworkStatus::OFFLINE);
    let status = s.engine.retry_message(&a.id).await.unwrap();
    assert_eq!(status, MessageStatus::Queued);
    let entry = s.storage.entry(&a.id).await.unwrap().unwrap();
    assert_eq!(entry.retry_count, 0);
    assert!(arrivals(&s.remote).is_empty());
}

#[tokio::test]
async fn backoff_grows_between_failures() {
    let mut s = Session::offline();
    s.queue("c1", "A").await;
    s.go_online();
    s.remote.set_reachable(false);

    s.pass().await;
    assert_eq!(
        s.engine.next_retry_delay().await.unwrap(),
        Some(Duration::from_millis(2000))
    );
    s.clock.advance(2000);
    s.pass().await;
    assert_eq!(
        s.engine.next_retry_delay().await.unwrap(),
        Some(Duration::from_millis(4000))
    );
}

#[tokio::test(start_paused = true)]
async fn slow_store_times_out_as_transient() {
    let storage = InMemoryStorage::new();
    let remote = InMemoryRemote::new();
    let network = NetworkMonitor::new(NetworkStatus::OFFLINE);
    let mut config = EngineConfig::new(SenderId::new("U"));
    config.send_timeout = Duration::from_secs(2);
    let (mut engine, _snapshots) = SyncEngine::new(
        config,
        storage.clone(),
        storage.clone(),
        remote.clone(),
        network.clone(),
        Arc::new(TokioClock::default()),
    );

    let message = engine
        .send_message(ConversationId::new("c1"), "A".into(), None)
        .await
        .unwrap();
    network.set_status(NetworkStatus::ONLINE);
    remote.set_latency(Some(Duration::from_secs(5)));

    let report = engine.sync_pass().await.unwrap();
    assert_eq!(report.retrying, vec![message.id.clone()]);
    let entry = storage.entry(&message.id).await.unwrap().unwrap();
    assert_eq!(entry.retry_count, 1);
    assert!(entry.error.unwrap().contains("timed out"));
    assert!(remote.log(&ConversationId::new("c1")).is_empty());
}
