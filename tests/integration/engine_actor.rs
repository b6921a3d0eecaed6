//! Integration tests for the engine task and its handle.
//!
//! Time is paused, and both the engine and the in-memory store read a
//! [`TokioClock`], so debounce and backoff timers advance deterministically.
//!
//! Verification command: `cargo test --test engine_actor`

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use msgsync::clock::{Clock, TokioClock};
use msgsync::engine::actor::{self, EngineHandle};
use msgsync::engine::{EngineConfig, EngineError, SyncEngine};
use msgsync::network::{NetworkMonitor, NetworkStatus};
use msgsync::remote::memory::InMemoryRemote;
use msgsync::storage::OfflineQueue;
use msgsync::storage::memory::InMemoryStorage;
use msgsync_proto::message::{ConversationId, Message, MessageId, MessageStatus, SenderId};
use msgsync_proto::record::MessageRecord;

// =============================================================================
// Test helpers
// =============================================================================

struct Running {
    handle: EngineHandle,
    task: JoinHandle<()>,
    storage: InMemoryStorage,
    remote: InMemoryRemote,
    network: NetworkMonitor,
}

fn start_with(storage: InMemoryStorage, remote: InMemoryRemote, initial: NetworkStatus) -> Running {
    let network = NetworkMonitor::new(initial);
    let (engine, snapshots) = SyncEngine::new(
        EngineConfig::new(SenderId::new("U")),
        storage.clone(),
        storage.clone(),
        remote.clone(),
        network.clone(),
        Arc::new(TokioClock::default()),
    );
    let (handle, task) = actor::spawn(engine, snapshots);
    Running {
        handle,
        task,
        storage,
        remote,
        network,
    }
}

fn start(initial: NetworkStatus) -> Running {
    let remote = InMemoryRemote::with_clock(Arc::new(TokioClock::default()));
    start_with(InMemoryStorage::new(), remote, initial)
}

fn general() -> ConversationId {
    ConversationId::new("general")
}

async fn converged(view: &mut watch::Receiver<Vec<MessageRecord>>, count: usize) -> Vec<MessageRecord> {
    timeout(
        Duration::from_secs(60),
        view.wait_for(|records| {
            records.len() == count && records.iter().all(|r| !r.is_optimistic())
        }),
    )
    .await
    .unwrap()
    .unwrap()
    .clone()
}

// =============================================================================
// Reconnect debounce
// =============================================================================

#[tokio::test(start_paused = true)]
async fn reconnect_delivers_after_connectivity_settles() {
    let r = start(NetworkStatus::OFFLINE);
    let mut view = r.handle.watch(general()).await.unwrap();

    let queued = r
        .handle
        .send_message(general(), "Hello", None)
        .await
        .unwrap();
    assert_eq!(queued.status, MessageStatus::Queued);
    assert_eq!(view.borrow().len(), 1);
    assert_eq!(view.borrow()[0].status(), MessageStatus::Queued);

    r.network.set_status(NetworkStatus::ONLINE);
    sleep(Duration::from_millis(400)).await;
    assert!(r.remote.log(&general()).is_empty(), "debounce not yet elapsed");

    sleep(Duration::from_millis(200)).await;
    assert_eq!(r.remote.arrival_order(), vec!["Hello"]);

    let shown = converged(&mut view, 1).await;
    assert_eq!(shown[0].status(), MessageStatus::Sent);
    assert_eq!(r.storage.len().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn flapping_connectivity_does_not_trigger_sync() {
    let r = start(NetworkStatus::OFFLINE);
    r.handle
        .send_message(general(), "A", None)
        .await
        .unwrap();

    for _ in 0..5 {
        r.network.set_status(NetworkStatus::ONLINE);
        sleep(Duration::from_millis(100)).await;
        r.network.set_status(NetworkStatus::OFFLINE);
        sleep(Duration::from_millis(100)).await;
    }
    sleep(Duration::from_secs(5)).await;
    assert!(r.remote.log(&general()).is_empty());
    assert_eq!(r.storage.len().await.unwrap(), 1);

    r.network.set_status(NetworkStatus::ONLINE);
    sleep(Duration::from_secs(1)).await;
    assert_eq!(r.remote.arrival_order(), vec!["A"]);
}

#[tokio::test(start_paused = true)]
async fn send_while_connectivity_settles_keeps_conversation_order() {
    let r = start(NetworkStatus::OFFLINE);
    r.handle
        .send_message(general(), "A", None)
        .await
        .unwrap();

    r.network.set_status(NetworkStatus::ONLINE);
    sleep(Duration::from_millis(100)).await;
    let b = r
        .handle
        .send_message(general(), "B", None)
        .await
        .unwrap();
    assert_eq!(b.status, MessageStatus::Queued);
    assert!(r.remote.log(&general()).is_empty());

    sleep(Duration::from_secs(1)).await;
    assert_eq!(r.remote.arrival_order(), vec!["A", "B"]);
}

#[tokio::test(start_paused = true)]
async fn captive_portal_counts_as_offline() {
    let r = start(NetworkStatus::OFFLINE);
    r.handle
        .send_message(general(), "A", None)
        .await
        .unwrap();

    r.network.set_status(NetworkStatus {
        connected: true,
        reachable: false,
    });
    sleep(Duration::from_secs(5)).await;
    assert!(r.remote.log(&general()).is_empty());
}

// =============================================================================
// Retry timer
// =============================================================================

#[tokio::test(start_paused = true)]
async fn failed_direct_send_is_retried_after_backoff() {
    let r = start(NetworkStatus::ONLINE);
    r.remote.fail_next_sends(1);

    let accepted = r
        .handle
        .send_message(general(), "A", None)
        .await
        .unwrap();
    assert_eq!(accepted.status, MessageStatus::Sending);

    sleep(Duration::from_millis(10)).await;
    let queued = r.handle.queued(None).await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].retry_count, 1);

    sleep(Duration::from_millis(1900)).await;
    assert!(r.remote.log(&general()).is_empty());

    sleep(Duration::from_millis(200)).await;
    assert_eq!(r.remote.arrival_order(), vec!["A"]);
    assert!(r.handle.queued(None).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn unreachable_store_gives_up_after_three_attempts() {
    let r = start(NetworkStatus::ONLINE);
    r.remote.set_reachable(false);
    let mut view = r.handle.watch(general()).await.unwrap();

    let accepted = r
        .handle
        .send_message(general(), "A", None)
        .await
        .unwrap();

    timeout(
        Duration::from_secs(120),
        view.wait_for(|records| {
            records
                .first()
                .is_some_and(|r| r.status() == MessageStatus::Failed)
        }),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(r.handle.queued(None).await.unwrap().is_empty());

    r.remote.set_reachable(true);
    let status = r.handle.retry_message(accepted.id.clone()).await.unwrap();
    assert_eq!(status, MessageStatus::Sent);
}

// =============================================================================
// Startup and snapshots
// =============================================================================

#[tokio::test(start_paused = true)]
async fn queue_left_by_a_previous_session_drains_on_start() {
    let storage = InMemoryStorage::new();
    let remote = InMemoryRemote::with_clock(Arc::new(TokioClock::default()));
    {
        let (mut engine, _snapshots) = SyncEngine::new(
            EngineConfig::new(SenderId::new("U")),
            storage.clone(),
            storage.clone(),
            remote.clone(),
            NetworkMonitor::new(NetworkStatus::OFFLINE),
            Arc::new(TokioClock::default()),
        );
        engine
            .send_message(general(), "left over".into(), None)
            .await
            .unwrap();
    }

    let r = start_with(storage, remote, NetworkStatus::ONLINE);
    sleep(Duration::from_millis(10)).await;
    assert_eq!(r.remote.arrival_order(), vec!["left over"]);
    assert_eq!(r.storage.len().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn remote_changes_are_pushed_into_the_view() {
    let r = start(NetworkStatus::ONLINE);
    let mut view = r.handle.watch(general()).await.unwrap();

    r.remote.inject(Message {
        id: MessageId::new("B1"),
        conversation_id: general(),
        sender_id: SenderId::new("V"),
        content: "from someone else".into(),
        attachment_ref: None,
        timestamp: TokioClock::default().now(),
        status: MessageStatus::Delivered,
        detected_language: None,
        retry_count: 0,
        last_retry_at: None,
        error_reason: None,
        client_id: None,
    });

    let shown = converged(&mut view, 1).await;
    assert_eq!(shown[0].content(), "from someone else");

    let updated = r
        .handle
        .mark_as_read(general(), vec![MessageId::new("B1")])
        .await
        .unwrap();
    assert_eq!(updated, 1);
    assert_eq!(view.borrow()[0].status(), MessageStatus::Read);
    assert_eq!(r.remote.log(&general())[0].status, MessageStatus::Read);
}

#[tokio::test(start_paused = true)]
async fn unwatch_stops_updates() {
    let r = start(NetworkStatus::ONLINE);
    let view = r.handle.watch(general()).await.unwrap();
    r.handle.unwatch(general()).await.unwrap();
    r.handle.sync_now().await.unwrap();

    assert_eq!(r.remote.subscriber_count(&general()), 0);
    assert!(view.has_changed().is_err(), "view sender dropped");
}

// =============================================================================
// Handle
// =============================================================================

#[tokio::test(start_paused = true)]
async fn sync_now_while_offline_is_a_no_op() {
    let r = start(NetworkStatus::OFFLINE);
    r.handle
        .send_message(general(), "A", None)
        .await
        .unwrap();
    let report = r.handle.sync_now().await.unwrap();
    assert_eq!(report.attempted(), 0);
    assert_eq!(r.handle.queued(Some(general())).await.unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn retry_of_unknown_id_is_not_found() {
    let r = start(NetworkStatus::ONLINE);
    let result = r
        .handle
        .retry_message(MessageId::new("tmp-unknown"))
        .await;
    assert!(matches!(result, Err(EngineError::NotFound(_))));
}

#[tokio::test(start_paused = true)]
async fn shutdown_closes_the_handle() {
    let r = start(NetworkStatus::ONLINE);
    let other = r.handle.clone();
    r.handle.shutdown().await;
    r.task.await.unwrap();

    assert!(matches!(
        other.send_message(general(), "late", None).await,
        Err(EngineError::Closed)
    ));
}
