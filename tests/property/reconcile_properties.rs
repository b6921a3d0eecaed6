//! Property-based tests for merging optimistic entries with remote snapshots.
//!
//! Uses proptest to verify:
//! 1. The merged view is ordered by timestamp and has no duplicate ids.
//! 2. Each remote record retires at most one entry, and every entry is
//!    either retired or still shown.
//! 3. A record echoing an entry's client id always retires that entry.
//! 4. An empty snapshot retires nothing.
//! 5. Once identified records are stamped, a second run retires nothing more.

use std::collections::HashSet;

use proptest::prelude::*;

use msgsync::reconcile::{DEFAULT_MATCH_WINDOW_MS, reconcile};
use msgsync_proto::message::{ConversationId, Message, MessageId, MessageStatus, SenderId, Timestamp};
use msgsync_proto::record::{Draft, OptimisticMessage, RemoteMessage};

// --- Strategies ---

/// Small alphabets so that fuzzy collisions actually happen.
fn arb_sender() -> impl Strategy<Value = String> {
    prop_oneof![Just("U".to_string()), Just("V".to_string())]
}

fn arb_content() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("ok".to_string()),
        Just("hi".to_string()),
        Just("on my way".to_string()),
    ]
}

fn arb_timestamp() -> impl Strategy<Value = u64> {
    1_000_000u64..1_020_000
}

/// Strategy for generating optimistic entries of one conversation.
fn arb_optimistic() -> impl Strategy<Value = Vec<OptimisticMessage>> {
    prop::collection::vec((arb_sender(), arb_content(), arb_timestamp()), 0..8).prop_map(
        |specs| {
            specs
                .into_iter()
                .map(|(sender, content, at)| {
                    Draft {
                        conversation_id: conversation(),
                        sender_id: SenderId::new(sender),
                        content,
                        attachment_ref: None,
                        created_at: Timestamp::from_millis(at),
                    }
                    .into_optimistic()
                })
                .collect()
        },
    )
}

/// How a remote record relates to the optimistic entries.
#[derive(Debug, Clone)]
enum RecordSpec {
    /// Written by a store that keeps no client ids.
    Legacy {
        sender: String,
        content: String,
        at: u64,
    },
    /// Carries the client id of the entry at `index` (modulo entry count).
    Echo { index: usize, delay: u64 },
}

fn arb_record_spec() -> impl Strategy<Value = RecordSpec> {
    prop_oneof![
        (arb_sender(), arb_content(), arb_timestamp())
            .prop_map(|(sender, content, at)| RecordSpec::Legacy { sender, content, at }),
        (any::<usize>(), 0u64..60_000).prop_map(|(index, delay)| RecordSpec::Echo { index, delay }),
    ]
}

fn arb_snapshot_specs() -> impl Strategy<Value = Vec<RecordSpec>> {
    prop::collection::vec(arb_record_spec(), 0..8)
}

// --- Helpers ---

fn conversation() -> ConversationId {
    ConversationId::new("c1")
}

fn remote(id: &str, sender: &str, content: &str, at: u64) -> Message {
    Message {
        id: MessageId::new(id),
        conversation_id: conversation(),
        sender_id: SenderId::new(sender),
        content: content.to_string(),
        attachment_ref: None,
        timestamp: Timestamp::from_millis(at),
        status: MessageStatus::Sent,
        detected_language: None,
        retry_count: 0,
        last_retry_at: None,
        error_reason: None,
        client_id: None,
    }
}

/// Builds the snapshot; echoes are skipped when there are no entries.
fn build_snapshot(specs: &[RecordSpec], optimistic: &[OptimisticMessage]) -> Vec<RemoteMessage> {
    specs
        .iter()
        .enumerate()
        .filter_map(|(j, spec)| {
            let id = format!("R{j}");
            let message = match spec {
                RecordSpec::Legacy {
                    sender,
                    content,
                    at,
                } => remote(&id, sender, content, *at),
                RecordSpec::Echo { index, delay } => {
                    if optimistic.is_empty() {
                        return None;
                    }
                    let entry = optimistic[index % optimistic.len()].message();
                    Message {
                        client_id: entry.client_id,
                        ..remote(
                            &id,
                            entry.sender_id.as_str(),
                            &entry.content,
                            entry.timestamp.as_millis() + delay,
                        )
                    }
                }
            };
            Some(RemoteMessage::new(message))
        })
        .collect()
}

// --- Property tests ---

proptest! {
    #[test]
    fn merged_view_is_ordered_and_unique(
        optimistic in arb_optimistic(),
        specs in arb_snapshot_specs(),
    ) {
        let snapshot = build_snapshot(&specs, &optimistic);
        let view = reconcile(&optimistic, &snapshot, DEFAULT_MATCH_WINDOW_MS);

        prop_assert!(view.merged.windows(2).all(|pair| pair[0].timestamp() <= pair[1].timestamp()));
        let mut seen = HashSet::new();
        for record in &view.merged {
            if let Some(id) = record.id() {
                prop_assert!(seen.insert(id.clone()), "duplicate id {}", id);
            }
        }
    }

    #[test]
    fn every_entry_is_retired_or_shown(
        optimistic in arb_optimistic(),
        specs in arb_snapshot_specs(),
    ) {
        let snapshot = build_snapshot(&specs, &optimistic);
        let view = reconcile(&optimistic, &snapshot, DEFAULT_MATCH_WINDOW_MS);

        prop_assert!(view.retired.len() <= snapshot.len());
        prop_assert!(view.retired.len() <= optimistic.len());
        prop_assert!(view.identified.len() <= view.retired.len());
        prop_assert_eq!(
            view.merged.len(),
            optimistic.len() - view.retired.len() + snapshot.len()
        );

        let retired: HashSet<&MessageId> = view.retired.iter().collect();
        for entry in &optimistic {
            let shown = view.merged.iter().any(|r| r.id() == Some(entry.id()));
            prop_assert!(shown != retired.contains(entry.id()));
        }
    }

    #[test]
    fn echoed_client_id_always_retires_its_entry(
        optimistic in arb_optimistic(),
        specs in arb_snapshot_specs(),
    ) {
        let snapshot = build_snapshot(&specs, &optimistic);
        let view = reconcile(&optimistic, &snapshot, DEFAULT_MATCH_WINDOW_MS);

        for record in &snapshot {
            let Some(client_id) = record.message().client_id else {
                continue;
            };
            let Some(entry) = optimistic.iter().find(|e| e.client_id() == client_id) else {
                continue;
            };
            prop_assert!(view.retired.contains(entry.id()));
        }
    }

    #[test]
    fn empty_snapshot_retires_nothing(optimistic in arb_optimistic()) {
        let view = reconcile(&optimistic, &[], DEFAULT_MATCH_WINDOW_MS);
        prop_assert!(view.retired.is_empty());
        prop_assert_eq!(view.merged.len(), optimistic.len());
    }

    #[test]
    fn stamped_snapshot_is_settled(
        optimistic in arb_optimistic(),
        specs in arb_snapshot_specs(),
    ) {
        let snapshot = build_snapshot(&specs, &optimistic);
        let first = reconcile(&optimistic, &snapshot, DEFAULT_MATCH_WINDOW_MS);

        let remaining: Vec<OptimisticMessage> = optimistic
            .iter()
            .filter(|entry| !first.retired.contains(entry.id()))
            .cloned()
            .collect();
        let stamped: Vec<RemoteMessage> = snapshot
            .iter()
            .map(|record| {
                match first.identified.iter().find(|(id, _)| id == record.id()) {
                    Some((_, client_id)) => RemoteMessage::new(Message {
                        client_id: Some(*client_id),
                        ..record.message().clone()
                    }),
                    None => record.clone(),
                }
            })
            .collect();

        let second = reconcile(&remaining, &stamped, DEFAULT_MATCH_WINDOW_MS);
        prop_assert!(second.retired.is_empty());
        prop_assert_eq!(second.merged.len(), first.merged.len());
    }
}
