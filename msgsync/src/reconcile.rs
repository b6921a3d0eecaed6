//! Reconciliation Engine: merges optimistic entries with a remote snapshot.
//!
//! [`reconcile`] is a pure function. It is re-run whenever the Optimistic
//! Buffer or the latest snapshot of a conversation changes, and returns both
//! the merged view and the optimistic entries the snapshot has made
//! redundant. Applying the retirements is up to the caller.
//!
//! Matching an optimistic entry to a remote record:
//!
//! 1. Exact: the record carries the entry's [`ClientId`], or its id is the
//!    server id learned from a direct send acknowledgment.
//! 2. Fuzzy, only for records without a client id: same sender, same
//!    content, timestamps less than the match window apart. The entry
//!    closest in time to the record wins.
//!
//! A remote record retires at most one optimistic entry, and exact matches
//! are resolved before any fuzzy match is considered. Records identified by
//! the fuzzy rule are reported in [`Reconciliation::identified`]; callers
//! stamp them with the matched client id so they cannot be matched again
//! once the entry they retired is gone.
//!
//! [`ClientId`]: msgsync_proto::message::ClientId

use std::collections::HashSet;

use msgsync_proto::message::{ClientId, MessageId};
use msgsync_proto::record::{MessageRecord, OptimisticMessage, RemoteMessage};

/// Default fuzzy match window in milliseconds.
pub const DEFAULT_MATCH_WINDOW_MS: u64 = 5000;

/// Result of one reconciliation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    /// Deduplicated view, ascending by timestamp.
    pub merged: Vec<MessageRecord>,
    /// Temporary ids of optimistic entries matched by a remote record.
    pub retired: Vec<MessageId>,
    /// Remote records matched by the fuzzy rule, with the client id of the
    /// entry each one retired.
    pub identified: Vec<(MessageId, ClientId)>,
}

fn exact_match(entry: &OptimisticMessage, record: &RemoteMessage) -> bool {
    record.message().client_id == Some(entry.client_id())
        || entry.confirmed_id() == Some(record.id())
}

fn fuzzy_match(entry: &OptimisticMessage, record: &RemoteMessage, window_ms: u64) -> bool {
    let local = entry.message();
    let remote = record.message();
    remote.client_id.is_none()
        && remote.sender_id == local.sender_id
        && remote.content == local.content
        && remote.timestamp.abs_diff(local.timestamp) < window_ms
}

/// Merges `optimistic` entries with a remote `snapshot` of one conversation.
#[must_use]
pub fn reconcile(
    optimistic: &[OptimisticMessage],
    snapshot: &[RemoteMessage],
    match_window_ms: u64,
) -> Reconciliation {
    let mut claimed = vec![false; snapshot.len()];
    let mut matched = vec![false; optimistic.len()];

    for (i, entry) in optimistic.iter().enumerate() {
        if let Some(j) =
            (0..snapshot.len()).find(|&j| !claimed[j] && exact_match(entry, &snapshot[j]))
        {
            claimed[j] = true;
            matched[i] = true;
        }
    }

    let mut identified = Vec::new();
    for (j, record) in snapshot.iter().enumerate() {
        if claimed[j] {
            continue;
        }
        let candidate = (0..optimistic.len())
            .filter(|&i| !matched[i] && fuzzy_match(&optimistic[i], record, match_window_ms))
            .min_by_key(|&i| {
                record
                    .message()
                    .timestamp
                    .abs_diff(optimistic[i].message().timestamp)
            });
        if let Some(i) = candidate {
            claimed[j] = true;
            matched[i] = true;
            identified.push((record.id().clone(), optimistic[i].client_id()));
        }
    }

    let retired: Vec<MessageId> = optimistic
        .iter()
        .zip(&matched)
        .filter(|(_, hit)| **hit)
        .map(|(entry, _)| entry.id().clone())
        .collect();

    let mut merged: Vec<MessageRecord> = optimistic
        .iter()
        .zip(&matched)
        .filter(|(_, hit)| !**hit)
        .map(|(entry, _)| MessageRecord::Optimistic(entry.clone()))
        .chain(snapshot.iter().cloned().map(MessageRecord::Remote))
        .collect();

    let mut seen = HashSet::new();
    merged.retain(|record| record.id().is_none_or(|id| seen.insert(id.clone())));
    merged.sort_by_key(MessageRecord::timestamp);

    Reconciliation {
        merged,
        retired,
        identified,
    }
}
