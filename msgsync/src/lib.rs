//! `msgsync` — offline-first message synchronization engine.
//!
//! Messages are persisted locally first, shown optimistically, queued while
//! offline, delivered in order once connectivity returns, and reconciled
//! against the authoritative remote log.

pub mod buffer;
pub mod clock;
pub mod config;
pub mod engine;
pub mod network;
pub mod reconcile;
pub mod remote;
pub mod storage;
pub mod sync;
