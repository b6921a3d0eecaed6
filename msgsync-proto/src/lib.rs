//! Shared data model for the `msgsync` offline-first synchronization engine.

pub mod message;
pub mod queue;
pub mod record;
