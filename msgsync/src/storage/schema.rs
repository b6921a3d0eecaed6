//! SQLite schema for the local store and the offline queue.

/// Current schema version written to `schema_version`.
pub const SCHEMA_VERSION: i64 = 1;

/// Creates every table and index. Safe to run on an existing database.
pub const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    id                TEXT PRIMARY KEY NOT NULL,
    conversation_id   TEXT NOT NULL,
    sender_id         TEXT NOT NULL,
    content           TEXT NOT NULL,
    attachment_ref    TEXT,
    timestamp         INTEGER NOT NULL,
    status            TEXT NOT NULL,
    detected_language TEXT,
    retry_count       INTEGER NOT NULL DEFAULT 0,
    last_retry_at     INTEGER,
    error_reason      TEXT,
    client_id         TEXT
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation
    ON messages (conversation_id, timestamp);

CREATE TABLE IF NOT EXISTS offline_queue (
    id              TEXT PRIMARY KEY NOT NULL,
    conversation_id TEXT NOT NULL,
    sender_id       TEXT NOT NULL,
    content         TEXT NOT NULL,
    attachment_ref  TEXT,
    timestamp       INTEGER NOT NULL,
    temp_id         TEXT NOT NULL,
    retry_count     INTEGER NOT NULL DEFAULT 0,
    last_retry_at   INTEGER,
    error           TEXT,
    created_at      INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_queue_timestamp
    ON offline_queue (timestamp);

CREATE INDEX IF NOT EXISTS idx_queue_conversation
    ON offline_queue (conversation_id);
";
