//! SQLite-backed implementation of [`MessageStore`] and [`OfflineQueue`].
//!
//! One connection serves both tables. It is guarded by a
//! [`parking_lot::Mutex`]; statements are short and synchronous, so the
//! lock is never held across an `.await`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};

use msgsync_proto::message::{
    ClientId, ConversationId, Message, MessageId, MessageStatus, SenderId, TEMP_ID_PREFIX,
    Timestamp,
};
use msgsync_proto::queue::QueueEntry;
use msgsync_proto::record::OptimisticMessage;

use super::schema::{CREATE_TABLES, SCHEMA_VERSION};
use super::{MessageStore, OfflineQueue, StorageError};

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, content, attachment_ref, \
     timestamp, status, detected_language, retry_count, last_retry_at, error_reason, client_id";

const QUEUE_COLUMNS: &str = "id, conversation_id, sender_id, content, attachment_ref, \
     timestamp, temp_id, retry_count, last_retry_at, error, created_at";

/// Durable storage in a single SQLite database file.
///
/// Cloning shares the underlying connection, so the same handle can be
/// passed to the engine as both its message store and its queue.
#[derive(Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Opens (or creates) the database at `path`, creating parent
    /// directories as needed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Unavailable`] if the file cannot be opened,
    /// or a schema error if initialization fails.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::Unavailable(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
        let conn = Connection::open(path).map_err(|e| {
            StorageError::Unavailable(format!("failed to open {}: {e}", path.display()))
        })?;
        Self::init(conn)
    }

    /// Opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if SQLite cannot allocate the database.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StorageError::Unavailable(format!("in-memory database: {e}")))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StorageError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(CREATE_TABLES)?;

        let version: Option<i64> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .optional()?;

        match version {
            None => {
                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?1)",
                    params![SCHEMA_VERSION],
                )?;
                tracing::info!(version = SCHEMA_VERSION, "storage schema created");
            }
            Some(v) if v > SCHEMA_VERSION => {
                return Err(StorageError::Corrupt(format!(
                    "database schema version {v} is newer than supported {SCHEMA_VERSION}"
                )));
            }
            Some(_) => {}
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn query_messages(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<Message>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, message_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn query_entry(conn: &Connection, id: &MessageId) -> Result<Option<QueueEntry>, StorageError> {
        let entry = conn
            .query_row(
                &format!("SELECT {QUEUE_COLUMNS} FROM offline_queue WHERE id = ?1"),
                params![id.as_str()],
                entry_from_row,
            )
            .optional()?;
        Ok(entry)
    }
}

impl MessageStore for SqliteStorage {
    async fn upsert(&self, message: &Message) -> Result<(), StorageError> {
        let client_id = message.client_id.map(|c| c.to_string());
        self.conn.lock().execute(
            &format!(
                "INSERT INTO messages ({MESSAGE_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12) \
                 ON CONFLICT(id) DO UPDATE SET \
                     conversation_id = excluded.conversation_id, \
                     sender_id = excluded.sender_id, \
                     content = excluded.content, \
                     attachment_ref = excluded.attachment_ref, \
                     timestamp = excluded.timestamp, \
                     status = excluded.status, \
                     detected_language = excluded.detected_language, \
                     retry_count = excluded.retry_count, \
                     last_retry_at = excluded.last_retry_at, \
                     error_reason = excluded.error_reason, \
                     client_id = excluded.client_id"
            ),
            params![
                message.id.as_str(),
                message.conversation_id.as_str(),
                message.sender_id.as_str(),
                message.content,
                message.attachment_ref,
                to_sql_millis(message.timestamp),
                message.status.as_str(),
                message.detected_language,
                message.retry_count,
                message.last_retry_at.map(to_sql_millis),
                message.error_reason,
                client_id,
            ],
        )?;
        Ok(())
    }

    async fn get(&self, id: &MessageId) -> Result<Option<Message>, StorageError> {
        let message = self
            .conn
            .lock()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id.as_str()],
                message_from_row,
            )
            .optional()?;
        Ok(message)
    }

    async fn list(
        &self,
        conversation: &ConversationId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>, StorageError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let offset = i64::try_from(offset).unwrap_or(i64::MAX);
        self.query_messages(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ?1 \
                 ORDER BY timestamp DESC, id DESC LIMIT ?2 OFFSET ?3"
            ),
            params![conversation.as_str(), limit, offset],
        )
    }

    async fn update_status(&self, id: &MessageId, status: MessageStatus) -> Result<(), StorageError> {
        let changed = self.conn.lock().execute(
            "UPDATE messages SET status = ?2 WHERE id = ?1",
            params![id.as_str(), status.as_str()],
        )?;
        if changed == 0 {
            return Err(StorageError::NotFound(format!("message {id}")));
        }
        Ok(())
    }

    async fn delete(&self, id: &MessageId) -> Result<(), StorageError> {
        self.conn
            .lock()
            .execute("DELETE FROM messages WHERE id = ?1", params![id.as_str()])?;
        Ok(())
    }

    async fn list_unconfirmed(&self) -> Result<Vec<Message>, StorageError> {
        // LIKE ignores ASCII case, so compare the prefix bytes exactly.
        self.query_messages(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages \
                 WHERE substr(id, 1, length(?1)) = ?1 \
                 ORDER BY timestamp ASC, id ASC"
            ),
            params![TEMP_ID_PREFIX],
        )
    }
}

impl OfflineQueue for SqliteStorage {
    async fn enqueue(
        &self,
        message: &OptimisticMessage,
        now: Timestamp,
    ) -> Result<QueueEntry, StorageError> {
        let entry = QueueEntry::from_optimistic(message, now);
        self.conn.lock().execute(
            &format!(
                "INSERT OR REPLACE INTO offline_queue ({QUEUE_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
            ),
            params![
                entry.id.as_str(),
                entry.conversation_id.as_str(),
                entry.sender_id.as_str(),
                entry.content,
                entry.attachment_ref,
                to_sql_millis(entry.timestamp),
                entry.temp_id.to_string(),
                entry.retry_count,
                entry.last_retry_at.map(to_sql_millis),
                entry.error,
                to_sql_millis(entry.created_at),
            ],
        )?;
        Ok(entry)
    }

    async fn entry(&self, id: &MessageId) -> Result<Option<QueueEntry>, StorageError> {
        Self::query_entry(&self.conn.lock(), id)
    }

    async fn dequeue_all(&self) -> Result<Vec<QueueEntry>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {QUEUE_COLUMNS} FROM offline_queue \
             ORDER BY timestamp ASC, created_at ASC, rowid ASC"
        ))?;
        let entries = stmt
            .query_map([], entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    async fn remove(&self, id: &MessageId) -> Result<bool, StorageError> {
        let removed = self
            .conn
            .lock()
            .execute("DELETE FROM offline_queue WHERE id = ?1", params![id.as_str()])?;
        Ok(removed > 0)
    }

    async fn record_failure(
        &self,
        id: &MessageId,
        reason: &str,
        at: Timestamp,
    ) -> Result<QueueEntry, StorageError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE offline_queue SET retry_count = retry_count + 1, last_retry_at = ?2, error = ?3 \
             WHERE id = ?1",
            params![id.as_str(), to_sql_millis(at), reason],
        )?;
        if changed == 0 {
            return Err(StorageError::NotFound(format!("queue entry {id}")));
        }
        Self::query_entry(&conn, id)?
            .ok_or_else(|| StorageError::NotFound(format!("queue entry {id}")))
    }

    async fn len(&self) -> Result<usize, StorageError> {
        let count: i64 = self
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM offline_queue", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

fn to_sql_millis(ts: Timestamp) -> i64 {
    i64::try_from(ts.as_millis()).unwrap_or(i64::MAX)
}

fn from_sql_millis(millis: i64) -> Timestamp {
    Timestamp::from_millis(u64::try_from(millis).unwrap_or(0))
}

fn parse_client_id(idx: usize, raw: &str) -> rusqlite::Result<ClientId> {
    ClientId::parse(raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("invalid client id {raw}").into(),
        )
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    let status: String = row.get(6)?;
    let status = status
        .parse::<MessageStatus>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))?;
    let client_id = match row.get::<_, Option<String>>(11)? {
        Some(raw) => Some(parse_client_id(11, &raw)?),
        None => None,
    };

    Ok(Message {
        id: MessageId::new(row.get::<_, String>(0)?),
        conversation_id: ConversationId::new(row.get::<_, String>(1)?),
        sender_id: SenderId::new(row.get::<_, String>(2)?),
        content: row.get(3)?,
        attachment_ref: row.get(4)?,
        timestamp: from_sql_millis(row.get(5)?),
        status,
        detected_language: row.get(7)?,
        retry_count: row.get(8)?,
        last_retry_at: row.get::<_, Option<i64>>(9)?.map(from_sql_millis),
        error_reason: row.get(10)?,
        client_id,
    })
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<QueueEntry> {
    let temp_id: String = row.get(6)?;
    Ok(QueueEntry {
        id: MessageId::new(row.get::<_, String>(0)?),
        conversation_id: ConversationId::new(row.get::<_, String>(1)?),
        sender_id: SenderId::new(row.get::<_, String>(2)?),
        content: row.get(3)?,
        attachment_ref: row.get(4)?,
        timestamp: from_sql_millis(row.get(5)?),
        temp_id: parse_client_id(6, &temp_id)?,
        retry_count: row.get(7)?,
        last_retry_at: row.get::<_, Option<i64>>(8)?.map(from_sql_millis),
        error: row.get(9)?,
        created_at: from_sql_millis(row.get(10)?),
    })
}
