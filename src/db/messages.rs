//! Message repository backing the history store

use chrono::Utc;
use rusqlite::types::Value;
use rusqlite::{OptionalExtension, Row, params, params_from_iter};

use super::{DbPool, connection, parse_datetime};
use crate::history::{Message, MessageRole, MessageStore};
use crate::{Error, Result};

const MESSAGE_COLUMNS: &str = "id, session_id, role, content, created_at";

/// `SQLite` implementation of [`MessageStore`]
#[derive(Clone)]
pub struct MessageRepo {
    pool: DbPool,
}

impl MessageRepo {
    /// Create a new message repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        session_id: row.get(1)?,
        role: MessageRole::parse(&row.get::<_, String>(2)?).unwrap_or(MessageRole::User),
        content: row.get(3)?,
        created_at: parse_datetime(&row.get::<_, String>(4)?),
    })
}

fn sql_limit(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

impl MessageStore for MessageRepo {
    fn save_message(&self, session_id: &str, role: MessageRole, content: &str) -> Result<Message> {
        let conn = connection(&self.pool)?;
        let now = Utc::now();

        conn.execute(
            "INSERT INTO messages (session_id, role, content, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![session_id, role.as_str(), content, now.to_rfc3339()],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(Message {
            id: conn.last_insert_rowid(),
            session_id: session_id.to_string(),
            role,
            content: content.to_string(),
            created_at: now,
        })
    }

    fn get_messages(&self, session_id: &str, limit: usize) -> Result<Vec<Message>> {
        let conn = connection(&self.pool)?;

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE session_id = ?1
                 ORDER BY id DESC LIMIT ?2"
            ))
            .map_err(|e| Error::Database(e.to_string()))?;

        let mut messages = stmt
            .query_map(params![session_id, sql_limit(limit)], row_to_message)
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(|e| Error::Database(e.to_string()))?;

        // Reverse to get chronological order
        messages.reverse();
        Ok(messages)
    }

    fn recent_non_summary_messages(&self, session_id: &str, limit: usize) -> Result<Vec<Message>> {
        let conn = connection(&self.pool)?;

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE session_id = ?1 AND role IN ('user', 'assistant')
                 ORDER BY id DESC LIMIT ?2"
            ))
            .map_err(|e| Error::Database(e.to_string()))?;

        let mut messages = stmt
            .query_map(params![session_id, sql_limit(limit)], row_to_message)
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(|e| Error::Database(e.to_string()))?;

        messages.reverse();
        Ok(messages)
    }

    fn count_non_summary_messages(&self, session_id: &str) -> Result<usize> {
        let conn = connection(&self.pool)?;

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM messages
                 WHERE session_id = ?1 AND role IN ('user', 'assistant')",
                [session_id],
                |row| row.get(0),
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(usize::try_from(count).unwrap_or(0))
    }

    fn oldest_non_summary_messages(
        &self,
        session_id: &str,
        batch: usize,
        keep_last: usize,
    ) -> Result<Vec<Message>> {
        if batch == 0 {
            return Err(Error::InvalidInput("batch size must be positive".to_string()));
        }
        let conn = connection(&self.pool)?;

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE session_id = ?1
                   AND role IN ('user', 'assistant')
                   AND id NOT IN (
                     SELECT id FROM messages
                     WHERE session_id = ?1 AND role IN ('user', 'assistant')
                     ORDER BY id DESC LIMIT ?2
                   )
                 ORDER BY id ASC LIMIT ?3"
            ))
            .map_err(|e| Error::Database(e.to_string()))?;

        let messages = stmt
            .query_map(
                params![session_id, sql_limit(keep_last), sql_limit(batch)],
                row_to_message,
            )
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(messages)
    }

    fn latest_summary(&self, session_id: &str) -> Result<Option<Message>> {
        let conn = connection(&self.pool)?;

        conn.query_row(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE session_id = ?1 AND role = 'summary'
                 ORDER BY id DESC LIMIT 1"
            ),
            [session_id],
            row_to_message,
        )
        .optional()
        .map_err(|e| Error::Database(e.to_string()))
    }

    fn upsert_summary(&self, session_id: &str, content: &str) -> Result<Message> {
        let mut conn = connection(&self.pool)?;
        let tx = conn
            .transaction()
            .map_err(|e| Error::Database(e.to_string()))?;
        let now = Utc::now();

        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM messages WHERE session_id = ?1 AND role = 'summary'
                 ORDER BY id DESC LIMIT 1",
                [session_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::Database(e.to_string()))?;

        let id = if let Some(id) = existing {
            tx.execute(
                "UPDATE messages SET content = ?1, created_at = ?2 WHERE id = ?3",
                params![content, now.to_rfc3339(), id],
            )
            .map_err(|e| Error::Database(e.to_string()))?;
            id
        } else {
            tx.execute(
                "INSERT INTO messages (session_id, role, content, created_at)
                 VALUES (?1, 'summary', ?2, ?3)",
                params![session_id, content, now.to_rfc3339()],
            )
            .map_err(|e| Error::Database(e.to_string()))?;
            tx.last_insert_rowid()
        };

        tx.commit().map_err(|e| Error::Database(e.to_string()))?;

        Ok(Message {
            id,
            session_id: session_id.to_string(),
            role: MessageRole::Summary,
            content: content.to_string(),
            created_at: now,
        })
    }

    fn delete_messages_by_ids(&self, session_id: &str, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let conn = connection(&self.pool)?;

        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!("DELETE FROM messages WHERE session_id = ? AND id IN ({placeholders})");
        let args = std::iter::once(Value::from(session_id.to_string()))
            .chain(ids.iter().map(|id| Value::from(*id)));

        let deleted = conn
            .execute(&sql, params_from_iter(args))
            .map_err(|e| Error::Database(e.to_string()))?;

        tracing::debug!(session = session_id, deleted, "messages deleted");
        Ok(())
    }
}
