//! Request log repository

use chrono::{DateTime, Utc};
use rusqlite::{Row, params};
use serde::Serialize;

use super::{DbPool, connection, parse_datetime};
use crate::{Error, Result};

/// One logged chat request
#[derive(Debug, Clone, Serialize)]
pub struct RequestLog {
    pub id: i64,
    pub session_id: Option<String>,
    pub request_json: String,
    pub response_json: Option<String>,
    pub status_code: Option<u16>,
    pub duration_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_input: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_output: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_total: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    pub created_at: DateTime<Utc>,
}

/// Fields of a log entry about to be written
#[derive(Debug, Clone, Default)]
pub struct NewRequestLog {
    pub session_id: Option<String>,
    pub request_json: String,
    pub response_json: Option<String>,
    pub status_code: u16,
    pub duration_ms: i64,
    pub tokens_input: Option<i64>,
    pub tokens_output: Option<i64>,
    pub cost: Option<f64>,
}

/// Request log repository
#[derive(Clone)]
pub struct RequestLogRepo {
    pool: DbPool,
}

fn row_to_log(row: &Row<'_>) -> rusqlite::Result<RequestLog> {
    Ok(RequestLog {
        id: row.get(0)?,
        session_id: row.get(1)?,
        request_json: row.get(2)?,
        response_json: row.get(3)?,
        status_code: row
            .get::<_, Option<i64>>(4)?
            .and_then(|c| u16::try_from(c).ok()),
        duration_ms: row.get(5)?,
        tokens_input: row.get(6)?,
        tokens_output: row.get(7)?,
        tokens_total: row.get(8)?,
        cost: row.get(9)?,
        created_at: parse_datetime(&row.get::<_, String>(10)?),
    })
}

impl RequestLogRepo {
    /// Create a new request log repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Persist a log entry
    ///
    /// `tokens_total` is derived when both counts are known.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn insert(&self, entry: &NewRequestLog) -> Result<RequestLog> {
        let conn = connection(&self.pool)?;
        let now = Utc::now();
        let tokens_total = entry.tokens_input.zip(entry.tokens_output).map(|(i, o)| i + o);

        conn.execute(
            "INSERT INTO request_logs (session_id, request_json, response_json, status_code,
                 duration_ms, tokens_input, tokens_output, tokens_total, cost, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                entry.session_id,
                entry.request_json,
                entry.response_json,
                entry.status_code,
                entry.duration_ms,
                entry.tokens_input,
                entry.tokens_output,
                tokens_total,
                entry.cost,
                now.to_rfc3339(),
            ],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(RequestLog {
            id: conn.last_insert_rowid(),
            session_id: entry.session_id.clone(),
            request_json: entry.request_json.clone(),
            response_json: entry.response_json.clone(),
            status_code: Some(entry.status_code),
            duration_ms: Some(entry.duration_ms),
            tokens_input: entry.tokens_input,
            tokens_output: entry.tokens_output,
            tokens_total,
            cost: entry.cost,
            created_at: now,
        })
    }

    /// Most recent entries first, optionally for one session
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn list(&self, session_id: Option<&str>, limit: usize) -> Result<Vec<RequestLog>> {
        let conn = connection(&self.pool)?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let mut stmt = conn
            .prepare(
                "SELECT id, session_id, request_json, response_json, status_code, duration_ms,
                        tokens_input, tokens_output, tokens_total, cost, created_at
                 FROM request_logs
                 WHERE ?1 IS NULL OR session_id = ?1
                 ORDER BY id DESC LIMIT ?2",
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        let logs = stmt
            .query_map(params![session_id, limit], row_to_log)
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(logs)
    }
}
