//! Read-only history and request log endpoints

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use super::{ApiError, ApiState};
use crate::db::RequestLog;
use crate::history::Message;

/// Build history routes
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/history", get(history))
        .route("/api/logs", get(logs))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    session_id: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct HistoryResponse {
    session_id: String,
    messages: Vec<Message>,
    total: usize,
}

/// Stored messages of one session, oldest first
async fn history(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let session_id = query
        .session_id
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("session_id is required"))?;
    let limit = state.server.clamp_limit(query.limit);

    let messages = state.chat.store().get_messages(&session_id, limit)?;

    Ok(Json(HistoryResponse {
        total: messages.len(),
        session_id,
        messages,
    }))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    session_id: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct LogsResponse {
    logs: Vec<RequestLog>,
    total: usize,
}

/// Request logs, newest first
async fn logs(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<LogsResponse>, ApiError> {
    let limit = state.server.clamp_limit(query.limit);
    let session_id = query.session_id.as_deref().filter(|s| !s.trim().is_empty());

    let logs = state.chat.request_logs().list(session_id, limit)?;

    Ok(Json(LogsResponse {
        total: logs.len(),
        logs,
    }))
}
