//! Streaming chat and manual compression endpoints
//!
//! A chat reply is relayed as server-sent events: one `{"content": ...}`
//! event per fragment, an `{"error": ...}` event if the turn fails after
//! streaming began, and a final `[DONE]`. Fragments pass through a bounded
//! channel, so a slow client slows the upstream read.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderName, HeaderValue};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use super::{ApiError, ApiState};
use crate::chat::ChatRequest;
use crate::history::CompressionReport;
use crate::providers::ChannelSink;

/// Response header carrying the (possibly generated) session id
pub const SESSION_ID_HEADER: HeaderName = HeaderName::from_static("x-session-id");

/// Fragments buffered between the provider and the client
pub const STREAM_CHANNEL_CAPACITY: usize = 32;

/// One server-sent event of a chat stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Content(String),
    Error(String),
    Done,
}

impl From<String> for StreamEvent {
    fn from(fragment: String) -> Self {
        Self::Content(fragment)
    }
}

impl StreamEvent {
    fn into_event(self) -> Event {
        match self {
            Self::Content(content) => {
                Event::default().data(serde_json::json!({ "content": content }).to_string())
            }
            Self::Error(error) => {
                Event::default().data(serde_json::json!({ "error": error }).to_string())
            }
            Self::Done => Event::default().data("[DONE]"),
        }
    }
}

/// Build chat routes
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/v2/chat", post(chat))
        .route("/api/v2/sessions/{session_id}/compress", post(compress))
        .with_state(state)
}

/// Stream one chat turn
///
/// Validation happens before the stream opens, so a bad request gets a
/// plain 400 instead of an event stream.
async fn chat(
    State(state): State<Arc<ApiState>>,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let prepared = state.chat.prepare(request)?;
    let session_id = prepared.session_id.clone();

    let (tx, rx) = mpsc::channel::<StreamEvent>(STREAM_CHANNEL_CAPACITY);
    let cancel = CancellationToken::new();
    let service = state.chat.clone();

    tokio::spawn(async move {
        // cancel the turn as soon as the client goes away
        let watcher = {
            let tx = tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tx.closed().await;
                cancel.cancel();
            })
        };

        let mut sink = ChannelSink::new(tx.clone());
        match service.run(prepared, &mut sink, &cancel).await {
            Ok(_) => {}
            Err(e) if e.is_cancellation() => {}
            Err(e) => {
                let _ = tx.send(StreamEvent::Error(e.to_string())).await;
            }
        }
        let _ = tx.send(StreamEvent::Done).await;
        watcher.abort();
    });

    let stream = ReceiverStream::new(rx).map(|event| Ok::<_, Infallible>(event.into_event()));
    let mut response = Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response();

    match HeaderValue::from_str(&session_id) {
        Ok(value) => {
            response.headers_mut().insert(SESSION_ID_HEADER, value);
        }
        Err(_) => tracing::debug!(session = %session_id, "session id is not a valid header value"),
    }

    Ok(response)
}

#[derive(Debug, Deserialize)]
struct CompressQuery {
    provider: Option<String>,
}

#[derive(Debug, Serialize)]
struct CompressResponse {
    session_id: String,
    #[serde(flatten)]
    report: CompressionReport,
}

/// Compress a session's history now
///
/// Dropping the request (client disconnect) cancels the pass between rounds.
async fn compress(
    State(state): State<Arc<ApiState>>,
    Path(session_id): Path<String>,
    Query(query): Query<CompressQuery>,
) -> Result<Json<CompressResponse>, ApiError> {
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let report = state
        .chat
        .compress_session(&session_id, query.provider.as_deref(), &cancel)
        .await?;

    tracing::info!(
        session = %session_id,
        rounds = report.rounds,
        messages = report.messages_compressed,
        "manual compression finished"
    );

    Ok(Json(CompressResponse { session_id, report }))
}
