//! Chat orchestration
//!
//! Ties a provider call to session history: loads the conversation, stores
//! both turns, writes the request log and compresses the history when it
//! grows past the threshold. All of it runs under the session's lock.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::db::{NewRequestLog, RequestLogRepo};
use crate::history::{
    CompressionReport, HistoryCompressor, MessageRole, MessageStore, SessionLocks,
};
use crate::providers::{
    ChatMessage, ChatOptions, ChunkSink, Provider, ProviderRegistry, ReasoningMode,
};
use crate::tokens::{estimate_request_tokens, estimate_tokens};
use crate::{Error, Result};

/// Messages loaded from history for one request
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

const SUMMARY_PREFIX: &str = "Summary of the earlier conversation: ";

/// A chat request as accepted by the HTTP API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default = "default_true")]
    pub use_history: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_mode: Option<ReasoningMode>,
    #[serde(default)]
    pub json_format: bool,
    #[serde(default, alias = "json_schema_text", skip_serializing_if = "Option::is_none")]
    pub json_schema: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

const fn default_true() -> bool {
    true
}

impl ChatRequest {
    /// A request with history enabled and every option unset
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            session_id: None,
            use_history: true,
            provider: None,
            model: None,
            system_prompt: None,
            reasoning_mode: None,
            json_format: false,
            json_schema: None,
            max_tokens: None,
            temperature: None,
        }
    }
}

/// A validated request bound to a provider and a session
pub struct PreparedChat {
    pub request: ChatRequest,
    pub session_id: String,
    pub provider: Arc<dyn Provider>,
}

/// Summary of a completed chat turn
#[derive(Debug, Clone, Serialize)]
pub struct ChatOutcome {
    pub session_id: String,
    pub provider: String,
    pub model: String,
    pub content: String,
    pub tokens_input: usize,
    pub tokens_output: usize,
    pub cost: f64,
    pub duration_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression: Option<CompressionReport>,
}

/// Forwards fragments and keeps a copy of everything received
struct Recorder<'a> {
    inner: &'a mut dyn ChunkSink,
    text: String,
}

#[async_trait]
impl ChunkSink for Recorder<'_> {
    async fn on_chunk(&mut self, fragment: &str) -> Result<()> {
        self.text.push_str(fragment);
        self.inner.on_chunk(fragment).await
    }
}

/// Runs chat turns against the registry, the history store and the logs
#[derive(Clone)]
pub struct ChatService {
    registry: Arc<ProviderRegistry>,
    store: Arc<dyn MessageStore>,
    request_logs: RequestLogRepo,
    locks: SessionLocks,
    compressor: HistoryCompressor,
    history_limit: usize,
}

impl ChatService {
    #[must_use]
    pub fn new(
        registry: Arc<ProviderRegistry>,
        store: Arc<dyn MessageStore>,
        request_logs: RequestLogRepo,
        compressor: HistoryCompressor,
    ) -> Self {
        Self {
            registry,
            store,
            request_logs,
            locks: SessionLocks::new(),
            compressor,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    #[must_use]
    pub const fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn store(&self) -> &dyn MessageStore {
        self.store.as_ref()
    }

    #[must_use]
    pub const fn request_logs(&self) -> &RequestLogRepo {
        &self.request_logs
    }

    /// Validate a request and resolve its provider and session id
    ///
    /// # Errors
    ///
    /// [`Error::InvalidInput`] for an empty message,
    /// [`Error::ProviderNotFound`] for an unknown provider.
    pub fn prepare(&self, mut request: ChatRequest) -> Result<PreparedChat> {
        if request.message.trim().is_empty() {
            return Err(Error::InvalidInput("message is required".to_string()));
        }
        let provider = self.registry.get(request.provider.as_deref())?;

        let session_id = request
            .session_id
            .take()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| format!("session_{}", Uuid::new_v4().simple()));
        request.session_id = Some(session_id.clone());

        Ok(PreparedChat {
            request,
            session_id,
            provider,
        })
    }

    /// Validate and run one chat turn, streaming the reply into `sink`
    ///
    /// # Errors
    ///
    /// Validation errors from [`Self::prepare`], store failures, and the
    /// provider's error when the call fails.
    pub async fn stream_chat(
        &self,
        request: ChatRequest,
        sink: &mut dyn ChunkSink,
        cancel: &CancellationToken,
    ) -> Result<ChatOutcome> {
        let prepared = self.prepare(request)?;
        self.run(prepared, sink, cancel).await
    }

    /// Run a prepared chat turn
    ///
    /// # Errors
    ///
    /// Store failures and the provider's error when the call fails. A
    /// partial reply is still stored and logged before the error returns.
    pub async fn run(
        &self,
        prepared: PreparedChat,
        sink: &mut dyn ChunkSink,
        cancel: &CancellationToken,
    ) -> Result<ChatOutcome> {
        let PreparedChat {
            request,
            session_id,
            provider,
        } = prepared;

        let _guard = self.locks.acquire(&session_id).await;

        let history = if request.use_history {
            self.load_history(&session_id)?
        } else {
            Vec::new()
        };

        self.store
            .save_message(&session_id, MessageRole::User, &request.message)?;

        let options = ChatOptions {
            system_prompt: request.system_prompt.clone(),
            history,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            reasoning_mode: request.reasoning_mode,
            json_format: request.json_format,
            json_schema_text: request.json_schema.clone(),
            model: request.model.clone(),
        };
        let model = request.model.clone().unwrap_or_else(|| provider.model());
        let tokens_input = estimate_request_tokens(
            options.system_prompt.as_deref(),
            &options.history,
            &request.message,
        );

        tracing::info!(
            session = %session_id,
            provider = provider.name(),
            %model,
            history = options.history.len(),
            tokens_input,
            "chat request"
        );

        let started = Instant::now();
        let mut recorder = Recorder {
            inner: sink,
            text: String::new(),
        };
        let result = provider
            .chat(&request.message, &options, cancel, &mut recorder)
            .await;
        let reply = recorder.text;
        let duration_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);

        let tokens_output = estimate_tokens(&reply);
        let cost = provider.calculate_cost(tokens_input, tokens_output);

        if !reply.is_empty() {
            let saved = self
                .store
                .save_message(&session_id, MessageRole::Assistant, &reply);
            match (&result, saved) {
                (Ok(()), Err(e)) => return Err(e),
                (Err(_), Err(e)) => {
                    tracing::warn!(session = %session_id, error = %e, "failed to store partial reply");
                }
                _ => {}
            }
        }

        self.log_request(
            &request,
            provider.name(),
            &model,
            &reply,
            result.as_ref().err(),
            duration_ms,
            tokens_input,
            tokens_output,
            cost,
        );

        if let Err(e) = result {
            if e.is_cancellation() {
                tracing::info!(session = %session_id, "chat cancelled by client");
            } else {
                tracing::error!(session = %session_id, error = %e, duration_ms, "chat failed");
            }
            return Err(e);
        }

        tracing::info!(
            session = %session_id,
            duration_ms,
            tokens_output,
            cost,
            "chat completed"
        );

        let compression = self
            .compress_locked(provider.as_ref(), &session_id, cancel)
            .await;

        Ok(ChatOutcome {
            session_id,
            provider: provider.name().to_string(),
            model,
            content: reply,
            tokens_input,
            tokens_output,
            cost,
            duration_ms,
            compression,
        })
    }

    /// Compress a session now, using the named or the default provider
    ///
    /// # Errors
    ///
    /// Returns the provider lookup error, or the compression failure.
    pub async fn compress_session(
        &self,
        session_id: &str,
        provider: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<CompressionReport> {
        if session_id.trim().is_empty() {
            return Err(Error::InvalidInput("session id is required".to_string()));
        }
        let provider = self.registry.get(provider)?;
        let _guard = self.locks.acquire(session_id).await;

        self.compressor
            .compress_if_needed(provider.as_ref(), self.store.as_ref(), session_id, cancel)
            .await
            .map_err(|e| {
                tracing::warn!(session = session_id, rounds = e.rounds, error = %e.source, "compression failed");
                e.source
            })
    }

    /// Caller holds the session lock
    async fn compress_locked(
        &self,
        provider: &dyn Provider,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> Option<CompressionReport> {
        if !self.compressor.config().enabled {
            return None;
        }
        match self
            .compressor
            .compress_if_needed(provider, self.store.as_ref(), session_id, cancel)
            .await
        {
            Ok(report) => Some(report),
            Err(e) => {
                tracing::warn!(
                    session = session_id,
                    rounds = e.rounds,
                    error = %e.source,
                    "history compression failed"
                );
                Some(e.report())
            }
        }
    }

    /// Summary first (as a system turn), then user and assistant turns
    fn load_history(&self, session_id: &str) -> Result<Vec<ChatMessage>> {
        let summary = self.store.latest_summary(session_id)?;
        let messages = self
            .store
            .recent_non_summary_messages(session_id, self.history_limit)?;

        let mut history = Vec::with_capacity(messages.len() + 1);
        if let Some(summary) = summary.filter(|s| !s.content.trim().is_empty()) {
            history.push(ChatMessage::system(format!("{SUMMARY_PREFIX}{}", summary.content)));
        }
        history.extend(
            messages
                .into_iter()
                .map(|m| ChatMessage::new(m.role.as_str(), m.content)),
        );
        Ok(history)
    }

    #[allow(clippy::too_many_arguments)]
    fn log_request(
        &self,
        request: &ChatRequest,
        provider: &str,
        model: &str,
        reply: &str,
        error: Option<&Error>,
        duration_ms: i64,
        tokens_input: usize,
        tokens_output: usize,
        cost: f64,
    ) {
        let status_code: u16 = if error.is_some() { 500 } else { 200 };
        let tokens_input = i64::try_from(tokens_input).unwrap_or(i64::MAX);
        let tokens_output = i64::try_from(tokens_output).unwrap_or(i64::MAX);

        let request_json = serde_json::json!({
            "request": request,
            "provider": provider,
            "model": model,
            "tokens_input": tokens_input,
        });
        let mut response_json = serde_json::json!({
            "content": reply,
            "status": status_code,
            "tokens_input": tokens_input,
            "tokens_output": tokens_output,
            "tokens_total": tokens_input + tokens_output,
            "cost": cost,
        });
        if let Some(error) = error {
            response_json["error"] = serde_json::Value::String(error.to_string());
        }

        let entry = NewRequestLog {
            session_id: request.session_id.clone(),
            request_json: request_json.to_string(),
            response_json: Some(response_json.to_string()),
            status_code,
            duration_ms,
            tokens_input: Some(tokens_input),
            tokens_output: Some(tokens_output),
            cost: Some(cost),
        };
        if let Err(e) = self.request_logs.insert(&entry) {
            tracing::warn!(error = %e, "failed to write request log");
        }
    }
}
