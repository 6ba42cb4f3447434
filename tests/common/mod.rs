//! Shared test utilities

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chorus_gateway::api::ApiState;
use chorus_gateway::config::ServerConfig;
use chorus_gateway::db::{MessageRepo, RequestLogRepo};
use chorus_gateway::history::{CompressionConfig, Message, MessageRole, MessageStore};
use chorus_gateway::providers::{ChatOptions, ChunkSink};
use chorus_gateway::{
    ChatService, DbPool, Error, HistoryCompressor, Provider, ProviderRegistry, Result, db,
};
use tokio_util::sync::CancellationToken;

/// First line of every summarization prompt
pub const SUMMARY_PROMPT_MARKER: &str = "Task: update the short summary of a dialogue.";

/// Set up an in-memory test database
#[must_use]
pub fn setup_test_db() -> DbPool {
    db::init_memory().expect("failed to init test db")
}

/// Compression settings without the pause between rounds
#[must_use]
pub fn fast_compression(every: usize, keep_last: usize) -> CompressionConfig {
    CompressionConfig {
        every_messages: every,
        keep_last_messages: keep_last,
        round_pause: Duration::ZERO,
        ..CompressionConfig::default()
    }
}

/// One observed `chat` call
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub message: String,
    pub system_prompt: Option<String>,
    pub history: Vec<(String, String)>,
}

/// Provider with canned replies
///
/// Chat turns stream `reply` fragment by fragment. Summarization prompts get
/// `summary #n`, or an empty reply when `empty_summaries` is set.
pub struct MockProvider {
    name: &'static str,
    reply: Vec<String>,
    summary_text: Option<String>,
    empty_summaries: AtomicBool,
    fail_status: Option<u16>,
    summaries: AtomicUsize,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockProvider {
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            reply: vec!["Hello".to_string(), ", ".to_string(), "world".to_string()],
            summary_text: None,
            empty_summaries: AtomicBool::new(false),
            fail_status: None,
            summaries: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn with_reply(mut self, fragments: &[&str]) -> Self {
        self.reply = fragments.iter().map(|f| (*f).to_string()).collect();
        self
    }

    /// Answer every summarization prompt with `text`
    #[must_use]
    pub fn with_summary(mut self, text: impl Into<String>) -> Self {
        self.summary_text = Some(text.into());
        self
    }

    /// Fail chat turns with an upstream error after streaming the reply
    #[must_use]
    pub const fn failing(mut self, status: u16) -> Self {
        self.fail_status = Some(status);
        self
    }

    pub fn set_empty_summaries(&self, empty: bool) {
        self.empty_summaries.store(empty, Ordering::SeqCst);
    }

    #[must_use]
    pub fn summary_calls(&self) -> usize {
        self.summaries.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        self.name
    }

    fn model(&self) -> String {
        format!("{}-model", self.name)
    }

    fn set_model(&self, _model: &str) {}

    fn models(&self) -> Vec<String> {
        vec![self.model()]
    }

    fn max_tokens(&self) -> u32 {
        4096
    }

    fn calculate_cost(&self, _input: usize, _output: usize) -> f64 {
        0.0
    }

    async fn chat(
        &self,
        message: &str,
        options: &ChatOptions,
        cancel: &CancellationToken,
        sink: &mut dyn ChunkSink,
    ) -> Result<()> {
        self.calls.lock().unwrap().push(RecordedCall {
            message: message.to_string(),
            system_prompt: options.system_prompt.clone(),
            history: options
                .history
                .iter()
                .map(|m| (m.role.clone(), m.content.clone()))
                .collect(),
        });

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        if message.starts_with(SUMMARY_PROMPT_MARKER) {
            let n = self.summaries.fetch_add(1, Ordering::SeqCst) + 1;
            if self.empty_summaries.load(Ordering::SeqCst) {
                return sink.on_chunk("   ").await;
            }
            if let Some(text) = &self.summary_text {
                return sink.on_chunk(text).await;
            }
            return sink.on_chunk(&format!("summary #{n}")).await;
        }

        for fragment in &self.reply {
            sink.on_chunk(fragment).await?;
        }

        match self.fail_status {
            Some(status) => Err(Error::Upstream {
                provider: "mock",
                status,
                body: "boom".to_string(),
            }),
            None => Ok(()),
        }
    }
}

/// Store wrapper that can fail `delete_messages_by_ids` on demand
pub struct FlakyStore {
    pub inner: MessageRepo,
    pub fail_deletes: AtomicBool,
}

impl FlakyStore {
    #[must_use]
    pub fn new(pool: DbPool) -> Self {
        Self {
            inner: MessageRepo::new(pool),
            fail_deletes: AtomicBool::new(false),
        }
    }
}

impl MessageStore for FlakyStore {
    fn save_message(&self, session_id: &str, role: MessageRole, content: &str) -> Result<Message> {
        self.inner.save_message(session_id, role, content)
    }

    fn get_messages(&self, session_id: &str, limit: usize) -> Result<Vec<Message>> {
        self.inner.get_messages(session_id, limit)
    }

    fn recent_non_summary_messages(&self, session_id: &str, limit: usize) -> Result<Vec<Message>> {
        self.inner.recent_non_summary_messages(session_id, limit)
    }

    fn count_non_summary_messages(&self, session_id: &str) -> Result<usize> {
        self.inner.count_non_summary_messages(session_id)
    }

    fn oldest_non_summary_messages(
        &self,
        session_id: &str,
        batch: usize,
        keep_last: usize,
    ) -> Result<Vec<Message>> {
        self.inner
            .oldest_non_summary_messages(session_id, batch, keep_last)
    }

    fn latest_summary(&self, session_id: &str) -> Result<Option<Message>> {
        self.inner.latest_summary(session_id)
    }

    fn upsert_summary(&self, session_id: &str, content: &str) -> Result<Message> {
        self.inner.upsert_summary(session_id, content)
    }

    fn delete_messages_by_ids(&self, session_id: &str, ids: &[i64]) -> Result<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(Error::Database("disk I/O error".to_string()));
        }
        self.inner.delete_messages_by_ids(session_id, ids)
    }
}

/// Append `n` alternating user/assistant messages, returning their ids
pub fn fill_session(store: &dyn MessageStore, session_id: &str, n: usize) -> Vec<i64> {
    (0..n)
        .map(|i| {
            let role = if i % 2 == 0 {
                MessageRole::User
            } else {
                MessageRole::Assistant
            };
            store
                .save_message(session_id, role, &format!("message {i}"))
                .expect("failed to save message")
                .id
        })
        .collect()
}

/// A chat service over an in-memory database and the given providers
#[must_use]
pub fn build_service(
    pool: &DbPool,
    providers: Vec<Arc<MockProvider>>,
    compression: CompressionConfig,
) -> ChatService {
    let registry = ProviderRegistry::new();
    for provider in providers {
        registry.register(provider.name, provider);
    }
    registry.ensure_default();

    ChatService::new(
        Arc::new(registry),
        Arc::new(MessageRepo::new(pool.clone())),
        RequestLogRepo::new(pool.clone()),
        HistoryCompressor::new(compression),
    )
}

/// Full API router over a single mock provider
#[must_use]
pub fn build_test_router(pool: DbPool, provider: Arc<MockProvider>) -> axum::Router {
    build_test_router_with(pool, provider, ServerConfig::default())
}

/// Full API router with custom server settings
#[must_use]
pub fn build_test_router_with(
    pool: DbPool,
    provider: Arc<MockProvider>,
    server: ServerConfig,
) -> axum::Router {
    let service = build_service(&pool, vec![provider], fast_compression(10, 4));
    let state = ApiState::new(service, pool, server);
    chorus_gateway::api::router(Arc::new(state))
}
