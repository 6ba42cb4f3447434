//! LLM provider abstraction
//!
//! Every upstream backend implements [`Provider`]. A chat call pushes reply
//! fragments into a [`ChunkSink`] one at a time, in arrival order, and
//! awaits each push before reading further from the upstream stream, so a
//! slow consumer slows the upstream read instead of buffering without bound.

pub mod gigachat;
pub mod groq;
pub mod ollama;
pub mod prompt;
pub mod registry;
pub mod stream;

use std::fmt;
use std::str::FromStr;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

pub use gigachat::{GigaChatConfig, GigaChatProvider};
pub use groq::{GroqConfig, GroqProvider};
pub use ollama::{OllamaConfig, OllamaProvider};
pub use prompt::ReasoningMode;
pub use registry::{ProviderInfo, ProviderRegistry};

/// A single chat turn as sent upstream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    /// Build a message with an arbitrary role
    #[must_use]
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }
}

/// Per-request options forwarded to a provider
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    /// Caller-supplied system prompt
    pub system_prompt: Option<String>,
    /// Prior turns, oldest first
    pub history: Vec<ChatMessage>,
    /// Output token budget
    pub max_tokens: Option<u32>,
    /// Sampling temperature
    pub temperature: Option<f32>,
    /// Reasoning style augmentation
    pub reasoning_mode: Option<ReasoningMode>,
    /// Ask the model for a JSON-only reply
    pub json_format: bool,
    /// Free-form description of the expected JSON shape
    pub json_schema_text: Option<String>,
    /// Model override for this request only
    pub model: Option<String>,
}

/// Consumer of streamed reply fragments
///
/// Returning an error aborts the in-flight upstream request; the provider
/// returns that same error from [`Provider::chat`].
#[async_trait]
pub trait ChunkSink: Send {
    /// Accept the next fragment of the reply
    async fn on_chunk(&mut self, fragment: &str) -> Result<()>;
}

/// Collects the whole reply into a string
#[async_trait]
impl ChunkSink for String {
    async fn on_chunk(&mut self, fragment: &str) -> Result<()> {
        self.push_str(fragment);
        Ok(())
    }
}

/// Forwards fragments into a bounded channel
///
/// `send` waits for capacity, which is what propagates backpressure from
/// the receiving side. A dropped receiver yields [`Error::ClientDisconnected`].
#[derive(Debug, Clone)]
pub struct ChannelSink<T> {
    tx: mpsc::Sender<T>,
}

impl<T> ChannelSink<T> {
    #[must_use]
    pub const fn new(tx: mpsc::Sender<T>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl<T> ChunkSink for ChannelSink<T>
where
    T: From<String> + Send,
{
    async fn on_chunk(&mut self, fragment: &str) -> Result<()> {
        self.tx
            .send(T::from(fragment.to_string()))
            .await
            .map_err(|_| Error::ClientDisconnected)
    }
}

/// Uniform contract over the upstream LLM backends
#[async_trait]
pub trait Provider: Send + Sync {
    /// Registry name of the backend
    fn name(&self) -> &str;

    /// Currently selected model
    fn model(&self) -> String;

    /// Select the model used when a request carries no override
    fn set_model(&self, model: &str);

    /// Models this backend is known to offer
    fn models(&self) -> Vec<String>;

    /// Context window of the currently selected model
    fn max_tokens(&self) -> u32;

    /// Estimated request cost in USD
    fn calculate_cost(&self, input_tokens: usize, output_tokens: usize) -> f64;

    /// Send `message` and stream the reply into `sink`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Upstream`] on a non-success status,
    /// [`Error::Cancelled`] when `cancel` fires, or whatever error `sink`
    /// returned.
    async fn chat(
        &self,
        message: &str,
        options: &ChatOptions,
        cancel: &CancellationToken,
        sink: &mut dyn ChunkSink,
    ) -> Result<()>;
}

/// The closed set of supported backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    GigaChat,
    Groq,
    Ollama,
}

impl ProviderKind {
    pub const ALL: [Self; 3] = [Self::GigaChat, Self::Groq, Self::Ollama];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::GigaChat => "gigachat",
            Self::Groq => "groq",
            Self::Ollama => "ollama",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::ProviderNotFound(s.to_string()))
    }
}

/// Interior-mutable model selection shared by the provider implementations
#[derive(Debug)]
pub(crate) struct ModelSlot(RwLock<String>);

impl ModelSlot {
    pub(crate) fn new(model: impl Into<String>) -> Self {
        Self(RwLock::new(model.into()))
    }

    pub(crate) fn get(&self) -> String {
        self.0.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn set(&self, model: &str) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = model.to_string();
    }

    /// Model for one request: the override if present, else the selection
    pub(crate) fn resolve(&self, options: &ChatOptions) -> String {
        options
            .model
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .map_or_else(|| self.get(), ToString::to_string)
    }
}

/// Linear per-1000-token pricing
pub(crate) fn linear_cost(
    input_tokens: usize,
    output_tokens: usize,
    input_per_1k: f64,
    output_per_1k: f64,
) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let (input, output) = (input_tokens as f64, output_tokens as f64);
    input / 1000.0 * input_per_1k + output / 1000.0 * output_per_1k
}
