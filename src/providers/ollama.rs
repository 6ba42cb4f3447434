//! Ollama provider (local models, newline-delimited JSON stream)

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::stream::{self, WireFormat};
use super::{ChatMessage, ChatOptions, ChunkSink, ModelSlot, Provider, prompt};
use crate::Result;

pub const DEFAULT_API_URL: &str = "http://localhost:11434";
pub const DEFAULT_MODEL: &str = "llama3.2:3b";

/// Recommended models grouped by the hardware they run well on
pub const RECOMMENDED_MODELS: [(&str, [&str; 4]); 3] = [
    ("low", ["qwen2.5:0.5b", "qwen2.5:1.5b", "llama3.2:1b", "gemma2:2b"]),
    ("medium", ["llama3.2:3b", "qwen2.5:3b", "phi3:mini", "mistral:7b"]),
    ("high", ["llama3.1:8b", "qwen2.5:7b", "codellama:7b", "deepseek-coder:6.7b"]),
];

/// Ollama connection settings
#[derive(Debug, Clone)]
pub struct OllamaConfig {
    pub api_url: String,
    pub model: String,
    pub timeout: Duration,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            // local models on modest hardware are slow
            timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<OllamaOptions>,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

impl OllamaOptions {
    fn from_chat(options: &ChatOptions) -> Option<Self> {
        if options.max_tokens.is_none() && options.temperature.is_none() {
            return None;
        }
        Some(Self {
            num_predict: options.max_tokens,
            temperature: options.temperature,
        })
    }
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}

/// Streaming client for a local Ollama daemon
pub struct OllamaProvider {
    client: reqwest::Client,
    api_url: String,
    model: ModelSlot,
}

impl OllamaProvider {
    /// Build the provider
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: OllamaConfig) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            model: ModelSlot::new(config.model),
        })
    }

    /// Models actually pulled on the daemon
    ///
    /// # Errors
    ///
    /// Returns an error if the daemon is unreachable or answers with a
    /// non-success status.
    pub async fn installed_models(&self) -> Result<Vec<String>> {
        let request = self.client.get(format!("{}/api/tags", self.api_url));
        let response = stream::send(request, "ollama", &CancellationToken::new()).await?;
        let tags: TagsResponse = response.json().await?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }
}

fn max_tokens_for(model: &str) -> u32 {
    if model.contains("7b") || model.contains("8b") {
        4_096
    } else {
        2_048
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    fn model(&self) -> String {
        self.model.get()
    }

    fn set_model(&self, model: &str) {
        self.model.set(model);
    }

    fn models(&self) -> Vec<String> {
        RECOMMENDED_MODELS
            .iter()
            .flat_map(|(_, models)| models.iter().map(ToString::to_string))
            .collect()
    }

    fn max_tokens(&self) -> u32 {
        max_tokens_for(&self.model.get())
    }

    fn calculate_cost(&self, _input_tokens: usize, _output_tokens: usize) -> f64 {
        0.0
    }

    async fn chat(
        &self,
        message: &str,
        options: &ChatOptions,
        cancel: &CancellationToken,
        sink: &mut dyn ChunkSink,
    ) -> Result<()> {
        let model = self.model.resolve(options);
        let messages = prompt::build_messages(message, options);
        let body = OllamaRequest {
            model: &model,
            messages: &messages,
            stream: true,
            options: OllamaOptions::from_chat(options),
        };

        tracing::debug!(%model, messages = messages.len(), "sending ollama request");

        let request = self
            .client
            .post(format!("{}/api/chat", self.api_url))
            .json(&body);

        let response = stream::send(request, "ollama", cancel).await?;
        stream::pump(response.bytes_stream(), WireFormat::NdJson, cancel, sink).await
    }
}
