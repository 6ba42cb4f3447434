//! Groq provider (OpenAI-compatible streaming API)

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::stream::{self, WireFormat};
use super::{ChatMessage, ChatOptions, ChunkSink, ModelSlot, Provider, linear_cost, prompt};
use crate::{Error, Result};

pub const DEFAULT_API_URL: &str = "https://api.groq.com/openai/v1";
pub const DEFAULT_MODEL: &str = "llama-3.3-70b-versatile";

const MODELS: [&str; 5] = [
    "llama-3.3-70b-versatile",
    "llama-3.1-8b-instant",
    "llama-3.2-3b-preview",
    "mixtral-8x7b-32768",
    "gemma2-9b-it",
];

const INPUT_COST_PER_1K: f64 = 0.000_59;
const OUTPUT_COST_PER_1K: f64 = 0.000_79;

/// Groq connection settings
#[derive(Debug)]
pub struct GroqConfig {
    pub api_key: Option<SecretString>,
    pub api_url: String,
    pub model: String,
    pub timeout: Duration,
}

impl Default for GroqConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_url: DEFAULT_API_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            timeout: Duration::from_secs(120),
        }
    }
}

/// Request body shared with GigaChat's chat completions endpoint
#[derive(Debug, Serialize)]
pub(crate) struct CompletionRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [ChatMessage],
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

/// Streaming client for the Groq API
pub struct GroqProvider {
    client: reqwest::Client,
    api_key: SecretString,
    api_url: String,
    model: ModelSlot,
}

impl GroqProvider {
    /// Build the provider
    ///
    /// # Errors
    ///
    /// Returns an error if no API key is configured or the HTTP client
    /// cannot be built.
    pub fn new(config: GroqConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .filter(|k| !k.expose_secret().trim().is_empty())
            .ok_or_else(|| Error::Config("GROQ_API_KEY is not set".to_string()))?;

        let client = reqwest::Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            client,
            api_key,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            model: ModelSlot::new(config.model),
        })
    }
}

fn max_tokens_for(model: &str) -> u32 {
    if model.contains("70b") || model.contains("mixtral") {
        32_768
    } else {
        8_192
    }
}

#[async_trait]
impl Provider for GroqProvider {
    fn name(&self) -> &str {
        "groq"
    }

    fn model(&self) -> String {
        self.model.get()
    }

    fn set_model(&self, model: &str) {
        self.model.set(model);
    }

    fn models(&self) -> Vec<String> {
        MODELS.iter().map(ToString::to_string).collect()
    }

    fn max_tokens(&self) -> u32 {
        max_tokens_for(&self.model.get())
    }

    fn calculate_cost(&self, input_tokens: usize, output_tokens: usize) -> f64 {
        linear_cost(input_tokens, output_tokens, INPUT_COST_PER_1K, OUTPUT_COST_PER_1K)
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
        let body = CompletionRequest {
            model: &model,
            messages: &messages,
            stream: true,
            max_tokens: options.max_tokens,
            temperature: options.temperature,
        };

        tracing::debug!(%model, messages = messages.len(), "sending groq request");

        let request = self
            .client
            .post(format!("{}/chat/completions", self.api_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&body);

        let response = stream::send(request, "groq", cancel).await?;
        stream::pump(response.bytes_stream(), WireFormat::Sse, cancel, sink).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> GroqProvider {
        GroqProvider::new(GroqConfig {
            api_key: Some(SecretString::from("gsk-test".to_string())),
            ..GroqConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn missing_key_is_a_config_error() {
        let err = GroqProvider::new(GroqConfig::default()).err().unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn context_window_follows_model_family() {
        let groq = provider();
        assert_eq!(groq.max_tokens(), 32_768);
        groq.set_model("llama-3.1-8b-instant");
        assert_eq!(groq.max_tokens(), 8_192);
        groq.set_model("mixtral-8x7b-32768");
        assert_eq!(groq.max_tokens(), 32_768);
    }

    #[test]
    fn pricing_is_per_thousand_tokens() {
        let cost = provider().calculate_cost(1000, 1000);
        assert!((cost - (0.000_59 + 0.000_79)).abs() < 1e-12);
    }

    #[test]
    fn request_body_omits_unset_options() {
        let messages = vec![ChatMessage::user("hi")];
        let body = CompletionRequest {
            model: "m",
            messages: &messages,
            stream: true,
            max_tokens: None,
            temperature: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "model": "m",
                "messages": [{"role": "user", "content": "hi"}],
                "stream": true
            })
        );
    }
}
