//! GigaChat provider
//!
//! Requests carry a short-lived OAuth bearer token obtained from a separate
//! auth endpoint with a long-lived authorization key. The token is cached
//! and refreshed under an exclusive lock with a second validity check, so
//! concurrent callers that find it stale trigger a single refresh.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::groq::CompletionRequest;
use super::stream::{self, WireFormat};
use super::{ChatOptions, ChunkSink, ModelSlot, Provider, linear_cost, prompt};
use crate::{Error, Result};

pub const DEFAULT_API_URL: &str = "https://gigachat.devices.sberbank.ru/api/v1";
pub const DEFAULT_AUTH_URL: &str = "https://ngw.devices.sberbank.ru:9443/api/v2/oauth";
pub const DEFAULT_MODEL: &str = "GigaChat";
pub const DEFAULT_SCOPE: &str = "GIGACHAT_API_PERS";

const MODELS: [&str; 3] = ["GigaChat", "GigaChat-Plus", "GigaChat-Pro"];

const INPUT_COST_PER_1K: f64 = 0.001;
const OUTPUT_COST_PER_1K: f64 = 0.002;

/// A token is reused only while more than this many seconds remain
const TOKEN_REFRESH_MARGIN_SECS: i64 = 60;

/// Lifetime assumed for tokens issued without an expiry
const DEFAULT_TOKEN_TTL_MINS: i64 = 30;

/// Extra root certificates tried in order when TLS verification is on
const TRUSTED_ROOT_PATHS: [&str; 3] = [
    "/etc/ssl/certs/russian_trusted_root_ca.pem",
    "/etc/ssl/certs/ca-certificates.crt",
    "/usr/local/share/ca-certificates/russian_trusted_root_ca.crt",
];

/// GigaChat connection settings
#[derive(Debug)]
pub struct GigaChatConfig {
    /// Base64 `client_id:client_secret` used for token refresh
    pub auth_key: Option<SecretString>,
    /// Pre-issued bearer token, trusted for 30 minutes
    pub access_token: Option<SecretString>,
    pub api_url: String,
    pub auth_url: String,
    pub model: String,
    pub scope: String,
    /// Disable certificate verification entirely
    pub skip_tls_verify: bool,
    pub timeout: Duration,
}

impl Default for GigaChatConfig {
    fn default() -> Self {
        Self {
            auth_key: None,
            access_token: None,
            api_url: DEFAULT_API_URL.to_string(),
            auth_url: DEFAULT_AUTH_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            scope: DEFAULT_SCOPE.to_string(),
            skip_tls_verify: false,
            timeout: Duration::from_secs(60),
        }
    }
}

struct CachedToken {
    value: SecretString,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        !self.value.expose_secret().is_empty()
            && now + TimeDelta::seconds(TOKEN_REFRESH_MARGIN_SECS) < self.expires_at
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: String,
    /// Unix milliseconds
    #[serde(default)]
    expires_at: Option<i64>,
}

/// Streaming client for the GigaChat API
pub struct GigaChatProvider {
    client: reqwest::Client,
    api_url: String,
    auth_url: String,
    auth_key: Option<SecretString>,
    scope: String,
    model: ModelSlot,
    token: RwLock<Option<CachedToken>>,
}

impl GigaChatProvider {
    /// Build the provider
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when neither an auth key nor an access
    /// token is configured, or an HTTP error if the client cannot be built.
    pub fn new(config: GigaChatConfig) -> Result<Self> {
        let auth_key = config
            .auth_key
            .filter(|k| !k.expose_secret().trim().is_empty());
        let seeded = config
            .access_token
            .filter(|t| !t.expose_secret().trim().is_empty())
            .map(|value| CachedToken {
                value,
                expires_at: Utc::now() + TimeDelta::minutes(DEFAULT_TOKEN_TTL_MINS),
            });

        if auth_key.is_none() && seeded.is_none() {
            return Err(Error::Config(
                "GIGACHAT_AUTH_KEY or GIGACHAT_ACCESS_TOKEN must be set".to_string(),
            ));
        }

        Ok(Self {
            client: build_client(config.skip_tls_verify, config.timeout)?,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            auth_url: config.auth_url,
            auth_key,
            scope: config.scope,
            model: ModelSlot::new(config.model),
            token: RwLock::new(seeded),
        })
    }

    /// Current bearer token, refreshing it if stale
    ///
    /// # Errors
    ///
    /// Returns [`Error::Auth`] when the token is stale and cannot be
    /// refreshed.
    pub async fn access_token(&self) -> Result<String> {
        {
            let cached = self.token.read().await;
            if let Some(token) = cached.as_ref().filter(|t| t.is_fresh(Utc::now())) {
                return Ok(token.value.expose_secret().to_string());
            }
        }

        let mut cached = self.token.write().await;
        // another caller may have refreshed while we waited
        if let Some(token) = cached.as_ref().filter(|t| t.is_fresh(Utc::now())) {
            return Ok(token.value.expose_secret().to_string());
        }

        let fresh = self.refresh().await?;
        let value = fresh.value.expose_secret().to_string();
        *cached = Some(fresh);
        Ok(value)
    }

    async fn refresh(&self) -> Result<CachedToken> {
        let Some(auth_key) = self.auth_key.as_ref() else {
            return Err(Error::Auth(
                "access token expired and no auth key is configured".to_string(),
            ));
        };

        let response = self
            .client
            .post(&self.auth_url)
            .header("Authorization", format!("Basic {}", auth_key.expose_secret()))
            .header("RqUID", Uuid::new_v4().to_string())
            .header("Accept", "application/json")
            .form(&[("scope", self.scope.as_str())])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Auth(format!(
                "token request failed: {} - {body}",
                status.as_u16()
            )));
        }

        let token: TokenResponse = response.json().await?;
        if token.access_token.is_empty() {
            return Err(Error::Auth("token response has no access_token".to_string()));
        }

        let expires_at = token
            .expires_at
            .filter(|ms| *ms > 0)
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or_else(|| Utc::now() + TimeDelta::minutes(DEFAULT_TOKEN_TTL_MINS));

        tracing::info!(%expires_at, "gigachat token refreshed");

        Ok(CachedToken {
            value: SecretString::from(token.access_token),
            expires_at,
        })
    }
}

fn trusted_root_candidates() -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = TRUSTED_ROOT_PATHS.iter().map(PathBuf::from).collect();
    if let Some(base) = directories::BaseDirs::new() {
        paths.push(
            base.home_dir()
                .join(".local/share/ca-certificates/russian_trusted_root_ca.crt"),
        );
    }
    paths
}

fn build_client(skip_tls_verify: bool, timeout: Duration) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().timeout(timeout);

    if skip_tls_verify {
        tracing::warn!("gigachat TLS certificate verification is disabled");
        return Ok(builder.danger_accept_invalid_certs(true).build()?);
    }

    for path in trusted_root_candidates() {
        let Ok(pem) = std::fs::read(&path) else {
            continue;
        };
        match reqwest::Certificate::from_pem(&pem) {
            Ok(cert) => {
                tracing::debug!(path = %path.display(), "added extra root certificate");
                builder = builder.add_root_certificate(cert);
                break;
            }
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "unusable certificate file");
            }
        }
    }

    Ok(builder.build()?)
}

fn max_tokens_for(model: &str) -> u32 {
    match model {
        "GigaChat-Pro" => 32_768,
        "GigaChat-Plus" => 8_192,
        _ => 4_096,
    }
}

#[async_trait]
impl Provider for GigaChatProvider {
    fn name(&self) -> &str {
        "gigachat"
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
        let token = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::Cancelled),
            token = self.access_token() => token?,
        };

        let model = self.model.resolve(options);
        let messages = prompt::build_messages(message, options);
        let body = CompletionRequest {
            model: &model,
            messages: &messages,
            stream: true,
            max_tokens: options.max_tokens,
            temperature: options.temperature,
        };

        tracing::debug!(%model, messages = messages.len(), "sending gigachat request");

        let request = self
            .client
            .post(format!("{}/chat/completions", self.api_url))
            .bearer_auth(token)
            .header("Accept", "text/event-stream")
            .json(&body);

        let response = stream::send(request, "gigachat", cancel).await?;
        stream::pump(response.bytes_stream(), WireFormat::Sse, cancel, sink).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_token(token: &str) -> GigaChatProvider {
        GigaChatProvider::new(GigaChatConfig {
            access_token: Some(SecretString::from(token.to_string())),
            skip_tls_verify: true,
            ..GigaChatConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn requires_some_credential() {
        let err = GigaChatProvider::new(GigaChatConfig::default()).err().unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn preset_token_is_served_from_cache() {
        let provider = with_token("preset");
        assert_eq!(provider.access_token().await.unwrap(), "preset");
    }

    #[tokio::test]
    async fn stale_token_without_key_is_an_auth_error() {
        let provider = with_token("preset");
        *provider.token.write().await = Some(CachedToken {
            value: SecretString::from("old".to_string()),
            expires_at: Utc::now() + TimeDelta::seconds(30),
        });
        let err = provider.access_token().await.unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
    }

    #[test]
    fn freshness_requires_a_minute_of_margin() {
        let now = Utc::now();
        let token = |secs| CachedToken {
            value: SecretString::from("t".to_string()),
            expires_at: now + TimeDelta::seconds(secs),
        };
        assert!(!token(59).is_fresh(now));
        assert!(token(61).is_fresh(now));
    }

    #[test]
    fn context_window_per_model() {
        assert_eq!(max_tokens_for("GigaChat-Pro"), 32_768);
        assert_eq!(max_tokens_for("GigaChat-Plus"), 8_192);
        assert_eq!(max_tokens_for("GigaChat"), 4_096);
    }

    #[test]
    fn pricing_is_per_thousand_tokens() {
        let cost = with_token("t").calculate_cost(1000, 500);
        assert!((cost - 0.002).abs() < 1e-12);
    }
}
