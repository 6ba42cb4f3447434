//! TOML configuration file loading
//!
//! Supports `~/.config/chorus/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::Result;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct ChorusConfigFile {
    #[serde(default)]
    pub server: ServerFileConfig,

    #[serde(default)]
    pub logging: LoggingFileConfig,

    #[serde(default)]
    pub providers: ProvidersFileConfig,

    #[serde(default)]
    pub history: HistoryFileConfig,
}

/// HTTP server and storage settings
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database_path: Option<PathBuf>,
    /// Request body limit in bytes
    pub max_request_body_size: Option<usize>,
    /// Upper bound for `limit` query parameters
    pub max_query_limit: Option<usize>,
    /// `limit` used when a query omits it
    pub default_query_limit: Option<usize>,
    /// `["*"]` allows any origin
    pub cors_allowed_origins: Option<Vec<String>>,
    /// Frontend bundle served for paths no route matches
    pub static_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LoggingFileConfig {
    /// `trace`, `debug`, `info`, `warn` or `error`
    pub level: Option<String>,
    /// `text` or `json`
    pub format: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ProvidersFileConfig {
    /// Provider used when a request names none
    pub default: Option<String>,

    #[serde(default)]
    pub gigachat: GigaChatFileConfig,

    #[serde(default)]
    pub groq: GroqFileConfig,

    #[serde(default)]
    pub ollama: OllamaFileConfig,
}

#[derive(Debug, Default, Deserialize)]
pub struct GigaChatFileConfig {
    pub enabled: Option<bool>,
    pub auth_key: Option<String>,
    pub access_token: Option<String>,
    pub api_url: Option<String>,
    pub auth_url: Option<String>,
    pub model: Option<String>,
    pub scope: Option<String>,
    pub skip_tls_verify: Option<bool>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct GroqFileConfig {
    pub enabled: Option<bool>,
    pub api_key: Option<String>,
    pub api_url: Option<String>,
    pub model: Option<String>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct OllamaFileConfig {
    pub enabled: Option<bool>,
    pub api_url: Option<String>,
    pub model: Option<String>,
    pub timeout_secs: Option<u64>,
}

/// Rolling summarization of long sessions
#[derive(Debug, Default, Deserialize)]
pub struct HistoryFileConfig {
    /// Messages loaded into each request
    pub limit: Option<usize>,
    pub compression_enabled: Option<bool>,
    pub every_messages: Option<usize>,
    pub keep_last_messages: Option<usize>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

/// Parse a config file from an explicit path
///
/// # Errors
///
/// Returns error if the file cannot be read or is not valid TOML
pub fn load_from(path: &Path) -> Result<ChorusConfigFile> {
    let content = std::fs::read_to_string(path)?;
    let config = toml::from_str(&content)?;
    tracing::info!(path = %path.display(), "loaded config file");
    Ok(config)
}

/// Load the TOML config file from the standard path
///
/// Returns `ChorusConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> ChorusConfigFile {
    let Some(path) = config_file_path() else {
        return ChorusConfigFile::default();
    };

    if !path.exists() {
        return ChorusConfigFile::default();
    }

    load_from(&path).unwrap_or_else(|e| {
        tracing::warn!(
            path = %path.display(),
            error = %e,
            "failed to load config file, using defaults"
        );
        ChorusConfigFile::default()
    })
}

/// Return the config file path: `~/.config/chorus/config.toml`
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("chorus").join("config.toml"))
}
