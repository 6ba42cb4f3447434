//! Configuration management for the Chorus gateway
//!
//! Values are resolved in layers: built-in defaults, then the TOML file,
//! then environment variables. The binary applies CLI flags last.

pub mod file;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::history::CompressionConfig;
use crate::providers::{
    GigaChatConfig, GroqConfig, OllamaConfig, ProviderKind, gigachat, groq, ollama,
};
use crate::{Error, Result};

use self::file::ChorusConfigFile;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_MAX_REQUEST_BODY_SIZE: usize = 1 << 20;
pub const DEFAULT_MAX_QUERY_LIMIT: usize = 1000;
pub const DEFAULT_QUERY_LIMIT: usize = 100;

/// Chorus gateway configuration
#[derive(Debug)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub providers: ProvidersConfig,
    /// Messages loaded into each chat request
    pub history_limit: usize,
    pub compression: CompressionConfig,
}

/// HTTP API server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub database_path: PathBuf,
    pub max_request_body_size: usize,
    pub max_query_limit: usize,
    pub default_query_limit: usize,
    pub cors_allowed_origins: Vec<String>,
    /// Frontend bundle served at `/`, if any
    pub static_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            database_path: default_database_path(),
            max_request_body_size: DEFAULT_MAX_REQUEST_BODY_SIZE,
            max_query_limit: DEFAULT_MAX_QUERY_LIMIT,
            default_query_limit: DEFAULT_QUERY_LIMIT,
            cors_allowed_origins: vec!["*".to_string()],
            static_dir: None,
        }
    }
}

impl ServerConfig {
    /// Resolve a caller-supplied `limit` against the configured bounds
    #[must_use]
    pub fn clamp_limit(&self, requested: Option<usize>) -> usize {
        requested
            .filter(|l| *l > 0)
            .unwrap_or(self.default_query_limit)
            .min(self.max_query_limit)
    }

    /// Whether any origin is allowed
    #[must_use]
    pub fn allows_any_origin(&self) -> bool {
        self.cors_allowed_origins.iter().any(|o| o == "*")
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(Error::Config(format!("unknown log format: {other}"))),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Text => "text",
            Self::Json => "json",
        })
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// Which providers to build and how
#[derive(Debug)]
pub struct ProvidersConfig {
    pub default: ProviderKind,
    pub gigachat: Option<GigaChatConfig>,
    pub groq: Option<GroqConfig>,
    pub ollama: Option<OllamaConfig>,
}

/// Default database location: `~/.local/share/chorus/chorus.db`
#[must_use]
pub fn default_database_path() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from("chorus.db"),
        |d| d.data_dir().join("chorus").join("chorus.db"),
    )
}

/// Source of environment overrides
pub trait EnvSource {
    fn var(&self, key: &str) -> Option<String>;
}

/// The process environment
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|v| !v.trim().is_empty())
    }
}

impl<F> EnvSource for F
where
    F: Fn(&str) -> Option<String>,
{
    fn var(&self, key: &str) -> Option<String> {
        self(key)
    }
}

fn parse_env<T: FromStr>(env: &dyn EnvSource, key: &str) -> Result<Option<T>> {
    env.var(key)
        .map(|v| {
            v.trim()
                .parse::<T>()
                .map_err(|_| Error::Config(format!("invalid value for {key}: {v}")))
        })
        .transpose()
}

fn parse_bool(env: &dyn EnvSource, key: &str) -> Option<bool> {
    env.var(key)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

fn secret(value: Option<String>) -> Option<SecretString> {
    value
        .filter(|v| !v.trim().is_empty())
        .map(SecretString::from)
}

impl Config {
    /// Load from the config file and the process environment
    ///
    /// An explicit `path` must exist; otherwise the standard location is
    /// used when present.
    ///
    /// # Errors
    ///
    /// Returns error if the explicit file cannot be loaded, an environment
    /// override does not parse, or the result is inconsistent
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => file::load_from(path)?,
            None => file::load_config_file(),
        };
        Self::resolve(file, &ProcessEnv)
    }

    /// Merge a parsed file with environment overrides
    ///
    /// # Errors
    ///
    /// Returns error if an override does not parse or validation fails
    #[allow(clippy::too_many_lines)]
    pub fn resolve(file: ChorusConfigFile, env: &dyn EnvSource) -> Result<Self> {
        let defaults = ServerConfig::default();
        let fs = file.server;

        let server = ServerConfig {
            host: env.var("CHORUS_HOST").or(fs.host).unwrap_or(defaults.host),
            port: parse_env(env, "CHORUS_PORT")?
                .or(parse_env(env, "PORT")?)
                .or(fs.port)
                .unwrap_or(defaults.port),
            database_path: env
                .var("CHORUS_DATABASE_PATH")
                .map(PathBuf::from)
                .or(fs.database_path)
                .unwrap_or(defaults.database_path),
            max_request_body_size: fs
                .max_request_body_size
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_request_body_size),
            max_query_limit: fs
                .max_query_limit
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_query_limit),
            default_query_limit: fs
                .default_query_limit
                .filter(|n| *n > 0)
                .unwrap_or(defaults.default_query_limit),
            cors_allowed_origins: env
                .var("CHORUS_CORS_ORIGINS")
                .map(|v| v.split(',').map(|o| o.trim().to_string()).collect())
                .or(fs.cors_allowed_origins)
                .filter(|o: &Vec<String>| !o.is_empty())
                .unwrap_or(defaults.cors_allowed_origins),
            static_dir: env
                .var("CHORUS_STATIC_DIR")
                .map(PathBuf::from)
                .or(fs.static_dir),
        };

        let logging = LoggingConfig {
            level: env
                .var("CHORUS_LOG_LEVEL")
                .or(file.logging.level)
                .unwrap_or_else(|| "info".to_string()),
            format: env
                .var("CHORUS_LOG_FORMAT")
                .or(file.logging.format)
                .map(|f| f.parse())
                .transpose()?
                .unwrap_or_default(),
        };

        let fp = file.providers;
        let default = env
            .var("CHORUS_DEFAULT_PROVIDER")
            .or(fp.default)
            .map(|p| p.parse::<ProviderKind>())
            .transpose()
            .map_err(|e| Error::Config(e.to_string()))?
            .unwrap_or(ProviderKind::GigaChat);

        let gc = fp.gigachat;
        let gigachat_config = GigaChatConfig {
            auth_key: secret(env.var("GIGACHAT_AUTH_KEY").or(gc.auth_key)),
            access_token: secret(env.var("GIGACHAT_ACCESS_TOKEN").or(gc.access_token)),
            api_url: env
                .var("GIGACHAT_API_URL")
                .or(gc.api_url)
                .unwrap_or_else(|| gigachat::DEFAULT_API_URL.to_string()),
            auth_url: env
                .var("GIGACHAT_AUTH_URL")
                .or(gc.auth_url)
                .unwrap_or_else(|| gigachat::DEFAULT_AUTH_URL.to_string()),
            model: env
                .var("GIGACHAT_MODEL")
                .or(gc.model)
                .unwrap_or_else(|| gigachat::DEFAULT_MODEL.to_string()),
            scope: env
                .var("GIGACHAT_SCOPE")
                .or(gc.scope)
                .unwrap_or_else(|| gigachat::DEFAULT_SCOPE.to_string()),
            skip_tls_verify: parse_bool(env, "GIGACHAT_SKIP_TLS_VERIFY")
                .or(gc.skip_tls_verify)
                .unwrap_or(false),
            timeout: Duration::from_secs(gc.timeout_secs.unwrap_or(60)),
        };
        let gigachat_has_credentials =
            gigachat_config.auth_key.is_some() || gigachat_config.access_token.is_some();
        let gigachat = (gc.enabled.unwrap_or(true) && gigachat_has_credentials)
            .then_some(gigachat_config);

        let gq = fp.groq;
        let groq_config = GroqConfig {
            api_key: secret(env.var("GROQ_API_KEY").or(gq.api_key)),
            api_url: env
                .var("GROQ_API_URL")
                .or(gq.api_url)
                .unwrap_or_else(|| groq::DEFAULT_API_URL.to_string()),
            model: env
                .var("GROQ_MODEL")
                .or(gq.model)
                .unwrap_or_else(|| groq::DEFAULT_MODEL.to_string()),
            timeout: Duration::from_secs(gq.timeout_secs.unwrap_or(120)),
        };
        let groq = (gq.enabled.unwrap_or(true) && groq_config.api_key.is_some())
            .then_some(groq_config);

        let ol = fp.ollama;
        let ollama = ol.enabled.unwrap_or(true).then(|| OllamaConfig {
            api_url: env
                .var("OLLAMA_URL")
                .or(ol.api_url)
                .unwrap_or_else(|| ollama::DEFAULT_API_URL.to_string()),
            model: env
                .var("OLLAMA_MODEL")
                .or(ol.model)
                .unwrap_or_else(|| ollama::DEFAULT_MODEL.to_string()),
            timeout: Duration::from_secs(ol.timeout_secs.unwrap_or(300)),
        });

        let fh = file.history;
        let base = CompressionConfig::default();
        let compression = CompressionConfig {
            enabled: parse_bool(env, "CHORUS_HISTORY_COMPRESSION")
                .or(fh.compression_enabled)
                .unwrap_or(base.enabled),
            every_messages: parse_env(env, "CHORUS_HISTORY_EVERY")?
                .or(fh.every_messages)
                .unwrap_or(base.every_messages),
            keep_last_messages: parse_env(env, "CHORUS_HISTORY_KEEP_LAST")?
                .or(fh.keep_last_messages)
                .unwrap_or(base.keep_last_messages),
            max_tokens: fh.max_tokens.unwrap_or(base.max_tokens),
            temperature: fh.temperature.unwrap_or(base.temperature),
            round_pause: base.round_pause,
        }
        .normalized();

        let config = Self {
            server,
            logging,
            providers: ProvidersConfig {
                default,
                gigachat,
                groq,
                ollama,
            },
            history_limit: fh
                .limit
                .filter(|n| *n > 0)
                .unwrap_or(crate::chat::DEFAULT_HISTORY_LIMIT),
            compression,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field consistency
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first problem found
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(Error::Config("port must be non-zero".to_string()));
        }
        if self.server.default_query_limit > self.server.max_query_limit {
            return Err(Error::Config(format!(
                "default_query_limit ({}) exceeds max_query_limit ({})",
                self.server.default_query_limit, self.server.max_query_limit
            )));
        }
        Ok(())
    }
}
