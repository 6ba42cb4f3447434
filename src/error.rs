//! Error types for the Chorus gateway

use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the Chorus gateway
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Caller supplied an unusable value
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Requested provider is not registered
    #[error("provider not found: {0}")]
    ProviderNotFound(String),

    /// Upstream credential exchange failed
    #[error("auth error: {0}")]
    Auth(String),

    /// Upstream answered with a non-success status before streaming began
    #[error("{provider} API error: {status} - {body}")]
    Upstream {
        provider: &'static str,
        status: u16,
        body: String,
    },

    /// Summarizer produced no text, so nothing may be deleted
    #[error("summarizer returned an empty summary")]
    EmptySummary,

    /// Operation was cancelled by its caller
    #[error("operation cancelled")]
    Cancelled,

    /// The consumer of a streamed reply went away
    #[error("client disconnected")]
    ClientDisconnected,

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Whether this error represents a caller-side cancellation
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::ClientDisconnected)
    }
}
