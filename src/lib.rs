//! Chorus Gateway - streaming LLM chat gateway with history compression
//!
//! This library provides the core functionality for the Chorus gateway:
//! - A uniform streaming contract over GigaChat, Groq and Ollama
//! - Session history in `SQLite` with rolling summarization
//! - An HTTP API that relays replies as server-sent events
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                   HTTP API (axum)                    │
//! │   /api/v2/chat (SSE) │ providers │ history │ logs   │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                   ChatService                        │
//! │  session locks │ history store │ compressor │ logs  │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                ProviderRegistry                      │
//! │        GigaChat  │  Groq  │  Ollama                 │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod chat;
pub mod config;
pub mod db;
pub mod error;
pub mod history;
pub mod providers;
pub mod tokens;

pub use chat::{ChatOutcome, ChatRequest, ChatService};
pub use config::Config;
pub use db::{DbConn, DbPool};
pub use error::{Error, Result};
pub use history::{HistoryCompressor, MessageStore};
pub use providers::{ChunkSink, Provider, ProviderKind, ProviderRegistry};
