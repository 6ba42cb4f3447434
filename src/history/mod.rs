//! Conversation history: stored messages, the store contract, per-session
//! locking and rolling summarization

mod compressor;
mod locks;
mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use compressor::{
    CompressionConfig, CompressionError, CompressionReport, HistoryCompressor, SUMMARY_MAX_CHARS,
    build_summary_prompt,
};
pub use locks::SessionLocks;
pub use store::MessageStore;

/// Role of a stored message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    /// Rolling summary of compressed turns, at most one per session
    Summary,
}

impl MessageRole {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Summary => "summary",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "summary" => Some(Self::Summary),
            _ => None,
        }
    }
}

/// A persisted message
///
/// Ids are assigned by the store and grow monotonically within a session,
/// so ordering by id is chronological order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub id: i64,
    pub session_id: String,
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    #[must_use]
    pub const fn is_summary(&self) -> bool {
        matches!(self.role, MessageRole::Summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_names_round_trip() {
        for role in [MessageRole::User, MessageRole::Assistant, MessageRole::Summary] {
            assert_eq!(MessageRole::parse(role.as_str()), Some(role));
        }
        assert_eq!(MessageRole::parse("system"), None);
    }
}
