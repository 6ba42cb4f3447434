use super::{Message, MessageRole};
use crate::Result;

/// Persistence contract consumed by the compressor and the chat service
///
/// "Non-summary" messages are the user and assistant turns. Implementations
/// must keep at most one summary per session: [`upsert_summary`] updates
/// the existing one in place when present.
///
/// [`upsert_summary`]: MessageStore::upsert_summary
pub trait MessageStore: Send + Sync {
    /// Append a message and return it with its assigned id
    ///
    /// # Errors
    ///
    /// Returns error if the write fails
    fn save_message(&self, session_id: &str, role: MessageRole, content: &str) -> Result<Message>;

    /// The most recent `limit` messages of any role, oldest first
    ///
    /// # Errors
    ///
    /// Returns error if the read fails
    fn get_messages(&self, session_id: &str, limit: usize) -> Result<Vec<Message>>;

    /// The most recent `limit` user/assistant messages, oldest first
    ///
    /// # Errors
    ///
    /// Returns error if the read fails
    fn recent_non_summary_messages(&self, session_id: &str, limit: usize) -> Result<Vec<Message>>;

    /// Number of user and assistant messages in the session
    ///
    /// # Errors
    ///
    /// Returns error if the read fails
    fn count_non_summary_messages(&self, session_id: &str) -> Result<usize>;

    /// Up to `batch` of the oldest user/assistant messages, ascending by id,
    /// never including the `keep_last` highest-id ones
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidInput`] when `batch` is zero, or an
    /// error if the read fails
    fn oldest_non_summary_messages(
        &self,
        session_id: &str,
        batch: usize,
        keep_last: usize,
    ) -> Result<Vec<Message>>;

    /// The session's summary, if any
    ///
    /// # Errors
    ///
    /// Returns error if the read fails
    fn latest_summary(&self, session_id: &str) -> Result<Option<Message>>;

    /// Create the summary or replace the content of the existing one
    ///
    /// # Errors
    ///
    /// Returns error if the write fails
    fn upsert_summary(&self, session_id: &str, content: &str) -> Result<Message>;

    /// Delete the given messages of the session; empty `ids` is a no-op
    ///
    /// # Errors
    ///
    /// Returns error if the write fails
    fn delete_messages_by_ids(&self, session_id: &str, ids: &[i64]) -> Result<()>;
}
