//! Rolling history compression
//!
//! Once a session holds more than `keep_last + every` user/assistant
//! messages, the oldest `every` of them are folded into the session's
//! single summary and deleted. The newest `keep_last` messages are never
//! touched. Rounds repeat until the session is back under the threshold.
//!
//! The summary is always written before the batch is deleted, so a failure
//! between the two steps can only leave duplicated information behind,
//! never lost information.

use std::fmt::Write as _;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::{Message, MessageRole, MessageStore};
use crate::providers::{ChatOptions, Provider};
use crate::Error;

/// Longest summary kept, in characters
pub const SUMMARY_MAX_CHARS: usize = 4000;

const SUMMARIZER_SYSTEM_PROMPT: &str =
    "You are a dialogue history compression module. Reply with the summary only.";

const DEFAULT_EVERY_MESSAGES: usize = 10;
const DEFAULT_KEEP_LAST_MESSAGES: usize = 4;
const DEFAULT_MAX_TOKENS: u32 = 256;
const DEFAULT_TEMPERATURE: f32 = 0.2;

/// Compression settings
#[derive(Debug, Clone, PartialEq)]
pub struct CompressionConfig {
    pub enabled: bool,
    /// Messages folded into the summary per round
    pub every_messages: usize,
    /// Newest messages that are never compressed
    pub keep_last_messages: usize,
    /// Output budget of one summarization call
    pub max_tokens: u32,
    pub temperature: f32,
    /// Pause between consecutive rounds
    pub round_pause: Duration,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            every_messages: DEFAULT_EVERY_MESSAGES,
            keep_last_messages: DEFAULT_KEEP_LAST_MESSAGES,
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            round_pause: Duration::from_millis(50),
        }
    }
}

impl CompressionConfig {
    /// Replace unusable values with defaults
    #[must_use]
    pub fn normalized(mut self) -> Self {
        if self.every_messages == 0 {
            self.every_messages = DEFAULT_EVERY_MESSAGES;
        }
        if self.max_tokens == 0 {
            self.max_tokens = DEFAULT_MAX_TOKENS;
        }
        if !self.temperature.is_finite() || self.temperature <= 0.0 {
            self.temperature = DEFAULT_TEMPERATURE;
        }
        self
    }

    /// Message count above which a round runs
    #[must_use]
    pub const fn threshold(&self) -> usize {
        self.keep_last_messages.saturating_add(self.every_messages)
    }
}

/// Outcome of a successful compression pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CompressionReport {
    pub rounds: usize,
    pub messages_compressed: usize,
}

impl CompressionReport {
    /// Whether at least one round completed
    #[must_use]
    pub const fn compressed(&self) -> bool {
        self.rounds > 0
    }
}

/// A failed compression pass, carrying the progress made before the failure
#[derive(Debug, thiserror::Error)]
#[error("history compression stopped after {rounds} round(s): {source}")]
pub struct CompressionError {
    pub rounds: usize,
    pub messages_compressed: usize,
    pub source: Error,
}

impl CompressionError {
    /// Whether at least one round completed before the failure
    #[must_use]
    pub const fn compressed(&self) -> bool {
        self.rounds > 0
    }

    #[must_use]
    pub const fn report(&self) -> CompressionReport {
        CompressionReport {
            rounds: self.rounds,
            messages_compressed: self.messages_compressed,
        }
    }
}

/// Stateless driver of compression rounds
#[derive(Debug, Clone)]
pub struct HistoryCompressor {
    config: CompressionConfig,
}

impl HistoryCompressor {
    #[must_use]
    pub fn new(config: CompressionConfig) -> Self {
        Self {
            config: config.normalized(),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &CompressionConfig {
        &self.config
    }

    /// Compress the session until it is back under the threshold
    ///
    /// Callers must hold the session's lock from [`super::SessionLocks`];
    /// two passes over one session at the same time could summarize the
    /// same batch twice.
    ///
    /// # Errors
    ///
    /// Any store or provider failure, an empty summary, or cancellation
    /// stops the pass. The error reports the rounds already completed.
    pub async fn compress_if_needed(
        &self,
        provider: &dyn Provider,
        store: &dyn MessageStore,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> Result<CompressionReport, CompressionError> {
        let mut report = CompressionReport::default();
        if session_id.is_empty() || !self.config.enabled {
            return Ok(report);
        }

        let fail = |report: CompressionReport, source: Error| CompressionError {
            rounds: report.rounds,
            messages_compressed: report.messages_compressed,
            source,
        };

        loop {
            if cancel.is_cancelled() {
                return Err(fail(report, Error::Cancelled));
            }

            let count = store
                .count_non_summary_messages(session_id)
                .map_err(|e| fail(report, e))?;
            if count <= self.config.threshold() {
                return Ok(report);
            }

            let batch = store
                .oldest_non_summary_messages(
                    session_id,
                    self.config.every_messages,
                    self.config.keep_last_messages,
                )
                .map_err(|e| fail(report, e))?;
            if batch.len() < self.config.every_messages {
                return Ok(report);
            }

            let previous = store
                .latest_summary(session_id)
                .map_err(|e| fail(report, e))?;
            let prompt = build_summary_prompt(previous.as_ref(), &batch);

            let summary = self
                .summarize(provider, &prompt, cancel)
                .await
                .map_err(|e| fail(report, e))?;

            store
                .upsert_summary(session_id, &summary)
                .map_err(|e| fail(report, e))?;

            let ids: Vec<i64> = batch.iter().map(|m| m.id).collect();
            store
                .delete_messages_by_ids(session_id, &ids)
                .map_err(|e| fail(report, e))?;

            report.rounds += 1;
            report.messages_compressed += batch.len();
            tracing::info!(
                session = session_id,
                compressed = batch.len(),
                summary_chars = summary.chars().count(),
                "history compressed"
            );

            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(self.config.round_pause) => {}
            }
        }
    }

    async fn summarize(
        &self,
        provider: &dyn Provider,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> crate::Result<String> {
        let options = ChatOptions {
            system_prompt: Some(SUMMARIZER_SYSTEM_PROMPT.to_string()),
            max_tokens: Some(self.config.max_tokens),
            temperature: Some(self.config.temperature),
            ..ChatOptions::default()
        };

        let mut out = String::new();
        provider.chat(prompt, &options, cancel, &mut out).await?;

        let trimmed = out.trim();
        if trimmed.is_empty() {
            return Err(Error::EmptySummary);
        }

        let truncated: String = trimmed.chars().take(SUMMARY_MAX_CHARS).collect();
        Ok(truncated.trim().to_string())
    }
}

/// Prompt asking the model to fold `batch` into `previous`
#[must_use]
pub fn build_summary_prompt(previous: Option<&Message>, batch: &[Message]) -> String {
    let mut prompt = String::from(
        "Task: update the short summary of a dialogue.\n\
         Requirements:\n\
         - Preserve facts, requirements, constraints, decisions made, current status and open questions.\n\
         - Keep important values, identifiers, paths and commands if they were mentioned.\n\
         - Do not invent details.\n\
         - Output compact plain text without markdown.\n\
         - Be brief, but never drop critical information.\n\n",
    );

    if let Some(previous) = previous.filter(|p| !p.content.trim().is_empty()) {
        prompt.push_str("Current summary (update it):\n");
        prompt.push_str(&previous.content);
        prompt.push_str("\n\n");
    }

    prompt.push_str("New messages to include in the summary:\n");
    for message in batch {
        let label = match message.role {
            MessageRole::User => "USER".to_string(),
            MessageRole::Assistant => "ASSISTANT".to_string(),
            other => other.as_str().to_uppercase(),
        };
        let _ = writeln!(prompt, "{label}: {}", message.content);
    }

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn message(id: i64, role: MessageRole, content: &str) -> Message {
        Message {
            id,
            session_id: "s".to_string(),
            role,
            content: content.to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn normalization_restores_defaults() {
        let config = CompressionConfig {
            every_messages: 0,
            max_tokens: 0,
            temperature: f32::NAN,
            ..CompressionConfig::default()
        }
        .normalized();

        assert_eq!(config.every_messages, 10);
        assert_eq!(config.max_tokens, 256);
        assert!((config.temperature - 0.2).abs() < f32::EPSILON);

        let negative = CompressionConfig {
            temperature: -1.0,
            ..CompressionConfig::default()
        }
        .normalized();
        assert!((negative.temperature - 0.2).abs() < f32::EPSILON);
    }

    #[test]
    fn keep_last_zero_is_allowed() {
        let config = CompressionConfig {
            keep_last_messages: 0,
            ..CompressionConfig::default()
        }
        .normalized();
        assert_eq!(config.keep_last_messages, 0);
        assert_eq!(config.threshold(), 10);
    }

    #[test]
    fn huge_tail_saturates_threshold() {
        let config = CompressionConfig {
            keep_last_messages: usize::MAX,
            ..CompressionConfig::default()
        }
        .normalized();
        assert_eq!(config.threshold(), usize::MAX);
    }

    #[test]
    fn prompt_labels_roles_and_includes_previous_summary() {
        let previous = message(1, MessageRole::Summary, "User is called Ann.");
        let batch = [
            message(2, MessageRole::User, "Deploy to /srv/app"),
            message(3, MessageRole::Assistant, "Run make deploy"),
        ];
        let prompt = build_summary_prompt(Some(&previous), &batch);

        assert!(prompt.contains("Current summary (update it):\nUser is called Ann.\n\n"));
        assert!(prompt.contains("USER: Deploy to /srv/app\nASSISTANT: Run make deploy\n"));
        assert!(prompt.find("Current summary").unwrap() < prompt.find("New messages").unwrap());
    }

    #[test]
    fn blank_previous_summary_is_omitted() {
        let previous = message(1, MessageRole::Summary, "  \n ");
        let prompt = build_summary_prompt(Some(&previous), &[message(2, MessageRole::User, "x")]);
        assert!(!prompt.contains("Current summary"));
    }

    #[test]
    fn report_flags_progress() {
        assert!(!CompressionReport::default().compressed());
        let err = CompressionError {
            rounds: 2,
            messages_compressed: 20,
            source: Error::EmptySummary,
        };
        assert!(err.compressed());
        assert_eq!(err.report().messages_compressed, 20);
        assert!(err.to_string().contains("2 round(s)"));
    }
}
