//! Coarse token estimation
//!
//! A character-count heuristic (roughly four characters per token for
//! Russian and English text). It is only used for request accounting and
//! cost estimates, never to decide what gets truncated.

use crate::providers::ChatMessage;

/// Fixed per-message formatting overhead
const MESSAGE_OVERHEAD: usize = 2;

/// Fixed per-request envelope overhead
const REQUEST_OVERHEAD: usize = 10;

/// Estimate the token count of `text`
///
/// Returns `chars / 4`, with a floor of 1 for any non-empty text.
#[must_use]
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    (text.chars().count() / 4).max(1)
}

/// Estimate the prompt size of a full chat request
///
/// Counts the system prompt, every history entry (role, content and a
/// small formatting overhead) and the outgoing message.
#[must_use]
pub fn estimate_request_tokens(
    system_prompt: Option<&str>,
    history: &[ChatMessage],
    message: &str,
) -> usize {
    let system = system_prompt.map_or(0, estimate_tokens);
    let history: usize = history
        .iter()
        .map(|m| estimate_tokens(&m.role) + estimate_tokens(&m.content) + MESSAGE_OVERHEAD)
        .sum();

    system + history + estimate_tokens(message) + REQUEST_OVERHEAD
}
