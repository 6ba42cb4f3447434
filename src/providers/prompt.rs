//! System prompt composition shared by all providers

use serde::{Deserialize, Serialize};

use super::{ChatMessage, ChatOptions};

/// How the model is asked to reason before answering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningMode {
    /// Answer directly, no augmentation
    Direct,
    /// Break the problem into numbered steps
    StepByStep,
    /// Simulate a small panel of experts
    Experts,
}

/// Descriptor exposed by the providers endpoint
#[derive(Debug, Clone, Serialize)]
pub struct ReasoningModeInfo {
    pub id: ReasoningMode,
    pub name: &'static str,
    pub description: &'static str,
}

impl ReasoningMode {
    pub const ALL: [Self; 3] = [Self::Direct, Self::StepByStep, Self::Experts];

    /// Instruction appended to the system prompt, if any
    #[must_use]
    pub const fn instruction(self) -> Option<&'static str> {
        match self {
            Self::Direct => None,
            Self::StepByStep => Some(
                "Solve the task step by step. Number each step, state what it establishes, \
                 and finish with a line starting with \"Answer:\" that gives the final result.",
            ),
            Self::Experts => Some(
                "Answer as a panel of three experts with different backgrounds. Each expert \
                 gives a short opinion in turn, they point out weaknesses in each other's \
                 reasoning, and the panel closes with one agreed conclusion.",
            ),
        }
    }

    #[must_use]
    pub const fn info(self) -> ReasoningModeInfo {
        let (name, description) = match self {
            Self::Direct => ("Direct answer", "Short answer without visible reasoning"),
            Self::StepByStep => ("Step by step", "Breaks the task into explicit steps"),
            Self::Experts => ("Panel of experts", "Several experts give their opinions"),
        };
        ReasoningModeInfo {
            id: self,
            name,
            description,
        }
    }
}

/// Instruction asking for a JSON-only reply
#[must_use]
pub fn json_instruction(schema_text: Option<&str>) -> String {
    let mut out = String::from(
        "Reply with a single valid JSON value and nothing else: no prose, \
         no code fences, no comments.",
    );
    if let Some(schema) = schema_text.map(str::trim).filter(|s| !s.is_empty()) {
        out.push_str("\nThe JSON must follow this structure:\n");
        out.push_str(schema);
    }
    out
}

/// Compose the effective system prompt
///
/// Order: explicit prompt, reasoning augmentation, JSON augmentation,
/// separated by blank lines. `None` when every part is empty.
#[must_use]
pub fn compose_system_prompt(options: &ChatOptions) -> Option<String> {
    let mut parts: Vec<String> = Vec::with_capacity(3);

    if let Some(explicit) = options.system_prompt.as_deref().map(str::trim) {
        if !explicit.is_empty() {
            parts.push(explicit.to_string());
        }
    }
    if let Some(reasoning) = options.reasoning_mode.and_then(ReasoningMode::instruction) {
        parts.push(reasoning.to_string());
    }
    if options.json_format {
        parts.push(json_instruction(options.json_schema_text.as_deref()));
    }

    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n\n"))
    }
}

/// Build the upstream message list: system, history, then the user turn
#[must_use]
pub fn build_messages(message: &str, options: &ChatOptions) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(options.history.len() + 2);
    if let Some(system) = compose_system_prompt(options) {
        messages.push(ChatMessage::system(system));
    }
    messages.extend(options.history.iter().cloned());
    messages.push(ChatMessage::user(message));
    messages
}
