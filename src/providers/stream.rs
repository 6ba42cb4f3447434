//! Upstream response framing
//!
//! Both wire formats are line oriented: GigaChat and Groq emit
//! OpenAI-style server-sent events, Ollama emits one JSON object per line.
//! Bytes are buffered until a full line is available, so a chunk boundary
//! may fall anywhere, including inside a multi-byte character.

use futures::{Stream, StreamExt};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::ChunkSink;
use crate::{Error, Result};

/// Line framing used by an upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    /// `data: {json}` lines terminated by `data: [DONE]`
    Sse,
    /// One JSON object per line, terminated by `"done": true`
    NdJson,
}

/// What a single line contributes to the reply
#[derive(Debug, Default, PartialEq, Eq)]
pub struct LineOutcome {
    pub content: Option<String>,
    pub done: bool,
}

impl WireFormat {
    /// Interpret one already-trimmed line
    #[must_use]
    pub fn parse_line(self, line: &str) -> LineOutcome {
        match self {
            Self::Sse => parse_sse_line(line),
            Self::NdJson => parse_ndjson_line(line),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SseChunk {
    #[serde(default)]
    choices: Vec<SseChoice>,
}

#[derive(Debug, Deserialize)]
struct SseChoice {
    delta: Option<SseContent>,
    message: Option<SseContent>,
}

#[derive(Debug, Deserialize)]
struct SseContent {
    #[serde(default)]
    content: Option<String>,
}

fn parse_sse_line(line: &str) -> LineOutcome {
    let Some(data) = line.strip_prefix("data: ") else {
        return LineOutcome::default();
    };
    if data.trim() == "[DONE]" {
        return LineOutcome {
            content: None,
            done: true,
        };
    }

    let Ok(chunk) = serde_json::from_str::<SseChunk>(data) else {
        tracing::debug!(line = %data, "skipping malformed stream line");
        return LineOutcome::default();
    };

    // delta wins whenever it is present, even if its content is empty
    let content = chunk.choices.into_iter().next().and_then(|choice| {
        choice
            .delta
            .map_or(choice.message, Some)
            .and_then(|c| c.content)
    });

    LineOutcome {
        content: content.filter(|c| !c.is_empty()),
        done: false,
    }
}

#[derive(Debug, Deserialize)]
struct NdJsonChunk {
    message: Option<SseContent>,
    #[serde(default)]
    done: bool,
}

fn parse_ndjson_line(line: &str) -> LineOutcome {
    let Ok(chunk) = serde_json::from_str::<NdJsonChunk>(line) else {
        tracing::debug!(%line, "skipping malformed stream line");
        return LineOutcome::default();
    };

    LineOutcome {
        content: chunk
            .message
            .and_then(|m| m.content)
            .filter(|c| !c.is_empty()),
        done: chunk.done,
    }
}

/// Splits a byte stream into trimmed, non-empty text lines
#[derive(Debug, Default)]
pub struct LineDecoder {
    buf: Vec<u8>,
}

impl LineDecoder {
    /// Append bytes and drain every complete line
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            push_line(&mut lines, &raw);
        }
        lines
    }

    /// Remaining unterminated line, if any
    #[must_use]
    pub fn finish(self) -> Option<String> {
        let mut lines = Vec::new();
        push_line(&mut lines, &self.buf);
        lines.pop()
    }
}

fn push_line(lines: &mut Vec<String>, raw: &[u8]) {
    let text = String::from_utf8_lossy(raw);
    let trimmed = text.trim();
    if !trimmed.is_empty() {
        lines.push(trimmed.to_string());
    }
}

/// Drive an upstream byte stream into `sink`
///
/// Returns once the terminator line is seen or the stream ends.
///
/// # Errors
///
/// [`Error::Cancelled`] when `cancel` fires, the transport error when a read
/// fails, or the sink's own error.
pub async fn pump<S, B, E>(
    stream: S,
    format: WireFormat,
    cancel: &CancellationToken,
    sink: &mut dyn ChunkSink,
) -> Result<()>
where
    S: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
    E: Into<Error>,
{
    let mut stream = std::pin::pin!(stream);
    let mut decoder = LineDecoder::default();

    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::Cancelled),
            next = stream.next() => next,
        };
        let Some(chunk) = next else { break };
        let chunk = chunk.map_err(Into::into)?;

        for line in decoder.feed(chunk.as_ref()) {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if forward_line(format, &line, sink).await? {
                return Ok(());
            }
        }
    }

    if let Some(line) = decoder.finish() {
        forward_line(format, &line, sink).await?;
    }
    Ok(())
}

/// Returns `true` when the line terminates the reply
async fn forward_line(format: WireFormat, line: &str, sink: &mut dyn ChunkSink) -> Result<bool> {
    let outcome = format.parse_line(line);
    if let Some(content) = outcome.content {
        sink.on_chunk(&content).await?;
    }
    Ok(outcome.done)
}

/// Send a prepared request, racing it against cancellation
///
/// # Errors
///
/// [`Error::Upstream`] with the response body for any non-success status.
pub async fn send(
    request: reqwest::RequestBuilder,
    provider: &'static str,
    cancel: &CancellationToken,
) -> Result<reqwest::Response> {
    let response = tokio::select! {
        biased;
        () = cancel.cancelled() => return Err(Error::Cancelled),
        response = request.send() => response?,
    };

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    tracing::warn!(provider, status = status.as_u16(), "upstream rejected request");
    Err(Error::Upstream {
        provider,
        status: status.as_u16(),
        body,
    })
}
