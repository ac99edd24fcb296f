use crate::llm::{FinishReason, LlmResponse, ModelChunk, UsageMetadata};
use cadence_core::Content;

/// Turns raw streaming chunks into partial and final [`LlmResponse`]s.
///
/// Text-only chunks are buffered and surfaced immediately as partial
/// responses. Anything else (function calls, inline data, an empty chunk)
/// first flushes the buffered text as one final response and is then passed
/// through unchanged. When the stream ends, buffered text is flushed only if
/// the model finished with `STOP`; for any other finish reason the partial
/// responses already emitted are the only output.
#[derive(Debug, Default)]
pub struct StreamingResponseAggregator {
    text: String,
    finish_reason: Option<FinishReason>,
    usage: Option<UsageMetadata>,
}

impl StreamingResponseAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk, returning the responses it produces in order.
    pub fn process(&mut self, chunk: ModelChunk) -> Vec<LlmResponse> {
        let response = match chunk {
            ModelChunk::Response(response) => response,
            ModelChunk::Usage(usage) => {
                self.usage = Some(usage);
                return Vec::new();
            }
            ModelChunk::ToolCallCancellation { .. } | ModelChunk::SetupComplete => {
                return Vec::new();
            }
        };

        if response.finish_reason.is_some() {
            self.finish_reason = response.finish_reason;
        }
        if response.usage.is_some() {
            self.usage = response.usage;
        }

        let mut out = Vec::new();

        if response.is_text_only() {
            self.text.push_str(&response.content_text());
            out.push(LlmResponse {
                partial: true,
                ..response
            });
            return out;
        }

        let has_parts = response
            .content
            .as_ref()
            .is_some_and(|c| !c.parts.is_empty());

        // A bare finish marker closes the current run of text.
        if !has_parts && response.finish_reason.is_some() && !self.text.is_empty() {
            if response.finish_reason == Some(FinishReason::Stop) {
                out.extend(self.flush());
            }
            return out;
        }

        if !self.text.is_empty() {
            out.extend(self.flush());
        }
        out.push(LlmResponse {
            partial: false,
            ..response
        });
        out
    }

    /// Ends the stream, returning the final text response if one is due.
    pub fn close(&mut self) -> Option<LlmResponse> {
        if self.finish_reason == Some(FinishReason::Stop) {
            self.flush()
        } else {
            self.text.clear();
            None
        }
    }

    fn flush(&mut self) -> Option<LlmResponse> {
        if self.text.is_empty() {
            return None;
        }
        let text = std::mem::take(&mut self.text);
        Some(LlmResponse {
            content: Some(Content::model_text(text)),
            finish_reason: self.finish_reason,
            usage: self.usage,
            ..LlmResponse::default()
        })
    }
}
