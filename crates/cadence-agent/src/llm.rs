use crate::config::{AudioTranscriptionConfig, Modality};
use async_trait::async_trait;
use cadence_core::{CadenceResult, Content, FunctionCall, Part, ROLE_MODEL};
use cadence_tools::ToolDeclaration;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

/// Everything a model call needs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmRequest {
    pub model: String,
    #[serde(default)]
    pub system_instruction: Option<String>,
    #[serde(default)]
    pub contents: Vec<Content>,
    #[serde(default)]
    pub tools: Vec<ToolDeclaration>,
    /// Opaque generation knobs (temperature, top_p, ...).
    #[serde(default)]
    pub generation: Map<String, Value>,
    #[serde(default)]
    pub response_modalities: Vec<Modality>,
    #[serde(default)]
    pub speech_config: Option<Value>,
    #[serde(default)]
    pub input_audio_transcription: Option<AudioTranscriptionConfig>,
    #[serde(default)]
    pub output_audio_transcription: Option<AudioTranscriptionConfig>,
}

impl LlmRequest {
    /// Appends an instruction paragraph to the system instruction.
    pub fn append_instruction(&mut self, text: &str) {
        match &mut self.system_instruction {
            Some(existing) if !existing.is_empty() => {
                existing.push_str("\n\n");
                existing.push_str(text);
            }
            _ => self.system_instruction = Some(text.to_string()),
        }
    }
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinishReason {
    Stop,
    MaxTokens,
    Safety,
    Other,
}

/// Token accounting reported by the model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageMetadata {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// One model response, or one aggregated slice of a streamed response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    #[serde(default)]
    pub content: Option<Content>,
    #[serde(default)]
    pub partial: bool,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub finish_reason: Option<FinishReason>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub usage: Option<UsageMetadata>,
}

impl LlmResponse {
    pub fn new(content: Content) -> Self {
        Self {
            content: Some(content),
            ..Self::default()
        }
    }

    /// A model-role text response that finished normally.
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(Content::model_text(text)).with_finish_reason(FinishReason::Stop)
    }

    /// A model-role response requesting the given calls.
    pub fn function_calls(calls: Vec<FunctionCall>) -> Self {
        let parts = calls.into_iter().map(Part::FunctionCall).collect();
        Self::new(Content::new(ROLE_MODEL, parts)).with_finish_reason(FinishReason::Stop)
    }

    pub fn with_finish_reason(mut self, reason: FinishReason) -> Self {
        self.finish_reason = Some(reason);
        self
    }

    /// Text of the content, empty when there is none.
    pub fn content_text(&self) -> String {
        self.content.as_ref().map(Content::text).unwrap_or_default()
    }

    /// Whether the content holds only text.
    pub fn is_text_only(&self) -> bool {
        self.content.as_ref().is_some_and(Content::is_text_only)
    }
}

/// A raw item from a streaming model call.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelChunk {
    /// Model output.
    Response(LlmResponse),
    /// Usage statistics only.
    Usage(UsageMetadata),
    /// The server cancelled pending tool calls.
    ToolCallCancellation {
        /// Ids of the cancelled calls.
        ids: Vec<String>,
    },
    /// Live-connection setup acknowledgement.
    SetupComplete,
}

/// Receiving half of a streaming model call.
pub type ChunkReceiver = mpsc::Receiver<CadenceResult<ModelChunk>>;

/// A model transport.
///
/// Only the response shape is fixed here; wire formats belong to the
/// implementations under [`crate::backends`].
#[async_trait]
pub trait LlmBackend: Send + Sync {
    fn model_name(&self) -> &str;

    /// Single-response call.
    async fn generate(&self, request: &LlmRequest) -> CadenceResult<LlmResponse>;

    /// Streaming call. The default implementation forwards one
    /// [`generate`](LlmBackend::generate) result as a single chunk.
    async fn generate_stream(&self, request: &LlmRequest) -> CadenceResult<ChunkReceiver> {
        let response = self.generate(request).await?;
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.send(Ok(ModelChunk::Response(response))).await;
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_instruction() {
        let mut req = LlmRequest::default();
        req.append_instruction("You are helpful.");
        req.append_instruction("Be brief.");
        assert_eq!(
            req.system_instruction.as_deref(),
            Some("You are helpful.\n\nBe brief.")
        );
    }

    #[test]
    fn test_response_helpers() {
        let r = LlmResponse::text("hi");
        assert!(r.is_text_only());
        assert_eq!(r.content_text(), "hi");
        assert_eq!(r.finish_reason, Some(FinishReason::Stop));

        let r = LlmResponse::function_calls(vec![FunctionCall::new("f", serde_json::json!({}))]);
        assert!(!r.is_text_only());
        assert!(!LlmResponse::default().is_text_only());
    }

    #[test]
    fn test_finish_reason_wire_name() {
        let v = serde_json::to_value(FinishReason::MaxTokens).unwrap();
        assert_eq!(v, "MAX_TOKENS");
    }
}
