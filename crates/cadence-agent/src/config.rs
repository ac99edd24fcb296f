use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// How model output is delivered during a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamingMode {
    /// One response per model call.
    #[default]
    None,
    /// Server-streamed chunks, surfaced as partial events.
    Sse,
    /// Bidirectional live session fed by a [`LiveRequestQueue`](crate::runner::LiveRequestQueue).
    Bidi,
}

/// Output modality requested from the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Text,
    Audio,
}

/// Settings for transcribing audio to text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioTranscriptionConfig {
    #[serde(default)]
    pub language: Option<String>,
}

/// Per-call runtime configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub streaming_mode: StreamingMode,
    /// Upper bound on model calls per invocation; 0 means unbounded.
    #[serde(default = "default_max_llm_calls")]
    pub max_llm_calls: u32,
    #[serde(default)]
    pub response_modalities: Vec<Modality>,
    #[serde(default)]
    pub input_audio_transcription: Option<AudioTranscriptionConfig>,
    #[serde(default)]
    pub output_audio_transcription: Option<AudioTranscriptionConfig>,
    /// Passed through to the model untouched.
    #[serde(default)]
    pub speech_config: Option<Value>,
    /// Generation knobs passed through to the model untouched.
    #[serde(default)]
    pub generation: Map<String, Value>,
}

fn default_max_llm_calls() -> u32 {
    500
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            streaming_mode: StreamingMode::None,
            max_llm_calls: default_max_llm_calls(),
            response_modalities: Vec::new(),
            input_audio_transcription: None,
            output_audio_transcription: None,
            speech_config: None,
            generation: Map::new(),
        }
    }
}

impl RunConfig {
    /// Fills in implied settings: audio output without an explicit input
    /// transcription setting gets a default one.
    pub fn normalized(mut self) -> Self {
        if self.response_modalities.contains(&Modality::Audio)
            && self.input_audio_transcription.is_none()
        {
            self.input_audio_transcription = Some(AudioTranscriptionConfig::default());
        }
        self
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming_mode != StreamingMode::None
    }
}

/// Configuration for the bundled OpenAI-compatible backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model_id: String,
    #[serde(default)]
    pub api_key: String,
    pub api_base_url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_request_timeout_secs() -> u64 {
    120
}

impl ModelConfig {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            api_key: String::new(),
            api_base_url: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }

    pub fn base_url(&self) -> &str {
        self.api_base_url
            .as_deref()
            .unwrap_or("https://api.openai.com")
            .trim_end_matches('/')
    }
}

/// Runner behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Wall-clock budget for agent execution per run. Unbounded when unset.
    #[serde(default)]
    pub execution_timeout_secs: Option<u64>,
    /// Create the session on first use instead of failing.
    #[serde(default = "default_auto_create_session")]
    pub auto_create_session: bool,
}

fn default_auto_create_session() -> bool {
    true
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            execution_timeout_secs: None,
            auto_create_session: default_auto_create_session(),
        }
    }
}
