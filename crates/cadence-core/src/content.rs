use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Role used for content authored by the end user (and for tool responses
/// fed back to the model).
pub const ROLE_USER: &str = "user";
/// Role used for content produced by a model.
pub const ROLE_MODEL: &str = "model";

/// A function call requested by a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    /// Correlation id. Empty when the model did not supply one; the step loop
    /// fills it in before the call is recorded.
    #[serde(default)]
    pub id: String,
    /// Name of the tool to call.
    pub name: String,
    /// JSON arguments.
    #[serde(default)]
    pub args: Value,
}

impl FunctionCall {
    /// Creates a call without an id.
    pub fn new(name: impl Into<String>, args: Value) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            args,
        }
    }

    /// Sets the correlation id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

/// The result of executing a [`FunctionCall`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionResponse {
    /// Id of the call this responds to.
    pub id: String,
    /// Name of the tool that produced the response.
    pub name: String,
    /// Structured result map.
    pub response: Map<String, Value>,
}

/// Inline binary data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blob {
    /// MIME type of the payload.
    pub mime_type: String,
    /// Raw bytes, base64-encoded on the wire.
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// A reference to a file stored elsewhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileData {
    /// MIME type of the file.
    pub mime_type: String,
    /// Location of the file.
    pub file_uri: String,
}

/// One ordered part of a [`Content`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    /// Plain text.
    Text {
        /// The text.
        text: String,
    },
    /// A model-requested function call.
    FunctionCall(FunctionCall),
    /// A tool result.
    FunctionResponse(FunctionResponse),
    /// Inline binary data.
    InlineData(Blob),
    /// A file reference.
    FileData(FileData),
}

impl Part {
    /// Creates a text part.
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text { text: text.into() }
    }

    /// Returns the text if this is a text part.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Part::Text { text } => Some(text),
            _ => None,
        }
    }

    /// Returns the call if this is a function-call part.
    pub fn as_function_call(&self) -> Option<&FunctionCall> {
        match self {
            Part::FunctionCall(call) => Some(call),
            _ => None,
        }
    }

    /// Returns the response if this is a function-response part.
    pub fn as_function_response(&self) -> Option<&FunctionResponse> {
        match self {
            Part::FunctionResponse(resp) => Some(resp),
            _ => None,
        }
    }
}

/// Role-tagged, ordered list of parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    /// `"user"` or `"model"`.
    pub role: String,
    /// Ordered parts.
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    /// Creates content with the given role and parts.
    pub fn new(role: impl Into<String>, parts: Vec<Part>) -> Self {
        Self {
            role: role.into(),
            parts,
        }
    }

    /// Creates user-role content holding a single text part.
    pub fn user_text(text: impl Into<String>) -> Self {
        Self::new(ROLE_USER, vec![Part::text(text)])
    }

    /// Creates model-role content holding a single text part.
    pub fn model_text(text: impl Into<String>) -> Self {
        Self::new(ROLE_MODEL, vec![Part::text(text)])
    }

    /// Concatenation of all text parts.
    pub fn text(&self) -> String {
        self.parts.iter().filter_map(Part::as_text).collect()
    }

    /// All function-call parts, in order.
    pub fn function_calls(&self) -> Vec<&FunctionCall> {
        self.parts.iter().filter_map(Part::as_function_call).collect()
    }

    /// All function-response parts, in order.
    pub fn function_responses(&self) -> Vec<&FunctionResponse> {
        self.parts
            .iter()
            .filter_map(Part::as_function_response)
            .collect()
    }

    /// Whether the content holds only text parts (and at least one).
    pub fn is_text_only(&self) -> bool {
        !self.parts.is_empty() && self.parts.iter().all(|p| p.as_text().is_some())
    }

    /// True when there are no parts, or every part is empty text.
    pub fn is_empty(&self) -> bool {
        self.parts.iter().all(|p| matches!(p, Part::Text { text } if text.is_empty()))
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
