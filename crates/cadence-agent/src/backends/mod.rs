//! Bundled model transports.
//!
//! The runtime only depends on the [`LlmBackend`](crate::llm::LlmBackend)
//! trait. To add a provider, implement that trait in a new module here and
//! register a factory for it in a [`ComponentRegistry`](crate::registry::ComponentRegistry).

pub mod openai;

pub use openai::{parse_openai_response, OpenAiBackend};
