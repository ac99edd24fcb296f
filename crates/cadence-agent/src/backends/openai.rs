use crate::config::ModelConfig;
use crate::llm::{ChunkReceiver, FinishReason, LlmBackend, LlmRequest, LlmResponse, ModelChunk, UsageMetadata};
use async_trait::async_trait;
use cadence_core::{CadenceError, CadenceResult, Content, FunctionCall, Part, ROLE_MODEL};
use cadence_tools::ToolDeclaration;
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// OpenAI-compatible chat-completions backend.
///
/// Works with OpenAI, OpenRouter, Groq, Ollama, and any other provider
/// that implements the OpenAI chat completions API.
pub struct OpenAiBackend {
    config: ModelConfig,
    http: reqwest::Client,
}

impl OpenAiBackend {
    pub fn new(config: ModelConfig) -> CadenceResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| CadenceError::Http(e.to_string()))?;
        Ok(Self { config, http })
    }

    fn build_messages(&self, request: &LlmRequest) -> Vec<Value> {
        let mut api_messages: Vec<Value> = Vec::new();

        if let Some(sys) = &request.system_instruction {
            api_messages.push(json!({
                "role": "system",
                "content": sys
            }));
        }

        for content in &request.contents {
            if content.role == ROLE_MODEL {
                api_messages.push(assistant_message(content));
                continue;
            }

            // Tool results travel as one `tool` message each.
            for response in content.function_responses() {
                api_messages.push(json!({
                    "role": "tool",
                    "tool_call_id": response.id,
                    "content": Value::Object(response.response.clone()).to_string(),
                }));
            }
            let text = content.text();
            if !text.is_empty() {
                api_messages.push(json!({
                    "role": "user",
                    "content": text
                }));
            }
        }

        api_messages
    }

    fn build_body(&self, request: &LlmRequest, stream: bool) -> Value {
        let model = if request.model.is_empty() {
            self.config.model_id.as_str()
        } else {
            request.model.as_str()
        };
        let mut body = json!({
            "model": model,
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
            "messages": self.build_messages(request),
        });

        if !request.tools.is_empty() {
            body["tools"] = json!(build_tools(&request.tools));
        }
        if stream {
            body["stream"] = json!(true);
            body["stream_options"] = json!({"include_usage": true});
        }
        if let Value::Object(map) = &mut body {
            map.extend(request.generation.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        body
    }

    async fn send(&self, body: &Value) -> CadenceResult<reqwest::Response> {
        let url = format!("{}/v1/chat/completions", self.config.base_url());
        debug!(url = %url, model = %self.config.model_id, "Calling chat completions");

        let resp = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| CadenceError::Http(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let error_body = resp
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(CadenceError::Http(format!(
                "OpenAI API error {status}: {error_body}"
            )));
        }
        Ok(resp)
    }
}

fn assistant_message(content: &Content) -> Value {
    let text = content.text();
    let mut message = json!({
        "role": "assistant",
        "content": if text.is_empty() { Value::Null } else { Value::String(text) },
    });
    let tool_calls: Vec<Value> = content
        .function_calls()
        .into_iter()
        .map(|call| {
            json!({
                "id": call.id,
                "type": "function",
                "function": {
                    "name": call.name,
                    "arguments": call.args.to_string(),
                }
            })
        })
        .collect();
    if !tool_calls.is_empty() {
        message["tool_calls"] = json!(tool_calls);
    }
    message
}

fn build_tools(tools: &[ToolDeclaration]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                }
            })
        })
        .collect()
}

fn finish_reason(raw: &str) -> FinishReason {
    match raw {
        "stop" | "tool_calls" | "function_call" => FinishReason::Stop,
        "length" => FinishReason::MaxTokens,
        "content_filter" => FinishReason::Safety,
        _ => FinishReason::Other,
    }
}

fn parse_usage(value: &Value) -> Option<UsageMetadata> {
    let usage = value.as_object()?;
    let field = |name: &str| {
        usage
            .get(name)
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0)
    };
    Some(UsageMetadata {
        prompt_tokens: field("prompt_tokens"),
        completion_tokens: field("completion_tokens"),
        total_tokens: field("total_tokens"),
    })
}

fn parse_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return json!({});
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Converts a non-streaming chat-completions body into an [`LlmResponse`].
pub fn parse_openai_response(body: &Value) -> CadenceResult<LlmResponse> {
    let choice = body["choices"]
        .get(0)
        .ok_or_else(|| CadenceError::ModelCall(format!("Response has no choices: {body}")))?;
    let message = &choice["message"];

    let mut parts = Vec::new();
    if let Some(text) = message["content"].as_str().filter(|t| !t.is_empty()) {
        parts.push(Part::text(text));
    }
    if let Some(tool_calls) = message["tool_calls"].as_array() {
        parts.extend(tool_calls.iter().filter_map(|tc| {
            let id = tc["id"].as_str()?;
            let name = tc["function"]["name"].as_str()?;
            let args = parse_arguments(tc["function"]["arguments"].as_str().unwrap_or_default());
            Some(Part::FunctionCall(FunctionCall::new(name, args).with_id(id)))
        }));
    }

    Ok(LlmResponse {
        content: Some(Content::new(ROLE_MODEL, parts)),
        finish_reason: choice["finish_reason"].as_str().map(finish_reason),
        usage: parse_usage(&body["usage"]),
        ..LlmResponse::default()
    })
}

/// Accumulates a chat-completions SSE stream into [`ModelChunk`]s.
#[derive(Debug, Default)]
struct StreamState {
    tool_calls: BTreeMap<u64, (String, String, String)>,
    finish_reason: Option<FinishReason>,
}

impl StreamState {
    /// Handles one `data:` payload.
    fn handle_data(&mut self, data: &str) -> Vec<ModelChunk> {
        let mut out = Vec::new();
        let event: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(_) => return out,
        };

        if let Some(usage) = parse_usage(&event["usage"]) {
            out.push(ModelChunk::Usage(usage));
        }

        let choice = &event["choices"][0];
        if let Some(fr) = choice["finish_reason"].as_str() {
            self.finish_reason = Some(finish_reason(fr));
        }

        let delta = &choice["delta"];
        if let Some(text) = delta["content"].as_str().filter(|t| !t.is_empty()) {
            out.push(ModelChunk::Response(LlmResponse::new(Content::model_text(text))));
        }

        if let Some(tc_array) = delta["tool_calls"].as_array() {
            for tc in tc_array {
                let idx = tc["index"].as_u64().unwrap_or(0);
                let entry = self.tool_calls.entry(idx).or_default();
                if let Some(id) = tc["id"].as_str() {
                    entry.0 = id.to_string();
                }
                if let Some(name) = tc["function"]["name"].as_str() {
                    entry.1.push_str(name);
                }
                if let Some(args_delta) = tc["function"]["arguments"].as_str() {
                    entry.2.push_str(args_delta);
                }
            }
        }
        out
    }

    /// The closing chunk: the accumulated tool calls, or a bare finish marker.
    fn finish(self) -> ModelChunk {
        let reason = self.finish_reason.unwrap_or(FinishReason::Stop);
        if self.tool_calls.is_empty() {
            return ModelChunk::Response(LlmResponse {
                finish_reason: Some(reason),
                ..LlmResponse::default()
            });
        }
        let calls = self
            .tool_calls
            .into_values()
            .map(|(id, name, args)| FunctionCall::new(name, parse_arguments(&args)).with_id(id))
            .collect();
        ModelChunk::Response(LlmResponse::function_calls(calls).with_finish_reason(reason))
    }
}

#[async_trait]
impl LlmBackend for OpenAiBackend {
    fn model_name(&self) -> &str {
        &self.config.model_id
    }

    async fn generate(&self, request: &LlmRequest) -> CadenceResult<LlmResponse> {
        let body = self.build_body(request, false);
        let resp = self.send(&body).await?;
        let resp_body: Value = resp
            .json()
            .await
            .map_err(|e| CadenceError::Http(e.to_string()))?;
        parse_openai_response(&resp_body)
    }

    async fn generate_stream(&self, request: &LlmRequest) -> CadenceResult<ChunkReceiver> {
        let body = self.build_body(request, true);
        let resp = self.send(&body).await?;

        let (tx, rx) = mpsc::channel(256);
        let mut stream = resp.bytes_stream();

        tokio::spawn(async move {
            let mut buffer = String::new();
            let mut state = StreamState::default();

            while let Some(chunk_result) = stream.next().await {
                let chunk = match chunk_result {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx
                            .send(Err(CadenceError::Http(format!("Stream read error: {e}"))))
                            .await;
                        return;
                    }
                };

                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(line_end) = buffer.find('\n') {
                    let line = buffer[..line_end].trim().to_string();
                    buffer.drain(..=line_end);

                    if line.is_empty() || line.starts_with(':') {
                        continue;
                    }
                    let Some(data) = line.strip_prefix("data:").map(str::trim) else {
                        continue;
                    };
                    if data == "[DONE]" {
                        continue;
                    }
                    for model_chunk in state.handle_data(data) {
                        if tx.send(Ok(model_chunk)).await.is_err() {
                            return;
                        }
                    }
                }
            }

            let _ = tx.send(Ok(state.finish())).await;
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_text_response() {
        let body = json!({
            "choices": [{"message": {"content": "Hello"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 5, "completion_tokens": 1, "total_tokens": 6}
        });
        let resp = parse_openai_response(&body).unwrap();
        assert_eq!(resp.content_text(), "Hello");
        assert_eq!(resp.finish_reason, Some(FinishReason::Stop));
        assert_eq!(resp.usage.unwrap().total_tokens, 6);
    }

    #[test]
    fn test_parse_tool_call_response() {
        let body = json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "check_prime", "arguments": "{\"nums\":[6]}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        });
        let resp = parse_openai_response(&body).unwrap();
        let content = resp.content.unwrap();
        let calls = content.function_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].args, json!({"nums": [6]}));
    }

    #[test]
    fn test_parse_without_choices_fails() {
        let err = parse_openai_response(&json!({"error": "nope"})).unwrap_err();
        assert!(matches!(err, CadenceError::ModelCall(_)));
    }

    #[test]
    fn test_finish_reason_mapping() {
        assert_eq!(finish_reason("length"), FinishReason::MaxTokens);
        assert_eq!(finish_reason("content_filter"), FinishReason::Safety);
        assert_eq!(finish_reason("tool_calls"), FinishReason::Stop);
        assert_eq!(finish_reason("weird"), FinishReason::Other);
    }

    #[test]
    fn test_stream_state_accumulates_tool_call_fragments() {
        let mut state = StreamState::default();
        state.handle_data(r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1","function":{"name":"lookup","arguments":"{\"q\":"}}]}}]}"#);
        state.handle_data(r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"rust\"}"}}]}}]}"#);
        state.handle_data(r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#);

        let ModelChunk::Response(resp) = state.finish() else {
            panic!("expected a response chunk");
        };
        let content = resp.content.unwrap();
        let calls = content.function_calls();
        assert_eq!(calls[0].name, "lookup");
        assert_eq!(calls[0].id, "c1");
        assert_eq!(calls[0].args, json!({"q": "rust"}));
    }

    #[test]
    fn test_build_messages_maps_roles() {
        let backend = OpenAiBackend::new(ModelConfig::new("gpt-4o-mini")).unwrap();
        let mut response = serde_json::Map::new();
        response.insert("result".into(), json!(false));
        let request = LlmRequest {
            system_instruction: Some("Be brief.".into()),
            contents: vec![
                Content::user_text("Is 6 prime?"),
                Content::new(
                    ROLE_MODEL,
                    vec![Part::FunctionCall(FunctionCall::new("check_prime", json!({"n": 6})).with_id("c1"))],
                ),
                Content::new(
                    cadence_core::ROLE_USER,
                    vec![Part::FunctionResponse(cadence_core::FunctionResponse {
                        id: "c1".into(),
                        name: "check_prime".into(),
                        response,
                    })],
                ),
            ],
            ..LlmRequest::default()
        };
        let messages = backend.build_messages(&request);
        let roles: Vec<_> = messages.iter().map(|m| m["role"].as_str().unwrap()).collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "tool"]);
        assert_eq!(messages[2]["tool_calls"][0]["function"]["arguments"], "{\"n\":6}");
        assert_eq!(messages[3]["tool_call_id"], "c1");
    }
}
