//! Provider adapters: request serialization and chunk parsing per upstream
//! wire dialect.
//!
//! Every adapter converts to and from the gateway's OpenAI-shaped internal
//! types, so the rest of the dispatcher is provider-agnostic.

use modelmux_server::wire::{Role, Usage};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use url::Url;

use super::{ImageAttachment, UpstreamChunk, UpstreamRequest};
use crate::router::catalog::{Capability, ModelDescriptor};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const OPENROUTER_REFERER: &str = "https://modelmux.dev";
const OPENROUTER_TITLE: &str = "modelmux gateway";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterKind {
    Openai,
    Anthropic,
    Ollama,
    Openrouter,
    Custom,
}

/// A fully serialized upstream request ready for the HTTP client.
#[derive(Debug, Clone)]
pub struct AdaptedRequest {
    pub url: Url,
    pub headers: Vec<(&'static str, String)>,
    pub body: Value,
}

/// Buffered (non-streaming) upstream result mapped back to gateway shape.
#[derive(Debug, Clone)]
pub struct BufferedOutput {
    pub content: String,
    pub finish_reason: String,
    pub usage: Usage,
}

impl AdapterKind {
    /// Build the wire request for this provider.
    pub fn build_request(
        &self,
        base_url: &Url,
        api_key: Option<&str>,
        model: &ModelDescriptor,
        request: &UpstreamRequest,
        stream: bool,
    ) -> Result<AdaptedRequest, AdapterError> {
        match self {
            AdapterKind::Openai | AdapterKind::Openrouter | AdapterKind::Custom => {
                let url = join(base_url, "chat/completions")?;
                let mut headers = Vec::new();
                if let Some(key) = api_key {
                    headers.push(("authorization", format!("Bearer {key}")));
                }
                if *self == AdapterKind::Openrouter {
                    headers.push(("http-referer", OPENROUTER_REFERER.to_string()));
                    headers.push(("x-title", OPENROUTER_TITLE.to_string()));
                }

                let mut body = json!({
                    "model": model.upstream_id,
                    "messages": openai_messages(request, model),
                    "stream": stream,
                });
                if let Some(temperature) = request.temperature {
                    body["temperature"] = json!(temperature);
                }
                if let Some(max_tokens) = request.max_tokens {
                    body["max_tokens"] = json!(max_tokens);
                }
                if let Some(stop) = &request.stop {
                    body["stop"] = json!(stop);
                }
                Ok(AdaptedRequest { url, headers, body })
            }
            AdapterKind::Anthropic => {
                let url = join(base_url, "v1/messages")?;
                let mut headers = vec![("anthropic-version", ANTHROPIC_VERSION.to_string())];
                if let Some(key) = api_key {
                    headers.push(("x-api-key", key.to_string()));
                }

                // System messages hoist into the dedicated field.
                let mut system = String::new();
                let mut messages = Vec::new();
                for message in &request.messages {
                    match message.role {
                        Role::System => {
                            if !system.is_empty() {
                                system.push('\n');
                            }
                            system.push_str(&message.content);
                        }
                        Role::User => messages.push(json!({
                            "role": "user",
                            "content": message.content,
                        })),
                        Role::Assistant => messages.push(json!({
                            "role": "assistant",
                            "content": message.content,
                        })),
                    }
                }

                let max_tokens = request
                    .max_tokens
                    .map(u64::from)
                    .unwrap_or(model.max_output_tokens);
                let mut body = json!({
                    "model": model.upstream_id,
                    "messages": messages,
                    "max_tokens": max_tokens,
                    "stream": stream,
                });
                if !system.is_empty() {
                    body["system"] = json!(system);
                }
                if let Some(temperature) = request.temperature {
                    body["temperature"] = json!(temperature);
                }
                Ok(AdaptedRequest { url, headers, body })
            }
            AdapterKind::Ollama => {
                let url = join(base_url, "api/chat")?;
                let body = json!({
                    "model": model.upstream_id,
                    "messages": request
                        .messages
                        .iter()
                        .map(|m| json!({ "role": role_name(m.role), "content": m.content }))
                        .collect::<Vec<_>>(),
                    "stream": stream,
                });
                Ok(AdaptedRequest {
                    url,
                    headers: Vec::new(),
                    body,
                })
            }
        }
    }

    /// Parse one line of a streaming response into zero or more chunks.
    /// `terminal` marks the end of the upstream stream.
    pub fn parse_line(&self, line: &str) -> LineOutcome {
        let line = line.trim();
        if line.is_empty() || line.starts_with(':') {
            return LineOutcome::empty();
        }

        match self {
            AdapterKind::Openai | AdapterKind::Openrouter | AdapterKind::Custom => {
                let Some(payload) = line.strip_prefix("data:").map(str::trim) else {
                    return LineOutcome::empty();
                };
                if payload == "[DONE]" {
                    return LineOutcome::terminal(vec![]);
                }
                match serde_json::from_str::<Value>(payload) {
                    Ok(value) => openai_chunks(&value),
                    Err(_) => LineOutcome::empty(),
                }
            }
            AdapterKind::Anthropic => {
                let Some(payload) = line.strip_prefix("data:").map(str::trim) else {
                    return LineOutcome::empty();
                };
                match serde_json::from_str::<Value>(payload) {
                    Ok(value) => anthropic_chunks(&value),
                    Err(_) => LineOutcome::empty(),
                }
            }
            AdapterKind::Ollama => match serde_json::from_str::<Value>(line) {
                Ok(value) => ollama_chunks(&value),
                Err(_) => LineOutcome::empty(),
            },
        }
    }

    /// Parse a buffered (non-streaming) response body.
    pub fn parse_buffered(&self, value: &Value) -> Result<BufferedOutput, AdapterError> {
        match self {
            AdapterKind::Openai | AdapterKind::Openrouter | AdapterKind::Custom => {
                let choice = value["choices"]
                    .get(0)
                    .ok_or_else(|| AdapterError::Shape("response has no choices".into()))?;
                let content = choice["message"]["content"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                let finish_reason = choice["finish_reason"]
                    .as_str()
                    .unwrap_or("stop")
                    .to_string();
                let usage = Usage {
                    prompt_tokens: value["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
                    completion_tokens: value["usage"]["completion_tokens"].as_u64().unwrap_or(0),
                    total_tokens: value["usage"]["total_tokens"].as_u64().unwrap_or(0),
                };
                Ok(BufferedOutput {
                    content,
                    finish_reason,
                    usage,
                })
            }
            AdapterKind::Anthropic => {
                let content = value["content"]
                    .get(0)
                    .and_then(|c| c["text"].as_str())
                    .unwrap_or_default()
                    .to_string();
                let input = value["usage"]["input_tokens"].as_u64().unwrap_or(0);
                let output = value["usage"]["output_tokens"].as_u64().unwrap_or(0);
                Ok(BufferedOutput {
                    content,
                    finish_reason: value["stop_reason"]
                        .as_str()
                        .unwrap_or("stop")
                        .to_string(),
                    usage: Usage {
                        prompt_tokens: input,
                        completion_tokens: output,
                        total_tokens: input + output,
                    },
                })
            }
            AdapterKind::Ollama => {
                let content = value["message"]["content"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                let input = value["prompt_eval_count"].as_u64().unwrap_or(0);
                let output = value["eval_count"].as_u64().unwrap_or(0);
                Ok(BufferedOutput {
                    content,
                    finish_reason: "stop".to_string(),
                    usage: Usage {
                        prompt_tokens: input,
                        completion_tokens: output,
                        total_tokens: input + output,
                    },
                })
            }
        }
    }

    /// Whether streaming responses use SSE framing (`data:` lines) rather
    /// than newline-delimited JSON.
    pub fn uses_sse(&self) -> bool {
        !matches!(self, AdapterKind::Ollama)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("invalid upstream url: {0}")]
    Url(#[from] url::ParseError),
    #[error("unexpected response shape: {0}")]
    Shape(String),
}

/// Chunks parsed from one line plus the terminal marker.
#[derive(Debug, Clone)]
pub struct LineOutcome {
    pub chunks: Vec<UpstreamChunk>,
    pub terminal: bool,
}

impl LineOutcome {
    fn empty() -> Self {
        Self {
            chunks: Vec::new(),
            terminal: false,
        }
    }

    fn chunks(chunks: Vec<UpstreamChunk>) -> Self {
        Self {
            chunks,
            terminal: false,
        }
    }

    fn terminal(chunks: Vec<UpstreamChunk>) -> Self {
        Self {
            chunks,
            terminal: true,
        }
    }
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

/// OpenAI-family message list. Image attachments become base64 content parts
/// on the final user message when the model declares vision; otherwise they
/// were already rendered as captions upstream of the adapter.
fn openai_messages(request: &UpstreamRequest, model: &ModelDescriptor) -> Vec<Value> {
    let vision = model.capabilities.contains(&Capability::Vision);
    let attach_to_last_user = vision && !request.images.is_empty();
    let last_user_index = request
        .messages
        .iter()
        .rposition(|m| matches!(m.role, Role::User));

    request
        .messages
        .iter()
        .enumerate()
        .map(|(index, message)| {
            if attach_to_last_user && Some(index) == last_user_index {
                let mut parts = vec![json!({ "type": "text", "text": message.content })];
                for image in &request.images {
                    parts.push(json!({
                        "type": "image_url",
                        "image_url": {
                            "url": format!("data:{};base64,{}", image.mime, image.data_base64),
                        },
                    }));
                }
                json!({ "role": role_name(message.role), "content": parts })
            } else {
                json!({ "role": role_name(message.role), "content": message.content })
            }
        })
        .collect()
}

fn openai_chunks(value: &Value) -> LineOutcome {
    let Some(choice) = value["choices"].get(0) else {
        return LineOutcome::empty();
    };
    let mut chunks = Vec::new();
    if let Some(content) = choice["delta"]["content"].as_str() {
        if !content.is_empty() {
            chunks.push(UpstreamChunk::Delta(content.to_string()));
        }
    }
    if let Some(tool_calls) = choice["delta"].get("tool_calls") {
        if !tool_calls.is_null() {
            chunks.push(UpstreamChunk::ToolCallDelta(tool_calls.clone()));
        }
    }
    if let Some(reason) = choice["finish_reason"].as_str() {
        chunks.push(UpstreamChunk::Finish {
            reason: reason.to_string(),
        });
        return LineOutcome::terminal(chunks);
    }
    LineOutcome::chunks(chunks)
}

fn anthropic_chunks(value: &Value) -> LineOutcome {
    match value["type"].as_str() {
        Some("content_block_delta") => {
            let text = value["delta"]["text"].as_str().unwrap_or_default();
            if text.is_empty() {
                LineOutcome::empty()
            } else {
                LineOutcome::chunks(vec![UpstreamChunk::Delta(text.to_string())])
            }
        }
        Some("message_delta") => match value["delta"]["stop_reason"].as_str() {
            Some(reason) => LineOutcome::chunks(vec![UpstreamChunk::Finish {
                reason: reason.to_string(),
            }]),
            None => LineOutcome::empty(),
        },
        Some("message_stop") => LineOutcome::terminal(vec![]),
        Some("ping") => LineOutcome::chunks(vec![UpstreamChunk::Keepalive]),
        Some("error") => LineOutcome::terminal(vec![UpstreamChunk::Error {
            message: value["error"]["message"]
                .as_str()
                .unwrap_or("upstream error")
                .to_string(),
        }]),
        _ => LineOutcome::empty(),
    }
}

fn ollama_chunks(value: &Value) -> LineOutcome {
    let mut chunks = Vec::new();
    if let Some(content) = value["message"]["content"].as_str() {
        if !content.is_empty() {
            chunks.push(UpstreamChunk::Delta(content.to_string()));
        }
    }
    if value["done"].as_bool() == Some(true) {
        chunks.push(UpstreamChunk::Finish {
            reason: "stop".to_string(),
        });
        return LineOutcome::terminal(chunks);
    }
    LineOutcome::chunks(chunks)
}

fn join(base: &Url, path: &str) -> Result<Url, AdapterError> {
    // Url::join drops the last path segment without a trailing slash.
    let mut text = base.as_str().trim_end_matches('/').to_string();
    text.push('/');
    text.push_str(path);
    Ok(Url::parse(&text)?)
}
