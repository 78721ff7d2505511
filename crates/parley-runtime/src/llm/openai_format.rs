//! Canonical <-> OpenAI chat-completion wire format, shared by every
//! OpenAI-compatible vendor profile.

use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use super::error::GenerationError;
use super::types::*;

const DEFAULT_TEMPERATURE: f32 = 0.2;
const DEFAULT_MAX_TOKENS: u32 = 2048;
const DEFAULT_TOP_P: f32 = 1.0;

/// Build the chat-completion request body
pub fn build_request_body(
    model: &str,
    contents: &[Content],
    config: &GenerationConfig,
    stream: bool,
) -> Value {
    let mut body = json!({
        "model": model,
        "messages": build_messages(contents, config),
        "stream": stream,
        "temperature": config.temperature.unwrap_or(DEFAULT_TEMPERATURE),
        "max_tokens": config.max_output_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        "top_p": config.top_p.unwrap_or(DEFAULT_TOP_P),
    });

    let tools = build_tools(config);
    if !tools.is_empty() {
        body["tools"] = json!(tools);
        body["tool_choice"] = match config.tool_choice {
            ToolChoiceMode::None => json!("none"),
            ToolChoiceMode::Auto => json!("auto"),
        };
    }

    body
}

/// Build the messages array (system instruction + conversation)
pub fn build_messages(contents: &[Content], config: &GenerationConfig) -> Vec<Value> {
    let mut messages = Vec::new();

    if let Some(ref sys) = config.system_instruction {
        if !sys.trim().is_empty() {
            messages.push(json!({"role": "system", "content": sys}));
        }
    }

    for content in contents {
        let role = wire_role(content.role);

        let mut texts = Vec::new();
        let mut calls = Vec::new();
        let mut responses = Vec::new();
        let mut media = Vec::new();
        for part in &content.parts {
            match part {
                Part::Text { text } => texts.push(text.as_str()),
                Part::FunctionCall(call) => calls.push(call),
                Part::FunctionResponse(resp) => responses.push(resp),
                Part::InlineData { mime_type, data } => media.push((mime_type, data)),
            }
        }

        if !calls.is_empty() {
            let tool_calls: Vec<Value> = calls
                .iter()
                .map(|call| {
                    json!({
                        "id": call.id,
                        "type": "function",
                        "function": {
                            "name": call.name,
                            "arguments": arguments_string(&call.args),
                        }
                    })
                })
                .collect();
            messages.push(json!({
                "role": role,
                "content": texts.join("\n"),
                "tool_calls": tool_calls,
            }));
        } else if !responses.is_empty() {
            // One tool message per response, never batched
            for resp in responses {
                messages.push(json!({
                    "role": "tool",
                    "content": resp.response.to_string(),
                    "tool_call_id": resp.id,
                }));
            }
        } else if !media.is_empty() || texts.len() > 1 {
            let mut segments: Vec<Value> = texts
                .iter()
                .map(|text| json!({"type": "text", "text": text}))
                .collect();
            for (mime_type, data) in media {
                let encoded = base64::engine::general_purpose::STANDARD.encode(data);
                segments.push(json!({
                    "type": "image_url",
                    "image_url": {
                        "url": format!("data:{};base64,{}", mime_type, encoded)
                    }
                }));
            }
            messages.push(json!({"role": role, "content": segments}));
        } else if let Some(text) = texts.first() {
            messages.push(json!({"role": role, "content": text}));
        }
    }

    messages
}

/// Flatten declarations of every tool group into one function-calling list
pub fn build_tools(config: &GenerationConfig) -> Vec<Value> {
    config
        .declarations()
        .map(|decl| {
            json!({
                "type": "function",
                "function": {
                    "name": decl.name,
                    "description": decl.description,
                    "parameters": decl.parameters,
                }
            })
        })
        .collect()
}

fn wire_role(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Model => "assistant",
        Role::System => "system",
        Role::Tool => "tool",
    }
}

fn arguments_string(args: &Value) -> String {
    if args.is_null() {
        "{}".to_string()
    } else {
        args.to_string()
    }
}

/// Parse an accumulated arguments string. Malformed JSON is logged and becomes `{}`.
pub(crate) fn parse_tool_arguments(vendor: &str, name: &str, arguments: &str) -> Value {
    let trimmed = arguments.trim();
    if trimmed.is_empty() {
        return json!({});
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => value,
        Err(e) => {
            warn!(
                vendor,
                function = name,
                error = %e,
                "Tool call arguments are not valid JSON, using empty object"
            );
            json!({})
        }
    }
}

/// Non-empty vendor id, or a synthesized one
pub(crate) fn call_id_or_synthesized(id: Option<&str>) -> String {
    match id {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => synthesize_call_id(),
    }
}

/// Parse a non-streaming chat-completion response
pub fn parse_response(
    vendor: &str,
    body: &ChatCompletion,
    default_model: &str,
) -> Result<GenerateResponse, GenerationError> {
    let choice = body
        .choices
        .first()
        .ok_or_else(|| GenerationError::parse(vendor, "generate", "no choices in response"))?;

    let msg = &choice.message;
    let mut parts = Vec::new();

    if let Some(ref text) = msg.content {
        if !text.is_empty() {
            parts.push(Part::text(text.clone()));
        }
    }

    if let Some(ref tool_calls) = msg.tool_calls {
        for tc in tool_calls {
            let args = parse_tool_arguments(
                vendor,
                &tc.function.name,
                tc.function.arguments.as_deref().unwrap_or(""),
            );
            parts.push(Part::FunctionCall(FunctionCall {
                id: call_id_or_synthesized(tc.id.as_deref()),
                name: tc.function.name.clone(),
                args,
            }));
        }
    }

    let finish_reason = choice.finish_reason.as_deref().map(FinishReason::from_vendor);
    let usage = body.usage.as_ref().map(UsageMetadata::from);
    let model = body.model.as_deref().unwrap_or(default_model);

    Ok(GenerateResponse::new(parts, finish_reason, usage, model))
}

/// Chat-completion response structures
#[derive(Debug, Deserialize)]
pub struct ChatCompletion {
    #[serde(default)]
    pub(crate) model: Option<String>,
    #[serde(default)]
    pub(crate) choices: Vec<Choice>,
    #[serde(default)]
    pub(crate) usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Choice {
    pub(crate) message: ChoiceMessage,
    #[serde(default)]
    pub(crate) finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChoiceMessage {
    #[serde(default)]
    pub(crate) content: Option<String>,
    #[serde(default)]
    pub(crate) tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireToolCall {
    #[serde(default)]
    pub(crate) id: Option<String>,
    pub(crate) function: WireFunction,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireFunction {
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireUsage {
    #[serde(default)]
    pub(crate) prompt_tokens: u32,
    #[serde(default)]
    pub(crate) completion_tokens: u32,
    #[serde(default)]
    pub(crate) total_tokens: u32,
}

impl From<&WireUsage> for UsageMetadata {
    fn from(u: &WireUsage) -> Self {
        let total = if u.total_tokens == 0 {
            u.prompt_tokens + u.completion_tokens
        } else {
            u.total_tokens
        };
        UsageMetadata {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: total,
        }
    }
}

/// Embeddings endpoint response
#[derive(Debug, Deserialize)]
pub(crate) struct EmbeddingResponse {
    #[serde(default)]
    pub(crate) data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EmbeddingData {
    #[serde(default)]
    pub(crate) embedding: Vec<f32>,
}
