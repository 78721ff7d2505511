use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, ClientBuilder, RequestBuilder};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::{error_for_status, GenerationError};
use super::models::{DEFAULT_EMBEDDING_MODEL, DEFAULT_NATIVE_MODEL};
use super::openai_format::call_id_or_synthesized;
use super::provider::{validate_embeddings, LLMProvider, ResponseStream, STREAM_CHANNEL_SIZE};
use super::streaming::{drive_sse_stream, ChunkDecoder, Decoded, SseFraming, SseLineProcessor};
use super::types::*;
use crate::config::ProviderConfig;

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const VENDOR: &str = "gemini";

/// How the native API is authenticated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeAuth {
    /// API key sent as the `key` query parameter
    ApiKey,
    /// OAuth access token sent as a bearer header
    OAuthBearer,
}

/// Google Gemini API client
pub struct GeminiClient {
    client: Client,
    api_key: String,
    auth: NativeAuth,
    model: String,
    base_url: String,
    custom_headers: HashMap<String, String>,
}

impl GeminiClient {
    pub fn new(config: ProviderConfig, auth: NativeAuth) -> Result<Self, GenerationError> {
        let client = ClientBuilder::new()
            .timeout(Duration::from_millis(config.timeout_ms))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| GenerationError::transport(VENDOR, "configure", e))?;

        let model = if config.model.is_empty() {
            DEFAULT_NATIVE_MODEL.to_string()
        } else {
            config.model
        };
        let base_url = config
            .base_url
            .filter(|u| !u.trim().is_empty())
            .unwrap_or_else(|| GEMINI_BASE_URL.to_string());

        Ok(Self {
            client,
            api_key: config.api_key,
            auth,
            model,
            base_url: base_url.trim_end_matches('/').to_string(),
            custom_headers: config.custom_headers,
        })
    }

    /// `{base}/models/{model}:{method}`. The key is attached separately as a
    /// query parameter so it never appears in a logged URL.
    fn method_url(&self, model: &str, method: &str) -> String {
        format!("{}/models/{}:{}", self.base_url, model, method)
    }

    fn post(&self, url: String) -> RequestBuilder {
        let mut req = self.client.post(url);
        req = match self.auth {
            NativeAuth::ApiKey => req.query(&[("key", self.api_key.as_str())]),
            NativeAuth::OAuthBearer => req.bearer_auth(&self.api_key),
        };
        for (name, value) in &self.custom_headers {
            req = req.header(name.as_str(), value.as_str());
        }
        req
    }

    /// Build Gemini API request body
    fn build_request_body(
        &self,
        operation: &'static str,
        contents: &[Content],
        config: &GenerationConfig,
    ) -> Result<Value, GenerationError> {
        let api_contents = contents_to_api(contents);
        if api_contents.is_empty() {
            return Err(GenerationError::validation(
                VENDOR,
                operation,
                "at least one content is required",
            ));
        }

        let mut body = json!({ "contents": api_contents });

        let mut generation_config = serde_json::Map::new();
        if let Some(t) = config.temperature {
            generation_config.insert("temperature".into(), json!(t));
        }
        if let Some(p) = config.top_p {
            generation_config.insert("topP".into(), json!(p));
        }
        if let Some(max) = config.max_output_tokens {
            generation_config.insert("maxOutputTokens".into(), json!(max));
        }
        if let Some(ref schema) = config.response_schema {
            generation_config.insert("responseMimeType".into(), json!("application/json"));
            generation_config.insert("responseSchema".into(), schema.clone());
        }
        if !generation_config.is_empty() {
            body["generationConfig"] = Value::Object(generation_config);
        }

        if let Some(ref sys) = config.system_instruction {
            if !sys.trim().is_empty() {
                body["systemInstruction"] = json!({ "parts": [{"text": sys}] });
            }
        }

        let declarations: Vec<Value> = config
            .declarations()
            .map(|d| {
                json!({
                    "name": d.name,
                    "description": d.description,
                    "parameters": d.parameters,
                })
            })
            .collect();
        if !declarations.is_empty() {
            body["tools"] = json!([{ "functionDeclarations": declarations }]);
            if config.tool_choice == ToolChoiceMode::None {
                body["toolConfig"] = json!({ "functionCallingConfig": { "mode": "NONE" } });
            }
        }

        Ok(body)
    }
}

/// Canonical contents in the native schema. System contents are dropped;
/// tool results travel as `user`.
fn contents_to_api(contents: &[Content]) -> Vec<Value> {
    contents
        .iter()
        .filter(|c| c.role != Role::System)
        .map(|c| {
            let role = match c.role {
                Role::Model => "model",
                _ => "user",
            };
            let parts: Vec<Value> = c.parts.iter().map(part_to_api).collect();
            json!({ "role": role, "parts": parts })
        })
        .collect()
}

fn part_to_api(part: &Part) -> Value {
    match part {
        Part::Text { text } => json!({ "text": text }),
        Part::FunctionCall(call) => json!({
            "functionCall": {
                "id": call.id,
                "name": call.name,
                "args": call.args,
            }
        }),
        Part::FunctionResponse(resp) => json!({
            "functionResponse": {
                "id": resp.id,
                "name": resp.name,
                "response": resp.response,
            }
        }),
        Part::InlineData { mime_type, data } => json!({
            "inlineData": {
                "mimeType": mime_type,
                "data": base64::engine::general_purpose::STANDARD.encode(data),
            }
        }),
    }
}

/// Canonical parts of a candidate, with ids synthesized for calls that lack one
fn candidate_parts(candidate: &GeminiCandidate) -> Vec<Part> {
    let Some(parts) = candidate.content.as_ref().and_then(|c| c.parts.as_ref()) else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for part in parts {
        if let Some(ref text) = part.text {
            if !text.is_empty() {
                out.push(Part::text(text.clone()));
            }
        }
        if let Some(ref fc) = part.function_call {
            out.push(Part::FunctionCall(FunctionCall {
                id: call_id_or_synthesized(fc.id.as_deref()),
                name: fc.name.clone(),
                args: fc.args.clone().unwrap_or_else(|| json!({})),
            }));
        }
        if let Some(ref data) = part.inline_data {
            match base64::engine::general_purpose::STANDARD.decode(&data.data) {
                Ok(bytes) => out.push(Part::InlineData {
                    mime_type: data.mime_type.clone(),
                    data: bytes,
                }),
                Err(e) => warn!(vendor = VENDOR, error = %e, "Dropping undecodable inline data"),
            }
        }
    }
    out
}

fn response_from_api(body: GeminiResponse, model: &str) -> Option<GenerateResponse> {
    let usage = body.usage_metadata.as_ref().map(UsageMetadata::from);
    let model = body.model_version.as_deref().unwrap_or(model);
    let candidate = body.candidates.first()?;
    let finish_reason = candidate
        .finish_reason
        .as_deref()
        .map(FinishReason::from_vendor)
        .map(|reason| {
            // The native API reports STOP even when the turn ends in calls
            let has_calls = candidate_parts_have_calls(candidate);
            if reason == FinishReason::Stop && has_calls {
                FinishReason::ToolCalls
            } else {
                reason
            }
        });
    Some(GenerateResponse::new(
        candidate_parts(candidate),
        finish_reason,
        usage,
        model,
    ))
}

fn candidate_parts_have_calls(candidate: &GeminiCandidate) -> bool {
    candidate
        .content
        .as_ref()
        .and_then(|c| c.parts.as_ref())
        .map(|parts| parts.iter().any(|p| p.function_call.is_some()))
        .unwrap_or(false)
}

/// Decoder for native stream chunks: each chunk maps to one response
pub struct GeminiChunkDecoder {
    model: String,
}

impl GeminiChunkDecoder {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
        }
    }
}

impl ChunkDecoder for GeminiChunkDecoder {
    fn decode(&mut self, data: &str) -> Decoded {
        let chunk: GeminiResponse = match serde_json::from_str(data) {
            Ok(c) => c,
            Err(e) => {
                warn!(vendor = VENDOR, error = %e, "Skipping malformed stream chunk");
                return Decoded::default();
            }
        };

        let responses = match response_from_api(chunk, &self.model) {
            Some(resp) if !resp.content.parts.is_empty() || resp.finish_reason.is_some() => {
                vec![resp]
            }
            _ => Vec::new(),
        };
        Decoded {
            responses,
            done: false,
        }
    }

    fn finish(&mut self) -> Vec<GenerateResponse> {
        Vec::new()
    }
}

#[async_trait]
impl LLMProvider for GeminiClient {
    async fn generate(
        &self,
        contents: &[Content],
        config: &GenerationConfig,
    ) -> Result<GenerateResponse, GenerationError> {
        let model = config.model_or(&self.model).to_string();
        let body = self.build_request_body("generate", contents, config)?;
        debug!(vendor = VENDOR, model = %model, contents = contents.len(), "Sending generateContent");

        let response = self
            .post(self.method_url(&model, "generateContent"))
            .json(&body)
            .send()
            .await
            .map_err(|e| GenerationError::transport(VENDOR, "generate", e))?;
        let response = error_for_status(VENDOR, "generate", response, &self.api_key).await?;

        let api_response: GeminiResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::parse(VENDOR, "generate", e.without_url().to_string()))?;
        response_from_api(api_response, &model)
            .ok_or_else(|| GenerationError::parse(VENDOR, "generate", "no candidates in response"))
    }

    async fn generate_stream(
        &self,
        contents: &[Content],
        config: &GenerationConfig,
        cancel: CancellationToken,
    ) -> Result<ResponseStream, GenerationError> {
        let model = config.model_or(&self.model).to_string();
        let body = self.build_request_body("stream", contents, config)?;
        debug!(vendor = VENDOR, model = %model, contents = contents.len(), "Opening streamGenerateContent");

        let response = self
            .post(self.method_url(&model, "streamGenerateContent"))
            .query(&[("alt", "sse")])
            .json(&body)
            .send()
            .await
            .map_err(|e| GenerationError::transport(VENDOR, "stream", e))?;
        let response = error_for_status(VENDOR, "stream", response, &self.api_key).await?;

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_SIZE);
        let processor = SseLineProcessor::new(
            SseFraming::native(),
            GeminiChunkDecoder::new(&model),
            VENDOR,
        );
        tokio::spawn(drive_sse_stream(response.bytes_stream(), processor, tx, cancel));

        Ok(rx)
    }

    async fn count_tokens(&self, contents: &[Content]) -> Result<u32, GenerationError> {
        let api_contents = contents_to_api(contents);
        if api_contents.is_empty() {
            return Ok(0);
        }

        let response = self
            .post(self.method_url(&self.model, "countTokens"))
            .json(&json!({ "contents": api_contents }))
            .send()
            .await
            .map_err(|e| GenerationError::transport(VENDOR, "count_tokens", e))?;
        let response = error_for_status(VENDOR, "count_tokens", response, &self.api_key).await?;

        let counted: CountTokensResponse = response.json().await.map_err(|e| {
            GenerationError::parse(VENDOR, "count_tokens", e.without_url().to_string())
        })?;
        Ok(counted.total_tokens)
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, GenerationError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let model_ref = format!("models/{}", DEFAULT_EMBEDDING_MODEL);
        let requests: Vec<Value> = texts
            .iter()
            .map(|text| {
                json!({
                    "model": model_ref,
                    "content": { "parts": [{ "text": text }] },
                })
            })
            .collect();

        let response = self
            .post(self.method_url(DEFAULT_EMBEDDING_MODEL, "batchEmbedContents"))
            .json(&json!({ "requests": requests }))
            .send()
            .await
            .map_err(|e| GenerationError::transport(VENDOR, "embed", e))?;
        let response = error_for_status(VENDOR, "embed", response, &self.api_key).await?;

        let parsed: BatchEmbedResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::parse(VENDOR, "embed", e.without_url().to_string()))?;
        let vectors = parsed.embeddings.into_iter().map(|e| e.values).collect();
        validate_embeddings(VENDOR, texts.len(), vectors)
    }

    fn vendor(&self) -> &str {
        VENDOR
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

// --- Gemini API response types ---

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<GeminiUsage>,
    #[serde(rename = "modelVersion")]
    model_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    parts: Option<Vec<GeminiPart>>,
}

#[derive(Debug, Deserialize)]
struct GeminiPart {
    text: Option<String>,
    #[serde(rename = "functionCall")]
    function_call: Option<GeminiFunctionCall>,
    #[serde(rename = "inlineData")]
    inline_data: Option<GeminiInlineData>,
}

#[derive(Debug, Deserialize)]
struct GeminiFunctionCall {
    id: Option<String>,
    name: String,
    args: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct GeminiInlineData {
    #[serde(rename = "mimeType")]
    mime_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct GeminiUsage {
    #[serde(rename = "promptTokenCount", default)]
    prompt_token_count: u32,
    #[serde(rename = "candidatesTokenCount", default)]
    candidates_token_count: u32,
    #[serde(rename = "totalTokenCount", default)]
    total_token_count: u32,
}

impl From<&GeminiUsage> for UsageMetadata {
    fn from(u: &GeminiUsage) -> Self {
        UsageMetadata {
            prompt_tokens: u.prompt_token_count,
            completion_tokens: u.candidates_token_count,
            total_tokens: u.total_token_count,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CountTokensResponse {
    #[serde(rename = "totalTokens", default)]
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct BatchEmbedResponse {
    #[serde(default)]
    embeddings: Vec<GeminiEmbedding>,
}

#[derive(Debug, Deserialize)]
struct GeminiEmbedding {
    #[serde(default)]
    values: Vec<f32>,
}
