use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::{Client, ClientBuilder, RequestBuilder};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::error::{error_for_status, GenerationError};
use super::openai_format::{self, ChatCompletion, EmbeddingResponse};
use super::provider::{
    approximate_tokens, validate_embeddings, LLMProvider, ResponseStream, STREAM_CHANNEL_SIZE,
};
use super::streaming::{drive_sse_stream, OpenAiDeltaDecoder, SseFraming, SseLineProcessor};
use super::types::*;
use crate::config::ProviderConfig;

/// Vendor profile of an OpenAI-compatible endpoint
#[derive(Debug, Clone)]
pub struct CompatProfile {
    pub vendor: &'static str,
    pub default_base_url: &'static str,
    /// Chat endpoint path relative to the base URL
    pub chat_path: &'static str,
    /// Query parameter carrying the API key on the chat endpoint
    pub access_key_param: Option<&'static str>,
    /// Bearer auth is skipped when the base URL contains this host
    pub bearer_exempt_host: Option<&'static str>,
    /// Request-tracing header, generated per request unless configured
    pub logid_header: Option<&'static str>,
    /// Divisor of the character-based token approximation
    pub chars_per_token: f64,
    /// `None` means the caller must name a model
    pub default_model: Option<&'static str>,
    pub default_embedding_model: &'static str,
}

impl CompatProfile {
    pub fn ark() -> Self {
        Self {
            vendor: "ark",
            default_base_url: "https://ark-cn-beijing.bytedance.net/api/v3",
            chat_path: "chat/completions",
            access_key_param: None,
            bearer_exempt_host: None,
            logid_header: None,
            chars_per_token: 3.0,
            default_model: None,
            default_embedding_model: "text-embedding-ada-002",
        }
    }

    pub fn gpt_openapi() -> Self {
        Self {
            vendor: "gpt-openapi",
            default_base_url: "https://gpt-i18n.byteintl.net/gpt/openapi/online/v2",
            chat_path: "crawl",
            access_key_param: Some("ak"),
            bearer_exempt_host: Some("byteintl.net"),
            logid_header: Some("X-TT-LOGID"),
            chars_per_token: 3.5,
            default_model: Some("gcp-claude4-sonnet"),
            default_embedding_model: "text-embedding-3-small",
        }
    }
}

/// Client for OpenAI-compatible chat-completion endpoints
pub struct OpenAiCompatibleClient {
    client: Client,
    profile: CompatProfile,
    api_key: String,
    base_url: String,
    model: String,
    custom_headers: HashMap<String, String>,
}

impl OpenAiCompatibleClient {
    pub fn new(profile: CompatProfile, config: ProviderConfig) -> Result<Self, GenerationError> {
        let model = if config.model.is_empty() {
            profile.default_model.map(str::to_string).ok_or_else(|| {
                GenerationError::validation(profile.vendor, "configure", "a model name is required")
            })?
        } else {
            config.model
        };

        let client = ClientBuilder::new()
            .timeout(Duration::from_millis(config.timeout_ms))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| GenerationError::transport(profile.vendor, "configure", e))?;

        let base_url = config
            .base_url
            .filter(|u| !u.trim().is_empty())
            .unwrap_or_else(|| profile.default_base_url.to_string());

        Ok(Self {
            client,
            api_key: config.api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            custom_headers: config.custom_headers,
            profile,
        })
    }

    pub fn ark(config: ProviderConfig) -> Result<Self, GenerationError> {
        Self::new(CompatProfile::ark(), config)
    }

    pub fn gpt_openapi(config: ProviderConfig) -> Result<Self, GenerationError> {
        Self::new(CompatProfile::gpt_openapi(), config)
    }

    pub fn profile(&self) -> &CompatProfile {
        &self.profile
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// Attach auth, tracing and custom headers. Custom headers go last so
    /// callers can override anything the profile sets.
    fn authorize(&self, mut req: RequestBuilder) -> RequestBuilder {
        let exempt = self
            .profile
            .bearer_exempt_host
            .map(|host| self.base_url.contains(host))
            .unwrap_or(false);
        if !self.api_key.is_empty() && !exempt {
            req = req.bearer_auth(&self.api_key);
        }

        if let Some(header) = self.profile.logid_header {
            if !self.custom_headers.keys().any(|k| k.eq_ignore_ascii_case(header)) {
                req = req.header(header, generate_log_id());
            }
        }

        for (name, value) in &self.custom_headers {
            req = req.header(name.as_str(), value.as_str());
        }
        req
    }

    fn chat_request(&self, body: &Value) -> RequestBuilder {
        let mut req = self.client.post(self.endpoint(self.profile.chat_path));
        if let Some(param) = self.profile.access_key_param {
            req = req.query(&[(param, self.api_key.as_str())]);
        }
        self.authorize(req).json(body)
    }

    fn request_body(
        &self,
        operation: &'static str,
        contents: &[Content],
        config: &GenerationConfig,
        stream: bool,
    ) -> Result<(Value, String), GenerationError> {
        let model = config.model_or(&self.model).to_string();
        if model.is_empty() {
            return Err(GenerationError::validation(
                self.profile.vendor,
                operation,
                "a model name is required",
            ));
        }
        let body = openai_format::build_request_body(&model, contents, config, stream);
        let empty = body["messages"].as_array().map(|m| m.is_empty()).unwrap_or(true);
        if empty {
            return Err(GenerationError::validation(
                self.profile.vendor,
                operation,
                "at least one message is required",
            ));
        }
        Ok((body, model))
    }
}

/// `parley-<millis>-<random>`
fn generate_log_id() -> String {
    let suffix: u32 = rand::thread_rng().gen();
    format!("parley-{}-{:08x}", chrono::Utc::now().timestamp_millis(), suffix)
}

#[async_trait]
impl LLMProvider for OpenAiCompatibleClient {
    async fn generate(
        &self,
        contents: &[Content],
        config: &GenerationConfig,
    ) -> Result<GenerateResponse, GenerationError> {
        let vendor = self.profile.vendor;
        let (body, model) = self.request_body("generate", contents, config, false)?;
        debug!(vendor, model = %model, messages = contents.len(), "Sending chat completion");

        let response = self
            .chat_request(&body)
            .send()
            .await
            .map_err(|e| GenerationError::transport(vendor, "generate", e))?;
        let response = error_for_status(vendor, "generate", response, &self.api_key).await?;

        let completion: ChatCompletion = response
            .json()
            .await
            .map_err(|e| GenerationError::parse(vendor, "generate", e.without_url().to_string()))?;
        openai_format::parse_response(vendor, &completion, &model)
    }

    async fn generate_stream(
        &self,
        contents: &[Content],
        config: &GenerationConfig,
        cancel: CancellationToken,
    ) -> Result<ResponseStream, GenerationError> {
        let vendor = self.profile.vendor;
        let (body, model) = self.request_body("stream", contents, config, true)?;
        debug!(vendor, model = %model, messages = contents.len(), "Opening chat completion stream");

        let response = self
            .chat_request(&body)
            .send()
            .await
            .map_err(|e| GenerationError::transport(vendor, "stream", e))?;
        let response = error_for_status(vendor, "stream", response, &self.api_key).await?;

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_SIZE);
        let processor = SseLineProcessor::new(
            SseFraming::openai(),
            OpenAiDeltaDecoder::new(vendor, &model),
            vendor,
        );
        tokio::spawn(drive_sse_stream(response.bytes_stream(), processor, tx, cancel));

        Ok(rx)
    }

    async fn count_tokens(&self, contents: &[Content]) -> Result<u32, GenerationError> {
        Ok(approximate_tokens(
            &joined_text(contents),
            self.profile.chars_per_token,
        ))
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, GenerationError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let vendor = self.profile.vendor;

        let body = json!({
            "model": self.profile.default_embedding_model,
            "input": texts,
        });
        let req = self.authorize(self.client.post(self.endpoint("embeddings")));
        let response = req
            .json(&body)
            .send()
            .await
            .map_err(|e| GenerationError::transport(vendor, "embed", e))?;
        let response = error_for_status(vendor, "embed", response, &self.api_key).await?;

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::parse(vendor, "embed", e.without_url().to_string()))?;
        let vectors = parsed.data.into_iter().map(|d| d.embedding).collect();
        validate_embeddings(vendor, texts.len(), vectors)
    }

    fn vendor(&self) -> &str {
        self.profile.vendor
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ark_requires_model() {
        let err = OpenAiCompatibleClient::ark(ProviderConfig::new("key"))
            .err()
            .unwrap();
        assert!(matches!(err, GenerationError::Validation { .. }));

        let client =
            OpenAiCompatibleClient::ark(ProviderConfig::new("key").with_model("ep-1")).unwrap();
        assert_eq!(client.model_name(), "ep-1");
        assert_eq!(client.vendor(), "ark");
    }

    #[test]
    fn test_gpt_openapi_defaults() {
        let client = OpenAiCompatibleClient::gpt_openapi(ProviderConfig::new("key")).unwrap();
        assert_eq!(client.model_name(), "gcp-claude4-sonnet");
        assert_eq!(
            client.endpoint(client.profile().chat_path),
            "https://gpt-i18n.byteintl.net/gpt/openapi/online/v2/crawl"
        );
    }

    #[test]
    fn test_base_url_override_trims_slash() {
        let client = OpenAiCompatibleClient::ark(
            ProviderConfig::new("key")
                .with_model("ep-1")
                .with_base_url("http://localhost:8080/api/v3/"),
        )
        .unwrap();
        assert_eq!(
            client.endpoint("chat/completions"),
            "http://localhost:8080/api/v3/chat/completions"
        );
    }

    #[tokio::test]
    async fn test_count_tokens_uses_profile_divisor() {
        let contents = vec![Content::user("abcdefg")];
        let ark = OpenAiCompatibleClient::ark(ProviderConfig::new("k").with_model("m")).unwrap();
        assert_eq!(ark.count_tokens(&contents).await.unwrap(), 3);
        let gpt = OpenAiCompatibleClient::gpt_openapi(ProviderConfig::new("k")).unwrap();
        assert_eq!(gpt.count_tokens(&contents).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_empty_embedding_input_skips_network() {
        let client = OpenAiCompatibleClient::ark(
            ProviderConfig::new("k")
                .with_model("m")
                .with_base_url("http://127.0.0.1:1"),
        )
        .unwrap();
        assert!(client.embed(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_request_rejected_before_sending() {
        let client = OpenAiCompatibleClient::ark(
            ProviderConfig::new("k")
                .with_model("m")
                .with_base_url("http://127.0.0.1:1"),
        )
        .unwrap();
        let err = client
            .generate(&[], &GenerationConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Validation { .. }));
    }

    #[test]
    fn test_log_id_shape() {
        let id = generate_log_id();
        assert!(id.starts_with("parley-"));
        assert_eq!(id.split('-').count(), 3);
    }
}
