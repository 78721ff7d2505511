use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::llm::models::DEFAULT_FALLBACK_MODEL;

/// How the caller authenticated; selects the adapter and gates model fallback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthType {
    /// Interactive personal login (bearer OAuth token against the native API)
    #[serde(rename = "oauth-personal")]
    LoginWithGooglePersonal,
    /// Native API key sent as a `key` query parameter
    GeminiApiKey,
    Ark,
    GptOpenapi,
}

impl AuthType {
    /// Only interactive personal logins may fall back to a cheaper model
    pub fn allows_model_fallback(&self) -> bool {
        matches!(self, AuthType::LoginWithGooglePersonal)
    }
}

/// Adapter configuration supplied by the auth/config loader
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub api_key: String,
    /// Override of the adapter's default base URL
    #[serde(default)]
    pub base_url: Option<String>,
    /// Model name (empty = adapter default)
    #[serde(default)]
    pub model: String,
    /// Extra headers sent on every request
    #[serde(default)]
    pub custom_headers: HashMap<String, String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    120_000
}

impl ProviderConfig {
    pub fn new(api_key: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            base_url: None,
            model: String::new(),
            custom_headers: HashMap::new(),
            timeout_ms: default_timeout_ms(),
        }
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = Some(url.to_string());
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.custom_headers
            .insert(name.to_string(), value.to_string());
        self
    }
}

/// Session orchestration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_auth_type")]
    pub auth_type: AuthType,
    /// Auto-continuation budget per `send_message`
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
    /// Fraction of the context window at which history gets summarized
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold: f64,
    #[serde(default = "default_streaming")]
    pub streaming: bool,
    /// Context-window override for models missing from the catalog
    #[serde(default)]
    pub context_window: Option<u32>,
    /// Model for the next-speaker check (empty = active model)
    #[serde(default)]
    pub next_speaker_model: Option<String>,
    #[serde(default = "default_fallback_model")]
    pub fallback_model: String,
    #[serde(default)]
    pub system_instruction: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default)]
    pub max_output_tokens: Option<u32>,
}

fn default_auth_type() -> AuthType {
    AuthType::GeminiApiKey
}

fn default_max_turns() -> usize {
    100
}

fn default_compression_threshold() -> f64 {
    0.95
}

fn default_streaming() -> bool {
    true
}

fn default_fallback_model() -> String {
    DEFAULT_FALLBACK_MODEL.to_string()
}

fn default_temperature() -> f32 {
    0.0
}

fn default_top_p() -> f32 {
    1.0
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auth_type: default_auth_type(),
            max_turns: default_max_turns(),
            compression_threshold: default_compression_threshold(),
            streaming: default_streaming(),
            context_window: None,
            next_speaker_model: None,
            fallback_model: default_fallback_model(),
            system_instruction: String::new(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            max_output_tokens: None,
        }
    }
}
