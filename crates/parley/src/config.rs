use anyhow::{bail, Context, Result};
use parley_runtime::{AuthType, ProviderConfig, SessionConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_sessions_dir")]
    pub sessions_dir: String,

    #[serde(default)]
    pub provider: ProviderSection,

    #[serde(default)]
    pub session: SessionConfig,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ProviderSection {
    #[serde(default = "default_auth_type")]
    pub auth_type: AuthType,

    /// Empty = read from the auth type's environment variable
    #[serde(default)]
    pub api_key: String,

    #[serde(default)]
    pub model: String,

    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default)]
    pub headers: HashMap<String, String>,
}

fn default_sessions_dir() -> String {
    "~/.parley/sessions".to_string()
}

fn default_auth_type() -> AuthType {
    AuthType::GeminiApiKey
}

fn default_timeout_ms() -> u64 {
    120_000
}

impl Default for ProviderSection {
    fn default() -> Self {
        Self {
            auth_type: default_auth_type(),
            api_key: String::new(),
            model: String::new(),
            base_url: None,
            timeout_ms: default_timeout_ms(),
            headers: HashMap::new(),
        }
    }
}

/// Environment variable holding the credential for `auth_type`
pub fn api_key_var(auth_type: AuthType) -> &'static str {
    match auth_type {
        AuthType::LoginWithGooglePersonal => "GOOGLE_OAUTH_ACCESS_TOKEN",
        AuthType::GeminiApiKey => "GEMINI_API_KEY",
        AuthType::Ark => "ARK_API_KEY",
        AuthType::GptOpenapi => "GPT_OPENAPI_API_KEY",
    }
}

/// Environment variable holding a model override for `auth_type`
fn model_var(auth_type: AuthType) -> Option<&'static str> {
    match auth_type {
        AuthType::Ark => Some("ARK_MODEL"),
        AuthType::GptOpenapi => Some("GPT_OPENAPI_MODEL"),
        _ => None,
    }
}

impl Config {
    /// Fill blank credentials and model from the environment
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let auth_type = self.provider.auth_type;
        if self.provider.api_key.is_empty() {
            if let Some(key) = lookup(api_key_var(auth_type)) {
                self.provider.api_key = key;
            }
        }
        if self.provider.model.is_empty() {
            if let Some(model) = model_var(auth_type).and_then(&lookup) {
                self.provider.model = model;
            }
        }
        self.session.auth_type = auth_type;
    }

    /// Adapter configuration; fails when no credential is available
    pub fn provider_config(&self) -> Result<ProviderConfig> {
        let provider = &self.provider;
        if provider.api_key.trim().is_empty() {
            bail!(
                "No API key configured for {:?}. Set provider.api_key or the {} environment variable.",
                provider.auth_type,
                api_key_var(provider.auth_type)
            );
        }
        Ok(ProviderConfig {
            api_key: provider.api_key.clone(),
            base_url: provider.base_url.clone(),
            model: provider.model.clone(),
            custom_headers: provider.headers.clone(),
            timeout_ms: provider.timeout_ms,
        })
    }

    pub fn sessions_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.sessions_dir).to_string())
    }
}

/// Load config from file or use defaults, then apply environment fallbacks
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = if let Some(path) = path {
        let content =
            fs::read_to_string(path).context(format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).context("Failed to parse TOML config")?
    } else {
        Config {
            sessions_dir: default_sessions_dir(),
            provider: ProviderSection::default(),
            session: SessionConfig::default(),
        }
    };

    config.apply_env(|name| std::env::var(name).ok());
    Ok(config)
}
