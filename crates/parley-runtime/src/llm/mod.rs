pub mod error;
pub mod gemini;
pub mod models;
pub mod openai_compat;
pub mod openai_format;
pub mod provider;
pub mod retry;
pub mod streaming;
pub mod types;

use std::sync::Arc;

use crate::config::{AuthType, ProviderConfig};

pub use error::GenerationError;
pub use gemini::{GeminiClient, NativeAuth};
pub use openai_compat::{CompatProfile, OpenAiCompatibleClient};
pub use provider::{LLMProvider, ResponseStream};
pub use retry::{retry_with_backoff, FallbackHandler, ModelFallback, RetryOutcome, RetryPolicy};
pub use streaming::{drive_sse_stream, ChunkDecoder, OpenAiDeltaDecoder, SseFraming, SseLineProcessor};
pub use types::{
    Content, FinishReason, FunctionCall, FunctionResponse, GenerateResponse, GenerationConfig,
    Part, Role, ToolChoiceMode, ToolDeclaration, ToolGroup, UsageMetadata,
};

/// Build the adapter that serves `auth_type`
pub fn create_provider(
    auth_type: AuthType,
    config: ProviderConfig,
) -> Result<Arc<dyn LLMProvider>, GenerationError> {
    let provider: Arc<dyn LLMProvider> = match auth_type {
        AuthType::LoginWithGooglePersonal => {
            Arc::new(GeminiClient::new(config, NativeAuth::OAuthBearer)?)
        }
        AuthType::GeminiApiKey => Arc::new(GeminiClient::new(config, NativeAuth::ApiKey)?),
        AuthType::Ark => Arc::new(OpenAiCompatibleClient::ark(config)?),
        AuthType::GptOpenapi => Arc::new(OpenAiCompatibleClient::gpt_openapi(config)?),
    };
    tracing::info!(
        vendor = provider.vendor(),
        model = provider.model_name(),
        "Provider configured"
    );
    Ok(provider)
}
