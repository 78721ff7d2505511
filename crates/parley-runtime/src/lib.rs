pub mod chat;
pub mod config;
pub mod llm;
pub mod session;

pub use chat::{clean_json_text, Chat, CompressionInfo, TurnEvent, TurnOutcome, CONTINUATION_PROMPT};
pub use config::{AuthType, ProviderConfig, SessionConfig};
pub use llm::{
    create_provider, Content, FallbackHandler, FinishReason, FunctionCall, FunctionResponse,
    GenerateResponse, GenerationConfig, GenerationError, LLMProvider, Part, ResponseStream,
    RetryPolicy, Role, ToolDeclaration, ToolGroup, UsageMetadata,
};
pub use session::{Session, SessionStore};

/// Initialize structured JSON logging
pub fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    fmt()
        .json()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
}
