use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::error::GenerationError;
use super::types::{Content, GenerateResponse, GenerationConfig};

/// Channel of canonical partial responses. Finite and not restartable; the
/// final element carries the finish reason.
pub type ResponseStream = tokio::sync::mpsc::Receiver<Result<GenerateResponse, GenerationError>>;

/// Buffer size of the channel behind a [`ResponseStream`]
pub const STREAM_CHANNEL_SIZE: usize = 32;

/// LLM provider trait - one uniform generation interface over every vendor protocol
#[async_trait]
pub trait LLMProvider: Send + Sync {
    /// Generate a response from the LLM (non-streaming)
    async fn generate(
        &self,
        contents: &[Content],
        config: &GenerationConfig,
    ) -> Result<GenerateResponse, GenerationError>;

    /// Open a streaming generation. Errors before the first chunk are returned
    /// here; errors afterwards arrive through the stream.
    async fn generate_stream(
        &self,
        contents: &[Content],
        config: &GenerationConfig,
        cancel: CancellationToken,
    ) -> Result<ResponseStream, GenerationError>;

    /// Token count of `contents`: exact where the vendor offers a counting
    /// endpoint, otherwise a character-based approximation
    async fn count_tokens(&self, contents: &[Content]) -> Result<u32, GenerationError>;

    /// One embedding vector per input text
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, GenerationError>;

    /// Vendor name for logging and error context
    fn vendor(&self) -> &str;

    /// Default model name of this adapter
    fn model_name(&self) -> &str;
}

/// Approximate token count as `ceil(chars / chars_per_token)`
pub fn approximate_tokens(text: &str, chars_per_token: f64) -> u32 {
    let chars = text.chars().count() as f64;
    (chars / chars_per_token).ceil() as u32
}

/// Check an embedding batch against its input count
pub fn validate_embeddings(
    vendor: &str,
    expected: usize,
    vectors: Vec<Vec<f32>>,
) -> Result<Vec<Vec<f32>>, GenerationError> {
    if vectors.is_empty() {
        return Err(GenerationError::EmptyEmbedding {
            vendor: vendor.to_string(),
        });
    }
    if vectors.len() != expected {
        return Err(GenerationError::EmbeddingCountMismatch {
            vendor: vendor.to_string(),
            expected,
            actual: vectors.len(),
        });
    }
    if vectors.iter().any(|v| v.is_empty()) {
        return Err(GenerationError::EmptyEmbedding {
            vendor: vendor.to_string(),
        });
    }
    Ok(vectors)
}
