use std::time::Duration;

use thiserror::Error;

/// Max characters of a vendor error body kept in an error value
const BODY_SNIPPET_LEN: usize = 512;

/// Errors surfaced by adapters, the retry policy and the session orchestrator.
///
/// Per-chunk and per-argument parse failures never appear here: the stream
/// engine logs them and recovers locally.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("{vendor} {operation}: invalid request: {message}")]
    Validation {
        vendor: String,
        operation: &'static str,
        message: String,
    },
    #[error("{vendor} {operation} failed with HTTP {status}: {body}")]
    Provider {
        vendor: String,
        operation: &'static str,
        status: u16,
        body: String,
        retry_after: Option<Duration>,
    },
    #[error("{vendor} {operation} transport failure: {message}")]
    Transport {
        vendor: String,
        operation: &'static str,
        message: String,
    },
    #[error("{vendor} stream failed: {message}")]
    Stream { vendor: String, message: String },
    #[error("{vendor} {operation}: malformed response: {message}")]
    Parse {
        vendor: String,
        operation: &'static str,
        message: String,
    },
    #[error("operation cancelled")]
    Cancelled,
    #[error("{vendor} returned no embeddings")]
    EmptyEmbedding { vendor: String },
    #[error("{vendor} returned {actual} embeddings for {expected} inputs")]
    EmbeddingCountMismatch {
        vendor: String,
        expected: usize,
        actual: usize,
    },
}

impl GenerationError {
    /// Rate limiting, server errors and transport failures are worth retrying
    pub fn is_retryable(&self) -> bool {
        match self {
            GenerationError::Provider { status, .. } => *status == 429 || *status >= 500,
            GenerationError::Transport { .. } => true,
            _ => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            GenerationError::Provider { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        self.status() == Some(429)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, GenerationError::Cancelled)
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            GenerationError::Provider { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub(crate) fn validation(vendor: &str, operation: &'static str, message: impl Into<String>) -> Self {
        GenerationError::Validation {
            vendor: vendor.to_string(),
            operation,
            message: message.into(),
        }
    }

    pub(crate) fn parse(vendor: &str, operation: &'static str, message: impl Into<String>) -> Self {
        GenerationError::Parse {
            vendor: vendor.to_string(),
            operation,
            message: message.into(),
        }
    }

    pub(crate) fn transport(vendor: &str, operation: &'static str, err: reqwest::Error) -> Self {
        // reqwest's Display includes the request URL, which may carry a key
        GenerationError::Transport {
            vendor: vendor.to_string(),
            operation,
            message: err.without_url().to_string(),
        }
    }
}

/// Pass a successful response through; turn any other status into a
/// `Provider` error with a redacted body snippet
pub(crate) async fn error_for_status(
    vendor: &str,
    operation: &'static str,
    response: reqwest::Response,
    key: &str,
) -> Result<reqwest::Response, GenerationError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let retry_after = parse_retry_after(response.headers());
    let body = response.text().await.unwrap_or_default();
    let body = body_snippet(&body, key);
    tracing::warn!(vendor, operation, status = status.as_u16(), body = %body, "Vendor request failed");
    Err(GenerationError::Provider {
        vendor: vendor.to_string(),
        operation,
        status: status.as_u16(),
        body,
        retry_after,
    })
}

/// Redact an API key from a vendor body and truncate it to a snippet
pub(crate) fn body_snippet(body: &str, key: &str) -> String {
    let redacted = redact_key(body, key);
    if redacted.chars().count() > BODY_SNIPPET_LEN {
        let mut snippet: String = redacted.chars().take(BODY_SNIPPET_LEN).collect();
        snippet.push_str("...");
        snippet
    } else {
        redacted
    }
}

/// Redact API key from error body to prevent leaking in logs
pub(crate) fn redact_key(body: &str, key: &str) -> String {
    if key.len() > 4 {
        let prefix: String = key.chars().take(4).collect();
        body.replace(key, &format!("{}...", prefix))
    } else {
        body.to_string()
    }
}

/// Parse a `Retry-After` header given in seconds (capped at 5 min)
pub(crate) fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(|secs| Duration::from_secs(secs.min(300)))
}
