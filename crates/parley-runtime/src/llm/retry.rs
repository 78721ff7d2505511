use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::error::GenerationError;
use crate::config::AuthType;

/// Exponential backoff with jitter for retryable vendor failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry that follows `attempt` (1-based): doubles per
    /// attempt up to `max_delay`, then ±30% jitter
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self
            .initial_delay
            .saturating_mul(2u32.pow(exp))
            .min(self.max_delay);
        let jitter = rand::thread_rng().gen_range(-0.3..=0.3);
        base.mul_f64(1.0 + jitter)
    }
}

/// Asked whether to switch to the fallback model after persistent rate limiting
#[async_trait]
pub trait FallbackHandler: Send + Sync {
    async fn accept(&self, current_model: &str, fallback_model: &str) -> anyhow::Result<bool>;
}

/// Model-fallback settings for one retried call
pub struct ModelFallback<'a> {
    pub auth_type: AuthType,
    pub fallback_model: &'a str,
    pub handler: Option<&'a dyn FallbackHandler>,
}

impl ModelFallback<'_> {
    /// Fallback that never triggers
    pub fn disabled() -> ModelFallback<'static> {
        ModelFallback {
            auth_type: AuthType::GeminiApiKey,
            fallback_model: "",
            handler: None,
        }
    }
}

/// Value of a successful retried call
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub value: T,
    /// Model the successful attempt ran on
    pub model: String,
    /// Set when the call switched models; the model it switched away from
    pub switched_from: Option<String>,
}

/// Run `op` against `model`, retrying 429/5xx/transport failures with
/// backoff. Persistent 429 may switch to the fallback model once.
///
/// Cancellation preempts both the in-flight attempt and the backoff wait.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    model: &str,
    fallback: &ModelFallback<'_>,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<RetryOutcome<T>, GenerationError>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<T, GenerationError>>,
{
    let mut current = model.to_string();
    let mut switched_from = None;
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(GenerationError::Cancelled),
            result = op(current.clone()) => result,
        };

        let err = match result {
            Ok(value) => {
                return Ok(RetryOutcome {
                    value,
                    model: current,
                    switched_from,
                })
            }
            Err(e) => e,
        };

        if !err.is_retryable() {
            return Err(err);
        }

        if attempt >= policy.max_attempts.max(1) {
            if err.is_rate_limited() {
                if let Some(next) = try_fallback(&current, fallback).await {
                    info!(from = %current, to = %next, "Switching to fallback model");
                    switched_from.get_or_insert_with(|| current.clone());
                    current = next;
                    attempt = 0;
                    continue;
                }
            }
            warn!(attempts = attempt, model = %current, error = %err, "Giving up after retries");
            return Err(err);
        }

        let delay = err
            .retry_after()
            .unwrap_or_else(|| policy.backoff_delay(attempt));
        warn!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            status = ?err.status(),
            model = %current,
            error = %err,
            "Request failed, retrying"
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(GenerationError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn try_fallback(current: &str, fallback: &ModelFallback<'_>) -> Option<String> {
    if !fallback.auth_type.allows_model_fallback() {
        return None;
    }
    let handler = fallback.handler?;
    if fallback.fallback_model.is_empty() || fallback.fallback_model == current {
        return None;
    }

    match handler.accept(current, fallback.fallback_model).await {
        Ok(true) => Some(fallback.fallback_model.to_string()),
        Ok(false) => {
            info!(model = %current, "Model fallback declined");
            None
        }
        Err(e) => {
            warn!(model = %current, error = %e, "Fallback handler failed, keeping current model");
            None
        }
    }
}
