//! Completion service client
//!
//! A single request/response call taking an opaque prompt. Rate limiting is
//! reported as its own error variant so callers can back off.

mod openai_compat;

pub use openai_compat::OpenAiCompatProvider;

use crate::config::LLM_MAX_RETRIES;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors that can occur during LLM operations
#[derive(Debug, Error)]
pub enum LlmError {
    /// Error returned by the provider's API
    #[error("API error: {0}")]
    ApiError(String),
    /// Error during network communication
    #[error("Network error: {0}")]
    NetworkError(String),
    /// Missing provider configuration or API key
    #[error("Missing client/API key: {0}")]
    MissingConfig(String),
    /// Rate limit exceeded (429), optionally with a wait time
    #[error("Rate limit exceeded: {message} (wait: {wait_secs:?}s)")]
    RateLimit {
        /// Retry-After duration in seconds, if provided by the server
        wait_secs: Option<u64>,
        /// Error message from the server
        message: String,
    },
    /// The request did not finish within the caller's timeout
    #[error("Completion timed out")]
    Timeout,
    /// Any other unexpected error
    #[error("Unknown error: {0}")]
    Unknown(String),
}

/// Interface for completion providers
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Complete `prompt` and return the generated text
    async fn complete(&self, prompt: &str) -> Result<String, LlmError>;
}

/// Provider used when no API key is configured
pub struct DisabledProvider;

#[async_trait]
impl CompletionProvider for DisabledProvider {
    async fn complete(&self, _prompt: &str) -> Result<String, LlmError> {
        Err(LlmError::MissingConfig("LLM_API_KEY is not set".to_string()))
    }
}

/// Completion client with per-attempt timeout and retry/backoff
#[derive(Clone)]
pub struct CompletionClient {
    provider: Arc<dyn CompletionProvider>,
    timeout: Duration,
    base_backoff: Duration,
}

impl CompletionClient {
    /// Wrap `provider`, bounding each attempt by `timeout`
    #[must_use]
    pub fn new(provider: Arc<dyn CompletionProvider>, timeout: Duration) -> Self {
        Self {
            provider,
            timeout,
            base_backoff: Duration::from_secs(1),
        }
    }

    /// Override the base backoff (tests use a tiny one)
    #[must_use]
    pub const fn with_base_backoff(mut self, base_backoff: Duration) -> Self {
        self.base_backoff = base_backoff;
        self
    }

    /// Complete `prompt`, retrying transient and rate-limit failures.
    ///
    /// # Errors
    ///
    /// Returns the last provider error once retries are exhausted, or the
    /// first non-retryable one.
    pub async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        let mut attempt = 1;
        loop {
            let started = std::time::Instant::now();
            let result = tokio::time::timeout(self.timeout, self.provider.complete(prompt))
                .await
                .unwrap_or(Err(LlmError::Timeout));

            match result {
                Ok(text) => {
                    debug!(
                        attempt,
                        duration_ms = started.elapsed().as_millis(),
                        "Completion succeeded"
                    );
                    return Ok(text);
                }
                Err(e) => {
                    warn!(attempt, max_attempts = LLM_MAX_RETRIES, error = %e, "Completion failed");
                    let delay = self.retry_delay(&e, attempt);
                    match delay {
                        Some(delay) if attempt < LLM_MAX_RETRIES => {
                            info!(backoff_ms = delay.as_millis(), attempt, "Retrying completion");
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                        }
                        _ => return Err(e),
                    }
                }
            }
        }
    }

    /// Delay before the next attempt, or `None` if the error is final
    fn retry_delay(&self, error: &LlmError, attempt: usize) -> Option<Duration> {
        let factor = 2u32.saturating_pow(u32::try_from(attempt - 1).unwrap_or(u32::MAX));
        match error {
            LlmError::RateLimit {
                wait_secs: Some(secs),
                ..
            } => Some(Duration::from_secs(secs + 1)),
            // Rate limits back off harder than transient failures
            LlmError::RateLimit { wait_secs: None, .. } => {
                Some(self.base_backoff.saturating_mul(10).saturating_mul(factor))
            }
            LlmError::NetworkError(_) | LlmError::Timeout => {
                Some(self.base_backoff.saturating_mul(factor))
            }
            LlmError::ApiError(msg) => {
                let lower = msg.to_lowercase();
                let transient = ["500", "502", "503", "504", "overloaded"]
                    .iter()
                    .any(|code| lower.contains(code));
                transient.then(|| self.base_backoff.saturating_mul(factor))
            }
            LlmError::MissingConfig(_) | LlmError::Unknown(_) => None,
        }
    }
}
