//! OpenAI-compatible completion provider
//!
//! Works against any endpoint speaking the chat-completions protocol
//! (OpenRouter, Groq, Mistral, ...), selected by base URL.

use super::{CompletionProvider, LlmError};
use crate::config::LLM_TEMPERATURE;
use async_openai::types::chat::{
    ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
};
use async_openai::{config::OpenAIConfig, Client};
use async_trait::async_trait;

/// Completion provider backed by an async-openai client
pub struct OpenAiCompatProvider {
    client: Client<OpenAIConfig>,
    model_id: String,
    max_tokens: u32,
}

impl OpenAiCompatProvider {
    /// Create a provider for `api_base` using `model_id`
    #[must_use]
    pub fn new(api_key: &str, api_base: &str, model_id: &str, max_tokens: u32) -> Self {
        let config = OpenAIConfig::new()
            .with_api_key(api_key)
            .with_api_base(api_base);
        Self {
            client: Client::with_config(config),
            model_id: model_id.to_string(),
            max_tokens,
        }
    }
}

/// Map a provider error message onto the error taxonomy
pub(crate) fn classify_error(message: String) -> LlmError {
    let lower = message.to_lowercase();
    if lower.contains("429") || lower.contains("rate limit") || lower.contains("rate_limit") {
        LlmError::RateLimit {
            wait_secs: None,
            message,
        }
    } else if lower.contains("error sending request")
        || lower.contains("connection")
        || lower.contains("timed out")
    {
        LlmError::NetworkError(message)
    } else {
        LlmError::ApiError(message)
    }
}

#[async_trait]
impl CompletionProvider for OpenAiCompatProvider {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        let message = ChatCompletionRequestUserMessageArgs::default()
            .content(prompt)
            .build()
            .map_err(|e| LlmError::Unknown(e.to_string()))?;

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model_id)
            .messages(vec![message.into()])
            .max_tokens(self.max_tokens)
            .temperature(LLM_TEMPERATURE)
            .build()
            .map_err(|e| LlmError::Unknown(e.to_string()))?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| classify_error(e.to_string()))?;

        response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| LlmError::ApiError("Empty response".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_rate_limit() {
        assert!(matches!(
            classify_error("ApiError: 429 Too Many Requests".to_string()),
            LlmError::RateLimit { wait_secs: None, .. }
        ));
        assert!(matches!(
            classify_error("rate_limit_exceeded".to_string()),
            LlmError::RateLimit { .. }
        ));
    }

    #[test]
    fn test_classify_other_errors() {
        assert!(matches!(
            classify_error("http error: error sending request".to_string()),
            LlmError::NetworkError(_)
        ));
        assert!(matches!(
            classify_error("invalid model".to_string()),
            LlmError::ApiError(_)
        ));
    }
}
