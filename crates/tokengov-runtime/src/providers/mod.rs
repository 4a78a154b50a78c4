//! LLM provider abstraction.
//!
//! The runner never talks to a backend directly; jobs that call an LLM wrap
//! an [`LlmProvider`] in a [`ProviderMapper`]. No concrete HTTP client ships
//! with this crate.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

mod mapper;

pub use mapper::{ProviderHealthCheck, ProviderMapper};
pub use tokengov_core::ChatMessage;

use crate::resilience::MapError;

/// Errors from LLM providers.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    HttpError(String),

    #[error("Rate limit exceeded, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("API error: {status} - {message}")]
    ApiError { status: u16, message: String },

    #[error("JSON parse error: {0}")]
    ParseError(String),

    #[error("Authentication failed")]
    AuthError,

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Context window exceeded: {0}")]
    ContextOverflow(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),
}

impl From<ProviderError> for MapError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::HttpError(message) => MapError::Transient(message),
            ProviderError::RateLimited { retry_after } => MapError::RateLimited { retry_after },
            ProviderError::ApiError { status, message } => MapError::Http { status, message },
            ProviderError::ParseError(message) => MapError::InvalidResponse(message),
            ProviderError::AuthError => MapError::Auth,
            ProviderError::Timeout(after) => MapError::Timeout(after),
            ProviderError::ContextOverflow(message) => MapError::InvalidInput(message),
            ProviderError::NotConfigured(message) => MapError::Other(message),
        }
    }
}

/// Configuration for a completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionConfig {
    /// Model to use
    pub model: String,

    /// Maximum tokens to generate
    pub max_tokens: u32,

    /// Temperature (0.0 for deterministic)
    pub temperature: f32,

    /// Request timeout
    pub timeout: Duration,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-5".to_string(),
            max_tokens: 1024,
            temperature: 0.0,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Response from an LLM completion.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionResponse {
    /// Generated content
    pub content: String,

    /// Token usage
    pub usage: TokenUsage,

    /// Model used
    pub model: String,

    /// Stop reason
    pub stop_reason: Option<String>,
}

/// Token usage from a completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenUsage {
    /// Tokens in the prompt
    pub prompt_tokens: u32,

    /// Tokens in the completion
    pub completion_tokens: u32,
}

impl TokenUsage {
    /// Total tokens used.
    pub fn total(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Provider abstraction allows swapping LLM backends.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Execute a chat completion.
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        config: &CompletionConfig,
    ) -> Result<CompletionResponse, ProviderError>;

    /// Check if provider is healthy.
    async fn health_check(&self) -> bool;

    /// Get provider name for logs.
    fn name(&self) -> &str;

    /// Estimate tokens for a prompt.
    fn estimate_tokens(&self, text: &str) -> u32 {
        tokengov_core::estimate_tokens(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_usage_total() {
        let usage = TokenUsage {
            prompt_tokens: 100,
            completion_tokens: 50,
        };
        assert_eq!(usage.total(), 150);
    }

    #[test]
    fn test_provider_errors_map_to_retryability() {
        let retryable = [
            ProviderError::HttpError("connection reset".into()),
            ProviderError::RateLimited { retry_after: Some(Duration::from_secs(2)) },
            ProviderError::ApiError { status: 503, message: "overloaded".into() },
            ProviderError::Timeout(Duration::from_secs(30)),
        ];
        for err in retryable {
            assert!(MapError::from(err.clone()).is_retryable(), "{} should retry", err);
        }

        let fatal = [
            ProviderError::ApiError { status: 400, message: "bad request".into() },
            ProviderError::AuthError,
            ProviderError::ParseError("eof".into()),
            ProviderError::ContextOverflow("too long".into()),
        ];
        for err in fatal {
            assert!(!MapError::from(err.clone()).is_retryable(), "{} should not retry", err);
        }
    }

    #[test]
    fn test_rate_limit_hint_survives() {
        let err: MapError = ProviderError::RateLimited {
            retry_after: Some(Duration::from_secs(7)),
        }
        .into();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
    }
}
