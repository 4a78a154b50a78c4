//! Adapters from [`LlmProvider`] to the runner's seams.

use async_trait::async_trait;
use std::sync::Arc;
use tokengov_core::Chunk;
use tokio::time::Instant;

use super::{ChatMessage, CompletionConfig, LlmProvider};
use crate::mapper::{ChunkMapper, MapContext, MapOutput};
use crate::resilience::{HealthCheck, MapError};

/// Maps each chunk with one chat completion.
///
/// The request is the system prompt followed by the chunk text as the user
/// message. The model comes from the map context so round-robin model
/// selection reaches the provider.
pub struct ProviderMapper {
    provider: Arc<dyn LlmProvider>,
    system_prompt: String,
    config: CompletionConfig,
}

impl ProviderMapper {
    pub fn new(provider: Arc<dyn LlmProvider>, system_prompt: impl Into<String>) -> Self {
        Self {
            provider,
            system_prompt: system_prompt.into(),
            config: CompletionConfig::default(),
        }
    }

    /// Base completion settings; `model` is overridden per chunk.
    pub fn with_config(mut self, config: CompletionConfig) -> Self {
        self.config = config;
        self
    }

    fn messages(&self, chunk: &Chunk) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(2);
        if !self.system_prompt.is_empty() {
            messages.push(ChatMessage::system(self.system_prompt.clone()));
        }
        messages.push(ChatMessage::user(chunk.text.clone()));
        messages
    }
}

#[async_trait]
impl ChunkMapper<String> for ProviderMapper {
    async fn map(&self, chunk: Chunk, ctx: MapContext) -> Result<MapOutput<String>, MapError> {
        let config = CompletionConfig {
            model: ctx.model.clone(),
            ..self.config.clone()
        };
        let started = Instant::now();

        let call = self.provider.complete(self.messages(&chunk), &config);
        let response = match tokio::time::timeout(config.timeout, call).await {
            Ok(result) => result?,
            Err(_) => {
                tracing::warn!(
                    provider = self.provider.name(),
                    model = %ctx.model,
                    chunk_id = chunk.id,
                    attempt = ctx.attempt,
                    "Completion timed out"
                );
                return Err(MapError::Timeout(config.timeout));
            }
        };

        Ok(MapOutput::new(response.content)
            .with_output_tokens(response.usage.completion_tokens)
            .with_processing_time(started.elapsed()))
    }
}

/// Health probe backed by [`LlmProvider::health_check`].
pub struct ProviderHealthCheck {
    provider: Arc<dyn LlmProvider>,
}

impl ProviderHealthCheck {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl HealthCheck for ProviderHealthCheck {
    async fn check(&self) -> bool {
        self.provider.health_check().await
    }
}
