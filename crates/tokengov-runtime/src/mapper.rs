//! The per-chunk work function.
//!
//! A job's mapper turns one chunk into a payload, usually by calling an LLM.
//! Closures of the right shape implement [`ChunkMapper`] directly.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokengov_core::Chunk;

use crate::resilience::MapError;

/// Where and how a chunk is being mapped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapContext {
    pub job_id: String,

    /// Model selected for this chunk
    pub model: String,

    pub worker_id: usize,

    /// 1-based attempt number within the current run
    pub attempt: u32,
}

/// Successful mapper output.
#[derive(Debug, Clone, PartialEq)]
pub struct MapOutput<T> {
    pub payload: T,

    /// Tokens produced by the backend, if known
    pub output_tokens: Option<u32>,

    /// Backend-reported processing time; wall clock is used when absent
    pub processing_time: Option<Duration>,
}

impl<T> MapOutput<T> {
    pub fn new(payload: T) -> Self {
        Self {
            payload,
            output_tokens: None,
            processing_time: None,
        }
    }

    pub fn with_output_tokens(mut self, tokens: u32) -> Self {
        self.output_tokens = Some(tokens);
        self
    }

    pub fn with_processing_time(mut self, duration: Duration) -> Self {
        self.processing_time = Some(duration);
        self
    }
}

/// Maps one chunk to a payload.
#[async_trait]
pub trait ChunkMapper<T>: Send + Sync {
    async fn map(&self, chunk: Chunk, ctx: MapContext) -> Result<MapOutput<T>, MapError>;
}

#[async_trait]
impl<T, F, Fut> ChunkMapper<T> for F
where
    T: Send + 'static,
    F: Fn(Chunk, MapContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<MapOutput<T>, MapError>> + Send,
{
    async fn map(&self, chunk: Chunk, ctx: MapContext) -> Result<MapOutput<T>, MapError> {
        (self)(chunk, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_closure_is_a_mapper() {
        let mapper = |chunk: Chunk, ctx: MapContext| async move {
            Ok::<_, MapError>(MapOutput::new(format!("{}:{}", ctx.model, chunk.text.len())).with_output_tokens(3))
        };

        let ctx = MapContext {
            job_id: "job".to_string(),
            model: "model-a".to_string(),
            worker_id: 0,
            attempt: 1,
        };
        let output = ChunkMapper::map(&mapper, Chunk::from_text(0, "hello"), ctx).await.unwrap();
        assert_eq!(output.payload, "model-a:5");
        assert_eq!(output.output_tokens, Some(3));
        assert_eq!(output.processing_time, None);
    }
}
