//! Job definition.

use tokengov_core::{ChunkId, ChunkOptions, GovernorConfig, Priority};

use crate::error::GovernorError;

/// A document-processing job. Immutable once a run starts.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    /// Stable id; a later run with the same id resumes this job
    pub id: String,

    pub worker_count: usize,

    /// Models chunks are spread across
    pub models: Vec<String>,

    pub priority: Priority,

    pub chunk_options: ChunkOptions,
}

impl Job {
    /// Create a job with default worker count, priority and chunking.
    pub fn new(id: impl Into<String>, models: Vec<String>) -> Self {
        Self {
            id: id.into(),
            worker_count: 4,
            models,
            priority: Priority::default(),
            chunk_options: ChunkOptions::default(),
        }
    }

    /// Create a job using every configured model and the `runner` and
    /// `chunking` sections.
    pub fn from_config(id: impl Into<String>, config: &GovernorConfig) -> Self {
        Self {
            id: id.into(),
            worker_count: config.runner.worker_count,
            models: config.model_names(),
            priority: config.runner.priority,
            chunk_options: config.chunking,
        }
    }

    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_chunk_options(mut self, options: ChunkOptions) -> Self {
        self.chunk_options = options;
        self
    }

    pub fn with_models(mut self, models: Vec<String>) -> Self {
        self.models = models;
        self
    }

    pub fn validate(&self) -> Result<(), GovernorError> {
        if self.id.trim().is_empty() {
            return Err(GovernorError::InvalidJob("job id must not be empty".into()));
        }
        if self.worker_count == 0 {
            return Err(GovernorError::InvalidJob("worker_count must be at least 1".into()));
        }
        if self.models.is_empty() {
            return Err(GovernorError::InvalidJob("at least one model is required".into()));
        }
        Ok(())
    }

    /// Model a chunk is sent to (round robin by id).
    pub fn model_for(&self, chunk_id: ChunkId) -> &str {
        let index = (chunk_id % self.models.len().max(1) as u64) as usize;
        self.models.get(index).map(String::as_str).unwrap_or_default()
    }

    /// Worker partition a chunk belongs to.
    pub fn worker_for(&self, chunk_id: ChunkId) -> usize {
        (chunk_id % self.worker_count.max(1) as u64) as usize
    }
}
