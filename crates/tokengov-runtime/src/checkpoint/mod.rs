//! Durable per-chunk progress for resumable jobs.
//!
//! The runner talks to persistence only through [`CheckpointStore`]. Two
//! stores ship: an in-memory one for tests and short-lived processes, and a
//! JSONL event log that survives crashes.

mod jsonl;
mod memory;
mod record;

pub use jsonl::JsonlCheckpointStore;
pub use memory::MemoryCheckpointStore;
pub use record::{CheckpointEvent, JobRecord, RegisteredChunk};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokengov_core::{Chunk, ChunkId, ChunkStatus};

/// Errors from checkpoint stores.
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Checkpoint I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Checkpoint serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown job: {0}")]
    UnknownJob(String),

    #[error("Unknown chunk {chunk_id} in job {job_id}")]
    UnknownChunk { job_id: String, chunk_id: ChunkId },

    #[error("Invalid job id '{0}': use letters, digits, '.', '_' or '-'")]
    InvalidJobId(String),

    #[error("Corrupt checkpoint log {path} at line {line}: {message}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        message: String,
    },
}

/// Persisted state of one chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkState {
    pub chunk_id: ChunkId,
    pub status: ChunkStatus,

    /// SHA-256 of the chunk text at registration
    pub hash: String,

    pub token_count: u32,

    #[serde(default)]
    pub output_tokens: u32,

    #[serde(default)]
    pub processing_time_ms: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Serialized mapper output of a done chunk
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,

    pub updated_at: DateTime<Utc>,
}

impl ChunkState {
    pub fn processing_time(&self) -> Duration {
        Duration::from_millis(self.processing_time_ms)
    }
}

/// Details recorded when a chunk completes.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkMeta {
    pub model: String,
    pub worker_id: usize,
    pub output_tokens: u32,
    pub processing_time: Duration,
    pub payload: serde_json::Value,
}

/// Lifecycle status of a job in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Registered for the first time
    Initialized,

    /// Registered again after an earlier run
    Resumed,

    Completed,
    CompletedWithErrors,
    Cancelled,
}

/// Chunk counts for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub job_id: String,
    pub status: JobStatus,
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub done: usize,
    pub failed: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobProgress {
    /// Share of chunks done, in percent.
    pub fn percent_done(&self) -> f64 {
        if self.total == 0 {
            100.0
        } else {
            self.done as f64 / self.total as f64 * 100.0
        }
    }
}

/// Narrow persistence interface used by the job runner.
///
/// Writes are idempotent per chunk id and never regress a done chunk.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Register the chunks of a run.
    ///
    /// Unknown chunks become pending. On a re-run, failed and in-progress
    /// chunks return to pending, done chunks whose text hash changed are
    /// reset, and chunks no longer in the document are dropped.
    async fn register_chunks(&self, job_id: &str, chunks: &[Chunk]) -> Result<JobProgress, CheckpointError>;

    /// Ids of chunks that are not done, ascending.
    async fn pending(&self, job_id: &str) -> Result<Vec<ChunkId>, CheckpointError>;

    /// Record that a worker picked up a chunk.
    async fn mark_started(&self, _job_id: &str, _chunk_id: ChunkId, _worker_id: usize) -> Result<(), CheckpointError> {
        Ok(())
    }

    async fn mark_done(&self, job_id: &str, chunk_id: ChunkId, meta: ChunkMeta) -> Result<(), CheckpointError>;

    async fn mark_failed(&self, job_id: &str, chunk_id: ChunkId, error: &str) -> Result<(), CheckpointError>;

    /// States of done chunks, ascending by id.
    async fn completed(&self, job_id: &str) -> Result<Vec<ChunkState>, CheckpointError>;

    /// Record the final status of a run.
    async fn complete(&self, job_id: &str, status: JobStatus) -> Result<(), CheckpointError>;

    /// Progress of a job, if the store knows it.
    async fn status(&self, job_id: &str) -> Result<Option<JobProgress>, CheckpointError>;
}
