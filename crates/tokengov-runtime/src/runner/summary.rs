//! Job summaries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokengov_core::ChunkId;

use crate::checkpoint::JobStatus;
use crate::error::FailureKind;

/// Final status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Completed,
    CompletedWithErrors,
    Cancelled,
}

impl From<RunStatus> for JobStatus {
    fn from(status: RunStatus) -> Self {
        match status {
            RunStatus::Completed => JobStatus::Completed,
            RunStatus::CompletedWithErrors => JobStatus::CompletedWithErrors,
            RunStatus::Cancelled => JobStatus::Cancelled,
        }
    }
}

/// Chunk and token counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub total_chunks: usize,

    /// Chunks with a result, including resumed ones
    pub processed: usize,

    pub failed: usize,

    /// Chunks restored from an earlier run
    pub resumed: usize,

    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Work done by this run over wall-clock time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Throughput {
    pub duration_ms: u64,
    pub chunks_per_sec: f64,
    pub tokens_per_sec: f64,
}

impl Throughput {
    pub fn measure(duration_ms: u64, chunks: usize, tokens: u64) -> Self {
        let secs = duration_ms as f64 / 1000.0;
        if secs <= 0.0 {
            return Self {
                duration_ms,
                ..Self::default()
            };
        }
        Self {
            duration_ms,
            chunks_per_sec: chunks as f64 / secs,
            tokens_per_sec: tokens as f64 / secs,
        }
    }
}

/// One chunk that did not produce a result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkError {
    pub chunk_id: ChunkId,
    pub kind: FailureKind,
    pub message: String,
}

/// Serializable report of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: String,
    pub status: RunStatus,
    pub totals: Totals,
    pub throughput: Throughput,
    pub errors: Vec<ChunkError>,
    pub timestamp: DateTime<Utc>,
}

impl JobSummary {
    /// Whether every chunk produced a result.
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// Failures of one kind.
    pub fn errors_of(&self, kind: FailureKind) -> impl Iterator<Item = &ChunkError> {
        self.errors.iter().filter(move |e| e.kind == kind)
    }
}

/// Summary plus the reducer's output.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome<R> {
    pub summary: JobSummary,
    pub output: R,
}
