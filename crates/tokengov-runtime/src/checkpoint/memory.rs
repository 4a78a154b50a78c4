//! In-memory checkpoint store.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use tokengov_core::{Chunk, ChunkId};

use super::record::{CheckpointEvent, JobRecord};
use super::{ChunkMeta, ChunkState, CheckpointError, CheckpointStore, JobProgress, JobStatus};

/// Checkpoint store that lives as long as the process.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    jobs: RwLock<HashMap<String, JobRecord>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of a job's full record.
    pub fn record(&self, job_id: &str) -> Option<JobRecord> {
        self.jobs.read().get(job_id).cloned()
    }

    fn apply(&self, job_id: &str, event: CheckpointEvent) -> Result<(), CheckpointError> {
        let mut jobs = self.jobs.write();
        let record = jobs
            .get_mut(job_id)
            .ok_or_else(|| CheckpointError::UnknownJob(job_id.to_string()))?;
        record.apply(&event)
    }

    fn read<R>(&self, job_id: &str, f: impl FnOnce(&JobRecord) -> R) -> Result<R, CheckpointError> {
        self.jobs
            .read()
            .get(job_id)
            .map(f)
            .ok_or_else(|| CheckpointError::UnknownJob(job_id.to_string()))
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn register_chunks(&self, job_id: &str, chunks: &[Chunk]) -> Result<JobProgress, CheckpointError> {
        let mut jobs = self.jobs.write();
        let record = jobs
            .entry(job_id.to_string())
            .or_insert_with(|| JobRecord::new(job_id, Utc::now()));
        record.apply(&CheckpointEvent::registered(chunks))?;
        Ok(record.progress())
    }

    async fn pending(&self, job_id: &str) -> Result<Vec<ChunkId>, CheckpointError> {
        self.read(job_id, JobRecord::pending)
    }

    async fn mark_started(&self, job_id: &str, chunk_id: ChunkId, worker_id: usize) -> Result<(), CheckpointError> {
        self.apply(job_id, CheckpointEvent::started(chunk_id, worker_id))
    }

    async fn mark_done(&self, job_id: &str, chunk_id: ChunkId, meta: ChunkMeta) -> Result<(), CheckpointError> {
        self.apply(job_id, CheckpointEvent::done(chunk_id, meta))
    }

    async fn mark_failed(&self, job_id: &str, chunk_id: ChunkId, error: &str) -> Result<(), CheckpointError> {
        self.apply(job_id, CheckpointEvent::failed(chunk_id, error))
    }

    async fn completed(&self, job_id: &str) -> Result<Vec<ChunkState>, CheckpointError> {
        self.read(job_id, JobRecord::completed)
    }

    async fn complete(&self, job_id: &str, status: JobStatus) -> Result<(), CheckpointError> {
        self.apply(job_id, CheckpointEvent::completed(status))
    }

    async fn status(&self, job_id: &str) -> Result<Option<JobProgress>, CheckpointError> {
        Ok(self.jobs.read().get(job_id).map(JobRecord::progress))
    }
}
