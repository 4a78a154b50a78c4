//! Job records and the events that change them.
//!
//! Both stores mutate job state only by applying [`CheckpointEvent`]s, so a
//! replayed log reproduces exactly the state the writer had.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokengov_core::{Chunk, ChunkId, ChunkStatus};

use super::{ChunkMeta, ChunkState, CheckpointError, JobProgress, JobStatus};

/// Identity of a chunk at registration time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredChunk {
    pub id: ChunkId,
    pub hash: String,
    pub token_count: u32,
}

impl From<&Chunk> for RegisteredChunk {
    fn from(chunk: &Chunk) -> Self {
        Self {
            id: chunk.id,
            hash: chunk.content_hash(),
            token_count: chunk.token_count,
        }
    }
}

/// A single state change, as written to the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CheckpointEvent {
    Registered {
        chunks: Vec<RegisteredChunk>,
        at: DateTime<Utc>,
    },
    Started {
        chunk_id: ChunkId,
        worker_id: usize,
        at: DateTime<Utc>,
    },
    Done {
        chunk_id: ChunkId,
        model: String,
        worker_id: usize,
        output_tokens: u32,
        processing_time_ms: u64,
        payload: serde_json::Value,
        at: DateTime<Utc>,
    },
    Failed {
        chunk_id: ChunkId,
        error: String,
        at: DateTime<Utc>,
    },
    Completed {
        status: JobStatus,
        at: DateTime<Utc>,
    },
}

impl CheckpointEvent {
    pub fn registered(chunks: &[Chunk]) -> Self {
        CheckpointEvent::Registered {
            chunks: chunks.iter().map(RegisteredChunk::from).collect(),
            at: Utc::now(),
        }
    }

    pub fn started(chunk_id: ChunkId, worker_id: usize) -> Self {
        CheckpointEvent::Started {
            chunk_id,
            worker_id,
            at: Utc::now(),
        }
    }

    pub fn done(chunk_id: ChunkId, meta: ChunkMeta) -> Self {
        CheckpointEvent::Done {
            chunk_id,
            model: meta.model,
            worker_id: meta.worker_id,
            output_tokens: meta.output_tokens,
            processing_time_ms: u64::try_from(meta.processing_time.as_millis()).unwrap_or(u64::MAX),
            payload: meta.payload,
            at: Utc::now(),
        }
    }

    pub fn failed(chunk_id: ChunkId, error: &str) -> Self {
        CheckpointEvent::Failed {
            chunk_id,
            error: error.to_string(),
            at: Utc::now(),
        }
    }

    pub fn completed(status: JobStatus) -> Self {
        CheckpointEvent::Completed {
            status,
            at: Utc::now(),
        }
    }

    /// Whether this event is a successful chunk completion.
    pub fn is_done(&self) -> bool {
        matches!(self, CheckpointEvent::Done { .. })
    }
}

/// Full state of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub status: JobStatus,
    pub chunks: BTreeMap<ChunkId, ChunkState>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// A job that has never been registered.
    pub fn new(job_id: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            job_id: job_id.into(),
            status: JobStatus::Initialized,
            chunks: BTreeMap::new(),
            created_at: at,
            updated_at: at,
        }
    }

    /// Apply one event.
    ///
    /// Updates for chunks that are not registered fail. Updates that would
    /// regress a done chunk are ignored.
    pub fn apply(&mut self, event: &CheckpointEvent) -> Result<(), CheckpointError> {
        match event {
            CheckpointEvent::Registered { chunks, at } => {
                self.status = if self.chunks.is_empty() {
                    JobStatus::Initialized
                } else {
                    JobStatus::Resumed
                };

                let mut next = BTreeMap::new();
                for registered in chunks {
                    let state = match self.chunks.remove(&registered.id) {
                        Some(existing)
                            if existing.status == ChunkStatus::Done && existing.hash == registered.hash =>
                        {
                            existing
                        }
                        Some(existing) => {
                            if existing.status == ChunkStatus::Done {
                                tracing::warn!(
                                    job_id = %self.job_id,
                                    chunk_id = registered.id,
                                    "Chunk content changed since it was processed, resetting"
                                );
                            }
                            pending_state(registered, *at)
                        }
                        None => pending_state(registered, *at),
                    };
                    next.insert(registered.id, state);
                }
                self.chunks = next;
                self.updated_at = *at;
            }

            CheckpointEvent::Started {
                chunk_id,
                worker_id,
                at,
            } => {
                let state = self.chunk_mut(*chunk_id)?;
                if state.status != ChunkStatus::Done {
                    state.status = ChunkStatus::InProgress;
                    state.worker_id = Some(*worker_id);
                    state.updated_at = *at;
                }
                self.updated_at = *at;
            }

            CheckpointEvent::Done {
                chunk_id,
                model,
                worker_id,
                output_tokens,
                processing_time_ms,
                payload,
                at,
            } => {
                let state = self.chunk_mut(*chunk_id)?;
                if state.status != ChunkStatus::Done {
                    state.status = ChunkStatus::Done;
                    state.model = Some(model.clone());
                    state.worker_id = Some(*worker_id);
                    state.output_tokens = *output_tokens;
                    state.processing_time_ms = *processing_time_ms;
                    state.payload = Some(payload.clone());
                    state.error = None;
                    state.updated_at = *at;
                }
                self.updated_at = *at;
            }

            CheckpointEvent::Failed { chunk_id, error, at } => {
                let job_id = self.job_id.clone();
                let state = self.chunk_mut(*chunk_id)?;
                if state.status == ChunkStatus::Done {
                    tracing::warn!(job_id = %job_id, chunk_id, "Ignoring failure for a done chunk");
                } else {
                    state.status = ChunkStatus::Failed;
                    state.error = Some(error.clone());
                    state.updated_at = *at;
                }
                self.updated_at = *at;
            }

            CheckpointEvent::Completed { status, at } => {
                self.status = *status;
                self.updated_at = *at;
            }
        }

        Ok(())
    }

    fn chunk_mut(&mut self, chunk_id: ChunkId) -> Result<&mut ChunkState, CheckpointError> {
        let job_id = &self.job_id;
        self.chunks
            .get_mut(&chunk_id)
            .ok_or_else(|| CheckpointError::UnknownChunk {
                job_id: job_id.clone(),
                chunk_id,
            })
    }

    /// Ids of chunks that are not done, ascending.
    pub fn pending(&self) -> Vec<ChunkId> {
        self.chunks
            .values()
            .filter(|c| c.status != ChunkStatus::Done)
            .map(|c| c.chunk_id)
            .collect()
    }

    /// Done chunks, ascending by id.
    pub fn completed(&self) -> Vec<ChunkState> {
        self.chunks
            .values()
            .filter(|c| c.status == ChunkStatus::Done)
            .cloned()
            .collect()
    }

    pub fn progress(&self) -> JobProgress {
        let count = |status: ChunkStatus| self.chunks.values().filter(|c| c.status == status).count();
        JobProgress {
            job_id: self.job_id.clone(),
            status: self.status,
            total: self.chunks.len(),
            pending: count(ChunkStatus::Pending),
            in_progress: count(ChunkStatus::InProgress),
            done: count(ChunkStatus::Done),
            failed: count(ChunkStatus::Failed),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

fn pending_state(registered: &RegisteredChunk, at: DateTime<Utc>) -> ChunkState {
    ChunkState {
        chunk_id: registered.id,
        status: ChunkStatus::Pending,
        hash: registered.hash.clone(),
        token_count: registered.token_count,
        output_tokens: 0,
        processing_time_ms: 0,
        model: None,
        worker_id: None,
        error: None,
        payload: None,
        updated_at: at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn chunks(texts: &[&str]) -> Vec<Chunk> {
        texts
            .iter()
            .enumerate()
            .map(|(i, t)| Chunk::from_text(i as u64, *t))
            .collect()
    }

    fn meta() -> ChunkMeta {
        ChunkMeta {
            model: "model-a".to_string(),
            worker_id: 1,
            output_tokens: 12,
            processing_time: Duration::from_millis(40),
            payload: serde_json::json!("summary"),
        }
    }

    fn record(texts: &[&str]) -> JobRecord {
        let mut record = JobRecord::new("job", Utc::now());
        record.apply(&CheckpointEvent::registered(&chunks(texts))).unwrap();
        record
    }

    #[test]
    fn test_register_creates_pending_chunks() {
        let record = record(&["a", "b", "c"]);
        assert_eq!(record.status, JobStatus::Initialized);
        assert_eq!(record.pending(), vec![0, 1, 2]);
        assert_eq!(record.progress().total, 3);
    }

    #[test]
    fn test_done_is_never_regressed() {
        let mut record = record(&["a", "b"]);
        record.apply(&CheckpointEvent::done(0, meta())).unwrap();
        record.apply(&CheckpointEvent::failed(0, "late failure")).unwrap();
        record.apply(&CheckpointEvent::started(0, 3)).unwrap();

        let state = &record.chunks[&0];
        assert_eq!(state.status, ChunkStatus::Done);
        assert_eq!(state.worker_id, Some(1));
        assert_eq!(state.payload, Some(serde_json::json!("summary")));
        assert_eq!(record.pending(), vec![1]);
    }

    #[test]
    fn test_reregister_resets_failed_and_keeps_done() {
        let mut record = record(&["a", "b", "c"]);
        record.apply(&CheckpointEvent::done(0, meta())).unwrap();
        record.apply(&CheckpointEvent::failed(1, "boom")).unwrap();
        record.apply(&CheckpointEvent::started(2, 0)).unwrap();

        record.apply(&CheckpointEvent::registered(&chunks(&["a", "b", "c"]))).unwrap();
        assert_eq!(record.status, JobStatus::Resumed);
        assert_eq!(record.chunks[&0].status, ChunkStatus::Done);
        assert_eq!(record.chunks[&1].status, ChunkStatus::Pending);
        assert_eq!(record.chunks[&1].error, None);
        assert_eq!(record.chunks[&2].status, ChunkStatus::Pending);
    }

    #[test]
    fn test_changed_content_resets_done_chunk() {
        let mut record = record(&["a", "b"]);
        record.apply(&CheckpointEvent::done(0, meta())).unwrap();

        record.apply(&CheckpointEvent::registered(&chunks(&["a changed", "b"]))).unwrap();
        assert_eq!(record.chunks[&0].status, ChunkStatus::Pending);
        assert_eq!(record.chunks[&0].payload, None);
    }

    #[test]
    fn test_stale_chunks_dropped_on_reregister() {
        let mut record = record(&["a", "b", "c"]);
        record.apply(&CheckpointEvent::registered(&chunks(&["a"]))).unwrap();
        assert_eq!(record.chunks.len(), 1);
    }

    #[test]
    fn test_unknown_chunk_is_an_error() {
        let mut record = record(&["a"]);
        let result = record.apply(&CheckpointEvent::done(9, meta()));
        assert!(matches!(result, Err(CheckpointError::UnknownChunk { chunk_id: 9, .. })));
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let json = serde_json::to_value(CheckpointEvent::failed(2, "timeout")).unwrap();
        assert_eq!(json["event"], "failed");
        assert_eq!(json["chunk_id"], 2);

        let status = serde_json::to_value(CheckpointEvent::completed(JobStatus::CompletedWithErrors)).unwrap();
        assert_eq!(status["status"], "COMPLETED_WITH_ERRORS");
    }
}
