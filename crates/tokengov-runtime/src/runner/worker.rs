//! Worker loop: one sequential partition of a job's chunks.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokengov_core::{Chunk, ChunkId, ChunkResult};
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::job::Job;
use super::progress::{Cancellation, ProgressEvent};
use super::summary::ChunkError;
use crate::checkpoint::{CheckpointError, CheckpointStore, ChunkMeta};
use crate::error::{FailureKind, GovernorError};
use crate::mapper::{ChunkMapper, MapContext};
use crate::resilience::{CircuitBreaker, TokenBucketSet};

/// Everything a worker shares with its siblings.
pub(crate) struct WorkerContext<T> {
    pub job: Arc<Job>,
    pub mapper: Arc<dyn ChunkMapper<T>>,
    pub buckets: Arc<TokenBucketSet>,
    pub breaker: Arc<CircuitBreaker>,
    pub store: Arc<dyn CheckpointStore>,
    pub progress: Option<mpsc::UnboundedSender<ProgressEvent>>,
    pub cancellation: Cancellation,
    pub max_token_wait: Duration,
}

/// What happened to one chunk.
#[derive(Debug)]
pub(crate) enum ChunkOutcome<T> {
    Done(ChunkResult<T>),
    Failed(ChunkError),
}

impl<T> ChunkOutcome<T> {
    pub fn chunk_id(&self) -> ChunkId {
        match self {
            ChunkOutcome::Done(result) => result.chunk_id,
            ChunkOutcome::Failed(error) => error.chunk_id,
        }
    }
}

impl<T> WorkerContext<T> {
    pub fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.progress {
            let _ = tx.send(event);
        }
    }

    fn fail(
        &self,
        worker_id: usize,
        chunk_id: ChunkId,
        kind: FailureKind,
        message: String,
        outcomes: &mpsc::UnboundedSender<ChunkOutcome<T>>,
    ) {
        self.emit(ProgressEvent::ChunkFailed {
            job_id: self.job.id.clone(),
            chunk_id,
            worker_id,
            kind,
            message: message.clone(),
        });
        let _ = outcomes.send(ChunkOutcome::Failed(ChunkError {
            chunk_id,
            kind,
            message,
        }));
    }
}

/// Process `chunks` in order, reporting one outcome per chunk.
///
/// Cancellation reports the current and remaining chunks as cancelled. A
/// checkpoint failure stops the worker; chunks it never reached get no
/// outcome and the runner reports them as aborted.
pub(crate) async fn run_worker<T>(
    worker_id: usize,
    chunks: Vec<Chunk>,
    ctx: Arc<WorkerContext<T>>,
    outcomes: mpsc::UnboundedSender<ChunkOutcome<T>>,
) where
    T: Serialize + Send + 'static,
{
    let mut cancellation = ctx.cancellation.clone();
    let mut chunks = chunks.into_iter();

    tracing::debug!(job_id = %ctx.job.id, worker_id, chunks = chunks.len(), "Worker started");

    while let Some(chunk) = chunks.next() {
        let chunk_id = chunk.id;
        let result = if cancellation.is_cancelled() {
            Err(GovernorError::Cancelled)
        } else {
            process_chunk(worker_id, chunk, &ctx, &mut cancellation).await
        };

        match result {
            Ok(result) => {
                ctx.emit(ProgressEvent::ChunkProcessed {
                    job_id: ctx.job.id.clone(),
                    chunk_id,
                    worker_id,
                    model: result.model.clone(),
                    output_tokens: result.output_tokens,
                    processing_time_ms: result.processing_time.as_millis() as u64,
                });
                let _ = outcomes.send(ChunkOutcome::Done(result));
            }
            Err(GovernorError::Cancelled) => {
                let message = GovernorError::Cancelled.to_string();
                ctx.fail(worker_id, chunk_id, FailureKind::Cancelled, message.clone(), &outcomes);
                for rest in chunks.by_ref() {
                    ctx.fail(worker_id, rest.id, FailureKind::Cancelled, message.clone(), &outcomes);
                }
                tracing::info!(job_id = %ctx.job.id, worker_id, "Worker cancelled");
                return;
            }
            Err(e @ GovernorError::Checkpoint(_)) => {
                tracing::error!(job_id = %ctx.job.id, worker_id, chunk_id, error = %e, "Checkpoint write failed, stopping worker");
                ctx.fail(worker_id, chunk_id, e.kind(), e.to_string(), &outcomes);
                return;
            }
            Err(e) => {
                tracing::warn!(job_id = %ctx.job.id, worker_id, chunk_id, error = %e, "Chunk failed");
                let message = e.to_string();
                let persisted = ctx.store.mark_failed(&ctx.job.id, chunk_id, &message).await;
                ctx.fail(worker_id, chunk_id, e.kind(), message, &outcomes);
                if let Err(ce) = persisted {
                    tracing::error!(job_id = %ctx.job.id, worker_id, chunk_id, error = %ce, "Checkpoint write failed, stopping worker");
                    return;
                }
            }
        }
    }

    tracing::debug!(job_id = %ctx.job.id, worker_id, "Worker finished");
}

async fn process_chunk<T>(
    worker_id: usize,
    chunk: Chunk,
    ctx: &WorkerContext<T>,
    cancellation: &mut Cancellation,
) -> Result<ChunkResult<T>, GovernorError>
where
    T: Serialize + Send + 'static,
{
    let job = &ctx.job;
    let model = job.model_for(chunk.id).to_string();

    acquire_tokens(ctx, &model, chunk.token_count, cancellation).await?;
    ctx.store.mark_started(&job.id, chunk.id, worker_id).await?;

    let started = Instant::now();
    let call = ctx.breaker.execute(&model, |attempt| {
        let map_ctx = MapContext {
            job_id: job.id.clone(),
            model: model.clone(),
            worker_id,
            attempt,
        };
        ctx.mapper.map(chunk.clone(), map_ctx)
    });

    let output = tokio::select! {
        biased;
        _ = cancellation.cancelled() => return Err(GovernorError::Cancelled),
        output = call => output?,
    };

    let processing_time = output.processing_time.unwrap_or_else(|| started.elapsed());
    let output_tokens = output.output_tokens.unwrap_or(0);
    let payload = serde_json::to_value(&output.payload).map_err(CheckpointError::from)?;

    ctx.store
        .mark_done(
            &job.id,
            chunk.id,
            ChunkMeta {
                model: model.clone(),
                worker_id,
                output_tokens,
                processing_time,
                payload,
            },
        )
        .await?;

    tracing::debug!(
        job_id = %job.id,
        worker_id,
        chunk_id = chunk.id,
        model = %model,
        output_tokens,
        processing_ms = processing_time.as_millis() as u64,
        "Chunk processed"
    );

    Ok(ChunkResult {
        chunk_id: chunk.id,
        worker_id,
        model,
        payload: output.payload,
        output_tokens,
        processing_time,
    })
}

/// Reserve tokens for one chunk.
///
/// A denied request waits the suggested time (capped by `max_token_wait`)
/// and asks once more before giving up.
async fn acquire_tokens<T>(
    ctx: &WorkerContext<T>,
    model: &str,
    tokens: u32,
    cancellation: &mut Cancellation,
) -> Result<(), GovernorError> {
    let capacity = ctx.buckets.capacity(model)?;
    if tokens > capacity {
        return Err(GovernorError::ResourceExhausted {
            model: model.to_string(),
            tokens,
            reason: format!("chunk needs {} tokens but bucket capacity is {}", tokens, capacity),
        });
    }

    let priority = ctx.job.priority;
    let grant = ctx.buckets.acquire(model, tokens, priority)?;
    if grant.granted {
        return Ok(());
    }

    let wait = grant.wait().min(ctx.max_token_wait);
    tracing::debug!(model = %model, tokens, wait_ms = wait.as_millis() as u64, "Waiting for tokens");
    tokio::select! {
        biased;
        _ = cancellation.cancelled() => return Err(GovernorError::Cancelled),
        _ = tokio::time::sleep(wait) => {}
    }

    let grant = ctx.buckets.acquire(model, tokens, priority)?;
    if grant.granted {
        Ok(())
    } else {
        Err(GovernorError::ResourceExhausted {
            model: model.to_string(),
            tokens,
            reason: format!("still throttled after waiting {:?}", wait),
        })
    }
}
