//! Job runner: split, map under governance, checkpoint, reduce.
//!
//! A run registers the document's chunks with the checkpoint store, restores
//! results a previous run already produced, and spreads the rest over a fixed
//! set of workers. Every chunk passes through the token bucket of its model
//! and the circuit breaker before the mapper sees it.

mod job;
mod progress;
mod summary;
mod worker;

pub use job::Job;
pub use progress::{cancellation, CancelHandle, Cancellation, ProgressEvent};
pub use summary::{ChunkError, JobOutcome, JobSummary, RunStatus, Throughput, Totals};

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokengov_core::{Chunk, ChunkId, ChunkResult, Chunker, GovernorConfig};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::checkpoint::{CheckpointStore, ChunkState, MemoryCheckpointStore};
use crate::error::{FailureKind, GovernorError};
use crate::mapper::ChunkMapper;
use crate::resilience::{CircuitBreaker, TokenBucketSet};
use worker::{ChunkOutcome, WorkerContext};

/// Runs jobs against shared rate limiters, breakers and checkpoint store.
pub struct JobRunner {
    buckets: Arc<TokenBucketSet>,
    breaker: Arc<CircuitBreaker>,
    store: Arc<dyn CheckpointStore>,
    progress: Option<mpsc::UnboundedSender<ProgressEvent>>,
    cancellation: Cancellation,
    max_token_wait: Duration,
}

impl JobRunner {
    /// Create a runner with in-memory checkpoints from a configuration.
    pub fn new(config: &GovernorConfig) -> Self {
        JobRunnerBuilder::new().config(config.clone()).build()
    }

    pub fn builder() -> JobRunnerBuilder {
        JobRunnerBuilder::new()
    }

    pub fn buckets(&self) -> &Arc<TokenBucketSet> {
        &self.buckets
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// Run `job` over `document`.
    ///
    /// Chunks already done under the same job id are restored instead of
    /// re-mapped. Per-chunk failures never abort the job; they are listed in
    /// the summary and `reducer` receives the successful results in chunk
    /// order. Only job-level problems (invalid job, unknown model, checkpoint
    /// registration) return `Err`.
    pub async fn run<T, R, M, F>(
        &self,
        job: Job,
        document: &str,
        mapper: M,
        reducer: F,
    ) -> Result<JobOutcome<R>, GovernorError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        M: ChunkMapper<T> + 'static,
        F: FnOnce(Vec<ChunkResult<T>>) -> R,
    {
        job.validate()?;
        if let Some(missing) = job.models.iter().find(|m| !self.buckets.contains(m)) {
            return Err(GovernorError::UnknownModel(missing.clone()));
        }

        let started = Instant::now();
        let chunks = Chunker::new(job.chunk_options).split(document);
        let registered = self.store.register_chunks(&job.id, &chunks).await?;
        let completed = self.store.completed(&job.id).await?;

        let mut results = restore_results::<T>(&job.id, completed);
        let restored: HashSet<ChunkId> = results.iter().map(|r| r.chunk_id).collect();
        let resumed = restored.len();
        // The store's pending chunks plus done chunks whose payload did not restore
        let to_process: Vec<Chunk> = chunks
            .iter()
            .filter(|c| !restored.contains(&c.id))
            .cloned()
            .collect();

        tracing::info!(
            job_id = %job.id,
            status = ?registered.status,
            total_chunks = chunks.len(),
            pending = to_process.len(),
            resumed,
            workers = job.worker_count,
            "Job started"
        );
        self.emit(ProgressEvent::JobStarted {
            job_id: job.id.clone(),
            total_chunks: chunks.len(),
            pending_chunks: to_process.len(),
            resumed_chunks: resumed,
        });

        let job = Arc::new(job);
        let outcomes = self.dispatch(&job, to_process.clone(), Arc::new(mapper)).await;

        let mut errors = Vec::new();
        let mut fresh_tokens = 0u64;
        let mut fresh_chunks = 0usize;
        let token_counts: HashMap<ChunkId, u32> = chunks.iter().map(|c| (c.id, c.token_count)).collect();
        let mut by_id: HashMap<ChunkId, ChunkOutcome<T>> =
            outcomes.into_iter().map(|o| (o.chunk_id(), o)).collect();

        for chunk in &to_process {
            match by_id.remove(&chunk.id) {
                Some(ChunkOutcome::Done(result)) => {
                    fresh_chunks += 1;
                    fresh_tokens += u64::from(chunk.token_count) + u64::from(result.output_tokens);
                    results.push(result);
                }
                Some(ChunkOutcome::Failed(error)) => errors.push(error),
                None => errors.push(ChunkError {
                    chunk_id: chunk.id,
                    kind: FailureKind::WorkerAborted,
                    message: "worker stopped before reaching this chunk".to_string(),
                }),
            }
        }
        results.sort_by_key(|r| r.chunk_id);
        errors.sort_by_key(|e| e.chunk_id);

        let status = if self.cancellation.is_cancelled()
            || errors.iter().any(|e| e.kind == FailureKind::Cancelled)
        {
            RunStatus::Cancelled
        } else if errors.is_empty() {
            RunStatus::Completed
        } else {
            RunStatus::CompletedWithErrors
        };

        if let Err(e) = self.store.complete(&job.id, status.into()).await {
            tracing::warn!(job_id = %job.id, error = %e, "Failed to record job completion");
        }
        self.buckets.rejection_alerts();

        let elapsed = started.elapsed();
        let totals = Totals {
            total_chunks: chunks.len(),
            processed: results.len(),
            failed: errors.len(),
            resumed,
            input_tokens: results
                .iter()
                .map(|r| u64::from(token_counts.get(&r.chunk_id).copied().unwrap_or(0)))
                .sum(),
            output_tokens: results.iter().map(|r| u64::from(r.output_tokens)).sum(),
        };
        let summary = JobSummary {
            job_id: job.id.clone(),
            status,
            throughput: Throughput::measure(elapsed.as_millis() as u64, fresh_chunks, fresh_tokens),
            totals,
            errors,
            timestamp: Utc::now(),
        };

        tracing::info!(
            job_id = %summary.job_id,
            status = ?summary.status,
            processed = summary.totals.processed,
            failed = summary.totals.failed,
            duration_ms = summary.throughput.duration_ms,
            "Job finished"
        );
        self.emit(ProgressEvent::JobFinished {
            job_id: summary.job_id.clone(),
            status: summary.status,
            processed: summary.totals.processed,
            failed: summary.totals.failed,
        });

        let output = reducer(results);
        Ok(JobOutcome { summary, output })
    }

    /// Spawn one worker per non-empty partition and collect their outcomes.
    async fn dispatch<T, M>(&self, job: &Arc<Job>, chunks: Vec<Chunk>, mapper: Arc<M>) -> Vec<ChunkOutcome<T>>
    where
        T: Serialize + Send + 'static,
        M: ChunkMapper<T> + 'static,
    {
        let mut partitions: Vec<Vec<Chunk>> = vec![Vec::new(); job.worker_count];
        for chunk in chunks {
            partitions[job.worker_for(chunk.id)].push(chunk);
        }

        let ctx = Arc::new(WorkerContext {
            job: job.clone(),
            mapper: mapper as Arc<dyn ChunkMapper<T>>,
            buckets: self.buckets.clone(),
            breaker: self.breaker.clone(),
            store: self.store.clone(),
            progress: self.progress.clone(),
            cancellation: self.cancellation.clone(),
            max_token_wait: self.max_token_wait,
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handles: Vec<_> = partitions
            .into_iter()
            .enumerate()
            .filter(|(_, partition)| !partition.is_empty())
            .map(|(worker_id, partition)| {
                tokio::spawn(worker::run_worker(worker_id, partition, ctx.clone(), tx.clone()))
            })
            .collect();
        drop(tx);

        for joined in futures::future::join_all(handles).await {
            if let Err(e) = joined {
                tracing::error!(job_id = %job.id, error = %e, "Worker aborted");
            }
        }

        let mut outcomes = Vec::new();
        while let Some(outcome) = rx.recv().await {
            outcomes.push(outcome);
        }
        outcomes
    }

    fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.progress {
            let _ = tx.send(event);
        }
    }
}

/// Rebuild results for chunks a previous run finished.
///
/// A stored payload that no longer deserializes as `T` is dropped and the
/// chunk is mapped again.
fn restore_results<T: DeserializeOwned>(job_id: &str, completed: Vec<ChunkState>) -> Vec<ChunkResult<T>> {
    completed
        .into_iter()
        .filter_map(|state| {
            let processing_time = state.processing_time();
            let payload = match state.payload.map(serde_json::from_value::<T>) {
                Some(Ok(payload)) => payload,
                Some(Err(e)) => {
                    tracing::warn!(job_id, chunk_id = state.chunk_id, error = %e, "Stored payload unreadable, reprocessing");
                    return None;
                }
                None => {
                    tracing::warn!(job_id, chunk_id = state.chunk_id, "Done chunk has no stored payload, reprocessing");
                    return None;
                }
            };
            Some(ChunkResult {
                chunk_id: state.chunk_id,
                worker_id: state.worker_id.unwrap_or_default(),
                model: state.model.unwrap_or_default(),
                payload,
                output_tokens: state.output_tokens,
                processing_time,
            })
        })
        .collect()
}

/// Builder for [`JobRunner`].
pub struct JobRunnerBuilder {
    config: GovernorConfig,
    buckets: Option<Arc<TokenBucketSet>>,
    breaker: Option<Arc<CircuitBreaker>>,
    store: Option<Arc<dyn CheckpointStore>>,
    progress: Option<mpsc::UnboundedSender<ProgressEvent>>,
    cancellation: Cancellation,
    max_token_wait: Option<Duration>,
}

impl JobRunnerBuilder {
    pub fn new() -> Self {
        Self {
            config: GovernorConfig::default(),
            buckets: None,
            breaker: None,
            store: None,
            progress: None,
            cancellation: Cancellation::never(),
            max_token_wait: None,
        }
    }

    /// Configuration used for any component not set explicitly.
    pub fn config(mut self, config: GovernorConfig) -> Self {
        self.config = config;
        self
    }

    /// Share token buckets with other runners.
    pub fn buckets(mut self, buckets: Arc<TokenBucketSet>) -> Self {
        self.buckets = Some(buckets);
        self
    }

    /// Share a circuit breaker with other runners.
    pub fn breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Send progress events to `tx`.
    pub fn progress(mut self, tx: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        self.progress = Some(tx);
        self
    }

    pub fn cancellation(mut self, cancellation: Cancellation) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// Longest a worker sleeps on a throttled bucket before asking again.
    pub fn max_token_wait(mut self, wait: Duration) -> Self {
        self.max_token_wait = Some(wait);
        self
    }

    pub fn build(self) -> JobRunner {
        let config = self.config;
        JobRunner {
            buckets: self
                .buckets
                .unwrap_or_else(|| Arc::new(TokenBucketSet::from_config(&config))),
            breaker: self
                .breaker
                .unwrap_or_else(|| Arc::new(CircuitBreaker::from_config(&config))),
            store: self
                .store
                .unwrap_or_else(|| Arc::new(MemoryCheckpointStore::new())),
            progress: self.progress,
            cancellation: self.cancellation,
            max_token_wait: self.max_token_wait.unwrap_or(config.runner.max_token_wait),
        }
    }
}

impl Default for JobRunnerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::JsonlCheckpointStore;
    use crate::mapper::{MapContext, MapOutput};
    use crate::resilience::MapError;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokengov_core::{concatenate_sections, ChunkOptions, ModelConfig};

    const MODEL: &str = "model-a";

    fn config() -> GovernorConfig {
        let mut config = GovernorConfig::default();
        config.models = BTreeMap::from([(MODEL.to_string(), ModelConfig::new(1_000_000, 1_000_000))]);
        config.retry.base_delay = Duration::from_millis(10);
        config.retry.max_delay = Duration::from_millis(100);
        config.retry.max_retries = 2;
        config.breaker.failure_threshold = 100;
        config
    }

    fn document(paragraphs: usize) -> String {
        (0..paragraphs)
            .map(|i| format!("Paragraph {} talks about subject {} in some detail.", i, i))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    fn job(id: &str) -> Job {
        Job::new(id, vec![MODEL.to_string()])
            .with_worker_count(3)
            .with_chunk_options(ChunkOptions::new(20, 0))
    }

    fn upper(chunk: Chunk, _ctx: MapContext) -> impl std::future::Future<Output = Result<MapOutput<String>, MapError>> {
        async move { Ok(MapOutput::new(chunk.text.to_uppercase()).with_output_tokens(5)) }
    }

    fn join(results: Vec<ChunkResult<String>>) -> String {
        concatenate_sections(&results, "\n")
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_maps_every_chunk_in_order() {
        let runner = JobRunner::new(&config());
        let doc = document(12);
        let expected_chunks = tokengov_core::split(&doc, ChunkOptions::new(20, 0)).len();

        let outcome = runner
            .run(job("ordered"), &doc, upper, |results: Vec<ChunkResult<String>>| {
                results.iter().map(|r| r.chunk_id).collect::<Vec<_>>()
            })
            .await
            .unwrap();

        assert_eq!(outcome.summary.status, RunStatus::Completed);
        assert_eq!(outcome.summary.totals.total_chunks, expected_chunks);
        assert_eq!(outcome.summary.totals.processed, expected_chunks);
        assert_eq!(outcome.summary.totals.output_tokens, 5 * expected_chunks as u64);
        assert_eq!(outcome.output, (0..expected_chunks as u64).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_are_isolated() {
        let runner = JobRunner::new(&config());
        let mapper = |chunk: Chunk, _ctx: MapContext| async move {
            if chunk.id == 1 {
                Err(MapError::InvalidInput("bad chunk".into()))
            } else {
                Ok(MapOutput::new(chunk.id))
            }
        };

        let outcome = runner
            .run(job("isolated"), &document(8), mapper, |results: Vec<ChunkResult<u64>>| results.len())
            .await
            .unwrap();

        let summary = outcome.summary;
        assert_eq!(summary.status, RunStatus::CompletedWithErrors);
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(summary.errors[0].chunk_id, 1);
        assert_eq!(summary.errors[0].kind, FailureKind::NonRetryable);
        assert_eq!(summary.totals.processed + summary.totals.failed, summary.totals.total_chunks);
        assert_eq!(outcome.output, summary.totals.processed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let runner = JobRunner::new(&config());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mapper = move |chunk: Chunk, ctx: MapContext| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if ctx.attempt == 1 {
                    Err(MapError::Transient("flaky".into()))
                } else {
                    Ok(MapOutput::new(chunk.text))
                }
            }
        };

        let outcome = runner.run(job("retried"), &document(4), mapper, join).await.unwrap();
        let chunks = outcome.summary.totals.total_chunks;
        assert_eq!(outcome.summary.status, RunStatus::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), chunks * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_are_reported() {
        let runner = JobRunner::new(&config());
        let mapper = |_chunk: Chunk, _ctx: MapContext| async move {
            Err::<MapOutput<String>, _>(MapError::Timeout(Duration::from_secs(5)))
        };

        let outcome = runner.run(job("exhausted"), &document(2), mapper, join).await.unwrap();
        assert_eq!(outcome.summary.totals.processed, 0);
        assert!(outcome
            .summary
            .errors
            .iter()
            .all(|e| e.kind == FailureKind::RetriesExhausted));
        assert_eq!(outcome.output, "");
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunk_larger_than_capacity_is_resource_exhausted() {
        let mut config = config();
        config.models.insert(MODEL.to_string(), ModelConfig::new(10, 10));
        let runner = JobRunner::new(&config);

        let outcome = runner.run(job("too-big"), &document(3), upper, join).await.unwrap();
        assert!(outcome.summary.totals.total_chunks > 0);
        assert!(outcome
            .summary
            .errors
            .iter()
            .all(|e| e.kind == FailureKind::ResourceExhausted));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_model_rejects_job() {
        let runner = JobRunner::new(&config());
        let job = job("unknown").with_models(vec!["missing".into()]);
        let err = runner.run(job, "text", upper, join).await.unwrap_err();
        assert!(matches!(err, GovernorError::UnknownModel(m) if m == "missing"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_document_completes() {
        let runner = JobRunner::new(&config());
        let outcome = runner.run(job("empty"), "", upper, join).await.unwrap();
        assert_eq!(outcome.summary.status, RunStatus::Completed);
        assert_eq!(outcome.summary.totals.total_chunks, 0);
        assert_eq!(outcome.output, "");
    }

    #[tokio::test]
    async fn test_resume_skips_done_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let doc = document(10);

        let first = JobRunner::builder()
            .config(config())
            .store(Arc::new(JsonlCheckpointStore::open(dir.path(), 1).await.unwrap()))
            .build();
        let failing = |chunk: Chunk, _ctx: MapContext| async move {
            if chunk.id % 2 == 0 {
                Ok(MapOutput::new(chunk.text.to_uppercase()))
            } else {
                Err(MapError::InvalidInput("rejected".into()))
            }
        };
        let partial = first.run(job("resume"), &doc, failing, join).await.unwrap();
        assert_eq!(partial.summary.status, RunStatus::CompletedWithErrors);
        let done_first = partial.summary.totals.processed;
        let pending_before = JsonlCheckpointStore::open(dir.path(), 1)
            .await
            .unwrap()
            .pending("resume")
            .await
            .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let counting = move |chunk: Chunk, ctx: MapContext| {
            counter.fetch_add(1, Ordering::SeqCst);
            upper(chunk, ctx)
        };
        let second = JobRunner::builder()
            .config(config())
            .store(Arc::new(JsonlCheckpointStore::open(dir.path(), 1).await.unwrap()))
            .build();
        let resumed = second.run(job("resume"), &doc, counting, join).await.unwrap();

        let total = resumed.summary.totals.total_chunks;
        assert_eq!(resumed.summary.status, RunStatus::Completed);
        assert_eq!(resumed.summary.totals.resumed, done_first);
        assert_eq!(calls.load(Ordering::SeqCst), total - done_first);
        assert_eq!(calls.load(Ordering::SeqCst), pending_before.len());

        let fresh = JobRunner::new(&config())
            .run(job("fresh"), &doc, upper, join)
            .await
            .unwrap();
        assert_eq!(resumed.output, fresh.output);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_reports_cancelled() {
        let (handle, cancellation) = cancellation();
        let runner = JobRunner::builder()
            .config(config())
            .cancellation(cancellation)
            .build();

        let trigger = handle.clone();
        let mapper = move |chunk: Chunk, _ctx: MapContext| {
            let trigger = trigger.clone();
            async move {
                if chunk.id == 0 {
                    trigger.cancel();
                    std::future::pending::<()>().await;
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok::<_, MapError>(MapOutput::new(chunk.text))
            }
        };

        let outcome = runner
            .run(job("cancel").with_worker_count(1), &document(6), mapper, join)
            .await
            .unwrap();

        let summary = outcome.summary;
        assert_eq!(summary.status, RunStatus::Cancelled);
        assert_eq!(summary.totals.processed, 0);
        assert_eq!(summary.errors_of(FailureKind::Cancelled).count(), summary.totals.total_chunks);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let runner = JobRunner::builder().config(config()).progress(tx).build();

        let outcome = runner.run(job("progress"), &document(5), upper, join).await.unwrap();
        drop(runner);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert!(matches!(events.first(), Some(ProgressEvent::JobStarted { .. })));
        assert!(matches!(
            events.last(),
            Some(ProgressEvent::JobFinished { status: RunStatus::Completed, .. })
        ));
        let processed = events
            .iter()
            .filter(|e| matches!(e, ProgressEvent::ChunkProcessed { .. }))
            .count();
        assert_eq!(processed, outcome.summary.totals.total_chunks);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttled_bucket_waits_then_proceeds() {
        let mut config = config();
        // 600 tokens per minute refills 10 per second
        config.models.insert(MODEL.to_string(), ModelConfig::new(600, 60));
        let runner = JobRunner::builder()
            .config(config)
            .max_token_wait(Duration::from_secs(30))
            .build();

        let outcome = runner
            .run(
                job("throttled").with_worker_count(1),
                &document(10),
                upper,
                join,
            )
            .await
            .unwrap();

        assert_eq!(outcome.summary.status, RunStatus::Completed);
        assert!(runner.buckets().status(MODEL).unwrap().metrics.denied > 0);
    }
}
