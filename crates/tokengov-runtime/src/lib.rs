//! # tokengov-runtime
//!
//! Governed map/reduce over large documents.
//!
//! A [`JobRunner`] splits a document with `tokengov-core`, sends every chunk
//! through the token bucket of its model and a per-model circuit breaker,
//! retries transient failures with jittered exponential backoff, and records
//! progress in a [`CheckpointStore`] so an interrupted job resumes where it
//! stopped.
//!
//! ## Example
//!
//! ```rust,ignore
//! use tokengov_core::{concatenate_sections, GovernorConfig};
//! use tokengov_runtime::{Job, JobRunner, ProviderMapper};
//!
//! let config = GovernorConfig::from_file("governor.yaml")?;
//! let runner = JobRunner::new(&config);
//! let mapper = ProviderMapper::new(provider, "Summarize this section.");
//!
//! let outcome = runner
//!     .run(Job::from_config("report-42", &config), &document, mapper, |results| {
//!         concatenate_sections(&results, "\n\n")
//!     })
//!     .await?;
//! println!("{:?}: {} chunks", outcome.summary.status, outcome.summary.totals.processed);
//! ```

pub mod checkpoint;
pub mod error;
pub mod mapper;
pub mod providers;
pub mod resilience;
pub mod runner;

pub use checkpoint::{
    CheckpointError, CheckpointStore, ChunkMeta, ChunkState, JobProgress, JobStatus,
    JsonlCheckpointStore, MemoryCheckpointStore,
};
pub use error::{FailureKind, GovernorError};
pub use mapper::{ChunkMapper, MapContext, MapOutput};
pub use providers::{
    CompletionConfig, CompletionResponse, LlmProvider, ProviderError, ProviderHealthCheck,
    ProviderMapper, TokenUsage,
};
pub use resilience::{
    BackoffPolicy, CircuitBreaker, HealthAlert, HealthMonitor, MapError, TokenBucketSet,
    TokenGrant,
};
pub use runner::{
    cancellation, CancelHandle, Cancellation, ChunkError, Job, JobOutcome, JobRunner,
    JobRunnerBuilder, JobSummary, ProgressEvent, RunStatus,
};
