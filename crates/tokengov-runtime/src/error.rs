//! Governor errors and the per-chunk failure taxonomy.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::checkpoint::CheckpointError;
use crate::resilience::MapError;

/// Errors from the runtime.
#[derive(Error, Debug)]
pub enum GovernorError {
    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("Circuit open for {model}, retry in {remaining:?}")]
    CircuitOpen { model: String, remaining: Duration },

    #[error("Retries exhausted for {model} after {attempts} attempts: {source}")]
    RetriesExhausted {
        model: String,
        attempts: u32,
        #[source]
        source: MapError,
    },

    #[error("Non-retryable failure from {model}: {source}")]
    NonRetryable {
        model: String,
        #[source]
        source: MapError,
    },

    #[error("Token budget exhausted for {model}: {reason}")]
    ResourceExhausted {
        model: String,
        tokens: u32,
        reason: String,
    },

    #[error("Cancelled")]
    Cancelled,

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Invalid job: {0}")]
    InvalidJob(String),
}

impl GovernorError {
    /// Failure category reported in job summaries.
    pub fn kind(&self) -> FailureKind {
        match self {
            GovernorError::CircuitOpen { .. } => FailureKind::CircuitOpen,
            GovernorError::RetriesExhausted { .. } => FailureKind::RetriesExhausted,
            GovernorError::NonRetryable { .. } | GovernorError::InvalidJob(_) => {
                FailureKind::NonRetryable
            }
            GovernorError::ResourceExhausted { .. } | GovernorError::UnknownModel(_) => {
                FailureKind::ResourceExhausted
            }
            GovernorError::Cancelled => FailureKind::Cancelled,
            GovernorError::Checkpoint(_) => FailureKind::Checkpoint,
        }
    }
}

/// Why a chunk did not produce a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Retryable errors outlasted the retry budget
    RetriesExhausted,
    NonRetryable,
    /// Token budget could not cover the chunk
    ResourceExhausted,
    CircuitOpen,
    Cancelled,
    /// The worker owning the chunk stopped early
    WorkerAborted,
    Checkpoint,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureKind::RetriesExhausted => "retries_exhausted",
            FailureKind::NonRetryable => "non_retryable",
            FailureKind::ResourceExhausted => "resource_exhausted",
            FailureKind::CircuitOpen => "circuit_open",
            FailureKind::Cancelled => "cancelled",
            FailureKind::WorkerAborted => "worker_aborted",
            FailureKind::Checkpoint => "checkpoint",
        };
        f.write_str(name)
    }
}
