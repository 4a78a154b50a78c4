//! Progress events and cooperative cancellation.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokengov_core::ChunkId;
use tokio::sync::watch;

use super::summary::RunStatus;
use crate::error::FailureKind;

/// Emitted on the runner's progress channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    JobStarted {
        job_id: String,
        total_chunks: usize,
        pending_chunks: usize,
        resumed_chunks: usize,
    },
    ChunkProcessed {
        job_id: String,
        chunk_id: ChunkId,
        worker_id: usize,
        model: String,
        output_tokens: u32,
        processing_time_ms: u64,
    },
    ChunkFailed {
        job_id: String,
        chunk_id: ChunkId,
        worker_id: usize,
        kind: FailureKind,
        message: String,
    },
    JobFinished {
        job_id: String,
        status: RunStatus,
        processed: usize,
        failed: usize,
    },
}

/// Requests cancellation of a running job.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Observes cancellation requests.
#[derive(Debug, Clone)]
pub struct Cancellation {
    rx: watch::Receiver<bool>,
}

impl Cancellation {
    /// A cancellation that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation is requested.
    ///
    /// Pends forever if every handle is dropped without cancelling.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::never()
    }
}

/// Create a linked handle and observer.
pub fn cancellation() -> (CancelHandle, Cancellation) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx: Arc::new(tx) }, Cancellation { rx })
}
