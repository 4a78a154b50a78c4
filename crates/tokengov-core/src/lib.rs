//! # tokengov-core
//!
//! Deterministic building blocks of the Token Governor.
//!
//! This crate holds everything that needs neither a clock nor a runtime:
//! - **Chunking**: token-bounded, overlapping document segments
//! - **Compression**: query-relevant chunk selection under a token budget
//! - **Memory**: conversation history trimmed to a context window
//! - **Configuration**: schema-validated YAML/JSON settings
//! - **Reducers**: combining ordered chunk results
//!
//! Admission control, fault isolation and job execution live in
//! `tokengov-runtime`.
//!
//! ## Example
//!
//! ```rust,ignore
//! use tokengov_core::{ChunkOptions, ContextCompressor, split};
//!
//! let chunks = split(&document, ChunkOptions::new(1500, 150));
//! let compression = ContextCompressor::default().compress("rate limits", &chunks, 4000);
//! println!("kept {} of {} chunks", compression.metrics.selected, chunks.len());
//! ```

pub mod chunker;
pub mod compressor;
pub mod config;
pub mod reduce;
pub mod text;
pub mod types;

// Re-export main types at crate root
pub use chunker::Chunker;
pub use compressor::{
    CompressError, Compression, CompressionMetrics, ContextBudget, ContextCompressor, FitReport,
    MemoryManager, ScoredChunk,
};
pub use config::{
    BreakerConfig, BucketConfig, CheckpointConfig, CompressorConfig, ConfigError,
    GovernorConfig, HealthConfig, ModelConfig, RetryConfig, RunnerConfig,
};
pub use reduce::{concatenate_sections, majority_vote, Consensus};
pub use text::estimate_tokens;
pub use types::{
    content_hash, ChatMessage, Chunk, ChunkId, ChunkOptions, ChunkResult, ChunkStatus, Priority,
};

/// Split a document into chunks with the given options.
///
/// Convenience wrapper around [`Chunker::split`].
pub fn split(document: &str, options: ChunkOptions) -> Vec<Chunk> {
    Chunker::new(options).split(document)
}
