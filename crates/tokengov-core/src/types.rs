//! Shared data model for the Token Governor.
//!
//! These types cross the core/runtime boundary: the chunker produces
//! [`Chunk`]s, the runtime turns them into [`ChunkResult`]s, and the
//! reducers in [`crate::reduce`] consume ordered results.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Stable, order-preserving chunk identifier (position in the document).
pub type ChunkId = u64;

/// Options controlling how a document is split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkOptions {
    /// Target size of each chunk in estimated tokens
    #[serde(default = "default_target_tokens")]
    pub target_tokens: u32,

    /// Maximum tokens shared between adjacent chunks
    #[serde(default = "default_overlap_tokens")]
    pub overlap_tokens: u32,
}

fn default_target_tokens() -> u32 {
    2000
}

fn default_overlap_tokens() -> u32 {
    200
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self {
            target_tokens: default_target_tokens(),
            overlap_tokens: default_overlap_tokens(),
        }
    }
}

impl ChunkOptions {
    /// Create options with explicit target and overlap.
    pub fn new(target_tokens: u32, overlap_tokens: u32) -> Self {
        Self {
            target_tokens,
            overlap_tokens,
        }
    }
}

/// A bounded, ordered slice of a source document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Position of the chunk in the document (0-based)
    pub id: ChunkId,

    /// Exact text of the chunk (`document[start..end]`)
    pub text: String,

    /// Estimated token count of `text`
    pub token_count: u32,

    /// Byte offset of the first character in the source document
    pub start: usize,

    /// Byte offset one past the last character in the source document
    pub end: usize,

    /// Estimated tokens shared with the previous chunk
    #[serde(default)]
    pub overlap_tokens: u32,
}

impl Chunk {
    /// Build a chunk from free-standing text (offsets cover the text itself).
    pub fn from_text(id: ChunkId, text: impl Into<String>) -> Self {
        let text = text.into();
        let end = text.len();
        Self {
            id,
            token_count: crate::text::estimate_tokens(&text),
            text,
            start: 0,
            end,
            overlap_tokens: 0,
        }
    }

    /// SHA-256 of the chunk text, hex encoded.
    ///
    /// Checkpoint stores use this to detect a document that changed between
    /// a crashed run and its resume.
    pub fn content_hash(&self) -> String {
        content_hash(&self.text)
    }
}

/// SHA-256 of arbitrary text, hex encoded.
pub fn content_hash(text: &str) -> String {
    format!("{:x}", Sha256::digest(text.as_bytes()))
}

/// Priority class for token admission.
///
/// Higher classes get first claim on refilled tokens but never bypass the
/// bucket's rate ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Latency-critical work
    Realtime,

    /// User-facing work
    #[default]
    Interactive,

    /// Background batch work
    Batch,
}

impl Priority {
    /// All classes, highest first.
    pub const ALL: [Priority; 3] = [Priority::Realtime, Priority::Interactive, Priority::Batch];
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Priority::Realtime => "realtime",
            Priority::Interactive => "interactive",
            Priority::Batch => "batch",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "realtime" => Ok(Priority::Realtime),
            "interactive" => Ok(Priority::Interactive),
            "batch" => Ok(Priority::Batch),
            other => Err(format!("unknown priority class: {}", other)),
        }
    }
}

/// Processing status of a single chunk within a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl ChunkStatus {
    /// Whether this status ends processing for the current run.
    pub fn is_terminal(self) -> bool {
        matches!(self, ChunkStatus::Done | ChunkStatus::Failed)
    }
}

/// A chat message for LLM completion and conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Role: "system", "user", or "assistant"
    pub role: String,

    /// Message content
    pub content: String,
}

impl ChatMessage {
    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    /// Create an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }

    /// Estimated token cost of the message content.
    pub fn token_count(&self) -> u32 {
        crate::text::estimate_tokens(&self.content)
    }
}

/// Output of one successfully processed chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkResult<T> {
    /// Chunk this result belongs to
    pub chunk_id: ChunkId,

    /// Worker that processed the chunk
    pub worker_id: usize,

    /// Model the chunk was sent to
    pub model: String,

    /// Mapper output
    pub payload: T,

    /// Tokens produced by the backend
    pub output_tokens: u32,

    /// Wall-clock time spent in the mapper
    pub processing_time: Duration,
}
