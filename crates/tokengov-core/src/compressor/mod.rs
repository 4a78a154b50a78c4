//! Query-driven context compression.
//!
//! The compressor scores chunks against a query, keeps the relevant ones
//! that fit a token budget, and hands them back in document order. The
//! [`MemoryManager`] then fits a system prompt, the selected knowledge and
//! the conversation history into a model's context window.

mod memory;
mod similarity;

pub use memory::{ContextBudget, FitReport, MemoryManager};
pub use similarity::{cosine_similarity, TermVector};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::CompressorConfig;
use crate::types::Chunk;

/// Errors from context assembly.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompressError {
    #[error("Fixed context needs {required} tokens but only {available} are available")]
    BudgetExceeded { required: u32, available: u32 },
}

/// A selected chunk and its relevance score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f64,
}

/// Summary of one compression pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompressionMetrics {
    /// Chunks offered to the compressor
    pub candidates: usize,

    /// Chunks scoring at or above the threshold
    pub relevant: usize,

    /// Chunks returned
    pub selected: usize,

    /// Tokens across all candidates
    pub original_tokens: u32,

    /// Tokens across the selection
    pub selected_tokens: u32,

    /// `selected_tokens / original_tokens` (0 when there was nothing to compress)
    pub compression_ratio: f64,

    /// Mean score of the selection (0 when empty)
    pub mean_score: f64,
}

impl CompressionMetrics {
    /// Tokens removed by compression.
    pub fn token_savings(&self) -> u32 {
        self.original_tokens.saturating_sub(self.selected_tokens)
    }
}

/// Result of a compression pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Compression {
    /// Selected chunks in document order
    pub selected: Vec<ScoredChunk>,

    pub metrics: CompressionMetrics,
}

impl Compression {
    /// Whether nothing was selected.
    pub fn is_empty(&self) -> bool {
        self.selected.is_empty()
    }

    /// Selected chunks in document order.
    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.selected.iter().map(|s| &s.chunk)
    }

    /// Tokens used by the selection.
    pub fn total_tokens(&self) -> u32 {
        self.metrics.selected_tokens
    }

    /// Join the selected chunk texts with `separator`.
    pub fn render(&self, separator: &str) -> String {
        self.chunks()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join(separator)
    }
}

/// Selects the chunks most relevant to a query within a token budget.
#[derive(Debug, Clone, Default)]
pub struct ContextCompressor {
    config: CompressorConfig,
}

impl ContextCompressor {
    pub fn new(config: CompressorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CompressorConfig {
        &self.config
    }

    /// Select chunks relevant to `query` whose total fits `max_tokens`.
    ///
    /// Chunks below the similarity threshold are never selected. Relevant
    /// chunks are admitted best-first; one that would overflow the budget is
    /// skipped and smaller, lower-ranked chunks may still be admitted. At
    /// most `top_k` chunks are returned, re-sorted into document order. An
    /// empty selection is a valid result.
    pub fn compress(&self, query: &str, chunks: &[Chunk], max_tokens: u32) -> Compression {
        let query_vector = TermVector::from_text(query);

        let mut ranked: Vec<(usize, f64)> = chunks
            .iter()
            .enumerate()
            .map(|(i, c)| (i, query_vector.cosine(&TermVector::from_text(&c.text))))
            .filter(|(_, score)| *score >= self.config.similarity_threshold && *score > 0.0)
            .collect();
        let relevant = ranked.len();

        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });

        let mut admitted: Vec<(usize, f64)> = Vec::new();
        let mut used: u32 = 0;
        for (index, score) in ranked {
            if admitted.len() >= self.config.top_k {
                break;
            }
            let cost = chunks[index].token_count;
            match used.checked_add(cost) {
                Some(total) if total <= max_tokens => {
                    used = total;
                    admitted.push((index, score));
                }
                _ => continue,
            }
        }

        admitted.sort_by_key(|(index, _)| *index);

        let selected: Vec<ScoredChunk> = admitted
            .into_iter()
            .map(|(index, score)| ScoredChunk {
                chunk: chunks[index].clone(),
                score,
            })
            .collect();

        let original_tokens: u32 = chunks.iter().map(|c| c.token_count).sum();
        let mean_score = if selected.is_empty() {
            0.0
        } else {
            selected.iter().map(|s| s.score).sum::<f64>() / selected.len() as f64
        };
        let compression_ratio = if original_tokens == 0 {
            0.0
        } else {
            f64::from(used) / f64::from(original_tokens)
        };

        let metrics = CompressionMetrics {
            candidates: chunks.len(),
            relevant,
            selected: selected.len(),
            original_tokens,
            selected_tokens: used,
            compression_ratio,
            mean_score,
        };

        tracing::debug!(
            candidates = metrics.candidates,
            relevant = metrics.relevant,
            selected = metrics.selected,
            selected_tokens = metrics.selected_tokens,
            max_tokens,
            "Context compressed"
        );

        Compression { selected, metrics }
    }
}
