//! Built-in reducers for ordered chunk results.
//!
//! Reducers receive results sorted by chunk id. They are plain functions so
//! a job can pass them directly, or wrap them in a closure to add
//! parameters.

use serde::{Deserialize, Serialize};

use crate::types::{ChunkId, ChunkResult};

/// Join string payloads in chunk order, skipping blank ones.
pub fn concatenate_sections<T: AsRef<str>>(results: &[ChunkResult<T>], separator: &str) -> String {
    results
        .iter()
        .map(|r| r.payload.as_ref().trim())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(separator)
}

/// Winning payload for one chunk across several results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Consensus<T> {
    pub chunk_id: ChunkId,

    /// Most common payload (first seen wins ties)
    pub payload: T,

    /// Results that agreed with the winner
    pub votes: usize,

    /// Results considered for this chunk
    pub total: usize,
}

impl<T> Consensus<T> {
    /// Fraction of results agreeing with the winner.
    pub fn agreement(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.votes as f64 / self.total as f64
        }
    }

    /// Whether a strict majority agreed.
    pub fn is_majority(&self) -> bool {
        self.votes * 2 > self.total
    }
}

/// Pick the most common payload per chunk id.
///
/// Useful when the same chunks were mapped by several models or runs.
/// Output is ordered by chunk id.
pub fn majority_vote<T: PartialEq + Clone>(results: &[ChunkResult<T>]) -> Vec<Consensus<T>> {
    let mut ids: Vec<ChunkId> = results.iter().map(|r| r.chunk_id).collect();
    ids.sort_unstable();
    ids.dedup();

    ids.into_iter()
        .filter_map(|chunk_id| {
            // Candidate payloads with vote counts, in first-seen order
            let mut tally: Vec<(&T, usize)> = Vec::new();
            let mut total = 0;
            for result in results.iter().filter(|r| r.chunk_id == chunk_id) {
                total += 1;
                match tally.iter_mut().find(|(p, _)| **p == result.payload) {
                    Some((_, votes)) => *votes += 1,
                    None => tally.push((&result.payload, 1)),
                }
            }

            let mut winner: Option<(&T, usize)> = None;
            for (payload, votes) in tally {
                if winner.map_or(true, |(_, best)| votes > best) {
                    winner = Some((payload, votes));
                }
            }

            winner.map(|(payload, votes)| Consensus {
                chunk_id,
                payload: payload.clone(),
                votes,
                total,
            })
        })
        .collect()
}
