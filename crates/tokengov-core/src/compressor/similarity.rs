//! Bag-of-words cosine similarity.

use std::collections::HashMap;

use crate::text::terms;

/// Term-frequency vector of a piece of text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TermVector {
    counts: HashMap<String, f64>,
    norm: f64,
}

impl TermVector {
    /// Build the vector from text using the shared term rules.
    pub fn from_text(text: &str) -> Self {
        let mut counts: HashMap<String, f64> = HashMap::new();
        for term in terms(text) {
            *counts.entry(term).or_insert(0.0) += 1.0;
        }
        let norm = counts.values().map(|c| c * c).sum::<f64>().sqrt();
        Self { counts, norm }
    }

    /// Whether the text contributed no terms.
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Number of distinct terms.
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    /// Cosine similarity in `[0, 1]`. Empty vectors are dissimilar to everything.
    pub fn cosine(&self, other: &TermVector) -> f64 {
        if self.norm == 0.0 || other.norm == 0.0 {
            return 0.0;
        }

        let (small, large) = if self.counts.len() <= other.counts.len() {
            (&self.counts, &other.counts)
        } else {
            (&other.counts, &self.counts)
        };

        let dot: f64 = small
            .iter()
            .filter_map(|(term, a)| large.get(term).map(|b| a * b))
            .sum();

        (dot / (self.norm * other.norm)).clamp(0.0, 1.0)
    }
}

/// Cosine similarity between two texts.
pub fn cosine_similarity(a: &str, b: &str) -> f64 {
    TermVector::from_text(a).cosine(&TermVector::from_text(b))
}
