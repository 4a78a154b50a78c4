//! Document chunker.
//!
//! Splits a document into contiguous, token-bounded chunks along sentence
//! and paragraph boundaries. Adjacent chunks share a bounded overlap so
//! downstream summarization keeps cross-boundary context.
//!
//! Chunk ids are positions in the document and are the only correlation key
//! used for resume, ordering and reduce-phase sorting.

use std::ops::Range;

use crate::text::{estimate_tokens, sentence_spans};
use crate::types::{Chunk, ChunkOptions};

/// Splits documents into overlapping chunks.
#[derive(Debug, Clone, Default)]
pub struct Chunker {
    options: ChunkOptions,
}

impl Chunker {
    /// Create a chunker with the given options.
    pub fn new(options: ChunkOptions) -> Self {
        Self { options }
    }

    /// Options this chunker splits with.
    pub fn options(&self) -> ChunkOptions {
        self.options
    }

    /// Split a document into ordered chunks.
    ///
    /// A sentence larger than `target_tokens` is emitted as a single
    /// oversized chunk instead of failing the split. Empty documents yield
    /// no chunks.
    pub fn split(&self, document: &str) -> Vec<Chunk> {
        let units = sentence_spans(document);
        let target = self.options.target_tokens.max(1);
        let overlap = self.options.overlap_tokens;

        let mut chunks = Vec::new();
        let mut carry: Vec<Range<usize>> = Vec::new();
        let mut next = 0;

        while next < units.len() {
            let mut members = std::mem::take(&mut carry);

            // Overlap gives way to new content
            while let Some(first) = members.first() {
                if tokens_between(document, first.start, units[next].end) <= target {
                    break;
                }
                members.remove(0);
            }
            let overlap_tokens = match (members.first(), members.last()) {
                (Some(first), Some(last)) => tokens_between(document, first.start, last.end),
                _ => 0,
            };

            // Every chunk takes at least one new unit, so the split terminates
            members.push(units[next].clone());
            next += 1;

            let start = members[0].start;
            while next < units.len() && tokens_between(document, start, units[next].end) <= target {
                members.push(units[next].clone());
                next += 1;
            }

            let end = members.last().map(|r| r.end).unwrap_or(start);
            let text = &document[start..end];

            chunks.push(Chunk {
                id: chunks.len() as u64,
                text: text.to_string(),
                token_count: estimate_tokens(text),
                start,
                end,
                overlap_tokens,
            });

            carry = trailing_overlap(document, &members, overlap);
        }

        tracing::debug!(
            chunks = chunks.len(),
            target_tokens = target,
            overlap_tokens = overlap,
            "Document split"
        );

        chunks
    }
}

/// Trailing units of a chunk whose combined size fits the overlap budget.
fn trailing_overlap(document: &str, members: &[Range<usize>], budget: u32) -> Vec<Range<usize>> {
    if budget == 0 {
        return Vec::new();
    }

    let end = match members.last() {
        Some(last) => last.end,
        None => return Vec::new(),
    };

    let mut keep = members.len();
    while keep > 0 && tokens_between(document, members[keep - 1].start, end) <= budget {
        keep -= 1;
    }

    members[keep..].to_vec()
}

fn tokens_between(document: &str, start: usize, end: usize) -> u32 {
    estimate_tokens(&document[start..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn split(doc: &str, target: u32, overlap: u32) -> Vec<Chunk> {
        Chunker::new(ChunkOptions::new(target, overlap)).split(doc)
    }

    #[test]
    fn test_empty_document() {
        assert!(split("", 100, 10).is_empty());
        assert!(split("  \n\n  ", 100, 10).is_empty());
    }

    #[test]
    fn test_small_document_is_one_chunk() {
        let doc = "One sentence. Another sentence.";
        let chunks = split(doc, 100, 10);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].id, 0);
        assert_eq!(chunks[0].text, doc);
        assert_eq!(chunks[0].overlap_tokens, 0);
    }

    #[test]
    fn test_ids_are_positions() {
        let doc = "Alpha beta gamma. Delta epsilon zeta. Eta theta iota. Kappa lambda mu.";
        let chunks = split(doc, 5, 0);
        assert!(chunks.len() > 1);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.id, i as u64);
            assert_eq!(chunk.text, &doc[chunk.start..chunk.end]);
        }
    }

    #[test]
    fn test_overlap_repeats_trailing_sentence() {
        // Each sentence is 4 tokens (16 chars)
        let doc = "aaaa bbbb cccc. dddd eeee ffff. gggg hhhh iiii. jjjj kkkk llll.";
        let chunks = split(doc, 9, 4);

        assert!(chunks.len() >= 2);
        let second = &chunks[1];
        assert!(second.start < chunks[0].end, "chunks should overlap");
        assert!(second.overlap_tokens > 0 && second.overlap_tokens <= 4);
        assert!(second.text.starts_with("dddd"));
    }

    #[test]
    fn test_oversized_sentence_is_emitted_whole() {
        let long = "word ".repeat(100);
        let doc = format!("Short one. {}end. Tail sentence.", long);
        let chunks = split(&doc, 10, 2);

        let oversized: Vec<&Chunk> = chunks.iter().filter(|c| c.token_count > 10).collect();
        assert_eq!(oversized.len(), 1);
        assert!(oversized[0].text.starts_with("word"));
        assert_eq!(oversized[0].overlap_tokens, 0);
    }

    #[test]
    fn test_paragraphs_are_boundaries() {
        let doc = "Title\n\nFirst paragraph sentence.";
        let chunks = split(doc, 3, 0);
        assert_eq!(chunks[0].text, "Title");
    }

    fn document() -> impl Strategy<Value = String> {
        let sentence = prop::collection::vec("[a-z]{1,10}", 1..25).prop_map(|w| w.join(" ") + ".");
        let separator = prop_oneof![Just(" "), Just("\n\n"), Just("  ")];
        prop::collection::vec((sentence, separator), 1..40).prop_map(|parts| {
            parts
                .into_iter()
                .map(|(s, sep)| s + sep)
                .collect::<String>()
        })
    }

    proptest! {
        #[test]
        fn prop_chunks_are_exact_ordered_slices(doc in document(), target in 5u32..120, overlap in 0u32..40) {
            let chunks = split(&doc, target, overlap);
            prop_assert!(!chunks.is_empty());

            for (i, chunk) in chunks.iter().enumerate() {
                prop_assert_eq!(chunk.id, i as u64);
                prop_assert_eq!(&chunk.text, &doc[chunk.start..chunk.end]);
            }
            for pair in chunks.windows(2) {
                prop_assert!(pair[1].start > pair[0].start);
                prop_assert!(pair[1].end > pair[0].end);
            }
        }

        #[test]
        fn prop_overlap_is_bounded(doc in document(), target in 5u32..120, overlap in 0u32..40) {
            let chunks = split(&doc, target, overlap);
            for pair in chunks.windows(2) {
                if pair[1].start < pair[0].end {
                    let shared = estimate_tokens(&doc[pair[1].start..pair[0].end]);
                    prop_assert!(shared <= overlap);
                }
            }
        }

        #[test]
        fn prop_only_single_sentences_exceed_target(doc in document(), target in 5u32..120) {
            for chunk in split(&doc, target, 0) {
                if chunk.token_count > target {
                    prop_assert_eq!(sentence_spans(&chunk.text).len(), 1);
                }
            }
        }

        #[test]
        fn prop_every_sentence_is_covered(doc in document(), target in 5u32..120, overlap in 0u32..40) {
            let chunks = split(&doc, target, overlap);
            for sentence in sentence_spans(&doc) {
                prop_assert!(chunks.iter().any(|c| c.start <= sentence.start && sentence.end <= c.end));
            }
        }
    }
}
