//! Text utilities: token estimation, sentence segmentation, term extraction.

pub mod patterns;

use std::ops::Range;

use patterns::{PARAGRAPH_BREAK, SENTENCE_END};

/// Minimum length (in characters) for a term to count toward relevance.
pub const MIN_TERM_CHARS: usize = 3;

/// Estimate the token count of a piece of text.
///
/// Uses the common ~4 characters per token heuristic. Non-empty text is
/// always at least one token.
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.chars().count();
    if chars == 0 {
        return 0;
    }
    u32::try_from(chars.div_ceil(4)).unwrap_or(u32::MAX)
}

/// Byte ranges of the sentences in `text`, in document order.
///
/// Paragraph breaks always end a sentence. Ranges are trimmed of surrounding
/// whitespace and never empty.
pub fn sentence_spans(text: &str) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let mut paragraph_start = 0;

    for brk in PARAGRAPH_BREAK.find_iter(text) {
        push_sentences(text, paragraph_start..brk.start(), &mut spans);
        paragraph_start = brk.end();
    }
    push_sentences(text, paragraph_start..text.len(), &mut spans);

    spans
}

fn push_sentences(text: &str, paragraph: Range<usize>, spans: &mut Vec<Range<usize>>) {
    let body = &text[paragraph.clone()];
    let mut cursor = 0;

    for end in SENTENCE_END.find_iter(body) {
        push_trimmed(text, paragraph.start + cursor..paragraph.start + end.end(), spans);
        cursor = end.end();
    }
    push_trimmed(text, paragraph.start + cursor..paragraph.end, spans);
}

fn push_trimmed(text: &str, range: Range<usize>, spans: &mut Vec<Range<usize>>) {
    let slice = &text[range.clone()];
    let trimmed = slice.trim();
    if trimmed.is_empty() {
        return;
    }
    let start = range.start + (slice.len() - slice.trim_start().len());
    spans.push(start..start + trimmed.len());
}

/// Relevance terms: case-folded, punctuation stripped, short tokens dropped.
pub fn terms(text: &str) -> Vec<String> {
    patterns::strip_punctuation(&text.to_lowercase())
        .split_whitespace()
        .filter(|t| t.chars().count() >= MIN_TERM_CHARS)
        .map(str::to_string)
        .collect()
}
