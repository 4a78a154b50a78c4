//! Shared segmentation patterns.
//!
//! The chunker and the compressor both segment text; keeping the patterns in
//! one place means a chunk boundary and a relevance term are always derived
//! from the same definition of "sentence" and "word".

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    // =========================================================================
    // STRUCTURAL BOUNDARIES
    // =========================================================================

    /// Blank line between paragraphs (tolerates trailing spaces and CRLF)
    pub static ref PARAGRAPH_BREAK: Regex = Regex::new(
        r"\r?\n[ \t]*\r?\n\s*"
    ).unwrap();

    /// Sentence terminator followed by whitespace.
    /// Closing quotes and brackets stay with the sentence they end.
    pub static ref SENTENCE_END: Regex = Regex::new(
        r#"[.!?]+["'\)\]”’]*\s+"#
    ).unwrap();

    // =========================================================================
    // TERM EXTRACTION
    // =========================================================================

    /// Anything that is not a letter, digit or whitespace
    pub static ref PUNCTUATION: Regex = Regex::new(
        r"[^\p{L}\p{N}\s]+"
    ).unwrap();
}

/// Replace punctuation with spaces.
pub fn strip_punctuation(text: &str) -> String {
    PUNCTUATION.replace_all(text, " ").into_owned()
}
