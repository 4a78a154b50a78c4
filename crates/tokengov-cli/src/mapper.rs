//! Offline extractive summarizer used by `tokengov run`.

use async_trait::async_trait;
use tokengov_core::compressor::cosine_similarity;
use tokengov_core::text::sentence_spans;
use tokengov_core::{estimate_tokens, Chunk};
use tokengov_runtime::{ChunkMapper, MapContext, MapError, MapOutput};

/// Keeps a few sentences of every chunk.
///
/// Without a focus the leading sentences are kept. With one, the sentences
/// most similar to it are kept in their original order.
#[derive(Debug, Clone)]
pub struct ExtractiveMapper {
    sentences: usize,
    focus: Option<String>,
}

impl ExtractiveMapper {
    pub fn new(sentences: usize) -> Self {
        Self {
            sentences: sentences.max(1),
            focus: None,
        }
    }

    pub fn with_focus(mut self, focus: Option<String>) -> Self {
        self.focus = focus.filter(|f| !f.trim().is_empty());
        self
    }

    pub fn extract(&self, text: &str) -> String {
        let sentences: Vec<&str> = sentence_spans(text).into_iter().map(|r| &text[r]).collect();

        let mut keep: Vec<usize> = match &self.focus {
            None => (0..sentences.len()).take(self.sentences).collect(),
            Some(focus) => {
                let mut scored: Vec<(usize, f64)> = sentences
                    .iter()
                    .enumerate()
                    .map(|(i, s)| (i, cosine_similarity(s, focus)))
                    .collect();
                scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
                scored.into_iter().take(self.sentences).map(|(i, _)| i).collect()
            }
        };
        keep.sort_unstable();

        keep.into_iter()
            .map(|i| sentences[i])
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[async_trait]
impl ChunkMapper<String> for ExtractiveMapper {
    async fn map(&self, chunk: Chunk, _ctx: MapContext) -> Result<MapOutput<String>, MapError> {
        let summary = self.extract(&chunk.text);
        let tokens = estimate_tokens(&summary);
        Ok(MapOutput::new(summary).with_output_tokens(tokens))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEXT: &str = "Rate limits protect the API. Cats sleep a lot. \
                        Token buckets refill continuously. Dogs bark.";

    #[test]
    fn test_leading_sentences() {
        let mapper = ExtractiveMapper::new(2);
        assert_eq!(mapper.extract(TEXT), "Rate limits protect the API. Cats sleep a lot.");
    }

    #[test]
    fn test_focus_keeps_relevant_sentences_in_order() {
        let mapper = ExtractiveMapper::new(2).with_focus(Some("token rate limits bucket".into()));
        assert_eq!(
            mapper.extract(TEXT),
            "Rate limits protect the API. Token buckets refill continuously."
        );
    }

    #[test]
    fn test_blank_focus_is_ignored() {
        let mapper = ExtractiveMapper::new(1).with_focus(Some("  ".into()));
        assert_eq!(mapper.extract(TEXT), "Rate limits protect the API.");
    }

    #[tokio::test]
    async fn test_map_reports_output_tokens() {
        let mapper = ExtractiveMapper::new(1);
        let ctx = MapContext {
            job_id: "job".into(),
            model: "m".into(),
            worker_id: 0,
            attempt: 1,
        };
        let output = mapper.map(Chunk::from_text(0, TEXT), ctx).await.unwrap();
        assert_eq!(output.payload, "Rate limits protect the API.");
        assert_eq!(output.output_tokens, Some(estimate_tokens("Rate limits protect the API.")));
    }
}
