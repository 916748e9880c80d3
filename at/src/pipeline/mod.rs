//! Content pipeline: extraction, normalization, scoring, validation

pub mod extract;
pub mod normalize;
pub mod quality;
pub mod validate;

pub use extract::html_to_text;
pub use normalize::{decode_bytes, fix_mojibake, normalize_text};
pub use quality::{QualitySignals, analyze, quality_score};
pub use validate::{Finding, Level, ValidationReport, Validator};

use sha2::{Digest, Sha256};

use crate::config::PipelineConfig;
use crate::domain::{ProcessedDocument, RawDocument};

pub const PROCESSOR_VERSION: &str = "pipeline/1.0.0";

/// Maximum summary length in characters
const SUMMARY_CHARS: usize = 240;
/// Keywords surfaced per document
const KEYWORD_COUNT: usize = 8;

/// SHA-256 hex over canonical content bytes
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Turns raw documents into processed ones
///
/// Deterministic: same raw content produces the same normalized content,
/// hash and scores.
pub struct Processor {
    inline_links: bool,
}

impl Processor {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            inline_links: config.inline_links,
        }
    }

    /// Extract, normalize and score one raw document
    pub fn process(&self, raw: &RawDocument) -> ProcessedDocument {
        let extracted = html_to_text(&raw.raw_content, self.inline_links);
        let content = normalize_text(&extracted);
        let title = normalize_text(&raw.title);

        let signals = analyze(&content);
        let hash = content_hash(&content);

        let mut doc = ProcessedDocument::new(&raw.id, title, content, hash, PROCESSOR_VERSION);
        doc.summary = summarize(&doc.content);
        doc.keywords = keywords(&doc.content);
        doc.quality_score = quality_score(&signals);
        doc.structured_content
            .insert("language".to_string(), serde_json::json!(signals.language));
        doc.structured_content
            .insert("length".to_string(), serde_json::json!(signals.length));
        doc
    }
}

/// Leading sentence(s) up to the summary budget
fn summarize(content: &str) -> Option<String> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return None;
    }
    let first_line = trimmed.lines().next().unwrap_or(trimmed);
    let summary: String = first_line.chars().take(SUMMARY_CHARS).collect();
    Some(summary)
}

/// Frequent longer tokens, most common first
fn keywords(content: &str) -> Vec<String> {
    let mut counts: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
    for token in content.split_whitespace() {
        let token: String = token
            .chars()
            .filter(|c| c.is_alphanumeric())
            .collect::<String>()
            .to_lowercase();
        if token.chars().count() >= 4 {
            *counts.entry(token).or_insert(0) += 1;
        }
    }

    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.into_iter().take(KEYWORD_COUNT).map(|(token, _)| token).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SourceType;

    fn raw(content: &str) -> RawDocument {
        RawDocument::new(
            "src",
            "https://example.com/a",
            SourceType::Rss,
            "A Title",
            content,
            "prehash",
            "rss/1",
        )
    }

    #[test]
    fn test_process_extracts_and_normalizes() {
        let processor = Processor::new(&PipelineConfig::default());
        let doc = processor.process(&raw("<p>Hello&nbsp;world from   the <b>pipeline</b></p>"));

        assert_eq!(doc.content, "Hello world from the pipeline");
        assert_eq!(doc.title, "A Title");
        assert_eq!(doc.processor_version, PROCESSOR_VERSION);
        assert!(doc.quality_score > 0.0);
    }

    #[test]
    fn test_process_is_deterministic() {
        let processor = Processor::new(&PipelineConfig::default());
        let input = raw("<p>Same input, same output.</p>");

        let a = processor.process(&input);
        let b = processor.process(&input);
        assert_eq!(a.content, b.content);
        assert_eq!(a.content_hash, b.content_hash);
        assert_eq!(a.quality_score, b.quality_score);
    }

    #[test]
    fn test_hash_over_normalized_content() {
        let processor = Processor::new(&PipelineConfig::default());
        // Differences that normalization erases produce the same hash
        let a = processor.process(&raw("<p>café society</p>"));
        let b = processor.process(&raw("<p>cafÃ© society</p>"));
        assert_eq!(a.content_hash, b.content_hash);
    }

    #[test]
    fn test_summary_and_keywords() {
        let processor = Processor::new(&PipelineConfig::default());
        let doc = processor.process(&raw(
            "<p>Deduplication pipeline deduplication scoring pipeline pipeline</p>",
        ));

        assert!(doc.summary.as_deref().unwrap().starts_with("Deduplication"));
        assert_eq!(doc.keywords[0], "pipeline");
    }

    #[test]
    fn test_structured_content_carries_signals() {
        let processor = Processor::new(&PipelineConfig::default());
        let doc = processor.process(&raw("<p>An ordinary English sentence for language detection purposes.</p>"));
        assert_eq!(doc.structured_content["language"], "en");
        assert!(doc.structured_content["length"].as_u64().unwrap() > 0);
    }

    #[test]
    fn test_content_hash_helper() {
        assert_eq!(content_hash("abc").len(), 64);
        assert_eq!(content_hash("abc"), content_hash("abc"));
        assert_ne!(content_hash("abc"), content_hash("abd"));
    }
}
