//! Collected document types
//!
//! A `RawDocument` is the immutable capture of one upstream item; a
//! `ProcessedDocument` is its normalized, scored, dedup-annotated
//! counterpart. Raw content and content hashes never change after the
//! document is stored.

use chrono::{DateTime, Utc};
use docstore::{IndexValue, Record};
use serde::{Deserialize, Serialize};

use super::SourceType;
use super::id::new_id;

/// Processing lifecycle of a raw document
///
/// Advances monotonically: pending -> processing -> (processed | failed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    #[default]
    Pending,
    Processing,
    Processed,
    Failed,
}

impl ProcessingStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Processed | Self::Failed)
    }

    /// Whether `next` is a legal forward step from this status
    pub fn can_advance_to(&self, next: ProcessingStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing)
                | (Self::Processing, Self::Processed)
                | (Self::Processing, Self::Failed)
        )
    }
}

impl std::fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Processing => write!(f, "processing"),
            Self::Processed => write!(f, "processed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Immutable capture of one upstream item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawDocument {
    /// Stable id (UUIDv7)
    pub id: String,
    /// Name of the source that produced this document
    pub source_id: String,
    /// URL the item points at (entry link or page URL)
    pub source_url: String,
    pub source_type: SourceType,
    pub collected_at: DateTime<Utc>,
    /// Version tag of the adapter that produced this document
    pub collector_version: String,
    /// Captured content, immutable once stored
    pub raw_content: String,
    /// Opaque adapter-specific metadata
    #[serde(default)]
    pub raw_metadata: serde_json::Map<String, serde_json::Value>,
    /// SHA-256 hex of the canonical content, computed once
    pub content_hash: String,
    pub title: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub processing_status: ProcessingStatus,
    #[serde(default)]
    pub processing_attempts: u32,
    #[serde(default)]
    pub processing_error: Option<String>,
}

impl RawDocument {
    /// Create a pending raw document
    pub fn new(
        source_id: impl Into<String>,
        source_url: impl Into<String>,
        source_type: SourceType,
        title: impl Into<String>,
        raw_content: impl Into<String>,
        content_hash: impl Into<String>,
        collector_version: impl Into<String>,
    ) -> Self {
        Self {
            id: new_id(),
            source_id: source_id.into(),
            source_url: source_url.into(),
            source_type,
            collected_at: Utc::now(),
            collector_version: collector_version.into(),
            raw_content: raw_content.into(),
            raw_metadata: serde_json::Map::new(),
            content_hash: content_hash.into(),
            title: title.into(),
            author: None,
            published_at: None,
            language: None,
            processing_status: ProcessingStatus::Pending,
            processing_attempts: 0,
            processing_error: None,
        }
    }

    /// Advance processing status; illegal transitions are rejected
    pub fn advance_status(&mut self, next: ProcessingStatus) -> Result<(), String> {
        if !self.processing_status.can_advance_to(next) {
            return Err(format!(
                "illegal status transition {} -> {}",
                self.processing_status, next
            ));
        }
        if next == ProcessingStatus::Processing {
            self.processing_attempts += 1;
        }
        self.processing_status = next;
        Ok(())
    }

    /// Mark processing failed with a reason
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.processing_error = Some(reason.into());
        self.processing_status = ProcessingStatus::Failed;
    }
}

impl Record for RawDocument {
    const COLLECTION: &'static str = "raw_documents";

    fn id(&self) -> &str {
        &self.id
    }

    fn index_values(&self) -> Vec<(String, IndexValue)> {
        vec![
            ("source_id".to_string(), IndexValue::String(self.source_id.clone())),
            ("content_hash".to_string(), IndexValue::String(self.content_hash.clone())),
            (
                "collected_at".to_string(),
                IndexValue::Int(self.collected_at.timestamp()),
            ),
            (
                "status".to_string(),
                IndexValue::String(self.processing_status.to_string()),
            ),
        ]
    }
}

/// Normalized, scored output of the content pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedDocument {
    pub id: String,
    /// The raw document this was derived from (1:1)
    pub raw_document_id: String,
    /// Never empty for an accepted document
    pub title: String,
    #[serde(default)]
    pub summary: Option<String>,
    /// Canonical normalized content
    pub content: String,
    #[serde(default)]
    pub structured_content: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    pub processed_at: DateTime<Utc>,
    pub processor_version: String,
    /// SHA-256 hex of `content`
    pub content_hash: String,
    #[serde(default)]
    pub similarity_group_id: Option<String>,
    #[serde(default)]
    pub similarity_score: f64,
    #[serde(default)]
    pub is_duplicate: bool,
    /// 0..100
    #[serde(default)]
    pub quality_score: f64,
    /// 0..1
    #[serde(default)]
    pub relevance_score: f64,
    /// Set when dedup ran without the semantic path (circuit open)
    #[serde(default)]
    pub dedup_degraded: bool,
}

impl ProcessedDocument {
    pub fn new(
        raw_document_id: impl Into<String>,
        title: impl Into<String>,
        content: impl Into<String>,
        content_hash: impl Into<String>,
        processor_version: impl Into<String>,
    ) -> Self {
        Self {
            id: new_id(),
            raw_document_id: raw_document_id.into(),
            title: title.into(),
            summary: None,
            content: content.into(),
            structured_content: serde_json::Map::new(),
            entities: Vec::new(),
            keywords: Vec::new(),
            categories: Vec::new(),
            processed_at: Utc::now(),
            processor_version: processor_version.into(),
            content_hash: content_hash.into(),
            similarity_group_id: None,
            similarity_score: 0.0,
            is_duplicate: false,
            quality_score: 0.0,
            relevance_score: 0.0,
            dedup_degraded: false,
        }
    }

    /// Mark this document a duplicate of an existing similarity group
    ///
    /// Upholds: is_duplicate implies a group id and a score.
    pub fn mark_duplicate(&mut self, group_id: impl Into<String>, score: f64) {
        self.similarity_group_id = Some(group_id.into());
        self.similarity_score = score;
        self.is_duplicate = true;
    }

    /// Start a fresh similarity group rooted at this document
    pub fn start_group(&mut self, group_id: impl Into<String>) {
        self.similarity_group_id = Some(group_id.into());
        self.is_duplicate = false;
    }
}

impl Record for ProcessedDocument {
    const COLLECTION: &'static str = "processed_documents";

    fn id(&self) -> &str {
        &self.id
    }

    fn index_values(&self) -> Vec<(String, IndexValue)> {
        let mut values = vec![
            (
                "raw_document_id".to_string(),
                IndexValue::String(self.raw_document_id.clone()),
            ),
            ("content_hash".to_string(), IndexValue::String(self.content_hash.clone())),
            ("is_duplicate".to_string(), IndexValue::Bool(self.is_duplicate)),
        ];
        if let Some(group) = &self.similarity_group_id {
            values.push(("group_id".to_string(), IndexValue::String(group.clone())));
        }
        values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw() -> RawDocument {
        RawDocument::new(
            "example",
            "https://example.com/a",
            SourceType::Rss,
            "Title",
            "content",
            "abc123",
            "rss/1",
        )
    }

    #[test]
    fn test_status_advances_monotonically() {
        let mut doc = raw();
        assert_eq!(doc.processing_status, ProcessingStatus::Pending);

        doc.advance_status(ProcessingStatus::Processing).unwrap();
        assert_eq!(doc.processing_attempts, 1);

        doc.advance_status(ProcessingStatus::Processed).unwrap();
        assert!(doc.processing_status.is_terminal());
    }

    #[test]
    fn test_status_rejects_backwards_transition() {
        let mut doc = raw();
        doc.advance_status(ProcessingStatus::Processing).unwrap();
        doc.advance_status(ProcessingStatus::Processed).unwrap();

        assert!(doc.advance_status(ProcessingStatus::Pending).is_err());
        assert!(doc.advance_status(ProcessingStatus::Processing).is_err());
    }

    #[test]
    fn test_status_rejects_skip() {
        let mut doc = raw();
        // pending -> processed without processing is illegal
        assert!(doc.advance_status(ProcessingStatus::Processed).is_err());
    }

    #[test]
    fn test_mark_duplicate_sets_group() {
        let mut doc = ProcessedDocument::new("raw-1", "Title", "content", "hash", "pipeline/1");
        doc.mark_duplicate("group-1", 0.95);

        assert!(doc.is_duplicate);
        assert_eq!(doc.similarity_group_id.as_deref(), Some("group-1"));
        assert!(doc.similarity_score >= 0.95);
    }

    #[test]
    fn test_record_index_values() {
        let doc = raw();
        let values = doc.index_values();
        assert!(values.iter().any(|(k, _)| k == "source_id"));
        assert!(values.iter().any(|(k, _)| k == "content_hash"));
    }

    #[test]
    fn test_serde_roundtrip() {
        let mut doc = raw();
        doc.raw_metadata
            .insert("feed_title".to_string(), serde_json::json!("Example Feed"));

        let json = serde_json::to_string(&doc).unwrap();
        let back: RawDocument = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, doc.id);
        assert_eq!(back.raw_metadata["feed_title"], "Example Feed");
    }
}
