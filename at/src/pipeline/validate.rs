//! Document validation
//!
//! Rules produce leveled findings; a document is accepted iff nothing at
//! ERROR level fired. Custom rules are registered closures, pure
//! functions of the document pair.

use chrono::{Duration, Utc};

use crate::config::PipelineConfig;
use crate::domain::{ProcessedDocument, RawDocument, SourceType};

/// Severity of one finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    Error,
    Warning,
    Info,
}

/// One validation finding
#[derive(Debug, Clone, serde::Serialize)]
pub struct Finding {
    pub level: Level,
    pub code: &'static str,
    pub message: String,
}

impl Finding {
    pub fn error(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            level: Level::Error,
            code,
            message: message.into(),
        }
    }

    pub fn warning(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            level: Level::Warning,
            code,
            message: message.into(),
        }
    }

    pub fn info(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            level: Level::Info,
            code,
            message: message.into(),
        }
    }
}

/// Outcome of validating one document
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub findings: Vec<Finding>,
}

impl ValidationReport {
    /// Accepted iff no ERROR findings
    pub fn is_accepted(&self) -> bool {
        self.findings.iter().all(|f| f.level != Level::Error)
    }

    pub fn errors(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| f.level == Level::Error)
    }

    /// One-line summary for error records
    pub fn summary(&self) -> String {
        self.errors()
            .map(|f| f.code)
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// A registered custom rule
pub type Rule = Box<dyn Fn(&RawDocument, &ProcessedDocument) -> Option<Finding> + Send + Sync>;

/// Multi-level document validator
pub struct Validator {
    min_content_length: usize,
    max_content_length: usize,
    max_future: Duration,
    custom_rules: Vec<Rule>,
}

impl Validator {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            min_content_length: config.min_content_length,
            max_content_length: config.max_content_length,
            max_future: Duration::days(config.max_future_days),
            custom_rules: Vec::new(),
        }
    }

    /// Register an additional rule
    pub fn add_rule(&mut self, rule: Rule) {
        self.custom_rules.push(rule);
    }

    /// Run every rule against a document pair
    pub fn validate(&self, raw: &RawDocument, processed: &ProcessedDocument) -> ValidationReport {
        let mut findings = Vec::new();

        if processed.title.trim().is_empty() {
            findings.push(Finding::error("empty-title", "document title is empty"));
        }

        let length = processed.content.chars().count();
        if length < self.min_content_length {
            findings.push(Finding::error(
                "content-too-short",
                format!("content length {} below minimum {}", length, self.min_content_length),
            ));
        } else if length > self.max_content_length {
            findings.push(Finding::error(
                "content-too-long",
                format!("content length {} above maximum {}", length, self.max_content_length),
            ));
        }

        if url::Url::parse(&raw.source_url).is_err() {
            findings.push(Finding::error(
                "bad-url",
                format!("source url is not well-formed: {}", raw.source_url),
            ));
        }

        if let Some(published) = raw.published_at
            && published > Utc::now() + self.max_future
        {
            findings.push(Finding::error(
                "future-date",
                format!("published_at {} is in the far future", published),
            ));
        }

        // Required metadata per source type
        match raw.source_type {
            SourceType::Rss => {
                if raw.published_at.is_none() {
                    findings.push(Finding::warning("missing-date", "feed entry has no publish date"));
                }
                if !raw.raw_metadata.contains_key("feed_title") {
                    findings.push(Finding::info("missing-feed-title", "entry carries no feed title"));
                }
            }
            SourceType::Web => {
                if raw.author.is_none() {
                    findings.push(Finding::info("missing-author", "page has no author field"));
                }
            }
        }

        for rule in &self.custom_rules {
            if let Some(finding) = rule(raw, processed) {
                findings.push(finding);
            }
        }

        ValidationReport { findings }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> Validator {
        Validator::new(&PipelineConfig {
            inline_links: false,
            min_content_length: 10,
            max_content_length: 1000,
            max_future_days: 2,
        })
    }

    fn docs(title: &str, content: &str) -> (RawDocument, ProcessedDocument) {
        let mut raw = RawDocument::new(
            "src",
            "https://example.com/a",
            SourceType::Rss,
            title,
            content,
            "hash",
            "rss/1",
        );
        raw.published_at = Some(Utc::now());
        raw.raw_metadata
            .insert("feed_title".to_string(), serde_json::json!("Feed"));
        let processed = ProcessedDocument::new(&raw.id, title, content, "hash", "p/1");
        (raw, processed)
    }

    #[test]
    fn test_accepts_good_document() {
        let (raw, processed) = docs("Title", "A perfectly reasonable amount of content.");
        let report = validator().validate(&raw, &processed);
        assert!(report.is_accepted(), "findings: {:?}", report.findings);
    }

    #[test]
    fn test_rejects_empty_title() {
        let (raw, processed) = docs("   ", "A perfectly reasonable amount of content.");
        let report = validator().validate(&raw, &processed);
        assert!(!report.is_accepted());
        assert!(report.summary().contains("empty-title"));
    }

    #[test]
    fn test_rejects_short_and_long_content() {
        let (raw, processed) = docs("Title", "tiny");
        assert!(!validator().validate(&raw, &processed).is_accepted());

        let (raw, processed) = docs("Title", &"x".repeat(2000));
        let report = validator().validate(&raw, &processed);
        assert!(report.summary().contains("content-too-long"));
    }

    #[test]
    fn test_rejects_far_future_date() {
        let (mut raw, processed) = docs("Title", "A perfectly reasonable amount of content.");
        raw.published_at = Some(Utc::now() + Duration::days(30));
        let report = validator().validate(&raw, &processed);
        assert!(!report.is_accepted());
        assert!(report.summary().contains("future-date"));
    }

    #[test]
    fn test_near_future_date_allowed() {
        let (mut raw, processed) = docs("Title", "A perfectly reasonable amount of content.");
        raw.published_at = Some(Utc::now() + Duration::hours(12));
        assert!(validator().validate(&raw, &processed).is_accepted());
    }

    #[test]
    fn test_rejects_bad_url() {
        let (mut raw, processed) = docs("Title", "A perfectly reasonable amount of content.");
        raw.source_url = "definitely not a url".to_string();
        let report = validator().validate(&raw, &processed);
        assert!(report.summary().contains("bad-url"));
    }

    #[test]
    fn test_missing_rss_date_is_warning_not_error() {
        let (mut raw, processed) = docs("Title", "A perfectly reasonable amount of content.");
        raw.published_at = None;
        let report = validator().validate(&raw, &processed);
        // Warnings do not reject
        assert!(report.is_accepted());
        assert!(report.findings.iter().any(|f| f.code == "missing-date"));
    }

    #[test]
    fn test_custom_rule_runs() {
        let mut v = validator();
        v.add_rule(Box::new(|_, processed| {
            processed
                .content
                .contains("forbidden")
                .then(|| Finding::error("forbidden-word", "content contains a forbidden word"))
        }));

        let (raw, processed) = docs("Title", "this mentions the forbidden word somewhere");
        let report = v.validate(&raw, &processed);
        assert!(!report.is_accepted());
        assert!(report.summary().contains("forbidden-word"));
    }
}
