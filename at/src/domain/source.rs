//! Source configuration
//!
//! A source describes one upstream location (feed or page) the collector
//! engine visits. Loaded from the sources YAML file at startup and
//! treated as read-only by every component for the duration of a run.

use std::collections::HashMap;

use docstore::{IndexValue, Record};
use serde::{Deserialize, Serialize};

/// Kind of upstream a source points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Rss,
    Web,
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rss => write!(f, "rss"),
            Self::Web => write!(f, "web"),
        }
    }
}

impl std::str::FromStr for SourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "rss" => Ok(Self::Rss),
            "web" => Ok(Self::Web),
            _ => Err(format!("Unknown source type: {}", s)),
        }
    }
}

/// Minimum allowed collection interval
pub const MIN_INTERVAL_SECS: u64 = 60;

fn default_enabled() -> bool {
    true
}

fn default_interval() -> u64 {
    3600
}

fn default_max_items() -> usize {
    50
}

fn default_retry_count() -> u32 {
    3
}

fn default_timeout() -> u64 {
    30
}

/// One configured upstream source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Unique source name, used as the foreign key on collected documents
    pub name: String,

    /// Source kind
    #[serde(rename = "type")]
    pub source_type: SourceType,

    /// Feed or page URL
    pub url: String,

    /// Whether the scheduler visits this source
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Seconds between collection runs
    #[serde(default = "default_interval")]
    pub interval: u64,

    /// Ordered tags attached to every document from this source
    #[serde(default)]
    pub tags: Vec<String>,

    /// Free-form category label
    #[serde(default)]
    pub category: Option<String>,

    /// Per-field CSS selector chains, first non-empty match wins (web only)
    #[serde(default)]
    pub selectors: HashMap<String, Vec<String>>,

    /// User-agent registry key or literal string
    #[serde(default)]
    pub user_agent: Option<String>,

    /// Cap on documents produced per run
    #[serde(default = "default_max_items")]
    pub max_items_per_run: usize,

    /// Retry budget stamped onto this source's collection tasks
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,

    /// Per-fetch timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

impl SourceConfig {
    /// Validate invariants the loader must enforce
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("source name must not be empty".to_string());
        }
        if self.url.trim().is_empty() {
            return Err(format!("source '{}' has an empty url", self.name));
        }
        if url::Url::parse(&self.url).is_err() {
            return Err(format!("source '{}' has an invalid url: {}", self.name, self.url));
        }
        if self.interval < MIN_INTERVAL_SECS {
            return Err(format!(
                "source '{}' interval {}s is below the {}s minimum",
                self.name, self.interval, MIN_INTERVAL_SECS
            ));
        }
        Ok(())
    }

    /// Domain component of the source URL, for rate-limit bucketing
    pub fn domain(&self) -> Option<String> {
        url::Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
    }
}

impl Record for SourceConfig {
    const COLLECTION: &'static str = "sources";
    const KEY_FIELD: &'static str = "name";

    fn id(&self) -> &str {
        &self.name
    }

    fn index_values(&self) -> Vec<(String, IndexValue)> {
        vec![
            ("type".to_string(), IndexValue::String(self.source_type.to_string())),
            ("enabled".to_string(), IndexValue::Bool(self.enabled)),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_source() -> SourceConfig {
        SourceConfig {
            name: "example".to_string(),
            source_type: SourceType::Rss,
            url: "https://example.com/feed.xml".to_string(),
            enabled: true,
            interval: 3600,
            tags: vec![],
            category: None,
            selectors: HashMap::new(),
            user_agent: None,
            max_items_per_run: 50,
            retry_count: 3,
            timeout: 30,
        }
    }

    #[test]
    fn test_validate_ok() {
        assert!(base_source().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_short_interval() {
        let mut source = base_source();
        source.interval = 30;
        let err = source.validate().unwrap_err();
        assert!(err.contains("below"));
    }

    #[test]
    fn test_validate_rejects_bad_url() {
        let mut source = base_source();
        source.url = "not a url".to_string();
        assert!(source.validate().is_err());
    }

    #[test]
    fn test_domain_extraction() {
        assert_eq!(base_source().domain(), Some("example.com".to_string()));
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let yaml = r#"
name: hn
type: rss
url: https://news.ycombinator.com/rss
"#;
        let source: SourceConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(source.enabled);
        assert_eq!(source.interval, 3600);
        assert_eq!(source.max_items_per_run, 50);
        assert_eq!(source.retry_count, 3);
        assert_eq!(source.timeout, 30);
    }

    #[test]
    fn test_deserialize_web_source_with_selectors() {
        let yaml = r#"
name: blog
type: web
url: https://example.com/blog
selectors:
  title: ["h1.post-title", "h1"]
  content: ["article .body", "article"]
"#;
        let source: SourceConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(source.source_type, SourceType::Web);
        assert_eq!(source.selectors["title"].len(), 2);
    }

    #[test]
    fn test_source_type_display_parse() {
        assert_eq!(SourceType::Rss.to_string(), "rss");
        assert_eq!("web".parse::<SourceType>().unwrap(), SourceType::Web);
        assert!("ftp".parse::<SourceType>().is_err());
    }
}
