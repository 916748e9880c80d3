//! Source collectors
//!
//! Each adapter turns one configured source into a list of raw
//! documents. Adapters are values behind a small trait; a registry maps
//! the source type to the implementation. Fetching goes through the
//! shared HTTP client with admission from the per-domain rate limiter.

mod datetime;
pub mod rss;
pub mod web;

pub use datetime::parse_datetime;
pub use rss::RssCollector;
pub use web::WebCollector;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::{RawDocument, SourceConfig, SourceType};
use crate::http::{HttpClient, HttpError, Method, Response};
use crate::ratelimit::{RateLimitError, RateLimiter};

/// What went wrong collecting one source
#[derive(Debug, Error)]
pub enum CollectorErrorKind {
    #[error(transparent)]
    Http(#[from] HttpError),

    #[error(transparent)]
    RateLimit(#[from] RateLimitError),

    #[error("upstream returned status {0}")]
    Status(u16),

    #[error("parse failure: {0}")]
    Parse(String),

    #[error("no collector registered for source type {0}")]
    Unsupported(SourceType),
}

/// Collection failure carrying the source it belongs to
#[derive(Debug, Error)]
#[error("collector failed for source '{source_id}': {kind}")]
pub struct CollectorError {
    pub source_id: String,
    #[source]
    pub kind: CollectorErrorKind,
}

impl CollectorError {
    pub fn new(source_id: impl Into<String>, kind: impl Into<CollectorErrorKind>) -> Self {
        Self {
            source_id: source_id.into(),
            kind: kind.into(),
        }
    }
}

/// Named user-agent strings sources can refer to
#[derive(Debug, Clone)]
pub struct UserAgentRegistry {
    agents: HashMap<String, String>,
    default: String,
}

impl UserAgentRegistry {
    pub fn new(default: impl Into<String>) -> Self {
        let mut agents = HashMap::new();
        agents.insert(
            "desktop".to_string(),
            "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0".to_string(),
        );
        agents.insert(
            "mobile".to_string(),
            "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) AppleWebKit/605.1.15".to_string(),
        );
        agents.insert("feed-reader".to_string(), "atlas-feed-reader/0.1".to_string());
        Self {
            agents,
            default: default.into(),
        }
    }

    pub fn register(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.agents.insert(key.into(), value.into());
    }

    /// Resolve a registry key; unknown keys pass through as literals
    pub fn resolve<'a>(&'a self, key: Option<&'a str>) -> &'a str {
        match key {
            Some(k) => self.agents.get(k).map(String::as_str).unwrap_or(k),
            None => &self.default,
        }
    }
}

/// Shared helpers handed to every adapter by value
#[derive(Clone)]
pub struct CollectorContext {
    pub http: Arc<HttpClient>,
    pub limiter: Arc<RateLimiter>,
    pub user_agents: UserAgentRegistry,
}

impl CollectorContext {
    /// Fetch a source URL with admission control and outcome feedback
    pub async fn fetch(
        &self,
        source: &SourceConfig,
        cancel: &CancellationToken,
    ) -> Result<Response, CollectorError> {
        let domain = source.domain().unwrap_or_else(|| source.url.clone());
        let timeout = Duration::from_secs(source.timeout);

        self.limiter
            .acquire(&domain, Some(timeout), cancel)
            .await
            .map_err(|e| CollectorError::new(&source.name, e))?;

        let headers = vec![(
            "user-agent".to_string(),
            self.user_agents.resolve(source.user_agent.as_deref()).to_string(),
        )];

        let started = std::time::Instant::now();
        let result = self
            .http
            .request(Method::Get, &source.url, &headers, None, Some(timeout), cancel)
            .await;
        let latency = started.elapsed();

        match result {
            Ok(response) => {
                self.limiter
                    .record_outcome(&domain, response.is_success(), latency)
                    .await;
                if !response.is_success() {
                    return Err(CollectorError::new(&source.name, CollectorErrorKind::Status(response.status)));
                }
                Ok(response)
            }
            Err(e) => {
                self.limiter.record_outcome(&domain, false, latency).await;
                Err(CollectorError::new(&source.name, e))
            }
        }
    }
}

/// A source adapter
#[async_trait]
pub trait Collector: Send + Sync {
    /// Which source type this adapter accepts
    fn source_type(&self) -> SourceType;

    /// Version tag stamped onto produced documents
    fn version(&self) -> &'static str;

    /// Fetch the source and produce its raw documents
    ///
    /// All-or-nothing: either every upstream entry is returned or the
    /// whole fetch fails.
    async fn collect(
        &self,
        source: &SourceConfig,
        ctx: &CollectorContext,
        cancel: &CancellationToken,
    ) -> Result<Vec<RawDocument>, CollectorError>;
}

/// Rolling health of one source
#[derive(Debug, Clone, Default)]
pub struct SourceHealth {
    pub consecutive_failures: u32,
    pub total_runs: u64,
    pub total_failures: u64,
    pub last_error: Option<String>,
}

/// Maps source types to adapters and tracks per-source health
pub struct CollectorRegistry {
    adapters: HashMap<SourceType, Arc<dyn Collector>>,
    health: Mutex<HashMap<String, SourceHealth>>,
}

impl CollectorRegistry {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
            health: Mutex::new(HashMap::new()),
        }
    }

    /// Registry with both built-in adapters installed
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(RssCollector));
        registry.register(Arc::new(WebCollector));
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn Collector>) {
        self.adapters.insert(adapter.source_type(), adapter);
    }

    pub fn get(&self, source_type: SourceType) -> Option<Arc<dyn Collector>> {
        self.adapters.get(&source_type).cloned()
    }

    /// Dispatch a collection run to the right adapter, recording health
    pub async fn collect(
        &self,
        source: &SourceConfig,
        ctx: &CollectorContext,
        cancel: &CancellationToken,
    ) -> Result<Vec<RawDocument>, CollectorError> {
        let adapter = self.get(source.source_type).ok_or_else(|| {
            CollectorError::new(&source.name, CollectorErrorKind::Unsupported(source.source_type))
        })?;

        let result = adapter.collect(source, ctx, cancel).await;

        let mut health = self.health.lock().await;
        let entry = health.entry(source.name.clone()).or_default();
        entry.total_runs += 1;
        match &result {
            Ok(docs) => {
                entry.consecutive_failures = 0;
                entry.last_error = None;
                debug!(source = %source.name, count = docs.len(), "Collection succeeded");
            }
            Err(e) => {
                entry.consecutive_failures += 1;
                entry.total_failures += 1;
                entry.last_error = Some(e.to_string());
                warn!(source = %source.name, error = %e, "Collection failed");
            }
        }

        result
    }

    pub async fn health(&self, source_id: &str) -> Option<SourceHealth> {
        self.health.lock().await.get(source_id).cloned()
    }
}

impl Default for CollectorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Content hash over the canonicalized identity of one entry
///
/// Stable across runs for unchanged upstream items: whitespace-trimmed
/// title, link and content joined with newlines, SHA-256, hex.
pub fn entry_hash(title: &str, link: &str, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.trim().as_bytes());
    hasher.update(b"\n");
    hasher.update(link.trim().as_bytes());
    hasher.update(b"\n");
    hasher.update(content.trim().as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_hash_stable() {
        let a = entry_hash("Title", "https://x/1", "body");
        let b = entry_hash("Title", "https://x/1", "body");
        assert_eq!(a, b);
    }

    #[test]
    fn test_entry_hash_ignores_surrounding_whitespace() {
        let a = entry_hash("Title", "https://x/1", "body");
        let b = entry_hash("  Title  ", "https://x/1\n", "\tbody ");
        assert_eq!(a, b);
    }

    #[test]
    fn test_entry_hash_distinguishes_fields() {
        let a = entry_hash("Title", "https://x/1", "body");
        let b = entry_hash("Title", "https://x/2", "body");
        let c = entry_hash("Other", "https://x/1", "body");
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_user_agent_resolution() {
        let registry = UserAgentRegistry::new("atlas/0.1");

        assert_eq!(registry.resolve(None), "atlas/0.1");
        assert!(registry.resolve(Some("desktop")).contains("Mozilla"));
        // Unknown keys are literals
        assert_eq!(registry.resolve(Some("my-bot/2.0")), "my-bot/2.0");
    }

    #[test]
    fn test_registry_has_builtins() {
        let registry = CollectorRegistry::with_builtins();
        assert!(registry.get(SourceType::Rss).is_some());
        assert!(registry.get(SourceType::Web).is_some());
        assert_eq!(registry.get(SourceType::Rss).unwrap().source_type(), SourceType::Rss);
    }
}
