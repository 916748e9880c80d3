//! Web page adapter
//!
//! Extracts one document per page using the per-source CSS selector
//! chains (title, content, date, author). The page is parsed once;
//! within a chain the first selector with a non-empty match wins. A page
//! matching no content produces no document, only a warning.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scraper::{Html, Selector};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::domain::{RawDocument, SourceConfig, SourceType};
use crate::pipeline::extract::html_to_text;

use super::datetime::parse_datetime;
use super::{Collector, CollectorContext, CollectorError, entry_hash};

pub const VERSION: &str = "web-adapter/1.0.0";

const DEFAULT_TITLE_CHAIN: &[&str] = &["h1", "title"];
const DEFAULT_CONTENT_CHAIN: &[&str] = &["article", "main", "body"];
const DEFAULT_DATE_CHAIN: &[&str] = &["time", ".published", ".date"];
const DEFAULT_AUTHOR_CHAIN: &[&str] = &[".author", "[rel=author]"];

/// Fields pulled off a page before normalization
#[derive(Debug, Clone)]
pub struct PageFields {
    pub title: String,
    pub content_html: String,
    pub date_raw: Option<String>,
    pub author: Option<String>,
}

/// First non-empty text match across a selector chain
fn select_text(doc: &Html, chain: &[String]) -> Option<String> {
    for raw in chain {
        let Ok(selector) = Selector::parse(raw) else {
            warn!(selector = %raw, "Invalid CSS selector, skipping");
            continue;
        };
        for element in doc.select(&selector) {
            let text: String = element.text().collect::<Vec<_>>().join(" ");
            let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
            if !text.is_empty() {
                return Some(text);
            }
        }
    }
    None
}

/// First non-empty inner HTML across a selector chain
fn select_html(doc: &Html, chain: &[String]) -> Option<String> {
    for raw in chain {
        let Ok(selector) = Selector::parse(raw) else {
            warn!(selector = %raw, "Invalid CSS selector, skipping");
            continue;
        };
        for element in doc.select(&selector) {
            let html = element.inner_html();
            if !html.trim().is_empty() {
                return Some(html);
            }
        }
    }
    None
}

fn chain<'a>(source: &'a SourceConfig, field: &str, default: &[&str]) -> Vec<String> {
    match source.selectors.get(field) {
        Some(configured) if !configured.is_empty() => configured.clone(),
        _ => default.iter().map(|s| s.to_string()).collect(),
    }
}

/// Extract the configured fields from a page; parses the HTML once
pub fn extract_fields(html: &str, source: &SourceConfig) -> Option<PageFields> {
    let doc = Html::parse_document(html);

    let title = select_text(&doc, &chain(source, "title", DEFAULT_TITLE_CHAIN))?;
    let content_html = select_html(&doc, &chain(source, "content", DEFAULT_CONTENT_CHAIN))?;
    let date_raw = select_text(&doc, &chain(source, "date", DEFAULT_DATE_CHAIN));
    let author = select_text(&doc, &chain(source, "author", DEFAULT_AUTHOR_CHAIN));

    Some(PageFields {
        title,
        content_html,
        date_raw,
        author,
    })
}

/// Build the document for one fetched page, if it matches
pub fn build_document(
    source: &SourceConfig,
    html: &str,
    fetched_at: DateTime<Utc>,
    inline_links: bool,
) -> Option<RawDocument> {
    let Some(fields) = extract_fields(html, source) else {
        warn!(source = %source.name, "Page matched no title/content selectors, producing nothing");
        return None;
    };

    let content = html_to_text(&fields.content_html, inline_links);
    if content.trim().is_empty() {
        warn!(source = %source.name, "Extracted content is empty, producing nothing");
        return None;
    }

    let hash = entry_hash(&fields.title, &source.url, &content);
    let mut doc = RawDocument::new(
        &source.name,
        &source.url,
        SourceType::Web,
        fields.title,
        content,
        hash,
        VERSION,
    );
    doc.collected_at = fetched_at;
    doc.author = fields.author;
    doc.published_at = fields.date_raw.as_deref().and_then(parse_datetime);
    if let Some(raw) = fields.date_raw {
        doc.raw_metadata.insert("date_raw".to_string(), serde_json::json!(raw));
    }
    Some(doc)
}

/// The web page adapter
pub struct WebCollector;

#[async_trait]
impl Collector for WebCollector {
    fn source_type(&self) -> SourceType {
        SourceType::Web
    }

    fn version(&self) -> &'static str {
        VERSION
    }

    async fn collect(
        &self,
        source: &SourceConfig,
        ctx: &CollectorContext,
        cancel: &CancellationToken,
    ) -> Result<Vec<RawDocument>, CollectorError> {
        let response = ctx.fetch(source, cancel).await?;
        let fetched_at = Utc::now();

        Ok(build_document(source, &response.text(), fetched_at, false)
            .into_iter()
            .collect())
    }
}
