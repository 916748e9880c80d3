//! RSS / Atom / RDF feed adapter
//!
//! A single event-driven parser covers all three dialects: items are
//! `<item>` (RSS 2.0, RDF) or `<entry>` (Atom), links are element text
//! or `href` attributes, content is chosen by priority (full content >
//! description > summary). Duplicate links within one feed collapse
//! keeping the first occurrence.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::{RawDocument, SourceConfig, SourceType};

use super::datetime::parse_datetime;
use super::{Collector, CollectorContext, CollectorError, CollectorErrorKind, entry_hash};

pub const VERSION: &str = "rss-adapter/1.0.0";

/// Media attachment on a feed entry
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Enclosure {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

/// One parsed feed entry, fields as found in the document
#[derive(Debug, Clone, Default)]
pub struct FeedEntry {
    pub title: String,
    pub link: String,
    pub description: String,
    pub content: String,
    pub summary: String,
    pub author: Option<String>,
    pub published_raw: Option<String>,
    pub updated_raw: Option<String>,
    pub categories: Vec<String>,
    pub enclosures: Vec<Enclosure>,
    pub guid: Option<String>,
}

impl FeedEntry {
    /// Effective body: full content wins over description over summary
    pub fn effective_content(&self) -> &str {
        if !self.content.trim().is_empty() {
            &self.content
        } else if !self.description.trim().is_empty() {
            &self.description
        } else {
            &self.summary
        }
    }

    /// Publish timestamp, preferring published over updated
    pub fn published(&self) -> Option<DateTime<Utc>> {
        self.published_raw
            .as_deref()
            .and_then(parse_datetime)
            .or_else(|| self.updated_raw.as_deref().and_then(parse_datetime))
    }
}

/// Parsed feed: channel metadata plus entries in document order
#[derive(Debug, Clone, Default)]
pub struct ParsedFeed {
    pub title: Option<String>,
    pub link: Option<String>,
    pub entries: Vec<FeedEntry>,
}

fn local_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).to_lowercase()
}

fn attr_map(e: &BytesStart<'_>) -> Vec<(String, String)> {
    e.attributes()
        .flatten()
        .map(|a| {
            (
                String::from_utf8_lossy(a.key.local_name().as_ref()).to_lowercase(),
                a.unescape_value().map(|v| v.into_owned()).unwrap_or_default(),
            )
        })
        .collect()
}

fn attr<'a>(attrs: &'a [(String, String)], name: &str) -> Option<&'a str> {
    attrs.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
}

/// Parse a feed document in any of the supported dialects
pub fn parse_feed(xml: &str) -> Result<ParsedFeed, String> {
    let mut reader = Reader::from_str(xml);
    let mut feed = ParsedFeed::default();
    let mut current: Option<FeedEntry> = None;
    let mut stack: Vec<String> = Vec::new();
    let mut saw_root = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = local_name(&e);
                if stack.is_empty() {
                    match name.as_str() {
                        "rss" | "feed" | "rdf" => saw_root = true,
                        other => return Err(format!("not a feed document, root element <{}>", other)),
                    }
                }
                handle_open(&name, &attr_map(&e), &mut feed, &mut current);
                stack.push(name);
            }
            Ok(Event::Empty(e)) => {
                let name = local_name(&e);
                handle_open(&name, &attr_map(&e), &mut feed, &mut current);
            }
            Ok(Event::Text(t)) => {
                let text = t.unescape().map(|v| v.into_owned()).unwrap_or_default();
                handle_text(&text, &stack, &mut feed, &mut current);
            }
            Ok(Event::CData(c)) => {
                let text = String::from_utf8_lossy(&c.into_inner()).into_owned();
                handle_text(&text, &stack, &mut feed, &mut current);
            }
            Ok(Event::End(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_lowercase();
                stack.pop();
                if matches!(name.as_str(), "item" | "entry")
                    && let Some(entry) = current.take()
                {
                    feed.entries.push(entry);
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(format!("xml error at byte {}: {}", reader.buffer_position(), e)),
        }
    }

    if !saw_root {
        return Err("empty document".to_string());
    }
    Ok(feed)
}

/// React to an opening (or self-closing) element
fn handle_open(name: &str, attrs: &[(String, String)], feed: &mut ParsedFeed, current: &mut Option<FeedEntry>) {
    match (name, current.as_mut()) {
        ("item" | "entry", None) => {
            *current = Some(FeedEntry::default());
        }
        // Atom entry link: <link href="..." rel="alternate"/>
        ("link", Some(entry)) => {
            if let Some(href) = attr(attrs, "href") {
                let rel = attr(attrs, "rel").unwrap_or("alternate");
                if rel == "alternate" && entry.link.is_empty() {
                    entry.link = href.to_string();
                }
            }
        }
        // Atom feed link
        ("link", None) => {
            if let Some(href) = attr(attrs, "href") {
                let rel = attr(attrs, "rel").unwrap_or("alternate");
                if rel == "alternate" && feed.link.is_none() {
                    feed.link = Some(href.to_string());
                }
            }
        }
        // RSS enclosure / media:content / media:thumbnail
        ("enclosure" | "content" | "thumbnail", Some(entry)) => {
            if let Some(url) = attr(attrs, "url") {
                entry.enclosures.push(Enclosure {
                    url: url.to_string(),
                    mime: attr(attrs, "type").map(String::from),
                    width: attr(attrs, "width").and_then(|v| v.parse().ok()),
                    height: attr(attrs, "height").and_then(|v| v.parse().ok()),
                });
            }
        }
        // Atom category: <category term="..."/>
        ("category", Some(entry)) => {
            if let Some(term) = attr(attrs, "term") {
                entry.categories.push(term.to_string());
            }
        }
        _ => {}
    }
}

/// React to text content under the innermost element
fn handle_text(raw: &str, stack: &[String], feed: &mut ParsedFeed, current: &mut Option<FeedEntry>) {
    let text = raw.trim();
    if text.is_empty() {
        return;
    }
    let Some(element) = stack.last().map(String::as_str) else {
        return;
    };
    let parent = stack.len().checked_sub(2).map(|i| stack[i].as_str());

    if let Some(entry) = current.as_mut() {
        match element {
            "title" => append(&mut entry.title, text),
            "link" => {
                if entry.link.is_empty() {
                    entry.link = text.to_string();
                }
            }
            "description" => append(&mut entry.description, text),
            // content:encoded (RSS/RDF) and <content> (Atom)
            "encoded" | "content" => append(&mut entry.content, text),
            "summary" => append(&mut entry.summary, text),
            "creator" | "author" => {
                if entry.author.is_none() {
                    entry.author = Some(text.to_string());
                }
            }
            // Atom <author><name>...</name></author>
            "name" if parent == Some("author") => {
                entry.author = Some(text.to_string());
            }
            "pubdate" | "published" | "date" => {
                if entry.published_raw.is_none() {
                    entry.published_raw = Some(text.to_string());
                }
            }
            "updated" | "modified" => {
                if entry.updated_raw.is_none() {
                    entry.updated_raw = Some(text.to_string());
                }
            }
            "category" | "subject" => entry.categories.push(text.to_string()),
            "guid" | "id" => {
                if entry.guid.is_none() {
                    entry.guid = Some(text.to_string());
                }
            }
            _ => {}
        }
    } else {
        // Channel metadata; guard on the parent so <image><title> and
        // similar nested titles are ignored
        match (element, parent) {
            ("title", Some("channel" | "feed")) => {
                if feed.title.is_none() {
                    feed.title = Some(text.to_string());
                }
            }
            ("link", Some("channel" | "feed")) => {
                if feed.link.is_none() {
                    feed.link = Some(text.to_string());
                }
            }
            _ => {}
        }
    }
}

fn append(field: &mut String, text: &str) {
    if !field.is_empty() {
        field.push(' ');
    }
    field.push_str(text);
}

/// Resolve an entry link against the channel link or the feed URL
fn resolve_link(link: &str, feed_link: Option<&str>, feed_url: &str) -> String {
    if url::Url::parse(link).is_ok() {
        return link.to_string();
    }
    for base in [feed_link.unwrap_or(""), feed_url] {
        if let Ok(base) = url::Url::parse(base)
            && let Ok(resolved) = base.join(link)
        {
            return resolved.to_string();
        }
    }
    link.to_string()
}

/// Turn a parsed feed into raw documents for one source
///
/// Pure with respect to feed content: the same upstream items always
/// produce the same content hashes.
pub fn build_documents(source: &SourceConfig, feed: &ParsedFeed, fetched_at: DateTime<Utc>) -> Vec<RawDocument> {
    let mut seen_links: HashSet<String> = HashSet::new();
    let mut documents = Vec::new();

    for entry in &feed.entries {
        if documents.len() >= source.max_items_per_run {
            debug!(source = %source.name, cap = source.max_items_per_run, "Item cap reached");
            break;
        }

        let link = resolve_link(&entry.link, feed.link.as_deref(), &source.url);
        if !link.is_empty() && !seen_links.insert(link.clone()) {
            debug!(source = %source.name, link, "Collapsing duplicate entry link");
            continue;
        }

        let content = entry.effective_content().to_string();
        let hash = entry_hash(&entry.title, &link, &content);

        let mut doc = RawDocument::new(
            &source.name,
            &link,
            SourceType::Rss,
            entry.title.clone(),
            content,
            hash,
            VERSION,
        );
        doc.collected_at = fetched_at;
        doc.author = entry.author.clone();
        doc.published_at = entry.published();

        if let Some(feed_title) = &feed.title {
            doc.raw_metadata
                .insert("feed_title".to_string(), serde_json::json!(feed_title));
        }
        if let Some(guid) = &entry.guid {
            doc.raw_metadata.insert("guid".to_string(), serde_json::json!(guid));
        }
        if !entry.categories.is_empty() {
            doc.raw_metadata
                .insert("categories".to_string(), serde_json::json!(entry.categories));
        }
        if !entry.enclosures.is_empty() {
            doc.raw_metadata
                .insert("enclosures".to_string(), serde_json::json!(entry.enclosures));
        }
        if entry.published().is_none() && entry.published_raw.is_some() {
            warn!(
                source = %source.name,
                raw = ?entry.published_raw,
                "Unparseable publish date, leaving unset"
            );
        }

        documents.push(doc);
    }

    documents
}

/// The RSS/Atom/RDF adapter
pub struct RssCollector;

#[async_trait]
impl Collector for RssCollector {
    fn source_type(&self) -> SourceType {
        SourceType::Rss
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

        let feed = parse_feed(&response.text())
            .map_err(|e| CollectorError::new(&source.name, CollectorErrorKind::Parse(e)))?;

        Ok(build_documents(source, &feed, fetched_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> SourceConfig {
        serde_yaml::from_str(
            r#"
name: ex
type: rss
url: http://x.test/feed
"#,
        )
        .unwrap()
    }

    const RSS2: &str = r#"<?xml version="1.0"?>
<rss version="2.0" xmlns:content="http://purl.org/rss/1.0/modules/content/" xmlns:dc="http://purl.org/dc/elements/1.1/">
  <channel>
    <title>Example Feed</title>
    <link>http://x.test/</link>
    <item>
      <title>A</title>
      <link>http://x.test/a</link>
      <description>Summary of A</description>
      <content:encoded><![CDATA[<p>Full body of A</p>]]></content:encoded>
      <dc:creator>Alice</dc:creator>
      <pubDate>Tue, 01 Jul 2025 08:30:00 GMT</pubDate>
      <category>tech</category>
      <category>rust</category>
      <enclosure url="http://x.test/a.mp3" type="audio/mpeg" length="1024"/>
      <guid>tag:a</guid>
    </item>
    <item>
      <title>B</title>
      <link>/b</link>
      <description>Only description here</description>
      <pubDate>not a date at all</pubDate>
    </item>
    <item>
      <title>C</title>
      <link>http://x.test/c</link>
      <description>C body</description>
    </item>
  </channel>
</rss>"#;

    const ATOM: &str = r#"<?xml version="1.0"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Atom Example</title>
  <link href="http://x.test/" rel="alternate"/>
  <entry>
    <title>First</title>
    <link href="http://x.test/first" rel="alternate"/>
    <link href="http://x.test/first.json" rel="self"/>
    <summary>short</summary>
    <content type="html">long content body</content>
    <author><name>Bob</name></author>
    <published>2025-07-01T10:00:00Z</published>
    <updated>2025-07-02T10:00:00Z</updated>
    <category term="news"/>
    <id>urn:1</id>
  </entry>
</feed>"#;

    const RDF: &str = r#"<?xml version="1.0"?>
<rdf:RDF xmlns:rdf="http://www.w3.org/1999/02/22-rdf-syntax-ns#" xmlns="http://purl.org/rss/1.0/" xmlns:dc="http://purl.org/dc/elements/1.1/">
  <channel rdf:about="http://x.test/">
    <title>RDF Feed</title>
    <link>http://x.test/</link>
  </channel>
  <item rdf:about="http://x.test/r1">
    <title>RDF Item</title>
    <link>http://x.test/r1</link>
    <description>rdf body</description>
    <dc:date>2025-07-01T08:00:00Z</dc:date>
  </item>
</rdf:RDF>"#;

    #[test]
    fn test_parse_rss2() {
        let feed = parse_feed(RSS2).unwrap();
        assert_eq!(feed.title.as_deref(), Some("Example Feed"));
        assert_eq!(feed.link.as_deref(), Some("http://x.test/"));
        assert_eq!(feed.entries.len(), 3);

        let a = &feed.entries[0];
        assert_eq!(a.title, "A");
        assert_eq!(a.author.as_deref(), Some("Alice"));
        assert_eq!(a.categories, vec!["tech", "rust"]);
        assert_eq!(a.enclosures[0].url, "http://x.test/a.mp3");
        assert_eq!(a.enclosures[0].mime.as_deref(), Some("audio/mpeg"));
        assert_eq!(a.guid.as_deref(), Some("tag:a"));
        assert!(a.published().is_some());

        // content:encoded beats description
        assert!(a.effective_content().contains("Full body of A"));
    }

    #[test]
    fn test_parse_atom() {
        let feed = parse_feed(ATOM).unwrap();
        assert_eq!(feed.title.as_deref(), Some("Atom Example"));
        assert_eq!(feed.entries.len(), 1);

        let e = &feed.entries[0];
        // rel="self" must not override the alternate link
        assert_eq!(e.link, "http://x.test/first");
        assert_eq!(e.author.as_deref(), Some("Bob"));
        assert_eq!(e.categories, vec!["news"]);
        assert_eq!(e.effective_content(), "long content body");
        // published preferred over updated
        assert_eq!(e.published().unwrap().to_rfc3339(), "2025-07-01T10:00:00+00:00");
    }

    #[test]
    fn test_parse_rdf() {
        let feed = parse_feed(RDF).unwrap();
        assert_eq!(feed.title.as_deref(), Some("RDF Feed"));
        assert_eq!(feed.entries.len(), 1);
        assert_eq!(feed.entries[0].title, "RDF Item");
        assert!(feed.entries[0].published().is_some());
    }

    #[test]
    fn test_parse_rejects_non_feed() {
        assert!(parse_feed("<html><body>nope</body></html>").is_err());
        assert!(parse_feed("").is_err());
    }

    #[test]
    fn test_build_documents_happy_path() {
        let feed = parse_feed(RSS2).unwrap();
        let docs = build_documents(&source(), &feed, Utc::now());

        assert_eq!(docs.len(), 3);
        let titles: Vec<&str> = docs.iter().map(|d| d.title.as_str()).collect();
        assert_eq!(titles, vec!["A", "B", "C"]);
        assert!(docs.iter().all(|d| d.collector_version == VERSION));
        assert!(docs.iter().all(|d| !d.content_hash.is_empty()));
    }

    #[test]
    fn test_relative_link_resolved_against_channel() {
        let feed = parse_feed(RSS2).unwrap();
        let docs = build_documents(&source(), &feed, Utc::now());
        assert_eq!(docs[1].source_url, "http://x.test/b");
    }

    #[test]
    fn test_unparseable_date_left_unset() {
        let feed = parse_feed(RSS2).unwrap();
        let docs = build_documents(&source(), &feed, Utc::now());
        assert!(docs[0].published_at.is_some());
        assert!(docs[1].published_at.is_none());
    }

    #[test]
    fn test_duplicate_links_collapse_keeping_first() {
        let xml = r#"<rss version="2.0"><channel><title>T</title><link>http://x.test/</link>
          <item><title>First</title><link>http://x.test/same</link><description>one</description></item>
          <item><title>Second</title><link>http://x.test/same</link><description>two</description></item>
        </channel></rss>"#;
        let feed = parse_feed(xml).unwrap();
        let docs = build_documents(&source(), &feed, Utc::now());

        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].title, "First");
    }

    #[test]
    fn test_max_items_cap() {
        let mut src = source();
        src.max_items_per_run = 2;
        let feed = parse_feed(RSS2).unwrap();
        let docs = build_documents(&src, &feed, Utc::now());
        assert_eq!(docs.len(), 2);
    }

    #[test]
    fn test_rerun_produces_identical_hashes() {
        let feed = parse_feed(RSS2).unwrap();
        let first = build_documents(&source(), &feed, Utc::now());
        let second = build_documents(&source(), &feed, Utc::now());

        let hashes = |docs: &[RawDocument]| docs.iter().map(|d| d.content_hash.clone()).collect::<Vec<_>>();
        assert_eq!(hashes(&first), hashes(&second));
        // Ids differ, identity comes from the content hash
        assert_ne!(first[0].id, second[0].id);
    }

    #[test]
    fn test_metadata_carries_feed_context() {
        let feed = parse_feed(RSS2).unwrap();
        let docs = build_documents(&source(), &feed, Utc::now());

        assert_eq!(docs[0].raw_metadata["feed_title"], "Example Feed");
        assert_eq!(docs[0].raw_metadata["categories"][0], "tech");
        assert_eq!(docs[0].raw_metadata["enclosures"][0]["url"], "http://x.test/a.mp3");
    }
}
