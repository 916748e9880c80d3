//! Typed persistence facade over the document store
//!
//! The narrow interface the core consumes: sources, raw documents,
//! processed documents, and task records. Everything else about storage
//! (file layout, replay, compaction) stays inside `docstore`.

use std::path::Path;

use docstore::{Filter, FilterOp, IndexValue, Store, StoreError};

use crate::domain::{ProcessedDocument, RawDocument, SourceConfig, SourceType, TaskRecord};

/// Handle to the durable document collections
pub struct Persistence {
    store: Store,
}

impl Persistence {
    /// Open or create the backing store
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        Ok(Self {
            store: Store::open(dir)?,
        })
    }

    // === Sources ===

    pub fn put_source(&mut self, source: SourceConfig) -> Result<(), StoreError> {
        self.store.put(source)?;
        Ok(())
    }

    /// List sources, optionally restricted by type and enabled flag
    pub fn list_sources(
        &mut self,
        source_type: Option<SourceType>,
        enabled_only: bool,
    ) -> Result<Vec<SourceConfig>, StoreError> {
        let mut filters = Vec::new();
        if let Some(t) = source_type {
            filters.push(Filter::eq("type", IndexValue::String(t.to_string())));
        }
        if enabled_only {
            filters.push(Filter::eq("enabled", IndexValue::Bool(true)));
        }
        self.store.list(&filters)
    }

    // === Raw documents ===

    pub fn put_raw(&mut self, doc: RawDocument) -> Result<(), StoreError> {
        self.store.put(doc)?;
        Ok(())
    }

    pub fn get_raw(&mut self, id: &str) -> Result<Option<RawDocument>, StoreError> {
        self.store.get(id)
    }

    /// Raw documents from one source within `[since, until]` (unix seconds)
    pub fn iter_raw(
        &mut self,
        source_id: &str,
        since: Option<i64>,
        until: Option<i64>,
    ) -> Result<Vec<RawDocument>, StoreError> {
        let mut filters = vec![Filter::eq("source_id", IndexValue::String(source_id.to_string()))];
        if let Some(since) = since {
            filters.push(Filter {
                field: "collected_at".to_string(),
                op: FilterOp::Ge,
                value: IndexValue::Int(since),
            });
        }
        if let Some(until) = until {
            filters.push(Filter {
                field: "collected_at".to_string(),
                op: FilterOp::Le,
                value: IndexValue::Int(until),
            });
        }
        self.store.list(&filters)
    }

    // === Processed documents ===

    pub fn put_processed(&mut self, doc: ProcessedDocument) -> Result<(), StoreError> {
        self.store.put(doc)?;
        Ok(())
    }

    /// All members of one similarity group
    pub fn iter_group(&mut self, group_id: &str) -> Result<Vec<ProcessedDocument>, StoreError> {
        self.store
            .list(&[Filter::eq("group_id", IndexValue::String(group_id.to_string()))])
    }

    /// Processed documents sharing an exact content hash
    pub fn find_processed_by_hash(&mut self, content_hash: &str) -> Result<Vec<ProcessedDocument>, StoreError> {
        self.store
            .list(&[Filter::eq("content_hash", IndexValue::String(content_hash.to_string()))])
    }

    /// Every stored processed document (the dedup comparison window)
    pub fn list_processed(&mut self) -> Result<Vec<ProcessedDocument>, StoreError> {
        self.store.list(&[])
    }

    // === Task records ===

    pub fn put_task_status(&mut self, record: TaskRecord) -> Result<(), StoreError> {
        self.store.put(record)?;
        Ok(())
    }

    pub fn get_task_status(&mut self, id: &str) -> Result<Option<TaskRecord>, StoreError> {
        self.store.get(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Priority, Task, TaskStatus};
    use tempfile::tempdir;

    fn raw_doc(source: &str, hash: &str) -> RawDocument {
        RawDocument::new(
            source,
            "https://example.com/item",
            SourceType::Rss,
            "Title",
            "content",
            hash,
            "rss/1",
        )
    }

    #[test]
    fn test_raw_document_roundtrip() {
        let temp = tempdir().unwrap();
        let mut persist = Persistence::open(temp.path()).unwrap();

        let doc = raw_doc("feed-a", "h1");
        let id = doc.id.clone();
        persist.put_raw(doc).unwrap();

        let got = persist.get_raw(&id).unwrap().unwrap();
        assert_eq!(got.source_id, "feed-a");
    }

    #[test]
    fn test_iter_raw_filters_by_source_and_window() {
        let temp = tempdir().unwrap();
        let mut persist = Persistence::open(temp.path()).unwrap();

        persist.put_raw(raw_doc("feed-a", "h1")).unwrap();
        persist.put_raw(raw_doc("feed-a", "h2")).unwrap();
        persist.put_raw(raw_doc("feed-b", "h3")).unwrap();

        let docs = persist.iter_raw("feed-a", None, None).unwrap();
        assert_eq!(docs.len(), 2);

        // A window in the future excludes everything
        let future = chrono::Utc::now().timestamp() + 3600;
        let docs = persist.iter_raw("feed-a", Some(future), None).unwrap();
        assert!(docs.is_empty());
    }

    #[test]
    fn test_iter_group() {
        let temp = tempdir().unwrap();
        let mut persist = Persistence::open(temp.path()).unwrap();

        let mut a = ProcessedDocument::new("raw-1", "A", "content a", "ha", "p/1");
        a.start_group("group-1");
        let mut b = ProcessedDocument::new("raw-2", "B", "content b", "hb", "p/1");
        b.mark_duplicate("group-1", 0.97);
        let mut c = ProcessedDocument::new("raw-3", "C", "content c", "hc", "p/1");
        c.start_group("group-2");

        persist.put_processed(a).unwrap();
        persist.put_processed(b).unwrap();
        persist.put_processed(c).unwrap();

        let group = persist.iter_group("group-1").unwrap();
        assert_eq!(group.len(), 2);
    }

    #[test]
    fn test_find_processed_by_hash() {
        let temp = tempdir().unwrap();
        let mut persist = Persistence::open(temp.path()).unwrap();

        let doc = ProcessedDocument::new("raw-1", "A", "content", "shared-hash", "p/1");
        persist.put_processed(doc).unwrap();

        let hits = persist.find_processed_by_hash("shared-hash").unwrap();
        assert_eq!(hits.len(), 1);
        assert!(persist.find_processed_by_hash("other").unwrap().is_empty());
    }

    #[test]
    fn test_sources_and_task_records() {
        let temp = tempdir().unwrap();
        let mut persist = Persistence::open(temp.path()).unwrap();

        let yaml = r#"
name: hn
type: rss
url: https://news.ycombinator.com/rss
"#;
        let source: SourceConfig = serde_yaml::from_str(yaml).unwrap();
        persist.put_source(source).unwrap();

        let rss = persist.list_sources(Some(SourceType::Rss), true).unwrap();
        assert_eq!(rss.len(), 1);
        let web = persist.list_sources(Some(SourceType::Web), true).unwrap();
        assert!(web.is_empty());

        let mut task = Task::new("collect:hn", Priority::Normal);
        task.set_status(TaskStatus::Running).unwrap();
        task.set_status(TaskStatus::Success).unwrap();
        let record = TaskRecord::from_task(&task);
        let id = record.id.clone();

        persist.put_task_status(record).unwrap();
        let got = persist.get_task_status(&id).unwrap().unwrap();
        assert_eq!(got.status, TaskStatus::Success);
    }
}
