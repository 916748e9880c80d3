//! Core store implementation
//!
//! One JSONL file per collection, loaded into an in-memory map on first
//! access. Puts append a line; deletes and compactions rewrite the file
//! through a temp file plus atomic rename.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::{Result, StoreError};

/// A value a record exposes for filtered listing
#[derive(Debug, Clone, PartialEq)]
pub enum IndexValue {
    String(String),
    Int(i64),
    Bool(bool),
}

/// Comparison operator for a filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    /// Greater than or equal (Int values only)
    Ge,
    /// Less than or equal (Int values only)
    Le,
}

/// A single filter clause; clauses in a list are ANDed
#[derive(Debug, Clone)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: IndexValue,
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: IndexValue) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Eq,
            value,
        }
    }

    fn matches(&self, values: &[(String, IndexValue)]) -> bool {
        let found = values.iter().find(|(name, _)| *name == self.field);
        let Some((_, actual)) = found else {
            return false;
        };
        match self.op {
            FilterOp::Eq => *actual == self.value,
            FilterOp::Ge => match (actual, &self.value) {
                (IndexValue::Int(a), IndexValue::Int(b)) => a >= b,
                _ => false,
            },
            FilterOp::Le => match (actual, &self.value) {
                (IndexValue::Int(a), IndexValue::Int(b)) => a <= b,
                _ => false,
            },
        }
    }
}

/// A persistable record
///
/// Records are stored as JSON lines in `<base>/<COLLECTION>.jsonl`.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + 'static {
    /// Collection (file) name this record type lives in
    const COLLECTION: &'static str;

    /// JSON field holding the unique key (used when replaying files)
    const KEY_FIELD: &'static str = "id";

    /// Unique id within the collection
    fn id(&self) -> &str;

    /// Values exposed to [`Filter`] matching
    fn index_values(&self) -> Vec<(String, IndexValue)> {
        Vec::new()
    }
}

/// In-memory image of one collection file
#[derive(Default)]
struct Collection {
    /// id -> raw JSON value, insertion-ordered by id
    records: BTreeMap<String, serde_json::Value>,
    loaded: bool,
}

/// The document store
pub struct Store {
    base_path: PathBuf,
    collections: HashMap<&'static str, Collection>,
}

impl Store {
    /// Open or create a store rooted at the given directory
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let base_path = path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path)?;
        debug!(?base_path, "Opened document store");
        Ok(Self {
            base_path,
            collections: HashMap::new(),
        })
    }

    /// Directory this store lives in
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn collection_file(&self, collection: &str) -> PathBuf {
        self.base_path.join(format!("{}.jsonl", collection))
    }

    /// Load a collection from disk if not already resident
    fn load<R: Record>(&mut self) -> Result<&mut Collection> {
        let entry = self.collections.entry(R::COLLECTION).or_default();
        if entry.loaded {
            return Ok(self.collections.get_mut(R::COLLECTION).unwrap());
        }

        let file_path = self.base_path.join(format!("{}.jsonl", R::COLLECTION));
        let mut records = BTreeMap::new();

        if file_path.exists() {
            let file = fs::File::open(&file_path)?;
            let reader = BufReader::new(file);
            for (lineno, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<serde_json::Value>(&line) {
                    Ok(value) => {
                        let Some(id) = value.get(R::KEY_FIELD).and_then(|v| v.as_str()).map(String::from) else {
                            warn!(
                                collection = R::COLLECTION,
                                key_field = R::KEY_FIELD,
                                lineno,
                                "Skipping record without key field"
                            );
                            continue;
                        };
                        // Last line for an id wins
                        records.insert(id, value);
                    }
                    Err(e) => {
                        warn!(collection = R::COLLECTION, lineno, error = %e, "Skipping corrupt line");
                    }
                }
            }
        }

        let entry = self.collections.get_mut(R::COLLECTION).unwrap();
        entry.records = records;
        entry.loaded = true;
        debug!(
            collection = R::COLLECTION,
            count = entry.records.len(),
            "Loaded collection"
        );
        Ok(entry)
    }

    /// Insert a new record; fails if the id already exists
    pub fn create<R: Record>(&mut self, record: R) -> Result<String> {
        let id = record.id().to_string();
        let collection = self.load::<R>()?;
        if collection.records.contains_key(&id) {
            return Err(StoreError::DuplicateId(id));
        }
        self.put(record)
    }

    /// Insert or replace a record
    pub fn put<R: Record>(&mut self, record: R) -> Result<String> {
        let id = record.id().to_string();
        let value = serde_json::to_value(&record)?;
        let line = serde_json::to_string(&value)? + "\n";

        let collection = self.load::<R>()?;
        collection.records.insert(id.clone(), value);

        let file_path = self.collection_file(R::COLLECTION);
        let mut file = fs::OpenOptions::new().create(true).append(true).open(&file_path)?;
        file.write_all(line.as_bytes())?;
        file.flush()?;

        Ok(id)
    }

    /// Get a record by id
    pub fn get<R: Record>(&mut self, id: &str) -> Result<Option<R>> {
        let collection = self.load::<R>()?;
        match collection.records.get(id) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    /// List records matching all filters, in id order
    pub fn list<R: Record>(&mut self, filters: &[Filter]) -> Result<Vec<R>> {
        let collection = self.load::<R>()?;
        let mut out = Vec::new();
        for value in collection.records.values() {
            let record: R = serde_json::from_value(value.clone())?;
            if filters.iter().all(|f| f.matches(&record.index_values())) {
                out.push(record);
            }
        }
        Ok(out)
    }

    /// Number of records in a collection
    pub fn count<R: Record>(&mut self) -> Result<usize> {
        Ok(self.load::<R>()?.records.len())
    }

    /// Delete a record; rewrites the collection file
    pub fn delete<R: Record>(&mut self, id: &str) -> Result<bool> {
        let collection = self.load::<R>()?;
        if collection.records.remove(id).is_none() {
            return Ok(false);
        }
        self.rewrite(R::COLLECTION)?;
        Ok(true)
    }

    /// Drop superseded lines by rewriting the collection file
    pub fn compact<R: Record>(&mut self) -> Result<()> {
        self.load::<R>()?;
        self.rewrite(R::COLLECTION)
    }

    /// Atomically rewrite a collection file from the in-memory image
    fn rewrite(&mut self, collection: &str) -> Result<()> {
        let Some(entry) = self.collections.get(collection) else {
            return Ok(());
        };

        let file_path = self.collection_file(collection);
        let tmp_path = file_path.with_extension("jsonl.tmp");

        {
            let mut tmp = fs::File::create(&tmp_path)?;
            for value in entry.records.values() {
                let line = serde_json::to_string(value)? + "\n";
                tmp.write_all(line.as_bytes())?;
            }
            tmp.flush()?;
        }

        fs::rename(&tmp_path, &file_path)?;
        info!(collection, count = entry.records.len(), "Rewrote collection file");
        Ok(())
    }

    /// Drop in-memory state and reload from disk on next access
    pub fn sync(&mut self) {
        self.collections.clear();
        debug!("Store cache cleared, collections will reload from disk");
    }
}
