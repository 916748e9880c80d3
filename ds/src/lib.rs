//! docstore - JSONL-backed persistence for the Atlas collection core
//!
//! A collection is a single append-only JSONL file under the store
//! directory; the last line for a given id wins. Writes append, updates
//! and deletes trigger an atomic rewrite (write-to-temp + rename), so a
//! crash never leaves a half-written snapshot behind.
//!
//! Records declare their collection name and a set of index values used
//! for filtered listing. The store itself is type-agnostic; the daemon
//! layers a narrow typed facade (sources, raw documents, processed
//! documents, task records) on top.

mod error;
mod store;

pub use error::StoreError;
pub use store::{Filter, FilterOp, IndexValue, Record, Store};

/// Convenience result alias for store operations
pub type Result<T> = std::result::Result<T, StoreError>;
