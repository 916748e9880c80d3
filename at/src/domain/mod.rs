//! Core domain types for the collection pipeline

pub mod document;
pub mod id;
pub mod priority;
pub mod source;
pub mod task;

pub use document::{ProcessedDocument, ProcessingStatus, RawDocument};
pub use id::new_id;
pub use priority::Priority;
pub use source::{SourceConfig, SourceType};
pub use task::{Task, TaskRecord, TaskStatus};
