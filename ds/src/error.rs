//! Store error types

use thiserror::Error;

/// Errors raised by store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("duplicate id: {0}")]
    DuplicateId(String),

    #[error("record not found: {0}")]
    NotFound(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StoreError::DuplicateId("doc-1".to_string());
        assert_eq!(err.to_string(), "duplicate id: doc-1");

        let err = StoreError::NotFound("doc-2".to_string());
        assert!(err.to_string().contains("doc-2"));
    }
}
