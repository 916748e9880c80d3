//! Identifier generation
//!
//! All ids are UUIDv7 strings, sortable by creation time.

/// Generate a fresh id
pub fn new_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

/// Short prefix of an id for log lines
pub fn short(id: &str) -> &str {
    &id[..id.len().min(8)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        let a = new_id();
        let b = new_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_ids_sort_by_creation() {
        let a = new_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = new_id();
        assert!(a < b);
    }

    #[test]
    fn test_short_prefix() {
        assert_eq!(short("0193fa2b-1234"), "0193fa2b");
        assert_eq!(short("abc"), "abc");
    }
}
