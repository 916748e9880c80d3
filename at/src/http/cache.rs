//! Disk-backed HTTP response cache
//!
//! Entries are two files per key under the cache directory: a JSON
//! envelope (status, headers, stored-at) and the raw body bytes. The
//! envelope is written last via temp + rename, so a visible envelope
//! implies a complete entry. Any read or decode failure degrades to a
//! cache miss; the directory is safe to delete at any time.

use std::fs;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Envelope metadata stored beside the body
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    stored_at: u64,
    status: u16,
    headers: Vec<(String, String)>,
}

/// A cache read hit
#[derive(Debug)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub age: Duration,
}

/// Best-effort response cache
pub struct HttpCache {
    dir: PathBuf,
    ttl: Duration,
}

fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

impl HttpCache {
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self { dir: dir.into(), ttl }
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    fn body_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.body", key))
    }

    /// Look up a fresh entry; anything wrong with it is a miss
    pub fn get(&self, key: &str) -> Option<CachedResponse> {
        let meta_path = self.meta_path(key);
        let content = fs::read_to_string(&meta_path).ok()?;
        let envelope: Envelope = match serde_json::from_str(&content) {
            Ok(e) => e,
            Err(e) => {
                warn!(key, error = %e, "Corrupt cache envelope, treating as miss");
                return None;
            }
        };

        let age = Duration::from_secs(now_unix().saturating_sub(envelope.stored_at));
        if age >= self.ttl {
            debug!(key, ?age, "Cache entry expired");
            return None;
        }

        let body = fs::read(self.body_path(key)).ok()?;
        Some(CachedResponse {
            status: envelope.status,
            headers: envelope.headers,
            body,
            age,
        })
    }

    /// Store a successful response; errors are swallowed (cache is
    /// best-effort), non-2xx statuses are never stored
    pub fn put(&self, key: &str, status: u16, headers: &[(String, String)], body: &[u8]) {
        if !(200..300).contains(&status) {
            return;
        }
        if let Err(e) = self.put_inner(key, status, headers, body) {
            warn!(key, error = %e, "Failed to write cache entry");
        }
    }

    fn put_inner(&self, key: &str, status: u16, headers: &[(String, String)], body: &[u8]) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir)?;

        // Body first; the envelope rename makes the entry visible
        fs::write(self.body_path(key), body)?;

        let envelope = Envelope {
            stored_at: now_unix(),
            status,
            headers: headers.to_vec(),
        };
        let meta_path = self.meta_path(key);
        let tmp_path = meta_path.with_extension("json.tmp");
        fs::write(&tmp_path, serde_json::to_vec(&envelope)?)?;
        fs::rename(&tmp_path, &meta_path)?;
        Ok(())
    }

    /// Remove expired entries; returns how many were dropped
    pub fn sweep(&self) -> usize {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return 0;
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_none_or(|e| e != "json") {
                continue;
            }
            let expired = fs::read_to_string(&path)
                .ok()
                .and_then(|c| serde_json::from_str::<Envelope>(&c).ok())
                .is_none_or(|env| now_unix().saturating_sub(env.stored_at) >= self.ttl.as_secs());

            if expired {
                let _ = fs::remove_file(&path);
                let _ = fs::remove_file(path.with_extension("body"));
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "Swept expired cache entries");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_roundtrip() {
        let temp = tempdir().unwrap();
        let cache = HttpCache::new(temp.path(), Duration::from_secs(60));

        cache.put(
            "k1",
            200,
            &[("content-type".to_string(), "text/html".to_string())],
            b"hello",
        );

        let hit = cache.get("k1").unwrap();
        assert_eq!(hit.status, 200);
        assert_eq!(hit.body, b"hello");
        assert_eq!(hit.headers[0].0, "content-type");
    }

    #[test]
    fn test_miss_on_unknown_key() {
        let temp = tempdir().unwrap();
        let cache = HttpCache::new(temp.path(), Duration::from_secs(60));
        assert!(cache.get("nope").is_none());
    }

    #[test]
    fn test_non_2xx_never_stored() {
        let temp = tempdir().unwrap();
        let cache = HttpCache::new(temp.path(), Duration::from_secs(60));

        cache.put("k404", 404, &[], b"not found");
        cache.put("k500", 500, &[], b"boom");
        assert!(cache.get("k404").is_none());
        assert!(cache.get("k500").is_none());
    }

    #[test]
    fn test_zero_ttl_always_misses() {
        let temp = tempdir().unwrap();
        let cache = HttpCache::new(temp.path(), Duration::ZERO);

        cache.put("k1", 200, &[], b"data");
        assert!(cache.get("k1").is_none());
    }

    #[test]
    fn test_corrupt_envelope_is_miss() {
        let temp = tempdir().unwrap();
        let cache = HttpCache::new(temp.path(), Duration::from_secs(60));

        cache.put("k1", 200, &[], b"data");
        fs::write(temp.path().join("k1.json"), "{broken").unwrap();
        assert!(cache.get("k1").is_none());
    }

    #[test]
    fn test_sweep_removes_expired() {
        let temp = tempdir().unwrap();
        let cache = HttpCache::new(temp.path(), Duration::from_secs(60));
        cache.put("k1", 200, &[], b"data");

        // Fresh entry survives
        assert_eq!(cache.sweep(), 0);
        assert!(cache.get("k1").is_some());

        // Rewrite the envelope with an ancient timestamp
        let old = Envelope {
            stored_at: 1,
            status: 200,
            headers: vec![],
        };
        fs::write(temp.path().join("k1.json"), serde_json::to_vec(&old).unwrap()).unwrap();

        assert_eq!(cache.sweep(), 1);
        assert!(cache.get("k1").is_none());
        assert!(!temp.path().join("k1.body").exists());
    }

    #[test]
    fn test_cache_round_trip_body_identical() {
        let temp = tempdir().unwrap();
        let cache = HttpCache::new(temp.path(), Duration::from_secs(60));

        let body: Vec<u8> = (0..=255).collect();
        cache.put("bin", 200, &[], &body);
        assert_eq!(cache.get("bin").unwrap().body, body);
    }
}
