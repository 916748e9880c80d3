//! Cached, retrying HTTP fetcher
//!
//! One retry layer lives here (transport errors, 5xx, 429 with
//! exponential backoff and jitter); the task queue retries whole tasks.
//! The two layers never retry the same failure twice.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::Rng;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::HttpConfig;

use super::HttpError;
use super::cache::HttpCache;

/// HTTP method subset the core uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
}

impl Method {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
        }
    }

    fn to_reqwest(self) -> reqwest::Method {
        match self {
            Self::Get => reqwest::Method::GET,
            Self::Head => reqwest::Method::HEAD,
            Self::Post => reqwest::Method::POST,
        }
    }
}

/// Outcome of a completed HTTP exchange
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub elapsed: Duration,
    pub from_cache: bool,
}

impl Response {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Aggregate client counters
#[derive(Debug, Default)]
pub struct HttpStats {
    pub requests: AtomicU64,
    pub cache_hits: AtomicU64,
    pub retries: AtomicU64,
    pub failures: AtomicU64,
}

/// Snapshot of [`HttpStats`]
#[derive(Debug, Clone, Copy)]
pub struct HttpStatsSnapshot {
    pub requests: u64,
    pub cache_hits: u64,
    pub retries: u64,
    pub failures: u64,
}

/// Cached, retrying HTTP client
pub struct HttpClient {
    http: reqwest::Client,
    cache: Option<HttpCache>,
    config: HttpConfig,
    stats: Arc<HttpStats>,
}

/// Cache key: sha256 over method, url and body
fn cache_key(method: Method, url: &str, body: Option<&[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(url.as_bytes());
    hasher.update(b"|");
    if let Some(body) = body {
        hasher.update(body);
    }
    hex::encode(hasher.finalize())
}

/// Exponential backoff with jitter: base * 2^(attempt-1) * [0.5, 1.5]
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let jitter: f64 = rand::rng().random_range(0.5..=1.5);
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1)) as f64;
    Duration::from_secs_f64(base.as_secs_f64() * factor * jitter)
}

/// Parse a Retry-After header (delta-seconds form)
fn retry_after(headers: &[(String, String)]) -> Option<Duration> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("retry-after"))
        .and_then(|(_, v)| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Map a transport error onto the client taxonomy
fn classify(e: reqwest::Error, timeout: Duration) -> HttpError {
    if e.is_timeout() {
        return HttpError::Timeout(timeout);
    }
    // reqwest folds DNS and TLS failures into the error chain; the text
    // is the only stable discriminator across backends
    let chain = {
        let mut parts = vec![e.to_string()];
        let mut source = std::error::Error::source(&e);
        while let Some(s) = source {
            parts.push(s.to_string());
            source = s.source();
        }
        parts.join(": ").to_lowercase()
    };
    if chain.contains("dns") || chain.contains("resolve") {
        HttpError::Dns(chain)
    } else if chain.contains("certificate") || chain.contains("tls") || chain.contains("ssl") {
        HttpError::Tls(chain)
    } else if e.is_connect() {
        HttpError::Connect(chain)
    } else {
        HttpError::Transport(chain)
    }
}

impl HttpClient {
    pub fn new(config: HttpConfig, cache_dir: Option<std::path::PathBuf>) -> Result<Self, HttpError> {
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(config.timeout_secs));
        if let Some(proxy) = &config.proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy).map_err(|e| HttpError::Transport(e.to_string()))?);
        }
        let http = builder.build().map_err(|e| HttpError::Transport(e.to_string()))?;

        let cache = match (config.cache_enabled, cache_dir) {
            (true, Some(dir)) => Some(HttpCache::new(dir, Duration::from_secs(config.cache_ttl_secs))),
            _ => None,
        };

        Ok(Self {
            http,
            cache,
            config,
            stats: Arc::new(HttpStats::default()),
        })
    }

    /// GET shorthand
    pub async fn get(&self, url: &str, cancel: &CancellationToken) -> Result<Response, HttpError> {
        self.request(Method::Get, url, &[], None, None, cancel).await
    }

    /// Perform a request with caching, retries and cancellation
    ///
    /// Any completed HTTP exchange returns `Ok(Response)`, including 4xx
    /// and 5xx after retries are exhausted; `Err` means no exchange
    /// completed.
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        headers: &[(String, String)],
        body: Option<Vec<u8>>,
        deadline: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Response, HttpError> {
        url::Url::parse(url).map_err(|e| HttpError::InvalidUrl(format!("{}: {}", url, e)))?;

        let key = cache_key(method, url, body.as_deref());
        if let Some(cache) = &self.cache
            && let Some(hit) = cache.get(&key)
        {
            self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
            debug!(url, age = ?hit.age, "Cache hit");
            return Ok(Response {
                status: hit.status,
                headers: hit.headers,
                body: hit.body,
                elapsed: Duration::ZERO,
                from_cache: true,
            });
        }

        let started = Instant::now();
        let overall_deadline = deadline.map(|d| started + d);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            self.stats.requests.fetch_add(1, Ordering::Relaxed);

            match self.exchange(method, url, headers, body.as_deref(), overall_deadline, cancel).await {
                Ok(response) => {
                    let retryable_status = response.status >= 500 || response.status == 429;
                    if retryable_status && attempt < self.config.max_attempts {
                        let delay = retry_after(&response.headers)
                            .unwrap_or_else(|| backoff_delay(Duration::from_millis(self.config.backoff_base_ms), attempt));
                        warn!(url, status = response.status, attempt, ?delay, "Retrying after status");
                        self.stats.retries.fetch_add(1, Ordering::Relaxed);
                        self.sleep_or_cancel(delay, cancel).await?;
                        continue;
                    }

                    if let Some(cache) = &self.cache
                        && response.is_success()
                    {
                        cache.put(&key, response.status, &response.headers, &response.body);
                    }
                    let mut response = response;
                    response.elapsed = started.elapsed();
                    return Ok(response);
                }
                Err(e) => {
                    if e.is_retryable() && attempt < self.config.max_attempts {
                        let delay = backoff_delay(Duration::from_millis(self.config.backoff_base_ms), attempt);
                        warn!(url, error = %e, attempt, ?delay, "Retrying after transport error");
                        self.stats.retries.fetch_add(1, Ordering::Relaxed);
                        self.sleep_or_cancel(delay, cancel).await?;
                        continue;
                    }
                    self.stats.failures.fetch_add(1, Ordering::Relaxed);
                    return Err(e);
                }
            }
        }
    }

    /// One wire exchange, no retries
    async fn exchange(
        &self,
        method: Method,
        url: &str,
        headers: &[(String, String)],
        body: Option<&[u8]>,
        overall_deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> Result<Response, HttpError> {
        let timeout = Duration::from_secs(self.config.timeout_secs);
        let per_request = match overall_deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(HttpError::Timeout(timeout));
                }
                remaining.min(timeout)
            }
            None => timeout,
        };

        let mut request = self
            .http
            .request(method.to_reqwest(), url)
            .timeout(per_request)
            .header("user-agent", &self.config.user_agent);
        for (k, v) in headers {
            request = request.header(k, v);
        }
        if let Some(body) = body {
            request = request.body(body.to_vec());
        }

        let send = async {
            let response = request.send().await.map_err(|e| classify(e, per_request))?;
            let status = response.status().as_u16();
            let headers: Vec<(String, String)> = response
                .headers()
                .iter()
                .map(|(k, v)| (k.to_string(), String::from_utf8_lossy(v.as_bytes()).into_owned()))
                .collect();
            let body = response
                .bytes()
                .await
                .map_err(|e| classify(e, per_request))?
                .to_vec();
            Ok(Response {
                status,
                headers,
                body,
                elapsed: Duration::ZERO,
                from_cache: false,
            })
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(HttpError::Cancelled),
            result = send => result,
        }
    }

    async fn sleep_or_cancel(&self, delay: Duration, cancel: &CancellationToken) -> Result<(), HttpError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(HttpError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Sweep expired cache entries
    pub fn sweep_cache(&self) -> usize {
        self.cache.as_ref().map_or(0, |c| c.sweep())
    }

    pub fn stats(&self) -> HttpStatsSnapshot {
        HttpStatsSnapshot {
            requests: self.stats.requests.load(Ordering::Relaxed),
            cache_hits: self.stats.cache_hits.load(Ordering::Relaxed),
            retries: self.stats.retries.load(Ordering::Relaxed),
            failures: self.stats.failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    /// Serve canned HTTP/1.1 responses on a local port, one per connection
    fn serve(responses: Vec<String>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            for canned in responses {
                let Ok((mut stream, _)) = listener.accept() else {
                    return;
                };
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf);
                let _ = stream.write_all(canned.as_bytes());
            }
        });
        format!("http://{}", addr)
    }

    fn ok_response(body: &str) -> String {
        format!(
            "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            body.len(),
            body
        )
    }

    fn config() -> HttpConfig {
        HttpConfig {
            max_attempts: 3,
            backoff_base_ms: 10,
            timeout_secs: 5,
            cache_ttl_secs: 60,
            cache_enabled: false,
            proxy: None,
            user_agent: "atlas-test/0".to_string(),
        }
    }

    #[tokio::test]
    async fn test_get_success() {
        let base = serve(vec![ok_response("hello")]);
        let client = HttpClient::new(config(), None).unwrap();
        let cancel = CancellationToken::new();

        let response = client.get(&format!("{}/x", base), &cancel).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.text(), "hello");
        assert!(!response.from_cache);
        assert_eq!(client.stats().requests, 1);
    }

    #[tokio::test]
    async fn test_retries_on_500_then_succeeds() {
        let base = serve(vec![
            "HTTP/1.1 500 Internal Server Error\r\ncontent-length: 0\r\nconnection: close\r\n\r\n".to_string(),
            ok_response("recovered"),
        ]);
        let client = HttpClient::new(config(), None).unwrap();
        let cancel = CancellationToken::new();

        let response = client.get(&format!("{}/x", base), &cancel).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.text(), "recovered");
        assert_eq!(client.stats().retries, 1);
    }

    #[tokio::test]
    async fn test_404_not_retried() {
        let base = serve(vec![
            "HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\nconnection: close\r\n\r\n".to_string(),
        ]);
        let client = HttpClient::new(config(), None).unwrap();
        let cancel = CancellationToken::new();

        // Completed exchange: Ok with the 4xx status, no retry
        let response = client.get(&format!("{}/x", base), &cancel).await.unwrap();
        assert_eq!(response.status, 404);
        assert_eq!(client.stats().retries, 0);
    }

    #[tokio::test]
    async fn test_5xx_returned_after_retries_exhausted() {
        let bad = "HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n".to_string();
        let base = serve(vec![bad.clone(), bad.clone(), bad]);
        let client = HttpClient::new(config(), None).unwrap();
        let cancel = CancellationToken::new();

        let response = client.get(&format!("{}/x", base), &cancel).await.unwrap();
        assert_eq!(response.status, 503);
        assert_eq!(client.stats().retries, 2);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_network() {
        let temp = tempfile::tempdir().unwrap();
        let mut cfg = config();
        cfg.cache_enabled = true;
        let base = serve(vec![ok_response("cached body")]);
        let client = HttpClient::new(cfg, Some(temp.path().to_path_buf())).unwrap();
        let cancel = CancellationToken::new();
        let url = format!("{}/page", base);

        let first = client.get(&url, &cancel).await.unwrap();
        assert!(!first.from_cache);

        // Server only serves one connection; this must come from cache
        let second = client.get(&url, &cancel).await.unwrap();
        assert!(second.from_cache);
        assert_eq!(second.body, first.body);
        assert_eq!(client.stats().cache_hits, 1);
    }

    #[tokio::test]
    async fn test_connect_error_classified() {
        // Nothing listens on this port
        let client = HttpClient::new(config(), None).unwrap();
        let cancel = CancellationToken::new();

        let err = client.get("http://127.0.0.1:9/x", &cancel).await.unwrap_err();
        assert!(matches!(err, HttpError::Connect(_) | HttpError::Transport(_)));
    }

    #[tokio::test]
    async fn test_cancel_aborts() {
        let client = HttpClient::new(config(), None).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = client.get("http://127.0.0.1:9/x", &cancel).await.unwrap_err();
        assert!(matches!(err, HttpError::Cancelled));
    }

    #[tokio::test]
    async fn test_invalid_url_rejected() {
        let client = HttpClient::new(config(), None).unwrap();
        let cancel = CancellationToken::new();

        let err = client.get("not a url", &cancel).await.unwrap_err();
        assert!(matches!(err, HttpError::InvalidUrl(_)));
    }

    #[test]
    fn test_cache_key_is_stable_and_distinct() {
        let a = cache_key(Method::Get, "https://example.com/a", None);
        let b = cache_key(Method::Get, "https://example.com/a", None);
        let c = cache_key(Method::Post, "https://example.com/a", None);
        let d = cache_key(Method::Post, "https://example.com/a", Some(b"body"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(c, d);
    }

    #[test]
    fn test_backoff_grows_with_attempts() {
        let base = Duration::from_millis(100);
        for _ in 0..20 {
            let first = backoff_delay(base, 1);
            let third = backoff_delay(base, 3);
            assert!(first >= Duration::from_millis(50));
            assert!(first <= Duration::from_millis(150));
            assert!(third >= Duration::from_millis(200));
            assert!(third <= Duration::from_millis(600));
        }
    }

    #[test]
    fn test_retry_after_parsing() {
        let headers = vec![("Retry-After".to_string(), "7".to_string())];
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(7)));
        assert_eq!(retry_after(&[]), None);
    }
}
