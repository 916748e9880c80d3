//! Per-domain admission control
//!
//! Every fetch asks for a slot on the target domain before touching the
//! network. Domains are independent; each carries its own policy, bucket
//! state and adaptive feedback under a single map lock.

mod adaptive;
mod algorithm;

pub use algorithm::{BucketState, RateAlgorithm, RatePolicy};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::RateLimitConfig;
use adaptive::AdaptiveState;

/// Errors from blocking acquisition
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("rate limit wait timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate limit wait cancelled")]
    Cancelled,
}

/// Per-domain state owned exclusively by the limiter
struct DomainState {
    policy: RatePolicy,
    bucket: BucketState,
    adaptive: AdaptiveState,
    last_access: Instant,
}

impl DomainState {
    fn new(policy: RatePolicy, now: Instant) -> Self {
        let bucket = BucketState::new(&policy, now);
        Self {
            policy,
            bucket,
            adaptive: AdaptiveState::default(),
            last_access: now,
        }
    }

    fn effective_rate(&self) -> f64 {
        self.policy.rate_per_sec * self.adaptive.factor()
    }
}

/// Aggregate limiter counters
#[derive(Debug, Default)]
pub struct LimiterStats {
    pub granted: AtomicU64,
    pub denied: AtomicU64,
    pub timeouts: AtomicU64,
    pub cancellations: AtomicU64,
}

/// Snapshot of [`LimiterStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterStatsSnapshot {
    pub granted: u64,
    pub denied: u64,
    pub timeouts: u64,
    pub cancellations: u64,
}

/// Per-domain rate limiter with adaptive feedback
pub struct RateLimiter {
    default_policy: RatePolicy,
    ema_alpha: f64,
    recovery_streak: u32,
    domains: Mutex<HashMap<String, DomainState>>,
    stats: LimiterStats,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let algorithm = config.algorithm.parse().unwrap_or_default();
        let default_policy = RatePolicy {
            algorithm,
            rate_per_sec: config.rate_per_sec,
            window: Duration::from_secs(config.window_secs),
            burst: config.burst,
        };
        Self {
            default_policy,
            ema_alpha: config.ema_alpha,
            recovery_streak: config.recovery_streak,
            domains: Mutex::new(HashMap::new()),
            stats: LimiterStats::default(),
        }
    }

    /// Non-blocking admission check; total, never fails
    pub async fn try_acquire(&self, domain: &str) -> bool {
        let now = Instant::now();
        let mut domains = self.domains.lock().await;
        let state = domains
            .entry(domain.to_string())
            .or_insert_with(|| DomainState::new(self.default_policy.clone(), now));
        state.last_access = now;

        let effective = state.effective_rate();
        let granted = state.bucket.try_grant(&state.policy, effective, now);
        if granted {
            self.stats.granted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.denied.fetch_add(1, Ordering::Relaxed);
        }
        granted
    }

    /// Blocking admission: waits for a slot up to `timeout`
    ///
    /// Slots open with the passage of time, so waiters pace themselves on
    /// the bucket's own retry hint rather than a wakeup broadcast.
    pub async fn acquire(
        &self,
        domain: &str,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<(), RateLimitError> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            if self.try_acquire(domain).await {
                return Ok(());
            }

            let hint = self.retry_hint(domain).await;
            let wait = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                        debug!(domain, "Rate limit wait timed out");
                        return Err(RateLimitError::Timeout(timeout.unwrap_or_default()));
                    }
                    hint.min(remaining)
                }
                None => hint,
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    self.stats.cancellations.fetch_add(1, Ordering::Relaxed);
                    debug!(domain, "Rate limit wait cancelled");
                    return Err(RateLimitError::Cancelled);
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn retry_hint(&self, domain: &str) -> Duration {
        let now = Instant::now();
        let domains = self.domains.lock().await;
        match domains.get(domain) {
            Some(state) => state.bucket.retry_hint(&state.policy, state.effective_rate(), now),
            None => Duration::from_millis(10),
        }
    }

    /// Feed back a fetch outcome; best-effort, never fails
    pub async fn record_outcome(&self, domain: &str, success: bool, latency: Duration) {
        let now = Instant::now();
        let mut domains = self.domains.lock().await;
        let state = domains
            .entry(domain.to_string())
            .or_insert_with(|| DomainState::new(self.default_policy.clone(), now));
        let before = state.adaptive.factor();
        state.adaptive.record(success, self.ema_alpha, self.recovery_streak);
        let after = state.adaptive.factor();
        if (before - after).abs() > f64::EPSILON {
            debug!(
                domain,
                success,
                ?latency,
                factor = after,
                "Adaptive rate factor adjusted"
            );
        }
    }

    /// Replace the policy for one domain, resetting its bucket
    pub async fn set_policy(&self, domain: &str, policy: RatePolicy) {
        let now = Instant::now();
        let mut domains = self.domains.lock().await;
        let state = domains
            .entry(domain.to_string())
            .or_insert_with(|| DomainState::new(policy.clone(), now));
        state.bucket = BucketState::new(&policy, now);
        state.policy = policy;
    }

    /// Current success ratio EMA for a domain, if it has been seen
    pub async fn success_ratio(&self, domain: &str) -> Option<f64> {
        let domains = self.domains.lock().await;
        domains.get(domain).map(|s| s.adaptive.success_ratio())
    }

    pub fn stats(&self) -> LimiterStatsSnapshot {
        LimiterStatsSnapshot {
            granted: self.stats.granted.load(Ordering::Relaxed),
            denied: self.stats.denied.load(Ordering::Relaxed),
            timeouts: self.stats.timeouts.load(Ordering::Relaxed),
            cancellations: self.stats.cancellations.load(Ordering::Relaxed),
        }
    }
}
