//! Admission algorithms
//!
//! Four interchangeable strategies over a shared grant interface. All of
//! them consume an *effective* rate so the adaptive wrapper can scale a
//! domain up or down without touching algorithm state.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Which admission algorithm a domain uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RateAlgorithm {
    FixedWindow,
    SlidingWindow,
    #[default]
    TokenBucket,
    LeakyBucket,
}

impl std::str::FromStr for RateAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fixed-window" => Ok(Self::FixedWindow),
            "sliding-window" => Ok(Self::SlidingWindow),
            "token-bucket" => Ok(Self::TokenBucket),
            "leaky-bucket" => Ok(Self::LeakyBucket),
            _ => Err(format!("Unknown rate algorithm: {}", s)),
        }
    }
}

/// Per-domain admission policy
#[derive(Debug, Clone, PartialEq)]
pub struct RatePolicy {
    pub algorithm: RateAlgorithm,
    /// Sustained requests per second
    pub rate_per_sec: f64,
    /// Window length for the window algorithms
    pub window: Duration,
    /// Burst capacity for the bucket algorithms
    pub burst: u32,
}

impl Default for RatePolicy {
    fn default() -> Self {
        Self {
            algorithm: RateAlgorithm::TokenBucket,
            rate_per_sec: 1.0,
            window: Duration::from_secs(60),
            burst: 5,
        }
    }
}

impl RatePolicy {
    /// Requests allowed per window at the given effective rate
    fn window_quota(&self, effective_rate: f64) -> usize {
        (effective_rate * self.window.as_secs_f64()).floor().max(1.0) as usize
    }
}

/// Algorithm-specific mutable state for one domain
#[derive(Debug)]
pub enum BucketState {
    FixedWindow {
        window_start: Instant,
        count: usize,
    },
    SlidingWindow {
        grants: VecDeque<Instant>,
    },
    TokenBucket {
        tokens: f64,
        last_refill: Instant,
    },
    LeakyBucket {
        level: f64,
        last_drain: Instant,
    },
}

impl BucketState {
    pub fn new(policy: &RatePolicy, now: Instant) -> Self {
        match policy.algorithm {
            RateAlgorithm::FixedWindow => Self::FixedWindow {
                window_start: now,
                count: 0,
            },
            RateAlgorithm::SlidingWindow => Self::SlidingWindow { grants: VecDeque::new() },
            RateAlgorithm::TokenBucket => Self::TokenBucket {
                tokens: policy.burst as f64,
                last_refill: now,
            },
            RateAlgorithm::LeakyBucket => Self::LeakyBucket {
                level: 0.0,
                last_drain: now,
            },
        }
    }

    /// Try to take one grant; mutates state on success only where the
    /// algorithm requires it (bucket fills always advance)
    pub fn try_grant(&mut self, policy: &RatePolicy, effective_rate: f64, now: Instant) -> bool {
        match self {
            Self::FixedWindow { window_start, count } => {
                if now.duration_since(*window_start) >= policy.window {
                    *window_start = now;
                    *count = 0;
                }
                if *count < policy.window_quota(effective_rate) {
                    *count += 1;
                    true
                } else {
                    false
                }
            }
            Self::SlidingWindow { grants } => {
                while grants.front().is_some_and(|t| now.duration_since(*t) >= policy.window) {
                    grants.pop_front();
                }
                if grants.len() < policy.window_quota(effective_rate) {
                    grants.push_back(now);
                    true
                } else {
                    false
                }
            }
            Self::TokenBucket { tokens, last_refill } => {
                let elapsed = now.duration_since(*last_refill).as_secs_f64();
                *tokens = (*tokens + elapsed * effective_rate).min(policy.burst as f64);
                *last_refill = now;
                if *tokens >= 1.0 {
                    *tokens -= 1.0;
                    true
                } else {
                    false
                }
            }
            Self::LeakyBucket { level, last_drain } => {
                let elapsed = now.duration_since(*last_drain).as_secs_f64();
                *level = (*level - elapsed * effective_rate).max(0.0);
                *last_drain = now;
                if *level + 1.0 <= policy.burst as f64 {
                    *level += 1.0;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Rough wait until the next grant could succeed, used to pace
    /// blocking waiters
    pub fn retry_hint(&self, policy: &RatePolicy, effective_rate: f64, now: Instant) -> Duration {
        let per_grant = Duration::from_secs_f64(1.0 / effective_rate.max(0.001));
        match self {
            Self::FixedWindow { window_start, .. } => {
                let elapsed = now.duration_since(*window_start);
                policy.window.saturating_sub(elapsed).min(per_grant.max(Duration::from_millis(10)))
            }
            Self::SlidingWindow { grants } => match grants.front() {
                Some(oldest) => policy
                    .window
                    .saturating_sub(now.duration_since(*oldest))
                    .max(Duration::from_millis(10)),
                None => Duration::from_millis(10),
            },
            Self::TokenBucket { tokens, .. } => {
                let deficit = (1.0 - tokens).max(0.0);
                Duration::from_secs_f64(deficit / effective_rate.max(0.001)).max(Duration::from_millis(10))
            }
            Self::LeakyBucket { level, .. } => {
                let overflow = (*level + 1.0 - policy.burst as f64).max(0.0);
                Duration::from_secs_f64(overflow / effective_rate.max(0.001)).max(Duration::from_millis(10))
            }
        }
    }
}
