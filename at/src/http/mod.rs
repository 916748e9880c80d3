//! HTTP fetching with caching and retries

mod cache;
mod client;

pub use cache::{CachedResponse, HttpCache};
pub use client::{HttpClient, HttpStatsSnapshot, Method, Response};

use std::time::Duration;
use thiserror::Error;

/// Errors for exchanges that never completed
///
/// A completed exchange always yields a [`Response`], whatever the
/// status code.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("dns resolution failed: {0}")]
    Dns(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("tls failure: {0}")]
    Tls(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("request cancelled")]
    Cancelled,
}

impl HttpError {
    /// Whether the request-level retry loop may try again
    ///
    /// DNS NXDOMAIN and certificate failures are fatal; cancellation is
    /// never retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Connect(_) | Self::Transport(_) => true,
            Self::Dns(_) | Self::Tls(_) | Self::InvalidUrl(_) | Self::Cancelled => false,
        }
    }
}
