//! Atlas - personal information aggregation daemon
//!
//! Atlas periodically crawls heterogeneous public sources (RSS feeds,
//! HTML pages), normalizes and deduplicates what it finds, and hands
//! the results to downstream semantic enrichment. Four subsystems do
//! the heavy lifting:
//!
//! - **Collector engine**: per-domain rate-limited fetching with
//!   caching and retries ([`ratelimit`], [`http`], [`collector`])
//! - **Content pipeline**: extraction, normalization, scoring,
//!   validation and multi-strategy dedup ([`pipeline`], [`dedup`])
//! - **Task scheduler and queue**: cron-driven submission into a
//!   priority worker pool with retry, timeout and cancellation
//!   ([`cron`], [`queue`], [`status`])
//! - **Adaptive LLM gateway**: a queued, concurrency-controlled
//!   front-end to a local inference service with circuit breaking
//!   ([`llm`])
//!
//! Components communicate through explicit queues and the narrow
//! persistence facade in [`persist`]; configuration is loaded once at
//! startup and passed by value.

pub mod collector;
pub mod config;
pub mod cron;
pub mod daemon;
pub mod dedup;
pub mod domain;
pub mod http;
pub mod llm;
pub mod persist;
pub mod pipeline;
pub mod queue;
pub mod ratelimit;
pub mod status;

pub use config::Config;
pub use daemon::{CycleSummary, Daemon};
pub use domain::{Priority, ProcessedDocument, RawDocument, SourceConfig, SourceType, Task, TaskStatus};
