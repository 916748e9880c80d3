//! Atlas configuration types and loading

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::domain::SourceConfig;

/// Main Atlas configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage paths
    pub storage: StorageConfig,

    /// HTTP client behavior
    pub http: HttpConfig,

    /// Per-domain admission control defaults
    #[serde(rename = "rate-limit")]
    pub rate_limit: RateLimitConfig,

    /// Content pipeline knobs
    pub pipeline: PipelineConfig,

    /// Deduplication strategy
    pub dedup: DedupConfig,

    /// Task queue and worker pool
    pub queue: QueueConfig,

    /// Cron scheduler
    pub cron: CronConfig,

    /// LLM gateway and adaptive controller
    pub gateway: GatewayConfig,
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let local_config = PathBuf::from("atlas.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Shape of the sources YAML file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SourcesFile {
    #[serde(default)]
    sources: Vec<SourceConfig>,
}

/// Load and validate the source list
///
/// Names must be unique; every source must pass its own validation.
pub fn load_sources<P: AsRef<Path>>(path: P) -> Result<Vec<SourceConfig>> {
    let content = fs::read_to_string(&path)
        .context(format!("Failed to read sources file {}", path.as_ref().display()))?;
    let file: SourcesFile = serde_yaml::from_str(&content).context("Failed to parse sources file")?;

    let mut seen = HashSet::new();
    for source in &file.sources {
        source.validate().map_err(|e| eyre::eyre!("invalid source: {}", e))?;
        if !seen.insert(source.name.clone()) {
            return Err(eyre::eyre!("duplicate source name: {}", source.name));
        }
    }

    tracing::info!(count = file.sources.len(), "Loaded sources");
    Ok(file.sources)
}

/// Storage paths
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for document and task collections
    #[serde(rename = "data-dir")]
    pub data_dir: PathBuf,

    /// Status manager snapshot file
    #[serde(rename = "status-file")]
    pub status_file: PathBuf,

    /// Persisted cron job registry (optional feature)
    #[serde(rename = "cron-jobs-file")]
    pub cron_jobs_file: PathBuf,

    /// HTTP response cache directory; safe to delete at any time
    #[serde(rename = "http-cache-dir")]
    pub http_cache_dir: PathBuf,

    /// Sources file location
    #[serde(rename = "sources-file")]
    pub sources_file: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".atlas/data"),
            status_file: PathBuf::from(".atlas/task_status.json"),
            cron_jobs_file: PathBuf::from(".atlas/cron_jobs.json"),
            http_cache_dir: PathBuf::from(".atlas/http_cache"),
            sources_file: PathBuf::from("sources.yml"),
        }
    }
}

/// HTTP client behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Total attempts for retryable failures
    #[serde(rename = "max-attempts")]
    pub max_attempts: u32,

    /// Base backoff delay in milliseconds
    #[serde(rename = "backoff-base-ms")]
    pub backoff_base_ms: u64,

    /// Per-request timeout in seconds
    #[serde(rename = "timeout-secs")]
    pub timeout_secs: u64,

    /// Cache entry time-to-live in seconds
    #[serde(rename = "cache-ttl-secs")]
    pub cache_ttl_secs: u64,

    /// Disable the response cache entirely
    #[serde(rename = "cache-enabled")]
    pub cache_enabled: bool,

    /// Optional proxy URL
    #[serde(rename = "proxy")]
    pub proxy: Option<String>,

    /// Default user agent when a source names none
    #[serde(rename = "user-agent")]
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 500,
            timeout_secs: 30,
            cache_ttl_secs: 900,
            cache_enabled: true,
            proxy: None,
            user_agent: "atlas/0.1".to_string(),
        }
    }
}

/// Per-domain admission control defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Algorithm name: fixed-window, sliding-window, token-bucket, leaky-bucket
    pub algorithm: String,

    /// Sustained requests per second
    #[serde(rename = "rate-per-sec")]
    pub rate_per_sec: f64,

    /// Window length in seconds (window algorithms)
    #[serde(rename = "window-secs")]
    pub window_secs: u64,

    /// Burst capacity (bucket algorithms)
    pub burst: u32,

    /// EMA smoothing factor for the adaptive wrapper
    #[serde(rename = "ema-alpha")]
    pub ema_alpha: f64,

    /// Consecutive good outcomes required before raising the rate
    #[serde(rename = "recovery-streak")]
    pub recovery_streak: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            algorithm: "token-bucket".to_string(),
            rate_per_sec: 1.0,
            window_secs: 60,
            burst: 5,
            ema_alpha: 0.2,
            recovery_streak: 5,
        }
    }
}

/// Content pipeline knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Render link anchors as `text (url)`
    #[serde(rename = "inline-links")]
    pub inline_links: bool,

    /// Validator: minimum accepted content length
    #[serde(rename = "min-content-length")]
    pub min_content_length: usize,

    /// Validator: maximum accepted content length
    #[serde(rename = "max-content-length")]
    pub max_content_length: usize,

    /// Validator: how far in the future a publish date may sit, in days
    #[serde(rename = "max-future-days")]
    pub max_future_days: i64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            inline_links: false,
            min_content_length: 40,
            max_content_length: 2_000_000,
            max_future_days: 2,
        }
    }
}

/// Deduplication strategy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Strategy name: hash-only, semantic-only, hybrid
    pub strategy: String,

    /// Fine-grained similarity threshold for duplicate marking
    #[serde(rename = "similarity-threshold")]
    pub similarity_threshold: f64,

    /// Max SimHash Hamming distance for near-dup candidates
    #[serde(rename = "simhash-threshold")]
    pub simhash_threshold: u32,

    /// Embedding cache capacity (entries)
    #[serde(rename = "embedding-cache-size")]
    pub embedding_cache_size: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            strategy: "hybrid".to_string(),
            similarity_threshold: 0.82,
            simhash_threshold: 3,
            embedding_cache_size: 1024,
        }
    }
}

/// Task queue and worker pool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Worker pool size
    pub workers: usize,

    /// Optional queue bound; submissions beyond it are rejected
    pub bound: Option<usize>,

    /// Base retry backoff in milliseconds
    #[serde(rename = "retry-base-ms")]
    pub retry_base_ms: u64,

    /// Drain deadline on shutdown, in seconds
    #[serde(rename = "shutdown-grace-secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            bound: None,
            retry_base_ms: 500,
            shutdown_grace_secs: 30,
        }
    }
}

/// Cron scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CronConfig {
    /// IANA timezone name for expression evaluation
    pub timezone: String,

    /// Persist the job registry to the cron-jobs-file
    #[serde(rename = "persist-jobs")]
    pub persist_jobs: bool,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            timezone: "UTC".to_string(),
            persist_jobs: false,
        }
    }
}

/// LLM gateway and adaptive controller
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Base URL of the local inference service
    #[serde(rename = "base-url")]
    pub base_url: String,

    /// Generation model name
    pub model: String,

    /// Embedding model name
    #[serde(rename = "embed-model")]
    pub embed_model: String,

    /// Hard cap on in-flight HTTP requests to the service
    #[serde(rename = "max-connections")]
    pub max_connections: usize,

    /// Per-request timeout in seconds
    #[serde(rename = "timeout-secs")]
    pub timeout_secs: u64,

    /// Result cache capacity (entries)
    #[serde(rename = "result-cache-size")]
    pub result_cache_size: usize,

    /// Adaptive controller thresholds
    pub adaptive: AdaptiveConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:11434".to_string(),
            model: "llama3.1".to_string(),
            embed_model: "nomic-embed-text".to_string(),
            max_connections: 4,
            timeout_secs: 120,
            result_cache_size: 512,
            adaptive: AdaptiveConfig::default(),
        }
    }
}

/// Adaptive controller thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    /// Seconds between samples
    #[serde(rename = "sample-interval-secs")]
    pub sample_interval_secs: u64,

    /// Queue depth above which scale-up is considered
    #[serde(rename = "high-watermark")]
    pub high_watermark: usize,

    /// Worker concurrency ceiling
    #[serde(rename = "max-workers")]
    pub max_workers: usize,

    /// CPU% ceiling for scale-up decisions
    #[serde(rename = "scale-up-cpu")]
    pub scale_up_cpu: f64,

    /// CPU% that forces scale-down
    #[serde(rename = "high-cpu")]
    pub high_cpu: f64,

    /// Memory% that forces scale-down
    #[serde(rename = "high-mem")]
    pub high_mem: f64,

    /// p95 latency (ms) that forces scale-down
    #[serde(rename = "high-latency-ms")]
    pub high_latency_ms: u64,

    /// Error rate opening the circuit
    #[serde(rename = "circuit-threshold")]
    pub circuit_threshold: f64,

    /// Samples the error rate must be sustained before opening
    #[serde(rename = "open-window-samples")]
    pub open_window_samples: u32,

    /// Seconds the circuit stays open before a half-open probe
    #[serde(rename = "cooldown-secs")]
    pub cooldown_secs: u64,

    /// Consecutive samples required for scale decisions
    pub hysteresis: u32,

    /// Memory% triggering emergency stop
    #[serde(rename = "emergency-mem")]
    pub emergency_mem: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            sample_interval_secs: 2,
            high_watermark: 8,
            max_workers: 8,
            scale_up_cpu: 70.0,
            high_cpu: 85.0,
            high_mem: 90.0,
            high_latency_ms: 10_000,
            circuit_threshold: 0.5,
            open_window_samples: 5,
            cooldown_secs: 30,
            hysteresis: 3,
            emergency_mem: 97.0,
        }
    }
}
