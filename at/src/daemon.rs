//! Daemon wiring
//!
//! Builds the component graph from configuration, registers per-source
//! cron jobs, and runs until interrupted. Startup failures propagate as
//! errors (nonzero exit); runtime errors are logged and absorbed by the
//! task layer, never crashing the process.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use eyre::{Context, Result};
use serde_json::json;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::collector::{CollectorContext, CollectorRegistry, UserAgentRegistry};
use crate::config::Config;
use crate::cron::CronScheduler;
use crate::dedup::Deduplicator;
use crate::domain::{Priority, ProcessingStatus, SourceConfig};
use crate::http::HttpClient;
use crate::llm::{
    AdaptiveController, ClientExecutor, GatewayEmbedder, LlmClient, LlmQueue, SysinfoSampler,
};
use crate::persist::Persistence;
use crate::pipeline::{Processor, Validator};
use crate::queue::{TaskFn, TaskQueue};
use crate::ratelimit::RateLimiter;
use crate::status::StatusManager;

/// Outcome of one collection cycle for one source
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct CycleSummary {
    pub collected: usize,
    pub accepted: usize,
    pub duplicates: usize,
    pub rejected: usize,
    pub failed: usize,
}

/// The assembled daemon
pub struct Daemon {
    config: Config,
    sources: HashMap<String, SourceConfig>,
    persistence: Arc<Mutex<Persistence>>,
    collectors: Arc<CollectorRegistry>,
    collector_ctx: CollectorContext,
    processor: Arc<Processor>,
    validator: Arc<Validator>,
    deduplicator: Arc<Deduplicator>,
    status: StatusManager,
    queue: Arc<TaskQueue>,
    scheduler: Arc<CronScheduler>,
    llm_queue: Arc<LlmQueue>,
    controller: Arc<AdaptiveController>,
}

/// Map a per-source interval onto the five-field dialect
///
/// Sub-hour intervals become minute steps; whole-hour intervals become
/// hour steps; anything longer runs daily.
pub fn interval_to_cron(interval_secs: u64) -> String {
    let minutes = (interval_secs / 60).max(1);
    if minutes < 60 {
        format!("*/{} * * * *", minutes)
    } else if minutes % 60 == 0 && minutes / 60 < 24 {
        format!("0 */{} * * *", minutes / 60)
    } else {
        "0 0 * * *".to_string()
    }
}

impl Daemon {
    /// Build the component graph; failures here abort startup
    pub async fn build(config: Config, sources: Vec<SourceConfig>) -> Result<Self> {
        let mut persistence =
            Persistence::open(&config.storage.data_dir).context("Failed to open document store")?;
        for source in &sources {
            source.validate().map_err(|e| eyre::eyre!("invalid source: {}", e))?;
            persistence.put_source(source.clone()).context("Failed to store source")?;
        }
        let sources: HashMap<String, SourceConfig> =
            sources.into_iter().map(|s| (s.name.clone(), s)).collect();

        let http = Arc::new(
            HttpClient::new(config.http.clone(), Some(config.storage.http_cache_dir.clone()))
                .map_err(|e| eyre::eyre!("Failed to build http client: {}", e))?,
        );
        let limiter = Arc::new(RateLimiter::new(&config.rate_limit));
        let collector_ctx = CollectorContext {
            http,
            limiter,
            user_agents: UserAgentRegistry::new(config.http.user_agent.clone()),
        };

        let status = StatusManager::spawn(&config.storage.status_file, Duration::from_secs(5))
            .context("Failed to start status manager")?;
        let queue = TaskQueue::start(config.queue.clone(), status.clone());
        let scheduler = CronScheduler::new(
            &config.cron,
            Arc::clone(&queue),
            Some(config.storage.cron_jobs_file.clone()),
        );

        let llm_client =
            Arc::new(LlmClient::new(&config.gateway).map_err(|e| eyre::eyre!("Failed to build llm client: {}", e))?);
        let llm_queue = LlmQueue::start(
            Arc::new(ClientExecutor::new(llm_client)),
            1,
            config.gateway.result_cache_size,
        );
        let controller = AdaptiveController::new(
            config.gateway.adaptive.clone(),
            Arc::clone(&llm_queue) as Arc<dyn crate::llm::GatewayControl>,
            Box::new(SysinfoSampler::new()),
        );

        let deduplicator = Deduplicator::new(&config.dedup)
            .map_err(|e| eyre::eyre!("invalid dedup config: {}", e))?
            .with_semantic(Arc::new(GatewayEmbedder::new(Arc::clone(&llm_queue))));

        Ok(Self {
            processor: Arc::new(Processor::new(&config.pipeline)),
            validator: Arc::new(Validator::new(&config.pipeline)),
            deduplicator: Arc::new(deduplicator),
            persistence: Arc::new(Mutex::new(persistence)),
            collectors: Arc::new(CollectorRegistry::with_builtins()),
            collector_ctx,
            sources,
            config,
            status,
            queue,
            scheduler,
            llm_queue,
            controller,
        })
    }

    pub fn status(&self) -> &StatusManager {
        &self.status
    }

    /// Read-only store access for observers (dashboards, tests)
    pub fn persistence(&self) -> Arc<Mutex<Persistence>> {
        Arc::clone(&self.persistence)
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn scheduler(&self) -> &Arc<CronScheduler> {
        &self.scheduler
    }

    /// Run one collection cycle for one source: fetch, process,
    /// validate, deduplicate, persist
    pub async fn collect_source(&self, name: &str, cancel: &CancellationToken) -> Result<CycleSummary> {
        let source = self
            .sources
            .get(name)
            .ok_or_else(|| eyre::eyre!("unknown source: {}", name))?;

        let raw_docs = self
            .collectors
            .collect(source, &self.collector_ctx, cancel)
            .await
            .map_err(|e| eyre::eyre!(e))?;

        let mut summary = CycleSummary {
            collected: raw_docs.len(),
            ..Default::default()
        };

        for mut raw in raw_docs {
            if raw.advance_status(ProcessingStatus::Processing).is_err() {
                continue;
            }

            let mut processed = self.processor.process(&raw);
            let report = self.validator.validate(&raw, &processed);
            if !report.is_accepted() {
                summary.rejected += 1;
                raw.fail(format!("validation: {}", report.summary()));
                self.persistence.lock().await.put_raw(raw)?;
                continue;
            }

            let window = self.persistence.lock().await.list_processed()?;
            match self.deduplicator.deduplicate(&mut processed, &window).await {
                Ok(decision) => {
                    if decision.is_duplicate {
                        summary.duplicates += 1;
                    } else {
                        summary.accepted += 1;
                    }
                    raw.advance_status(ProcessingStatus::Processed)
                        .map_err(|e| eyre::eyre!(e))?;
                    let mut persistence = self.persistence.lock().await;
                    persistence.put_raw(raw)?;
                    persistence.put_processed(processed)?;
                }
                Err(e) => {
                    summary.failed += 1;
                    raw.fail(format!("dedup: {}", e));
                    self.persistence.lock().await.put_raw(raw)?;
                }
            }
        }

        info!(
            source = name,
            collected = summary.collected,
            accepted = summary.accepted,
            duplicates = summary.duplicates,
            rejected = summary.rejected,
            "Collection cycle finished"
        );
        Ok(summary)
    }

    /// The task-queue action running one source's cycle
    fn collection_action(self: &Arc<Self>) -> TaskFn {
        let daemon = Arc::clone(self);
        Arc::new(move |task, cancel| {
            let daemon = Arc::clone(&daemon);
            Box::pin(async move {
                let source = task.payload["source"].as_str().unwrap_or_default().to_string();
                match daemon.collect_source(&source, &cancel).await {
                    Ok(summary) => Ok(serde_json::to_value(summary).unwrap_or(serde_json::Value::Null)),
                    Err(e) => Err(e.to_string()),
                }
            })
        })
    }

    /// Register one cron job per enabled source
    async fn register_jobs(self: &Arc<Self>) -> Result<()> {
        for source in self.sources.values() {
            if !source.enabled {
                continue;
            }
            let action_key = format!("collect:{}", source.name);
            let daemon = Arc::clone(self);
            let source_name = source.name.clone();
            let func: TaskFn = Arc::new(move |_task, cancel| {
                let daemon = Arc::clone(&daemon);
                let source_name = source_name.clone();
                Box::pin(async move {
                    match daemon.collect_source(&source_name, &cancel).await {
                        Ok(summary) => Ok(serde_json::to_value(summary).unwrap_or(serde_json::Value::Null)),
                        Err(e) => Err(e.to_string()),
                    }
                })
            });
            self.scheduler.register_action(&action_key, func).await;
            self.scheduler
                .add_job(
                    format!("collect:{}", source.name),
                    &interval_to_cron(source.interval),
                    &action_key,
                    Priority::Normal,
                    source.retry_count,
                )
                .await
                .map_err(|e| eyre::eyre!("failed to schedule source '{}': {}", source.name, e))?;
        }
        // Hourly cache sweep
        let http = self.collector_ctx.http.clone();
        let sweep: TaskFn = Arc::new(move |_task, _cancel| {
            let http = Arc::clone(&http);
            Box::pin(async move {
                let removed = http.sweep_cache();
                Ok(json!({ "removed": removed }))
            })
        });
        self.scheduler.register_action("cache-sweep", sweep).await;
        // Sweeping is purely local; a failed pass just waits for the
        // next hour instead of retrying
        self.scheduler
            .add_job("cache-sweep", "@hourly", "cache-sweep", Priority::Low, 0)
            .await
            .map_err(|e| eyre::eyre!("failed to schedule cache sweep: {}", e))?;
        Ok(())
    }

    /// Run until ctrl-c, then drain
    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.register_jobs().await?;

        let scheduler_handle = tokio::spawn(Arc::clone(&self.scheduler).run());
        let controller_handle = tokio::spawn(Arc::clone(&self.controller).run());
        info!(sources = self.sources.len(), "Atlas daemon running");

        tokio::signal::ctrl_c().await.context("Failed to listen for shutdown signal")?;
        info!("Shutdown signal received, draining");

        self.scheduler.shutdown();
        self.controller.shutdown();
        let _ = scheduler_handle.await;
        let _ = controller_handle.await;

        self.queue
            .shutdown(Duration::from_secs(self.config.queue.shutdown_grace_secs))
            .await;
        self.llm_queue.shutdown().await;
        self.status.flush().await;
        self.status.shutdown().await;

        info!("Atlas daemon stopped");
        Ok(())
    }

    /// Drain everything without waiting for a signal (used by tests)
    pub async fn stop(&self) {
        self.scheduler.shutdown();
        self.controller.shutdown();
        self.queue
            .shutdown(Duration::from_secs(self.config.queue.shutdown_grace_secs))
            .await;
        self.llm_queue.shutdown().await;
        self.status.flush().await;
        self.status.shutdown().await;
    }

    /// Submit an immediate collection task for a source
    pub async fn collect_now(self: &Arc<Self>, name: &str) -> Result<String> {
        let source = self
            .sources
            .get(name)
            .ok_or_else(|| eyre::eyre!("unknown source: {}", name))?;
        let task = crate::domain::Task::new(format!("collect:{}:manual", name), Priority::High)
            .with_retries(source.retry_count)
            .with_payload(json!({ "source": name }));
        let id = self
            .queue
            .submit(task, self.collection_action())
            .await
            .map_err(|e| eyre::eyre!("submission rejected: {}", e))?;
        Ok(id)
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        // Loops hold their own Arcs; make sure they stop when the daemon
        // goes away without an explicit shutdown
        self.scheduler.shutdown();
        self.controller.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_to_cron() {
        assert_eq!(interval_to_cron(60), "*/1 * * * *");
        assert_eq!(interval_to_cron(300), "*/5 * * * *");
        assert_eq!(interval_to_cron(3600), "0 */1 * * *");
        assert_eq!(interval_to_cron(7200), "0 */2 * * *");
        assert_eq!(interval_to_cron(86_400), "0 0 * * *");
        assert_eq!(interval_to_cron(172_800), "0 0 * * *");
    }

    #[test]
    fn test_interval_to_cron_always_parses() {
        for secs in [60, 90, 600, 3600, 5400, 43_200, 86_400, 1_000_000] {
            let expr = interval_to_cron(secs);
            assert!(
                crate::cron::CronExpr::parse(&expr).is_ok(),
                "{} produced unparseable {}",
                secs,
                expr
            );
        }
    }
}
