//! Cron scheduler
//!
//! Jobs bind an expression to a registered action key. One loop sleeps
//! until the earliest `next_run_at`, fires everything due (in
//! registration order for identical instants), and reschedules from the
//! current instant, so coalesced wakeups fire each job at most once
//! instead of replaying missed runs.

mod expr;

pub use expr::{CronError, CronExpr, parse_tz};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CronConfig;
use crate::domain::{Priority, Task};
use crate::queue::{TaskFn, TaskQueue};

fn default_job_retries() -> u32 {
    3
}

/// One scheduled job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJob {
    pub name: String,
    pub expression: String,
    pub enabled: bool,
    /// Key into the registered action table
    pub func_key: String,
    pub priority: Priority,
    /// Retry budget stamped onto every task this job fires
    #[serde(default = "default_job_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub run_count: u64,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub failure_count: u64,
}

/// Registry file shape for persisted jobs
#[derive(Debug, Default, Serialize, Deserialize)]
struct JobRegistry {
    jobs: Vec<CronJob>,
}

struct SchedulerState {
    /// Registration order, which is also same-instant firing order
    jobs: Vec<CronJob>,
    exprs: HashMap<String, CronExpr>,
}

/// The cron scheduler
pub struct CronScheduler {
    state: Mutex<SchedulerState>,
    actions: Mutex<HashMap<String, TaskFn>>,
    queue: Arc<TaskQueue>,
    tz: Tz,
    persist_path: Option<PathBuf>,
    notify: Notify,
    cancel: CancellationToken,
}

impl CronScheduler {
    pub fn new(config: &CronConfig, queue: Arc<TaskQueue>, persist_path: Option<PathBuf>) -> Arc<Self> {
        let tz = parse_tz(&config.timezone);
        Arc::new(Self {
            state: Mutex::new(SchedulerState {
                jobs: Vec::new(),
                exprs: HashMap::new(),
            }),
            actions: Mutex::new(HashMap::new()),
            queue,
            tz,
            persist_path: config.persist_jobs.then_some(()).and(persist_path),
            notify: Notify::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Register an action jobs can refer to by key
    pub async fn register_action(&self, key: impl Into<String>, func: TaskFn) {
        self.actions.lock().await.insert(key.into(), func);
    }

    /// Add a job; the expression is validated here
    pub async fn add_job(
        &self,
        name: impl Into<String>,
        expression: &str,
        func_key: impl Into<String>,
        priority: Priority,
        max_retries: u32,
    ) -> Result<(), CronError> {
        let expr = CronExpr::parse(expression)?;
        let name = name.into();
        let now = Utc::now();

        let mut state = self.state.lock().await;
        // Restore counters for a previously persisted job of this name
        let persisted = self.load_persisted(&name);

        let mut job = CronJob {
            name: name.clone(),
            expression: expression.to_string(),
            enabled: true,
            func_key: func_key.into(),
            priority,
            max_retries,
            last_run_at: None,
            next_run_at: expr.next_fire(now, self.tz),
            run_count: 0,
            success_count: 0,
            failure_count: 0,
        };
        if let Some(old) = persisted {
            job.last_run_at = old.last_run_at;
            job.run_count = old.run_count;
            job.success_count = old.success_count;
            job.failure_count = old.failure_count;
        }

        state.jobs.retain(|j| j.name != name);
        state.jobs.push(job);
        state.exprs.insert(name.clone(), expr);
        drop(state);

        info!(job = %name, expression, "Registered cron job");
        self.notify.notify_waiters();
        Ok(())
    }

    /// Enable or disable a job
    pub async fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), CronError> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .iter_mut()
            .find(|j| j.name == name)
            .ok_or_else(|| CronError::UnknownJob(name.to_string()))?;
        job.enabled = enabled;
        if enabled {
            let expr = state.exprs.get(name).cloned();
            if let Some(expr) = expr
                && let Some(job) = state.jobs.iter_mut().find(|j| j.name == name)
            {
                job.next_run_at = expr.next_fire(Utc::now(), self.tz);
            }
        }
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Snapshot of all jobs
    pub async fn jobs(&self) -> Vec<CronJob> {
        self.state.lock().await.jobs.clone()
    }

    /// Fire a job immediately without touching its schedule
    pub async fn run_now(&self, name: &str) -> Result<String, CronError> {
        let (func_key, priority, max_retries) = {
            let state = self.state.lock().await;
            let job = state
                .jobs
                .iter()
                .find(|j| j.name == name)
                .ok_or_else(|| CronError::UnknownJob(name.to_string()))?;
            (job.func_key.clone(), job.priority, job.max_retries)
        };

        let Some(func) = self.action(&func_key).await else {
            return Err(CronError::UnknownJob(format!("{} (no action '{}')", name, func_key)));
        };

        let task = Task::new(format!("cron:{}:manual", name), priority).with_retries(max_retries);
        match self.queue.submit(task, func).await {
            Ok(id) => {
                info!(job = %name, task_id = %id, "Manual run submitted");
                Ok(id)
            }
            Err(e) => {
                warn!(job = %name, error = %e, "Manual run rejected by queue");
                Err(CronError::UnknownJob(format!("{}: {}", name, e)))
            }
        }
    }

    async fn action(&self, key: &str) -> Option<TaskFn> {
        self.actions.lock().await.get(key).cloned()
    }

    fn load_persisted(&self, name: &str) -> Option<CronJob> {
        let path = self.persist_path.as_ref()?;
        let content = std::fs::read_to_string(path).ok()?;
        let registry: JobRegistry = serde_json::from_str(&content).ok()?;
        registry.jobs.into_iter().find(|j| j.name == name)
    }

    async fn persist(&self) {
        let Some(path) = &self.persist_path else {
            return;
        };
        let jobs = self.state.lock().await.jobs.clone();
        let registry = JobRegistry { jobs };

        let write = || -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let tmp = path.with_extension("json.tmp");
            std::fs::write(&tmp, serde_json::to_vec_pretty(&registry)?)?;
            std::fs::rename(&tmp, path)?;
            Ok(())
        };
        if let Err(e) = write() {
            warn!(error = %e, "Failed to persist cron registry");
        }
    }

    /// Fire everything due at `now`; used by the loop and by tests
    ///
    /// Each due job fires at most once per call, however many instants
    /// were slept past; `next_run_at` is recomputed from `now`. Returns
    /// the ids of the tasks that were actually submitted.
    pub async fn tick(&self, now: DateTime<Utc>) -> Vec<String> {
        let due: Vec<(String, String, Priority, u32)> = {
            let state = self.state.lock().await;
            state
                .jobs
                .iter()
                .filter(|j| j.enabled && j.next_run_at.is_some_and(|t| t <= now))
                .map(|j| (j.name.clone(), j.func_key.clone(), j.priority, j.max_retries))
                .collect()
        };

        let mut processed = 0;
        let mut submitted_ids = Vec::new();
        for (name, func_key, priority, max_retries) in due {
            let submitted = match self.action(&func_key).await {
                Some(func) => {
                    let task = Task::new(format!("cron:{}", name), priority).with_retries(max_retries);
                    match self.queue.submit(task, func).await {
                        Ok(id) => {
                            debug!(job = %name, task_id = %id, "Cron job fired");
                            submitted_ids.push(id);
                            true
                        }
                        Err(e) => {
                            // Backpressure is a missed run, not a retry
                            warn!(job = %name, error = %e, "Cron submission rejected, run missed");
                            false
                        }
                    }
                }
                None => {
                    warn!(job = %name, func_key = %func_key, "No action registered, run missed");
                    false
                }
            };

            let mut state = self.state.lock().await;
            let expr = state.exprs.get(&name).cloned();
            if let Some(job) = state.jobs.iter_mut().find(|j| j.name == name) {
                job.last_run_at = Some(now);
                job.run_count += 1;
                if !submitted {
                    job.failure_count += 1;
                }
                job.next_run_at = expr.and_then(|e| e.next_fire(now, self.tz));
            }
            processed += 1;
        }

        if processed > 0 {
            self.persist().await;
        }
        submitted_ids
    }

    /// Record the outcome of a finished cron task
    pub async fn record_outcome(&self, job_name: &str, success: bool) {
        let mut state = self.state.lock().await;
        if let Some(job) = state.jobs.iter_mut().find(|j| j.name == job_name) {
            if success {
                job.success_count += 1;
            } else {
                job.failure_count += 1;
            }
        }
    }

    /// The scheduler loop; runs until `shutdown`
    pub async fn run(self: Arc<Self>) {
        info!("Cron scheduler started");
        loop {
            let next_due: Option<DateTime<Utc>> = {
                let state = self.state.lock().await;
                state
                    .jobs
                    .iter()
                    .filter(|j| j.enabled)
                    .filter_map(|j| j.next_run_at)
                    .min()
            };

            let sleep_for = match next_due {
                Some(due) => {
                    let now = Utc::now();
                    if due <= now {
                        self.tick(now).await;
                        continue;
                    }
                    (due - now).to_std().unwrap_or(Duration::from_millis(100)).min(Duration::from_secs(60))
                }
                // Nothing scheduled; wake on registration
                None => Duration::from_secs(60),
            };

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(sleep_for) => {
                    self.tick(Utc::now()).await;
                }
            }
        }
        self.persist().await;
        info!("Cron scheduler stopped");
    }

    /// Stop the loop
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}
