//! Priority task queue and worker pool
//!
//! A binary heap keyed by (priority, submit sequence) gives FIFO order
//! within a priority level. A fixed pool of workers executes tasks under
//! their timeout with a per-task cancellation token; failures retry with
//! exponential backoff until the retry budget runs out. Every transition
//! is reported to the status manager.

use std::collections::{BinaryHeap, HashMap};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::QueueConfig;
use crate::domain::{Task, TaskRecord, TaskStatus};
use crate::status::StatusManager;

/// Result of one task function invocation
pub type TaskResult = Result<serde_json::Value, String>;

/// Boxed task future
pub type TaskFuture = Pin<Box<dyn Future<Output = TaskResult> + Send>>;

/// A runnable task body; receives the task and its cancellation token
pub type TaskFn = Arc<dyn Fn(Task, CancellationToken) -> TaskFuture + Send + Sync>;

/// Submission errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is full")]
    Backpressure,

    #[error("queue is shutting down")]
    ShuttingDown,
}

/// One queued unit of work
struct QueuedEntry {
    task: Task,
    func: TaskFn,
    seq: u64,
}

impl Eq for QueuedEntry {}

impl PartialEq for QueuedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.task.priority == other.task.priority && self.seq == other.seq
    }
}

impl Ord for QueuedEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: more urgent priority first, then earlier submission
        other
            .task
            .priority
            .cmp(&self.task.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Retrying task waiting out its backoff
struct DelayedEntry {
    entry: QueuedEntry,
    ready_at: Instant,
}

/// Aggregate queue counters
#[derive(Debug, Default, Clone, Copy)]
pub struct QueueStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub cancelled: u64,
    pub timeouts: u64,
    pub panics: u64,
}

struct QueueInner {
    heap: BinaryHeap<QueuedEntry>,
    delayed: Vec<DelayedEntry>,
    running: HashMap<String, CancellationToken>,
    draining: bool,
    seq: u64,
    stats: QueueStats,
}

impl QueueInner {
    fn pending(&self) -> usize {
        self.heap.len() + self.delayed.len()
    }

    /// Move delayed entries whose backoff elapsed into the heap
    fn promote_ready(&mut self, now: Instant) {
        let mut i = 0;
        while i < self.delayed.len() {
            if self.delayed[i].ready_at <= now {
                let delayed = self.delayed.swap_remove(i);
                self.heap.push(delayed.entry);
            } else {
                i += 1;
            }
        }
    }
}

/// The task queue and its worker pool
pub struct TaskQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    status: StatusManager,
    config: QueueConfig,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

enum Outcome {
    Success(serde_json::Value),
    Error(String),
    Panic,
    Timeout,
    Cancelled,
}

fn retry_delay(base: Duration, attempts: u32) -> Duration {
    let jitter: f64 = rand::rng().random_range(0.5..=1.5);
    let factor = 2u32.saturating_pow(attempts) as f64;
    Duration::from_secs_f64(base.as_secs_f64() * factor * jitter)
}

impl TaskQueue {
    /// Create the queue and start its workers
    pub fn start(config: QueueConfig, status: StatusManager) -> Arc<Self> {
        let queue = Arc::new(Self {
            inner: Mutex::new(QueueInner {
                heap: BinaryHeap::new(),
                delayed: Vec::new(),
                running: HashMap::new(),
                draining: false,
                seq: 0,
                stats: QueueStats::default(),
            }),
            notify: Notify::new(),
            status,
            config: config.clone(),
            workers: std::sync::Mutex::new(Vec::new()),
        });

        let handles: Vec<JoinHandle<()>> = (0..config.workers)
            .map(|worker_id| {
                let queue = Arc::clone(&queue);
                tokio::spawn(async move { queue.worker_loop(worker_id).await })
            })
            .collect();
        queue.workers.lock().expect("worker handle lock").extend(handles);

        queue
    }

    /// Submit a task; never blocks
    pub async fn submit(&self, task: Task, func: TaskFn) -> Result<String, QueueError> {
        let record = TaskRecord::from_task(&task);
        let id = task.id.clone();

        {
            let mut inner = self.inner.lock().await;
            if inner.draining {
                return Err(QueueError::ShuttingDown);
            }
            if let Some(bound) = self.config.bound
                && inner.pending() >= bound
            {
                debug!(task_id = %id, bound, "Submission rejected, queue full");
                return Err(QueueError::Backpressure);
            }
            inner.seq += 1;
            let seq = inner.seq;
            inner.heap.push(QueuedEntry { task, func, seq });
            inner.stats.submitted += 1;
        }

        self.status.record(record).await;
        self.notify.notify_one();
        Ok(id)
    }

    /// Cancel a task: pending tasks leave the queue, running tasks get
    /// their token cancelled
    pub async fn cancel(&self, task_id: &str) -> bool {
        let mut cancelled_record: Option<TaskRecord> = None;
        let found = {
            let mut inner = self.inner.lock().await;

            if let Some(token) = inner.running.get(task_id) {
                token.cancel();
                true
            } else {
                let mut removed: Option<QueuedEntry> = None;

                let drained: Vec<QueuedEntry> = inner.heap.drain().collect();
                for entry in drained {
                    if entry.task.id == task_id && removed.is_none() {
                        removed = Some(entry);
                    } else {
                        inner.heap.push(entry);
                    }
                }
                if removed.is_none()
                    && let Some(pos) = inner.delayed.iter().position(|d| d.entry.task.id == task_id)
                {
                    removed = Some(inner.delayed.swap_remove(pos).entry);
                }

                match removed {
                    Some(mut entry) => {
                        let _ = entry.task.set_status(TaskStatus::Cancelled);
                        entry.task.error_message = Some("cancelled before dispatch".to_string());
                        inner.stats.cancelled += 1;
                        cancelled_record = Some(TaskRecord::from_task(&entry.task));
                        true
                    }
                    None => false,
                }
            }
        };

        if let Some(record) = cancelled_record {
            self.status.record(record).await;
        }
        found
    }

    /// Pending task count (queued + backing off)
    pub async fn depth(&self) -> usize {
        self.inner.lock().await.pending()
    }

    pub async fn stats(&self) -> QueueStats {
        self.inner.lock().await.stats
    }

    /// Drain and stop: no new admissions, pending tasks cancel, running
    /// tasks get until `deadline`, stragglers are cancelled hard
    pub async fn shutdown(&self, deadline: Duration) {
        let pending: Vec<TaskRecord> = {
            let mut inner = self.inner.lock().await;
            inner.draining = true;

            let mut records = Vec::new();
            let drained: Vec<QueuedEntry> = inner.heap.drain().collect();
            let delayed: Vec<DelayedEntry> = std::mem::take(&mut inner.delayed);
            for mut entry in drained.into_iter().chain(delayed.into_iter().map(|d| d.entry)) {
                let _ = entry.task.set_status(TaskStatus::Cancelled);
                entry.task.error_message = Some("queue shutdown".to_string());
                inner.stats.cancelled += 1;
                records.push(TaskRecord::from_task(&entry.task));
            }
            records
        };
        for record in pending {
            self.status.record(record).await;
        }
        self.notify.notify_waiters();

        let handles: Vec<JoinHandle<()>> = self.workers.lock().expect("worker handle lock").drain(..).collect();
        let join_all = async {
            for handle in handles {
                let _ = handle.await;
            }
        };

        if tokio::time::timeout(deadline, join_all).await.is_err() {
            warn!("Shutdown deadline reached, cancelling running tasks");
            let tokens: Vec<CancellationToken> = {
                let inner = self.inner.lock().await;
                inner.running.values().cloned().collect()
            };
            for token in tokens {
                token.cancel();
            }
            // Grace period for cancellation to be honored
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        debug!("Task queue shut down");
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        debug!(worker_id, "Worker started");
        loop {
            let entry = {
                loop {
                    let wait;
                    {
                        let mut inner = self.inner.lock().await;
                        if inner.draining {
                            debug!(worker_id, "Worker exiting, queue draining");
                            return;
                        }
                        inner.promote_ready(Instant::now());
                        if let Some(entry) = inner.heap.pop() {
                            break entry;
                        }
                        wait = inner
                            .delayed
                            .iter()
                            .map(|d| d.ready_at.saturating_duration_since(Instant::now()))
                            .min();
                    }
                    match wait {
                        Some(delay) => {
                            tokio::select! {
                                _ = self.notify.notified() => {}
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                        None => self.notify.notified().await,
                    }
                }
            };
            self.run_entry(entry).await;
        }
    }

    async fn run_entry(&self, mut entry: QueuedEntry) {
        let token = CancellationToken::new();
        {
            let mut inner = self.inner.lock().await;
            inner.running.insert(entry.task.id.clone(), token.clone());
        }

        if entry.task.set_status(TaskStatus::Running).is_err() {
            // Cancelled while queued in a race; drop it
            let mut inner = self.inner.lock().await;
            inner.running.remove(&entry.task.id);
            return;
        }
        self.status.record(TaskRecord::from_task(&entry.task)).await;
        debug!(task_id = %entry.task.id, attempt = entry.task.attempts, "Task started");

        let timeout = Duration::from_secs(entry.task.timeout_secs);
        let future = (entry.func)(entry.task.clone(), token.clone());
        let mut handle = tokio::spawn(future);

        let outcome = tokio::select! {
            _ = token.cancelled() => {
                handle.abort();
                Outcome::Cancelled
            }
            _ = tokio::time::sleep(timeout) => {
                // Timeout cancels the attempt
                token.cancel();
                handle.abort();
                Outcome::Timeout
            }
            result = &mut handle => match result {
                Ok(Ok(value)) => Outcome::Success(value),
                // A body that noticed its token and returned an error is
                // a cancellation, not a retryable failure
                Ok(Err(_)) if token.is_cancelled() => Outcome::Cancelled,
                Ok(Err(message)) => Outcome::Error(message),
                Err(join_error) if join_error.is_panic() => Outcome::Panic,
                Err(_) => Outcome::Cancelled,
            },
        };

        {
            let mut inner = self.inner.lock().await;
            inner.running.remove(&entry.task.id);
        }

        match outcome {
            Outcome::Success(value) => {
                let _ = entry.task.set_status(TaskStatus::Success);
                let mut record = TaskRecord::from_task(&entry.task);
                record.result = Some(value);
                self.bump(|s| s.completed += 1).await;
                self.status.record(record).await;
                debug!(task_id = %entry.task.id, "Task succeeded");
            }
            Outcome::Cancelled => {
                let _ = entry.task.set_status(TaskStatus::Cancelled);
                entry.task.error_message = Some("cancelled".to_string());
                self.bump(|s| s.cancelled += 1).await;
                self.status.record(TaskRecord::from_task(&entry.task)).await;
                debug!(task_id = %entry.task.id, "Task cancelled");
            }
            Outcome::Timeout => {
                if entry.task.can_retry() {
                    self.requeue(entry, "attempt timed out").await;
                } else {
                    let _ = entry.task.set_status(TaskStatus::Timeout);
                    entry.task.error_message = Some(format!("timed out after {:?}", timeout));
                    self.bump(|s| s.timeouts += 1).await;
                    self.status.record(TaskRecord::from_task(&entry.task)).await;
                    warn!(task_id = %entry.task.id, attempts = entry.task.attempts, "Task timed out terminally");
                }
            }
            Outcome::Error(message) => {
                if entry.task.can_retry() {
                    self.requeue(entry, &message).await;
                } else {
                    let _ = entry.task.set_status(TaskStatus::Failed);
                    entry.task.error_message = Some(message);
                    self.bump(|s| s.failed += 1).await;
                    self.status.record(TaskRecord::from_task(&entry.task)).await;
                    warn!(task_id = %entry.task.id, attempts = entry.task.attempts, "Task failed terminally");
                }
            }
            Outcome::Panic => {
                let _ = entry.task.set_status(TaskStatus::Failed);
                entry.task.error_message = Some("worker_crash".to_string());
                self.bump(|s| { s.failed += 1; s.panics += 1 }).await;
                self.status.record(TaskRecord::from_task(&entry.task)).await;
                warn!(task_id = %entry.task.id, "Task body panicked");
            }
        }
    }

    /// Re-enqueue a failed attempt after its backoff delay
    async fn requeue(&self, mut entry: QueuedEntry, reason: &str) {
        let delay = retry_delay(Duration::from_millis(self.config.retry_base_ms), entry.task.attempts);
        let _ = entry.task.set_status(TaskStatus::Retrying);
        entry.task.error_message = Some(reason.to_string());
        let record = TaskRecord::from_task(&entry.task);
        debug!(task_id = %entry.task.id, attempts = entry.task.attempts, ?delay, "Retrying task");

        {
            let mut inner = self.inner.lock().await;
            inner.stats.retried += 1;
            inner.delayed.push(DelayedEntry {
                entry,
                ready_at: Instant::now() + delay,
            });
        }
        self.status.record(record).await;
        self.notify.notify_one();
    }

    async fn bump(&self, f: impl FnOnce(&mut QueueStats)) {
        let mut inner = self.inner.lock().await;
        f(&mut inner.stats);
    }
}
