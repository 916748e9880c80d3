//! StatusManager - actor that owns the durable task records
//!
//! Commands arrive over a channel and are processed in order, so readers
//! observe terminal transitions in source order. Snapshots go to
//! `task_status.json` through a temp file and atomic rename, on every
//! terminal transition and on a periodic flush tick. On startup the last
//! snapshot is loaded and records stuck in `running` are failed with
//! reason `crashed`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::domain::{TaskRecord, TaskStatus};

/// Aggregate metrics over all known tasks
#[derive(Debug, Default, Clone, Serialize)]
pub struct TaskMetrics {
    pub total: u64,
    pub pending: u64,
    pub running: u64,
    pub success: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub timeout: u64,
    pub retrying: u64,
    /// success / terminal
    pub success_rate: f64,
    pub p50_duration_ms: Option<i64>,
    pub p95_duration_ms: Option<i64>,
}

/// Snapshot file shape
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    tasks: Vec<TaskRecord>,
}

#[derive(Debug)]
enum StatusCommand {
    Record {
        record: TaskRecord,
        reply: oneshot::Sender<()>,
    },
    Get {
        id: String,
        reply: oneshot::Sender<Option<TaskRecord>>,
    },
    Metrics {
        reply: oneshot::Sender<TaskMetrics>,
    },
    Flush {
        reply: oneshot::Sender<()>,
    },
    Shutdown,
}

/// Handle to the status actor
#[derive(Clone)]
pub struct StatusManager {
    tx: mpsc::Sender<StatusCommand>,
}

impl StatusManager {
    /// Load the snapshot, recover crashed records and start the actor
    pub fn spawn(snapshot_path: impl Into<PathBuf>, flush_interval: Duration) -> eyre::Result<Self> {
        let snapshot_path = snapshot_path.into();
        let mut records = load_snapshot(&snapshot_path)?;

        let crashed: Vec<String> = records
            .values()
            .filter(|r| r.status == TaskStatus::Running)
            .map(|r| r.id.clone())
            .collect();
        for id in &crashed {
            if let Some(record) = records.get_mut(id) {
                record.status = TaskStatus::Failed;
                record.error_message = Some("crashed".to_string());
                record.completed_at = Some(Utc::now());
                warn!(task_id = %id, "Recovered running task as failed (crashed)");
            }
        }
        if !crashed.is_empty() {
            info!(count = crashed.len(), "Crash recovery transitioned running tasks to failed");
            write_snapshot(&snapshot_path, &records)?;
        }

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(actor_loop(snapshot_path, records, rx, flush_interval));
        info!("StatusManager spawned");
        Ok(Self { tx })
    }

    /// Record a task transition
    pub async fn record(&self, record: TaskRecord) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(StatusCommand::Record {
                record,
                reply: reply_tx,
            })
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }

    /// Fetch one task record
    pub async fn get(&self, id: &str) -> Option<TaskRecord> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(StatusCommand::Get {
                id: id.to_string(),
                reply: reply_tx,
            })
            .await
            .ok()?;
        reply_rx.await.ok().flatten()
    }

    /// Aggregate metrics
    pub async fn metrics(&self) -> TaskMetrics {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(StatusCommand::Metrics { reply: reply_tx }).await.is_err() {
            return TaskMetrics::default();
        }
        reply_rx.await.unwrap_or_default()
    }

    /// Force a snapshot write
    pub async fn flush(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(StatusCommand::Flush { reply: reply_tx }).await.is_ok() {
            let _ = reply_rx.await;
        }
    }

    /// Stop the actor, flushing first
    pub async fn shutdown(&self) {
        let _ = self.tx.send(StatusCommand::Shutdown).await;
    }
}

fn load_snapshot(path: &Path) -> eyre::Result<HashMap<String, TaskRecord>> {
    if !path.exists() {
        debug!(?path, "No status snapshot, starting empty");
        return Ok(HashMap::new());
    }
    let content = std::fs::read_to_string(path)?;
    match serde_json::from_str::<Snapshot>(&content) {
        Ok(snapshot) => {
            debug!(count = snapshot.tasks.len(), "Loaded status snapshot");
            Ok(snapshot.tasks.into_iter().map(|r| (r.id.clone(), r)).collect())
        }
        Err(e) => {
            warn!(error = %e, "Corrupt status snapshot, starting empty");
            Ok(HashMap::new())
        }
    }
}

fn write_snapshot(path: &Path, records: &HashMap<String, TaskRecord>) -> eyre::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tasks: Vec<TaskRecord> = records.values().cloned().collect();
    tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(&Snapshot { tasks })?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn compute_metrics(records: &HashMap<String, TaskRecord>) -> TaskMetrics {
    let mut metrics = TaskMetrics {
        total: records.len() as u64,
        ..Default::default()
    };

    let mut durations: Vec<i64> = Vec::new();
    for record in records.values() {
        match record.status {
            TaskStatus::Pending => metrics.pending += 1,
            TaskStatus::Running => metrics.running += 1,
            TaskStatus::Success => metrics.success += 1,
            TaskStatus::Failed => metrics.failed += 1,
            TaskStatus::Cancelled => metrics.cancelled += 1,
            TaskStatus::Timeout => metrics.timeout += 1,
            TaskStatus::Retrying => metrics.retrying += 1,
        }
        if record.status.is_terminal()
            && let Some(ms) = record.duration_ms()
        {
            durations.push(ms);
        }
    }

    let terminal = metrics.success + metrics.failed + metrics.cancelled + metrics.timeout;
    if terminal > 0 {
        metrics.success_rate = metrics.success as f64 / terminal as f64;
    }

    durations.sort_unstable();
    let percentile = |p: f64| -> Option<i64> {
        if durations.is_empty() {
            return None;
        }
        let idx = ((durations.len() as f64 - 1.0) * p).round() as usize;
        durations.get(idx).copied()
    };
    metrics.p50_duration_ms = percentile(0.50);
    metrics.p95_duration_ms = percentile(0.95);

    metrics
}

async fn actor_loop(
    snapshot_path: PathBuf,
    mut records: HashMap<String, TaskRecord>,
    mut rx: mpsc::Receiver<StatusCommand>,
    flush_interval: Duration,
) {
    debug!("StatusManager actor started");
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut dirty = false;

    loop {
        tokio::select! {
            command = rx.recv() => {
                let Some(command) = command else { break };
                match command {
                    StatusCommand::Record { record, reply } => {
                        let terminal = record.status.is_terminal();
                        debug!(task_id = %record.id, status = %record.status, "Recording task transition");
                        records.insert(record.id.clone(), record);
                        dirty = true;
                        if terminal {
                            // Terminal transitions are durable immediately
                            if let Err(e) = write_snapshot(&snapshot_path, &records) {
                                warn!(error = %e, "Failed to write status snapshot");
                            } else {
                                dirty = false;
                            }
                        }
                        let _ = reply.send(());
                    }
                    StatusCommand::Get { id, reply } => {
                        let _ = reply.send(records.get(&id).cloned());
                    }
                    StatusCommand::Metrics { reply } => {
                        let _ = reply.send(compute_metrics(&records));
                    }
                    StatusCommand::Flush { reply } => {
                        if let Err(e) = write_snapshot(&snapshot_path, &records) {
                            warn!(error = %e, "Failed to write status snapshot");
                        } else {
                            dirty = false;
                        }
                        let _ = reply.send(());
                    }
                    StatusCommand::Shutdown => {
                        if let Err(e) = write_snapshot(&snapshot_path, &records) {
                            warn!(error = %e, "Failed to write final status snapshot");
                        }
                        break;
                    }
                }
            }
            _ = ticker.tick() => {
                if dirty {
                    if let Err(e) = write_snapshot(&snapshot_path, &records) {
                        warn!(error = %e, "Failed to write status snapshot");
                    } else {
                        dirty = false;
                    }
                }
            }
        }
    }

    debug!("StatusManager actor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Priority, Task};
    use tempfile::tempdir;

    fn record(status: TaskStatus) -> TaskRecord {
        let mut task = Task::new("t", Priority::Normal);
        if status != TaskStatus::Pending {
            task.set_status(TaskStatus::Running).unwrap();
        }
        if status.is_terminal() || status == TaskStatus::Retrying {
            task.set_status(status).unwrap();
        }
        TaskRecord::from_task(&task)
    }

    #[tokio::test]
    async fn test_record_and_get() {
        let temp = tempdir().unwrap();
        let manager = StatusManager::spawn(temp.path().join("status.json"), Duration::from_secs(60)).unwrap();

        let r = record(TaskStatus::Success);
        let id = r.id.clone();
        manager.record(r).await;

        let got = manager.get(&id).await.unwrap();
        assert_eq!(got.status, TaskStatus::Success);
        assert!(manager.get("unknown").await.is_none());

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_terminal_transition_snapshots_immediately() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("status.json");
        let manager = StatusManager::spawn(&path, Duration::from_secs(3600)).unwrap();

        manager.record(record(TaskStatus::Success)).await;

        // No flush interval has elapsed, the write was terminal-driven
        let content = std::fs::read_to_string(&path).unwrap();
        let snapshot: Snapshot = serde_json::from_str(&content).unwrap();
        assert_eq!(snapshot.tasks.len(), 1);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_crash_recovery_fails_running_tasks() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("status.json");

        {
            let manager = StatusManager::spawn(&path, Duration::from_secs(60)).unwrap();
            manager.record(record(TaskStatus::Running)).await;
            manager.flush().await;
            // Actor dropped without shutdown: simulated crash
        }

        let manager = StatusManager::spawn(&path, Duration::from_secs(60)).unwrap();
        let metrics = manager.metrics().await;
        assert_eq!(metrics.running, 0);
        assert_eq!(metrics.failed, 1);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_recovered_record_carries_crash_reason() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("status.json");

        let id = {
            let manager = StatusManager::spawn(&path, Duration::from_secs(60)).unwrap();
            let r = record(TaskStatus::Running);
            let id = r.id.clone();
            manager.record(r).await;
            manager.flush().await;
            id
        };

        let manager = StatusManager::spawn(&path, Duration::from_secs(60)).unwrap();
        let recovered = manager.get(&id).await.unwrap();
        assert_eq!(recovered.status, TaskStatus::Failed);
        assert_eq!(recovered.error_message.as_deref(), Some("crashed"));

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_metrics_aggregation() {
        let temp = tempdir().unwrap();
        let manager = StatusManager::spawn(temp.path().join("status.json"), Duration::from_secs(60)).unwrap();

        manager.record(record(TaskStatus::Success)).await;
        manager.record(record(TaskStatus::Success)).await;
        manager.record(record(TaskStatus::Failed)).await;
        manager.record(record(TaskStatus::Running)).await;

        let metrics = manager.metrics().await;
        assert_eq!(metrics.total, 4);
        assert_eq!(metrics.success, 2);
        assert_eq!(metrics.failed, 1);
        assert_eq!(metrics.running, 1);
        assert!((metrics.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!(metrics.p50_duration_ms.is_some());

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_starts_empty() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("status.json");
        std::fs::write(&path, "{definitely not json").unwrap();

        let manager = StatusManager::spawn(&path, Duration::from_secs(60)).unwrap();
        assert_eq!(manager.metrics().await.total, 0);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_transitions_observed_in_source_order() {
        let temp = tempdir().unwrap();
        let manager = StatusManager::spawn(temp.path().join("status.json"), Duration::from_secs(60)).unwrap();

        let mut task = Task::new("ordered", Priority::Normal);
        let id = task.id.clone();

        task.set_status(TaskStatus::Running).unwrap();
        manager.record(TaskRecord::from_task(&task)).await;
        assert_eq!(manager.get(&id).await.unwrap().status, TaskStatus::Running);

        task.set_status(TaskStatus::Success).unwrap();
        manager.record(TaskRecord::from_task(&task)).await;
        assert_eq!(manager.get(&id).await.unwrap().status, TaskStatus::Success);

        manager.shutdown().await;
    }
}
