//! Task lifecycle types
//!
//! A `Task` is a unit of work flowing through the queue; a `TaskRecord`
//! is the durable trace the status manager keeps of it.

use chrono::{DateTime, Utc};
use docstore::{IndexValue, Record};
use serde::{Deserialize, Serialize};

use super::Priority;
use super::id::new_id;

/// Task execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
    Timeout,
    Retrying,
}

impl TaskStatus {
    /// Terminal states never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled | Self::Timeout)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Timeout => write!(f, "timeout"),
            Self::Retrying => write!(f, "retrying"),
        }
    }
}

/// A unit of work submitted to the task queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: TaskStatus,
    /// Executions begun so far; never exceeds max_retries + 1
    #[serde(default)]
    pub attempts: u32,
    pub max_retries: u32,
    pub timeout_secs: u64,
    #[serde(default)]
    pub error_message: Option<String>,
    /// Opaque payload handed to the registered task function
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Task {
    pub fn new(name: impl Into<String>, priority: Priority) -> Self {
        Self {
            id: new_id(),
            name: name.into(),
            priority,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            status: TaskStatus::Pending,
            attempts: 0,
            max_retries: 3,
            timeout_secs: 300,
            error_message: None,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    /// Transition to a new status; terminal states are frozen
    pub fn set_status(&mut self, status: TaskStatus) -> Result<(), String> {
        if self.status.is_terminal() {
            return Err(format!(
                "task {} is terminal ({}), cannot transition to {}",
                self.id, self.status, status
            ));
        }
        match status {
            TaskStatus::Running => {
                self.attempts += 1;
                if self.started_at.is_none() {
                    self.started_at = Some(Utc::now());
                }
            }
            s if s.is_terminal() => {
                self.completed_at = Some(Utc::now());
            }
            _ => {}
        }
        self.status = status;
        Ok(())
    }

    /// Whether another attempt is allowed after a failure
    pub fn can_retry(&self) -> bool {
        self.attempts <= self.max_retries
    }
}

/// Durable trace of a task, owned by the status manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub name: String,
    pub priority: Priority,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
}

impl TaskRecord {
    pub fn from_task(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            name: task.name.clone(),
            priority: task.priority,
            status: task.status,
            created_at: task.created_at,
            started_at: task.started_at,
            completed_at: task.completed_at,
            attempts: task.attempts,
            error_message: task.error_message.clone(),
            result: None,
        }
    }

    /// Wall-clock duration, for completed tasks
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

impl Record for TaskRecord {
    const COLLECTION: &'static str = "task_records";

    fn id(&self) -> &str {
        &self.id
    }

    fn index_values(&self) -> Vec<(String, IndexValue)> {
        vec![
            ("status".to_string(), IndexValue::String(self.status.to_string())),
            ("name".to_string(), IndexValue::String(self.name.clone())),
            ("created_at".to_string(), IndexValue::Int(self.created_at.timestamp())),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_lifecycle_timestamps() {
        let mut task = Task::new("collect:example", Priority::Normal);
        assert_eq!(task.status, TaskStatus::Pending);

        task.set_status(TaskStatus::Running).unwrap();
        assert!(task.started_at.is_some());
        assert_eq!(task.attempts, 1);

        task.set_status(TaskStatus::Success).unwrap();
        let started = task.started_at.unwrap();
        let completed = task.completed_at.unwrap();
        assert!(completed >= started);
        assert!(started >= task.created_at);
    }

    #[test]
    fn test_terminal_states_frozen() {
        let mut task = Task::new("t", Priority::Normal);
        task.set_status(TaskStatus::Running).unwrap();
        task.set_status(TaskStatus::Cancelled).unwrap();

        assert!(task.set_status(TaskStatus::Running).is_err());
        assert!(task.set_status(TaskStatus::Pending).is_err());
    }

    #[test]
    fn test_attempts_bounded_by_retries() {
        let mut task = Task::new("t", Priority::Normal).with_retries(2);

        // attempt 1
        task.set_status(TaskStatus::Running).unwrap();
        assert!(task.can_retry());
        task.set_status(TaskStatus::Retrying).unwrap();

        // attempt 2
        task.set_status(TaskStatus::Running).unwrap();
        assert!(task.can_retry());
        task.set_status(TaskStatus::Retrying).unwrap();

        // attempt 3 = max_retries + 1
        task.set_status(TaskStatus::Running).unwrap();
        assert_eq!(task.attempts, 3);
        assert!(!task.can_retry());
        assert!(task.attempts <= task.max_retries + 1);
    }

    #[test]
    fn test_retrying_is_not_terminal() {
        assert!(!TaskStatus::Retrying.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(TaskStatus::Timeout.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_record_duration() {
        let mut task = Task::new("t", Priority::Normal);
        task.set_status(TaskStatus::Running).unwrap();
        task.set_status(TaskStatus::Success).unwrap();

        let record = TaskRecord::from_task(&task);
        assert!(record.duration_ms().unwrap() >= 0);
    }
}
