//! Task records: the unit of asynchronous work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

use crate::error::TaskError;

/// Dispatch priority for queued tasks.
///
/// Ordering is `Low < Normal < High`; the queue drains highest first, FIFO
/// within equal priority.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Normal => "normal",
            TaskPriority::High => "high",
        }
    }
}

impl std::str::FromStr for TaskPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(TaskPriority::Low),
            "normal" => Ok(TaskPriority::Normal),
            "high" => Ok(TaskPriority::High),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

/// Task lifecycle states.
///
/// `Pending → Running → {Completed, Failed, Cancelled}`, plus the direct
/// `Pending → Cancelled` edge for tasks cancelled before a worker picks
/// them up. The three right-hand states are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(format!("unknown status '{}'", other)),
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One asynchronous invocation and everything ever observed about it.
///
/// Invariants: `result` and `error` are mutually exclusive and both absent
/// while the status is non-terminal; `progress` is `1.0` exactly when the
/// status is terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: Uuid,
    pub tool: String,
    pub payload: Value,
    pub owner_id: String,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub progress: f64,
    pub result: Option<Value>,
    pub error: Option<TaskError>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancellation_requested: bool,
}

impl TaskRecord {
    pub fn new(
        tool: impl Into<String>,
        payload: Value,
        owner_id: impl Into<String>,
        priority: TaskPriority,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tool: tool.into(),
            payload,
            owner_id: owner_id.into(),
            priority,
            status: TaskStatus::Pending,
            progress: 0.0,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            cancellation_requested: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether the sweep may collect this record at `now`.
    ///
    /// Only terminal tasks expire; age is measured from `completed_at`, or
    /// from `created_at` for records that somehow never stamped one.
    pub fn expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        if !self.is_terminal() {
            return false;
        }
        let reference = self.completed_at.unwrap_or(self.created_at);
        match (now - reference).to_std() {
            Ok(age) => age > ttl,
            Err(_) => false,
        }
    }

    /// The owner-facing JSON view returned by the polling endpoint.
    pub fn view(&self) -> Value {
        serde_json::json!({
            "task_id": self.id,
            "tool": self.tool,
            "status": self.status,
            "progress": self.progress,
            "result": self.result,
            "error": self.error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_priority_ordering() {
        assert!(TaskPriority::High > TaskPriority::Normal);
        assert!(TaskPriority::Normal > TaskPriority::Low);
    }

    #[test]
    fn test_status_parse_round_trip() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_new_record_is_pending() {
        let record = TaskRecord::new("tool_a", json!({}), "user_1", TaskPriority::Normal);
        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(record.progress, 0.0);
        assert!(record.result.is_none());
        assert!(record.error.is_none());
        assert!(!record.cancellation_requested);
    }

    #[test]
    fn test_expiry_only_for_terminal() {
        let mut record = TaskRecord::new("tool_a", json!({}), "user_1", TaskPriority::Normal);
        record.created_at = Utc::now() - chrono::Duration::hours(48);
        // Old but still pending: never expires.
        assert!(!record.expired(Duration::from_secs(3600), Utc::now()));

        record.status = TaskStatus::Completed;
        record.completed_at = Some(Utc::now() - chrono::Duration::hours(2));
        assert!(record.expired(Duration::from_secs(3600), Utc::now()));
        assert!(!record.expired(Duration::from_secs(10 * 3600), Utc::now()));
    }

    #[test]
    fn test_view_shape() {
        let record = TaskRecord::new("tool_a", json!({"q": 1}), "user_1", TaskPriority::High);
        let view = record.view();
        assert_eq!(view["tool"], json!("tool_a"));
        assert_eq!(view["status"], json!("pending"));
        assert!(view.get("payload").is_none());
        assert!(view.get("owner_id").is_none());
    }
}
