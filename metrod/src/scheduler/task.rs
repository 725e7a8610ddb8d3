//! Task records and the task state machine.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::schedule::Schedule;
use crate::workflow::WorkflowMap;

/// Default deadline for a collect job (milliseconds).
pub const DEFAULT_DEADLINE_MS: u64 = 5_000;

/// Default consecutive-failure limit before a task is disabled.
pub const DEFAULT_STOP_ON_FAILURE: u32 = 3;

/// Task lifecycle state.
///
/// `Spinning` and `Firing` both render as "Running"; a firing can be
/// brief enough that exposing it as a distinct user-visible state is
/// just noise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Stopped,
    Spinning,
    Firing,
    Stopping,
    Ended,
    Disabled,
}

impl TaskState {
    /// User-facing name.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Stopped => "Stopped",
            TaskState::Spinning | TaskState::Firing => "Running",
            TaskState::Stopping => "Stopping",
            TaskState::Ended => "Ended",
            TaskState::Disabled => "Disabled",
        }
    }

    /// Whether the task is actively scheduled.
    pub fn is_running(&self) -> bool {
        matches!(self, TaskState::Spinning | TaskState::Firing | TaskState::Stopping)
    }

    /// States a task may be removed from.
    pub fn is_removable(&self) -> bool {
        matches!(self, TaskState::Stopped | TaskState::Disabled | TaskState::Ended)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A scheduled execution of a workflow, with counters.
///
/// The owning actor is the only writer; everything else sees snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub schedule: Schedule,
    pub workflow: WorkflowMap,
    /// Milliseconds a collect job may take before it is abandoned.
    pub deadline_ms: u64,
    /// Consecutive failures before the task disables itself.
    pub stop_on_failure: u32,
    pub state: TaskState,
    pub hit_count: u64,
    pub miss_count: u64,
    pub fail_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(name: Option<String>, schedule: Schedule, workflow: WorkflowMap) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let name = name.unwrap_or_else(|| format!("Task-{id}"));
        Self {
            id,
            name,
            schedule,
            workflow,
            deadline_ms: DEFAULT_DEADLINE_MS,
            stop_on_failure: DEFAULT_STOP_ON_FAILURE,
            state: TaskState::Stopped,
            hit_count: 0,
            miss_count: 0,
            fail_count: 0,
            last_failure: None,
            created_at: Utc::now(),
            last_run: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline_ms = deadline.as_millis() as u64;
        self
    }

    pub fn with_stop_on_failure(mut self, limit: u32) -> Self {
        self.stop_on_failure = limit;
        self
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn workflow() -> WorkflowMap {
        let mut metrics = BTreeMap::new();
        metrics.insert("/metro/mock/foo".to_string(), Default::default());
        WorkflowMap {
            collect: crate::workflow::CollectNode {
                metrics,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_new_task_defaults() {
        let task = Task::new(None, Schedule::simple(Duration::from_secs(1)), workflow());
        assert_eq!(task.state, TaskState::Stopped);
        assert_eq!(task.name, format!("Task-{}", task.id));
        assert_eq!(task.deadline(), Duration::from_millis(DEFAULT_DEADLINE_MS));
        assert_eq!(task.stop_on_failure, DEFAULT_STOP_ON_FAILURE);
        assert_eq!(task.hit_count + task.miss_count + task.fail_count, 0);
    }

    #[test]
    fn test_state_names_collapse_firing() {
        assert_eq!(TaskState::Spinning.as_str(), "Running");
        assert_eq!(TaskState::Firing.as_str(), "Running");
        assert_eq!(TaskState::Stopped.as_str(), "Stopped");
        assert_eq!(TaskState::Disabled.as_str(), "Disabled");
    }

    #[test]
    fn test_removable_states() {
        assert!(TaskState::Stopped.is_removable());
        assert!(TaskState::Disabled.is_removable());
        assert!(TaskState::Ended.is_removable());
        assert!(!TaskState::Spinning.is_removable());
        assert!(!TaskState::Firing.is_removable());
    }
}
