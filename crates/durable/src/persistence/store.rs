//! Storage contract for histories, tasks and timers

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::activity::ActivityError;
use crate::workflow::{ActivityOptions, HistoryEvent, WorkflowError, WorkflowEvent};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    #[error("workflow already exists: {0}")]
    WorkflowExists(Uuid),

    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    /// Someone appended to the history since it was loaded
    #[error("history moved: expected sequence {expected}, found {actual}")]
    ConcurrencyConflict { expected: i32, actual: i32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Created; `workflow_started` not yet processed
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// No further events will be accepted
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Claimed,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Queued or running
    pub fn is_live(self) -> bool {
        matches!(self, Self::Pending | Self::Claimed)
    }
}

/// A task as the executor hands it to the queue
#[derive(Debug, Clone)]
pub struct TaskDefinition {
    pub workflow_id: Uuid,
    pub activity_id: String,
    pub activity_type: String,
    pub input: Value,
    pub options: ActivityOptions,
}

/// A task leased to a worker for one attempt
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub activity_id: String,
    pub activity_type: String,
    pub input: Value,
    pub options: ActivityOptions,
    /// 1-based
    pub attempt: u32,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskFailureOutcome {
    /// Requeued; claimable again once `delay` has elapsed on the durable clock
    WillRetry { next_attempt: u32, delay: Duration },

    /// Final failure that must be reported to the workflow
    ExhaustedRetries,

    /// The task was cancelled while it ran, so its outcome is dropped
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueTimer {
    pub workflow_id: Uuid,
    pub timer_id: String,
    pub fire_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct WorkflowInfo {
    pub id: Uuid,
    pub workflow_type: String,
    pub status: WorkflowStatus,
    pub input: Value,
    pub result: Option<Value>,
    pub error: Option<WorkflowError>,
}

/// Workflow histories plus the task queue and timer wheel that feed them
///
/// Stores never read the wall clock. Every `now` or `recorded_at` argument
/// comes from the executor's durable clock, so a manual clock drives the
/// whole substrate in tests.
#[async_trait]
pub trait WorkflowEventStore: Send + Sync + 'static {
    async fn create_workflow(
        &self,
        workflow_id: Uuid,
        workflow_type: &str,
        input: Value,
    ) -> Result<(), StoreError>;

    async fn get_workflow_status(&self, workflow_id: Uuid) -> Result<WorkflowStatus, StoreError>;

    async fn get_workflow_info(&self, workflow_id: Uuid) -> Result<WorkflowInfo, StoreError>;

    /// Append a batch if the history is still `expected_sequence` long
    ///
    /// Returns the sequence the next append must expect.
    async fn append_events(
        &self,
        workflow_id: Uuid,
        expected_sequence: i32,
        events: Vec<WorkflowEvent>,
        recorded_at: DateTime<Utc>,
    ) -> Result<i32, StoreError>;

    /// Full history in sequence order
    async fn load_events(&self, workflow_id: Uuid) -> Result<Vec<HistoryEvent>, StoreError>;

    async fn update_workflow_status(
        &self,
        workflow_id: Uuid,
        status: WorkflowStatus,
        result: Option<Value>,
        error: Option<WorkflowError>,
    ) -> Result<(), StoreError>;

    async fn enqueue_task(&self, task: TaskDefinition) -> Result<Uuid, StoreError>;

    /// Lease up to `max_tasks` tasks, oldest first
    ///
    /// An empty `activity_types` slice matches every type. Tasks waiting out
    /// a retry delay are skipped until `now` passes it.
    async fn claim_tasks(
        &self,
        worker_id: &str,
        activity_types: &[String],
        max_tasks: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ClaimedTask>, StoreError>;

    /// `false` when the task was cancelled mid-flight
    async fn complete_task(&self, task_id: Uuid) -> Result<bool, StoreError>;

    /// Requeue per the task's retry policy, or mark it failed
    async fn fail_task(
        &self,
        task_id: Uuid,
        error: &ActivityError,
        now: DateTime<Utc>,
    ) -> Result<TaskFailureOutcome, StoreError>;

    /// `true` if a live task existed for the activity
    async fn cancel_task(&self, workflow_id: Uuid, activity_id: &str) -> Result<bool, StoreError>;

    async fn is_task_cancelled(&self, task_id: Uuid) -> Result<bool, StoreError>;

    /// Tasks still queued or running
    async fn live_task_count(&self) -> Result<usize, StoreError>;

    /// Arm a timer, replacing one with the same id
    async fn schedule_timer(
        &self,
        workflow_id: Uuid,
        timer_id: &str,
        fire_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn cancel_timer(&self, workflow_id: Uuid, timer_id: &str) -> Result<bool, StoreError>;

    /// Remove every timer with `fire_at <= now`, earliest first
    async fn take_due_timers(&self, now: DateTime<Utc>) -> Result<Vec<DueTimer>, StoreError>;

    async fn next_timer_at(&self) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Drop all live tasks and armed timers of a workflow that just ended
    async fn cancel_workflow_work(&self, workflow_id: Uuid) -> Result<(), StoreError>;
}
