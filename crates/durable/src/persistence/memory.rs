//! In-memory implementation of WorkflowEventStore

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;
use crate::activity::ActivityError;
use crate::workflow::{HistoryEvent, WorkflowError, WorkflowEvent};

/// Internal workflow state
struct WorkflowState {
    workflow_type: String,
    status: WorkflowStatus,
    input: serde_json::Value,
    result: Option<serde_json::Value>,
    error: Option<WorkflowError>,
    events: Vec<HistoryEvent>,
}

/// Internal task state
struct TaskState {
    definition: TaskDefinition,
    status: TaskStatus,
    attempt: u32,
    available_at: Option<DateTime<Utc>>,
    error_history: Vec<String>,
}

/// Tasks keyed by id, remembered in enqueue order
#[derive(Default)]
struct TaskQueue {
    order: Vec<Uuid>,
    tasks: HashMap<Uuid, TaskState>,
}

/// An armed timer; `seq` breaks ties between equal fire times
struct TimerState {
    fire_at: DateTime<Utc>,
    seq: u64,
}

#[derive(Default)]
struct TimerTable {
    next_seq: u64,
    armed: HashMap<(Uuid, String), TimerState>,
}

/// In-memory implementation of WorkflowEventStore
///
/// Used by the CLI and by tests. Claim order is FIFO and due timers are
/// returned in fire order, so a single worker drives runs deterministically.
///
/// # Example
///
/// ```
/// use warden_durable::InMemoryWorkflowEventStore;
///
/// let store = InMemoryWorkflowEventStore::new();
/// assert_eq!(store.workflow_count(), 0);
/// ```
pub struct InMemoryWorkflowEventStore {
    workflows: RwLock<HashMap<Uuid, WorkflowState>>,
    queue: RwLock<TaskQueue>,
    timers: RwLock<TimerTable>,
}

impl InMemoryWorkflowEventStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            workflows: RwLock::new(HashMap::new()),
            queue: RwLock::new(TaskQueue::default()),
            timers: RwLock::new(TimerTable::default()),
        }
    }

    /// Get the number of workflows
    pub fn workflow_count(&self) -> usize {
        self.workflows.read().len()
    }

    /// Get the number of pending tasks
    pub fn pending_task_count(&self) -> usize {
        self.queue
            .read()
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .count()
    }

    /// Get the number of armed timers
    pub fn armed_timer_count(&self) -> usize {
        self.timers.read().armed.len()
    }

    /// Errors recorded against a task, oldest first
    pub fn task_errors(&self, task_id: Uuid) -> Vec<String> {
        self.queue
            .read()
            .tasks
            .get(&task_id)
            .map(|t| t.error_history.clone())
            .unwrap_or_default()
    }
}

impl Default for InMemoryWorkflowEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowEventStore for InMemoryWorkflowEventStore {
    async fn create_workflow(
        &self,
        workflow_id: Uuid,
        workflow_type: &str,
        input: serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut workflows = self.workflows.write();
        if workflows.contains_key(&workflow_id) {
            return Err(StoreError::WorkflowExists(workflow_id));
        }
        workflows.insert(
            workflow_id,
            WorkflowState {
                workflow_type: workflow_type.to_string(),
                status: WorkflowStatus::Pending,
                input,
                result: None,
                error: None,
                events: vec![],
            },
        );
        Ok(())
    }

    async fn get_workflow_status(&self, workflow_id: Uuid) -> Result<WorkflowStatus, StoreError> {
        let workflows = self.workflows.read();
        workflows
            .get(&workflow_id)
            .map(|w| w.status)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))
    }

    async fn get_workflow_info(&self, workflow_id: Uuid) -> Result<WorkflowInfo, StoreError> {
        let workflows = self.workflows.read();
        let workflow = workflows
            .get(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;

        Ok(WorkflowInfo {
            id: workflow_id,
            workflow_type: workflow.workflow_type.clone(),
            status: workflow.status,
            input: workflow.input.clone(),
            result: workflow.result.clone(),
            error: workflow.error.clone(),
        })
    }

    async fn append_events(
        &self,
        workflow_id: Uuid,
        expected_sequence: i32,
        events: Vec<WorkflowEvent>,
        recorded_at: DateTime<Utc>,
    ) -> Result<i32, StoreError> {
        let mut workflows = self.workflows.write();
        let workflow = workflows
            .get_mut(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;

        let current_sequence = workflow.events.len() as i32;
        if current_sequence != expected_sequence {
            return Err(StoreError::ConcurrencyConflict {
                expected: expected_sequence,
                actual: current_sequence,
            });
        }

        for (offset, event) in events.into_iter().enumerate() {
            workflow.events.push(HistoryEvent {
                sequence: current_sequence + offset as i32,
                recorded_at,
                event,
            });
        }
        Ok(workflow.events.len() as i32)
    }

    async fn load_events(&self, workflow_id: Uuid) -> Result<Vec<HistoryEvent>, StoreError> {
        let workflows = self.workflows.read();
        let workflow = workflows
            .get(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;

        Ok(workflow.events.clone())
    }

    async fn update_workflow_status(
        &self,
        workflow_id: Uuid,
        status: WorkflowStatus,
        result: Option<serde_json::Value>,
        error: Option<WorkflowError>,
    ) -> Result<(), StoreError> {
        let mut workflows = self.workflows.write();
        let workflow = workflows
            .get_mut(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;

        workflow.status = status;
        workflow.result = result;
        workflow.error = error;
        Ok(())
    }

    async fn enqueue_task(&self, task: TaskDefinition) -> Result<Uuid, StoreError> {
        let task_id = Uuid::now_v7();
        let mut queue = self.queue.write();
        queue.order.push(task_id);
        queue.tasks.insert(
            task_id,
            TaskState {
                definition: task,
                status: TaskStatus::Pending,
                attempt: 0,
                available_at: None,
                error_history: vec![],
            },
        );
        Ok(task_id)
    }

    async fn claim_tasks(
        &self,
        _worker_id: &str,
        activity_types: &[String],
        max_tasks: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ClaimedTask>, StoreError> {
        let mut guard = self.queue.write();
        let TaskQueue { order, tasks } = &mut *guard;
        let mut claimed = vec![];

        for task_id in order.iter() {
            if claimed.len() >= max_tasks {
                break;
            }
            let Some(task) = tasks.get_mut(task_id) else {
                continue;
            };

            let type_matches = activity_types.is_empty()
                || activity_types.contains(&task.definition.activity_type);
            let available = task.available_at.map_or(true, |at| at <= now);

            if task.status == TaskStatus::Pending && type_matches && available {
                task.status = TaskStatus::Claimed;
                task.attempt += 1;

                claimed.push(ClaimedTask {
                    id: *task_id,
                    workflow_id: task.definition.workflow_id,
                    activity_id: task.definition.activity_id.clone(),
                    activity_type: task.definition.activity_type.clone(),
                    input: task.definition.input.clone(),
                    options: task.definition.options.clone(),
                    attempt: task.attempt,
                    max_attempts: task.definition.options.retry_policy.max_attempts,
                });
            }
        }

        // Finished tasks no longer need ordering
        order.retain(|id| {
            tasks
                .get(id)
                .is_some_and(|t| t.status.is_live())
        });

        Ok(claimed)
    }

    async fn complete_task(&self, task_id: Uuid) -> Result<bool, StoreError> {
        let mut queue = self.queue.write();
        let task = queue
            .tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;

        if task.status == TaskStatus::Cancelled {
            return Ok(false);
        }
        task.status = TaskStatus::Completed;
        Ok(true)
    }

    async fn fail_task(
        &self,
        task_id: Uuid,
        error: &ActivityError,
        now: DateTime<Utc>,
    ) -> Result<TaskFailureOutcome, StoreError> {
        let mut queue = self.queue.write();
        let task = queue
            .tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;

        task.error_history.push(error.to_string());

        if task.status == TaskStatus::Cancelled {
            return Ok(TaskFailureOutcome::Cancelled);
        }

        let policy = &task.definition.options.retry_policy;
        if error.retryable && policy.has_attempts_remaining(task.attempt) {
            let next_attempt = task.attempt + 1;
            let delay = policy.delay_for_attempt(next_attempt);
            let delay_chrono =
                chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());

            task.status = TaskStatus::Pending;
            task.available_at = Some(now + delay_chrono);

            Ok(TaskFailureOutcome::WillRetry {
                next_attempt,
                delay,
            })
        } else {
            task.status = TaskStatus::Failed;
            Ok(TaskFailureOutcome::ExhaustedRetries)
        }
    }

    async fn cancel_task(&self, workflow_id: Uuid, activity_id: &str) -> Result<bool, StoreError> {
        let mut queue = self.queue.write();
        let mut found = false;
        for task in queue.tasks.values_mut() {
            if task.definition.workflow_id == workflow_id
                && task.definition.activity_id == activity_id
                && task.status.is_live()
            {
                task.status = TaskStatus::Cancelled;
                found = true;
            }
        }
        Ok(found)
    }

    async fn is_task_cancelled(&self, task_id: Uuid) -> Result<bool, StoreError> {
        let queue = self.queue.read();
        queue
            .tasks
            .get(&task_id)
            .map(|t| t.status == TaskStatus::Cancelled)
            .ok_or(StoreError::TaskNotFound(task_id))
    }

    async fn live_task_count(&self) -> Result<usize, StoreError> {
        Ok(self
            .queue
            .read()
            .tasks
            .values()
            .filter(|t| t.status.is_live())
            .count())
    }

    async fn schedule_timer(
        &self,
        workflow_id: Uuid,
        timer_id: &str,
        fire_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut timers = self.timers.write();
        let seq = timers.next_seq;
        timers.next_seq += 1;
        timers
            .armed
            .insert((workflow_id, timer_id.to_string()), TimerState { fire_at, seq });
        Ok(())
    }

    async fn cancel_timer(&self, workflow_id: Uuid, timer_id: &str) -> Result<bool, StoreError> {
        let mut timers = self.timers.write();
        Ok(timers
            .armed
            .remove(&(workflow_id, timer_id.to_string()))
            .is_some())
    }

    async fn take_due_timers(&self, now: DateTime<Utc>) -> Result<Vec<DueTimer>, StoreError> {
        let mut timers = self.timers.write();

        let mut due: Vec<((Uuid, String), DateTime<Utc>, u64)> = timers
            .armed
            .iter()
            .filter(|(_, t)| t.fire_at <= now)
            .map(|(key, t)| (key.clone(), t.fire_at, t.seq))
            .collect();
        due.sort_by(|a, b| (a.1, a.2).cmp(&(b.1, b.2)));

        Ok(due
            .into_iter()
            .map(|(key, fire_at, _)| {
                timers.armed.remove(&key);
                DueTimer {
                    workflow_id: key.0,
                    timer_id: key.1,
                    fire_at,
                }
            })
            .collect())
    }

    async fn next_timer_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.timers.read().armed.values().map(|t| t.fire_at).min())
    }

    async fn cancel_workflow_work(&self, workflow_id: Uuid) -> Result<(), StoreError> {
        {
            let mut queue = self.queue.write();
            for task in queue.tasks.values_mut() {
                if task.definition.workflow_id == workflow_id
                    && task.status.is_live()
                {
                    task.status = TaskStatus::Cancelled;
                }
            }
        }
        self.timers
            .write()
            .armed
            .retain(|(wf, _), _| *wf != workflow_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reliability::RetryPolicy;
    use crate::workflow::ActivityOptions;
    use std::time::Duration;

    fn t0() -> DateTime<Utc> {
        "2024-05-01T12:00:00Z".parse().unwrap()
    }

    fn task(workflow_id: Uuid, activity_id: &str, options: ActivityOptions) -> TaskDefinition {
        TaskDefinition {
            workflow_id,
            activity_id: activity_id.to_string(),
            activity_type: "run_action".to_string(),
            input: serde_json::json!({}),
            options,
        }
    }

    #[tokio::test]
    async fn test_create_and_get_workflow() {
        let store = InMemoryWorkflowEventStore::new();
        let workflow_id = Uuid::now_v7();

        store
            .create_workflow(workflow_id, "test_workflow", serde_json::json!({"key": "value"}))
            .await
            .unwrap();

        let status = store.get_workflow_status(workflow_id).await.unwrap();
        assert_eq!(status, WorkflowStatus::Pending);

        let again = store
            .create_workflow(workflow_id, "test_workflow", serde_json::json!({}))
            .await;
        assert!(matches!(again, Err(StoreError::WorkflowExists(_))));
    }

    #[tokio::test]
    async fn test_append_and_load_events() {
        let store = InMemoryWorkflowEventStore::new();
        let workflow_id = Uuid::now_v7();

        store
            .create_workflow(workflow_id, "test", serde_json::json!({}))
            .await
            .unwrap();

        let seq = store
            .append_events(
                workflow_id,
                0,
                vec![WorkflowEvent::WorkflowStarted {
                    input: serde_json::json!({}),
                }],
                t0(),
            )
            .await
            .unwrap();
        assert_eq!(seq, 1);

        let later = t0() + chrono::Duration::seconds(5);
        let seq = store
            .append_events(
                workflow_id,
                1,
                vec![WorkflowEvent::TimerFired {
                    timer_id: "t".to_string(),
                }],
                later,
            )
            .await
            .unwrap();
        assert_eq!(seq, 2);

        let events = store.load_events(workflow_id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].sequence, 0);
        assert_eq!(events[0].recorded_at, t0());
        assert_eq!(events[1].sequence, 1);
        assert_eq!(events[1].recorded_at, later);
    }

    #[tokio::test]
    async fn test_concurrency_conflict() {
        let store = InMemoryWorkflowEventStore::new();
        let workflow_id = Uuid::now_v7();

        store
            .create_workflow(workflow_id, "test", serde_json::json!({}))
            .await
            .unwrap();

        let result = store
            .append_events(
                workflow_id,
                5,
                vec![WorkflowEvent::WorkflowStarted {
                    input: serde_json::json!({}),
                }],
                t0(),
            )
            .await;

        assert!(matches!(
            result,
            Err(StoreError::ConcurrencyConflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_claims_are_fifo() {
        let store = InMemoryWorkflowEventStore::new();
        let workflow_id = Uuid::now_v7();

        let mut ids = vec![];
        for i in 0..5 {
            ids.push(
                store
                    .enqueue_task(task(workflow_id, &format!("a{i}"), ActivityOptions::default()))
                    .await
                    .unwrap(),
            );
        }

        let first = store.claim_tasks("w", &[], 3, t0()).await.unwrap();
        let second = store.claim_tasks("w", &[], 3, t0()).await.unwrap();

        let claimed: Vec<Uuid> = first.iter().chain(second.iter()).map(|t| t.id).collect();
        assert_eq!(claimed, ids);
    }

    #[tokio::test]
    async fn test_task_lifecycle() {
        let store = InMemoryWorkflowEventStore::new();
        let workflow_id = Uuid::now_v7();

        let task_id = store
            .enqueue_task(task(workflow_id, "step-1", ActivityOptions::default()))
            .await
            .unwrap();
        assert_eq!(store.pending_task_count(), 1);

        let claimed = store
            .claim_tasks("worker-1", &["run_action".to_string()], 1, t0())
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, task_id);
        assert_eq!(claimed[0].attempt, 1);

        assert!(store.complete_task(task_id).await.unwrap());
        assert_eq!(store.pending_task_count(), 0);
        assert_eq!(store.live_task_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_task_retry_respects_delay() {
        let store = InMemoryWorkflowEventStore::new();
        let workflow_id = Uuid::now_v7();

        let options = ActivityOptions::default()
            .with_retry(RetryPolicy::fixed(Duration::from_secs(10), 3));
        let task_id = store
            .enqueue_task(task(workflow_id, "step-1", options))
            .await
            .unwrap();

        store.claim_tasks("worker-1", &[], 1, t0()).await.unwrap();

        let outcome = store
            .fail_task(task_id, &ActivityError::retryable("error 1"), t0())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            TaskFailureOutcome::WillRetry {
                next_attempt: 2,
                delay: Duration::from_secs(10)
            }
        );

        assert!(store.claim_tasks("w", &[], 1, t0()).await.unwrap().is_empty());
        let later = t0() + chrono::Duration::seconds(10);
        let claimed = store.claim_tasks("w", &[], 1, later).await.unwrap();
        assert_eq!(claimed[0].attempt, 2);
        assert_eq!(store.task_errors(task_id), vec!["error 1".to_string()]);
    }

    #[tokio::test]
    async fn test_non_retryable_failure_exhausts_immediately() {
        let store = InMemoryWorkflowEventStore::new();
        let options = ActivityOptions::default().with_retry(RetryPolicy::exponential());
        let task_id = store
            .enqueue_task(task(Uuid::now_v7(), "step-1", options))
            .await
            .unwrap();
        store.claim_tasks("w", &[], 1, t0()).await.unwrap();

        let outcome = store
            .fail_task(task_id, &ActivityError::non_retryable("bad"), t0())
            .await
            .unwrap();
        assert_eq!(outcome, TaskFailureOutcome::ExhaustedRetries);
    }

    #[tokio::test]
    async fn test_cancelled_task_discards_result() {
        let store = InMemoryWorkflowEventStore::new();
        let workflow_id = Uuid::now_v7();
        let task_id = store
            .enqueue_task(task(workflow_id, "step-1", ActivityOptions::default()))
            .await
            .unwrap();
        store.claim_tasks("w", &[], 1, t0()).await.unwrap();

        assert!(store.cancel_task(workflow_id, "step-1").await.unwrap());
        assert!(store.is_task_cancelled(task_id).await.unwrap());
        assert!(!store.complete_task(task_id).await.unwrap());
        assert!(!store.cancel_task(workflow_id, "step-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_due_timers_in_fire_order() {
        let store = InMemoryWorkflowEventStore::new();
        let workflow_id = Uuid::now_v7();

        store
            .schedule_timer(workflow_id, "late", t0() + chrono::Duration::seconds(30))
            .await
            .unwrap();
        store
            .schedule_timer(workflow_id, "early", t0() + chrono::Duration::seconds(10))
            .await
            .unwrap();
        store
            .schedule_timer(workflow_id, "future", t0() + chrono::Duration::hours(1))
            .await
            .unwrap();

        assert_eq!(
            store.next_timer_at().await.unwrap(),
            Some(t0() + chrono::Duration::seconds(10))
        );

        let due = store
            .take_due_timers(t0() + chrono::Duration::minutes(1))
            .await
            .unwrap();
        let ids: Vec<&str> = due.iter().map(|t| t.timer_id.as_str()).collect();
        assert_eq!(ids, vec!["early", "late"]);
        assert_eq!(store.armed_timer_count(), 1);
    }

    #[tokio::test]
    async fn test_cancel_workflow_work() {
        let store = InMemoryWorkflowEventStore::new();
        let workflow_id = Uuid::now_v7();
        store
            .enqueue_task(task(workflow_id, "a", ActivityOptions::default()))
            .await
            .unwrap();
        store.schedule_timer(workflow_id, "t", t0()).await.unwrap();
        assert!(!store.cancel_timer(workflow_id, "missing").await.unwrap());

        store.cancel_workflow_work(workflow_id).await.unwrap();

        assert_eq!(store.live_task_count().await.unwrap(), 0);
        assert_eq!(store.armed_timer_count(), 0);
    }
}
