//! Activity worker
//!
//! Claims activity tasks, runs their handlers concurrently, and reports each
//! outcome back through the executor as soon as it finishes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use tokio::sync::{watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::activity::{kinds, ActivityContext, ActivityError, ActivityHandler, CancellationHandle};
use crate::engine::{ExecutorError, WorkflowExecutor};
use crate::persistence::{ClaimedTask, StoreError, TaskFailureOutcome, WorkflowEventStore};

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Unique worker ID
    pub worker_id: String,

    /// Maximum concurrent activity executions
    pub max_concurrency: usize,

    /// Sleep between polls when there is no work
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            max_concurrency: 10,
            poll_interval: Duration::from_millis(250),
        }
    }
}

impl WorkerConfig {
    /// Load from `WARDEN_WORKER_ID`, `WARDEN_MAX_CONCURRENCY` and
    /// `WARDEN_POLL_INTERVAL_MS`, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            worker_id: std::env::var("WARDEN_WORKER_ID").unwrap_or(defaults.worker_id),
            max_concurrency: std::env::var("WARDEN_MAX_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_concurrency)
                .max(1),
            poll_interval: std::env::var("WARDEN_POLL_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
        }
    }

    /// Set the worker ID
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    /// Set maximum concurrency
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    /// Set the idle poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Worker errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Executor error while reporting an outcome
    #[error("executor error: {0}")]
    Executor(#[from] ExecutorError),
}

/// Executes activity tasks for one executor
///
/// A concurrency slot is taken before a task is claimed, so the worker never
/// leases more tasks than it can run.
pub struct ActivityWorker<S: WorkflowEventStore> {
    executor: Arc<WorkflowExecutor<S>>,
    config: WorkerConfig,
    handlers: HashMap<String, Arc<dyn ActivityHandler>>,
    slots: Arc<Semaphore>,
    running: Arc<DashMap<Uuid, CancellationHandle>>,
    reported: Arc<Notify>,
}

type Attempt = JoinHandle<Result<Value, ActivityError>>;

impl<S: WorkflowEventStore> ActivityWorker<S> {
    /// Create a worker with no handlers
    pub fn new(executor: Arc<WorkflowExecutor<S>>, config: WorkerConfig) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        Self {
            executor,
            config,
            handlers: HashMap::new(),
            slots,
            running: Arc::new(DashMap::new()),
            reported: Arc::new(Notify::new()),
        }
    }

    /// Register an activity handler
    pub fn register(
        &mut self,
        activity_type: impl Into<String>,
        handler: Arc<dyn ActivityHandler>,
    ) {
        self.handlers.insert(activity_type.into(), handler);
    }

    /// Get the worker ID
    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Attempts started whose outcome is not yet reported
    pub fn in_flight(&self) -> usize {
        self.running.len()
    }

    /// Resolves once a dispatched attempt has reported since the last call
    pub async fn reported(&self) {
        self.reported.notified().await;
    }

    /// Claim and execute one batch of tasks, waiting for all of them
    ///
    /// Outcomes are reported in completion order. Returns the number of tasks
    /// handled; zero means the queue had nothing claimable. Nothing else
    /// progresses while the batch runs, which makes this the stepping
    /// primitive for manual-clock tests.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn run_once(&self) -> Result<usize, WorkerError> {
        let mut in_flight = FuturesUnordered::new();
        for (task, permit) in self.claim().await? {
            let attempt = self.start(&task, permit);
            in_flight.push(async move { (task, settle(attempt).await) });
        }

        let mut handled = 0;
        while let Some((task, outcome)) = in_flight.next().await {
            self.running.remove(&task.id);
            handled += 1;
            if let Err(e) = report(&self.executor, &task, outcome).await {
                error!(task_id = %task.id, activity_id = %task.activity_id, "failed to report outcome: {}", e);
            }
        }

        Ok(handled)
    }

    /// Claim tasks and hand each one to its own tokio task
    ///
    /// Returns as soon as the batch is started; every attempt reports its own
    /// outcome when it finishes, so timers keep firing while slow activities
    /// run.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn dispatch(&self) -> Result<usize, WorkerError> {
        let claimed = self.claim().await?;
        let started = claimed.len();
        for (task, permit) in claimed {
            let attempt = self.start(&task, permit);
            let executor = Arc::clone(&self.executor);
            let running = Arc::clone(&self.running);
            let reported = Arc::clone(&self.reported);
            tokio::spawn(async move {
                let outcome = settle(attempt).await;
                if let Err(e) = report(&executor, &task, outcome).await {
                    error!(task_id = %task.id, activity_id = %task.activity_id, "failed to report outcome: {}", e);
                }
                running.remove(&task.id);
                reported.notify_one();
            });
        }
        Ok(started)
    }

    /// Poll until `shutdown` flips to true
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), WorkerError> {
        info!(
            worker_id = %self.config.worker_id,
            max_concurrency = self.config.max_concurrency,
            "starting activity worker"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            if self.dispatch().await? > 0 {
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = self.reported() => {}
                _ = shutdown.changed() => {}
            }
        }

        self.cancel_running();
        info!(worker_id = %self.config.worker_id, "activity worker stopped");
        Ok(())
    }

    /// Flip the cancellation flag of every running activity
    pub fn cancel_running(&self) {
        for entry in self.running.iter() {
            entry.value().cancel();
        }
    }

    /// Lease as many tasks as there are free slots
    async fn claim(&self) -> Result<Vec<(ClaimedTask, OwnedSemaphorePermit)>, WorkerError> {
        let mut permits = Vec::new();
        while let Ok(permit) = Arc::clone(&self.slots).try_acquire_owned() {
            permits.push(permit);
        }
        if permits.is_empty() {
            return Ok(Vec::new());
        }

        let activity_types: Vec<String> = self.handlers.keys().cloned().collect();
        let now = self.executor.clock().now();
        let tasks = self
            .executor
            .store()
            .claim_tasks(&self.config.worker_id, &activity_types, permits.len(), now)
            .await?;
        if !tasks.is_empty() {
            debug!(count = tasks.len(), "claimed tasks");
        }
        // Unused permits drop here
        Ok(tasks.into_iter().zip(permits).collect())
    }

    /// Spawn one attempt; the slot is released when the handler returns
    fn start(&self, task: &ClaimedTask, permit: OwnedSemaphorePermit) -> Attempt {
        let handler = self.handlers.get(&task.activity_type).cloned();
        let ctx = ActivityContext::new(task.id, task.workflow_id, &task.activity_id, task.attempt);
        self.running.insert(task.id, ctx.cancellation_handle());

        let timeout = task.options.start_to_close_timeout;
        let input = task.input.clone();
        let activity_type = task.activity_type.clone();

        tokio::spawn(async move {
            let _permit = permit;
            let Some(handler) = handler else {
                return Err(ActivityError::non_retryable(format!(
                    "no handler registered for activity type: {activity_type}"
                ))
                .with_type(kinds::HANDLER_NOT_FOUND));
            };

            match tokio::time::timeout(timeout, handler.execute(&ctx, input)).await {
                Ok(result) => result,
                Err(_) => Err(ActivityError::retryable(format!(
                    "activity exceeded {}ms",
                    timeout.as_millis()
                ))
                .with_type(kinds::START_TO_CLOSE_TIMEOUT)),
            }
        })
    }
}

async fn settle(attempt: Attempt) -> Result<Value, ActivityError> {
    match attempt.await {
        Ok(outcome) => outcome,
        Err(e) => Err(ActivityError::non_retryable(format!("activity panicked: {e}"))
            .with_type(kinds::PANIC)),
    }
}

async fn report<S: WorkflowEventStore>(
    executor: &WorkflowExecutor<S>,
    task: &ClaimedTask,
    outcome: Result<Value, ActivityError>,
) -> Result<(), WorkerError> {
    let store = executor.store();

    match outcome {
        Ok(result) => {
            if !store.complete_task(task.id).await? {
                debug!(task_id = %task.id, "task was cancelled, discarding result");
                return Ok(());
            }
            executor
                .on_activity_completed(task.workflow_id, &task.activity_id, result)
                .await?;
        }
        Err(error) => {
            let now = executor.clock().now();
            match store.fail_task(task.id, &error, now).await? {
                TaskFailureOutcome::WillRetry {
                    next_attempt,
                    delay,
                } => {
                    warn!(
                        task_id = %task.id,
                        activity_id = %task.activity_id,
                        next_attempt,
                        delay_ms = delay.as_millis() as u64,
                        "activity failed, will be redelivered: {}",
                        error
                    );
                }
                TaskFailureOutcome::ExhaustedRetries => {
                    executor
                        .on_activity_failed(task.workflow_id, &task.activity_id, error)
                        .await?;
                }
                TaskFailureOutcome::Cancelled => {
                    debug!(task_id = %task.id, "task was cancelled, discarding failure");
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::persistence::{InMemoryWorkflowEventStore, WorkflowStatus};
    use crate::reliability::RetryPolicy;
    use crate::workflow::{
        ActivityOptions, Workflow, WorkflowAction, WorkflowContext, WorkflowError,
    };
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Schedules `count` activities and completes with their results in
    /// arrival order.
    struct FanOut {
        count: usize,
        policy: RetryPolicy,
        arrived: Vec<Value>,
    }

    impl Workflow for FanOut {
        fn workflow_type(&self) -> &str {
            "fan_out"
        }

        fn on_start(&mut self, _ctx: &WorkflowContext) -> Vec<WorkflowAction> {
            (0..self.count)
                .map(|i| WorkflowAction::ScheduleActivity {
                    activity_id: format!("a{i}"),
                    activity_type: "sleepy".to_string(),
                    input: json!({ "index": i, "count": self.count }),
                    options: ActivityOptions::default().with_retry(self.policy.clone()),
                })
                .collect()
        }

        fn on_activity_completed(
            &mut self,
            _ctx: &WorkflowContext,
            _activity_id: &str,
            result: Value,
        ) -> Vec<WorkflowAction> {
            self.arrived.push(result);
            if self.arrived.len() == self.count {
                vec![WorkflowAction::complete(Value::Array(self.arrived.clone()))]
            } else {
                vec![]
            }
        }

        fn on_activity_failed(
            &mut self,
            _ctx: &WorkflowContext,
            _activity_id: &str,
            error: &ActivityError,
        ) -> Vec<WorkflowAction> {
            vec![WorkflowAction::fail(WorkflowError::new(error.to_string()))]
        }
    }

    /// Later indexes finish first
    struct Sleepy;

    #[async_trait]
    impl ActivityHandler for Sleepy {
        async fn execute(
            &self,
            _ctx: &ActivityContext,
            input: Value,
        ) -> Result<Value, ActivityError> {
            let index = input["index"].as_u64().unwrap_or(0);
            let count = input["count"].as_u64().unwrap_or(1);
            tokio::time::sleep(Duration::from_millis((count - index) * 20)).await;
            Ok(json!(index))
        }
    }

    /// Fails until the third attempt
    struct Flaky {
        calls: AtomicU32,
    }

    #[async_trait]
    impl ActivityHandler for Flaky {
        async fn execute(
            &self,
            ctx: &ActivityContext,
            _input: Value,
        ) -> Result<Value, ActivityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if ctx.attempt < 3 {
                Err(ActivityError::retryable("upstream 503"))
            } else {
                Ok(json!(ctx.attempt))
            }
        }
    }

    fn executor(
        count: usize,
        policy: RetryPolicy,
    ) -> Arc<WorkflowExecutor<InMemoryWorkflowEventStore>> {
        let store = Arc::new(InMemoryWorkflowEventStore::new());
        let clock = Arc::new(ManualClock::at("2024-05-01T12:00:00Z".parse().unwrap()));
        let mut executor = WorkflowExecutor::new(store, clock);
        executor.register("fan_out", move |_| {
            Ok(Box::new(FanOut {
                count,
                policy: policy.clone(),
                arrived: vec![],
            }) as Box<dyn Workflow>)
        });
        Arc::new(executor)
    }

    #[tokio::test]
    async fn test_outcomes_reported_in_completion_order() {
        let executor = executor(3, RetryPolicy::no_retry());
        let mut worker = ActivityWorker::new(executor.clone(), WorkerConfig::default());
        worker.register("sleepy", Arc::new(Sleepy));

        let id = executor.start_workflow("fan_out", json!({})).await.unwrap();
        let handled = worker.run_once().await.unwrap();
        assert_eq!(handled, 3);

        let info = executor.workflow_info(id).await.unwrap();
        assert_eq!(info.status, WorkflowStatus::Completed);
        assert_eq!(info.result, Some(json!([2, 1, 0])));
    }

    #[tokio::test]
    async fn test_substrate_redelivery() {
        let executor = executor(1, RetryPolicy::fixed(Duration::ZERO, 3));
        let flaky = Arc::new(Flaky {
            calls: AtomicU32::new(0),
        });
        let mut worker = ActivityWorker::new(executor.clone(), WorkerConfig::default());
        worker.register("sleepy", flaky.clone());

        let id = executor.start_workflow("fan_out", json!({})).await.unwrap();
        while worker.run_once().await.unwrap() > 0 {}

        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
        let info = executor.workflow_info(id).await.unwrap();
        assert_eq!(info.result, Some(json!([3])));
    }

    #[tokio::test]
    async fn test_missing_handler_fails_workflow() {
        let executor = executor(1, RetryPolicy::exponential());
        let worker = ActivityWorker::new(executor.clone(), WorkerConfig::default());

        let id = executor.start_workflow("fan_out", json!({})).await.unwrap();
        worker.run_once().await.unwrap();

        let info = executor.workflow_info(id).await.unwrap();
        assert_eq!(info.status, WorkflowStatus::Failed);
        assert!(info.error.unwrap().message.contains("HandlerNotFound"));
    }

    #[tokio::test]
    async fn test_dispatch_does_not_wait_for_attempts() {
        let executor = executor(3, RetryPolicy::no_retry());
        let config = WorkerConfig::default().with_max_concurrency(2);
        let mut worker = ActivityWorker::new(executor.clone(), config);
        worker.register("sleepy", Arc::new(Sleepy));

        let id = executor.start_workflow("fan_out", json!({})).await.unwrap();
        assert_eq!(worker.dispatch().await.unwrap(), 2);
        assert_eq!(worker.in_flight(), 2);
        // Both slots are busy
        assert_eq!(worker.dispatch().await.unwrap(), 0);
        assert_ne!(executor.status(id).await.unwrap(), WorkflowStatus::Completed);

        for _ in 0..200 {
            worker.dispatch().await.unwrap();
            let status = executor.status(id).await.unwrap();
            if status == WorkflowStatus::Completed && worker.in_flight() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(worker.in_flight(), 0);
        let info = executor.workflow_info(id).await.unwrap();
        assert_eq!(info.status, WorkflowStatus::Completed);
        assert_eq!(info.result.unwrap().as_array().unwrap().len(), 3);
    }

    #[test]
    fn test_worker_config_builders() {
        let config = WorkerConfig::default()
            .with_worker_id("w-1")
            .with_max_concurrency(0)
            .with_poll_interval(Duration::from_millis(5));
        assert_eq!(config.worker_id, "w-1");
        assert_eq!(config.max_concurrency, 1);
        assert_eq!(config.poll_interval, Duration::from_millis(5));
    }
}
