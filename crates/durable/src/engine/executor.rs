//! Workflow executor with replay support
//!
//! The `WorkflowExecutor` is responsible for:
//! - Starting new workflows
//! - Rebuilding workflow state by replaying event history
//! - Recording each incoming event and applying it to the rebuilt instance
//! - Persisting the resulting actions (tasks, timers, terminal state)
//! - Routing signals, updates, and queries

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

use crate::activity::ActivityError;
use crate::clock::DurableClock;
use crate::persistence::{
    StoreError, TaskDefinition, WorkflowEventStore, WorkflowInfo, WorkflowStatus,
};
use crate::workflow::{
    HistoryEvent, QueryError, UpdateRejected, Workflow, WorkflowAction, WorkflowContext,
    WorkflowError, WorkflowEvent, WorkflowSignal, WorkflowUpdate,
};

use super::registry::{RegistryError, WorkflowRegistry};

/// Held while one workflow is being changed
///
/// The map entry is dropped with the last holder, so the lock table only
/// tracks workflows with work in progress.
struct WorkflowLock<'a> {
    locks: &'a DashMap<Uuid, Arc<Mutex<()>>>,
    workflow_id: Uuid,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for WorkflowLock<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .remove_if(&self.workflow_id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

/// Configuration for the workflow executor
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum events per workflow (for safety)
    pub max_events_per_workflow: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_events_per_workflow: 10_000,
        }
    }
}

impl ExecutorConfig {
    /// Load from `WARDEN_MAX_EVENTS`, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_events_per_workflow: std::env::var("WARDEN_MAX_EVENTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_events_per_workflow),
        }
    }
}

/// Errors from executor operations
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Registry error
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Workflow already completed
    #[error("workflow {0} already completed")]
    WorkflowCompleted(Uuid),

    /// Replay error (history does not fit the workflow)
    #[error("replay error: {0}")]
    ReplayError(String),

    /// Too many events
    #[error("workflow {0} has too many events ({1} > {2})")]
    TooManyEvents(Uuid, usize, usize),

    /// Update refused by the workflow's validator
    #[error("update rejected: {0}")]
    UpdateRejected(#[from] UpdateRejected),

    /// Query failed
    #[error(transparent)]
    Query(#[from] QueryError),
}

/// Result of delivering one event to a workflow
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProcessResult {
    /// Whether the workflow is now in a terminal state
    pub completed: bool,

    /// Number of new events written
    pub events_written: usize,

    /// Number of tasks enqueued
    pub tasks_enqueued: usize,

    /// Number of timers armed
    pub timers_started: usize,
}

/// Workflow executor
///
/// Every delivery follows the same path under a per-workflow lock: load
/// history, replay it into a fresh instance (discarding actions), append the
/// new event stamped with the durable clock, apply it, then persist the
/// actions it produced. Deliveries to a terminal workflow are inert.
///
/// # Example
///
/// ```ignore
/// let store = Arc::new(InMemoryWorkflowEventStore::new());
/// let mut executor = WorkflowExecutor::new(store, Arc::new(SystemClock));
/// executor.register("triage", |input| Ok(Box::new(Triage::new(input)?) as Box<dyn Workflow>));
///
/// let workflow_id = executor.start_workflow("triage", input).await?;
/// ```
pub struct WorkflowExecutor<S: WorkflowEventStore> {
    store: Arc<S>,
    registry: WorkflowRegistry,
    clock: Arc<dyn DurableClock>,
    config: ExecutorConfig,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl<S: WorkflowEventStore> WorkflowExecutor<S> {
    /// Create a new executor with the given store and clock
    pub fn new(store: Arc<S>, clock: Arc<dyn DurableClock>) -> Self {
        Self::with_config(store, clock, ExecutorConfig::default())
    }

    /// Create a new executor with custom config
    pub fn with_config(
        store: Arc<S>,
        clock: Arc<dyn DurableClock>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            store,
            registry: WorkflowRegistry::new(),
            clock,
            config,
            locks: DashMap::new(),
        }
    }

    /// Register a workflow type
    pub fn register<F>(&mut self, workflow_type: impl Into<String>, factory: F)
    where
        F: Fn(Value) -> Result<Box<dyn Workflow>, WorkflowError> + Send + Sync + 'static,
    {
        let workflow_type = workflow_type.into();
        info!(%workflow_type, "registered workflow type");
        self.registry.register(workflow_type, factory);
    }

    /// Get a reference to the store
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Get the durable clock
    pub fn clock(&self) -> &Arc<dyn DurableClock> {
        &self.clock
    }

    /// Start a new workflow
    ///
    /// The instance is built before anything is persisted, so factory
    /// rejections leave no trace in the store.
    #[instrument(skip(self, input))]
    pub async fn start_workflow(
        &self,
        workflow_type: &str,
        input: Value,
    ) -> Result<Uuid, ExecutorError> {
        let mut workflow = self.registry.create(workflow_type, input.clone())?;
        let workflow_id = Uuid::now_v7();
        let _lock = self.lock(workflow_id).await;

        info!(%workflow_id, "starting new workflow");

        self.store
            .create_workflow(workflow_id, workflow_type, input.clone())
            .await?;

        let now = self.clock.now();
        let sequence = self
            .store
            .append_events(
                workflow_id,
                0,
                vec![WorkflowEvent::WorkflowStarted { input }],
                now,
            )
            .await?;
        self.store
            .update_workflow_status(workflow_id, WorkflowStatus::Running, None, None)
            .await?;

        let ctx = WorkflowContext::new(workflow_id, now, false);
        let actions = workflow.on_start(&ctx);
        self.process_actions(workflow_id, sequence, &ctx, actions)
            .await?;

        Ok(workflow_id)
    }

    /// Handle activity completion
    #[instrument(skip(self, result))]
    pub async fn on_activity_completed(
        &self,
        workflow_id: Uuid,
        activity_id: &str,
        result: Value,
    ) -> Result<ProcessResult, ExecutorError> {
        self.deliver(
            workflow_id,
            WorkflowEvent::ActivityCompleted {
                activity_id: activity_id.to_string(),
                result,
            },
        )
        .await
    }

    /// Handle final activity failure
    #[instrument(skip(self, error))]
    pub async fn on_activity_failed(
        &self,
        workflow_id: Uuid,
        activity_id: &str,
        error: ActivityError,
    ) -> Result<ProcessResult, ExecutorError> {
        self.deliver(
            workflow_id,
            WorkflowEvent::ActivityFailed {
                activity_id: activity_id.to_string(),
                error,
            },
        )
        .await
    }

    /// Handle timer fired
    #[instrument(skip(self))]
    pub async fn on_timer_fired(
        &self,
        workflow_id: Uuid,
        timer_id: &str,
    ) -> Result<ProcessResult, ExecutorError> {
        self.deliver(
            workflow_id,
            WorkflowEvent::TimerFired {
                timer_id: timer_id.to_string(),
            },
        )
        .await
    }

    /// Send a signal to a workflow
    #[instrument(skip(self, signal), fields(signal_type = %signal.signal_type))]
    pub async fn send_signal(
        &self,
        workflow_id: Uuid,
        signal: WorkflowSignal,
    ) -> Result<ProcessResult, ExecutorError> {
        let status = self.store.get_workflow_status(workflow_id).await?;
        if status.is_terminal() {
            warn!(%workflow_id, ?status, "cannot send signal to completed workflow");
            return Err(ExecutorError::WorkflowCompleted(workflow_id));
        }

        let result = self
            .deliver(workflow_id, WorkflowEvent::SignalReceived { signal })
            .await?;
        info!(%workflow_id, "signal delivered");
        Ok(result)
    }

    /// Submit an update and wait for its acknowledgment
    ///
    /// Rejected updates are not recorded. Resubmitting an accepted
    /// `update_id` returns the original ack without reapplying it.
    #[instrument(
        skip(self, update),
        fields(update_name = %update.name, update_id = %update.update_id)
    )]
    pub async fn update(
        &self,
        workflow_id: Uuid,
        update: WorkflowUpdate,
    ) -> Result<Value, ExecutorError> {
        let _lock = self.lock(workflow_id).await;

        let info = self.store.get_workflow_info(workflow_id).await?;
        if info.status.is_terminal() {
            return Err(ExecutorError::WorkflowCompleted(workflow_id));
        }

        let (mut workflow, history) = self.rebuild(&info).await?;

        let previous_ack = history.iter().find_map(|h| match &h.event {
            WorkflowEvent::UpdateAccepted { update_id, ack, .. }
                if *update_id == update.update_id =>
            {
                Some(ack.clone())
            }
            _ => None,
        });
        if let Some(ack) = previous_ack {
            debug!(%workflow_id, "duplicate update id, returning recorded ack");
            return Ok(ack);
        }

        if let Err(rejection) = workflow.validate_update(&update) {
            info!(%workflow_id, %rejection, "update rejected");
            return Err(rejection.into());
        }

        let now = self.clock.now();
        let ctx = WorkflowContext::new(workflow_id, now, false);
        let (ack, actions) = workflow.on_update(&ctx, &update);

        self.check_event_limit(workflow_id, history.len() + 1)?;
        let sequence = self
            .store
            .append_events(
                workflow_id,
                history.len() as i32,
                vec![WorkflowEvent::UpdateAccepted {
                    update_id: update.update_id,
                    name: update.name,
                    payload: update.payload,
                    ack: ack.clone(),
                }],
                now,
            )
            .await?;
        self.process_actions(workflow_id, sequence, &ctx, actions)
            .await?;

        Ok(ack)
    }

    /// Run a read-only query against rebuilt workflow state
    #[instrument(skip(self))]
    pub async fn query(&self, workflow_id: Uuid, name: &str) -> Result<Value, ExecutorError> {
        let _lock = self.lock(workflow_id).await;

        let info = self.store.get_workflow_info(workflow_id).await?;
        let (workflow, _) = self.rebuild(&info).await?;
        Ok(workflow.query(name)?)
    }

    /// Get the current workflow status
    pub async fn status(&self, workflow_id: Uuid) -> Result<WorkflowStatus, ExecutorError> {
        Ok(self.store.get_workflow_status(workflow_id).await?)
    }

    /// Get workflow info (status, result, error)
    pub async fn workflow_info(&self, workflow_id: Uuid) -> Result<WorkflowInfo, ExecutorError> {
        Ok(self.store.get_workflow_info(workflow_id).await?)
    }

    /// Load the full event history
    pub async fn history(&self, workflow_id: Uuid) -> Result<Vec<HistoryEvent>, ExecutorError> {
        Ok(self.store.load_events(workflow_id).await?)
    }

    // =========================================================================
    // Internal Methods
    // =========================================================================

    /// Serialize work on one workflow
    async fn lock(&self, workflow_id: Uuid) -> WorkflowLock<'_> {
        let mutex = self.locks.entry(workflow_id).or_default().clone();
        WorkflowLock {
            locks: &self.locks,
            workflow_id,
            guard: Some(mutex.lock_owned().await),
        }
    }

    fn check_event_limit(&self, workflow_id: Uuid, count: usize) -> Result<(), ExecutorError> {
        if count > self.config.max_events_per_workflow {
            return Err(ExecutorError::TooManyEvents(
                workflow_id,
                count,
                self.config.max_events_per_workflow,
            ));
        }
        Ok(())
    }

    /// Record one event and apply it to the rebuilt workflow
    async fn deliver(
        &self,
        workflow_id: Uuid,
        event: WorkflowEvent,
    ) -> Result<ProcessResult, ExecutorError> {
        let _lock = self.lock(workflow_id).await;

        let info = self.store.get_workflow_info(workflow_id).await?;
        if info.status.is_terminal() {
            debug!(%workflow_id, status = ?info.status, "workflow already in terminal state");
            return Ok(ProcessResult {
                completed: true,
                ..Default::default()
            });
        }

        let (mut workflow, history) = self.rebuild(&info).await?;
        self.check_event_limit(workflow_id, history.len() + 1)?;

        let now = self.clock.now();
        let sequence = self
            .store
            .append_events(workflow_id, history.len() as i32, vec![event.clone()], now)
            .await?;
        trace!(%workflow_id, sequence, event = event.name(), "event recorded");

        let ctx = WorkflowContext::new(workflow_id, now, false);
        let actions = apply_event(&mut *workflow, &ctx, &event);

        let mut result = self
            .process_actions(workflow_id, sequence, &ctx, actions)
            .await?;
        result.events_written += 1;
        Ok(result)
    }

    /// Build a fresh instance and replay history into it
    async fn rebuild(
        &self,
        info: &WorkflowInfo,
    ) -> Result<(Box<dyn Workflow>, Vec<HistoryEvent>), ExecutorError> {
        let history = self.store.load_events(info.id).await?;

        match history.first() {
            Some(HistoryEvent {
                event: WorkflowEvent::WorkflowStarted { .. },
                ..
            }) => {}
            _ => {
                return Err(ExecutorError::ReplayError(
                    "first event must be WorkflowStarted".to_string(),
                ))
            }
        }

        let mut workflow = self
            .registry
            .create(&info.workflow_type, info.input.clone())?;

        for entry in &history {
            let ctx = WorkflowContext::new(info.id, entry.recorded_at, true);
            let _actions = apply_event(&mut *workflow, &ctx, &entry.event);
        }

        debug!(workflow_id = %info.id, events = history.len(), "replayed events");
        Ok((workflow, history))
    }

    /// Persist actions as one batch of events, then perform their side effects
    async fn process_actions(
        &self,
        workflow_id: Uuid,
        sequence: i32,
        ctx: &WorkflowContext,
        actions: Vec<WorkflowAction>,
    ) -> Result<ProcessResult, ExecutorError> {
        let mut result = ProcessResult::default();
        if actions.is_empty() {
            return Ok(result);
        }

        let mut events = Vec::with_capacity(actions.len());
        let mut terminal: Option<(WorkflowStatus, Option<Value>, Option<WorkflowError>)> = None;

        for action in &actions {
            match action {
                WorkflowAction::ScheduleActivity {
                    activity_id,
                    activity_type,
                    input,
                    options,
                } => events.push(WorkflowEvent::ActivityScheduled {
                    activity_id: activity_id.clone(),
                    activity_type: activity_type.clone(),
                    input: input.clone(),
                    options: options.clone(),
                }),

                WorkflowAction::StartTimer { timer_id, duration } => {
                    events.push(WorkflowEvent::TimerStarted {
                        timer_id: timer_id.clone(),
                        duration_ms: duration.as_millis() as u64,
                        fire_at: fire_time(ctx, *duration),
                    })
                }

                WorkflowAction::CancelTimer { timer_id } => {
                    events.push(WorkflowEvent::TimerCancelled {
                        timer_id: timer_id.clone(),
                    })
                }

                WorkflowAction::CancelActivity { activity_id } => {
                    events.push(WorkflowEvent::ActivityCancelled {
                        activity_id: activity_id.clone(),
                    })
                }

                WorkflowAction::CompleteWorkflow { result } => {
                    events.push(WorkflowEvent::WorkflowCompleted {
                        result: result.clone(),
                    });
                    terminal = Some((WorkflowStatus::Completed, Some(result.clone()), None));
                }

                WorkflowAction::FailWorkflow { error } => {
                    events.push(WorkflowEvent::WorkflowFailed {
                        error: error.clone(),
                    });
                    terminal = Some((WorkflowStatus::Failed, None, Some(error.clone())));
                }

                WorkflowAction::CancelWorkflow { reason, details } => {
                    events.push(WorkflowEvent::WorkflowCancelled {
                        reason: reason.clone(),
                        details: details.clone(),
                    });
                    let mut error = WorkflowError::new(reason.clone()).with_code("cancelled");
                    error.details = details.clone();
                    terminal = Some((WorkflowStatus::Cancelled, None, Some(error)));
                }
            }

            if terminal.is_some() {
                break;
            }
        }

        self.check_event_limit(workflow_id, sequence as usize + events.len())?;
        self.store
            .append_events(workflow_id, sequence, events.clone(), ctx.now)
            .await?;
        result.events_written = events.len();

        for event in events {
            match event {
                WorkflowEvent::ActivityScheduled {
                    activity_id,
                    activity_type,
                    input,
                    options,
                } => {
                    debug!(%workflow_id, %activity_id, %activity_type, "scheduling activity");
                    self.store
                        .enqueue_task(TaskDefinition {
                            workflow_id,
                            activity_id,
                            activity_type,
                            input,
                            options,
                        })
                        .await?;
                    result.tasks_enqueued += 1;
                }

                WorkflowEvent::TimerStarted {
                    timer_id, fire_at, ..
                } => {
                    debug!(%workflow_id, %timer_id, %fire_at, "arming timer");
                    self.store
                        .schedule_timer(workflow_id, &timer_id, fire_at)
                        .await?;
                    result.timers_started += 1;
                }

                WorkflowEvent::TimerCancelled { timer_id } => {
                    self.store.cancel_timer(workflow_id, &timer_id).await?;
                }

                WorkflowEvent::ActivityCancelled { activity_id } => {
                    self.store.cancel_task(workflow_id, &activity_id).await?;
                }

                _ => {}
            }
        }

        if let Some((status, value, error)) = terminal {
            info!(%workflow_id, %status, "workflow reached terminal state");
            self.store.cancel_workflow_work(workflow_id).await?;
            self.store
                .update_workflow_status(workflow_id, status, value, error)
                .await?;
            result.completed = true;
        }

        Ok(result)
    }
}

/// Route one event to the matching workflow callback
fn apply_event(
    workflow: &mut dyn Workflow,
    ctx: &WorkflowContext,
    event: &WorkflowEvent,
) -> Vec<WorkflowAction> {
    match event {
        WorkflowEvent::WorkflowStarted { .. } => workflow.on_start(ctx),

        WorkflowEvent::ActivityCompleted {
            activity_id,
            result,
        } => workflow.on_activity_completed(ctx, activity_id, result.clone()),

        WorkflowEvent::ActivityFailed { activity_id, error } => {
            workflow.on_activity_failed(ctx, activity_id, error)
        }

        WorkflowEvent::TimerFired { timer_id } => workflow.on_timer_fired(ctx, timer_id),

        WorkflowEvent::SignalReceived { signal } => workflow.on_signal(ctx, signal),

        WorkflowEvent::UpdateAccepted {
            update_id,
            name,
            payload,
            ..
        } => {
            let update = WorkflowUpdate {
                update_id: update_id.clone(),
                name: name.clone(),
                payload: payload.clone(),
            };
            workflow.on_update(ctx, &update).1
        }

        // Records of actions already taken
        WorkflowEvent::WorkflowCompleted { .. }
        | WorkflowEvent::WorkflowFailed { .. }
        | WorkflowEvent::WorkflowCancelled { .. }
        | WorkflowEvent::ActivityScheduled { .. }
        | WorkflowEvent::ActivityCancelled { .. }
        | WorkflowEvent::TimerStarted { .. }
        | WorkflowEvent::TimerCancelled { .. } => vec![],
    }
}

fn fire_time(
    ctx: &WorkflowContext,
    duration: std::time::Duration,
) -> chrono::DateTime<chrono::Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|delta| ctx.now.checked_add_signed(delta))
        .unwrap_or(chrono::DateTime::<chrono::Utc>::MAX_UTC)
}
