//! Workflow service
//!
//! Wires one process: store, executor, activity worker, timer service,
//! object store, registry and secrets provider. Constructed explicitly; there
//! is no global runtime state.
//!
//! ```ignore
//! let service = WorkflowService::builder()
//!     .registry(Arc::new(registry))
//!     .secrets(Arc::new(secrets))
//!     .build();
//!
//! let run_id = service.start(definition, RunInput::default()).await?;
//! service.run_until_idle().await?;
//! let result = service.result(run_id).await?;
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;
use warden_durable::{
    ActivityWorker, DurableClock, ExecutorError, HistoryEvent, InMemoryWorkflowEventStore,
    SystemClock, TimerService, Workflow, WorkflowError, WorkflowExecutor, WorkflowSignal,
    WorkflowEventStore, WorkflowStatus, WorkflowUpdate, WorkerError,
};

use crate::activities::RunActionActivity;
use crate::config::RuntimeConfig;
use crate::dispatcher::{queries, DslRunInput, DslWorkflowFactory, RUN_ACTION, WORKFLOW_TYPE};
use crate::dsl::WorkflowDefinition;
use crate::expression::{ExpressionEvaluator, TemplateEvaluator};
use crate::interaction::{InteractionUpdate, UPDATE_HANDLER};
use crate::objects::{InMemoryObjectStore, ObjectStore};
use crate::plan::{ExecutionPlan, ValidationError};
use crate::registry::{
    ActionRegistry, InMemoryActionRegistry, SecretsProvider, StaticSecretsProvider,
};

type Store = InMemoryWorkflowEventStore;

/// Errors from service operations
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("invalid definition: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("configuration error: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Worker(#[from] WorkerError),
}

pub type Result<T> = std::result::Result<T, ServiceError>;

/// Per-run input next to the definition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunInput {
    #[serde(default)]
    pub trigger: Value,
    #[serde(default)]
    pub inputs: Value,
    #[serde(default)]
    pub role: Option<String>,
}

/// Terminal (or current) state of a run
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub workflow_id: Uuid,
    pub status: WorkflowStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WorkflowError>,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        self.status == WorkflowStatus::Completed
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`WorkflowService`]; every seam has an in-memory default
#[derive(Default)]
pub struct WorkflowServiceBuilder {
    config: Option<RuntimeConfig>,
    registry: Option<Arc<dyn ActionRegistry>>,
    secrets: Option<Arc<dyn SecretsProvider>>,
    evaluator: Option<Arc<dyn ExpressionEvaluator>>,
    objects: Option<Arc<dyn ObjectStore>>,
    clock: Option<Arc<dyn DurableClock>>,
    store: Option<Arc<Store>>,
}

impl WorkflowServiceBuilder {
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn registry(mut self, registry: Arc<dyn ActionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn secrets(mut self, secrets: Arc<dyn SecretsProvider>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    pub fn evaluator(mut self, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn objects(mut self, objects: Arc<dyn ObjectStore>) -> Self {
        self.objects = Some(objects);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn DurableClock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn store(mut self, store: Arc<Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> WorkflowService {
        let config = self.config.unwrap_or_default();
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(InMemoryActionRegistry::with_builtins()));
        let secrets = self
            .secrets
            .unwrap_or_else(|| Arc::new(StaticSecretsProvider::new()));
        let evaluator = self
            .evaluator
            .unwrap_or_else(|| Arc::new(TemplateEvaluator::new()));
        let objects = self
            .objects
            .unwrap_or_else(|| Arc::new(InMemoryObjectStore::new()));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let store = self.store.unwrap_or_else(|| Arc::new(Store::new()));

        let factory = DslWorkflowFactory::new(
            Arc::clone(&registry),
            Arc::clone(&evaluator),
            Arc::clone(&objects),
            &config,
        );
        let mut executor = WorkflowExecutor::with_config(store, clock, config.executor.clone());
        let workflows = factory.clone();
        executor.register(WORKFLOW_TYPE, move |input| {
            workflows
                .create(input)
                .map(|workflow| Box::new(workflow) as Box<dyn Workflow>)
        });
        let executor = Arc::new(executor);

        let mut worker = ActivityWorker::new(Arc::clone(&executor), config.worker.clone());
        worker.register(
            RUN_ACTION,
            Arc::new(RunActionActivity::new(
                Arc::clone(&registry),
                secrets,
                Arc::clone(&evaluator),
            )),
        );
        let timers = TimerService::new(Arc::clone(&executor));

        WorkflowService {
            config,
            executor,
            worker,
            timers,
            registry,
            evaluator,
        }
    }
}

// ============================================================================
// Service
// ============================================================================

pub struct WorkflowService {
    config: RuntimeConfig,
    executor: Arc<WorkflowExecutor<Store>>,
    worker: ActivityWorker<Store>,
    timers: TimerService<Store>,
    registry: Arc<dyn ActionRegistry>,
    evaluator: Arc<dyn ExpressionEvaluator>,
}

impl WorkflowService {
    pub fn builder() -> WorkflowServiceBuilder {
        WorkflowServiceBuilder::default()
    }

    pub fn executor(&self) -> &Arc<WorkflowExecutor<Store>> {
        &self.executor
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Check a definition without starting anything
    pub fn validate(&self, definition: &WorkflowDefinition) -> Result<ExecutionPlan> {
        Ok(ExecutionPlan::build(
            definition,
            self.registry.as_ref(),
            self.evaluator.as_ref(),
        )?)
    }

    /// Parse a YAML/JSON document and validate it
    pub fn load(&self, source: &str) -> Result<WorkflowDefinition> {
        let definition = WorkflowDefinition::parse(source)?;
        self.validate(&definition)?;
        Ok(definition)
    }

    /// Start a run; configuration errors are returned before anything is persisted
    pub async fn start(&self, definition: WorkflowDefinition, input: RunInput) -> Result<Uuid> {
        self.validate(&definition)?;
        let run_input = DslRunInput {
            definition,
            trigger: input.trigger,
            inputs: input.inputs,
            role: input.role,
        };
        let payload = serde_json::to_value(&run_input).unwrap_or(Value::Null);
        let workflow_id = self.executor.start_workflow(WORKFLOW_TYPE, payload).await?;
        info!(%workflow_id, "run started");
        Ok(workflow_id)
    }

    /// Execute ready tasks and due timers until neither makes progress
    ///
    /// Each task batch runs to completion before timers are checked, so with a
    /// manual clock every step is deterministic.
    pub async fn run_until_idle(&self) -> Result<usize> {
        let mut total = 0;
        loop {
            let tasks = self.worker.run_once().await?;
            let fired = self.timers.fire_due().await?;
            if tasks + fired == 0 {
                break;
            }
            total += tasks + fired;
        }
        debug!(handled = total, "idle");
        Ok(total)
    }

    /// Start claimable tasks in the background and fire due timers
    ///
    /// Never waits on a running activity, so retry deadlines and interaction
    /// timeouts fire on time while slow actions are still executing.
    async fn pump(&self) -> Result<usize> {
        let mut total = 0;
        loop {
            let started = self.worker.dispatch().await?;
            let fired = self.timers.fire_due().await?;
            if started + fired == 0 {
                return Ok(total);
            }
            total += started + fired;
        }
    }

    /// Poll until `shutdown` flips to true
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            worker_id = %self.worker.worker_id(),
            poll_interval_ms = self.config.worker.poll_interval.as_millis() as u64,
            "service polling"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            if self.pump().await? > 0 {
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.worker.poll_interval) => {}
                _ = self.worker.reported() => {}
                _ = shutdown.changed() => {}
            }
        }
        self.shutdown();
        Ok(())
    }

    /// Drive one run until it is terminal or only external input can move it
    ///
    /// Sleeps until the next armed timer or the next reported activity. A run
    /// still waiting on an interaction is returned as `running`.
    pub async fn run_to_completion(&self, workflow_id: Uuid) -> Result<RunResult> {
        let poll = self.config.worker.poll_interval;
        loop {
            self.pump().await?;
            if self.status(workflow_id).await?.is_terminal() {
                break;
            }
            let live_tasks = self.executor.store().live_task_count().await.map_err(ExecutorError::from)?;
            let wait = match self.timers.next_fire_at().await? {
                _ if live_tasks > 0 => poll,
                Some(fire_at) => (fire_at - self.executor.clock().now())
                    .to_std()
                    .unwrap_or_default()
                    .max(poll),
                None => break,
            };
            debug!(%workflow_id, live_tasks, wait_ms = wait.as_millis() as u64, "waiting");
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.worker.reported() => {}
            }
        }
        self.result(workflow_id).await
    }

    pub async fn status(&self, workflow_id: Uuid) -> Result<WorkflowStatus> {
        Ok(self.executor.status(workflow_id).await?)
    }

    pub async fn result(&self, workflow_id: Uuid) -> Result<RunResult> {
        let info = self.executor.workflow_info(workflow_id).await?;
        Ok(RunResult {
            workflow_id,
            status: info.status,
            result: info.result,
            error: info.error,
        })
    }

    pub async fn history(&self, workflow_id: Uuid) -> Result<Vec<HistoryEvent>> {
        Ok(self.executor.history(workflow_id).await?)
    }

    /// Stream-qualified ref -> interaction state
    pub async fn query_interactions(&self, workflow_id: Uuid) -> Result<Value> {
        Ok(self.executor.query(workflow_id, queries::INTERACTIONS).await?)
    }

    /// Root execution context snapshot
    pub async fn context(&self, workflow_id: Uuid) -> Result<Value> {
        Ok(self.executor.query(workflow_id, queries::CONTEXT).await?)
    }

    /// Deliver an interaction payload and return the ack
    pub async fn submit_interaction(
        &self,
        workflow_id: Uuid,
        interaction_id: Uuid,
        data: Value,
    ) -> Result<Value> {
        let update = WorkflowUpdate::new(
            UPDATE_HANDLER,
            InteractionUpdate::new(interaction_id, data).to_value(),
        );
        Ok(self.executor.update(workflow_id, update).await?)
    }

    /// Like [`submit_interaction`](Self::submit_interaction), deduplicated by `request_id`
    pub async fn submit_interaction_once(
        &self,
        workflow_id: Uuid,
        request_id: &str,
        interaction_id: Uuid,
        data: Value,
    ) -> Result<Value> {
        let update = WorkflowUpdate::new(
            UPDATE_HANDLER,
            InteractionUpdate::new(interaction_id, data).to_value(),
        )
        .with_id(request_id);
        Ok(self.executor.update(workflow_id, update).await?)
    }

    pub async fn cancel(&self, workflow_id: Uuid, reason: &str) -> Result<()> {
        self.executor
            .send_signal(workflow_id, WorkflowSignal::cancel(reason))
            .await?;
        info!(%workflow_id, reason, "run cancelled");
        Ok(())
    }

    /// Flag running activities as cancelled
    pub fn shutdown(&self) {
        self.worker.cancel_running();
        info!(worker_id = %self.worker.worker_id(), "service stopped");
    }
}
