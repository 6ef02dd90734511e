//! Action dispatcher
//!
//! [`DslWorkflow`] runs one DSL definition as a durable workflow. It is a
//! deterministic state machine: every decision is derived from recorded
//! events and the durable clock carried by [`WorkflowContext`], so replay
//! rebuilds the same state and re-derives the same suspension decisions.
//!
//! Per statement the dispatcher sequences readiness (edges, join strategy,
//! `run_if`), the timer scheduler, then either a scatter or the retry
//! controller around registry invocations (with an interaction when the
//! statement asks for one), and finally records exactly one outcome.
//!
//! Suspension points map onto durable primitives:
//!
//! | suspension                 | primitive                                   |
//! |----------------------------|---------------------------------------------|
//! | `wait_until`/`start_delay` | timer `{stream}:{ref}:start`                |
//! | invocation attempt         | activity `{stream}:{ref}:{attempt}`         |
//! | backoff between attempts   | timer `{stream}:{ref}:retry_delay`          |
//! | retry timeout budget       | timer `{stream}:{ref}:retry_deadline`       |
//! | interaction timeout        | timer `{stream}:{ref}:interaction_timeout`  |
//! | interaction payload        | update `interaction`                        |
//!
//! Ids that no longer match a live statement (cancelled, superseded) are
//! ignored, which is what makes cancelled timers and attempts inert.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;
use warden_durable::{
    ActivityError, QueryError, UpdateRejected, Workflow, WorkflowAction, WorkflowContext,
    WorkflowError, WorkflowSignal, WorkflowUpdate,
};

use crate::config::RuntimeConfig;
use crate::context::ExecutionContext;
use crate::dsl::{JoinStrategy, WorkflowDefinition};
use crate::expression::{self, unwrap_expression, ExpressionError, ExpressionEvaluator};
use crate::interaction::{
    qualified_ref, InteractionController, InteractionStatus, InteractionUpdate,
    INTERACTION_TIMEOUT, ROOT_STREAM, UPDATE_HANDLER,
};
use crate::objects::ObjectStore;
use crate::outcome::{ActionOutcome, ErrorOutcome, OutcomeStatus};
use crate::plan::{EdgeKind, ExecutionPlan, NodeKind, PlanNode};
use crate::registry::{ActionRegistry, InvocationError, SECRETS_ROOT};
use crate::retry::{RetryController, RetryDecision};
use crate::scatter::{self, GatherStep, ScatterTracker, StreamResult};
use crate::schedule;

/// Workflow type DSL runs are registered under
pub const WORKFLOW_TYPE: &str = "dsl";

/// Activity type executing one action attempt
pub const RUN_ACTION: &str = "run_action";

/// Query names
pub mod queries {
    pub const INTERACTIONS: &str = "interactions";
    pub const CONTEXT: &str = "context";
}

const EXPRESSION_ERROR: &str = "ExpressionError";
const OBJECT_STORE_ERROR: &str = "ObjectStoreError";
const CONFIGURATION_ERROR: &str = "ConfigurationError";

// ============================================================================
// Input Types
// ============================================================================

/// Input recorded in `workflow_started`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DslRunInput {
    pub definition: WorkflowDefinition,
    #[serde(default)]
    pub trigger: Value,
    #[serde(default)]
    pub inputs: Value,
    /// Caller role used to scope secret access
    #[serde(default)]
    pub role: Option<String>,
}

/// Input of a `run_action` activity
///
/// `args` are rendered except for `SECRETS` references, which the activity
/// substitutes per invocation so secret values never reach history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionInvocation {
    pub action: String,
    pub args: Value,
    #[serde(default)]
    pub role: Option<String>,
    pub stream: String,
    pub action_ref: String,
    pub attempt: u32,
}

// ============================================================================
// Factory
// ============================================================================

/// Builds [`DslWorkflow`] instances for the executor's workflow registry
#[derive(Clone)]
pub struct DslWorkflowFactory {
    registry: Arc<dyn ActionRegistry>,
    evaluator: Arc<dyn ExpressionEvaluator>,
    objects: Arc<dyn ObjectStore>,
    limits: Limits,
}

#[derive(Debug, Clone, Copy)]
struct Limits {
    scatter_inline: usize,
    gather_inline: usize,
}

impl DslWorkflowFactory {
    pub fn new(
        registry: Arc<dyn ActionRegistry>,
        evaluator: Arc<dyn ExpressionEvaluator>,
        objects: Arc<dyn ObjectStore>,
        config: &RuntimeConfig,
    ) -> Self {
        Self {
            registry,
            evaluator,
            objects,
            limits: Limits {
                scatter_inline: config.scatter_inline_limit,
                gather_inline: config.gather_inline_limit,
            },
        }
    }

    /// Parse and validate the run input
    pub fn create(&self, input: Value) -> Result<DslWorkflow, WorkflowError> {
        let input: DslRunInput = serde_json::from_value(input).map_err(|e| {
            WorkflowError::new(format!("invalid run input: {}", e)).with_code("InvalidInput")
        })?;
        let plan = ExecutionPlan::build(
            &input.definition,
            self.registry.as_ref(),
            self.evaluator.as_ref(),
        )
        .map_err(|e| WorkflowError::new(e.to_string()).with_code("ValidationError"))?;

        Ok(DslWorkflow {
            plan: Arc::new(plan),
            evaluator: Arc::clone(&self.evaluator),
            objects: Arc::clone(&self.objects),
            limits: self.limits,
            trigger: input.trigger,
            inputs: input.inputs,
            role: input.role,
            workflow_id: Uuid::nil(),
            streams: BTreeMap::new(),
            interactions: InteractionController::new(),
            finished: false,
        })
    }
}

// ============================================================================
// Identifiers
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum TimerKind {
    Start,
    RetryDelay,
    RetryDeadline,
    InteractionTimeout,
}

impl TimerKind {
    fn as_str(&self) -> &'static str {
        match self {
            TimerKind::Start => "start",
            TimerKind::RetryDelay => "retry_delay",
            TimerKind::RetryDeadline => "retry_deadline",
            TimerKind::InteractionTimeout => "interaction_timeout",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "start" => Some(TimerKind::Start),
            "retry_delay" => Some(TimerKind::RetryDelay),
            "retry_deadline" => Some(TimerKind::RetryDeadline),
            "interaction_timeout" => Some(TimerKind::InteractionTimeout),
            _ => None,
        }
    }
}

fn timer_id(stream: &str, action_ref: &str, kind: TimerKind) -> String {
    format!("{}:{}:{}", stream, action_ref, kind.as_str())
}

fn activity_id(stream: &str, action_ref: &str, attempt: u32) -> String {
    format!("{}:{}:{}", stream, action_ref, attempt)
}

/// Split `{stream}:{ref}:{suffix}`; neither streams nor refs contain ':'
fn split_id(id: &str) -> Option<(&str, &str, &str)> {
    let mut parts = id.splitn(3, ':');
    Some((parts.next()?, parts.next()?, parts.next()?))
}

// ============================================================================
// Readiness
// ============================================================================

/// Whether a waiting statement can run, judged from its stream's context
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Some dependency has no outcome yet
    Blocked,
    Ready,
    /// Dependencies resolved without satisfying the join
    Skip(String),
}

pub fn readiness(node: &PlanNode, context: &ExecutionContext) -> Readiness {
    let mut unresolved = false;
    let mut any_satisfied = false;
    let mut unsatisfied: Option<String> = None;

    for edge in &node.edges {
        let Some(outcome) = context.get(&edge.source) else {
            unresolved = true;
            continue;
        };
        let satisfied = match edge.kind {
            EdgeKind::Success => outcome.is_success(),
            EdgeKind::Error => outcome.is_error(),
        };
        if satisfied {
            any_satisfied = true;
        } else if unsatisfied.is_none() {
            let reason = match (edge.kind, outcome.status()) {
                (_, OutcomeStatus::Skipped) => format!("dependency '{}' was skipped", edge.source),
                (EdgeKind::Success, _) => format!("dependency '{}' failed", edge.source),
                (EdgeKind::Error, _) => format!("dependency '{}' did not fail", edge.source),
            };
            unsatisfied = Some(reason);
        }
    }

    if node.edges.is_empty() {
        return Readiness::Ready;
    }
    match node.statement.join_strategy {
        JoinStrategy::All => match unsatisfied {
            Some(reason) => Readiness::Skip(reason),
            None if unresolved => Readiness::Blocked,
            None => Readiness::Ready,
        },
        JoinStrategy::Any => {
            if any_satisfied {
                Readiness::Ready
            } else if unresolved {
                Readiness::Blocked
            } else {
                Readiness::Skip(unsatisfied.unwrap_or_else(|| "no dependency satisfied".into()))
            }
        }
    }
}

// ============================================================================
// Run State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Waiting,
    /// Suspended on the start timer
    Delayed,
    /// Attempts, retry delays or an interaction outstanding
    Running,
    Done,
}

#[derive(Debug)]
struct NodeRun {
    phase: Phase,
    retry: RetryController,
    /// Attempt whose activity is outstanding
    in_flight: Option<u32>,
    /// Latest success candidate, visible to args of the next attempt
    last: Option<ActionOutcome>,
    interaction: Option<Uuid>,
    /// Prompt result waiting for its interaction payload
    prompt: Option<ActionOutcome>,
    timers: BTreeSet<TimerKind>,
}

impl NodeRun {
    fn new(node: &PlanNode) -> Self {
        Self {
            phase: Phase::Waiting,
            retry: RetryController::new(node.statement.retry_policy.clone()),
            in_flight: None,
            last: None,
            interaction: None,
            prompt: None,
            timers: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct StreamOrigin {
    stream: String,
    scatter_ref: String,
    index: usize,
}

#[derive(Debug)]
struct Stream {
    scope: Vec<String>,
    origin: Option<StreamOrigin>,
    context: ExecutionContext,
    nodes: BTreeMap<String, NodeRun>,
    trackers: BTreeMap<String, ScatterTracker>,
    /// What this stream's gather statement produced
    contribution: Option<StreamResult>,
    finished: bool,
}

// ============================================================================
// Workflow
// ============================================================================

/// One DSL run
pub struct DslWorkflow {
    plan: Arc<ExecutionPlan>,
    evaluator: Arc<dyn ExpressionEvaluator>,
    objects: Arc<dyn ObjectStore>,
    limits: Limits,
    trigger: Value,
    inputs: Value,
    role: Option<String>,
    workflow_id: Uuid,
    streams: BTreeMap<String, Stream>,
    interactions: InteractionController,
    finished: bool,
}

impl DslWorkflow {
    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    /// Snapshot of the root stream's context
    pub fn context_snapshot(&self) -> Value {
        self.streams
            .get(ROOT_STREAM)
            .map(|s| s.context.snapshot())
            .unwrap_or(Value::Null)
    }

    fn new_stream(
        &self,
        scope: Vec<String>,
        origin: Option<StreamOrigin>,
        context: ExecutionContext,
    ) -> Stream {
        let nodes = self
            .plan
            .nodes_in_scope(&scope)
            .map(|node| (node.action_ref().to_string(), NodeRun::new(node)))
            .collect();
        Stream {
            scope,
            origin,
            context,
            nodes,
            trackers: BTreeMap::new(),
            contribution: None,
            finished: false,
        }
    }

    fn run_mut(&mut self, stream_id: &str, action_ref: &str) -> Option<&mut NodeRun> {
        self.streams
            .get_mut(stream_id)
            .and_then(|s| s.nodes.get_mut(action_ref))
    }

    fn bindings(&self, context: &ExecutionContext) -> Result<Value, ErrorOutcome> {
        context
            .bindings(self.objects.as_ref())
            .map_err(|e| ErrorOutcome::new(OBJECT_STORE_ERROR, e.to_string()))
    }

    fn stream_bindings(&self, stream_id: &str) -> Result<Value, ErrorOutcome> {
        match self.streams.get(stream_id) {
            Some(stream) => self.bindings(&stream.context),
            None => Err(ErrorOutcome::new(
                OBJECT_STORE_ERROR,
                format!("unknown stream '{}'", stream_id),
            )),
        }
    }

    fn arm(
        &mut self,
        stream_id: &str,
        action_ref: &str,
        kind: TimerKind,
        duration: Duration,
        actions: &mut Vec<WorkflowAction>,
    ) {
        if let Some(run) = self.run_mut(stream_id, action_ref) {
            run.timers.insert(kind);
        }
        actions.push(WorkflowAction::timer(
            timer_id(stream_id, action_ref, kind),
            duration,
        ));
    }

    // =========================================================================
    // Scheduling Loop
    // =========================================================================

    /// Settle everything that can be settled without waiting
    fn advance(&mut self, ctx: &WorkflowContext, actions: &mut Vec<WorkflowAction>) {
        while !self.finished {
            let live: Vec<String> = self
                .streams
                .iter()
                .filter(|(_, s)| !s.finished)
                .map(|(id, _)| id.clone())
                .collect();

            let mut progressed = false;
            for stream_id in live {
                progressed |= self.step_stream(ctx, &stream_id, actions);
                if self.finished {
                    return;
                }
            }
            if !progressed {
                return;
            }
        }
    }

    fn step_stream(
        &mut self,
        ctx: &WorkflowContext,
        stream_id: &str,
        actions: &mut Vec<WorkflowAction>,
    ) -> bool {
        let plan = Arc::clone(&self.plan);
        let Some(scope) = self.streams.get(stream_id).map(|s| s.scope.clone()) else {
            return false;
        };

        let mut progressed = false;
        for node in plan.nodes_in_scope(&scope) {
            let verdict = match self.streams.get(stream_id) {
                Some(stream) if !stream.finished => {
                    let waiting = stream
                        .nodes
                        .get(node.action_ref())
                        .is_some_and(|run| run.phase == Phase::Waiting);
                    if !waiting {
                        continue;
                    }
                    readiness(node, &stream.context)
                }
                _ => return progressed,
            };

            match verdict {
                Readiness::Blocked => {}
                Readiness::Skip(reason) => {
                    let outcome = ActionOutcome::skipped(Some(reason));
                    self.settle(ctx, stream_id, node.action_ref(), outcome, actions);
                    progressed = true;
                }
                Readiness::Ready => {
                    self.on_ready(ctx, stream_id, node, actions);
                    progressed = true;
                }
            }
            if self.finished {
                return true;
            }
        }

        if self.stream_complete(stream_id) {
            self.finish_stream(ctx, stream_id, actions);
            progressed = true;
        }
        progressed
    }

    fn stream_complete(&self, stream_id: &str) -> bool {
        self.streams.get(stream_id).is_some_and(|s| {
            !s.finished
                && s.nodes.values().all(|run| run.phase == Phase::Done)
                && s.trackers.values().all(ScatterTracker::is_finished)
        })
    }

    /// Dependencies are satisfied: apply `run_if`, then the timer scheduler
    fn on_ready(
        &mut self,
        ctx: &WorkflowContext,
        stream_id: &str,
        node: &PlanNode,
        actions: &mut Vec<WorkflowAction>,
    ) {
        let action_ref = node.action_ref();
        let bindings = match self.stream_bindings(stream_id) {
            Ok(bindings) => bindings,
            Err(err) => return self.settle(ctx, stream_id, action_ref, err.into(), actions),
        };

        if let Some(run_if) = &node.statement.run_if {
            match self.evaluator.eval_bool(unwrap_expression(run_if), &bindings) {
                Ok(true) => {}
                Ok(false) => {
                    let outcome = ActionOutcome::skipped(Some("run_if evaluated to false".into()));
                    return self.settle(ctx, stream_id, action_ref, outcome, actions);
                }
                Err(e) => {
                    let outcome = expression_error(e).into();
                    return self.settle(ctx, stream_id, action_ref, outcome, actions);
                }
            }
        }

        if let NodeKind::Gather { .. } = node.kind {
            let items = node
                .statement
                .gather
                .as_ref()
                .map(|spec| spec.items.as_str())
                .unwrap_or_default();
            let outcome = match self.evaluator.eval(unwrap_expression(items), &bindings) {
                Ok(value) => ActionOutcome::success(value),
                Err(e) => expression_error(e).into(),
            };
            return self.settle(ctx, stream_id, action_ref, outcome, actions);
        }

        let decision = match schedule::resolve_wait(
            &node.statement,
            ctx.now,
            self.evaluator.as_ref(),
            &bindings,
        ) {
            Ok(decision) => decision,
            Err(e) => {
                let error = WorkflowError::new(format!(
                    "action '{}': invalid wait instruction: {}",
                    qualified_ref(stream_id, action_ref),
                    e
                ))
                .with_code(CONFIGURATION_ERROR)
                .with_details(json!({
                    "action_ref": action_ref,
                    "stream": stream_id,
                    "context": self.context_snapshot(),
                }));
                return self.fail_run(error, actions);
            }
        };

        match decision.timer_duration(ctx.now) {
            Some(duration) => {
                if let Some(run) = self.run_mut(stream_id, action_ref) {
                    run.phase = Phase::Delayed;
                }
                if !ctx.replaying {
                    info!(
                        workflow_id = %ctx.workflow_id,
                        stream = %stream_id,
                        action_ref,
                        delay_ms = duration.as_millis() as u64,
                        "action waiting on start timer"
                    );
                }
                self.arm(stream_id, action_ref, TimerKind::Start, duration, actions);
            }
            None => self.start_node(ctx, stream_id, node, actions),
        }
    }

    fn start_node(
        &mut self,
        ctx: &WorkflowContext,
        stream_id: &str,
        node: &PlanNode,
        actions: &mut Vec<WorkflowAction>,
    ) {
        if node.kind == NodeKind::Scatter {
            return self.start_scatter(ctx, stream_id, node, actions);
        }

        let action_ref = node.action_ref();
        let deadline = match self.run_mut(stream_id, action_ref) {
            Some(run) => {
                run.phase = Phase::Running;
                run.retry.begin(ctx.now);
                run.retry.deadline()
            }
            None => return,
        };
        if let Some(deadline) = deadline {
            let budget = (deadline - ctx.now).to_std().unwrap_or_default();
            self.arm(stream_id, action_ref, TimerKind::RetryDeadline, budget, actions);
        }

        if let Some(spec) = &node.statement.interaction {
            let id = self
                .interactions
                .open(self.workflow_id, stream_id, action_ref, spec.kind);
            if let Some(run) = self.run_mut(stream_id, action_ref) {
                run.interaction = Some(id);
            }
            if let Some(secs) = spec.timeout {
                let timeout = Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX);
                self.arm(stream_id, action_ref, TimerKind::InteractionTimeout, timeout, actions);
            }
            if !ctx.replaying {
                info!(
                    workflow_id = %ctx.workflow_id,
                    stream = %stream_id,
                    action_ref,
                    interaction_id = %id,
                    kind = spec.kind.as_str(),
                    "interaction pending"
                );
            }
        }

        self.dispatch_attempt(ctx, stream_id, node, actions);
    }

    // =========================================================================
    // Attempts
    // =========================================================================

    /// Render args against the latest context and schedule the current attempt
    fn dispatch_attempt(
        &mut self,
        ctx: &WorkflowContext,
        stream_id: &str,
        node: &PlanNode,
        actions: &mut Vec<WorkflowAction>,
    ) {
        let action_ref = node.action_ref();
        let prepared = {
            let Some(stream) = self.streams.get(stream_id) else {
                return;
            };
            let Some(run) = stream.nodes.get(action_ref) else {
                return;
            };
            let scratch = match &run.last {
                Some(last) => stream.context.rebind(action_ref, last.clone()),
                None => stream.context.clone(),
            };
            let attempt = run.retry.attempt();
            let template = Value::Object(node.statement.args.clone());
            self.bindings(&scratch).and_then(|bindings| {
                expression::render(
                    self.evaluator.as_ref(),
                    &template,
                    &bindings,
                    &[SECRETS_ROOT],
                )
                .map(|args| (attempt, args))
                .map_err(expression_error)
            })
        };

        let (attempt, args) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => {
                let Some(run) = self.run_mut(stream_id, action_ref) else {
                    return;
                };
                let decision = run.retry.fail(err);
                return self.conclude(ctx, stream_id, node, decision, actions);
            }
        };

        let invocation = ActionInvocation {
            action: node.statement.action.clone(),
            args,
            role: self.role.clone(),
            stream: stream_id.to_string(),
            action_ref: action_ref.to_string(),
            attempt,
        };
        actions.push(WorkflowAction::schedule_activity(
            activity_id(stream_id, action_ref, attempt),
            RUN_ACTION,
            serde_json::to_value(&invocation).unwrap_or(Value::Null),
        ));
        if let Some(run) = self.run_mut(stream_id, action_ref) {
            run.in_flight = Some(attempt);
        }
        if !ctx.replaying {
            debug!(
                workflow_id = %ctx.workflow_id,
                stream = %stream_id,
                action_ref,
                attempt,
                action = %node.statement.action,
                "scheduled action attempt"
            );
        }
    }

    /// Act on the retry controller's decision
    fn conclude(
        &mut self,
        ctx: &WorkflowContext,
        stream_id: &str,
        node: &PlanNode,
        decision: RetryDecision,
        actions: &mut Vec<WorkflowAction>,
    ) {
        let action_ref = node.action_ref();
        match decision {
            RetryDecision::Retry { attempt, delay } => {
                if !ctx.replaying {
                    info!(
                        workflow_id = %ctx.workflow_id,
                        stream = %stream_id,
                        action_ref,
                        attempt,
                        delay_ms = delay.map(|d| d.as_millis() as u64),
                        "retrying action"
                    );
                }
                match delay {
                    Some(delay) => {
                        self.arm(stream_id, action_ref, TimerKind::RetryDelay, delay, actions)
                    }
                    None => self.dispatch_attempt(ctx, stream_id, node, actions),
                }
            }
            RetryDecision::Done(outcome) => {
                let interaction = self
                    .streams
                    .get(stream_id)
                    .and_then(|s| s.nodes.get(action_ref))
                    .and_then(|run| run.interaction);
                let outcome = match interaction {
                    None => outcome,
                    Some(id) if outcome.is_success() => {
                        let resolved = self
                            .interactions
                            .get(id)
                            .filter(|state| state.status == InteractionStatus::Completed)
                            .map(|state| (state.kind, state.data.clone()));
                        match resolved {
                            Some((kind, data)) => outcome.with_interaction(id, kind.as_str(), data),
                            None => {
                                if let Some(run) = self.run_mut(stream_id, action_ref) {
                                    run.prompt = Some(outcome);
                                }
                                return;
                            }
                        }
                    }
                    Some(id) => {
                        self.interactions.abandon(id);
                        outcome
                    }
                };
                self.settle(ctx, stream_id, action_ref, outcome, actions);
            }
        }
    }

    /// Claim the outstanding attempt; false for stale or unknown deliveries
    fn take_in_flight(&mut self, stream_id: &str, action_ref: &str, attempt: u32) -> bool {
        let live = self
            .streams
            .get(stream_id)
            .is_some_and(|s| !s.finished);
        match self.run_mut(stream_id, action_ref) {
            Some(run)
                if live && run.phase == Phase::Running && run.in_flight == Some(attempt) =>
            {
                run.in_flight = None;
                true
            }
            _ => false,
        }
    }

    // =========================================================================
    // Scatter
    // =========================================================================

    fn start_scatter(
        &mut self,
        ctx: &WorkflowContext,
        stream_id: &str,
        node: &PlanNode,
        actions: &mut Vec<WorkflowAction>,
    ) {
        let plan = Arc::clone(&self.plan);
        let scatter_ref = node.action_ref();
        let source = node.statement.for_each.as_deref().unwrap_or_default();

        let items = self.stream_bindings(stream_id).and_then(|bindings| {
            self.evaluator
                .eval(unwrap_expression(source), &bindings)
                .map_err(expression_error)
                .and_then(scatter::collection_items)
        });
        let items = match items {
            Ok(items) => items,
            Err(err) => return self.settle(ctx, stream_id, scatter_ref, err.into(), actions),
        };
        let outcome = match scatter::scatter_outcome(
            &items,
            self.limits.scatter_inline,
            self.objects.as_ref(),
        ) {
            Ok(outcome) => outcome,
            Err(e) => {
                let err = ErrorOutcome::new(OBJECT_STORE_ERROR, e.to_string());
                return self.settle(ctx, stream_id, scatter_ref, err.into(), actions);
            }
        };

        let Some(parent) = self.streams.get(stream_id) else {
            return;
        };
        let mut child_scope = parent.scope.clone();
        child_scope.push(scatter_ref.to_string());
        let base = parent.context.clone();

        let ids: Vec<String> = (0..items.len())
            .map(|i| scatter::stream_id(stream_id, scatter_ref, i))
            .collect();
        let gather = plan.gather_for(scatter_ref);
        let tracker = ScatterTracker::new(
            scatter_ref,
            gather.and_then(|g| g.statement.gather.as_ref().map(|spec| (g.action_ref(), spec))),
            ids.clone(),
        );

        if !ctx.replaying {
            info!(
                workflow_id = %ctx.workflow_id,
                stream = %stream_id,
                action_ref = scatter_ref,
                count = items.len(),
                "scatter spawning streams"
            );
        }

        self.settle(ctx, stream_id, scatter_ref, outcome, actions);
        if let Some(parent) = self.streams.get_mut(stream_id) {
            parent.trackers.insert(scatter_ref.to_string(), tracker);
        }

        for (index, (id, item)) in ids.into_iter().zip(items).enumerate() {
            let origin = StreamOrigin {
                stream: stream_id.to_string(),
                scatter_ref: scatter_ref.to_string(),
                index,
            };
            let context = base.rebind(scatter_ref, ActionOutcome::success(item));
            let stream = self.new_stream(child_scope.clone(), Some(origin), context);
            self.streams.insert(id, stream);
        }

        if let (true, Some(gather)) = (self.streams_empty_for(stream_id, scatter_ref), gather) {
            let outcome = ActionOutcome::gather(Vec::new(), None);
            self.settle(ctx, stream_id, gather.action_ref(), outcome, actions);
        }
    }

    fn streams_empty_for(&self, stream_id: &str, scatter_ref: &str) -> bool {
        self.streams
            .get(stream_id)
            .and_then(|s| s.trackers.get(scatter_ref))
            .is_some_and(|t| t.stream_ids().is_empty())
    }

    /// Hand a finished stream's result to the scatter that spawned it
    fn report(
        &mut self,
        ctx: &WorkflowContext,
        origin: StreamOrigin,
        result: StreamResult,
        actions: &mut Vec<WorkflowAction>,
    ) {
        let (step, gather_ref, unfinished) = {
            let Some(parent) = self.streams.get_mut(&origin.stream) else {
                return;
            };
            if parent.finished {
                return;
            }
            let Some(tracker) = parent.trackers.get_mut(&origin.scatter_ref) else {
                return;
            };
            let step = tracker.record(origin.index, result);
            let unfinished: Vec<String> = tracker.unfinished().map(String::from).collect();
            (step, tracker.gather_ref().map(String::from), unfinished)
        };

        match step {
            GatherStep::Pending => {}
            GatherStep::Halt(err) => {
                for sibling in unfinished {
                    self.cancel_stream(&sibling, actions);
                }
                match gather_ref {
                    Some(gather_ref) => {
                        self.settle(ctx, &origin.stream, &gather_ref, err.into(), actions)
                    }
                    None => {
                        self.halt_stream(ctx, &origin.stream, &origin.scatter_ref, err, actions)
                    }
                }
            }
            GatherStep::Complete { values, errors } => {
                let Some(gather_ref) = gather_ref else {
                    return;
                };
                let outcome = scatter::gather_outcome(
                    values,
                    errors,
                    self.limits.gather_inline,
                    self.objects.as_ref(),
                )
                .unwrap_or_else(|e| ErrorOutcome::new(OBJECT_STORE_ERROR, e.to_string()).into());
                self.settle(ctx, &origin.stream, &gather_ref, outcome, actions);
            }
        }
    }

    // =========================================================================
    // Outcomes
    // =========================================================================

    /// Record `outcome` for `action_ref` in `stream_id`, exactly once
    fn settle(
        &mut self,
        ctx: &WorkflowContext,
        stream_id: &str,
        action_ref: &str,
        outcome: ActionOutcome,
        actions: &mut Vec<WorkflowAction>,
    ) {
        let plan = Arc::clone(&self.plan);
        let Some(node) = plan.node(action_ref) else {
            return;
        };
        let Some(stream) = self.streams.get_mut(stream_id) else {
            return;
        };

        if let Some(run) = stream.nodes.get_mut(action_ref) {
            run.phase = Phase::Done;
            run.prompt = None;
            if let Some(attempt) = run.in_flight.take() {
                actions.push(WorkflowAction::cancel_activity(activity_id(
                    stream_id, action_ref, attempt,
                )));
            }
            for kind in std::mem::take(&mut run.timers) {
                actions.push(WorkflowAction::cancel_timer(timer_id(
                    stream_id, action_ref, kind,
                )));
            }

            // A gather settles inside each stream; the parent records the aggregate
            if let NodeKind::Gather { .. } = node.kind {
                stream.contribution = Some(StreamResult::from_outcome(&outcome));
                return;
            }
        }

        if let Err(e) = stream.context.record(action_ref, outcome.clone()) {
            warn!(workflow_id = %ctx.workflow_id, stream = %stream_id, error = %e, "outcome dropped");
            return;
        }
        if !ctx.replaying {
            info!(
                workflow_id = %ctx.workflow_id,
                stream = %stream_id,
                action_ref,
                status = %outcome.status(),
                "action settled"
            );
        }

        if node.kind == NodeKind::Scatter && !matches!(outcome, ActionOutcome::Scatter(_)) {
            if let Some(gather) = plan.gather_for(action_ref) {
                let verb = if outcome.is_error() { "failed" } else { "was skipped" };
                let skipped =
                    ActionOutcome::skipped(Some(format!("scatter '{}' {}", action_ref, verb)));
                if let Err(e) = stream.context.record(gather.action_ref(), skipped) {
                    warn!(workflow_id = %ctx.workflow_id, stream = %stream_id, error = %e, "outcome dropped");
                }
            }
        }

        if let ActionOutcome::Error(err) = outcome {
            if !node.error_handled {
                self.halt_stream(ctx, stream_id, action_ref, err, actions);
            }
        }
    }

    /// An unhandled error: stop the stream and fail whatever spawned it
    fn halt_stream(
        &mut self,
        ctx: &WorkflowContext,
        stream_id: &str,
        action_ref: &str,
        err: ErrorOutcome,
        actions: &mut Vec<WorkflowAction>,
    ) {
        if !ctx.replaying {
            warn!(
                workflow_id = %ctx.workflow_id,
                stream = %stream_id,
                action_ref,
                error = %err.message(),
                "unhandled action error, halting stream"
            );
        }

        if stream_id == ROOT_STREAM {
            let error = WorkflowError::new(format!(
                "action '{}' failed: {}",
                action_ref,
                err.message()
            ))
            .with_code(err.error_typename.clone())
            .with_details(json!({
                "action_ref": action_ref,
                "stream": stream_id,
                "error": err.error,
                "context": self.context_snapshot(),
            }));
            return self.fail_run(error, actions);
        }

        self.cancel_stream(stream_id, actions);
        let origin = self.streams.get(stream_id).and_then(|s| s.origin.clone());
        if let Some(origin) = origin {
            self.report(ctx, origin, StreamResult::Failed(err), actions);
        }
    }

    fn finish_stream(
        &mut self,
        ctx: &WorkflowContext,
        stream_id: &str,
        actions: &mut Vec<WorkflowAction>,
    ) {
        let Some(stream) = self.streams.get_mut(stream_id) else {
            return;
        };
        stream.finished = true;
        let result = stream.contribution.take().unwrap_or(StreamResult::Skipped);
        let origin = stream.origin.clone();
        if !ctx.replaying {
            debug!(workflow_id = %ctx.workflow_id, stream = %stream_id, "stream finished");
        }

        match origin {
            Some(origin) => self.report(ctx, origin, result, actions),
            None => self.complete_run(ctx, actions),
        }
    }

    fn complete_run(&mut self, ctx: &WorkflowContext, actions: &mut Vec<WorkflowAction>) {
        let Some(root) = self.streams.get(ROOT_STREAM) else {
            return;
        };
        let result = match self.plan.returns() {
            None => Ok(root.context.snapshot()),
            Some(template) => self.bindings(&root.context).and_then(|bindings| {
                expression::render(self.evaluator.as_ref(), template, &bindings, &[])
                    .map_err(expression_error)
            }),
        };

        self.finished = true;
        match result {
            Ok(result) => {
                if !ctx.replaying {
                    info!(workflow_id = %ctx.workflow_id, "run completed");
                }
                actions.push(WorkflowAction::complete(result));
            }
            Err(err) => {
                let error = WorkflowError::new(format!("invalid returns: {}", err.message()))
                    .with_code(err.error_typename.clone())
                    .with_details(json!({ "context": self.context_snapshot() }));
                actions.push(WorkflowAction::fail(error));
            }
        }
    }

    // =========================================================================
    // Cancellation
    // =========================================================================

    /// Cancel outstanding work of a stream and its descendants
    fn cancel_stream(&mut self, stream_id: &str, actions: &mut Vec<WorkflowAction>) {
        let children: Vec<String> = {
            let Some(stream) = self.streams.get_mut(stream_id) else {
                return;
            };
            stream.finished = true;
            for (action_ref, run) in stream.nodes.iter_mut() {
                if let Some(attempt) = run.in_flight.take() {
                    actions.push(WorkflowAction::cancel_activity(activity_id(
                        stream_id, action_ref, attempt,
                    )));
                }
                for kind in std::mem::take(&mut run.timers) {
                    actions.push(WorkflowAction::cancel_timer(timer_id(
                        stream_id, action_ref, kind,
                    )));
                }
                if let Some(id) = run.interaction {
                    self.interactions.abandon(id);
                }
                run.prompt = None;
                run.phase = Phase::Done;
            }
            stream
                .trackers
                .values()
                .flat_map(|t| t.unfinished().map(String::from))
                .collect()
        };
        for child in children {
            self.cancel_stream(&child, actions);
        }
    }

    fn cancel_all(&mut self, actions: &mut Vec<WorkflowAction>) {
        self.interactions.abandon_all();
        let ids: Vec<String> = self.streams.keys().cloned().collect();
        for id in ids {
            self.cancel_stream(&id, actions);
        }
    }

    fn fail_run(&mut self, error: WorkflowError, actions: &mut Vec<WorkflowAction>) {
        self.cancel_all(actions);
        actions.push(WorkflowAction::fail(error));
        self.finished = true;
    }
}

fn expression_error(err: ExpressionError) -> ErrorOutcome {
    ErrorOutcome::new(EXPRESSION_ERROR, err.to_string())
        .with_details(json!({ "expression": err.snippet() }))
}

// ============================================================================
// Workflow Callbacks
// ============================================================================

impl Workflow for DslWorkflow {
    fn workflow_type(&self) -> &str {
        WORKFLOW_TYPE
    }

    fn on_start(&mut self, ctx: &WorkflowContext) -> Vec<WorkflowAction> {
        self.workflow_id = ctx.workflow_id;
        let context = ExecutionContext::new(self.trigger.clone(), self.inputs.clone());
        let root = self.new_stream(Vec::new(), None, context);
        self.streams.insert(ROOT_STREAM.to_string(), root);

        if !ctx.replaying {
            info!(
                workflow_id = %ctx.workflow_id,
                title = self.plan.definition().title.as_deref().unwrap_or_default(),
                actions = self.plan.definition().actions.len(),
                "run started"
            );
        }

        let mut actions = Vec::new();
        self.advance(ctx, &mut actions);
        actions
    }

    fn on_activity_completed(
        &mut self,
        ctx: &WorkflowContext,
        activity_id: &str,
        result: Value,
    ) -> Vec<WorkflowAction> {
        let mut actions = Vec::new();
        let Some((stream_id, action_ref, attempt)) = parse_activity(activity_id) else {
            warn!(workflow_id = %ctx.workflow_id, activity_id, "malformed activity id");
            return actions;
        };
        if self.finished || !self.take_in_flight(&stream_id, &action_ref, attempt) {
            debug!(workflow_id = %ctx.workflow_id, activity_id, "stale activity result ignored");
            return actions;
        }
        let plan = Arc::clone(&self.plan);
        let Some(node) = plan.node(&action_ref) else {
            return actions;
        };

        let candidate = ActionOutcome::success(result);
        let condition = match node
            .statement
            .retry_policy
            .as_ref()
            .and_then(|p| p.retry_until.as_deref())
        {
            None => Ok(None),
            Some(until) => self
                .streams
                .get(&stream_id)
                .map(|s| s.context.rebind(&action_ref, candidate.clone()))
                .ok_or_else(|| ErrorOutcome::new(OBJECT_STORE_ERROR, "stream vanished"))
                .and_then(|scratch| self.bindings(&scratch))
                .and_then(|bindings| {
                    self.evaluator
                        .eval_bool(unwrap_expression(until), &bindings)
                        .map_err(expression_error)
                })
                .map(Some),
        };

        let Some(run) = self.run_mut(&stream_id, &action_ref) else {
            return actions;
        };
        run.last = Some(candidate.clone());
        let decision = match condition {
            Ok(condition) => run.retry.on_success(candidate, condition, ctx.now),
            Err(err) => run.retry.fail(err),
        };
        self.conclude(ctx, &stream_id, node, decision, &mut actions);
        self.advance(ctx, &mut actions);
        actions
    }

    fn on_activity_failed(
        &mut self,
        ctx: &WorkflowContext,
        activity_id: &str,
        error: &ActivityError,
    ) -> Vec<WorkflowAction> {
        let mut actions = Vec::new();
        let Some((stream_id, action_ref, attempt)) = parse_activity(activity_id) else {
            warn!(workflow_id = %ctx.workflow_id, activity_id, "malformed activity id");
            return actions;
        };
        if self.finished || !self.take_in_flight(&stream_id, &action_ref, attempt) {
            debug!(workflow_id = %ctx.workflow_id, activity_id, "stale activity failure ignored");
            return actions;
        }
        let plan = Arc::clone(&self.plan);
        let Some(node) = plan.node(&action_ref) else {
            return actions;
        };

        if !ctx.replaying {
            info!(
                workflow_id = %ctx.workflow_id,
                stream = %stream_id,
                action_ref = %action_ref,
                attempt,
                error = %error,
                "action attempt failed"
            );
        }
        let Some(run) = self.run_mut(&stream_id, &action_ref) else {
            return actions;
        };
        let decision = run.retry.on_error(InvocationError::from(error), ctx.now);
        self.conclude(ctx, &stream_id, node, decision, &mut actions);
        self.advance(ctx, &mut actions);
        actions
    }

    fn on_timer_fired(&mut self, ctx: &WorkflowContext, timer_id: &str) -> Vec<WorkflowAction> {
        let mut actions = Vec::new();
        if self.finished {
            return actions;
        }
        let Some((stream_id, action_ref, kind)) = split_id(timer_id)
            .and_then(|(s, r, k)| TimerKind::parse(k).map(|k| (s.to_string(), r.to_string(), k)))
        else {
            warn!(workflow_id = %ctx.workflow_id, timer_id, "malformed timer id");
            return actions;
        };
        let plan = Arc::clone(&self.plan);
        let Some(node) = plan.node(&action_ref) else {
            return actions;
        };

        let live = self
            .streams
            .get(&stream_id)
            .is_some_and(|s| !s.finished);
        let armed = match self.run_mut(&stream_id, &action_ref) {
            Some(run) if live => run.timers.remove(&kind).then_some(run.phase),
            _ => None,
        };
        let Some(phase) = armed else {
            debug!(workflow_id = %ctx.workflow_id, timer_id, "stale timer ignored");
            return actions;
        };

        match (kind, phase) {
            (TimerKind::Start, Phase::Delayed) => {
                self.start_node(ctx, &stream_id, node, &mut actions);
            }
            (TimerKind::RetryDelay, Phase::Running) => {
                self.dispatch_attempt(ctx, &stream_id, node, &mut actions);
            }
            (TimerKind::RetryDeadline, Phase::Running) => {
                let Some(run) = self.run_mut(&stream_id, &action_ref) else {
                    return actions;
                };
                let outcome = run.retry.on_deadline();
                let interaction = run.interaction;
                if let Some(id) = interaction {
                    self.interactions.abandon(id);
                }
                self.settle(ctx, &stream_id, &action_ref, outcome, &mut actions);
            }
            (TimerKind::InteractionTimeout, Phase::Running) => {
                let interaction = self
                    .run_mut(&stream_id, &action_ref)
                    .and_then(|run| run.interaction);
                if let Some(id) = interaction {
                    if self.interactions.abandon(id) {
                        let err = ErrorOutcome::new(
                            INTERACTION_TIMEOUT,
                            format!("no response for interaction {}", id),
                        )
                        .with_details(json!({ "interaction_id": id }));
                        self.settle(ctx, &stream_id, &action_ref, err.into(), &mut actions);
                    }
                }
            }
            _ => {
                debug!(workflow_id = %ctx.workflow_id, timer_id, "timer fired in unexpected phase");
            }
        }

        self.advance(ctx, &mut actions);
        actions
    }

    fn on_signal(&mut self, ctx: &WorkflowContext, signal: &WorkflowSignal) -> Vec<WorkflowAction> {
        let mut actions = Vec::new();
        if self.finished || !signal.is_cancel() {
            debug!(workflow_id = %ctx.workflow_id, signal_type = %signal.signal_type, "signal ignored");
            return actions;
        }

        let reason = signal.reason().unwrap_or("cancelled").to_string();
        if !ctx.replaying {
            info!(
                workflow_id = %ctx.workflow_id,
                %reason,
                pending_interactions = self.interactions.pending().count(),
                "cancelling run"
            );
        }
        self.cancel_all(&mut actions);
        actions.push(WorkflowAction::cancel(reason, Some(self.context_snapshot())));
        self.finished = true;
        actions
    }

    fn validate_update(&self, update: &WorkflowUpdate) -> Result<(), UpdateRejected> {
        if update.name != UPDATE_HANDLER {
            return Err(UpdateRejected::UnknownHandler(update.name.clone()));
        }
        let parsed = InteractionUpdate::parse(&update.payload)?;
        self.interactions.validate(&parsed)?;
        Ok(())
    }

    fn on_update(
        &mut self,
        ctx: &WorkflowContext,
        update: &WorkflowUpdate,
    ) -> (Value, Vec<WorkflowAction>) {
        let mut actions = Vec::new();
        let parsed = match InteractionUpdate::parse(&update.payload) {
            Ok(parsed) => parsed,
            Err(e) => return (json!({ "status": "rejected", "reason": e.to_string() }), actions),
        };
        let (stream_id, action_ref, kind) = match self.interactions.complete(&parsed) {
            Ok(state) => (state.stream.clone(), state.action_ref.clone(), state.kind),
            Err(e) => return (json!({ "status": "rejected", "reason": e.to_string() }), actions),
        };
        if !ctx.replaying {
            info!(
                workflow_id = %ctx.workflow_id,
                stream = %stream_id,
                action_ref = %action_ref,
                interaction_id = %parsed.interaction_id,
                "interaction completed"
            );
        }

        let prompt = self
            .run_mut(&stream_id, &action_ref)
            .filter(|run| run.phase == Phase::Running)
            .and_then(|run| run.prompt.take());
        if let Some(prompt) = prompt {
            let outcome =
                prompt.with_interaction(parsed.interaction_id, kind.as_str(), parsed.data.clone());
            self.settle(ctx, &stream_id, &action_ref, outcome, &mut actions);
            self.advance(ctx, &mut actions);
        }
        (parsed.ack(), actions)
    }

    fn query(&self, name: &str) -> Result<Value, QueryError> {
        match name {
            queries::INTERACTIONS => Ok(self.interactions.snapshot()),
            queries::CONTEXT => Ok(self.context_snapshot()),
            other => Err(QueryError::UnknownHandler(other.to_string())),
        }
    }
}

fn parse_activity(id: &str) -> Option<(String, String, u32)> {
    let (stream, action_ref, attempt) = split_id(id)?;
    Some((stream.to_string(), action_ref.to_string(), attempt.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::TemplateEvaluator;
    use crate::objects::InMemoryObjectStore;
    use crate::registry::InMemoryActionRegistry;
    use chrono::{DateTime, Utc};

    fn t0() -> DateTime<Utc> {
        "2024-05-01T12:00:00Z".parse().unwrap()
    }

    fn ctx_at(now: DateTime<Utc>) -> WorkflowContext {
        WorkflowContext::new(Uuid::nil(), now, false)
    }

    fn workflow(actions: Value) -> DslWorkflow {
        let factory = DslWorkflowFactory::new(
            Arc::new(InMemoryActionRegistry::with_builtins()),
            Arc::new(TemplateEvaluator::new()),
            Arc::new(InMemoryObjectStore::new()),
            &RuntimeConfig::default(),
        );
        factory
            .create(json!({
                "definition": { "actions": actions },
                "trigger": { "ip": "10.0.0.1" },
            }))
            .unwrap()
    }

    fn scheduled(actions: &[WorkflowAction]) -> Vec<(String, Value)> {
        actions
            .iter()
            .filter_map(|a| match a {
                WorkflowAction::ScheduleActivity {
                    activity_id, input, ..
                } => Some((activity_id.clone(), input.clone())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_ids_round_trip() {
        let id = activity_id("hosts[3]", "ping", 2);
        assert_eq!(id, "hosts[3]:ping:2");
        assert_eq!(
            parse_activity(&id),
            Some(("hosts[3]".to_string(), "ping".to_string(), 2))
        );
        let timer = timer_id(ROOT_STREAM, "a", TimerKind::RetryDeadline);
        let (_, _, kind) = split_id(&timer).unwrap();
        assert_eq!(TimerKind::parse(kind), Some(TimerKind::RetryDeadline));
        assert_eq!(parse_activity("garbage"), None);
    }

    #[test]
    fn test_readiness_join_strategies() {
        let wf = workflow(json!([
            {"ref": "a", "action": "core.noop"},
            {"ref": "b", "action": "core.noop"},
            {"ref": "all", "action": "core.noop", "depends_on": ["a", "b"]},
            {"ref": "any", "action": "core.noop", "depends_on": ["a", "b"], "join_strategy": "any"},
            {"ref": "on_err", "action": "core.noop", "depends_on": ["a.error"]},
        ]));
        let plan = wf.plan();
        let mut context = ExecutionContext::new(json!({}), json!({}));
        context
            .record("a", ActionOutcome::error(ErrorOutcome::new("Boom", "x")))
            .unwrap();

        assert!(matches!(
            readiness(plan.node("all").unwrap(), &context),
            Readiness::Skip(r) if r == "dependency 'a' failed"
        ));
        assert_eq!(readiness(plan.node("any").unwrap(), &context), Readiness::Blocked);
        assert_eq!(readiness(plan.node("on_err").unwrap(), &context), Readiness::Ready);

        context.record("b", ActionOutcome::success(json!(1))).unwrap();
        assert_eq!(readiness(plan.node("any").unwrap(), &context), Readiness::Ready);
    }

    #[test]
    fn test_start_schedules_roots_then_dependents() {
        let mut wf = workflow(json!([
            {"ref": "a", "action": "core.transform.reshape", "args": {"value": "${{ TRIGGER.ip }}"}},
            {"ref": "b", "action": "core.noop", "depends_on": ["a"],
             "args": {"seen": "${{ ACTIONS.a.result }}"}},
        ]));
        let ctx = ctx_at(t0());
        let actions = wf.on_start(&ctx);
        let first = scheduled(&actions);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].0, "root:a:1");
        assert_eq!(first[0].1["args"], json!({"value": "10.0.0.1"}));

        let actions = wf.on_activity_completed(&ctx, "root:a:1", json!("10.0.0.1"));
        let next = scheduled(&actions);
        assert_eq!(next[0].0, "root:b:1");
        assert_eq!(next[0].1["args"]["seen"], "10.0.0.1");

        // A duplicate delivery is stale
        assert!(wf.on_activity_completed(&ctx, "root:a:1", json!("again")).is_empty());

        let actions = wf.on_activity_completed(&ctx, "root:b:1", Value::Null);
        assert!(matches!(actions.last(), Some(WorkflowAction::CompleteWorkflow { .. })));
    }

    #[test]
    fn test_past_wait_until_creates_no_timer() {
        let mut wf = workflow(json!([
            {"ref": "a", "action": "core.noop", "wait_until": "2024-01-01T00:00:00Z"},
        ]));
        let actions = wf.on_start(&ctx_at(t0()));
        assert!(!actions.iter().any(|a| matches!(a, WorkflowAction::StartTimer { .. })));
        assert_eq!(scheduled(&actions).len(), 1);
    }

    #[test]
    fn test_future_wait_until_creates_one_timer() {
        let mut wf = workflow(json!([
            {"ref": "a", "action": "core.noop", "wait_until": "in 1 hour"},
        ]));
        let ctx = ctx_at(t0());
        let actions = wf.on_start(&ctx);
        assert_eq!(
            actions,
            vec![WorkflowAction::timer(
                "root:a:start",
                Duration::from_secs(3600)
            )]
        );

        let later = ctx_at(t0() + chrono::Duration::hours(1));
        let actions = wf.on_timer_fired(&later, "root:a:start");
        assert_eq!(scheduled(&actions).len(), 1);
        // Firing again is inert
        assert!(wf.on_timer_fired(&later, "root:a:start").is_empty());
    }

    #[test]
    fn test_unarmed_timer_kind_is_ignored() {
        let mut wf = workflow(json!([
            {"ref": "a", "action": "core.noop", "wait_until": "in 1 hour"},
        ]));
        let ctx = ctx_at(t0());
        wf.on_start(&ctx);

        // Only the start timer is armed for `a`
        assert!(wf.on_timer_fired(&ctx, "root:a:retry_deadline").is_empty());
        assert!(wf.on_timer_fired(&ctx, "root:missing:start").is_empty());

        let later = ctx_at(t0() + chrono::Duration::hours(1));
        assert_eq!(scheduled(&wf.on_timer_fired(&later, "root:a:start")).len(), 1);
    }

    #[test]
    fn test_unhandled_error_fails_run_with_context() {
        let mut wf = workflow(json!([
            {"ref": "a", "action": "core.noop"},
            {"ref": "b", "action": "core.noop", "depends_on": ["a"]},
        ]));
        let ctx = ctx_at(t0());
        wf.on_start(&ctx);
        let actions = wf.on_activity_failed(
            &ctx,
            "root:a:1",
            &ActivityError::non_retryable("lookup refused").with_type("Forbidden"),
        );
        let Some(WorkflowAction::FailWorkflow { error }) = actions.last() else {
            panic!("expected failure, got {:?}", actions);
        };
        assert_eq!(error.code.as_deref(), Some("Forbidden"));
        let details = error.details.as_ref().unwrap();
        assert_eq!(details["action_ref"], "a");
        assert_eq!(details["context"]["ACTIONS"]["a"]["status"], "error");
    }

    #[test]
    fn test_error_edge_handles_failure() {
        let mut wf = workflow(json!([
            {"ref": "a", "action": "core.noop"},
            {"ref": "cleanup", "action": "core.noop", "depends_on": ["a.error"]},
            {"ref": "next", "action": "core.noop", "depends_on": ["a"]},
        ]));
        let ctx = ctx_at(t0());
        wf.on_start(&ctx);
        let actions = wf.on_activity_failed(&ctx, "root:a:1", &ActivityError::non_retryable("no"));
        assert_eq!(scheduled(&actions)[0].0, "root:cleanup:1");

        let actions = wf.on_activity_completed(&ctx, "root:cleanup:1", Value::Null);
        let Some(WorkflowAction::CompleteWorkflow { result }) = actions.last() else {
            panic!("expected completion");
        };
        assert_eq!(result["ACTIONS"]["next"]["status"], "skipped");
        assert_eq!(result["ACTIONS"]["next"]["reason"], "dependency 'a' failed");
    }

    #[test]
    fn test_cancel_signal_abandons_and_cancels() {
        let mut wf = workflow(json!([
            {"ref": "approve", "action": "core.noop", "interaction": {"type": "approval", "timeout": 60}},
        ]));
        let ctx = ctx_at(t0());
        wf.on_start(&ctx);
        assert_eq!(wf.interactions.pending().count(), 1);

        let actions = wf.on_signal(&ctx, &WorkflowSignal::cancel("analyst aborted"));
        assert!(actions.contains(&WorkflowAction::cancel_activity("root:approve:1")));
        assert!(actions.contains(&WorkflowAction::cancel_timer(
            "root:approve:interaction_timeout"
        )));
        assert!(matches!(
            actions.last(),
            Some(WorkflowAction::CancelWorkflow {
                reason,
                details: Some(_),
            }) if reason == "analyst aborted"
        ));
        let view = wf.query(queries::INTERACTIONS).unwrap();
        assert_eq!(view["approve"]["status"], "abandoned");
    }

    #[test]
    fn test_interaction_needs_prompt_and_update() {
        let mut wf = workflow(json!([
            {"ref": "approve", "action": "core.noop", "interaction": {"type": "approval"}},
        ]));
        let ctx = ctx_at(t0());
        wf.on_start(&ctx);
        let id = crate::interaction::interaction_id(Uuid::nil(), ROOT_STREAM, "approve");

        let update = WorkflowUpdate::new(
            UPDATE_HANDLER,
            InteractionUpdate::new(id, json!({"approved": true})).to_value(),
        );
        assert!(wf.validate_update(&update).is_ok());
        let (ack, actions) = wf.on_update(&ctx, &update);
        assert_eq!(ack["status"], "accepted");
        assert!(actions.is_empty());
        assert!(matches!(
            wf.validate_update(&update),
            Err(UpdateRejected::Rejected(_))
        ));

        let actions = wf.on_activity_completed(&ctx, "root:approve:1", Value::Null);
        let Some(WorkflowAction::CompleteWorkflow { result }) = actions.last() else {
            panic!("expected completion");
        };
        let outcome = &result["ACTIONS"]["approve"];
        assert_eq!(outcome["interaction"], json!({"approved": true}));
        assert_eq!(outcome["interaction_type"], "approval");
    }

    #[test]
    fn test_unknown_query_and_update() {
        let wf = workflow(json!([{"ref": "a", "action": "core.noop"}]));
        assert!(matches!(wf.query("nope"), Err(QueryError::UnknownHandler(_))));
        let update = WorkflowUpdate::new("nope", json!({}));
        assert!(matches!(
            wf.validate_update(&update),
            Err(UpdateRejected::UnknownHandler(_))
        ));
    }
}
