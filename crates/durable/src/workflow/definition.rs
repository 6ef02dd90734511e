//! Workflow trait definition

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{QueryError, UpdateRejected, WorkflowAction, WorkflowSignal, WorkflowUpdate};
use crate::activity::ActivityError;

/// Error type for workflow failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowError {
    /// Error message
    pub message: String,

    /// Error code for programmatic handling
    pub code: Option<String>,

    /// Whether this error is retryable
    pub retryable: bool,

    /// Structured details (for a failed run: the final context snapshot)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl WorkflowError {
    /// Create a new workflow error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            retryable: false,
            details: None,
        }
    }

    /// Create a retryable error
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            ..Self::new(message)
        }
    }

    /// Set the error code
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Attach structured details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{}: {}", code, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for WorkflowError {}

/// Durable facts available to a workflow callback
///
/// `now` is the `recorded_at` instant of the event being applied, so a
/// callback sees the same time on first execution and on every replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkflowContext {
    /// Workflow instance ID
    pub workflow_id: Uuid,

    /// Durable "now" for this callback
    pub now: DateTime<Utc>,

    /// True while history is being replayed; returned actions are discarded
    pub replaying: bool,
}

impl WorkflowContext {
    /// Create a context for applying one event
    pub fn new(workflow_id: Uuid, now: DateTime<Utc>, replaying: bool) -> Self {
        Self {
            workflow_id,
            now,
            replaying,
        }
    }
}

/// A workflow is a deterministic state machine driven by events
///
/// The executor creates an instance through a factory registered in the
/// [`WorkflowRegistry`](crate::engine::WorkflowRegistry), replays the stored
/// history through these callbacks, then applies the new event and persists
/// the actions it returns.
///
/// # Determinism
///
/// Given the same sequence of events, a workflow must produce the same
/// sequence of actions. Read time only from [`WorkflowContext::now`] and
/// derive ids from workflow state, never from randomness.
///
/// # Example
///
/// ```ignore
/// struct Enrich {
///     indicator: String,
///     done: bool,
/// }
///
/// impl Workflow for Enrich {
///     fn workflow_type(&self) -> &str {
///         "enrich"
///     }
///
///     fn on_start(&mut self, _ctx: &WorkflowContext) -> Vec<WorkflowAction> {
///         vec![WorkflowAction::schedule_activity(
///             "lookup",
///             "threat_intel_lookup",
///             json!({ "indicator": self.indicator }),
///         )]
///     }
///
///     fn on_activity_completed(
///         &mut self,
///         _ctx: &WorkflowContext,
///         _activity_id: &str,
///         result: serde_json::Value,
///     ) -> Vec<WorkflowAction> {
///         self.done = true;
///         vec![WorkflowAction::complete(result)]
///     }
///
///     fn on_activity_failed(
///         &mut self,
///         _ctx: &WorkflowContext,
///         _activity_id: &str,
///         error: &ActivityError,
///     ) -> Vec<WorkflowAction> {
///         vec![WorkflowAction::fail(WorkflowError::new(error.to_string()))]
///     }
/// }
/// ```
pub trait Workflow: Send + 'static {
    /// Registered type name
    fn workflow_type(&self) -> &str;

    /// Called once when the workflow starts (and first during every replay)
    fn on_start(&mut self, ctx: &WorkflowContext) -> Vec<WorkflowAction>;

    /// Called when an activity completes successfully
    fn on_activity_completed(
        &mut self,
        ctx: &WorkflowContext,
        activity_id: &str,
        result: serde_json::Value,
    ) -> Vec<WorkflowAction>;

    /// Called when an activity fails after substrate redelivery is exhausted
    fn on_activity_failed(
        &mut self,
        ctx: &WorkflowContext,
        activity_id: &str,
        error: &ActivityError,
    ) -> Vec<WorkflowAction>;

    /// Called when a timer fires
    fn on_timer_fired(&mut self, ctx: &WorkflowContext, timer_id: &str) -> Vec<WorkflowAction> {
        let _ = (ctx, timer_id);
        vec![]
    }

    /// Called when an external signal is received
    fn on_signal(&mut self, ctx: &WorkflowContext, signal: &WorkflowSignal) -> Vec<WorkflowAction> {
        let _ = (ctx, signal);
        vec![]
    }

    /// Decide whether an update may be applied; must not mutate state
    fn validate_update(&self, update: &WorkflowUpdate) -> Result<(), UpdateRejected> {
        Err(UpdateRejected::UnknownHandler(update.name.clone()))
    }

    /// Apply an accepted update, returning the ack and any follow-up actions
    fn on_update(
        &mut self,
        ctx: &WorkflowContext,
        update: &WorkflowUpdate,
    ) -> (serde_json::Value, Vec<WorkflowAction>) {
        let _ = (ctx, update);
        (serde_json::Value::Null, vec![])
    }

    /// Read-only view of workflow state
    fn query(&self, name: &str) -> Result<serde_json::Value, QueryError> {
        Err(QueryError::UnknownHandler(name.to_string()))
    }
}
