//! History events

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ActivityOptions, WorkflowError, WorkflowSignal};
use crate::activity::ActivityError;

/// One entry of a workflow's append-only history
///
/// Replay feeds these back into a fresh workflow instance in sequence order,
/// so every variant must carry everything the workflow needs to reach the
/// same decision again. Nothing here is ever rewritten.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    WorkflowStarted {
        input: Value,
    },
    WorkflowCompleted {
        result: Value,
    },
    WorkflowFailed {
        error: WorkflowError,
    },
    WorkflowCancelled {
        reason: String,
        /// Partial state kept for inspection after cancellation
        details: Option<Value>,
    },

    ActivityScheduled {
        activity_id: String,
        activity_type: String,
        input: Value,
        options: ActivityOptions,
    },
    ActivityCompleted {
        activity_id: String,
        result: Value,
    },
    /// Recorded once the task queue has given up redelivering
    ActivityFailed {
        activity_id: String,
        error: ActivityError,
    },
    ActivityCancelled {
        activity_id: String,
    },

    /// `fire_at` is fixed when the timer is armed; replay never recomputes it
    TimerStarted {
        timer_id: String,
        duration_ms: u64,
        fire_at: DateTime<Utc>,
    },
    TimerFired {
        timer_id: String,
    },
    TimerCancelled {
        timer_id: String,
    },

    SignalReceived {
        signal: WorkflowSignal,
    },
    /// Only accepted updates reach history; rejections leave no trace
    UpdateAccepted {
        update_id: String,
        name: String,
        payload: Value,
        ack: Value,
    },
}

impl WorkflowEvent {
    /// The serialized `type` tag
    pub fn name(&self) -> &'static str {
        match self {
            Self::WorkflowStarted { .. } => "workflow_started",
            Self::WorkflowCompleted { .. } => "workflow_completed",
            Self::WorkflowFailed { .. } => "workflow_failed",
            Self::WorkflowCancelled { .. } => "workflow_cancelled",
            Self::ActivityScheduled { .. } => "activity_scheduled",
            Self::ActivityCompleted { .. } => "activity_completed",
            Self::ActivityFailed { .. } => "activity_failed",
            Self::ActivityCancelled { .. } => "activity_cancelled",
            Self::TimerStarted { .. } => "timer_started",
            Self::TimerFired { .. } => "timer_fired",
            Self::TimerCancelled { .. } => "timer_cancelled",
            Self::SignalReceived { .. } => "signal_received",
            Self::UpdateAccepted { .. } => "update_accepted",
        }
    }
}

/// An event as stored: position plus the durable instant it was appended
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEvent {
    /// 0-based position in the history
    pub sequence: i32,
    pub recorded_at: DateTime<Utc>,
    pub event: WorkflowEvent,
}
