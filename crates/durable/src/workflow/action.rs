//! Workflow actions and activity options

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::WorkflowError;
use crate::reliability::{millis, RetryPolicy};

/// What a workflow asks the executor to do after handling an event
///
/// The executor turns each action into a history event first and performs
/// the side effect (enqueue a task, arm a timer) only after the append
/// succeeds. During replay actions are dropped: the history already holds
/// their events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowAction {
    ScheduleActivity {
        /// Unique within the workflow; reusing one is a determinism bug
        activity_id: String,
        /// Handler name on the activity worker
        activity_type: String,
        input: Value,
        options: ActivityOptions,
    },
    StartTimer {
        timer_id: String,
        /// Relative to the durable clock at the moment the action is applied
        #[serde(with = "millis")]
        duration: Duration,
    },
    /// Disarm a timer; a firing already in flight is ignored
    CancelTimer {
        timer_id: String,
    },
    /// Drop a queued task or flag a running one as cancelled
    CancelActivity {
        activity_id: String,
    },
    CompleteWorkflow {
        result: Value,
    },
    FailWorkflow {
        error: WorkflowError,
    },
    /// Ends the run as cancelled, which is not a failure
    CancelWorkflow {
        reason: String,
        details: Option<Value>,
    },
}

impl WorkflowAction {
    /// Schedule with [`ActivityOptions::default`]
    pub fn schedule_activity(
        activity_id: impl Into<String>,
        activity_type: impl Into<String>,
        input: Value,
    ) -> Self {
        Self::ScheduleActivity {
            activity_id: activity_id.into(),
            activity_type: activity_type.into(),
            input,
            options: ActivityOptions::default(),
        }
    }

    pub fn timer(timer_id: impl Into<String>, duration: Duration) -> Self {
        Self::StartTimer {
            timer_id: timer_id.into(),
            duration,
        }
    }

    pub fn cancel_timer(timer_id: impl Into<String>) -> Self {
        Self::CancelTimer {
            timer_id: timer_id.into(),
        }
    }

    pub fn cancel_activity(activity_id: impl Into<String>) -> Self {
        Self::CancelActivity {
            activity_id: activity_id.into(),
        }
    }

    pub fn complete(result: Value) -> Self {
        Self::CompleteWorkflow { result }
    }

    pub fn fail(error: WorkflowError) -> Self {
        Self::FailWorkflow { error }
    }

    pub fn cancel(reason: impl Into<String>, details: Option<Value>) -> Self {
        Self::CancelWorkflow {
            reason: reason.into(),
            details,
        }
    }
}

/// Per-task execution settings, stored with the task
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityOptions {
    /// Redelivery of failures the handler marked retryable
    pub retry_policy: RetryPolicy,

    /// Budget for a single attempt
    #[serde(with = "millis")]
    pub start_to_close_timeout: Duration,
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::no_retry(),
            start_to_close_timeout: Duration::from_secs(300),
        }
    }
}

impl ActivityOptions {
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_start_to_close_timeout(mut self, timeout: Duration) -> Self {
        self.start_to_close_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scheduled_action_runs_once_by_default() {
        let input = json!({"ip": "1.2.3.4"});
        let action = WorkflowAction::schedule_activity("root:lookup:1", "run_action", input);

        let WorkflowAction::ScheduleActivity { options, .. } = action else {
            panic!("expected a scheduled activity");
        };
        assert_eq!(options.retry_policy, RetryPolicy::no_retry());
        assert_eq!(options.start_to_close_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_durations_encode_as_millis() {
        let timer = WorkflowAction::timer("root:a:start", Duration::from_secs(90));
        let timer = serde_json::to_value(timer).unwrap();
        assert_eq!(
            timer,
            json!({"type": "start_timer", "timer_id": "root:a:start", "duration": 90000})
        );

        let options = ActivityOptions::default()
            .with_start_to_close_timeout(Duration::from_millis(1500))
            .with_retry(RetryPolicy::fixed(Duration::from_secs(1), 2));
        let encoded = serde_json::to_value(&options).unwrap();
        assert_eq!(encoded["start_to_close_timeout"], 1500);
        assert_eq!(serde_json::from_value::<ActivityOptions>(encoded).unwrap(), options);
    }

    #[test]
    fn test_cancel_keeps_details() {
        let action = WorkflowAction::cancel("analyst stop", Some(json!({"stage": "enrich"})));
        assert_eq!(
            serde_json::to_value(&action).unwrap(),
            json!({
                "type": "cancel_workflow",
                "reason": "analyst stop",
                "details": {"stage": "enrich"},
            })
        );
    }
}
