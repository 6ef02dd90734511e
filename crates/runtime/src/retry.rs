//! Retry controller
//!
//! Per-statement state machine `PENDING -> RUNNING -> {SUCCEEDED, FAILED}`
//! with a `RUNNING -> RUNNING` self-loop on retry. It performs no I/O: the
//! dispatcher feeds it attempt results (and the `retry_until` verdict for
//! success candidates) and acts on the returned [`RetryDecision`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::dsl::ActionRetryPolicy;
use crate::outcome::{ActionOutcome, ErrorOutcome};
use crate::registry::InvocationError;

/// Error kind when `max_attempts` runs out
pub const RETRY_EXHAUSTED: &str = "RetryExhausted";
/// Error kind when the retry budget runs out
pub const RETRY_TIMEOUT: &str = "RetryTimeout";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// What to do after an attempt
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// The statement is finished with this outcome
    Done(ActionOutcome),
    /// Invoke `attempt` next, after `delay` when set
    Retry {
        attempt: u32,
        delay: Option<Duration>,
    },
}

#[derive(Debug, Clone)]
pub struct RetryController {
    policy: Option<ActionRetryPolicy>,
    state: RetryState,
    attempt: u32,
    deadline: Option<DateTime<Utc>>,
}

impl RetryController {
    pub fn new(policy: Option<ActionRetryPolicy>) -> Self {
        Self {
            policy,
            state: RetryState::Pending,
            attempt: 0,
            deadline: None,
        }
    }

    pub fn state(&self) -> RetryState {
        self.state
    }

    /// Current attempt, 1-based once running
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.deadline
    }

    pub fn retry_until(&self) -> Option<&str> {
        self.policy.as_ref().and_then(|p| p.retry_until.as_deref())
    }

    /// Start the first attempt; the timeout budget runs from `now`
    pub fn begin(&mut self, now: DateTime<Utc>) -> u32 {
        self.state = RetryState::Running;
        self.attempt = 1;
        self.deadline = self
            .policy
            .as_ref()
            .and_then(|p| p.timeout)
            .and_then(|secs| {
                now.checked_add_signed(chrono::Duration::milliseconds((secs * 1000.0) as i64))
            });
        self.attempt
    }

    /// A successful invocation; `condition` is the `retry_until` verdict, if any
    pub fn on_success(
        &mut self,
        candidate: ActionOutcome,
        condition: Option<bool>,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        match condition {
            None | Some(true) => {
                self.state = RetryState::Succeeded;
                RetryDecision::Done(candidate)
            }
            Some(false) => self.next(now, candidate.to_value()),
        }
    }

    /// A failed invocation
    ///
    /// Retried only when a policy with `max_attempts` exists, the error is
    /// retryable, and the bounds allow another attempt.
    pub fn on_error(&mut self, err: InvocationError, now: DateTime<Utc>) -> RetryDecision {
        let retries_errors = self
            .policy
            .as_ref()
            .is_some_and(|p| p.max_attempts.is_some());
        if err.retryable && retries_errors {
            let last = serde_json::to_value(&err).unwrap_or(Value::Null);
            return self.next(now, last);
        }
        self.fail(ErrorOutcome::from(err))
    }

    /// The timeout budget elapsed while an attempt was outstanding
    pub fn on_deadline(&mut self) -> ActionOutcome {
        let outcome = self.timeout_error(Value::Null);
        self.state = RetryState::Failed;
        outcome
    }

    /// Finish with an error decided outside the controller
    pub fn fail(&mut self, error: ErrorOutcome) -> RetryDecision {
        self.state = RetryState::Failed;
        RetryDecision::Done(ActionOutcome::error(error))
    }

    fn next(&mut self, now: DateTime<Utc>, last: Value) -> RetryDecision {
        if self.deadline.is_some_and(|deadline| now >= deadline) {
            let outcome = self.timeout_error(last);
            self.state = RetryState::Failed;
            return RetryDecision::Done(outcome);
        }

        let policy = self.policy.as_ref();
        if let Some(max) = policy.and_then(|p| p.max_attempts) {
            if self.attempt >= max {
                self.state = RetryState::Failed;
                return RetryDecision::Done(ActionOutcome::error(
                    ErrorOutcome::new(
                        RETRY_EXHAUSTED,
                        format!("condition not met after {} attempts", self.attempt),
                    )
                    .with_details(json!({
                        "attempts": self.attempt,
                        "max_attempts": max,
                        "last": last,
                    })),
                ));
            }
        }

        self.attempt += 1;
        let delay = policy
            .and_then(|p| p.backoff.as_ref())
            .map(|b| b.delay_for_attempt(self.attempt))
            .filter(|d| !d.is_zero());
        RetryDecision::Retry {
            attempt: self.attempt,
            delay,
        }
    }

    fn timeout_error(&self, last: Value) -> ActionOutcome {
        let timeout = self.policy.as_ref().and_then(|p| p.timeout);
        ActionOutcome::error(
            ErrorOutcome::new(
                RETRY_TIMEOUT,
                format!(
                    "retry budget of {}s exceeded after {} attempts",
                    timeout.unwrap_or_default(),
                    self.attempt
                ),
            )
            .with_details(json!({
                "attempts": self.attempt,
                "timeout": timeout,
                "last": last,
            })),
        )
    }
}
