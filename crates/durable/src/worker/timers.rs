//! Durable timer firing

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error};

use crate::engine::{ExecutorError, WorkflowExecutor};
use crate::persistence::WorkflowEventStore;

/// Fires armed timers whose time has come on the executor's durable clock
pub struct TimerService<S: WorkflowEventStore> {
    executor: Arc<WorkflowExecutor<S>>,
}

impl<S: WorkflowEventStore> TimerService<S> {
    pub fn new(executor: Arc<WorkflowExecutor<S>>) -> Self {
        Self { executor }
    }

    /// Deliver every due timer, earliest first; returns how many fired
    pub async fn fire_due(&self) -> Result<usize, ExecutorError> {
        let now = self.executor.clock().now();
        let due = self.executor.store().take_due_timers(now).await?;

        let mut fired = 0;
        for timer in due {
            debug!(workflow_id = %timer.workflow_id, timer_id = %timer.timer_id, fire_at = %timer.fire_at, "timer fired");
            match self
                .executor
                .on_timer_fired(timer.workflow_id, &timer.timer_id)
                .await
            {
                Ok(_) => fired += 1,
                Err(e) => {
                    error!(workflow_id = %timer.workflow_id, timer_id = %timer.timer_id, "failed to deliver timer: {}", e)
                }
            }
        }
        Ok(fired)
    }

    /// Earliest armed fire time
    pub async fn next_fire_at(&self) -> Result<Option<DateTime<Utc>>, ExecutorError> {
        Ok(self.executor.store().next_timer_at().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityError;
    use crate::clock::ManualClock;
    use crate::persistence::{InMemoryWorkflowEventStore, WorkflowStatus};
    use crate::workflow::{Workflow, WorkflowAction, WorkflowContext};
    use serde_json::{json, Value};
    use std::time::Duration;

    struct Sleeper;

    impl Workflow for Sleeper {
        fn workflow_type(&self) -> &str {
            "sleeper"
        }

        fn on_start(&mut self, _ctx: &WorkflowContext) -> Vec<WorkflowAction> {
            vec![WorkflowAction::timer("nap", Duration::from_secs(3600))]
        }

        fn on_timer_fired(&mut self, ctx: &WorkflowContext, timer_id: &str) -> Vec<WorkflowAction> {
            vec![WorkflowAction::complete(json!({ "timer": timer_id, "at": ctx.now }))]
        }

        fn on_activity_completed(
            &mut self,
            _: &WorkflowContext,
            _: &str,
            _: Value,
        ) -> Vec<WorkflowAction> {
            vec![]
        }

        fn on_activity_failed(
            &mut self,
            _: &WorkflowContext,
            _: &str,
            _: &ActivityError,
        ) -> Vec<WorkflowAction> {
            vec![]
        }
    }

    #[tokio::test]
    async fn test_fires_only_when_durable_clock_reaches_deadline() {
        let store = Arc::new(InMemoryWorkflowEventStore::new());
        let t0: DateTime<Utc> = "2024-05-01T12:00:00Z".parse().unwrap();
        let clock = Arc::new(ManualClock::at(t0));
        let mut executor = WorkflowExecutor::new(store, clock.clone());
        executor.register("sleeper", |_| Ok(Box::new(Sleeper) as Box<dyn Workflow>));
        let executor = Arc::new(executor);
        let timers = TimerService::new(executor.clone());

        let id = executor.start_workflow("sleeper", json!({})).await.unwrap();
        assert_eq!(
            timers.next_fire_at().await.unwrap(),
            Some(t0 + chrono::Duration::hours(1))
        );

        clock.advance(Duration::from_secs(3599));
        assert_eq!(timers.fire_due().await.unwrap(), 0);

        clock.advance(Duration::from_secs(1));
        assert_eq!(timers.fire_due().await.unwrap(), 1);

        let info = executor.workflow_info(id).await.unwrap();
        assert_eq!(info.status, WorkflowStatus::Completed);
        assert_eq!(
            info.result,
            Some(json!({ "timer": "nap", "at": t0 + chrono::Duration::hours(1) }))
        );
    }
}
