//! Activity execution context

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use uuid::Uuid;

use super::ActivityError;

/// Identity of one activity attempt plus a cooperative cancellation flag
///
/// The worker flips the flag when the owning workflow cancels the activity or
/// the worker shuts down. Handlers check it between steps.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    pub task_id: Uuid,

    /// Delivery attempt of the task, starting at 1
    pub attempt: u32,

    pub workflow_id: Uuid,

    /// Id the workflow scheduled the activity under
    pub activity_id: String,

    cancelled: Arc<AtomicBool>,
}

impl ActivityContext {
    pub fn new(
        task_id: Uuid,
        workflow_id: Uuid,
        activity_id: impl Into<String>,
        attempt: u32,
    ) -> Self {
        Self {
            task_id,
            attempt,
            workflow_id,
            activity_id: activity_id.into(),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancellation_handle(&self) -> CancellationHandle {
        CancellationHandle {
            cancelled: self.cancelled.clone(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// `Err(cancelled)` once cancellation was requested
    pub fn ensure_active(&self) -> Result<(), ActivityError> {
        if self.is_cancelled() {
            return Err(ActivityError::cancelled(format!(
                "activity {} cancelled",
                self.activity_id
            )));
        }
        Ok(())
    }
}

/// Worker-side handle that cancels one running attempt
#[derive(Debug, Clone)]
pub struct CancellationHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancellationHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::kinds;

    #[test]
    fn test_new_attempt_is_active() {
        let workflow_id = Uuid::now_v7();
        let ctx = ActivityContext::new(Uuid::now_v7(), workflow_id, "root:ping:1", 1);

        assert_eq!(ctx.workflow_id, workflow_id);
        assert_eq!(ctx.activity_id, "root:ping:1");
        assert!(ctx.ensure_active().is_ok());
    }

    #[test]
    fn test_cancel_reaches_every_clone() {
        let ctx = ActivityContext::new(Uuid::now_v7(), Uuid::now_v7(), "root:ping:2", 2);
        let copy = ctx.clone();
        ctx.cancellation_handle().cancel();

        assert!(copy.is_cancelled());
        let err = ctx.ensure_active().unwrap_err();
        assert_eq!(err.error_type.as_deref(), Some(kinds::CANCELLED));
        assert!(err.message.contains("root:ping:2"));
    }
}
