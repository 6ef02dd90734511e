//! Task and timer processing
//!
//! - [`ActivityWorker`] claims activity tasks and runs their handlers
//! - [`TimerService`] fires armed timers against the durable clock
//!
//! Both report back through the [`WorkflowExecutor`](crate::WorkflowExecutor),
//! which records the outcome in history and applies it to the workflow.

mod pool;
mod timers;

pub use pool::{ActivityWorker, WorkerConfig, WorkerError};
pub use timers::TimerService;
