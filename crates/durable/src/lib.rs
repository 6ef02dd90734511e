//! # Durable Execution Substrate
//!
//! An event-sourced workflow substrate for deterministic, replayable runs.
//!
//! ## Features
//!
//! - **Event-sourced workflows**: every state change is an appended, timestamped
//!   history event; state is rebuilt by replaying history
//! - **Durable clock**: callbacks see the instant their event was recorded,
//!   never wall-clock time
//! - **Durable timers**: armed in the store, fired when the clock reaches them
//! - **Activity task queue**: FIFO claims, bounded concurrency, optional
//!   redelivery of retryable failures
//! - **Channels**: signals, validated updates with acks, read-only queries
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkflowExecutor                        │
//! │  (replays history, applies new events, persists actions)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   WorkflowEventStore                         │
//! │  (history, task queue, armed timers)                        │
//! └─────────────────────────────────────────────────────────────┘
//!                   │                            │
//!                   ▼                            ▼
//! ┌──────────────────────────────┐ ┌──────────────────────────────┐
//! │        ActivityWorker         │ │         TimerService          │
//! │  (claims + executes tasks)   │ │  (fires due timers)          │
//! └──────────────────────────────┘ └──────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use warden_durable::prelude::*;
//!
//! let store = Arc::new(InMemoryWorkflowEventStore::new());
//! let mut executor = WorkflowExecutor::new(store, Arc::new(SystemClock));
//! executor.register("my_workflow", |input| Ok(Box::new(MyWorkflow::new(input)?) as Box<dyn Workflow>));
//! let executor = Arc::new(executor);
//!
//! let mut worker = ActivityWorker::new(executor.clone(), WorkerConfig::default());
//! worker.register("my_activity", Arc::new(MyActivity));
//!
//! let workflow_id = executor.start_workflow("my_workflow", json!({})).await?;
//! worker.run_once().await?;
//! ```

pub mod activity;
pub mod clock;
pub mod engine;
pub mod persistence;
pub mod reliability;
pub mod worker;
pub mod workflow;

/// Prelude for common imports
pub mod prelude {
    pub use crate::activity::{ActivityContext, ActivityError, ActivityHandler};
    pub use crate::clock::{DurableClock, ManualClock, SystemClock};
    pub use crate::engine::{ExecutorConfig, ExecutorError, WorkflowExecutor, WorkflowRegistry};
    pub use crate::persistence::{
        InMemoryWorkflowEventStore, StoreError, WorkflowEventStore, WorkflowStatus,
    };
    pub use crate::reliability::RetryPolicy;
    pub use crate::worker::{ActivityWorker, TimerService, WorkerConfig, WorkerError};
    pub use crate::workflow::{
        ActivityOptions, QueryError, UpdateRejected, Workflow, WorkflowAction, WorkflowContext,
        WorkflowError, WorkflowEvent, WorkflowSignal, WorkflowUpdate,
    };
}

// Re-export key types at crate root
pub use activity::{ActivityContext, ActivityError, ActivityHandler};
pub use clock::{DurableClock, ManualClock, SystemClock};
pub use engine::{ExecutorConfig, ExecutorError, ProcessResult, WorkflowExecutor, WorkflowRegistry};
pub use persistence::{
    InMemoryWorkflowEventStore, StoreError, WorkflowEventStore, WorkflowInfo, WorkflowStatus,
};
pub use reliability::RetryPolicy;
pub use worker::{ActivityWorker, TimerService, WorkerConfig, WorkerError};
pub use workflow::{
    ActivityOptions, HistoryEvent, QueryError, UpdateRejected, Workflow, WorkflowAction,
    WorkflowContext, WorkflowError, WorkflowEvent, WorkflowSignal, WorkflowUpdate,
};
