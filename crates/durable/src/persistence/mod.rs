//! Durable state: histories, the activity task queue and armed timers
//!
//! Only the in-memory store ships; it backs the CLI and every test.

mod memory;
mod store;

pub use memory::InMemoryWorkflowEventStore;
pub use store::{
    ClaimedTask, DueTimer, StoreError, TaskDefinition, TaskFailureOutcome, TaskStatus,
    WorkflowEventStore, WorkflowInfo, WorkflowStatus,
};
