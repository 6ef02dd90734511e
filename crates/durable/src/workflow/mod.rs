//! Workflow state machines and the vocabulary they speak
//!
//! A [`Workflow`] reacts to [`WorkflowEvent`]s with [`WorkflowAction`]s.
//! Outside callers reach a running workflow through signals, updates and
//! queries.

mod action;
mod channel;
mod definition;
mod event;

pub use action::{ActivityOptions, WorkflowAction};
pub use channel::{signal_types, QueryError, UpdateRejected, WorkflowSignal, WorkflowUpdate};
pub use definition::{Workflow, WorkflowContext, WorkflowError};
pub use event::{HistoryEvent, WorkflowEvent};
