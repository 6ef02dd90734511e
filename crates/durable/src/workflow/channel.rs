//! External channels into a running workflow
//!
//! - Signals are fire-and-forget and recorded in history.
//! - Updates are validated first; only accepted updates are recorded, and the
//!   caller receives the handler's acknowledgment.
//! - Queries are read-only and never touch history.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// External signal delivered to a running workflow
///
/// # Example
///
/// ```
/// use warden_durable::WorkflowSignal;
///
/// let signal = WorkflowSignal::cancel("analyst aborted the run");
/// assert!(signal.is_cancel());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowSignal {
    /// Signal type identifier
    pub signal_type: String,

    /// Signal payload (JSON)
    pub payload: serde_json::Value,
}

impl WorkflowSignal {
    /// Create a new signal
    pub fn new(signal_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            signal_type: signal_type.into(),
            payload,
        }
    }

    /// Create a cancellation signal
    pub fn cancel(reason: impl Into<String>) -> Self {
        Self::new(
            signal_types::CANCEL,
            serde_json::json!({ "reason": reason.into() }),
        )
    }

    /// Check if this is a cancellation signal
    pub fn is_cancel(&self) -> bool {
        self.signal_type == signal_types::CANCEL
    }

    /// Reason carried by a cancellation signal
    pub fn reason(&self) -> Option<&str> {
        self.payload.get("reason").and_then(|r| r.as_str())
    }
}

/// Common signal type constants
pub mod signal_types {
    /// Request workflow cancellation
    pub const CANCEL: &str = "cancel";
}

/// Synchronous request that mutates workflow state and returns an ack
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowUpdate {
    /// Caller-chosen id; resubmitting the same id returns the original ack
    pub update_id: String,

    /// Update handler name
    pub name: String,

    /// Update payload
    pub payload: serde_json::Value,
}

impl WorkflowUpdate {
    /// Create an update with a fresh id
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            update_id: uuid::Uuid::now_v7().to_string(),
            name: name.into(),
            payload,
        }
    }

    /// Use a caller-supplied id
    pub fn with_id(mut self, update_id: impl Into<String>) -> Self {
        self.update_id = update_id.into();
        self
    }
}

/// Why an update was refused by its validator
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpdateRejected {
    /// No handler with this name
    #[error("unknown update handler: {0}")]
    UnknownHandler(String),

    /// Payload did not deserialize
    #[error("invalid update payload: {0}")]
    InvalidPayload(String),

    /// Handler-specific refusal
    #[error("{0}")]
    Rejected(String),
}

/// Query failure
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueryError {
    /// No handler with this name
    #[error("unknown query handler: {0}")]
    UnknownHandler(String),

    /// Handler-specific failure
    #[error("query failed: {0}")]
    Failed(String),
}
