//! Activity handler definition

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ActivityContext;

/// Failure kinds raised by the worker itself rather than by a handler
pub mod kinds {
    pub const HANDLER_NOT_FOUND: &str = "HandlerNotFound";
    pub const START_TO_CLOSE_TIMEOUT: &str = "StartToCloseTimeout";
    pub const PANIC: &str = "Panic";
    pub const CANCELLED: &str = "Cancelled";
}

/// A failed activity attempt, as recorded in `activity_failed`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityError {
    pub message: String,

    /// Machine-readable kind; workflows branch on this
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,

    /// Transient failure; the task's retry policy may redeliver it
    pub retryable: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ActivityError {
    fn new(message: impl Into<String>, retryable: bool) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable,
            details: None,
        }
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self::new(message, true)
    }

    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self::new(message, false)
    }

    /// The attempt was abandoned before or while it ran
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::non_retryable(message).with_type(kinds::CANCELLED)
    }

    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// `error_type`, or `ActivityError` when the handler gave none
    pub fn kind(&self) -> &str {
        self.error_type.as_deref().unwrap_or("ActivityError")
    }
}

impl std::fmt::Display for ActivityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.error_type {
            Some(error_type) => write!(f, "{}: {}", error_type, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for ActivityError {}

/// Executes one activity type
///
/// Handlers are registered on an [`ActivityWorker`](crate::worker::ActivityWorker)
/// under a type name. Input and output are JSON so the worker stays
/// type-erased.
///
/// ```ignore
/// struct Lookup;
///
/// #[async_trait]
/// impl ActivityHandler for Lookup {
///     async fn execute(&self, ctx: &ActivityContext, input: Value) -> Result<Value, ActivityError> {
///         let ip = input["ip"].as_str().ok_or_else(|| {
///             ActivityError::non_retryable("missing ip").with_type("InvalidInput")
///         })?;
///         Ok(json!({ "ip": ip, "reputation": "clean" }))
///     }
/// }
/// ```
#[async_trait]
pub trait ActivityHandler: Send + Sync + 'static {
    /// Run one attempt; transient failures should be `retryable`
    async fn execute(&self, ctx: &ActivityContext, input: Value) -> Result<Value, ActivityError>;
}
