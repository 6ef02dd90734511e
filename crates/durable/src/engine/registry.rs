//! Workflow factories by type name

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::workflow::{Workflow, WorkflowError};

/// Builds a workflow instance from its start input
///
/// Called once at start and again on every replay, so it must not have side
/// effects.
pub type WorkflowFactory =
    Arc<dyn Fn(Value) -> Result<Box<dyn Workflow>, WorkflowError> + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown workflow type: {0}")]
    UnknownWorkflowType(String),

    #[error("invalid workflow input: {0}")]
    InvalidInput(#[source] WorkflowError),
}

#[derive(Default)]
pub struct WorkflowRegistry {
    factories: HashMap<String, WorkflowFactory>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registering a name twice keeps the later factory
    pub fn register<F>(&mut self, workflow_type: impl Into<String>, factory: F)
    where
        F: Fn(Value) -> Result<Box<dyn Workflow>, WorkflowError> + Send + Sync + 'static,
    {
        self.factories.insert(workflow_type.into(), Arc::new(factory));
    }

    pub fn create(
        &self,
        workflow_type: &str,
        input: Value,
    ) -> Result<Box<dyn Workflow>, RegistryError> {
        match self.factories.get(workflow_type) {
            Some(factory) => factory(input).map_err(RegistryError::InvalidInput),
            None => Err(RegistryError::UnknownWorkflowType(workflow_type.to_string())),
        }
    }
}

impl fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        types.sort_unstable();
        f.debug_tuple("WorkflowRegistry").field(&types).finish()
    }
}
