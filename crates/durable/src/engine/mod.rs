//! Replay executor and workflow factories

mod executor;
mod registry;

pub use executor::{ExecutorConfig, ExecutorError, ProcessResult, WorkflowExecutor};
pub use registry::{RegistryError, WorkflowFactory, WorkflowRegistry};
