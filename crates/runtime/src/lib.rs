// Warden Runtime - Action Execution Runtime
//
// Decision: A DSL run is one durable workflow (`DslWorkflow`) on warden-durable
// Decision: Every action attempt is one `run_action` activity; secrets are resolved inside it
// Decision: Registry, expression evaluator, secrets provider and object store are trait seams

pub mod activities;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod dsl;
pub mod expression;
pub mod interaction;
pub mod objects;
pub mod outcome;
pub mod plan;
pub mod registry;
pub mod retry;
pub mod scatter;
pub mod schedule;
pub mod service;

pub use activities::RunActionActivity;
pub use config::RuntimeConfig;
pub use context::{ContextError, ExecutionContext};
pub use dispatcher::{ActionInvocation, DslRunInput, DslWorkflow, DslWorkflowFactory};
pub use dsl::{
    ActionRetryPolicy, ActionStatement, ErrorStrategy, GatherSpec, InteractionKind,
    InteractionSpec, JoinStrategy, WorkflowDefinition,
};
pub use expression::{ExpressionError, ExpressionEvaluator, TemplateEvaluator};
pub use interaction::{
    InteractionController, InteractionState, InteractionStatus, InteractionUpdate,
};
pub use objects::{InMemoryObjectStore, ObjectRef, ObjectStore, ObjectStoreError};
pub use outcome::{ActionOutcome, ErrorOutcome, LegacyOutcome, OutcomeStatus};
pub use plan::{ExecutionPlan, ValidationError};
pub use registry::{
    ActionRegistry, Credentials, InMemoryActionRegistry, InvocationContext, InvocationError,
    SecretsProvider, StaticSecretsProvider,
};
pub use retry::{RetryController, RetryDecision};
pub use scatter::ScatterTracker;
pub use schedule::{ScheduleError, WaitDecision};
pub use service::{RunInput, RunResult, ServiceError, WorkflowService, WorkflowServiceBuilder};

/// Prelude for embedding the runtime
pub mod prelude {
    pub use crate::dsl::WorkflowDefinition;
    pub use crate::outcome::ActionOutcome;
    pub use crate::registry::{
        ActionRegistry, InMemoryActionRegistry, InvocationContext, InvocationError,
        StaticSecretsProvider,
    };
    pub use crate::service::{RunInput, RunResult, WorkflowService};
    pub use warden_durable::{ManualClock, SystemClock, WorkflowStatus};
}
