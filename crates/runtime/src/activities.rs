// Activity implementations
//
// One activity type, `run_action`, executes a single attempt of an action
// statement against the registry. Args arrive rendered except for SECRETS
// references; those are resolved here, per invocation, so secret values live
// only in memory for the duration of the call.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};
use warden_durable::{ActivityContext, ActivityError, ActivityHandler};

use crate::dispatcher::ActionInvocation;
use crate::expression::{self, ExpressionEvaluator};
use crate::registry::{
    ActionRegistry, Credentials, InvocationContext, InvocationError, SecretsProvider,
};

// ============================================================================
// Activity Implementations
// ============================================================================

/// Executes one `run_action` attempt
pub struct RunActionActivity {
    registry: Arc<dyn ActionRegistry>,
    secrets: Arc<dyn SecretsProvider>,
    evaluator: Arc<dyn ExpressionEvaluator>,
}

impl RunActionActivity {
    pub fn new(
        registry: Arc<dyn ActionRegistry>,
        secrets: Arc<dyn SecretsProvider>,
        evaluator: Arc<dyn ExpressionEvaluator>,
    ) -> Self {
        Self {
            registry,
            secrets,
            evaluator,
        }
    }

    /// Resolve the secrets referenced by `args` and substitute them
    async fn inject_secrets(
        &self,
        invocation: &ActionInvocation,
    ) -> Result<(Value, Credentials), InvocationError> {
        let names: Vec<String> = expression::secret_names(&invocation.args)
            .into_iter()
            .collect();
        if names.is_empty() {
            return Ok((invocation.args.clone(), Credentials::new()));
        }

        let credentials = self
            .secrets
            .resolve(invocation.role.as_deref(), &names)
            .await?;
        let args = expression::render(
            self.evaluator.as_ref(),
            &invocation.args,
            &credentials.bindings(),
            &[],
        )
        .map_err(|e| InvocationError::new("ExpressionError", e.to_string()))?;
        Ok((args, credentials))
    }

    async fn run(
        &self,
        ctx: &ActivityContext,
        invocation: ActionInvocation,
    ) -> Result<Value, InvocationError> {
        let (args, credentials) = self.inject_secrets(&invocation).await?;
        debug!(
            workflow_id = %ctx.workflow_id,
            stream = %invocation.stream,
            action_ref = %invocation.action_ref,
            secrets = credentials.len(),
            "invoking action"
        );

        let invocation_ctx = InvocationContext {
            workflow_id: ctx.workflow_id,
            action_ref: invocation.action_ref.clone(),
            stream: invocation.stream.clone(),
            attempt: invocation.attempt,
            role: invocation.role.clone(),
            credentials,
        };
        self.registry
            .invoke(&invocation.action, args, &invocation_ctx)
            .await
    }
}

#[async_trait]
impl ActivityHandler for RunActionActivity {
    async fn execute(&self, ctx: &ActivityContext, input: Value) -> Result<Value, ActivityError> {
        let invocation: ActionInvocation = serde_json::from_value(input).map_err(|e| {
            ActivityError::non_retryable(format!("invalid action invocation: {}", e))
                .with_type("InvalidInput")
        })?;
        ctx.ensure_active()?;

        info!(
            workflow_id = %ctx.workflow_id,
            stream = %invocation.stream,
            action_ref = %invocation.action_ref,
            action = %invocation.action,
            attempt = invocation.attempt,
            "Executing run_action"
        );

        self.run(ctx, invocation).await.map_err(ActivityError::from)
    }
}
