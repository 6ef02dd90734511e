//! Registry boundary
//!
//! The runtime resolves action names through an [`ActionRegistry`] and calls
//! `invoke(action, args, ctx)`. Credentials are resolved per invocation by a
//! [`SecretsProvider`] and travel only inside the [`InvocationContext`].

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;
use warden_durable::ActivityError;

use crate::dsl::{GATHER_ACTION, SCATTER_ACTION};
use crate::outcome::ErrorOutcome;

/// Structured failure from an action invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct InvocationError {
    pub kind: String,
    pub message: String,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl InvocationError {
    /// Non-retryable error
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            retryable: false,
            details: None,
        }
    }

    pub fn retryable(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            ..Self::new(kind, message)
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl From<InvocationError> for ErrorOutcome {
    fn from(err: InvocationError) -> Self {
        let mut extra = json!({ "retryable": err.retryable });
        if let Some(details) = err.details {
            extra["details"] = details;
        }
        ErrorOutcome::new(err.kind, err.message).with_details(extra)
    }
}

impl From<InvocationError> for ActivityError {
    fn from(err: InvocationError) -> Self {
        let base = if err.retryable {
            ActivityError::retryable(err.message)
        } else {
            ActivityError::non_retryable(err.message)
        };
        let base = base.with_type(err.kind);
        match err.details {
            Some(details) => base.with_details(details),
            None => base,
        }
    }
}

impl From<&ActivityError> for InvocationError {
    fn from(err: &ActivityError) -> Self {
        Self {
            kind: err
                .error_type
                .clone()
                .unwrap_or_else(|| "ActivityError".to_string()),
            message: err.message.clone(),
            retryable: err.retryable,
            details: err.details.clone(),
        }
    }
}

/// Binding root under which resolved secrets are visible to templates
pub const SECRETS_ROOT: &str = "SECRETS";

/// Secrets resolved for one invocation, `name -> {key: value}`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Credentials {
    secrets: Map<String, Value>,
}

impl Credentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.secrets.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.secrets.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    /// Expression bindings exposing the secrets as `SECRETS`
    pub fn bindings(&self) -> Value {
        let mut bindings = Map::new();
        bindings.insert(SECRETS_ROOT.to_string(), Value::Object(self.secrets.clone()));
        Value::Object(bindings)
    }
}

/// Per-invocation context handed to actions
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub workflow_id: Uuid,
    pub action_ref: String,
    /// Stream the invocation belongs to, `root` outside scatters
    pub stream: String,
    pub attempt: u32,
    pub role: Option<String>,
    pub credentials: Credentials,
}

/// Resolves secrets for a caller role
#[async_trait]
pub trait SecretsProvider: Send + Sync + 'static {
    async fn resolve(
        &self,
        role: Option<&str>,
        names: &[String],
    ) -> Result<Credentials, InvocationError>;
}

/// Fixed set of secrets, optionally restricted per role
#[derive(Debug, Clone, Default)]
pub struct StaticSecretsProvider {
    secrets: HashMap<String, Value>,
    grants: HashMap<String, HashSet<String>>,
}

impl StaticSecretsProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `{name: {key: value}}`
    pub fn from_value(value: Value) -> Result<Self, InvocationError> {
        let Value::Object(map) = value else {
            return Err(InvocationError::new(
                "InvalidSecrets",
                "secrets must be an object of name -> {key: value}",
            ));
        };
        Ok(Self {
            secrets: map.into_iter().collect(),
            grants: HashMap::new(),
        })
    }

    pub fn with_secret(mut self, name: impl Into<String>, value: Value) -> Self {
        self.secrets.insert(name.into(), value);
        self
    }

    /// Restrict `role` to the named secrets; roles without grants see everything
    /// until any grant exists
    pub fn grant<I, S>(mut self, role: impl Into<String>, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.grants
            .entry(role.into())
            .or_default()
            .extend(names.into_iter().map(Into::into));
        self
    }

    fn allowed(&self, role: Option<&str>, name: &str) -> bool {
        if self.grants.is_empty() {
            return true;
        }
        role.and_then(|r| self.grants.get(r))
            .is_some_and(|names| names.contains(name))
    }
}

#[async_trait]
impl SecretsProvider for StaticSecretsProvider {
    async fn resolve(
        &self,
        role: Option<&str>,
        names: &[String],
    ) -> Result<Credentials, InvocationError> {
        let mut credentials = Credentials::new();
        for name in names {
            if !self.allowed(role, name) {
                return Err(InvocationError::new(
                    "SecretAccessDenied",
                    format!("role {:?} may not read secret '{}'", role.unwrap_or("<none>"), name),
                ));
            }
            let value = self.secrets.get(name).ok_or_else(|| {
                InvocationError::new("SecretNotFound", format!("secret '{}' is not defined", name))
            })?;
            credentials.insert(name.clone(), value.clone());
        }
        Ok(credentials)
    }
}

/// Resolves and invokes actions by name
#[async_trait]
pub trait ActionRegistry: Send + Sync + 'static {
    /// Whether `action` names something this registry knows
    fn contains(&self, action: &str) -> bool;

    async fn invoke(
        &self,
        action: &str,
        args: Value,
        ctx: &InvocationContext,
    ) -> Result<Value, InvocationError>;
}

/// Boxed action implementation
pub type ActionFn = Arc<
    dyn Fn(Value, InvocationContext) -> BoxFuture<'static, Result<Value, InvocationError>>
        + Send
        + Sync,
>;

/// Registry of closures keyed by action name
#[derive(Default, Clone)]
pub struct InMemoryActionRegistry {
    actions: HashMap<String, ActionFn>,
    markers: HashSet<String>,
}

impl InMemoryActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `core.transform.reshape`, `core.noop` and the scatter/gather markers
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("core.transform.reshape", |args: Value, _ctx| async move {
            Ok(args.get("value").cloned().unwrap_or(Value::Null))
        });
        registry.register("core.noop", |_args, _ctx| async { Ok(Value::Null) });
        registry.markers.insert(SCATTER_ACTION.to_string());
        registry.markers.insert(GATHER_ACTION.to_string());
        registry
    }

    /// Register an async closure under `name`, replacing any previous one
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, action: F)
    where
        F: Fn(Value, InvocationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, InvocationError>> + Send + 'static,
    {
        let action: ActionFn = Arc::new(move |args, ctx| Box::pin(action(args, ctx)));
        self.actions.insert(name.into(), action);
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .actions
            .keys()
            .chain(self.markers.iter())
            .cloned()
            .collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for InMemoryActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryActionRegistry")
            .field("actions", &self.names())
            .finish()
    }
}

#[async_trait]
impl ActionRegistry for InMemoryActionRegistry {
    fn contains(&self, action: &str) -> bool {
        self.actions.contains_key(action) || self.markers.contains(action)
    }

    async fn invoke(
        &self,
        action: &str,
        args: Value,
        ctx: &InvocationContext,
    ) -> Result<Value, InvocationError> {
        if self.markers.contains(action) {
            return Err(InvocationError::new(
                "MarkerAction",
                format!("'{}' only marks scatter/gather statements", action),
            ));
        }
        let f = self
            .actions
            .get(action)
            .ok_or_else(|| {
                InvocationError::new("UnknownAction", format!("unknown action '{}'", action))
            })?;
        f(args, ctx.clone()).await
    }
}
