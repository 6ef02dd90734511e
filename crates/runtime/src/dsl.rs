//! DSL workflow definitions
//!
//! A definition is an ordered list of action statements forming a DAG through
//! `depends_on`. Definitions are authored as YAML or JSON:
//!
//! ```yaml
//! title: enrich alert
//! actions:
//!   - ref: lookup
//!     action: core.transform.reshape
//!     args:
//!       value: ${{ TRIGGER.ip }}
//!   - ref: notify
//!     action: core.noop
//!     depends_on: [lookup]
//!     run_if: ${{ ACTIONS.lookup.result != null }}
//! returns: ${{ ACTIONS.lookup.result }}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use warden_durable::RetryPolicy;

/// Marker action for statements that only fan out
pub const SCATTER_ACTION: &str = "core.transform.scatter";

/// Marker action for statements that only fan in
pub const GATHER_ACTION: &str = "core.transform.gather";

/// Suffix marking an error edge in `depends_on`
pub const ERROR_EDGE_SUFFIX: &str = ".error";

/// A complete workflow definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub actions: Vec<ActionStatement>,
    /// Template evaluated against the final context; the full snapshot when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub returns: Option<Value>,
}

impl WorkflowDefinition {
    /// Parse a YAML or JSON document
    pub fn parse(source: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(source)
    }
}

/// One node of the workflow DAG
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionStatement {
    #[serde(rename = "ref")]
    pub action_ref: String,
    pub action: String,
    #[serde(default)]
    pub args: Map<String, Value>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_if: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub for_each: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<ActionRetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_until: Option<String>,
    /// Seconds to wait before the first attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_delay: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interaction: Option<InteractionSpec>,
    #[serde(default)]
    pub join_strategy: JoinStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gather: Option<GatherSpec>,
}

impl ActionStatement {
    /// Minimal statement, mostly for tests and programmatic construction
    pub fn new(action_ref: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            action_ref: action_ref.into(),
            action: action.into(),
            args: Map::new(),
            depends_on: Vec::new(),
            run_if: None,
            for_each: None,
            retry_policy: None,
            wait_until: None,
            start_delay: None,
            interaction: None,
            join_strategy: JoinStrategy::default(),
            gather: None,
        }
    }

    pub fn is_scatter(&self) -> bool {
        self.for_each.is_some()
    }

    pub fn is_gather(&self) -> bool {
        self.gather.is_some()
    }
}

/// How a statement with several dependencies decides readiness
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinStrategy {
    /// Every edge must be satisfied
    #[default]
    All,
    /// One satisfied edge is enough
    Any,
}

/// Conditional retry around a single action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRetryPolicy {
    /// Loop until this holds for the latest attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_until: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    /// Budget in seconds measured from the first attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
    /// Delay between attempts; immediate re-invocation when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<RetryPolicy>,
}

/// Kind of human input an interaction asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    Response,
    Approval,
}

impl InteractionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InteractionKind::Response => "response",
            InteractionKind::Approval => "approval",
        }
    }
}

/// Marks a statement as waiting for an external payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionSpec {
    #[serde(rename = "type")]
    pub kind: InteractionKind,
    /// Seconds to wait for the payload before abandoning
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
}

/// How a gather treats failed streams
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStrategy {
    /// First failed stream fails the gather
    #[default]
    Halt,
    /// Failures are collected next to the results
    Partition,
}

/// Fan-in closing the innermost open scatter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatherSpec {
    /// Evaluated in each stream; its value is that stream's contribution
    pub items: String,
    #[serde(default)]
    pub error_strategy: ErrorStrategy,
    #[serde(default)]
    pub drop_nulls: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_minimal_statement_defaults() {
        let stmt: ActionStatement =
            serde_json::from_value(json!({"ref": "a", "action": "core.noop"})).unwrap();
        assert_eq!(stmt.action_ref, "a");
        assert!(stmt.args.is_empty());
        assert!(stmt.depends_on.is_empty());
        assert_eq!(stmt.join_strategy, JoinStrategy::All);
        assert!(!stmt.is_scatter());
    }

    #[test]
    fn test_full_definition_from_yaml() {
        let yaml = r#"
title: triage
actions:
  - ref: hosts
    action: core.transform.scatter
    for_each: ${{ TRIGGER.hosts }}
  - ref: ping
    action: core.transform.reshape
    depends_on: [hosts]
    args:
      value: ${{ ACTIONS.hosts.result }}
    retry_policy:
      retry_until: ${{ ACTIONS.ping.result != null }}
      max_attempts: 3
      timeout: 60
      backoff:
        max_attempts: 3
        initial_interval: 1000
  - ref: collect
    action: core.transform.gather
    depends_on: [ping]
    gather:
      items: ${{ ACTIONS.ping.result }}
      error_strategy: partition
      drop_nulls: true
  - ref: approve
    action: core.noop
    depends_on: [collect, collect.error]
    join_strategy: any
    interaction:
      type: approval
      timeout: 3600
    wait_until: in 1 hour
returns: ${{ ACTIONS.collect.result }}
"#;
        let def: WorkflowDefinition = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(def.actions.len(), 4);
        assert!(def.actions[0].is_scatter());

        let retry = def.actions[1].retry_policy.as_ref().unwrap();
        assert_eq!(retry.max_attempts, Some(3));
        assert_eq!(retry.timeout, Some(60.0));
        assert_eq!(
            retry.backoff.as_ref().unwrap().initial_interval,
            std::time::Duration::from_secs(1)
        );

        let gather = def.actions[2].gather.as_ref().unwrap();
        assert_eq!(gather.error_strategy, ErrorStrategy::Partition);
        assert!(gather.drop_nulls);

        let approve = &def.actions[3];
        assert_eq!(approve.join_strategy, JoinStrategy::Any);
        assert_eq!(approve.interaction.as_ref().unwrap().kind, InteractionKind::Approval);
        assert_eq!(approve.wait_until.as_deref(), Some("in 1 hour"));
        assert_eq!(def.returns, Some(json!("${{ ACTIONS.collect.result }}")));
    }
}
