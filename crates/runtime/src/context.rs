//! Execution context
//!
//! The append-only map from action ref to outcome, plus the read-only
//! `INPUTS` and `TRIGGER` bindings. Expressions see it through
//! [`ExecutionContext::bindings`]:
//!
//! ```text
//! { "ACTIONS": { "<ref>": <outcome> }, "INPUTS": ..., "TRIGGER": ... }
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::objects::{ObjectStore, ObjectStoreError};
use crate::outcome::ActionOutcome;

/// Errors from context mutation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("outcome for '{0}' is already recorded")]
    AlreadyRecorded(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    actions: BTreeMap<String, ActionOutcome>,
    inputs: Value,
    trigger: Value,
}

impl ExecutionContext {
    pub fn new(trigger: Value, inputs: Value) -> Self {
        Self {
            actions: BTreeMap::new(),
            inputs,
            trigger,
        }
    }

    /// Record an action's outcome; a ref is written at most once
    pub fn record(
        &mut self,
        action_ref: impl Into<String>,
        outcome: ActionOutcome,
    ) -> Result<(), ContextError> {
        let action_ref = action_ref.into();
        if self.actions.contains_key(&action_ref) {
            return Err(ContextError::AlreadyRecorded(action_ref));
        }
        self.actions.insert(action_ref, outcome);
        Ok(())
    }

    pub fn get(&self, action_ref: &str) -> Option<&ActionOutcome> {
        self.actions.get(action_ref)
    }

    pub fn contains(&self, action_ref: &str) -> bool {
        self.actions.contains_key(action_ref)
    }

    pub fn actions(&self) -> &BTreeMap<String, ActionOutcome> {
        &self.actions
    }

    pub fn inputs(&self) -> &Value {
        &self.inputs
    }

    pub fn trigger(&self) -> &Value {
        &self.trigger
    }

    /// Copy of this context with `action_ref` bound to `outcome`
    ///
    /// Used for scratch evaluation of a candidate outcome and for seeding a
    /// scatter stream with its item. The original is untouched.
    pub fn rebind(&self, action_ref: &str, outcome: ActionOutcome) -> Self {
        let mut copy = self.clone();
        copy.actions.insert(action_ref.to_string(), outcome);
        copy
    }

    /// Serializable view with outcomes as stored
    pub fn snapshot(&self) -> Value {
        let actions: Map<String, Value> = self
            .actions
            .iter()
            .map(|(k, v)| (k.clone(), v.to_value()))
            .collect();
        let mut view = Map::new();
        view.insert("ACTIONS".into(), Value::Object(actions));
        view.insert("INPUTS".into(), self.inputs.clone());
        view.insert("TRIGGER".into(), self.trigger.clone());
        Value::Object(view)
    }

    /// Expression bindings, with externalized gather results loaded inline
    pub fn bindings(&self, objects: &dyn ObjectStore) -> Result<Value, ObjectStoreError> {
        let mut view = self.snapshot();
        for (action_ref, outcome) in &self.actions {
            if let ActionOutcome::Gather(gather) = outcome {
                if let Some(object) = &gather.result_ref {
                    let items = objects.get(object)?;
                    if let Some(entry) = view
                        .get_mut("ACTIONS")
                        .and_then(|a| a.get_mut(action_ref.as_str()))
                    {
                        entry["result"] = items;
                    }
                }
            }
        }
        Ok(view)
    }
}
