//! Outcome model
//!
//! Every action statement ends in exactly one [`ActionOutcome`]. Outcomes are
//! a closed tagged union discriminated by `status`; payloads written before the
//! discriminator existed (`{result, error}` only) still deserialize, and
//! [`ActionOutcome::to_legacy`] projects back to that two-field shape.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::objects::ObjectRef;

/// JSON type name of a value, used for `*_typename` fields
pub fn typename_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Outcome discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    Error,
    Skipped,
    Scatter,
    Gather,
}

impl std::fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OutcomeStatus::Success => "success",
            OutcomeStatus::Error => "error",
            OutcomeStatus::Skipped => "skipped",
            OutcomeStatus::Scatter => "scatter",
            OutcomeStatus::Gather => "gather",
        };
        write!(f, "{}", s)
    }
}

/// A completed action's value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessOutcome {
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub result_typename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<ObjectRef>,
    /// Data supplied by the interaction that resolved this action
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interaction: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interaction_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interaction_type: Option<String>,
}

/// A failed action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorOutcome {
    /// Structured failure payload, `{type, message, ...}` for runtime errors
    pub error: Value,
    pub error_typename: String,
}

impl ErrorOutcome {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        let kind = kind.into();
        Self {
            error: json!({ "type": kind, "message": message.into() }),
            error_typename: kind,
        }
    }

    /// Merge extra fields into the payload
    pub fn with_details(mut self, details: Value) -> Self {
        if let (Value::Object(payload), Value::Object(extra)) = (&mut self.error, details) {
            for (k, v) in extra {
                payload.insert(k, v);
            }
        }
        self
    }

    /// Human-readable message from the payload
    pub fn message(&self) -> String {
        match self.error.get("message").and_then(Value::as_str) {
            Some(msg) => msg.to_string(),
            None => self.error.to_string(),
        }
    }
}

/// An action that did not run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedOutcome {
    #[serde(default)]
    pub reason: Option<String>,
}

/// A fan-out point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScatterOutcome {
    pub count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_ref: Option<ObjectRef>,
}

/// A fan-in point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatherOutcome {
    /// Collected items; `None` when externalized to `result_ref`
    #[serde(default)]
    pub result: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<ObjectRef>,
    /// Per-stream error payloads, only under the partition strategy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_typename: Option<String>,
}

/// Result of executing one action statement
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ActionOutcome {
    Success(SuccessOutcome),
    Error(ErrorOutcome),
    Skipped(SkippedOutcome),
    Scatter(ScatterOutcome),
    Gather(GatherOutcome),
}

impl ActionOutcome {
    pub fn success(value: Value) -> Self {
        ActionOutcome::Success(SuccessOutcome {
            result_typename: typename_of(&value).to_string(),
            result: value,
            result_ref: None,
            interaction: None,
            interaction_id: None,
            interaction_type: None,
        })
    }

    pub fn error(error: ErrorOutcome) -> Self {
        ActionOutcome::Error(error)
    }

    pub fn skipped(reason: Option<String>) -> Self {
        ActionOutcome::Skipped(SkippedOutcome { reason })
    }

    pub fn scatter(count: usize, manifest_ref: Option<ObjectRef>) -> Self {
        ActionOutcome::Scatter(ScatterOutcome {
            count,
            manifest_ref,
        })
    }

    pub fn gather(result: Vec<Value>, errors: Option<Vec<Value>>) -> Self {
        ActionOutcome::Gather(GatherOutcome {
            result: Some(result),
            result_ref: None,
            error_typename: errors.as_ref().map(|_| "array".to_string()),
            error: errors,
        })
    }

    /// Gather whose collected list lives in the object store
    pub fn gather_externalized(result_ref: ObjectRef, errors: Option<Vec<Value>>) -> Self {
        ActionOutcome::Gather(GatherOutcome {
            result: None,
            result_ref: Some(result_ref),
            error_typename: errors.as_ref().map(|_| "array".to_string()),
            error: errors,
        })
    }

    /// Attach the resolution of an interaction to a success outcome
    pub fn with_interaction(mut self, id: Uuid, kind: &str, data: Value) -> Self {
        if let ActionOutcome::Success(s) = &mut self {
            s.interaction = Some(data);
            s.interaction_id = Some(id);
            s.interaction_type = Some(kind.to_string());
        }
        self
    }

    pub fn status(&self) -> OutcomeStatus {
        match self {
            ActionOutcome::Success(_) => OutcomeStatus::Success,
            ActionOutcome::Error(_) => OutcomeStatus::Error,
            ActionOutcome::Skipped(_) => OutcomeStatus::Skipped,
            ActionOutcome::Scatter(_) => OutcomeStatus::Scatter,
            ActionOutcome::Gather(_) => OutcomeStatus::Gather,
        }
    }

    /// True for success, scatter and gather: the action did not fail
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            ActionOutcome::Success(_) | ActionOutcome::Scatter(_) | ActionOutcome::Gather(_)
        )
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ActionOutcome::Error(_))
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, ActionOutcome::Skipped(_))
    }

    /// Inline result value, if this variant carries one
    pub fn result(&self) -> Option<&Value> {
        match self {
            ActionOutcome::Success(s) => Some(&s.result),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&ErrorOutcome> {
        match self {
            ActionOutcome::Error(e) => Some(e),
            _ => None,
        }
    }

    /// Project onto the legacy `{result, result_typename, error, error_typename}` shape
    ///
    /// Only `success` and `gather` carry a result; a gather's error list is
    /// projected only when non-empty so legacy readers do not see a failure.
    pub fn to_legacy(&self) -> LegacyOutcome {
        match self {
            ActionOutcome::Success(s) => LegacyOutcome {
                result: s.result.clone(),
                result_typename: Some(s.result_typename.clone()),
                error: Value::Null,
                error_typename: None,
            },
            ActionOutcome::Error(e) => LegacyOutcome {
                result: Value::Null,
                result_typename: None,
                error: e.error.clone(),
                error_typename: Some(e.error_typename.clone()),
            },
            ActionOutcome::Gather(g) => {
                let errors = g.error.as_ref().filter(|errs| !errs.is_empty());
                LegacyOutcome {
                    result: g.result.clone().map(Value::Array).unwrap_or(Value::Null),
                    result_typename: g.result.as_ref().map(|_| "array".to_string()),
                    error: errors.cloned().map(Value::Array).unwrap_or(Value::Null),
                    error_typename: errors.map(|_| "array".to_string()),
                }
            }
            ActionOutcome::Skipped(_) | ActionOutcome::Scatter(_) => LegacyOutcome::default(),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl From<ErrorOutcome> for ActionOutcome {
    fn from(error: ErrorOutcome) -> Self {
        ActionOutcome::Error(error)
    }
}

/// Pre-discriminator outcome shape
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LegacyOutcome {
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub result_typename: Option<String>,
    #[serde(default)]
    pub error: Value,
    #[serde(default)]
    pub error_typename: Option<String>,
}

impl From<LegacyOutcome> for ActionOutcome {
    fn from(legacy: LegacyOutcome) -> Self {
        if legacy.error.is_null() {
            let mut outcome = ActionOutcome::success(legacy.result);
            if let (ActionOutcome::Success(s), Some(name)) =
                (&mut outcome, legacy.result_typename)
            {
                s.result_typename = name;
            }
            outcome
        } else {
            let error_typename = legacy
                .error_typename
                .unwrap_or_else(|| typename_of(&legacy.error).to_string());
            ActionOutcome::Error(ErrorOutcome {
                error: legacy.error,
                error_typename,
            })
        }
    }
}

#[derive(Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum TaggedOutcome {
    Success(SuccessOutcome),
    Error(ErrorOutcome),
    Skipped(SkippedOutcome),
    Scatter(ScatterOutcome),
    Gather(GatherOutcome),
}

impl From<TaggedOutcome> for ActionOutcome {
    fn from(tagged: TaggedOutcome) -> Self {
        match tagged {
            TaggedOutcome::Success(s) => ActionOutcome::Success(s),
            TaggedOutcome::Error(e) => ActionOutcome::Error(e),
            TaggedOutcome::Skipped(s) => ActionOutcome::Skipped(s),
            TaggedOutcome::Scatter(s) => ActionOutcome::Scatter(s),
            TaggedOutcome::Gather(g) => ActionOutcome::Gather(g),
        }
    }
}

impl<'de> Deserialize<'de> for ActionOutcome {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        let value = Value::deserialize(deserializer)?;
        if value.get("status").is_some() {
            serde_json::from_value::<TaggedOutcome>(value)
                .map(Into::into)
                .map_err(D::Error::custom)
        } else {
            serde_json::from_value::<LegacyOutcome>(value)
                .map(Into::into)
                .map_err(D::Error::custom)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(outcome: &ActionOutcome) -> ActionOutcome {
        let json = serde_json::to_string(outcome).unwrap();
        serde_json::from_str(&json).unwrap()
    }

    #[test]
    fn test_variants_survive_serialization() {
        let object = ObjectRef {
            key: "sha256:abc".into(),
            size: 12,
        };
        let outcomes = vec![
            ActionOutcome::success(json!({"status": "ok"})),
            ActionOutcome::error(ErrorOutcome::new("ActionError", "boom")),
            ActionOutcome::skipped(Some("run_if evaluated to false".into())),
            ActionOutcome::skipped(None),
            ActionOutcome::scatter(3, None),
            ActionOutcome::scatter(500, Some(object.clone())),
            ActionOutcome::gather(vec![json!(1), json!(2)], None),
            ActionOutcome::gather(vec![json!(1)], Some(vec![json!({"type": "X"})])),
            ActionOutcome::gather_externalized(object, None),
        ];

        for outcome in outcomes {
            let back = round_trip(&outcome);
            assert_eq!(back, outcome);
            assert_eq!(back.status(), outcome.status());
            let exclusive = [back.is_error(), back.is_skipped(), back.is_success()];
            assert_eq!(exclusive.iter().filter(|b| **b).count(), 1);
        }
    }

    #[test]
    fn test_discriminator_on_the_wire() {
        let value = ActionOutcome::success(json!("hi")).to_value();
        assert_eq!(value["status"], "success");
        assert_eq!(value["result"], "hi");
        assert_eq!(value["result_typename"], "string");
        assert!(value.get("interaction").is_none());

        let value = ActionOutcome::error(ErrorOutcome::new("Timeout", "slow")).to_value();
        assert_eq!(value["status"], "error");
        assert!(value.get("result").is_none());
        assert_eq!(value["error_typename"], "Timeout");
        assert_eq!(value["error"]["message"], "slow");
    }

    #[test]
    fn test_success_predicates() {
        assert!(ActionOutcome::scatter(0, None).is_success());
        assert!(ActionOutcome::gather(vec![], None).is_success());
        assert!(!ActionOutcome::skipped(None).is_success());
        assert!(ActionOutcome::skipped(None).is_skipped());
        assert!(ActionOutcome::error(ErrorOutcome::new("E", "m")).is_error());
    }

    #[test]
    fn test_legacy_payloads_are_inferred() {
        let ok: ActionOutcome =
            serde_json::from_value(json!({"result": 5, "error": null})).unwrap();
        assert_eq!(ok.status(), OutcomeStatus::Success);
        assert_eq!(ok.result(), Some(&json!(5)));

        let failed: ActionOutcome = serde_json::from_value(json!({
            "result": null,
            "error": {"message": "nope"},
            "error_typename": "ValueError",
        }))
        .unwrap();
        assert_eq!(failed.status(), OutcomeStatus::Error);
        assert_eq!(failed.as_error().unwrap().error_typename, "ValueError");

        let bare: ActionOutcome = serde_json::from_value(json!({})).unwrap();
        assert_eq!(bare.status(), OutcomeStatus::Success);
        assert_eq!(bare.result(), Some(&Value::Null));
    }

    #[test]
    fn test_legacy_projection() {
        let legacy = ActionOutcome::success(json!([1])).to_legacy();
        assert_eq!(legacy.result, json!([1]));
        assert_eq!(legacy.result_typename.as_deref(), Some("array"));
        assert!(legacy.error.is_null());

        let legacy = ActionOutcome::skipped(Some("x".into())).to_legacy();
        assert_eq!(legacy, LegacyOutcome::default());

        let legacy = ActionOutcome::scatter(4, None).to_legacy();
        assert!(legacy.result.is_null());
        assert!(legacy.result_typename.is_none());

        let legacy = ActionOutcome::error(ErrorOutcome::new("E", "m")).to_legacy();
        assert!(legacy.result.is_null());
        assert_eq!(legacy.error_typename.as_deref(), Some("E"));

        let legacy = ActionOutcome::gather(vec![json!("a")], Some(vec![])).to_legacy();
        assert_eq!(legacy.result, json!(["a"]));
        assert!(legacy.error.is_null());

        // projected legacy payloads read back as the same kind of outcome
        let legacy = ActionOutcome::error(ErrorOutcome::new("E", "m")).to_legacy();
        let back: ActionOutcome =
            serde_json::from_value(serde_json::to_value(legacy).unwrap()).unwrap();
        assert!(back.is_error());
    }

    #[test]
    fn test_interaction_echo() {
        let id = Uuid::nil();
        let outcome = ActionOutcome::success(Value::Null).with_interaction(
            id,
            "approval",
            json!({"approved": true}),
        );
        let value = outcome.to_value();
        assert_eq!(value["interaction"], json!({"approved": true}));
        assert_eq!(value["interaction_type"], "approval");
        assert!(value["result"].is_null());
        assert_eq!(round_trip(&outcome), outcome);
    }

    #[test]
    fn test_error_details_merge() {
        let err =
            ErrorOutcome::new("RetryExhausted", "gave up").with_details(json!({"attempts": 3}));
        assert_eq!(err.error["attempts"], 3);
        assert_eq!(err.message(), "gave up");
    }
}
