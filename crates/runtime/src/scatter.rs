//! Scatter/gather controller
//!
//! A scatter evaluates its `for_each` collection and spawns one stream per
//! item. The spawning stream keeps a [`ScatterTracker`] that collects each
//! stream's contribution by scatter index, so the gathered list is ordered by
//! item position no matter which stream finished first.

use serde_json::Value;

use crate::dsl::{ErrorStrategy, GatherSpec};
use crate::interaction::ROOT_STREAM;
use crate::objects::{ObjectRef, ObjectStore, ObjectStoreError};
use crate::outcome::{typename_of, ActionOutcome, ErrorOutcome};

/// Error kind when `for_each` is not a collection
pub const INVALID_COLLECTION: &str = "InvalidCollection";

/// Id of stream `index` spawned by `scatter_ref` inside `parent`
pub fn stream_id(parent: &str, scatter_ref: &str, index: usize) -> String {
    if parent == ROOT_STREAM {
        format!("{}[{}]", scatter_ref, index)
    } else {
        format!("{}/{}[{}]", parent, scatter_ref, index)
    }
}

/// Items of an evaluated `for_each`
pub fn collection_items(value: Value) -> Result<Vec<Value>, ErrorOutcome> {
    match value {
        Value::Array(items) => Ok(items),
        Value::Object(map) => Ok(map.into_iter().map(|(_, v)| v).collect()),
        other => Err(ErrorOutcome::new(
            INVALID_COLLECTION,
            format!("for_each must evaluate to a list, got {}", typename_of(&other)),
        )),
    }
}

/// Scatter outcome, writing the items to the object store past `inline_limit`
pub fn scatter_outcome(
    items: &[Value],
    inline_limit: usize,
    objects: &dyn ObjectStore,
) -> Result<ActionOutcome, ObjectStoreError> {
    let manifest_ref = if items.len() > inline_limit {
        Some(objects.put(&Value::Array(items.to_vec()))?)
    } else {
        None
    };
    Ok(ActionOutcome::scatter(items.len(), manifest_ref))
}

/// Gather outcome, externalizing the list past `inline_limit`
pub fn gather_outcome(
    values: Vec<Value>,
    errors: Option<Vec<Value>>,
    inline_limit: usize,
    objects: &dyn ObjectStore,
) -> Result<ActionOutcome, ObjectStoreError> {
    if values.len() > inline_limit {
        let object: ObjectRef = objects.put(&Value::Array(values))?;
        Ok(ActionOutcome::gather_externalized(object, errors))
    } else {
        Ok(ActionOutcome::gather(values, errors))
    }
}

/// What one stream handed back to its scatter
#[derive(Debug, Clone, PartialEq)]
pub enum StreamResult {
    /// The gather's `items` value for this stream
    Value(Value),
    /// Nothing to contribute (gather skipped, or no gather)
    Skipped,
    Failed(ErrorOutcome),
}

impl StreamResult {
    /// Contribution of a stream whose gather statement settled with `outcome`
    pub fn from_outcome(outcome: &ActionOutcome) -> Self {
        match outcome {
            ActionOutcome::Error(err) => StreamResult::Failed(err.clone()),
            ActionOutcome::Skipped(_) => StreamResult::Skipped,
            other => StreamResult::Value(other.result().cloned().unwrap_or(Value::Null)),
        }
    }
}

/// Decision taken when a stream reports
#[derive(Debug, Clone, PartialEq)]
pub enum GatherStep {
    /// Still waiting for other streams
    Pending,
    /// A stream failed: record this error and cancel the siblings
    Halt(ErrorOutcome),
    /// Every stream finished; aggregated in scatter order
    Complete {
        values: Vec<Value>,
        errors: Option<Vec<Value>>,
    },
}

/// Per-scatter bookkeeping held by the spawning stream
#[derive(Debug, Clone)]
pub struct ScatterTracker {
    scatter_ref: String,
    gather_ref: Option<String>,
    strategy: ErrorStrategy,
    drop_nulls: bool,
    stream_ids: Vec<String>,
    results: Vec<Option<StreamResult>>,
    halted: bool,
}

impl ScatterTracker {
    /// `gather` is the closing statement's ref and spec, when one exists
    pub fn new(
        scatter_ref: impl Into<String>,
        gather: Option<(&str, &GatherSpec)>,
        stream_ids: Vec<String>,
    ) -> Self {
        let (gather_ref, strategy, drop_nulls) = match gather {
            Some((gather_ref, spec)) => (
                Some(gather_ref.to_string()),
                spec.error_strategy,
                spec.drop_nulls,
            ),
            None => (None, ErrorStrategy::Halt, false),
        };
        let results = vec![None; stream_ids.len()];
        Self {
            scatter_ref: scatter_ref.into(),
            gather_ref,
            strategy,
            drop_nulls,
            stream_ids,
            results,
            halted: false,
        }
    }

    pub fn scatter_ref(&self) -> &str {
        &self.scatter_ref
    }

    pub fn gather_ref(&self) -> Option<&str> {
        self.gather_ref.as_deref()
    }

    /// Stream ids in scatter order
    pub fn stream_ids(&self) -> &[String] {
        &self.stream_ids
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Halted, or every stream reported
    pub fn is_finished(&self) -> bool {
        self.halted || self.results.iter().all(Option::is_some)
    }

    /// Streams that have not reported yet
    pub fn unfinished(&self) -> impl Iterator<Item = &str> {
        self.stream_ids
            .iter()
            .zip(&self.results)
            .filter(|(_, r)| r.is_none())
            .map(|(id, _)| id.as_str())
    }

    /// Record stream `index`; late or duplicate reports are ignored
    pub fn record(&mut self, index: usize, result: StreamResult) -> GatherStep {
        if self.halted {
            return GatherStep::Pending;
        }
        let Some(slot) = self.results.get_mut(index) else {
            return GatherStep::Pending;
        };
        if slot.is_some() {
            return GatherStep::Pending;
        }

        if let StreamResult::Failed(err) = &result {
            if self.strategy == ErrorStrategy::Halt {
                self.halted = true;
                let err = err.clone();
                *slot = Some(result);
                return GatherStep::Halt(err);
            }
        }
        *slot = Some(result);

        if !self.is_finished() {
            return GatherStep::Pending;
        }
        self.aggregate()
    }

    fn aggregate(&self) -> GatherStep {
        let mut values = Vec::new();
        let mut errors = Vec::new();
        for result in self.results.iter().flatten() {
            match result {
                StreamResult::Value(Value::Null) if self.drop_nulls => {}
                StreamResult::Value(v) => values.push(v.clone()),
                StreamResult::Skipped => {}
                StreamResult::Failed(err) => errors.push(err.error.clone()),
            }
        }
        let errors = match self.strategy {
            ErrorStrategy::Partition if !self.results.is_empty() => Some(errors),
            _ => None,
        };
        GatherStep::Complete { values, errors }
    }
}
