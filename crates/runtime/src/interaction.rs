//! Interaction controller
//!
//! Human-in-the-loop pauses. A statement with an `interaction` block opens a
//! pending interaction right before its prompt action is invoked; the
//! statement finishes only once the prompt succeeded and exactly one update
//! for its interaction id was accepted.
//!
//! Interaction ids are UUID v5 values derived from the run id and the
//! stream-qualified ref, so replay reproduces them without any stored state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;
use warden_durable::UpdateRejected;

use crate::dsl::InteractionKind;

/// Update handler that resolves interactions
pub const UPDATE_HANDLER: &str = "interaction";

/// Error kind recorded when nobody answered in time
pub const INTERACTION_TIMEOUT: &str = "InteractionTimeout";

/// Stream id of the root stream
pub const ROOT_STREAM: &str = "root";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InteractionError {
    #[error("unknown interaction {0}")]
    UnknownInteraction(Uuid),

    #[error("interaction {0} is already completed")]
    AlreadyCompleted(Uuid),

    #[error("interaction {0} was abandoned")]
    Abandoned(Uuid),

    #[error("invalid interaction payload: {0}")]
    InvalidPayload(String),
}

impl From<InteractionError> for UpdateRejected {
    fn from(err: InteractionError) -> Self {
        match err {
            InteractionError::InvalidPayload(msg) => UpdateRejected::InvalidPayload(msg),
            other => UpdateRejected::Rejected(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionStatus {
    Idle,
    Pending,
    Completed,
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionState {
    pub interaction_id: Uuid,
    pub execution_id: Uuid,
    pub action_ref: String,
    pub stream: String,
    #[serde(rename = "type")]
    pub kind: InteractionKind,
    pub status: InteractionStatus,
    /// External payload; null until completed
    pub data: Value,
}

impl InteractionState {
    pub fn new(
        execution_id: Uuid,
        stream: impl Into<String>,
        action_ref: impl Into<String>,
        kind: InteractionKind,
    ) -> Self {
        let stream = stream.into();
        let action_ref = action_ref.into();
        Self {
            interaction_id: interaction_id(execution_id, &stream, &action_ref),
            execution_id,
            action_ref,
            stream,
            kind,
            status: InteractionStatus::Idle,
            data: Value::Null,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == InteractionStatus::Pending
    }
}

/// Payload of an `interaction` update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionUpdate {
    pub interaction_id: Uuid,
    #[serde(default)]
    pub data: Value,
}

impl InteractionUpdate {
    pub fn new(interaction_id: Uuid, data: Value) -> Self {
        Self {
            interaction_id,
            data,
        }
    }

    pub fn parse(payload: &Value) -> Result<Self, InteractionError> {
        serde_json::from_value(payload.clone())
            .map_err(|e| InteractionError::InvalidPayload(e.to_string()))
    }

    pub fn to_value(&self) -> Value {
        json!({ "interaction_id": self.interaction_id, "data": self.data })
    }

    /// Acknowledgment returned to the caller
    pub fn ack(&self) -> Value {
        json!({
            "status": "accepted",
            "interaction_id": self.interaction_id,
            "data": self.data,
        })
    }
}

/// Deterministic interaction id for `action_ref` in `stream`
pub fn interaction_id(execution_id: Uuid, stream: &str, action_ref: &str) -> Uuid {
    Uuid::new_v5(&execution_id, format!("{}:{}", stream, action_ref).as_bytes())
}

/// Ref as shown to callers: bare in the root stream, stream-qualified otherwise
pub fn qualified_ref(stream: &str, action_ref: &str) -> String {
    if stream == ROOT_STREAM {
        action_ref.to_string()
    } else {
        format!("{}/{}", stream, action_ref)
    }
}

/// Every interaction of one run, keyed by id
#[derive(Debug, Clone, Default)]
pub struct InteractionController {
    states: BTreeMap<Uuid, InteractionState>,
}

impl InteractionController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move a fresh interaction to pending and return its id
    pub fn open(
        &mut self,
        execution_id: Uuid,
        stream: &str,
        action_ref: &str,
        kind: InteractionKind,
    ) -> Uuid {
        let mut state = InteractionState::new(execution_id, stream, action_ref, kind);
        state.status = InteractionStatus::Pending;
        let id = state.interaction_id;
        self.states.insert(id, state);
        id
    }

    pub fn get(&self, id: Uuid) -> Option<&InteractionState> {
        self.states.get(&id)
    }

    /// Check an update without applying it
    pub fn validate(
        &self,
        update: &InteractionUpdate,
    ) -> Result<&InteractionState, InteractionError> {
        let state = self
            .states
            .get(&update.interaction_id)
            .ok_or(InteractionError::UnknownInteraction(update.interaction_id))?;
        match state.status {
            InteractionStatus::Pending => Ok(state),
            InteractionStatus::Completed => {
                Err(InteractionError::AlreadyCompleted(state.interaction_id))
            }
            InteractionStatus::Abandoned => Err(InteractionError::Abandoned(state.interaction_id)),
            InteractionStatus::Idle => {
                Err(InteractionError::UnknownInteraction(state.interaction_id))
            }
        }
    }

    /// Apply an accepted update; pending moves to completed exactly once
    pub fn complete(
        &mut self,
        update: &InteractionUpdate,
    ) -> Result<&InteractionState, InteractionError> {
        self.validate(update)?;
        let state = self
            .states
            .get_mut(&update.interaction_id)
            .ok_or(InteractionError::UnknownInteraction(update.interaction_id))?;
        state.status = InteractionStatus::Completed;
        state.data = update.data.clone();
        Ok(state)
    }

    /// Abandon a pending interaction; returns whether anything changed
    pub fn abandon(&mut self, id: Uuid) -> bool {
        match self.states.get_mut(&id) {
            Some(state) if state.is_pending() => {
                state.status = InteractionStatus::Abandoned;
                true
            }
            _ => false,
        }
    }

    /// Abandon every pending interaction, returning how many there were
    pub fn abandon_all(&mut self) -> usize {
        let mut count = 0;
        for state in self.states.values_mut().filter(|s| s.is_pending()) {
            state.status = InteractionStatus::Abandoned;
            count += 1;
        }
        count
    }

    pub fn pending(&self) -> impl Iterator<Item = &InteractionState> {
        self.states.values().filter(|s| s.is_pending())
    }

    /// Qualified ref -> state, for the `interactions` query
    pub fn snapshot(&self) -> Value {
        let view: Map<String, Value> = self
            .states
            .values()
            .map(|s| {
                (
                    qualified_ref(&s.stream, &s.action_ref),
                    serde_json::to_value(s).unwrap_or(Value::Null),
                )
            })
            .collect();
        Value::Object(view)
    }
}
