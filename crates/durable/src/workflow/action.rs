//! Transitions and the action requests they carry

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ExecutionStatus;

/// A side effect requested by a transition
///
/// Dispatched through the action registry after the transition commits.
/// `step` disambiguates two requests for the same action in one transition
/// and becomes part of the idempotency key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionRequest {
    /// Name of a registered action
    pub action: String,

    /// Parameters passed to the handler
    #[serde(default)]
    pub params: Value,

    /// Optional discriminator within one transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
}

impl ActionRequest {
    pub fn new(action: impl Into<String>, params: Value) -> Self {
        Self {
            action: action.into(),
            params,
            step: None,
        }
    }

    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }
}

/// How a transition changes `context_data`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "mode", content = "value", rename_all = "snake_case")]
pub enum ContextUpdate {
    #[default]
    Keep,

    /// Shallow object merge; keys in the update win
    Merge(Value),

    Replace(Value),
}

impl ContextUpdate {
    /// Apply to the current context
    pub fn apply(&self, current: &Value) -> Value {
        match self {
            Self::Keep => current.clone(),
            Self::Replace(value) => value.clone(),
            Self::Merge(update) => merge_objects(current, update),
        }
    }
}

/// Shallow merge of two JSON objects
///
/// Non-object inputs are treated as replacement: the update wins unless it
/// is null.
pub fn merge_objects(base: &Value, update: &Value) -> Value {
    match (base, update) {
        (Value::Object(base), Value::Object(update)) => {
            let mut merged = base.clone();
            for (k, v) in update {
                merged.insert(k.clone(), v.clone());
            }
            Value::Object(merged)
        }
        (base, Value::Null) => base.clone(),
        (_, update) => update.clone(),
    }
}

/// The outcome of handling one event
///
/// Produced by [`Workflow::on_event`](super::Workflow::on_event); recorded as
/// the event's `to_state` and applied to the execution in the same
/// transaction as the event append.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transition {
    pub to_state: String,
    pub context: ContextUpdate,
    pub status: Option<ExecutionStatus>,
    pub actions: Vec<ActionRequest>,
}

impl Transition {
    /// Move to a state
    pub fn to(state: impl Into<String>) -> Self {
        Self {
            to_state: state.into(),
            ..Default::default()
        }
    }

    /// Merge keys into the context
    pub fn merge(mut self, update: Value) -> Self {
        self.context = ContextUpdate::Merge(update);
        self
    }

    /// Replace the context entirely
    pub fn replace_context(mut self, context: Value) -> Self {
        self.context = ContextUpdate::Replace(context);
        self
    }

    /// Set a status alongside the state change
    pub fn with_status(mut self, status: ExecutionStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Mark the execution completed
    pub fn complete(self) -> Self {
        self.with_status(ExecutionStatus::Completed)
    }

    /// Mark the execution rejected
    pub fn reject(self) -> Self {
        self.with_status(ExecutionStatus::Rejected)
    }

    /// Request an action
    pub fn dispatch(mut self, request: ActionRequest) -> Self {
        self.actions.push(request);
        self
    }
}
