//! Workflow events - the append-only history of an execution

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::WorkflowError;

/// Names of events the engine and the task inbox emit
pub mod names {
    pub const WORKFLOW_STARTED: &str = "workflow_started";
    pub const WORKFLOW_FAILED: &str = "workflow_failed";
    pub const WORKFLOW_CANCELLED: &str = "workflow_cancelled";

    pub const TASK_CREATED: &str = "task_created";
    pub const TASK_CLAIMED: &str = "task_claimed";
    pub const TASK_RELEASED: &str = "task_released";
    pub const TASK_COMPLETED: &str = "task_completed";
    pub const TASK_CANCELLED: &str = "task_cancelled";

    pub const ACTION_FAILED: &str = "action_failed";
}

/// Where an event came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Authored by the engine itself (start, failure, cancellation)
    Lifecycle,

    /// Delivered by a caller outside the engine
    External,

    /// Emitted by the task inbox
    Task,

    /// Emitted after an action failed
    Action,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lifecycle => "lifecycle",
            Self::External => "external",
            Self::Task => "task",
            Self::Action => "action",
        }
    }

    /// Parse the persisted form
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "lifecycle" => Some(Self::Lifecycle),
            "external" => Some(Self::External),
            "task" => Some(Self::Task),
            "action" => Some(Self::Action),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded event
///
/// `sequence` is the 0-based, gap-free position in the execution's log and
/// is the ordering used by replay. `created_at` is informational.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub event_id: Uuid,
    pub execution_id: Uuid,
    pub tenant: String,
    pub sequence: i64,
    pub event_name: String,
    pub event_type: EventType,
    pub from_state: Option<String>,
    pub to_state: String,
    pub user_id: Option<String>,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

/// The part of an event the workflow logic reacts to
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    pub event_id: Uuid,
    pub name: String,
    pub event_type: EventType,
    pub payload: Value,
    pub user_id: Option<String>,
}

impl InboundEvent {
    pub fn new(name: impl Into<String>, event_type: EventType, payload: Value) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            name: name.into(),
            event_type,
            payload,
            user_id: None,
        }
    }

    pub fn with_user(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn with_id(mut self, event_id: Uuid) -> Self {
        self.event_id = event_id;
        self
    }

    /// Typed view of the payload
    ///
    /// Fails with a `payload` coded [`WorkflowError`], so logic can `?` it.
    pub fn view<T: DeserializeOwned>(&self) -> Result<T, WorkflowError> {
        T::deserialize(&self.payload).map_err(|e| {
            WorkflowError::new(format!("invalid {} payload: {e}", self.name)).with_code("payload")
        })
    }
}

impl From<&WorkflowEvent> for InboundEvent {
    fn from(event: &WorkflowEvent) -> Self {
        Self {
            event_id: event.event_id,
            name: event.event_name.clone(),
            event_type: event.event_type,
            payload: event.payload.clone(),
            user_id: event.user_id.clone(),
        }
    }
}

/// Half-open sequence window `(after, until]`
///
/// `events(after: a, until: b)` followed by `events(after: b, until: c)`
/// yields exactly `events(after: a, until: c)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventRange {
    pub after: Option<i64>,
    pub until: Option<i64>,
}

impl EventRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn after(mut self, sequence: i64) -> Self {
        self.after = Some(sequence);
        self
    }

    pub fn until(mut self, sequence: i64) -> Self {
        self.until = Some(sequence);
        self
    }

    pub fn contains(&self, sequence: i64) -> bool {
        self.after.map_or(true, |a| sequence > a) && self.until.map_or(true, |u| sequence <= u)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_roundtrip() {
        for t in [
            EventType::Lifecycle,
            EventType::External,
            EventType::Task,
            EventType::Action,
        ] {
            assert_eq!(EventType::parse(t.as_str()), Some(t));
        }
        assert_eq!(EventType::parse("bogus"), None);
    }

    #[test]
    fn test_payload_view() {
        #[derive(Debug, Deserialize)]
        struct Decision {
            decision: String,
        }

        let event = InboundEvent::new(
            "review",
            EventType::External,
            serde_json::json!({"decision": "approve"}),
        );
        let decision: Decision = event.view().unwrap();
        assert_eq!(decision.decision, "approve");

        let bad = InboundEvent::new("review", EventType::External, serde_json::json!([1]));
        let err = bad.view::<Decision>().unwrap_err();
        assert_eq!(err.code.as_deref(), Some("payload"));
    }

    #[test]
    fn test_range_composition() {
        let left = EventRange::all().after(2).until(5);
        let right = EventRange::all().after(5).until(9);
        let whole = EventRange::all().after(2).until(9);

        for seq in 0..12 {
            assert_eq!(
                left.contains(seq) || right.contains(seq),
                whole.contains(seq),
                "sequence {seq}"
            );
            assert!(!(left.contains(seq) && right.contains(seq)));
        }
    }
}
