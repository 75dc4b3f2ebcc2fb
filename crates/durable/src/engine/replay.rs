//! Event fold: rebuild execution state from the log
//!
//! Engine-authored lifecycle events are applied directly. Every other event
//! is re-run through the workflow logic and the recomputed `to_state` must
//! match the recorded one.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::catalog::AnyWorkflow;
use crate::persistence::ExecutionSnapshot;
use crate::workflow::{
    names, EventType, ExecutionStatus, InboundEvent, StateView, Transition, WorkflowError,
    WorkflowEvent,
};

/// State reconstructed from the log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayedState {
    pub state: String,
    pub status: ExecutionStatus,
    pub context: Value,
    /// Sequence of the last folded event
    pub sequence: i64,
}

impl ReplayedState {
    pub fn view(&self) -> StateView<'_> {
        StateView {
            state: &self.state,
            status: self.status,
            context: &self.context,
        }
    }

    /// Result of applying a transition on top of this state
    pub fn apply(&self, transition: &Transition, sequence: i64) -> Self {
        Self {
            state: transition.to_state.clone(),
            status: resolve_status(self.status, transition.status),
            context: transition.context.apply(&self.context),
            sequence,
        }
    }

    pub fn to_snapshot(&self, tenant: &str, execution_id: Uuid) -> ExecutionSnapshot {
        ExecutionSnapshot {
            execution_id,
            tenant: tenant.to_string(),
            sequence: self.sequence,
            state: self.state.clone(),
            status: self.status,
            context_data: self.context.clone(),
            created_at: chrono::Utc::now(),
        }
    }
}

impl From<ExecutionSnapshot> for ReplayedState {
    fn from(snapshot: ExecutionSnapshot) -> Self {
        Self {
            state: snapshot.state,
            status: snapshot.status,
            context: snapshot.context_data,
            sequence: snapshot.sequence,
        }
    }
}

/// Status after a transition
///
/// An explicit status wins. Otherwise a failed execution that accepted an
/// event becomes active again; any other status is kept.
pub fn resolve_status(current: ExecutionStatus, requested: Option<ExecutionStatus>) -> ExecutionStatus {
    match (requested, current) {
        (Some(status), _) => status,
        (None, ExecutionStatus::Failed) => ExecutionStatus::Active,
        (None, current) => current,
    }
}

/// Errors raised while folding
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    /// Nothing to fold
    #[error("execution has no events")]
    Empty,

    /// The log does not start with workflow_started
    #[error("first event is {0}, expected workflow_started")]
    MissingStart(String),

    /// Sequence numbers are not contiguous
    #[error("sequence gap: expected {expected}, found {found}")]
    Gap { expected: i64, found: i64 },

    /// Logic produced a different state than recorded (non-determinism)
    #[error("event {sequence} ({event_name}) recorded to_state {recorded}, logic produced {recomputed}")]
    Diverged {
        sequence: i64,
        event_name: String,
        recorded: String,
        recomputed: String,
    },

    /// Logic failed on an event it accepted when first delivered
    #[error("logic failed replaying event {sequence}: {error}")]
    Logic { sequence: i64, error: WorkflowError },
}

/// Fold `events` onto `start` (or onto nothing, in which case the first
/// event must be `workflow_started`)
pub fn fold(
    logic: &dyn AnyWorkflow,
    start: Option<ReplayedState>,
    events: &[WorkflowEvent],
) -> Result<ReplayedState, ReplayError> {
    let mut iter = events.iter();

    let mut current = match start {
        Some(state) => state,
        None => {
            let first = iter.next().ok_or(ReplayError::Empty)?;
            if first.event_name != names::WORKFLOW_STARTED || first.sequence != 0 {
                return Err(ReplayError::MissingStart(first.event_name.clone()));
            }
            ReplayedState {
                state: first.to_state.clone(),
                status: ExecutionStatus::Active,
                context: first.payload.clone(),
                sequence: 0,
            }
        }
    };

    for event in iter {
        if event.sequence != current.sequence + 1 {
            return Err(ReplayError::Gap {
                expected: current.sequence + 1,
                found: event.sequence,
            });
        }
        current = step(logic, &current, event)?;
    }

    Ok(current)
}

fn step(
    logic: &dyn AnyWorkflow,
    current: &ReplayedState,
    event: &WorkflowEvent,
) -> Result<ReplayedState, ReplayError> {
    if event.event_type == EventType::Lifecycle {
        let status = match event.event_name.as_str() {
            names::WORKFLOW_FAILED => ExecutionStatus::Failed,
            names::WORKFLOW_CANCELLED => ExecutionStatus::Rejected,
            _ => current.status,
        };
        return Ok(ReplayedState {
            state: event.to_state.clone(),
            status,
            context: current.context.clone(),
            sequence: event.sequence,
        });
    }

    let inbound = InboundEvent::from(event);
    match logic.on_event(&current.view(), &inbound) {
        Ok(Some(transition)) => {
            if transition.to_state != event.to_state {
                return Err(ReplayError::Diverged {
                    sequence: event.sequence,
                    event_name: event.event_name.clone(),
                    recorded: event.to_state.clone(),
                    recomputed: transition.to_state,
                });
            }
            Ok(current.apply(&transition, event.sequence))
        }
        // Recorded as a no-op self-transition when first delivered
        Ok(None) if event.to_state == current.state => Ok(ReplayedState {
            sequence: event.sequence,
            ..current.clone()
        }),
        Ok(None) => Err(ReplayError::Diverged {
            sequence: event.sequence,
            event_name: event.event_name.clone(),
            recorded: event.to_state.clone(),
            recomputed: current.state.clone(),
        }),
        Err(error) => Err(ReplayError::Logic {
            sequence: event.sequence,
            error,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::LogicCatalog;
    use crate::workflow::WorkflowDefinition;
    use chrono::Utc;
    use serde_json::json;

    fn logic() -> Box<dyn AnyWorkflow> {
        LogicCatalog::new()
            .build(&WorkflowDefinition::new(
                "state_machine",
                json!({
                    "initial_state": "draft",
                    "states": {
                        "draft": { "on": { "submit": { "target": "review" } } },
                        "review": { "on": { "approve": { "target": "done" } } },
                        "done": { "status": "completed" }
                    }
                }),
            ))
            .expect("valid")
    }

    fn event(seq: i64, name: &str, event_type: EventType, to: &str, payload: Value) -> WorkflowEvent {
        WorkflowEvent {
            event_id: Uuid::now_v7(),
            execution_id: Uuid::nil(),
            tenant: "acme".into(),
            sequence: seq,
            event_name: name.into(),
            event_type,
            from_state: None,
            to_state: to.into(),
            user_id: None,
            payload,
            created_at: Utc::now(),
        }
    }

    fn history() -> Vec<WorkflowEvent> {
        vec![
            event(0, names::WORKFLOW_STARTED, EventType::Lifecycle, "draft", json!({"amount": 5})),
            event(1, "submit", EventType::External, "review", json!({"note": "pls"})),
            event(2, names::TASK_CLAIMED, EventType::Task, "review", json!({})),
            event(3, "approve", EventType::External, "done", json!({})),
        ]
    }

    #[test]
    fn test_full_fold() {
        let state = fold(logic().as_ref(), None, &history()).expect("fold");
        assert_eq!(state.state, "done");
        assert_eq!(state.status, ExecutionStatus::Completed);
        assert_eq!(state.context, json!({"amount": 5, "note": "pls"}));
        assert_eq!(state.sequence, 3);
    }

    #[test]
    fn test_fold_from_midpoint_matches() {
        let events = history();
        let logic = logic();
        let mid = fold(logic.as_ref(), None, &events[..2]).expect("prefix");
        let resumed = fold(logic.as_ref(), Some(mid), &events[2..]).expect("suffix");
        assert_eq!(resumed, fold(logic.as_ref(), None, &events).expect("full"));
    }

    #[test]
    fn test_divergence_detected() {
        let mut events = history();
        events[1].to_state = "elsewhere".into();
        let err = fold(logic().as_ref(), None, &events).expect_err("diverged");
        assert!(matches!(err, ReplayError::Diverged { sequence: 1, .. }));
    }

    #[test]
    fn test_gap_detected() {
        let mut events = history();
        events.remove(2);
        let err = fold(logic().as_ref(), None, &events).expect_err("gap");
        assert!(matches!(err, ReplayError::Gap { expected: 2, found: 3 }));
    }

    #[test]
    fn test_failure_then_recovery_status() {
        let events = vec![
            event(0, names::WORKFLOW_STARTED, EventType::Lifecycle, "draft", json!({})),
            event(1, names::WORKFLOW_FAILED, EventType::Lifecycle, "draft", json!({"error": "x"})),
            event(2, "submit", EventType::External, "review", json!({})),
        ];
        let logic = logic();

        let failed = fold(logic.as_ref(), None, &events[..2]).expect("fold");
        assert_eq!(failed.status, ExecutionStatus::Failed);

        let recovered = fold(logic.as_ref(), None, &events).expect("fold");
        assert_eq!(recovered.status, ExecutionStatus::Active);
        assert_eq!(recovered.state, "review");
    }

    #[test]
    fn test_empty_history() {
        assert!(matches!(
            fold(logic().as_ref(), None, &[]),
            Err(ReplayError::Empty)
        ));
    }
}
