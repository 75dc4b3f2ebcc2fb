//! Declarative state-machine logic
//!
//! The built-in `state_machine` workflow type. Its definition config lists
//! states, the events each state reacts to, and the actions to dispatch on
//! each edge:
//!
//! ```json
//! {
//!   "initial_state": "draft",
//!   "states": {
//!     "draft": {
//!       "on": {
//!         "submit": [
//!           { "when": { "path": "context.amount", "op": "gt", "value": 10000 },
//!             "target": "pending_cfo" },
//!           { "target": "pending_approval",
//!             "actions": [{ "action": "send_notification",
//!                           "params": { "amount": "$context.amount" } }] }
//!         ]
//!       }
//!     },
//!     "approved": { "status": "completed" }
//!   }
//! }
//! ```
//!
//! String parameters of the form `$context.x`, `$payload.x` or `$event.x`
//! are replaced by the referenced value when the edge fires.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{
    ActionRequest, ExecutionStatus, InboundEvent, StateView, Transition, Workflow, WorkflowError,
};

/// Definition config for [`StateMachine`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateMachineConfig {
    pub initial_state: String,
    pub states: BTreeMap<String, StateSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StateSpec {
    /// Status the execution takes on when entering this state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ExecutionStatus>,

    /// Event name to outgoing edges; the first edge whose guard holds fires
    #[serde(default)]
    pub on: BTreeMap<String, Edges>,
}

/// One edge or an ordered list of guarded edges
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Edges {
    One(EdgeSpec),
    Many(Vec<EdgeSpec>),
}

impl Edges {
    fn as_slice(&self) -> &[EdgeSpec] {
        match self {
            Self::One(edge) => std::slice::from_ref(edge),
            Self::Many(edges) => edges,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EdgeSpec {
    pub target: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<Guard>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<ActionTemplate>,

    /// Merge an object payload into the context
    #[serde(default = "default_true")]
    pub merge_payload: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionTemplate {
    pub action: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
}

/// Condition over `context`, `payload` and `event` (dot-separated path)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Guard {
    pub path: String,
    pub op: GuardOp,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GuardOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Exists,
}

impl Guard {
    fn holds(&self, scope: &Value) -> bool {
        let actual = lookup(scope, &self.path);
        match self.op {
            GuardOp::Exists => actual.is_some_and(|v| !v.is_null()),
            GuardOp::Eq => actual == Some(&self.value),
            GuardOp::Ne => actual != Some(&self.value),
            GuardOp::Gt | GuardOp::Gte | GuardOp::Lt | GuardOp::Lte => {
                let (Some(a), Some(b)) = (actual.and_then(Value::as_f64), self.value.as_f64())
                else {
                    return false;
                };
                match self.op {
                    GuardOp::Gt => a > b,
                    GuardOp::Gte => a >= b,
                    GuardOp::Lt => a < b,
                    _ => a <= b,
                }
            }
        }
    }
}

fn lookup<'v>(scope: &'v Value, path: &str) -> Option<&'v Value> {
    path.split('.').try_fold(scope, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn render(template: &Value, scope: &Value) -> Value {
    match template {
        Value::String(s) => match s.strip_prefix('$') {
            Some(path) if !path.is_empty() => lookup(scope, path).cloned().unwrap_or(Value::Null),
            _ => template.clone(),
        },
        Value::Array(items) => Value::Array(items.iter().map(|v| render(v, scope)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render(v, scope)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Interpreter for [`StateMachineConfig`]
#[derive(Debug, Clone)]
pub struct StateMachine {
    config: StateMachineConfig,
}

impl Workflow for StateMachine {
    const TYPE: &'static str = "state_machine";
    type Config = StateMachineConfig;

    fn new(config: Self::Config) -> Result<Self, WorkflowError> {
        if !config.states.contains_key(&config.initial_state) {
            return Err(WorkflowError::new(format!(
                "initial state '{}' is not declared",
                config.initial_state
            ))
            .with_code("invalid_definition"));
        }

        for (state, spec) in &config.states {
            for (event, edges) in &spec.on {
                if edges.as_slice().is_empty() {
                    return Err(WorkflowError::new(format!(
                        "state '{state}' declares no edges for '{event}'"
                    ))
                    .with_code("invalid_definition"));
                }
                for edge in edges.as_slice() {
                    if !config.states.contains_key(&edge.target) {
                        return Err(WorkflowError::new(format!(
                            "state '{state}' on '{event}' targets unknown state '{}'",
                            edge.target
                        ))
                        .with_code("invalid_definition"));
                    }
                }
            }
        }

        Ok(Self { config })
    }

    fn initial_state(&self) -> String {
        self.config.initial_state.clone()
    }

    fn on_event(
        &self,
        view: &StateView<'_>,
        event: &InboundEvent,
    ) -> Result<Option<Transition>, WorkflowError> {
        let Some(state) = self.config.states.get(view.state) else {
            return Err(WorkflowError::new(format!(
                "execution is in undeclared state '{}'",
                view.state
            ))
            .with_code("unknown_state"));
        };
        let Some(edges) = state.on.get(&event.name) else {
            return Ok(None);
        };

        let scope = json!({
            "context": view.context,
            "payload": event.payload,
            "event": {
                "name": event.name,
                "type": event.event_type,
                "user_id": event.user_id,
                "event_id": event.event_id,
            },
        });

        let Some(edge) = edges
            .as_slice()
            .iter()
            .find(|edge| edge.when.as_ref().map_or(true, |g| g.holds(&scope)))
        else {
            return Ok(None);
        };

        let mut transition = Transition::to(edge.target.clone());
        if edge.merge_payload && event.payload.is_object() {
            transition = transition.merge(event.payload.clone());
        }
        if let Some(status) = self.config.states.get(&edge.target).and_then(|s| s.status) {
            transition = transition.with_status(status);
        }
        for template in &edge.actions {
            let mut request = ActionRequest::new(&template.action, render(&template.params, &scope));
            request.step = template.step.clone();
            transition = transition.dispatch(request);
        }

        Ok(Some(transition))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::EventType;

    fn approval_config() -> StateMachineConfig {
        serde_json::from_value(json!({
            "initial_state": "draft",
            "states": {
                "draft": {
                    "on": {
                        "submit": [
                            { "when": { "path": "context.amount", "op": "gt", "value": 10000 },
                              "target": "pending_cfo" },
                            { "target": "pending_approval",
                              "actions": [{ "action": "send_notification",
                                            "params": { "amount": "$context.amount",
                                                        "by": "$event.user_id" } }] }
                        ]
                    }
                },
                "pending_cfo": {},
                "pending_approval": {
                    "on": { "approve": { "target": "approved" } }
                },
                "approved": { "status": "completed" }
            }
        }))
        .expect("valid config")
    }

    fn view<'a>(state: &'a str, context: &'a Value) -> StateView<'a> {
        StateView {
            state,
            status: ExecutionStatus::Active,
            context,
        }
    }

    #[test]
    fn test_rejects_unknown_target() {
        let mut config = approval_config();
        config
            .states
            .get_mut("pending_approval")
            .expect("state")
            .on
            .insert(
                "reject".into(),
                Edges::One(EdgeSpec {
                    target: "nowhere".into(),
                    when: None,
                    actions: vec![],
                    merge_payload: true,
                }),
            );

        let err = StateMachine::new(config).expect_err("should reject");
        assert_eq!(err.code.as_deref(), Some("invalid_definition"));
    }

    #[test]
    fn test_guarded_edges() {
        let machine = StateMachine::new(approval_config()).expect("valid");
        let submit = InboundEvent::new("submit", EventType::External, json!({}))
            .with_user(Some("u1".into()));

        let big = json!({"amount": 50000});
        let t = machine
            .on_event(&view("draft", &big), &submit)
            .expect("ok")
            .expect("handled");
        assert_eq!(t.to_state, "pending_cfo");
        assert!(t.actions.is_empty());

        let small = json!({"amount": 120});
        let t = machine
            .on_event(&view("draft", &small), &submit)
            .expect("ok")
            .expect("handled");
        assert_eq!(t.to_state, "pending_approval");
        assert_eq!(t.actions[0].params, json!({"amount": 120, "by": "u1"}));
    }

    #[test]
    fn test_unhandled_event_and_status() {
        let machine = StateMachine::new(approval_config()).expect("valid");
        let ctx = json!({});

        let approve = InboundEvent::new("approve", EventType::External, json!({"note": "ok"}));
        assert!(machine
            .on_event(&view("draft", &ctx), &approve)
            .expect("ok")
            .is_none());

        let t = machine
            .on_event(&view("pending_approval", &ctx), &approve)
            .expect("ok")
            .expect("handled");
        assert_eq!(t.status, Some(ExecutionStatus::Completed));
        assert_eq!(t.context.apply(&ctx), json!({"note": "ok"}));
    }
}
