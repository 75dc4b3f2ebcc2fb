//! Execution engine with replay support
//!
//! The `ExecutionEngine` is responsible for:
//! - Creating executions from registered workflow versions
//! - Delivering events: replay, run the logic, append atomically
//! - Dispatching the actions a transition requests
//! - Turning logic and action failures into recorded events

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::catalog::AnyWorkflow;
use super::registry::{RegistryError, WorkflowRegistry};
use super::replay::{fold, ReplayError, ReplayedState};
use crate::action::{ActionContext, ActionError, ActionRegistry};
use crate::config::EngineConfig;
use crate::error::ErrorKind;
use crate::persistence::{
    ExecutionFilter, ExecutionUpdate, StoreError, WorkflowExecution, WorkflowStore,
};
use crate::workflow::{
    merge_objects, names, ActionRequest, EventRange, EventType, ExecutionStatus, InboundEvent,
    WorkflowError, WorkflowEvent,
};

/// Errors from engine operations
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Registry error
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// No such workflow (or version)
    #[error("workflow not found: {name}{}", .version.as_ref().map(|v| format!("@{v}")).unwrap_or_default())]
    WorkflowNotFound {
        name: String,
        version: Option<String>,
    },

    /// No such execution
    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    /// Execution is completed or rejected
    #[error("execution {0} is {1} and accepts no events")]
    ExecutionTerminal(Uuid, ExecutionStatus),

    /// The logic does not handle this external event in the current state
    #[error("event {event_name} is not handled in state {state}")]
    UnhandledEvent { event_name: String, state: String },

    /// Malformed delivery
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    /// An event id was redelivered with a different name
    #[error("event {event_id} was recorded as {recorded}, redelivered as {delivered}")]
    EventIdConflict {
        event_id: Uuid,
        recorded: String,
        delivered: String,
    },

    /// Replay error (non-determinism detected)
    #[error("replay error: {0}")]
    Replay(#[from] ReplayError),

    /// Too many events
    #[error("execution {0} has too many events ({1} >= {2})")]
    TooManyEvents(Uuid, usize, usize),
}

impl ExecutorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Store(e) => e.kind(),
            Self::Registry(e) => e.kind(),
            Self::WorkflowNotFound { .. } | Self::ExecutionNotFound(_) => ErrorKind::NotFound,
            Self::ExecutionTerminal(..) | Self::EventIdConflict { .. } => ErrorKind::Conflict,
            Self::UnhandledEvent { .. } | Self::InvalidEvent(_) => ErrorKind::Validation,
            Self::Replay(_) | Self::TooManyEvents(..) => ErrorKind::ExecutionFailure,
        }
    }
}

/// Request to start an execution
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateExecution {
    pub workflow_name: String,
    /// Pin a version; the current version otherwise
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub initial_context: Value,
    #[serde(default)]
    pub user_id: Option<String>,
}

impl CreateExecution {
    pub fn new(workflow_name: impl Into<String>, initial_context: Value) -> Self {
        Self {
            workflow_name: workflow_name.into(),
            initial_context,
            ..Default::default()
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// An event delivered to an execution
///
/// Supplying `event_id` makes delivery idempotent: redelivering the same id
/// appends nothing and re-dispatches the recorded transition's actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliverEvent {
    pub execution_id: Uuid,
    pub event_name: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub event_id: Option<Uuid>,
    #[serde(default = "default_event_type")]
    pub event_type: EventType,
}

fn default_event_type() -> EventType {
    EventType::External
}

impl DeliverEvent {
    /// An event from outside the engine
    pub fn external(execution_id: Uuid, event_name: impl Into<String>, payload: Value) -> Self {
        Self {
            execution_id,
            event_name: event_name.into(),
            payload,
            user_id: None,
            event_id: None,
            event_type: EventType::External,
        }
    }

    /// A task lifecycle event
    pub fn task(execution_id: Uuid, event_name: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: EventType::Task,
            ..Self::external(execution_id, event_name, payload)
        }
    }

    pub fn with_user(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn with_event_id(mut self, event_id: Uuid) -> Self {
        self.event_id = Some(event_id);
        self
    }
}

/// What happened to one requested action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchedAction {
    pub action: String,
    pub idempotency_key: String,
    pub result: Option<Value>,
    pub error: Option<String>,
    /// Not attempted because an earlier action in the same transition failed
    pub skipped: bool,
}

/// Result of delivering an event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryOutcome {
    pub execution_id: Uuid,
    /// Id of the recorded event (`workflow_failed` when the logic errored)
    pub event_id: Uuid,
    pub sequence: i64,
    pub from_state: String,
    /// State the event moved the execution to
    pub new_state: String,
    /// State after dispatched actions settled
    pub current_state: String,
    pub status: ExecutionStatus,
    /// The event id had already been recorded
    pub duplicate: bool,
    pub actions: Vec<DispatchedAction>,
    /// Logic or action failure recorded during this delivery
    pub failure: Option<String>,
}

/// What to do when the logic returns no transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unhandled {
    /// Refuse the event; nothing is appended
    Reject,
    /// Append as a self-transition
    Record,
    /// Append `workflow_failed` instead
    Fail,
}

impl Unhandled {
    fn for_event_type(event_type: EventType) -> Self {
        match event_type {
            EventType::External | EventType::Lifecycle => Self::Reject,
            EventType::Task => Self::Record,
            EventType::Action => Self::Fail,
        }
    }
}

/// Outcome of recording under the execution lock
struct Recorded {
    outcome: DeliveryOutcome,
    trigger_event_id: Uuid,
    user_id: Option<String>,
    actions: Vec<ActionRequest>,
}

/// Execution engine
///
/// Drives executions by replaying their history and applying the workflow
/// logic to each delivered event. Deliveries to one execution are
/// serialized in-process with a keyed lock, and across processes with the
/// store's expected-sequence check.
///
/// # Example
///
/// ```ignore
/// use opsflow_durable::prelude::*;
///
/// let store = Arc::new(InMemoryWorkflowStore::new());
/// let registry = Arc::new(WorkflowRegistry::new(Arc::clone(&store)));
/// let actions = Arc::new(ActionRegistry::new(Arc::clone(&store)));
/// let engine = ExecutionEngine::new(store, registry, actions, EngineConfig::default());
///
/// let id = engine.create_execution("acme", CreateExecution::new("invoice", json!({}))).await?;
/// engine.deliver_event("acme", DeliverEvent::external(id, "submit", json!({}))).await?;
/// ```
pub struct ExecutionEngine<S: WorkflowStore> {
    store: Arc<S>,
    registry: Arc<WorkflowRegistry<S>>,
    actions: Arc<ActionRegistry<S>>,
    config: EngineConfig,
    logic_cache: DashMap<Uuid, Arc<dyn AnyWorkflow>>,
    execution_locks: DashMap<Uuid, Arc<tokio::sync::Mutex<()>>>,
}

impl<S: WorkflowStore> ExecutionEngine<S> {
    pub fn new(
        store: Arc<S>,
        registry: Arc<WorkflowRegistry<S>>,
        actions: Arc<ActionRegistry<S>>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            registry,
            actions,
            config,
            logic_cache: DashMap::new(),
            execution_locks: DashMap::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<WorkflowRegistry<S>> {
        &self.registry
    }

    pub fn actions(&self) -> &Arc<ActionRegistry<S>> {
        &self.actions
    }

    /// Start an execution of a registered workflow
    ///
    /// The effective initial context is the version's parameters merged with
    /// `initial_context`; it is the payload of the `workflow_started` event
    /// written in the same step that creates the execution.
    #[instrument(skip(self, request), fields(workflow = %request.workflow_name))]
    pub async fn create_execution(
        &self,
        tenant: &str,
        request: CreateExecution,
    ) -> Result<Uuid, ExecutorError> {
        if !(request.initial_context.is_object() || request.initial_context.is_null()) {
            return Err(ExecutorError::InvalidEvent(
                "initial context must be an object".into(),
            ));
        }

        let registration = self
            .registry
            .get_by_name(tenant, &request.workflow_name, request.version.as_deref())
            .await?
            .ok_or_else(|| ExecutorError::WorkflowNotFound {
                name: request.workflow_name.clone(),
                version: request.version.clone(),
            })?;

        let version = registration.version;
        let logic = self.logic_for(tenant, version.version_id).await?;
        let initial_state = logic.initial_state();
        let context = merge_objects(&version.parameters, &request.initial_context);

        let now = Utc::now();
        let execution = WorkflowExecution {
            execution_id: Uuid::now_v7(),
            tenant: tenant.to_string(),
            workflow_name: registration.registration.name,
            workflow_version_id: version.version_id,
            current_state: initial_state.clone(),
            status: ExecutionStatus::Active,
            context_data: context.clone(),
            sequence: 1,
            created_at: now,
            updated_at: now,
        };
        let started = WorkflowEvent {
            event_id: Uuid::now_v7(),
            execution_id: execution.execution_id,
            tenant: tenant.to_string(),
            sequence: 0,
            event_name: names::WORKFLOW_STARTED.to_string(),
            event_type: EventType::Lifecycle,
            from_state: None,
            to_state: initial_state,
            user_id: request.user_id,
            payload: context,
            created_at: now,
        };

        self.store.create_execution(&execution, &started).await?;

        info!(
            execution_id = %execution.execution_id,
            version = %version.version,
            state = %execution.current_state,
            "execution created"
        );
        Ok(execution.execution_id)
    }

    /// Deliver an event to an execution
    ///
    /// The event and the execution's new state are committed together.
    /// Requested actions run after the commit, outside the per-execution
    /// lock; a failing action is reported to the logic as `action_failed`
    /// and fails the execution if the logic does not handle it. An error
    /// return means the event was not recorded.
    #[instrument(skip(self, event), fields(execution_id = %event.execution_id, event_name = %event.event_name))]
    pub async fn deliver_event(
        &self,
        tenant: &str,
        event: DeliverEvent,
    ) -> Result<DeliveryOutcome, ExecutorError> {
        if event.event_name.trim().is_empty() {
            return Err(ExecutorError::InvalidEvent("event name is empty".into()));
        }
        if event.event_type == EventType::Lifecycle {
            return Err(ExecutorError::InvalidEvent(format!(
                "{} events are written by the engine",
                EventType::Lifecycle
            )));
        }

        let policy = Unhandled::for_event_type(event.event_type);
        let recorded = self
            .with_execution_lock(event.execution_id, self.record(tenant, &event, policy, false))
            .await?;
        Ok(self.dispatch(tenant, recorded).await)
    }

    /// Stop an execution; recorded as `workflow_cancelled` with status rejected
    #[instrument(skip(self, reason))]
    pub async fn cancel_execution(
        &self,
        tenant: &str,
        execution_id: Uuid,
        reason: &str,
        user_id: Option<String>,
    ) -> Result<DeliveryOutcome, ExecutorError> {
        self.with_execution_lock(
            execution_id,
            self.cancel(tenant, execution_id, reason, user_id),
        )
        .await
    }

    async fn cancel(
        &self,
        tenant: &str,
        execution_id: Uuid,
        reason: &str,
        user_id: Option<String>,
    ) -> Result<DeliveryOutcome, ExecutorError> {
        let execution = self.require_open_execution(tenant, execution_id).await?;
        let event = WorkflowEvent {
            event_id: Uuid::now_v7(),
            execution_id,
            tenant: tenant.to_string(),
            sequence: execution.sequence,
            event_name: names::WORKFLOW_CANCELLED.to_string(),
            event_type: EventType::Lifecycle,
            from_state: Some(execution.current_state.clone()),
            to_state: execution.current_state.clone(),
            user_id,
            payload: json!({ "reason": reason }),
            created_at: Utc::now(),
        };
        let update = ExecutionUpdate {
            current_state: execution.current_state.clone(),
            status: ExecutionStatus::Rejected,
            context_data: execution.context_data.clone(),
        };
        self.store.append_event(&event, &update).await?;

        info!(%execution_id, "execution cancelled");
        Ok(DeliveryOutcome {
            execution_id,
            event_id: event.event_id,
            sequence: event.sequence,
            from_state: execution.current_state.clone(),
            new_state: execution.current_state.clone(),
            current_state: execution.current_state,
            status: ExecutionStatus::Rejected,
            duplicate: false,
            actions: vec![],
            failure: None,
        })
    }

    /// Rebuild state from the log, optionally only up to a sequence
    #[instrument(skip(self))]
    pub async fn replay(
        &self,
        tenant: &str,
        execution_id: Uuid,
        up_to: Option<i64>,
    ) -> Result<ReplayedState, ExecutorError> {
        let execution = self.require_execution(tenant, execution_id).await?;
        let logic = self.logic_for(tenant, execution.workflow_version_id).await?;
        self.replay_with(tenant, &execution, logic.as_ref(), up_to)
            .await
    }

    /// Ordered events with `after < sequence <= until`
    pub async fn events(
        &self,
        tenant: &str,
        execution_id: Uuid,
        range: EventRange,
    ) -> Result<Vec<WorkflowEvent>, ExecutorError> {
        self.require_execution(tenant, execution_id).await?;
        Ok(self.store.load_events(tenant, execution_id, range).await?)
    }

    pub async fn execution(
        &self,
        tenant: &str,
        execution_id: Uuid,
    ) -> Result<Option<WorkflowExecution>, ExecutorError> {
        Ok(self.store.get_execution(tenant, execution_id).await?)
    }

    pub async fn list_executions(
        &self,
        tenant: &str,
        filter: &ExecutionFilter,
    ) -> Result<Vec<WorkflowExecution>, ExecutorError> {
        Ok(self.store.list_executions(tenant, filter).await?)
    }

    pub async fn require_execution(
        &self,
        tenant: &str,
        execution_id: Uuid,
    ) -> Result<WorkflowExecution, ExecutorError> {
        self.store
            .get_execution(tenant, execution_id)
            .await?
            .ok_or(ExecutorError::ExecutionNotFound(execution_id))
    }

    /// The execution, provided it still accepts events
    pub async fn require_open_execution(
        &self,
        tenant: &str,
        execution_id: Uuid,
    ) -> Result<WorkflowExecution, ExecutorError> {
        let execution = self.require_execution(tenant, execution_id).await?;
        if execution.status.is_terminal() {
            return Err(ExecutorError::ExecutionTerminal(
                execution_id,
                execution.status,
            ));
        }
        Ok(execution)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn lock_for(&self, execution_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        self.execution_locks
            .entry(execution_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn logic_for(
        &self,
        tenant: &str,
        version_id: Uuid,
    ) -> Result<Arc<dyn AnyWorkflow>, ExecutorError> {
        if let Some(logic) = self.logic_cache.get(&version_id) {
            return Ok(Arc::clone(logic.value()));
        }

        let version = self
            .registry
            .find_version(tenant, version_id)
            .await?
            .ok_or_else(|| ExecutorError::WorkflowNotFound {
                name: version_id.to_string(),
                version: None,
            })?;
        let logic: Arc<dyn AnyWorkflow> = Arc::from(self.registry.build_logic(&version)?);
        self.logic_cache.insert(version_id, Arc::clone(&logic));
        Ok(logic)
    }

    async fn replay_with(
        &self,
        tenant: &str,
        execution: &WorkflowExecution,
        logic: &dyn AnyWorkflow,
        up_to: Option<i64>,
    ) -> Result<ReplayedState, ExecutorError> {
        let snapshot = if self.config.snapshot_interval > 0 {
            self.store
                .latest_snapshot(tenant, execution.execution_id, up_to)
                .await?
        } else {
            None
        };

        let mut range = EventRange::all();
        if let Some(snapshot) = &snapshot {
            range = range.after(snapshot.sequence);
        }
        if let Some(up_to) = up_to {
            range = range.until(up_to);
        }

        let events = self
            .store
            .load_events(tenant, execution.execution_id, range)
            .await?;
        let start = snapshot.map(ReplayedState::from);
        debug!(
            execution_id = %execution.execution_id,
            from_snapshot = ?start.as_ref().map(|s| s.sequence),
            events = events.len(),
            "replaying"
        );
        Ok(fold(logic, start, &events)?)
    }

    /// Run `work` holding the execution's lock, then drop the lock entry
    /// once no other caller holds it
    async fn with_execution_lock<T>(&self, execution_id: Uuid, work: impl Future<Output = T>) -> T {
        let lock = self.lock_for(execution_id);
        let guard = lock.lock().await;
        let result = work.await;
        drop(guard);
        drop(lock);
        self.execution_locks
            .remove_if(&execution_id, |_, l| Arc::strong_count(l) == 1);
        result
    }

    /// Record one event under the caller's lock
    ///
    /// `admit_terminal` lets an engine-raised `action_failed` reach an
    /// execution that the triggering transition just made terminal.
    async fn record(
        &self,
        tenant: &str,
        event: &DeliverEvent,
        policy: Unhandled,
        admit_terminal: bool,
    ) -> Result<Recorded, ExecutorError> {
        let execution = self.require_execution(tenant, event.execution_id).await?;
        let logic = self.logic_for(tenant, execution.workflow_version_id).await?;

        if let Some(event_id) = event.event_id {
            if let Some(recorded) = self
                .store
                .find_event(tenant, event.execution_id, event_id)
                .await?
            {
                return self
                    .redelivery(tenant, &execution, logic.as_ref(), event, recorded)
                    .await;
            }
        }

        if execution.status.is_terminal() && !admit_terminal {
            return Err(ExecutorError::ExecutionTerminal(
                execution.execution_id,
                execution.status,
            ));
        }
        let count = execution.sequence as usize;
        if count >= self.config.max_events_per_execution {
            return Err(ExecutorError::TooManyEvents(
                execution.execution_id,
                count,
                self.config.max_events_per_execution,
            ));
        }

        let current = self
            .replay_with(tenant, &execution, logic.as_ref(), None)
            .await?;
        if current.sequence + 1 != execution.sequence || current.state != execution.current_state {
            error!(
                execution_id = %execution.execution_id,
                replayed = %current.state,
                stored = %execution.current_state,
                "replayed state does not match execution record"
            );
            return Err(ReplayError::Diverged {
                sequence: current.sequence,
                event_name: "replay".into(),
                recorded: execution.current_state.clone(),
                recomputed: current.state,
            }
            .into());
        }

        let inbound = InboundEvent {
            event_id: event.event_id.unwrap_or_else(Uuid::now_v7),
            name: event.event_name.clone(),
            event_type: event.event_type,
            payload: event.payload.clone(),
            user_id: event.user_id.clone(),
        };

        let (transition, failure) = match logic.on_event(&current.view(), &inbound) {
            Ok(Some(transition)) => (Some(transition), None),
            Ok(None) => match policy {
                Unhandled::Reject => {
                    return Err(ExecutorError::UnhandledEvent {
                        event_name: event.event_name.clone(),
                        state: current.state,
                    });
                }
                Unhandled::Record => (None, None),
                Unhandled::Fail => (
                    None,
                    Some(WorkflowError::new(format!(
                        "{} not handled in state {}",
                        event.event_name, current.state
                    ))
                    .with_code("unhandled")),
                ),
            },
            Err(err) => (None, Some(err)),
        };

        if let Some(err) = failure {
            let outcome = self
                .append_failure(tenant, &execution, &current, &inbound, &err)
                .await?;
            return Ok(Recorded {
                outcome,
                trigger_event_id: inbound.event_id,
                user_id: inbound.user_id,
                actions: vec![],
            });
        }

        let sequence = execution.sequence;
        let next = match &transition {
            Some(t) => current.apply(t, sequence),
            None => ReplayedState {
                sequence,
                ..current.clone()
            },
        };

        let recorded_event = WorkflowEvent {
            event_id: inbound.event_id,
            execution_id: execution.execution_id,
            tenant: tenant.to_string(),
            sequence,
            event_name: inbound.name.clone(),
            event_type: inbound.event_type,
            from_state: Some(current.state.clone()),
            to_state: next.state.clone(),
            user_id: inbound.user_id.clone(),
            payload: inbound.payload.clone(),
            created_at: Utc::now(),
        };
        let update = ExecutionUpdate {
            current_state: next.state.clone(),
            status: next.status,
            context_data: next.context.clone(),
        };
        self.store.append_event(&recorded_event, &update).await?;
        self.maybe_snapshot(tenant, execution.execution_id, &next).await;

        info!(
            execution_id = %execution.execution_id,
            event = %recorded_event.event_name,
            from = %current.state,
            to = %next.state,
            status = %next.status,
            "event recorded"
        );

        Ok(Recorded {
            outcome: DeliveryOutcome {
                execution_id: execution.execution_id,
                event_id: recorded_event.event_id,
                sequence,
                from_state: current.state,
                new_state: next.state.clone(),
                current_state: next.state,
                status: next.status,
                duplicate: false,
                actions: vec![],
                failure: None,
            },
            trigger_event_id: inbound.event_id,
            user_id: inbound.user_id,
            actions: transition.map(|t| t.actions).unwrap_or_default(),
        })
    }

    async fn redelivery(
        &self,
        tenant: &str,
        execution: &WorkflowExecution,
        logic: &dyn AnyWorkflow,
        event: &DeliverEvent,
        recorded: WorkflowEvent,
    ) -> Result<Recorded, ExecutorError> {
        if recorded.event_name != event.event_name {
            return Err(ExecutorError::EventIdConflict {
                event_id: recorded.event_id,
                recorded: recorded.event_name,
                delivered: event.event_name.clone(),
            });
        }

        let actions = if recorded.event_type == EventType::Lifecycle {
            vec![]
        } else {
            let before = self
                .replay_with(tenant, execution, logic, Some(recorded.sequence - 1))
                .await?;
            match logic.on_event(&before.view(), &InboundEvent::from(&recorded)) {
                Ok(Some(transition)) => transition.actions,
                Ok(None) => vec![],
                Err(error) => {
                    return Err(ReplayError::Logic {
                        sequence: recorded.sequence,
                        error,
                    }
                    .into())
                }
            }
        };

        debug!(
            execution_id = %execution.execution_id,
            event_id = %recorded.event_id,
            actions = actions.len(),
            "duplicate delivery"
        );

        Ok(Recorded {
            outcome: DeliveryOutcome {
                execution_id: execution.execution_id,
                event_id: recorded.event_id,
                sequence: recorded.sequence,
                from_state: recorded.from_state.clone().unwrap_or_default(),
                new_state: recorded.to_state.clone(),
                current_state: execution.current_state.clone(),
                status: execution.status,
                duplicate: true,
                actions: vec![],
                failure: None,
            },
            trigger_event_id: recorded.event_id,
            user_id: recorded.user_id,
            actions,
        })
    }

    async fn append_failure(
        &self,
        tenant: &str,
        execution: &WorkflowExecution,
        current: &ReplayedState,
        trigger: &InboundEvent,
        err: &WorkflowError,
    ) -> Result<DeliveryOutcome, ExecutorError> {
        let failed = WorkflowEvent {
            event_id: Uuid::now_v7(),
            execution_id: execution.execution_id,
            tenant: tenant.to_string(),
            sequence: execution.sequence,
            event_name: names::WORKFLOW_FAILED.to_string(),
            event_type: EventType::Lifecycle,
            from_state: Some(current.state.clone()),
            to_state: current.state.clone(),
            user_id: trigger.user_id.clone(),
            payload: json!({
                "error": err,
                "event_id": trigger.event_id,
                "event_name": trigger.name,
                "event_type": trigger.event_type,
                "payload": trigger.payload,
            }),
            created_at: Utc::now(),
        };
        let update = ExecutionUpdate {
            current_state: current.state.clone(),
            status: ExecutionStatus::Failed,
            context_data: current.context.clone(),
        };
        self.store.append_event(&failed, &update).await?;

        let next = ReplayedState {
            status: ExecutionStatus::Failed,
            sequence: failed.sequence,
            ..current.clone()
        };
        self.maybe_snapshot(tenant, execution.execution_id, &next).await;

        warn!(
            execution_id = %execution.execution_id,
            event = %trigger.name,
            error = %err,
            "workflow failed"
        );

        Ok(DeliveryOutcome {
            execution_id: execution.execution_id,
            event_id: failed.event_id,
            sequence: failed.sequence,
            from_state: current.state.clone(),
            new_state: current.state.clone(),
            current_state: current.state.clone(),
            status: ExecutionStatus::Failed,
            duplicate: false,
            actions: vec![],
            failure: Some(err.to_string()),
        })
    }

    async fn maybe_snapshot(&self, tenant: &str, execution_id: Uuid, state: &ReplayedState) {
        let interval = self.config.snapshot_interval as i64;
        if interval == 0 || state.sequence == 0 || state.sequence % interval != 0 {
            return;
        }
        match self
            .store
            .save_snapshot(&state.to_snapshot(tenant, execution_id))
            .await
        {
            Ok(()) => debug!(%execution_id, sequence = state.sequence, "snapshot saved"),
            Err(e) => warn!(%execution_id, error = %e, "failed to save snapshot"),
        }
    }

    /// Run requested actions, feeding failures back through the logic
    async fn dispatch(&self, tenant: &str, first: Recorded) -> DeliveryOutcome {
        let execution_id = first.outcome.execution_id;
        let mut outcome = first.outcome;
        let mut queue = VecDeque::from([(first.trigger_event_id, first.user_id, first.actions)]);
        let mut dispatched_any = false;

        while let Some((trigger_event_id, user_id, requests)) = queue.pop_front() {
            let mut requests = requests.into_iter();
            while let Some(request) = requests.next() {
                dispatched_any = true;
                let ctx = ActionContext::for_event(
                    tenant,
                    execution_id,
                    &request.action,
                    trigger_event_id,
                    request.step.as_deref(),
                )
                .with_user(user_id.clone());

                match self
                    .actions
                    .execute(&request.action, request.params.clone(), &ctx)
                    .await
                {
                    Ok(result) => outcome.actions.push(DispatchedAction {
                        action: request.action,
                        idempotency_key: ctx.idempotency_key,
                        result: Some(result),
                        error: None,
                        skipped: false,
                    }),
                    Err(ActionError::InFlight { .. }) => {
                        debug!(action = %request.action, "action in flight elsewhere");
                        outcome.actions.push(DispatchedAction {
                            action: request.action,
                            idempotency_key: ctx.idempotency_key,
                            result: None,
                            error: None,
                            skipped: true,
                        });
                    }
                    Err(err) => {
                        outcome.actions.push(DispatchedAction {
                            action: request.action.clone(),
                            idempotency_key: ctx.idempotency_key.clone(),
                            result: None,
                            error: Some(err.to_string()),
                            skipped: false,
                        });
                        for skipped in requests.by_ref() {
                            let key = ActionContext::for_event(
                                tenant,
                                execution_id,
                                &skipped.action,
                                trigger_event_id,
                                skipped.step.as_deref(),
                            )
                            .idempotency_key;
                            outcome.actions.push(DispatchedAction {
                                action: skipped.action,
                                idempotency_key: key,
                                result: None,
                                error: None,
                                skipped: true,
                            });
                        }

                        let failure = DeliverEvent {
                            execution_id,
                            event_name: names::ACTION_FAILED.to_string(),
                            payload: json!({
                                "action": request.action,
                                "step": request.step,
                                "idempotency_key": ctx.idempotency_key,
                                "trigger_event_id": trigger_event_id,
                                "error": err.to_string(),
                                "error_kind": err.kind(),
                            }),
                            user_id: user_id.clone(),
                            event_id: None,
                            event_type: EventType::Action,
                        };
                        outcome.failure = Some(err.to_string());

                        let recorded = self
                            .with_execution_lock(
                                execution_id,
                                self.record(tenant, &failure, Unhandled::Fail, true),
                            )
                            .await;
                        match recorded {
                            Ok(recorded) => {
                                if let Some(message) = recorded.outcome.failure {
                                    outcome.failure = Some(message);
                                }
                                queue.push_back((
                                    recorded.trigger_event_id,
                                    recorded.user_id,
                                    recorded.actions,
                                ));
                            }
                            Err(e) => {
                                error!(%execution_id, error = %e, "failed to record action failure");
                            }
                        }
                    }
                }
            }
        }

        // The event is already committed; a failed re-read only leaves the
        // outcome at the post-transition view
        if dispatched_any {
            match self.store.get_execution(tenant, execution_id).await {
                Ok(Some(execution)) => {
                    outcome.current_state = execution.current_state;
                    outcome.status = execution.status;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(%execution_id, error = %e, "failed to reload execution after actions")
                }
            }
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{handler_fn, HandlerError};
    use crate::engine::NewRegistration;
    use crate::persistence::InMemoryWorkflowStore;
    use crate::workflow::WorkflowDefinition;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TENANT: &str = "acme";

    struct Harness {
        store: Arc<InMemoryWorkflowStore>,
        engine: ExecutionEngine<InMemoryWorkflowStore>,
        calls: Arc<AtomicUsize>,
    }

    async fn harness(config: EngineConfig, definition: Value) -> Harness {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let registry = Arc::new(WorkflowRegistry::new(Arc::clone(&store)));
        let actions = Arc::new(ActionRegistry::new(Arc::clone(&store)));

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        actions.register_simple_action(
            "notify",
            "Record a notification",
            vec![],
            handler_fn(move |_ctx, params| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({ "sent": params }))
                }
            }),
        );
        actions.register_simple_action(
            "explode",
            "Always fails",
            vec![],
            handler_fn(|_ctx, _params| async { Err(HandlerError::new("gateway down")) }),
        );

        registry
            .register(
                TENANT,
                NewRegistration::new(
                    "invoice",
                    "1.0.0",
                    WorkflowDefinition::new("state_machine", definition),
                )
                .with_parameters(json!({ "currency": "EUR" })),
            )
            .await
            .expect("register");

        Harness {
            engine: ExecutionEngine::new(Arc::clone(&store), registry, actions, config),
            store,
            calls,
        }
    }

    fn invoice() -> Value {
        json!({
            "initial_state": "draft",
            "states": {
                "draft": { "on": {
                    "submit": { "target": "review", "actions": [
                        { "action": "notify", "params": { "amount": "$context.amount" } }
                    ] },
                    "pay": { "target": "paying", "actions": [
                        { "action": "explode" },
                        { "action": "notify" }
                    ] }
                } },
                "review": { "on": {
                    "approve": { "target": "approved" },
                    "reject": { "target": "rejected" }
                } },
                "paying": {},
                "approved": { "status": "completed" },
                "rejected": { "status": "rejected" }
            }
        })
    }

    async fn start(h: &Harness) -> Uuid {
        h.engine
            .create_execution(TENANT, CreateExecution::new("invoice", json!({ "amount": 120 })))
            .await
            .expect("create")
    }

    #[tokio::test]
    async fn test_create_writes_started_event() {
        let h = harness(EngineConfig::default(), invoice()).await;
        let id = start(&h).await;

        let execution = h.engine.require_execution(TENANT, id).await.expect("exists");
        assert_eq!(execution.current_state, "draft");
        assert_eq!(execution.sequence, 1);
        assert_eq!(
            execution.context_data,
            json!({ "currency": "EUR", "amount": 120 })
        );

        let events = h.engine.events(TENANT, id, EventRange::all()).await.expect("events");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_name, names::WORKFLOW_STARTED);
        assert_eq!(events[0].payload, execution.context_data);
    }

    #[tokio::test]
    async fn test_deliver_moves_state_and_dispatches() {
        let h = harness(EngineConfig::default(), invoice()).await;
        let id = start(&h).await;

        let outcome = h
            .engine
            .deliver_event(TENANT, DeliverEvent::external(id, "submit", json!({})))
            .await
            .expect("deliver");

        assert_eq!(outcome.sequence, 1);
        assert_eq!(outcome.from_state, "draft");
        assert_eq!(outcome.new_state, "review");
        assert_eq!(outcome.actions.len(), 1);
        assert_eq!(outcome.actions[0].result, Some(json!({ "sent": { "amount": 120 } })));
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);

        let outcome = h
            .engine
            .deliver_event(TENANT, DeliverEvent::external(id, "approve", json!({})))
            .await
            .expect("deliver");
        assert_eq!(outcome.status, ExecutionStatus::Completed);

        let err = h
            .engine
            .deliver_event(TENANT, DeliverEvent::external(id, "reject", json!({})))
            .await
            .expect_err("terminal");
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_unhandled_external_event_appends_nothing() {
        let h = harness(EngineConfig::default(), invoice()).await;
        let id = start(&h).await;

        let err = h
            .engine
            .deliver_event(TENANT, DeliverEvent::external(id, "approve", json!({})))
            .await
            .expect_err("unhandled");
        assert!(matches!(err, ExecutorError::UnhandledEvent { .. }));
        assert_eq!(err.kind(), ErrorKind::Validation);

        let execution = h.engine.require_execution(TENANT, id).await.expect("exists");
        assert_eq!(execution.sequence, 1);
    }

    #[tokio::test]
    async fn test_unhandled_task_event_recorded_as_self_transition() {
        let h = harness(EngineConfig::default(), invoice()).await;
        let id = start(&h).await;

        let outcome = h
            .engine
            .deliver_event(TENANT, DeliverEvent::task(id, names::TASK_CLAIMED, json!({})))
            .await
            .expect("recorded");
        assert_eq!(outcome.new_state, "draft");
        assert_eq!(outcome.sequence, 1);

        let replayed = h.engine.replay(TENANT, id, None).await.expect("replay");
        assert_eq!(replayed.state, "draft");
        assert_eq!(replayed.sequence, 1);
    }

    #[tokio::test]
    async fn test_redelivery_is_idempotent() {
        let h = harness(EngineConfig::default(), invoice()).await;
        let id = start(&h).await;
        let event_id = Uuid::now_v7();
        let event = DeliverEvent::external(id, "submit", json!({})).with_event_id(event_id);

        let first = h.engine.deliver_event(TENANT, event.clone()).await.expect("first");
        let second = h.engine.deliver_event(TENANT, event).await.expect("second");

        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(second.sequence, first.sequence);
        assert_eq!(second.actions[0].idempotency_key, first.actions[0].idempotency_key);
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.store.action_result_count(), 1);

        let err = h
            .engine
            .deliver_event(
                TENANT,
                DeliverEvent::external(id, "approve", json!({})).with_event_id(event_id),
            )
            .await
            .expect_err("renamed redelivery");
        assert!(matches!(err, ExecutorError::EventIdConflict { .. }));
    }

    #[tokio::test]
    async fn test_action_failure_fails_execution() {
        let h = harness(EngineConfig::default(), invoice()).await;
        let id = start(&h).await;

        let outcome = h
            .engine
            .deliver_event(TENANT, DeliverEvent::external(id, "pay", json!({})))
            .await
            .expect("delivered");

        assert_eq!(outcome.new_state, "paying");
        assert_eq!(outcome.status, ExecutionStatus::Failed);
        assert!(outcome.failure.is_some());
        assert!(outcome.actions[0].error.is_some());
        assert!(outcome.actions[1].skipped);
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);

        let events = h.engine.events(TENANT, id, EventRange::all()).await.expect("events");
        let last = events.last().expect("last");
        assert_eq!(last.event_name, names::WORKFLOW_FAILED);
        assert_eq!(last.event_type, EventType::Lifecycle);
        assert_eq!(last.payload["event_name"], names::ACTION_FAILED);
    }

    #[tokio::test]
    async fn test_handled_action_failure_transitions() {
        let mut definition = invoice();
        definition["states"]["paying"] = json!({ "on": {
            "action_failed": { "target": "manual_payment", "merge_payload": false }
        } });
        definition["states"]["manual_payment"] = json!({});
        let h = harness(EngineConfig::default(), definition).await;
        let id = start(&h).await;

        let outcome = h
            .engine
            .deliver_event(TENANT, DeliverEvent::external(id, "pay", json!({})))
            .await
            .expect("delivered");

        assert_eq!(outcome.new_state, "paying");
        assert_eq!(outcome.current_state, "manual_payment");
        assert_eq!(outcome.status, ExecutionStatus::Active);

        let events = h.engine.events(TENANT, id, EventRange::all().after(1)).await.expect("events");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_name, names::ACTION_FAILED);
        assert_eq!(events[0].event_type, EventType::Action);
    }

    #[tokio::test]
    async fn test_snapshot_replay_matches_full_replay() {
        let config = EngineConfig {
            snapshot_interval: 2,
            ..EngineConfig::default()
        };
        let h = harness(config, invoice()).await;
        let id = start(&h).await;

        for _ in 0..4 {
            h.engine
                .deliver_event(TENANT, DeliverEvent::task(id, names::TASK_CLAIMED, json!({})))
                .await
                .expect("deliver");
        }
        h.engine
            .deliver_event(TENANT, DeliverEvent::external(id, "submit", json!({ "po": "A-1" })))
            .await
            .expect("deliver");

        let replayed = h.engine.replay(TENANT, id, None).await.expect("replay");
        let execution = h.engine.require_execution(TENANT, id).await.expect("exists");
        assert_eq!(replayed.state, execution.current_state);
        assert_eq!(replayed.context, execution.context_data);
        assert_eq!(replayed.sequence, 5);

        let midway = h.engine.replay(TENANT, id, Some(2)).await.expect("replay");
        assert_eq!(midway.state, "draft");
        assert_eq!(midway.sequence, 2);
    }

    #[tokio::test]
    async fn test_event_limit() {
        let config = EngineConfig {
            max_events_per_execution: 2,
            ..EngineConfig::default()
        };
        let h = harness(config, invoice()).await;
        let id = start(&h).await;

        h.engine
            .deliver_event(TENANT, DeliverEvent::task(id, names::TASK_CLAIMED, json!({})))
            .await
            .expect("second event fits");
        let err = h
            .engine
            .deliver_event(TENANT, DeliverEvent::task(id, names::TASK_CLAIMED, json!({})))
            .await
            .expect_err("limit");
        assert!(matches!(err, ExecutorError::TooManyEvents(..)));
    }

    #[tokio::test]
    async fn test_cancel_execution() {
        let h = harness(EngineConfig::default(), invoice()).await;
        let id = start(&h).await;

        let outcome = h
            .engine
            .cancel_execution(TENANT, id, "duplicate invoice", Some("ops".into()))
            .await
            .expect("cancel");
        assert_eq!(outcome.status, ExecutionStatus::Rejected);

        let replayed = h.engine.replay(TENANT, id, None).await.expect("replay");
        assert_eq!(replayed.status, ExecutionStatus::Rejected);

        let err = h
            .engine
            .cancel_execution(TENANT, id, "again", None)
            .await
            .expect_err("terminal");
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(h.engine.execution_locks.is_empty());
    }

    #[tokio::test]
    async fn test_action_failure_on_terminal_edge_fails_execution() {
        let mut definition = invoice();
        definition["states"]["review"]["on"]["settle"] = json!({
            "target": "approved",
            "actions": [{ "action": "explode" }]
        });
        let h = harness(EngineConfig::default(), definition).await;
        let id = start(&h).await;
        h.engine
            .deliver_event(TENANT, DeliverEvent::external(id, "submit", json!({})))
            .await
            .expect("submit");

        let outcome = h
            .engine
            .deliver_event(TENANT, DeliverEvent::external(id, "settle", json!({})))
            .await
            .expect("delivered");
        assert_eq!(outcome.new_state, "approved");
        assert_eq!(outcome.status, ExecutionStatus::Failed);
        assert!(outcome.failure.is_some());

        let stored = h.engine.require_execution(TENANT, id).await.expect("exists");
        assert_eq!(stored.status, ExecutionStatus::Failed);
        assert_eq!(stored.current_state, "approved");

        let events = h.engine.events(TENANT, id, EventRange::all()).await.expect("events");
        let last = events.last().expect("last");
        assert_eq!(last.event_name, names::WORKFLOW_FAILED);
        assert_eq!(last.payload["event_name"], names::ACTION_FAILED);

        let replayed = h.engine.replay(TENANT, id, None).await.expect("replay");
        assert_eq!(replayed.status, ExecutionStatus::Failed);
        assert!(h.engine.execution_locks.is_empty());
    }

    #[tokio::test]
    async fn test_external_events_still_refused_after_completion() {
        let h = harness(EngineConfig::default(), invoice()).await;
        let id = start(&h).await;
        for name in ["submit", "approve"] {
            h.engine
                .deliver_event(TENANT, DeliverEvent::external(id, name, json!({})))
                .await
                .expect("deliver");
        }

        let failure = DeliverEvent {
            event_type: EventType::Action,
            ..DeliverEvent::external(id, names::ACTION_FAILED, json!({}))
        };
        let err = h.engine.deliver_event(TENANT, failure).await.expect_err("terminal");
        assert!(matches!(err, ExecutorError::ExecutionTerminal(_, ExecutionStatus::Completed)));
    }

    #[tokio::test]
    async fn test_unknown_workflow() {
        let h = harness(EngineConfig::default(), invoice()).await;
        let err = h
            .engine
            .create_execution(TENANT, CreateExecution::new("missing", json!({})))
            .await
            .expect_err("missing");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
