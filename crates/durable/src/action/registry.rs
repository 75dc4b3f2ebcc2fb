//! Action registry with an idempotency-keyed result log

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{ActionContext, ActionDescriptor, ActionHandler, HandlerError, ParamSpec};
use crate::error::ErrorKind;
use crate::persistence::{
    ActionClaim, ActionOutcome, ActionResult, NewActionClaim, StoreError, WorkflowStore,
};

/// Errors from action execution
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// No handler registered under this name
    #[error("unknown action: {0}")]
    UnknownAction(String),

    /// Parameters do not satisfy the declared specs
    #[error("invalid parameters for {action}: {message}")]
    InvalidParams { action: String, message: String },

    /// Another writer is running the same key right now
    #[error("action {action} already in flight for key {key}")]
    InFlight { action: String, key: String },

    /// The handler returned an error
    #[error("action {action} failed: {error}")]
    Failed { action: String, error: HandlerError },
}

impl ActionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Store(e) => e.kind(),
            Self::UnknownAction(_) => ErrorKind::NotFound,
            Self::InvalidParams { .. } => ErrorKind::Validation,
            Self::InFlight { .. } => ErrorKind::Conflict,
            Self::Failed { .. } => ErrorKind::ExecutionFailure,
        }
    }
}

struct RegisteredAction {
    descriptor: ActionDescriptor,
    handler: Arc<dyn ActionHandler>,
}

/// Catalog of named actions
///
/// Executions are keyed by [`ActionContext::idempotency_key`]: once a key has
/// a successful result, later calls return that result without invoking the
/// handler. Calls with the same key inside one process run one at a time;
/// across processes the store's unique key decides the winner.
pub struct ActionRegistry<S: WorkflowStore> {
    store: Arc<S>,
    actions: RwLock<HashMap<String, RegisteredAction>>,
    key_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    stale_after: chrono::Duration,
}

impl<S: WorkflowStore> ActionRegistry<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self::with_stale_after(store, Duration::from_secs(300))
    }

    /// In-flight claims older than `stale_after` may be taken over
    pub fn with_stale_after(store: Arc<S>, stale_after: Duration) -> Self {
        Self {
            store,
            actions: RwLock::new(HashMap::new()),
            key_locks: DashMap::new(),
            stale_after: chrono::Duration::from_std(stale_after)
                .unwrap_or_else(|_| chrono::Duration::minutes(5)),
        }
    }

    /// Register a handler under a name, replacing any previous one
    pub fn register_simple_action(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        params: Vec<ParamSpec>,
        handler: impl ActionHandler,
    ) {
        let name = name.into();
        let registered = RegisteredAction {
            descriptor: ActionDescriptor {
                name: name.clone(),
                description: description.into(),
                params,
            },
            handler: Arc::new(handler),
        };

        if self
            .actions
            .write()
            .insert(name.clone(), registered)
            .is_some()
        {
            warn!(action = %name, "replaced existing action handler");
        } else {
            debug!(action = %name, "registered action");
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.read().contains_key(name)
    }

    pub fn get_action(&self, name: &str) -> Option<ActionDescriptor> {
        self.actions.read().get(name).map(|a| a.descriptor.clone())
    }

    /// Registered actions sorted by name
    pub fn list_actions(&self) -> Vec<ActionDescriptor> {
        let mut actions: Vec<_> = self
            .actions
            .read()
            .values()
            .map(|a| a.descriptor.clone())
            .collect();
        actions.sort_by(|a, b| a.name.cmp(&b.name));
        actions
    }

    /// Run an action at most once per idempotency key
    ///
    /// Unknown actions and invalid parameters fail before anything is
    /// recorded. A previously failed attempt under the same key is retried.
    #[instrument(skip(self, params, ctx), fields(execution_id = %ctx.execution_id, key = %ctx.idempotency_key))]
    pub async fn execute(
        &self,
        action_name: &str,
        params: Value,
        ctx: &ActionContext,
    ) -> Result<Value, ActionError> {
        let (descriptor, handler) = {
            let actions = self.actions.read();
            let action = actions
                .get(action_name)
                .ok_or_else(|| ActionError::UnknownAction(action_name.to_string()))?;
            (action.descriptor.clone(), Arc::clone(&action.handler))
        };

        descriptor
            .validate_params(&params)
            .map_err(|message| ActionError::InvalidParams {
                action: action_name.to_string(),
                message,
            })?;

        let lock = self
            .key_locks
            .entry(ctx.idempotency_key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let guard = lock.lock().await;

        let result = self.run_claimed(action_name, params, ctx, handler).await;

        drop(guard);
        drop(lock);
        self.key_locks
            .remove_if(&ctx.idempotency_key, |_, l| Arc::strong_count(l) == 1);

        result
    }

    async fn run_claimed(
        &self,
        action_name: &str,
        params: Value,
        ctx: &ActionContext,
        handler: Arc<dyn ActionHandler>,
    ) -> Result<Value, ActionError> {
        let claim = NewActionClaim {
            tenant: ctx.tenant.clone(),
            execution_id: ctx.execution_id,
            action_name: action_name.to_string(),
            event_id: ctx.event_id,
            idempotency_key: ctx.idempotency_key.clone(),
            parameters: params.clone(),
        };

        let record = match self.store.claim_action(&claim, self.stale_after).await? {
            ActionClaim::AlreadyCompleted(record) => {
                info!(action = %action_name, "returning recorded result");
                return Ok(record.result.unwrap_or(Value::Null));
            }
            ActionClaim::InFlight(_) => {
                return Err(ActionError::InFlight {
                    action: action_name.to_string(),
                    key: ctx.idempotency_key.clone(),
                });
            }
            ActionClaim::Acquired(record) => record,
        };

        if record.attempt > 1 {
            warn!(
                action = %action_name,
                attempt = record.attempt,
                previous_error = record.error_message.as_deref().unwrap_or("none recorded"),
                "retrying action"
            );
        }

        debug!(action = %action_name, attempt = record.attempt, "running action");

        match handler.execute(ctx, params).await {
            Ok(value) => {
                self.store
                    .complete_action(record.result_id, ActionOutcome::Succeeded(value.clone()))
                    .await?;
                info!(action = %action_name, attempt = record.attempt, "action succeeded");
                Ok(value)
            }
            Err(error) => {
                self.store
                    .complete_action(record.result_id, ActionOutcome::Failed(error.message.clone()))
                    .await?;
                warn!(action = %action_name, attempt = record.attempt, error = %error, "action failed");
                Err(ActionError::Failed {
                    action: action_name.to_string(),
                    error,
                })
            }
        }
    }

    /// Recorded attempts for an execution
    pub async fn results_for_execution(
        &self,
        tenant: &str,
        execution_id: Uuid,
    ) -> Result<Vec<ActionResult>, ActionError> {
        Ok(self.store.list_action_results(tenant, execution_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{handler_fn, ParamType};
    use crate::persistence::InMemoryWorkflowStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_registry() -> (ActionRegistry<InMemoryWorkflowStore>, Arc<AtomicUsize>) {
        let registry = ActionRegistry::new(Arc::new(InMemoryWorkflowStore::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        registry.register_simple_action(
            "send_notification",
            "Send a notification",
            vec![ParamSpec::required("recipient", ParamType::String)],
            handler_fn(move |_ctx, params| {
                let counter = Arc::clone(&counter);
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    Ok(json!({"sent_to": params["recipient"], "n": n}))
                }
            }),
        );
        (registry, calls)
    }

    #[tokio::test]
    async fn test_executes_once_per_key() {
        let (registry, calls) = counting_registry();
        let ctx = ActionContext::new("acme", Uuid::now_v7(), "k1");

        let first = registry
            .execute("send_notification", json!({"recipient": "cfo"}), &ctx)
            .await
            .expect("first");
        let second = registry
            .execute("send_notification", json!({"recipient": "cfo"}), &ctx)
            .await
            .expect("second");

        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_same_key() {
        let (registry, calls) = counting_registry();
        let registry = Arc::new(registry);
        let ctx = ActionContext::new("acme", Uuid::now_v7(), "k-concurrent");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            let ctx = ctx.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .execute("send_notification", json!({"recipient": "cfo"}), &ctx)
                    .await
            }));
        }
        for handle in handles {
            handle.await.expect("join").expect("execute");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalid_params_record_nothing() {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let registry = ActionRegistry::new(Arc::clone(&store));
        registry.register_simple_action(
            "send_notification",
            "Send a notification",
            vec![ParamSpec::required("recipient", ParamType::String)],
            handler_fn(|_ctx, _params| async move { Ok(Value::Null) }),
        );
        let ctx = ActionContext::new("acme", Uuid::now_v7(), "k1");

        let err = registry
            .execute("send_notification", json!({"recipient": 5}), &ctx)
            .await
            .expect_err("invalid");
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = registry
            .execute("nope", json!({}), &ctx)
            .await
            .expect_err("unknown");
        assert_eq!(err.kind(), ErrorKind::NotFound);

        assert_eq!(store.action_result_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_attempt_is_retried() {
        let registry = ActionRegistry::new(Arc::new(InMemoryWorkflowStore::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        registry.register_simple_action(
            "flaky",
            "Fails the first time",
            vec![],
            handler_fn(move |_ctx, _params| {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(HandlerError::new("smtp down"))
                    } else {
                        Ok(json!("sent"))
                    }
                }
            }),
        );
        let ctx = ActionContext::new("acme", Uuid::now_v7(), "k1");

        let err = registry
            .execute("flaky", json!({}), &ctx)
            .await
            .expect_err("first attempt fails");
        assert_eq!(err.kind(), ErrorKind::ExecutionFailure);

        let ok = registry
            .execute("flaky", json!({}), &ctx)
            .await
            .expect("second attempt");
        assert_eq!(ok, json!("sent"));

        let results = registry
            .results_for_execution("acme", ctx.execution_id)
            .await
            .expect("results");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].attempt, 2);
        assert!(results[0].success);
    }

    #[test]
    fn test_list_actions_sorted() {
        let (registry, _) = counting_registry();
        registry.register_simple_action(
            "archive",
            "Archive",
            vec![],
            handler_fn(|_ctx, _params| async move { Ok(Value::Null) }),
        );
        let names: Vec<_> = registry.list_actions().into_iter().map(|a| a.name).collect();
        assert_eq!(names, vec!["archive", "send_notification"]);
    }
}
