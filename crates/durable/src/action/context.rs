//! Action execution context

use uuid::Uuid;

/// Build the idempotency key for an action dispatched by an event
///
/// `"{execution_id}:{action}:{event_id}"`, with `":{step}"` appended when the
/// transition names a step.
pub fn idempotency_key(
    execution_id: Uuid,
    action: &str,
    event_id: Uuid,
    step: Option<&str>,
) -> String {
    match step {
        Some(step) => format!("{execution_id}:{action}:{event_id}:{step}"),
        None => format!("{execution_id}:{action}:{event_id}"),
    }
}

/// Context provided to action handlers
///
/// Handlers that call external systems should forward `idempotency_key`
/// so those systems can deduplicate as well.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionContext {
    /// Tenant the execution belongs to
    pub tenant: String,

    /// Execution that requested the action
    pub execution_id: Uuid,

    /// User who delivered the triggering event
    pub user_id: Option<String>,

    /// Key under which the attempt is recorded
    pub idempotency_key: String,

    /// Event that triggered the action
    pub event_id: Option<Uuid>,
}

impl ActionContext {
    /// Context for an action triggered by a recorded event
    pub fn for_event(
        tenant: impl Into<String>,
        execution_id: Uuid,
        action: &str,
        event_id: Uuid,
        step: Option<&str>,
    ) -> Self {
        Self {
            tenant: tenant.into(),
            execution_id,
            user_id: None,
            idempotency_key: idempotency_key(execution_id, action, event_id, step),
            event_id: Some(event_id),
        }
    }

    /// Context with a caller-chosen key
    pub fn new(
        tenant: impl Into<String>,
        execution_id: Uuid,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            tenant: tenant.into(),
            execution_id,
            user_id: None,
            idempotency_key: idempotency_key.into(),
            event_id: None,
        }
    }

    pub fn with_user(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_format() {
        let exec = Uuid::now_v7();
        let event = Uuid::now_v7();

        assert_eq!(
            idempotency_key(exec, "send_notification", event, None),
            format!("{exec}:send_notification:{event}")
        );
        assert_eq!(
            idempotency_key(exec, "send_notification", event, Some("cfo")),
            format!("{exec}:send_notification:{event}:cfo")
        );
    }

    #[test]
    fn test_for_event() {
        let exec = Uuid::now_v7();
        let event = Uuid::now_v7();
        let ctx = ActionContext::for_event("acme", exec, "notify", event, None)
            .with_user(Some("u1".into()));

        assert_eq!(ctx.event_id, Some(event));
        assert_eq!(ctx.user_id.as_deref(), Some("u1"));
        assert!(ctx.idempotency_key.ends_with(&event.to_string()));
    }
}
