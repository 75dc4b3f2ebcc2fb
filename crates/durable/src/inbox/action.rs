//! `create_human_task` action

use std::sync::Weak;

use serde_json::json;

use super::service::TaskInboxService;
use super::types::CreateTaskRequest;
use crate::action::{handler_fn, ActionRegistry, HandlerError, ParamSpec, ParamType};
use crate::persistence::WorkflowStore;

pub const CREATE_HUMAN_TASK: &str = "create_human_task";

/// Register the inbox's actions
///
/// The handler holds a weak reference: the inbox owns the engine, which
/// owns the action registry.
pub fn register_inbox_actions<S: WorkflowStore>(
    actions: &ActionRegistry<S>,
    inbox: Weak<TaskInboxService<S>>,
) {
    actions.register_simple_action(
        CREATE_HUMAN_TASK,
        "Create a human task in the inbox and link it to the execution",
        vec![
            ParamSpec::required("taskType", ParamType::String),
            ParamSpec::required("title", ParamType::String),
            ParamSpec::optional("description", ParamType::String),
            ParamSpec::optional("priority", ParamType::String),
            ParamSpec::optional("dueDate", ParamType::String),
            // Normalized by the inbox; malformed assignment never fails creation
            ParamSpec::optional("assignTo", ParamType::Any),
            ParamSpec::optional("contextData", ParamType::Any),
            ParamSpec::optional("formId", ParamType::String),
        ],
        handler_fn(move |ctx, params| {
            let inbox = inbox.clone();
            async move {
                let inbox = inbox
                    .upgrade()
                    .ok_or_else(|| HandlerError::new("task inbox is shut down"))?;
                let request: CreateTaskRequest = serde_json::from_value(params).map_err(|e| {
                    HandlerError::new(format!("invalid task request: {e}"))
                        .with_type("validation")
                })?;

                let task_id = inbox
                    .create_task(&ctx.tenant, ctx.execution_id, request, ctx.user_id.clone())
                    .await
                    .map_err(|e| HandlerError::new(e.to_string()).with_type(e.kind().to_string()))?;

                Ok(json!({ "success": true, "taskId": task_id }))
            }
        }),
    );
}
