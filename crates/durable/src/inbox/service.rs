//! Human task inbox bound to workflow executions

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::types::{
    Assignment, CreateTaskRequest, TaskDefinition, TaskFilter, TaskHistoryEntry, TaskStatus,
    WorkflowTask,
};
use crate::config::EngineConfig;
use crate::engine::{DeliverEvent, ExecutionEngine, ExecutorError};
use crate::error::ErrorKind;
use crate::forms::{self, FormError, FormRegistry, ValidationReport};
use crate::persistence::{StoreError, WorkflowStore};
use crate::workflow::names;

/// Errors from inbox operations
#[derive(Debug, thiserror::Error)]
pub enum InboxError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Engine(#[from] ExecutorError),

    #[error(transparent)]
    Form(#[from] FormError),

    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    /// `formId` names no registered form
    #[error("form not found: {0}")]
    FormNotFound(String),

    #[error("invalid task request: {0}")]
    Invalid(String),

    /// The task's status does not allow the operation
    #[error("cannot {action} task {task_id} in status {status}")]
    IllegalTransition {
        task_id: Uuid,
        action: &'static str,
        status: TaskStatus,
    },

    #[error("task {task_id} is claimed by {claimed_by}")]
    ClaimedByOther { task_id: Uuid, claimed_by: String },

    /// Submitted data does not satisfy the task's form
    #[error("form data invalid: {}", .0.summary())]
    InvalidSubmission(ValidationReport),
}

impl InboxError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Store(e) => e.kind(),
            Self::Engine(e) => e.kind(),
            Self::Form(e) => e.kind(),
            Self::TaskNotFound(_) | Self::FormNotFound(_) => ErrorKind::NotFound,
            Self::Invalid(_) | Self::InvalidSubmission(_) => ErrorKind::Validation,
            Self::IllegalTransition { .. } | Self::ClaimedByOther { .. } => ErrorKind::Conflict,
        }
    }
}

/// Task inbox service
///
/// Every lifecycle change is written with an expected-status check and then
/// reported to the owning execution as a `task_*` event. A change whose
/// event is not recorded is undone: a new task is removed and a status
/// change is reverted with a `revert` history entry.
pub struct TaskInboxService<S: WorkflowStore> {
    store: Arc<S>,
    engine: Arc<ExecutionEngine<S>>,
    forms: Arc<FormRegistry<S>>,
    config: EngineConfig,
}

impl<S: WorkflowStore> TaskInboxService<S> {
    pub fn new(store: Arc<S>, engine: Arc<ExecutionEngine<S>>, forms: Arc<FormRegistry<S>>) -> Self {
        let config = engine.config().clone();
        Self {
            store,
            engine,
            forms,
            config,
        }
    }

    pub fn forms(&self) -> &Arc<FormRegistry<S>> {
        &self.forms
    }

    /// Create a task for an open execution
    ///
    /// The task type's definition is created on first use and requires a
    /// `form_id` naming a registered form.
    #[instrument(skip(self, request), fields(task_type = %request.task_type))]
    pub async fn create_task(
        &self,
        tenant: &str,
        execution_id: Uuid,
        request: CreateTaskRequest,
        user_id: Option<String>,
    ) -> Result<Uuid, InboxError> {
        if request.task_type.trim().is_empty() {
            return Err(InboxError::Invalid("taskType is empty".into()));
        }
        if request.title.trim().is_empty() {
            return Err(InboxError::Invalid("title is empty".into()));
        }
        self.engine
            .require_open_execution(tenant, execution_id)
            .await?;

        let requested_form = request
            .form_id
            .as_deref()
            .map(str::trim)
            .filter(|f| !f.is_empty());
        if let Some(form_id) = requested_form {
            if !self.forms.exists(tenant, form_id).await? {
                return Err(InboxError::FormNotFound(form_id.to_string()));
            }
        }

        let now = Utc::now();
        let definition = self
            .resolve_definition(tenant, &request, requested_form, now)
            .await?;

        let assignment = Assignment::from_value(request.assign_to.as_ref());
        let context = request.context_data.clone().unwrap_or_else(|| json!({}));
        let due_date = request
            .due_date
            .unwrap_or_else(|| now + Duration::days(i64::from(definition.default_sla_days)));

        let task = WorkflowTask {
            task_id: Uuid::now_v7(),
            tenant: tenant.to_string(),
            execution_id,
            task_definition_id: definition.task_definition_id,
            task_type: definition.task_type.clone(),
            form_id: requested_form
                .map(str::to_string)
                .unwrap_or_else(|| definition.form_id.clone()),
            title: request.title,
            description: request.description,
            status: TaskStatus::Pending,
            priority: request
                .priority
                .unwrap_or_else(|| definition.default_priority.clone()),
            due_date: Some(due_date),
            context_data: context,
            assigned_roles: assignment.roles.clone(),
            assigned_users: assignment.users.clone(),
            claimed_by: None,
            response_data: None,
            draft_data: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        let history = TaskHistoryEntry::record(&task, "create", None, user_id.as_deref(), None);
        self.store.insert_task(&task, &history).await?;

        info!(
            task_id = %task.task_id,
            %execution_id,
            form_id = %task.form_id,
            roles = ?task.assigned_roles,
            "task created"
        );

        let emitted = self
            .emit(
                &task,
                names::TASK_CREATED,
                json!({
                    "task_id": task.task_id,
                    "task_type": task.task_type,
                    "title": task.title,
                    "form_id": task.form_id,
                    "priority": task.priority,
                    "due_date": task.due_date,
                    "assignment": assignment,
                    "context": task.context_data,
                }),
                user_id,
            )
            .await;
        if let Err(e) = emitted {
            self.withdraw(&task, &e).await;
            return Err(e);
        }

        Ok(task.task_id)
    }

    /// PENDING → CLAIMED
    ///
    /// Claiming a task the same user already holds is a no-op.
    #[instrument(skip(self))]
    pub async fn claim_task(
        &self,
        tenant: &str,
        task_id: Uuid,
        user_id: &str,
    ) -> Result<WorkflowTask, InboxError> {
        let mut task = self.require_task(tenant, task_id).await?;
        match task.status {
            TaskStatus::Pending => {}
            TaskStatus::Claimed if task.claimed_by.as_deref() == Some(user_id) => return Ok(task),
            TaskStatus::Claimed => return Err(claimed_by_other(&task)),
            status => {
                return Err(InboxError::IllegalTransition {
                    task_id,
                    action: "claim",
                    status,
                })
            }
        }
        self.engine
            .require_open_execution(tenant, task.execution_id)
            .await?;

        let before = task.clone();
        task.status = TaskStatus::Claimed;
        task.claimed_by = Some(user_id.to_string());
        task.updated_at = Utc::now();
        self.transition(&task, TaskStatus::Pending, "claim", Some(user_id), None)
            .await?;

        self.emit_or_revert(
            &before,
            &task,
            names::TASK_CLAIMED,
            json!({ "task_id": task.task_id, "task_type": task.task_type, "claimed_by": user_id }),
            Some(user_id.to_string()),
        )
        .await?;
        Ok(task)
    }

    /// CLAIMED → PENDING, by the claiming user
    #[instrument(skip(self))]
    pub async fn release_task(
        &self,
        tenant: &str,
        task_id: Uuid,
        user_id: &str,
    ) -> Result<WorkflowTask, InboxError> {
        let mut task = self.require_task(tenant, task_id).await?;
        if task.status != TaskStatus::Claimed {
            return Err(InboxError::IllegalTransition {
                task_id,
                action: "release",
                status: task.status,
            });
        }
        if task.claimed_by.as_deref() != Some(user_id) {
            return Err(claimed_by_other(&task));
        }
        self.engine
            .require_open_execution(tenant, task.execution_id)
            .await?;

        let before = task.clone();
        task.status = TaskStatus::Pending;
        task.claimed_by = None;
        task.updated_at = Utc::now();
        self.transition(&task, TaskStatus::Claimed, "release", Some(user_id), None)
            .await?;

        self.emit_or_revert(
            &before,
            &task,
            names::TASK_RELEASED,
            json!({ "task_id": task.task_id, "task_type": task.task_type, "released_by": user_id }),
            Some(user_id.to_string()),
        )
        .await?;
        Ok(task)
    }

    /// PENDING|CLAIMED → COMPLETED with validated form data
    #[instrument(skip(self, form_data))]
    pub async fn complete_task(
        &self,
        tenant: &str,
        task_id: Uuid,
        form_data: Value,
        user_id: Option<String>,
    ) -> Result<WorkflowTask, InboxError> {
        let mut task = self.require_task(tenant, task_id).await?;
        let previous = task.status;
        if !previous.is_open() {
            return Err(InboxError::IllegalTransition {
                task_id,
                action: "complete",
                status: previous,
            });
        }
        if let (Some(claimer), Some(user)) = (&task.claimed_by, &user_id) {
            if claimer != user {
                return Err(claimed_by_other(&task));
            }
        }
        self.engine
            .require_open_execution(tenant, task.execution_id)
            .await?;

        let form = self.forms.require_form(tenant, &task.form_id, None).await?;
        let report = forms::validate(&form.json_schema, &form_data);
        if !report.valid {
            debug!(%task_id, errors = report.errors.len(), "submission rejected");
            return Err(InboxError::InvalidSubmission(report));
        }

        let before = task.clone();
        let now = Utc::now();
        task.status = TaskStatus::Completed;
        task.response_data = Some(form_data.clone());
        task.draft_data = None;
        task.updated_at = now;
        task.completed_at = Some(now);
        if task.claimed_by.is_none() {
            task.claimed_by = user_id.clone();
        }
        self.transition(
            &task,
            previous,
            "complete",
            user_id.as_deref(),
            Some(json!({ "form_version": form.version })),
        )
        .await?;

        info!(%task_id, execution_id = %task.execution_id, "task completed");

        self.emit_or_revert(
            &before,
            &task,
            names::TASK_COMPLETED,
            json!({
                "task_id": task.task_id,
                "task_type": task.task_type,
                "form_id": task.form_id,
                "form_version": form.version,
                "form_data": form_data,
            }),
            user_id,
        )
        .await?;
        Ok(task)
    }

    /// PENDING|CLAIMED → CANCELLED
    #[instrument(skip(self))]
    pub async fn cancel_task(
        &self,
        tenant: &str,
        task_id: Uuid,
        reason: &str,
        user_id: Option<String>,
    ) -> Result<WorkflowTask, InboxError> {
        let mut task = self.require_task(tenant, task_id).await?;
        let previous = task.status;
        if !previous.is_open() {
            return Err(InboxError::IllegalTransition {
                task_id,
                action: "cancel",
                status: previous,
            });
        }
        self.engine
            .require_open_execution(tenant, task.execution_id)
            .await?;

        let before = task.clone();
        task.status = TaskStatus::Cancelled;
        task.updated_at = Utc::now();
        self.transition(
            &task,
            previous,
            "cancel",
            user_id.as_deref(),
            Some(json!({ "reason": reason })),
        )
        .await?;

        self.emit_or_revert(
            &before,
            &task,
            names::TASK_CANCELLED,
            json!({ "task_id": task.task_id, "task_type": task.task_type, "reason": reason }),
            user_id,
        )
        .await?;
        Ok(task)
    }

    /// Store partial form data on an open task
    ///
    /// Drafts are checked with `required` ignored and do not reach the
    /// execution.
    #[instrument(skip(self, data))]
    pub async fn save_draft(
        &self,
        tenant: &str,
        task_id: Uuid,
        data: Value,
        user_id: Option<String>,
    ) -> Result<WorkflowTask, InboxError> {
        let mut task = self.require_task(tenant, task_id).await?;
        if !task.status.is_open() {
            return Err(InboxError::IllegalTransition {
                task_id,
                action: "save a draft for",
                status: task.status,
            });
        }

        let form = self.forms.require_form(tenant, &task.form_id, None).await?;
        let report = forms::validate_partial(&form.json_schema, &data);
        if !report.valid {
            return Err(InboxError::InvalidSubmission(report));
        }

        let status = task.status;
        task.draft_data = Some(data);
        task.updated_at = Utc::now();
        self.transition(&task, status, "save_draft", user_id.as_deref(), None)
            .await?;
        Ok(task)
    }

    pub async fn get_task(
        &self,
        tenant: &str,
        task_id: Uuid,
    ) -> Result<Option<WorkflowTask>, InboxError> {
        Ok(self.store.get_task(tenant, task_id).await?)
    }

    pub async fn require_task(&self, tenant: &str, task_id: Uuid) -> Result<WorkflowTask, InboxError> {
        self.get_task(tenant, task_id)
            .await?
            .ok_or(InboxError::TaskNotFound(task_id))
    }

    pub async fn list_tasks(
        &self,
        tenant: &str,
        filter: &TaskFilter,
    ) -> Result<Vec<WorkflowTask>, InboxError> {
        Ok(self.store.list_tasks(tenant, filter).await?)
    }

    pub async fn task_history(
        &self,
        tenant: &str,
        task_id: Uuid,
    ) -> Result<Vec<TaskHistoryEntry>, InboxError> {
        Ok(self.store.task_history(tenant, task_id).await?)
    }

    pub async fn task_definition(
        &self,
        tenant: &str,
        task_type: &str,
    ) -> Result<Option<TaskDefinition>, InboxError> {
        Ok(self.store.find_task_definition(tenant, task_type).await?)
    }

    async fn resolve_definition(
        &self,
        tenant: &str,
        request: &CreateTaskRequest,
        form_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<TaskDefinition, InboxError> {
        if let Some(existing) = self
            .store
            .find_task_definition(tenant, &request.task_type)
            .await?
        {
            return Ok(existing);
        }

        let form_id = form_id.ok_or_else(|| {
            InboxError::Invalid(format!(
                "formId is required to create task type {}",
                request.task_type
            ))
        })?;

        let definition = TaskDefinition {
            task_definition_id: Uuid::now_v7(),
            tenant: tenant.to_string(),
            task_type: request.task_type.clone(),
            name: request.title.clone(),
            form_id: form_id.to_string(),
            default_priority: request
                .priority
                .clone()
                .unwrap_or_else(|| self.config.default_task_priority.clone()),
            default_sla_days: request
                .due_date
                .map(|due| sla_days(now, due))
                .unwrap_or(self.config.default_task_sla_days),
            created_at: now,
        };

        match self.store.insert_task_definition(&definition).await {
            Ok(()) => {
                info!(
                    task_type = %definition.task_type,
                    sla_days = definition.default_sla_days,
                    "task definition created"
                );
                Ok(definition)
            }
            Err(StoreError::Duplicate { .. }) => {
                debug!(task_type = %request.task_type, "task definition created concurrently");
                self.store
                    .find_task_definition(tenant, &request.task_type)
                    .await?
                    .ok_or_else(|| {
                        StoreError::not_found("task definition", &request.task_type).into()
                    })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn transition(
        &self,
        task: &WorkflowTask,
        expected: TaskStatus,
        action: &str,
        user_id: Option<&str>,
        details: Option<Value>,
    ) -> Result<(), InboxError> {
        let history = TaskHistoryEntry::record(task, action, Some(expected), user_id, details);
        self.store
            .update_task(task, expected, Some(&history))
            .await
            .map_err(|e| match e {
                StoreError::StatusConflict { .. } => {
                    warn!(task_id = %task.task_id, action, "task changed concurrently");
                    e.into()
                }
                other => other.into(),
            })
    }

    async fn emit(
        &self,
        task: &WorkflowTask,
        event_name: &str,
        payload: Value,
        user_id: Option<String>,
    ) -> Result<(), InboxError> {
        self.engine
            .deliver_event(
                &task.tenant,
                DeliverEvent::task(task.execution_id, event_name, payload).with_user(user_id),
            )
            .await?;
        Ok(())
    }

    /// Report a committed status change, restoring `before` if the event is
    /// not recorded
    async fn emit_or_revert(
        &self,
        before: &WorkflowTask,
        after: &WorkflowTask,
        event_name: &str,
        payload: Value,
        user_id: Option<String>,
    ) -> Result<(), InboxError> {
        let actor = user_id.clone();
        let Err(e) = self.emit(after, event_name, payload, user_id).await else {
            return Ok(());
        };

        warn!(
            task_id = %after.task_id,
            event_name,
            error = %e,
            "task event not recorded, reverting task"
        );
        let mut restored = before.clone();
        restored.updated_at = Utc::now();
        let history = TaskHistoryEntry::record(
            &restored,
            "revert",
            Some(after.status),
            actor.as_deref(),
            Some(json!({ "event": event_name, "error": e.to_string() })),
        );
        if let Err(revert_err) = self
            .store
            .update_task(&restored, after.status, Some(&history))
            .await
        {
            error!(task_id = %after.task_id, error = %revert_err, "failed to revert task");
        }
        Err(e)
    }

    /// Remove a task whose `task_created` event was not recorded
    async fn withdraw(&self, task: &WorkflowTask, cause: &InboxError) {
        warn!(
            task_id = %task.task_id,
            execution_id = %task.execution_id,
            error = %cause,
            "task_created not recorded, withdrawing task"
        );
        if let Err(e) = self.store.delete_task(&task.tenant, task.task_id).await {
            error!(task_id = %task.task_id, error = %e, "failed to withdraw task");
        }
    }
}

fn claimed_by_other(task: &WorkflowTask) -> InboxError {
    InboxError::ClaimedByOther {
        task_id: task.task_id,
        claimed_by: task.claimed_by.clone().unwrap_or_default(),
    }
}

/// Whole days until `due`, at least one
fn sla_days(now: DateTime<Utc>, due: DateTime<Utc>) -> i32 {
    let seconds = (due - now).num_seconds();
    let days = (seconds + 86_399).div_euclid(86_400);
    days.clamp(1, i64::from(i32::MAX)) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sla_days() {
        let now = Utc::now();
        assert_eq!(sla_days(now, now + Duration::hours(1)), 1);
        assert_eq!(sla_days(now, now + Duration::days(2)), 2);
        assert_eq!(sla_days(now, now + Duration::days(2) + Duration::minutes(1)), 3);
        assert_eq!(sla_days(now, now - Duration::days(4)), 1);
    }
}
