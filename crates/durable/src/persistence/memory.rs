//! In-memory implementation of WorkflowStore for testing

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;
use crate::forms::{FormDefinition, FormStatus};
use crate::inbox::{TaskDefinition, TaskFilter, TaskHistoryEntry, TaskStatus, WorkflowTask};
use crate::workflow::{EventRange, WorkflowEvent};

/// Internal execution state: the record plus its log
struct ExecutionState {
    execution: WorkflowExecution,
    events: Vec<WorkflowEvent>,
    snapshots: Vec<ExecutionSnapshot>,
}

#[derive(Default)]
struct Inner {
    registrations: HashMap<Uuid, WorkflowRegistration>,
    versions: Vec<WorkflowVersion>,
    templates: HashMap<Uuid, WorkflowTemplate>,
    executions: HashMap<Uuid, ExecutionState>,
    event_ids: HashMap<Uuid, Uuid>,
    action_results: Vec<ActionResult>,
    task_definitions: Vec<TaskDefinition>,
    tasks: HashMap<Uuid, WorkflowTask>,
    task_history: Vec<TaskHistoryEntry>,
    forms: Vec<FormDefinition>,
}

impl Inner {
    fn execution(&self, tenant: &str, execution_id: Uuid) -> Option<&ExecutionState> {
        self.executions
            .get(&execution_id)
            .filter(|e| e.execution.tenant == tenant)
    }

    fn registration_owned(&self, tenant: &str, registration_id: Uuid) -> bool {
        self.registrations
            .get(&registration_id)
            .is_some_and(|r| r.tenant == tenant)
    }
}

/// In-memory implementation of WorkflowStore
///
/// This is primarily for testing. A single lock guards every collection so
/// each trait method is atomic, matching the transactional guarantees of
/// the PostgreSQL implementation.
///
/// # Example
///
/// ```
/// use opsflow_durable::InMemoryWorkflowStore;
///
/// let store = InMemoryWorkflowStore::new();
/// assert_eq!(store.execution_count(), 0);
/// ```
pub struct InMemoryWorkflowStore {
    inner: RwLock<Inner>,
}

impl InMemoryWorkflowStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Get the number of executions
    pub fn execution_count(&self) -> usize {
        self.inner.read().executions.len()
    }

    /// Get the number of recorded action attempts
    pub fn action_result_count(&self) -> usize {
        self.inner.read().action_results.len()
    }

    /// Get the number of task definitions across tenants
    pub fn task_definition_count(&self) -> usize {
        self.inner.read().task_definitions.len()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        *self.inner.write() = Inner::default();
    }
}

impl Default for InMemoryWorkflowStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn insert_registration(
        &self,
        registration: &WorkflowRegistration,
        version: &WorkflowVersion,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if inner
            .registrations
            .values()
            .any(|r| r.tenant == registration.tenant && r.name == registration.name)
        {
            return Err(StoreError::duplicate("workflow", &registration.name));
        }
        inner
            .registrations
            .insert(registration.registration_id, registration.clone());
        let mut version = version.clone();
        version.is_current = true;
        inner.versions.push(version);
        Ok(())
    }

    async fn insert_version(
        &self,
        tenant: &str,
        version: &WorkflowVersion,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if !inner.registration_owned(tenant, version.registration_id) {
            return Err(StoreError::not_found("workflow", version.registration_id));
        }
        if inner
            .versions
            .iter()
            .any(|v| v.registration_id == version.registration_id && v.version == version.version)
        {
            return Err(StoreError::duplicate("workflow version", &version.version));
        }
        for v in inner
            .versions
            .iter_mut()
            .filter(|v| v.registration_id == version.registration_id)
        {
            v.is_current = false;
        }
        let mut version = version.clone();
        version.is_current = true;
        inner.versions.push(version);
        Ok(())
    }

    async fn find_registration(
        &self,
        tenant: &str,
        registration_id: Uuid,
    ) -> Result<Option<WorkflowRegistration>, StoreError> {
        Ok(self
            .inner
            .read()
            .registrations
            .get(&registration_id)
            .filter(|r| r.tenant == tenant)
            .cloned())
    }

    async fn find_registration_by_name(
        &self,
        tenant: &str,
        name: &str,
    ) -> Result<Option<WorkflowRegistration>, StoreError> {
        Ok(self
            .inner
            .read()
            .registrations
            .values()
            .find(|r| r.tenant == tenant && r.name == name)
            .cloned())
    }

    async fn list_registrations(
        &self,
        tenant: &str,
    ) -> Result<Vec<WorkflowRegistration>, StoreError> {
        let mut registrations: Vec<_> = self
            .inner
            .read()
            .registrations
            .values()
            .filter(|r| r.tenant == tenant)
            .cloned()
            .collect();
        registrations.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(registrations)
    }

    async fn list_versions(
        &self,
        tenant: &str,
        registration_id: Uuid,
    ) -> Result<Vec<WorkflowVersion>, StoreError> {
        let inner = self.inner.read();
        if !inner.registration_owned(tenant, registration_id) {
            return Ok(vec![]);
        }
        Ok(inner
            .versions
            .iter()
            .filter(|v| v.registration_id == registration_id)
            .cloned()
            .collect())
    }

    async fn find_version(
        &self,
        tenant: &str,
        version_id: Uuid,
    ) -> Result<Option<WorkflowVersion>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .versions
            .iter()
            .find(|v| v.version_id == version_id)
            .filter(|v| inner.registration_owned(tenant, v.registration_id))
            .cloned())
    }

    async fn set_current_version(
        &self,
        tenant: &str,
        registration_id: Uuid,
        version: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if !inner.registration_owned(tenant, registration_id)
            || !inner
                .versions
                .iter()
                .any(|v| v.registration_id == registration_id && v.version == version)
        {
            return Err(StoreError::not_found("workflow version", version));
        }
        for v in inner
            .versions
            .iter_mut()
            .filter(|v| v.registration_id == registration_id)
        {
            v.is_current = v.version == version;
        }
        Ok(())
    }

    async fn insert_template(&self, template: &WorkflowTemplate) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if inner
            .templates
            .values()
            .any(|t| t.tenant == template.tenant && t.name == template.name)
        {
            return Err(StoreError::duplicate("workflow template", &template.name));
        }
        inner
            .templates
            .insert(template.template_id, template.clone());
        Ok(())
    }

    async fn find_template(
        &self,
        tenant: &str,
        template_id: Uuid,
    ) -> Result<Option<WorkflowTemplate>, StoreError> {
        Ok(self
            .inner
            .read()
            .templates
            .get(&template_id)
            .filter(|t| t.tenant == tenant)
            .cloned())
    }

    async fn create_execution(
        &self,
        execution: &WorkflowExecution,
        first_event: &WorkflowEvent,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if inner.executions.contains_key(&execution.execution_id) {
            return Err(StoreError::duplicate("execution", execution.execution_id));
        }
        if inner.event_ids.contains_key(&first_event.event_id) {
            return Err(StoreError::duplicate("event", first_event.event_id));
        }
        inner
            .event_ids
            .insert(first_event.event_id, execution.execution_id);
        inner.executions.insert(
            execution.execution_id,
            ExecutionState {
                execution: execution.clone(),
                events: vec![first_event.clone()],
                snapshots: vec![],
            },
        );
        Ok(())
    }

    async fn get_execution(
        &self,
        tenant: &str,
        execution_id: Uuid,
    ) -> Result<Option<WorkflowExecution>, StoreError> {
        Ok(self
            .inner
            .read()
            .execution(tenant, execution_id)
            .map(|e| e.execution.clone()))
    }

    async fn list_executions(
        &self,
        tenant: &str,
        filter: &ExecutionFilter,
    ) -> Result<Vec<WorkflowExecution>, StoreError> {
        let inner = self.inner.read();
        let mut executions: Vec<_> = inner
            .executions
            .values()
            .map(|e| &e.execution)
            .filter(|e| e.tenant == tenant)
            .filter(|e| {
                filter
                    .workflow_name
                    .as_ref()
                    .map_or(true, |n| &e.workflow_name == n)
            })
            .filter(|e| filter.status.map_or(true, |s| e.status == s))
            .cloned()
            .collect();
        executions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            executions.truncate(limit as usize);
        }
        Ok(executions)
    }

    async fn append_event(
        &self,
        event: &WorkflowEvent,
        update: &ExecutionUpdate,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if inner.event_ids.contains_key(&event.event_id) {
            return Err(StoreError::duplicate("event", event.event_id));
        }

        let state = inner
            .executions
            .get_mut(&event.execution_id)
            .filter(|e| e.execution.tenant == event.tenant)
            .ok_or(StoreError::ExecutionNotFound(event.execution_id))?;

        if state.execution.sequence != event.sequence {
            return Err(StoreError::ConcurrencyConflict {
                expected: event.sequence,
                actual: state.execution.sequence,
            });
        }

        state.events.push(event.clone());
        state.execution.sequence = event.sequence + 1;
        state.execution.current_state = update.current_state.clone();
        state.execution.status = update.status;
        state.execution.context_data = update.context_data.clone();
        state.execution.updated_at = Utc::now();

        inner.event_ids.insert(event.event_id, event.execution_id);
        Ok(())
    }

    async fn load_events(
        &self,
        tenant: &str,
        execution_id: Uuid,
        range: EventRange,
    ) -> Result<Vec<WorkflowEvent>, StoreError> {
        let inner = self.inner.read();
        let state = inner
            .execution(tenant, execution_id)
            .ok_or(StoreError::ExecutionNotFound(execution_id))?;
        Ok(state
            .events
            .iter()
            .filter(|e| range.contains(e.sequence))
            .cloned()
            .collect())
    }

    async fn find_event(
        &self,
        tenant: &str,
        execution_id: Uuid,
        event_id: Uuid,
    ) -> Result<Option<WorkflowEvent>, StoreError> {
        let inner = self.inner.read();
        Ok(inner.execution(tenant, execution_id).and_then(|state| {
            state
                .events
                .iter()
                .find(|e| e.event_id == event_id)
                .cloned()
        }))
    }

    async fn save_snapshot(&self, snapshot: &ExecutionSnapshot) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let state = inner
            .executions
            .get_mut(&snapshot.execution_id)
            .filter(|e| e.execution.tenant == snapshot.tenant)
            .ok_or(StoreError::ExecutionNotFound(snapshot.execution_id))?;
        state.snapshots.retain(|s| s.sequence != snapshot.sequence);
        state.snapshots.push(snapshot.clone());
        state.snapshots.sort_by_key(|s| s.sequence);
        Ok(())
    }

    async fn latest_snapshot(
        &self,
        tenant: &str,
        execution_id: Uuid,
        at_or_before: Option<i64>,
    ) -> Result<Option<ExecutionSnapshot>, StoreError> {
        let inner = self.inner.read();
        Ok(inner.execution(tenant, execution_id).and_then(|state| {
            state
                .snapshots
                .iter()
                .rev()
                .find(|s| at_or_before.map_or(true, |limit| s.sequence <= limit))
                .cloned()
        }))
    }

    async fn claim_action(
        &self,
        claim: &NewActionClaim,
        stale_after: chrono::Duration,
    ) -> Result<ActionClaim, StoreError> {
        let mut inner = self.inner.write();
        let now = Utc::now();

        let existing = inner.action_results.iter_mut().find(|r| {
            r.tenant == claim.tenant
                && r.execution_id == claim.execution_id
                && r.action_name == claim.action_name
                && r.idempotency_key == claim.idempotency_key
        });

        if let Some(record) = existing {
            let in_flight = record.completed_at.is_none();
            if record.success {
                return Ok(ActionClaim::AlreadyCompleted(record.clone()));
            }
            if in_flight && now - record.started_at < stale_after {
                return Ok(ActionClaim::InFlight(record.clone()));
            }
            record.attempt += 1;
            record.parameters = claim.parameters.clone();
            record.event_id = claim.event_id;
            record.result = None;
            record.started_at = now;
            record.completed_at = None;
            return Ok(ActionClaim::Acquired(record.clone()));
        }

        let record = ActionResult {
            result_id: Uuid::now_v7(),
            tenant: claim.tenant.clone(),
            execution_id: claim.execution_id,
            action_name: claim.action_name.clone(),
            event_id: claim.event_id,
            idempotency_key: claim.idempotency_key.clone(),
            parameters: claim.parameters.clone(),
            result: None,
            error_message: None,
            success: false,
            attempt: 1,
            started_at: now,
            completed_at: None,
        };
        inner.action_results.push(record.clone());
        Ok(ActionClaim::Acquired(record))
    }

    async fn complete_action(
        &self,
        result_id: Uuid,
        outcome: ActionOutcome,
    ) -> Result<ActionResult, StoreError> {
        let mut inner = self.inner.write();
        let record = inner
            .action_results
            .iter_mut()
            .find(|r| r.result_id == result_id)
            .ok_or_else(|| StoreError::not_found("action result", result_id))?;

        match outcome {
            ActionOutcome::Succeeded(value) => {
                record.success = true;
                record.result = Some(value);
            }
            ActionOutcome::Failed(message) => {
                record.success = false;
                record.result = None;
                record.error_message = Some(message);
            }
        }
        record.completed_at = Some(Utc::now());
        Ok(record.clone())
    }

    async fn list_action_results(
        &self,
        tenant: &str,
        execution_id: Uuid,
    ) -> Result<Vec<ActionResult>, StoreError> {
        Ok(self
            .inner
            .read()
            .action_results
            .iter()
            .filter(|r| r.tenant == tenant && r.execution_id == execution_id)
            .cloned()
            .collect())
    }

    async fn find_task_definition(
        &self,
        tenant: &str,
        task_type: &str,
    ) -> Result<Option<TaskDefinition>, StoreError> {
        Ok(self
            .inner
            .read()
            .task_definitions
            .iter()
            .find(|d| d.tenant == tenant && d.task_type == task_type)
            .cloned())
    }

    async fn insert_task_definition(&self, definition: &TaskDefinition) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if inner
            .task_definitions
            .iter()
            .any(|d| d.tenant == definition.tenant && d.task_type == definition.task_type)
        {
            return Err(StoreError::duplicate("task definition", &definition.task_type));
        }
        inner.task_definitions.push(definition.clone());
        Ok(())
    }

    async fn insert_task(
        &self,
        task: &WorkflowTask,
        history: &TaskHistoryEntry,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if inner.tasks.contains_key(&task.task_id) {
            return Err(StoreError::duplicate("task", task.task_id));
        }
        inner.tasks.insert(task.task_id, task.clone());
        inner.task_history.push(history.clone());
        Ok(())
    }

    async fn get_task(
        &self,
        tenant: &str,
        task_id: Uuid,
    ) -> Result<Option<WorkflowTask>, StoreError> {
        Ok(self
            .inner
            .read()
            .tasks
            .get(&task_id)
            .filter(|t| t.tenant == tenant)
            .cloned())
    }

    async fn list_tasks(
        &self,
        tenant: &str,
        filter: &TaskFilter,
    ) -> Result<Vec<WorkflowTask>, StoreError> {
        let mut tasks: Vec<_> = self
            .inner
            .read()
            .tasks
            .values()
            .filter(|t| t.tenant == tenant && filter.matches(t))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }

    async fn update_task(
        &self,
        task: &WorkflowTask,
        expected: TaskStatus,
        history: Option<&TaskHistoryEntry>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let stored = inner
            .tasks
            .get_mut(&task.task_id)
            .filter(|t| t.tenant == task.tenant)
            .ok_or_else(|| StoreError::not_found("task", task.task_id))?;

        if stored.status != expected {
            return Err(StoreError::StatusConflict {
                entity: "task",
                key: task.task_id.to_string(),
                expected: expected.to_string(),
                actual: stored.status.to_string(),
            });
        }

        *stored = task.clone();
        if let Some(history) = history {
            inner.task_history.push(history.clone());
        }
        Ok(())
    }

    async fn delete_task(&self, tenant: &str, task_id: Uuid) -> Result<bool, StoreError> {
        let mut inner = self.inner.write();
        let owned = inner.tasks.get(&task_id).is_some_and(|t| t.tenant == tenant);
        if !owned {
            return Ok(false);
        }
        inner.tasks.remove(&task_id);
        inner.task_history.retain(|h| h.task_id != task_id);
        Ok(true)
    }

    async fn task_history(
        &self,
        tenant: &str,
        task_id: Uuid,
    ) -> Result<Vec<TaskHistoryEntry>, StoreError> {
        Ok(self
            .inner
            .read()
            .task_history
            .iter()
            .filter(|h| h.tenant == tenant && h.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn insert_form(&self, form: &FormDefinition) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if inner.forms.iter().any(|f| {
            f.tenant == form.tenant && f.form_id == form.form_id && f.version == form.version
        }) {
            return Err(StoreError::duplicate(
                "form",
                format!("{}@{}", form.form_id, form.version),
            ));
        }
        inner.forms.push(form.clone());
        Ok(())
    }

    async fn find_form(
        &self,
        tenant: &str,
        form_id: &str,
        version: &str,
    ) -> Result<Option<FormDefinition>, StoreError> {
        Ok(self
            .inner
            .read()
            .forms
            .iter()
            .find(|f| f.tenant == tenant && f.form_id == form_id && f.version == version)
            .cloned())
    }

    async fn list_form_versions(
        &self,
        tenant: &str,
        form_id: &str,
    ) -> Result<Vec<FormDefinition>, StoreError> {
        Ok(self
            .inner
            .read()
            .forms
            .iter()
            .filter(|f| f.tenant == tenant && f.form_id == form_id)
            .cloned()
            .collect())
    }

    async fn list_forms(
        &self,
        tenant: &str,
        category: Option<&str>,
    ) -> Result<Vec<FormDefinition>, StoreError> {
        Ok(self
            .inner
            .read()
            .forms
            .iter()
            .filter(|f| f.tenant == tenant && category.map_or(true, |c| f.category == c))
            .cloned()
            .collect())
    }

    async fn update_form_status(
        &self,
        tenant: &str,
        form_id: &str,
        version: &str,
        status: FormStatus,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let form = inner
            .forms
            .iter_mut()
            .find(|f| f.tenant == tenant && f.form_id == form_id && f.version == version)
            .ok_or_else(|| StoreError::not_found("form", format!("{form_id}@{version}")))?;
        form.status = status;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{EventType, ExecutionStatus};
    use serde_json::json;

    fn execution(tenant: &str) -> WorkflowExecution {
        let now = Utc::now();
        WorkflowExecution {
            execution_id: Uuid::now_v7(),
            tenant: tenant.to_string(),
            workflow_name: "invoice".into(),
            workflow_version_id: Uuid::now_v7(),
            current_state: "draft".into(),
            status: ExecutionStatus::Active,
            context_data: json!({}),
            sequence: 1,
            created_at: now,
            updated_at: now,
        }
    }

    fn event(exec: &WorkflowExecution, sequence: i64, name: &str, to: &str) -> WorkflowEvent {
        WorkflowEvent {
            event_id: Uuid::now_v7(),
            execution_id: exec.execution_id,
            tenant: exec.tenant.clone(),
            sequence,
            event_name: name.into(),
            event_type: EventType::External,
            from_state: None,
            to_state: to.into(),
            user_id: None,
            payload: json!({}),
            created_at: Utc::now(),
        }
    }

    fn update(state: &str) -> ExecutionUpdate {
        ExecutionUpdate {
            current_state: state.into(),
            status: ExecutionStatus::Active,
            context_data: json!({}),
        }
    }

    #[tokio::test]
    async fn test_append_and_load_events() {
        let store = InMemoryWorkflowStore::new();
        let exec = execution("acme");
        store
            .create_execution(&exec, &event(&exec, 0, "workflow_started", "draft"))
            .await
            .expect("should create");

        store
            .append_event(&event(&exec, 1, "submit", "submitted"), &update("submitted"))
            .await
            .expect("should append");

        let events = store
            .load_events("acme", exec.execution_id, EventRange::all())
            .await
            .expect("should load");
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].sequence, 1);

        let loaded = store
            .get_execution("acme", exec.execution_id)
            .await
            .expect("should get")
            .expect("exists");
        assert_eq!(loaded.current_state, "submitted");
        assert_eq!(loaded.sequence, 2);
    }

    #[tokio::test]
    async fn test_concurrency_conflict() {
        let store = InMemoryWorkflowStore::new();
        let exec = execution("acme");
        store
            .create_execution(&exec, &event(&exec, 0, "workflow_started", "draft"))
            .await
            .expect("should create");

        let result = store
            .append_event(&event(&exec, 5, "submit", "submitted"), &update("submitted"))
            .await;
        assert!(matches!(
            result,
            Err(StoreError::ConcurrencyConflict {
                expected: 5,
                actual: 1
            })
        ));

        let loaded = store
            .get_execution("acme", exec.execution_id)
            .await
            .expect("should get")
            .expect("exists");
        assert_eq!(loaded.current_state, "draft");
    }

    #[tokio::test]
    async fn test_tenant_isolation() {
        let store = InMemoryWorkflowStore::new();
        let exec = execution("acme");
        store
            .create_execution(&exec, &event(&exec, 0, "workflow_started", "draft"))
            .await
            .expect("should create");

        assert!(store
            .get_execution("globex", exec.execution_id)
            .await
            .expect("should query")
            .is_none());
    }

    #[tokio::test]
    async fn test_action_claim_lifecycle() {
        let store = InMemoryWorkflowStore::new();
        let claim = NewActionClaim {
            tenant: "acme".into(),
            execution_id: Uuid::now_v7(),
            action_name: "send_notification".into(),
            event_id: None,
            idempotency_key: "k1".into(),
            parameters: json!({}),
        };
        let stale = chrono::Duration::minutes(5);

        let ActionClaim::Acquired(first) = store.claim_action(&claim, stale).await.expect("claim")
        else {
            panic!("expected fresh claim");
        };
        assert!(matches!(
            store.claim_action(&claim, stale).await.expect("claim"),
            ActionClaim::InFlight(_)
        ));

        store
            .complete_action(first.result_id, ActionOutcome::Failed("boom".into()))
            .await
            .expect("complete");
        let ActionClaim::Acquired(retry) = store.claim_action(&claim, stale).await.expect("claim")
        else {
            panic!("failed record should be re-acquired");
        };
        assert_eq!(retry.attempt, 2);
        assert_eq!(retry.error_message.as_deref(), Some("boom"));

        store
            .complete_action(retry.result_id, ActionOutcome::Succeeded(json!({"ok": true})))
            .await
            .expect("complete");
        let ActionClaim::AlreadyCompleted(done) =
            store.claim_action(&claim, stale).await.expect("claim")
        else {
            panic!("succeeded record should be returned");
        };
        assert_eq!(done.result, Some(json!({"ok": true})));
        assert_eq!(done.error_message.as_deref(), Some("boom"));
        assert_eq!(store.action_result_count(), 1);
    }

    fn task(tenant: &str) -> WorkflowTask {
        let now = Utc::now();
        WorkflowTask {
            task_id: Uuid::now_v7(),
            tenant: tenant.to_string(),
            execution_id: Uuid::now_v7(),
            task_definition_id: Uuid::now_v7(),
            task_type: "invoice_approval".into(),
            form_id: "invoice_form".into(),
            title: "Approve".into(),
            description: None,
            status: TaskStatus::Pending,
            priority: "normal".into(),
            due_date: None,
            context_data: json!({}),
            assigned_roles: vec![],
            assigned_users: vec![],
            claimed_by: None,
            response_data: None,
            draft_data: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn test_delete_task_removes_history() {
        let store = InMemoryWorkflowStore::new();
        let task = task("acme");
        store
            .insert_task(&task, &TaskHistoryEntry::record(&task, "create", None, None, None))
            .await
            .expect("insert");

        assert!(!store.delete_task("globex", task.task_id).await.expect("delete"));
        assert!(store.delete_task("acme", task.task_id).await.expect("delete"));

        assert!(store.get_task("acme", task.task_id).await.expect("get").is_none());
        assert!(store
            .task_history("acme", task.task_id)
            .await
            .expect("history")
            .is_empty());
        assert!(!store.delete_task("acme", task.task_id).await.expect("delete"));
    }
}
