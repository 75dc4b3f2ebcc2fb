//! PostgreSQL implementation of WorkflowStore
//!
//! Production persistence with:
//! - Event append and execution update in one transaction
//! - Optimistic concurrency via the execution's sequence, under a row lock
//! - Idempotency-key claims resolved by a unique constraint

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use super::store::*;
use crate::forms::{FormDefinition, FormStatus};
use crate::inbox::{TaskDefinition, TaskFilter, TaskHistoryEntry, TaskStatus, WorkflowTask};
use crate::workflow::{EventRange, EventType, ExecutionStatus, WorkflowDefinition, WorkflowEvent};

/// PostgreSQL implementation of WorkflowStore
///
/// # Example
///
/// ```ignore
/// use opsflow_durable::PostgresWorkflowStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/opsflow").await?;
/// let store = PostgresWorkflowStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresWorkflowStore {
    pool: PgPool,
}

impl PostgresWorkflowStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run migrations: {}", e);
                StoreError::Database(e.to_string())
            })
    }
}

fn db_error(operation: &'static str) -> impl Fn(sqlx::Error) -> StoreError {
    move |e| {
        error!("Failed to {}: {}", operation, e);
        StoreError::Database(e.to_string())
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .is_some_and(|d| d.is_unique_violation())
}

fn json_column<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn enum_column<T>(raw: &str, parse: fn(&str) -> Option<T>, what: &str) -> Result<T, StoreError> {
    parse(raw).ok_or_else(|| StoreError::Serialization(format!("unknown {what}: {raw}")))
}

#[async_trait]
impl WorkflowStore for PostgresWorkflowStore {
    // =========================================================================
    // Workflow Registry Operations
    // =========================================================================

    #[instrument(skip(self, registration, version), fields(name = %registration.name))]
    async fn insert_registration(
        &self,
        registration: &WorkflowRegistration,
        version: &WorkflowVersion,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error("begin transaction"))?;

        sqlx::query(
            r#"
            INSERT INTO workflow_registrations (registration_id, tenant, name, category, tags, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(registration.registration_id)
        .bind(&registration.tenant)
        .bind(&registration.name)
        .bind(&registration.category)
        .bind(&registration.tags)
        .bind(registration.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::duplicate("workflow", &registration.name)
            } else {
                db_error("insert registration")(e)
            }
        })?;

        insert_version_row(&mut tx, version).await?;

        tx.commit().await.map_err(db_error("commit registration"))?;
        debug!(registration_id = %registration.registration_id, "inserted registration");
        Ok(())
    }

    #[instrument(skip(self, version), fields(version = %version.version))]
    async fn insert_version(
        &self,
        tenant: &str,
        version: &WorkflowVersion,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error("begin transaction"))?;

        lock_registration(&mut tx, tenant, version.registration_id).await?;

        sqlx::query("UPDATE workflow_versions SET is_current = FALSE WHERE registration_id = $1")
            .bind(version.registration_id)
            .execute(&mut *tx)
            .await
            .map_err(db_error("clear current version"))?;

        insert_version_row(&mut tx, version).await?;

        tx.commit().await.map_err(db_error("commit version"))?;
        Ok(())
    }

    async fn find_registration(
        &self,
        tenant: &str,
        registration_id: Uuid,
    ) -> Result<Option<WorkflowRegistration>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM workflow_registrations
            WHERE tenant = $1 AND registration_id = $2
            "#,
        )
        .bind(tenant)
        .bind(registration_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("find registration"))?;

        Ok(row.as_ref().map(registration_from_row))
    }

    async fn find_registration_by_name(
        &self,
        tenant: &str,
        name: &str,
    ) -> Result<Option<WorkflowRegistration>, StoreError> {
        let row = sqlx::query("SELECT * FROM workflow_registrations WHERE tenant = $1 AND name = $2")
            .bind(tenant)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("find registration by name"))?;

        Ok(row.as_ref().map(registration_from_row))
    }

    async fn list_registrations(
        &self,
        tenant: &str,
    ) -> Result<Vec<WorkflowRegistration>, StoreError> {
        let rows = sqlx::query("SELECT * FROM workflow_registrations WHERE tenant = $1 ORDER BY name")
            .bind(tenant)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("list registrations"))?;

        Ok(rows.iter().map(registration_from_row).collect())
    }

    async fn list_versions(
        &self,
        tenant: &str,
        registration_id: Uuid,
    ) -> Result<Vec<WorkflowVersion>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT v.* FROM workflow_versions v
            JOIN workflow_registrations r ON r.registration_id = v.registration_id
            WHERE r.tenant = $1 AND v.registration_id = $2
            ORDER BY v.created_at, v.version_id
            "#,
        )
        .bind(tenant)
        .bind(registration_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("list versions"))?;

        rows.iter().map(version_from_row).collect()
    }

    async fn find_version(
        &self,
        tenant: &str,
        version_id: Uuid,
    ) -> Result<Option<WorkflowVersion>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT v.* FROM workflow_versions v
            JOIN workflow_registrations r ON r.registration_id = v.registration_id
            WHERE r.tenant = $1 AND v.version_id = $2
            "#,
        )
        .bind(tenant)
        .bind(version_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("find version"))?;

        row.as_ref().map(version_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn set_current_version(
        &self,
        tenant: &str,
        registration_id: Uuid,
        version: &str,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error("begin transaction"))?;

        lock_registration(&mut tx, tenant, registration_id).await?;

        let exists = sqlx::query(
            "SELECT 1 FROM workflow_versions WHERE registration_id = $1 AND version = $2",
        )
        .bind(registration_id)
        .bind(version)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error("find version"))?;
        if exists.is_none() {
            return Err(StoreError::not_found("workflow version", version));
        }

        // Two statements: the partial unique index is checked per row
        sqlx::query("UPDATE workflow_versions SET is_current = FALSE WHERE registration_id = $1")
            .bind(registration_id)
            .execute(&mut *tx)
            .await
            .map_err(db_error("clear current version"))?;
        sqlx::query(
            "UPDATE workflow_versions SET is_current = TRUE WHERE registration_id = $1 AND version = $2",
        )
        .bind(registration_id)
        .bind(version)
        .execute(&mut *tx)
        .await
        .map_err(db_error("set current version"))?;

        tx.commit().await.map_err(db_error("commit current version"))?;
        Ok(())
    }

    async fn insert_template(&self, template: &WorkflowTemplate) -> Result<(), StoreError> {
        let definition = serde_json::to_value(&template.definition)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO workflow_templates
                (template_id, tenant, name, description, category, tags, definition, parameters, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(template.template_id)
        .bind(&template.tenant)
        .bind(&template.name)
        .bind(&template.description)
        .bind(&template.category)
        .bind(&template.tags)
        .bind(&definition)
        .bind(&template.parameters)
        .bind(template.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::duplicate("template", &template.name)
            } else {
                db_error("insert template")(e)
            }
        })?;
        Ok(())
    }

    async fn find_template(
        &self,
        tenant: &str,
        template_id: Uuid,
    ) -> Result<Option<WorkflowTemplate>, StoreError> {
        let row = sqlx::query("SELECT * FROM workflow_templates WHERE tenant = $1 AND template_id = $2")
            .bind(tenant)
            .bind(template_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("find template"))?;

        row.as_ref()
            .map(|row| {
                Ok(WorkflowTemplate {
                    template_id: row.get("template_id"),
                    tenant: row.get("tenant"),
                    name: row.get("name"),
                    description: row.get("description"),
                    category: row.get("category"),
                    tags: row.get("tags"),
                    definition: json_column(row.get("definition"))?,
                    parameters: row.get("parameters"),
                    created_at: row.get("created_at"),
                })
            })
            .transpose()
    }

    // =========================================================================
    // Execution Operations
    // =========================================================================

    #[instrument(skip(self, execution, first_event), fields(execution_id = %execution.execution_id))]
    async fn create_execution(
        &self,
        execution: &WorkflowExecution,
        first_event: &WorkflowEvent,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error("begin transaction"))?;

        sqlx::query(
            r#"
            INSERT INTO workflow_executions
                (execution_id, tenant, workflow_name, workflow_version_id, current_state,
                 status, context_data, sequence, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(execution.execution_id)
        .bind(&execution.tenant)
        .bind(&execution.workflow_name)
        .bind(execution.workflow_version_id)
        .bind(&execution.current_state)
        .bind(execution.status.as_str())
        .bind(&execution.context_data)
        .bind(execution.sequence)
        .bind(execution.created_at)
        .bind(execution.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(db_error("create execution"))?;

        insert_event_row(&mut tx, first_event).await?;

        tx.commit().await.map_err(db_error("commit execution"))?;
        debug!("created execution");
        Ok(())
    }

    async fn get_execution(
        &self,
        tenant: &str,
        execution_id: Uuid,
    ) -> Result<Option<WorkflowExecution>, StoreError> {
        let row = sqlx::query("SELECT * FROM workflow_executions WHERE tenant = $1 AND execution_id = $2")
            .bind(tenant)
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("get execution"))?;

        row.as_ref().map(execution_from_row).transpose()
    }

    async fn list_executions(
        &self,
        tenant: &str,
        filter: &ExecutionFilter,
    ) -> Result<Vec<WorkflowExecution>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM workflow_executions
            WHERE tenant = $1
              AND ($2::TEXT IS NULL OR workflow_name = $2)
              AND ($3::TEXT IS NULL OR status = $3)
            ORDER BY created_at DESC
            LIMIT $4
            "#,
        )
        .bind(tenant)
        .bind(&filter.workflow_name)
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.limit.map(i64::from))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("list executions"))?;

        rows.iter().map(execution_from_row).collect()
    }

    #[instrument(skip(self, event, update), fields(execution_id = %event.execution_id, sequence = event.sequence))]
    async fn append_event(
        &self,
        event: &WorkflowEvent,
        update: &ExecutionUpdate,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error("begin transaction"))?;

        let seen = sqlx::query("SELECT 1 FROM workflow_events WHERE event_id = $1")
            .bind(event.event_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_error("check event id"))?;
        if seen.is_some() {
            return Err(StoreError::duplicate("event", event.event_id));
        }

        // Check current sequence with lock
        let row = sqlx::query(
            r#"
            SELECT sequence FROM workflow_executions
            WHERE tenant = $1 AND execution_id = $2
            FOR UPDATE
            "#,
        )
        .bind(&event.tenant)
        .bind(event.execution_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error("lock execution"))?
        .ok_or(StoreError::ExecutionNotFound(event.execution_id))?;

        let actual: i64 = row.get("sequence");
        if actual != event.sequence {
            return Err(StoreError::ConcurrencyConflict {
                expected: event.sequence,
                actual,
            });
        }

        insert_event_row(&mut tx, event).await?;

        sqlx::query(
            r#"
            UPDATE workflow_executions
            SET current_state = $2, status = $3, context_data = $4,
                sequence = $5, updated_at = NOW()
            WHERE execution_id = $1
            "#,
        )
        .bind(event.execution_id)
        .bind(&update.current_state)
        .bind(update.status.as_str())
        .bind(&update.context_data)
        .bind(event.sequence + 1)
        .execute(&mut *tx)
        .await
        .map_err(db_error("update execution"))?;

        tx.commit().await.map_err(db_error("commit event"))?;
        Ok(())
    }

    async fn load_events(
        &self,
        tenant: &str,
        execution_id: Uuid,
        range: EventRange,
    ) -> Result<Vec<WorkflowEvent>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM workflow_events
            WHERE tenant = $1 AND execution_id = $2
              AND ($3::BIGINT IS NULL OR sequence > $3)
              AND ($4::BIGINT IS NULL OR sequence <= $4)
            ORDER BY sequence
            "#,
        )
        .bind(tenant)
        .bind(execution_id)
        .bind(range.after)
        .bind(range.until)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("load events"))?;

        if rows.is_empty() && self.get_execution(tenant, execution_id).await?.is_none() {
            return Err(StoreError::ExecutionNotFound(execution_id));
        }

        rows.iter().map(event_from_row).collect()
    }

    async fn find_event(
        &self,
        tenant: &str,
        execution_id: Uuid,
        event_id: Uuid,
    ) -> Result<Option<WorkflowEvent>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM workflow_events WHERE tenant = $1 AND execution_id = $2 AND event_id = $3",
        )
        .bind(tenant)
        .bind(execution_id)
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("find event"))?;

        row.as_ref().map(event_from_row).transpose()
    }

    async fn save_snapshot(&self, snapshot: &ExecutionSnapshot) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO workflow_snapshots
                (execution_id, tenant, sequence, state, status, context_data, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (execution_id, sequence) DO UPDATE
            SET state = EXCLUDED.state, status = EXCLUDED.status,
                context_data = EXCLUDED.context_data, created_at = EXCLUDED.created_at
            "#,
        )
        .bind(snapshot.execution_id)
        .bind(&snapshot.tenant)
        .bind(snapshot.sequence)
        .bind(&snapshot.state)
        .bind(snapshot.status.as_str())
        .bind(&snapshot.context_data)
        .bind(snapshot.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_error("save snapshot"))?;
        Ok(())
    }

    async fn latest_snapshot(
        &self,
        tenant: &str,
        execution_id: Uuid,
        at_or_before: Option<i64>,
    ) -> Result<Option<ExecutionSnapshot>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM workflow_snapshots
            WHERE tenant = $1 AND execution_id = $2
              AND ($3::BIGINT IS NULL OR sequence <= $3)
            ORDER BY sequence DESC
            LIMIT 1
            "#,
        )
        .bind(tenant)
        .bind(execution_id)
        .bind(at_or_before)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("load snapshot"))?;

        row.as_ref()
            .map(|row| {
                let status: String = row.get("status");
                Ok(ExecutionSnapshot {
                    execution_id: row.get("execution_id"),
                    tenant: row.get("tenant"),
                    sequence: row.get("sequence"),
                    state: row.get("state"),
                    status: enum_column(&status, ExecutionStatus::parse, "execution status")?,
                    context_data: row.get("context_data"),
                    created_at: row.get("created_at"),
                })
            })
            .transpose()
    }

    // =========================================================================
    // Action Log Operations
    // =========================================================================

    #[instrument(skip(self, claim), fields(action = %claim.action_name, key = %claim.idempotency_key))]
    async fn claim_action(
        &self,
        claim: &NewActionClaim,
        stale_after: chrono::Duration,
    ) -> Result<ActionClaim, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error("begin transaction"))?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO workflow_action_results
                (result_id, tenant, execution_id, action_name, event_id, idempotency_key, parameters)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (tenant, execution_id, action_name, idempotency_key) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(&claim.tenant)
        .bind(claim.execution_id)
        .bind(&claim.action_name)
        .bind(claim.event_id)
        .bind(&claim.idempotency_key)
        .bind(&claim.parameters)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error("claim action"))?;

        if let Some(row) = inserted {
            tx.commit().await.map_err(db_error("commit claim"))?;
            return Ok(ActionClaim::Acquired(action_from_row(&row)));
        }

        let existing = sqlx::query(
            r#"
            SELECT * FROM workflow_action_results
            WHERE tenant = $1 AND execution_id = $2 AND action_name = $3 AND idempotency_key = $4
            FOR UPDATE
            "#,
        )
        .bind(&claim.tenant)
        .bind(claim.execution_id)
        .bind(&claim.action_name)
        .bind(&claim.idempotency_key)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error("load action claim"))?;
        let existing = action_from_row(&existing);

        if existing.success {
            return Ok(ActionClaim::AlreadyCompleted(existing));
        }
        if existing.completed_at.is_none() && Utc::now() - existing.started_at < stale_after {
            return Ok(ActionClaim::InFlight(existing));
        }

        let row = sqlx::query(
            r#"
            UPDATE workflow_action_results
            SET attempt = attempt + 1, parameters = $2, event_id = $3,
                result = NULL, success = FALSE,
                started_at = NOW(), completed_at = NULL
            WHERE result_id = $1
            RETURNING *
            "#,
        )
        .bind(existing.result_id)
        .bind(&claim.parameters)
        .bind(claim.event_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error("reclaim action"))?;

        tx.commit().await.map_err(db_error("commit claim"))?;

        let record = action_from_row(&row);
        warn!(
            attempt = record.attempt,
            previous_error = record.error_message.as_deref().unwrap_or("none recorded"),
            "re-acquired action claim"
        );
        Ok(ActionClaim::Acquired(record))
    }

    async fn complete_action(
        &self,
        result_id: Uuid,
        outcome: ActionOutcome,
    ) -> Result<ActionResult, StoreError> {
        let (success, result, error_message) = match outcome {
            ActionOutcome::Succeeded(value) => (true, Some(value), None),
            ActionOutcome::Failed(message) => (false, None, Some(message)),
        };

        let row = sqlx::query(
            r#"
            UPDATE workflow_action_results
            SET success = $2, result = $3, error_message = COALESCE($4, error_message),
                completed_at = NOW()
            WHERE result_id = $1
            RETURNING *
            "#,
        )
        .bind(result_id)
        .bind(success)
        .bind(&result)
        .bind(&error_message)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("complete action"))?
        .ok_or_else(|| StoreError::not_found("action result", result_id))?;

        Ok(action_from_row(&row))
    }

    async fn list_action_results(
        &self,
        tenant: &str,
        execution_id: Uuid,
    ) -> Result<Vec<ActionResult>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM workflow_action_results
            WHERE tenant = $1 AND execution_id = $2
            ORDER BY started_at, result_id
            "#,
        )
        .bind(tenant)
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("list action results"))?;

        Ok(rows.iter().map(action_from_row).collect())
    }

    // =========================================================================
    // Task Inbox Operations
    // =========================================================================

    async fn find_task_definition(
        &self,
        tenant: &str,
        task_type: &str,
    ) -> Result<Option<TaskDefinition>, StoreError> {
        let row = sqlx::query("SELECT * FROM task_definitions WHERE tenant = $1 AND task_type = $2")
            .bind(tenant)
            .bind(task_type)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("find task definition"))?;

        Ok(row.map(|row| TaskDefinition {
            task_definition_id: row.get("task_definition_id"),
            tenant: row.get("tenant"),
            task_type: row.get("task_type"),
            name: row.get("name"),
            form_id: row.get("form_id"),
            default_priority: row.get("default_priority"),
            default_sla_days: row.get("default_sla_days"),
            created_at: row.get("created_at"),
        }))
    }

    async fn insert_task_definition(&self, definition: &TaskDefinition) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO task_definitions
                (task_definition_id, tenant, task_type, name, form_id,
                 default_priority, default_sla_days, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(definition.task_definition_id)
        .bind(&definition.tenant)
        .bind(&definition.task_type)
        .bind(&definition.name)
        .bind(&definition.form_id)
        .bind(&definition.default_priority)
        .bind(definition.default_sla_days)
        .bind(definition.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::duplicate("task definition", &definition.task_type)
            } else {
                db_error("insert task definition")(e)
            }
        })?;
        Ok(())
    }

    #[instrument(skip(self, task, history), fields(task_id = %task.task_id))]
    async fn insert_task(
        &self,
        task: &WorkflowTask,
        history: &TaskHistoryEntry,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error("begin transaction"))?;

        sqlx::query(
            r#"
            INSERT INTO workflow_tasks
                (task_id, tenant, execution_id, task_definition_id, task_type, form_id, title,
                 description, status, priority, due_date, context_data, assigned_roles,
                 assigned_users, claimed_by, response_data, draft_data, created_at, updated_at,
                 completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                    $18, $19, $20)
            "#,
        )
        .bind(task.task_id)
        .bind(&task.tenant)
        .bind(task.execution_id)
        .bind(task.task_definition_id)
        .bind(&task.task_type)
        .bind(&task.form_id)
        .bind(&task.title)
        .bind(&task.description)
        .bind(task.status.as_str())
        .bind(&task.priority)
        .bind(task.due_date)
        .bind(&task.context_data)
        .bind(&task.assigned_roles)
        .bind(&task.assigned_users)
        .bind(&task.claimed_by)
        .bind(&task.response_data)
        .bind(&task.draft_data)
        .bind(task.created_at)
        .bind(task.updated_at)
        .bind(task.completed_at)
        .execute(&mut *tx)
        .await
        .map_err(db_error("insert task"))?;

        insert_history_row(&mut tx, history).await?;

        tx.commit().await.map_err(db_error("commit task"))?;
        Ok(())
    }

    async fn get_task(
        &self,
        tenant: &str,
        task_id: Uuid,
    ) -> Result<Option<WorkflowTask>, StoreError> {
        let row = sqlx::query("SELECT * FROM workflow_tasks WHERE tenant = $1 AND task_id = $2")
            .bind(tenant)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("get task"))?;

        row.as_ref().map(task_from_row).transpose()
    }

    async fn list_tasks(
        &self,
        tenant: &str,
        filter: &TaskFilter,
    ) -> Result<Vec<WorkflowTask>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM workflow_tasks
            WHERE tenant = $1
              AND ($2::UUID IS NULL OR execution_id = $2)
              AND ($3::TEXT IS NULL OR status = $3)
              AND ($4::TEXT IS NULL OR $4 = ANY(assigned_roles))
              AND ($5::TEXT IS NULL OR $5 = ANY(assigned_users) OR claimed_by = $5)
            ORDER BY created_at
            "#,
        )
        .bind(tenant)
        .bind(filter.execution_id)
        .bind(filter.status.map(|s| s.as_str()))
        .bind(&filter.role)
        .bind(&filter.user)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("list tasks"))?;

        rows.iter().map(task_from_row).collect()
    }

    #[instrument(skip(self, task, history), fields(task_id = %task.task_id, to = %task.status))]
    async fn update_task(
        &self,
        task: &WorkflowTask,
        expected: TaskStatus,
        history: Option<&TaskHistoryEntry>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error("begin transaction"))?;

        let row = sqlx::query(
            "SELECT status FROM workflow_tasks WHERE tenant = $1 AND task_id = $2 FOR UPDATE",
        )
        .bind(&task.tenant)
        .bind(task.task_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error("lock task"))?
        .ok_or_else(|| StoreError::not_found("task", task.task_id))?;

        let actual: String = row.get("status");
        if actual != expected.as_str() {
            return Err(StoreError::StatusConflict {
                entity: "task",
                key: task.task_id.to_string(),
                expected: expected.to_string(),
                actual,
            });
        }

        sqlx::query(
            r#"
            UPDATE workflow_tasks
            SET status = $2, priority = $3, due_date = $4, assigned_roles = $5,
                assigned_users = $6, claimed_by = $7, response_data = $8, draft_data = $9,
                updated_at = $10, completed_at = $11
            WHERE task_id = $1
            "#,
        )
        .bind(task.task_id)
        .bind(task.status.as_str())
        .bind(&task.priority)
        .bind(task.due_date)
        .bind(&task.assigned_roles)
        .bind(&task.assigned_users)
        .bind(&task.claimed_by)
        .bind(&task.response_data)
        .bind(&task.draft_data)
        .bind(task.updated_at)
        .bind(task.completed_at)
        .execute(&mut *tx)
        .await
        .map_err(db_error("update task"))?;

        if let Some(history) = history {
            insert_history_row(&mut tx, history).await?;
        }

        tx.commit().await.map_err(db_error("commit task update"))?;
        Ok(())
    }

    async fn delete_task(&self, tenant: &str, task_id: Uuid) -> Result<bool, StoreError> {
        // task_history rows go with the task (ON DELETE CASCADE)
        let result = sqlx::query("DELETE FROM workflow_tasks WHERE tenant = $1 AND task_id = $2")
            .bind(tenant)
            .bind(task_id)
            .execute(&self.pool)
            .await
            .map_err(db_error("delete task"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn task_history(
        &self,
        tenant: &str,
        task_id: Uuid,
    ) -> Result<Vec<TaskHistoryEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM task_history
            WHERE tenant = $1 AND task_id = $2
            ORDER BY created_at, history_id
            "#,
        )
        .bind(tenant)
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("load task history"))?;

        rows.iter()
            .map(|row| {
                let from_status: Option<String> = row.get("from_status");
                let to_status: String = row.get("to_status");
                Ok(TaskHistoryEntry {
                    history_id: row.get("history_id"),
                    task_id: row.get("task_id"),
                    tenant: row.get("tenant"),
                    action: row.get("action"),
                    from_status: from_status
                        .map(|s| enum_column(&s, TaskStatus::parse, "task status"))
                        .transpose()?,
                    to_status: enum_column(&to_status, TaskStatus::parse, "task status")?,
                    user_id: row.get("user_id"),
                    details: row.get("details"),
                    created_at: row.get("created_at"),
                })
            })
            .collect()
    }

    // =========================================================================
    // Form Registry Operations
    // =========================================================================

    async fn insert_form(&self, form: &FormDefinition) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO form_definitions
                (form_id, tenant, version, name, description, category, status,
                 json_schema, ui_schema, default_values, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(&form.form_id)
        .bind(&form.tenant)
        .bind(&form.version)
        .bind(&form.name)
        .bind(&form.description)
        .bind(&form.category)
        .bind(form.status.as_str())
        .bind(&form.json_schema)
        .bind(&form.ui_schema)
        .bind(&form.default_values)
        .bind(form.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::duplicate("form", format!("{}@{}", form.form_id, form.version))
            } else {
                db_error("insert form")(e)
            }
        })?;
        Ok(())
    }

    async fn find_form(
        &self,
        tenant: &str,
        form_id: &str,
        version: &str,
    ) -> Result<Option<FormDefinition>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM form_definitions WHERE tenant = $1 AND form_id = $2 AND version = $3",
        )
        .bind(tenant)
        .bind(form_id)
        .bind(version)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("find form"))?;

        row.as_ref().map(form_from_row).transpose()
    }

    async fn list_form_versions(
        &self,
        tenant: &str,
        form_id: &str,
    ) -> Result<Vec<FormDefinition>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM form_definitions
            WHERE tenant = $1 AND form_id = $2
            ORDER BY created_at
            "#,
        )
        .bind(tenant)
        .bind(form_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("list form versions"))?;

        rows.iter().map(form_from_row).collect()
    }

    async fn list_forms(
        &self,
        tenant: &str,
        category: Option<&str>,
    ) -> Result<Vec<FormDefinition>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM form_definitions
            WHERE tenant = $1 AND ($2::TEXT IS NULL OR category = $2)
            ORDER BY form_id, created_at
            "#,
        )
        .bind(tenant)
        .bind(category)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("list forms"))?;

        rows.iter().map(form_from_row).collect()
    }

    async fn update_form_status(
        &self,
        tenant: &str,
        form_id: &str,
        version: &str,
        status: FormStatus,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE form_definitions SET status = $4
            WHERE tenant = $1 AND form_id = $2 AND version = $3
            "#,
        )
        .bind(tenant)
        .bind(form_id)
        .bind(version)
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_error("update form status"))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("form", format!("{form_id}@{version}")));
        }
        Ok(())
    }
}

// =============================================================================
// Statement helpers
// =============================================================================

type Tx<'a> = sqlx::Transaction<'a, sqlx::Postgres>;

async fn lock_registration(tx: &mut Tx<'_>, tenant: &str, registration_id: Uuid) -> Result<(), StoreError> {
    sqlx::query(
        "SELECT 1 FROM workflow_registrations WHERE tenant = $1 AND registration_id = $2 FOR UPDATE",
    )
    .bind(tenant)
    .bind(registration_id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(db_error("lock registration"))?
    .map(|_| ())
    .ok_or_else(|| StoreError::not_found("workflow", registration_id))
}

async fn insert_version_row(tx: &mut Tx<'_>, version: &WorkflowVersion) -> Result<(), StoreError> {
    let definition = serde_json::to_value(&version.definition)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;

    sqlx::query(
        r#"
        INSERT INTO workflow_versions
            (version_id, registration_id, version, is_current, definition, parameters, created_at)
        VALUES ($1, $2, $3, TRUE, $4, $5, $6)
        "#,
    )
    .bind(version.version_id)
    .bind(version.registration_id)
    .bind(&version.version)
    .bind(&definition)
    .bind(&version.parameters)
    .bind(version.created_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            StoreError::duplicate("workflow version", &version.version)
        } else {
            db_error("insert version")(e)
        }
    })?;
    Ok(())
}

async fn insert_event_row(tx: &mut Tx<'_>, event: &WorkflowEvent) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO workflow_events
            (event_id, execution_id, tenant, sequence, event_name, event_type,
             from_state, to_state, user_id, payload, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(event.event_id)
    .bind(event.execution_id)
    .bind(&event.tenant)
    .bind(event.sequence)
    .bind(&event.event_name)
    .bind(event.event_type.as_str())
    .bind(&event.from_state)
    .bind(&event.to_state)
    .bind(&event.user_id)
    .bind(&event.payload)
    .bind(event.created_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            StoreError::duplicate("event", event.event_id)
        } else {
            db_error("append event")(e)
        }
    })?;
    Ok(())
}

async fn insert_history_row(tx: &mut Tx<'_>, history: &TaskHistoryEntry) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO task_history
            (history_id, task_id, tenant, action, from_status, to_status, user_id, details, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(history.history_id)
    .bind(history.task_id)
    .bind(&history.tenant)
    .bind(&history.action)
    .bind(history.from_status.map(|s| s.as_str()))
    .bind(history.to_status.as_str())
    .bind(&history.user_id)
    .bind(&history.details)
    .bind(history.created_at)
    .execute(&mut **tx)
    .await
    .map_err(db_error("insert task history"))?;
    Ok(())
}

// =============================================================================
// Row mapping
// =============================================================================

fn registration_from_row(row: &PgRow) -> WorkflowRegistration {
    WorkflowRegistration {
        registration_id: row.get("registration_id"),
        tenant: row.get("tenant"),
        name: row.get("name"),
        category: row.get("category"),
        tags: row.get("tags"),
        created_at: row.get("created_at"),
    }
}

fn version_from_row(row: &PgRow) -> Result<WorkflowVersion, StoreError> {
    let definition: WorkflowDefinition = json_column(row.get("definition"))?;
    Ok(WorkflowVersion {
        version_id: row.get("version_id"),
        registration_id: row.get("registration_id"),
        version: row.get("version"),
        is_current: row.get("is_current"),
        definition,
        parameters: row.get("parameters"),
        created_at: row.get("created_at"),
    })
}

fn execution_from_row(row: &PgRow) -> Result<WorkflowExecution, StoreError> {
    let status: String = row.get("status");
    Ok(WorkflowExecution {
        execution_id: row.get("execution_id"),
        tenant: row.get("tenant"),
        workflow_name: row.get("workflow_name"),
        workflow_version_id: row.get("workflow_version_id"),
        current_state: row.get("current_state"),
        status: enum_column(&status, ExecutionStatus::parse, "execution status")?,
        context_data: row.get("context_data"),
        sequence: row.get("sequence"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn event_from_row(row: &PgRow) -> Result<WorkflowEvent, StoreError> {
    let event_type: String = row.get("event_type");
    Ok(WorkflowEvent {
        event_id: row.get("event_id"),
        execution_id: row.get("execution_id"),
        tenant: row.get("tenant"),
        sequence: row.get("sequence"),
        event_name: row.get("event_name"),
        event_type: enum_column(&event_type, EventType::parse, "event type")?,
        from_state: row.get("from_state"),
        to_state: row.get("to_state"),
        user_id: row.get("user_id"),
        payload: row.get("payload"),
        created_at: row.get("created_at"),
    })
}

fn action_from_row(row: &PgRow) -> ActionResult {
    ActionResult {
        result_id: row.get("result_id"),
        tenant: row.get("tenant"),
        execution_id: row.get("execution_id"),
        action_name: row.get("action_name"),
        event_id: row.get("event_id"),
        idempotency_key: row.get("idempotency_key"),
        parameters: row.get("parameters"),
        result: row.get("result"),
        error_message: row.get("error_message"),
        success: row.get("success"),
        attempt: row.get("attempt"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
    }
}

fn task_from_row(row: &PgRow) -> Result<WorkflowTask, StoreError> {
    let status: String = row.get("status");
    Ok(WorkflowTask {
        task_id: row.get("task_id"),
        tenant: row.get("tenant"),
        execution_id: row.get("execution_id"),
        task_definition_id: row.get("task_definition_id"),
        task_type: row.get("task_type"),
        form_id: row.get("form_id"),
        title: row.get("title"),
        description: row.get("description"),
        status: enum_column(&status, TaskStatus::parse, "task status")?,
        priority: row.get("priority"),
        due_date: row.get("due_date"),
        context_data: row.get("context_data"),
        assigned_roles: row.get("assigned_roles"),
        assigned_users: row.get("assigned_users"),
        claimed_by: row.get("claimed_by"),
        response_data: row.get("response_data"),
        draft_data: row.get("draft_data"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        completed_at: row.get("completed_at"),
    })
}

fn form_from_row(row: &PgRow) -> Result<FormDefinition, StoreError> {
    let status: String = row.get("status");
    Ok(FormDefinition {
        form_id: row.get("form_id"),
        tenant: row.get("tenant"),
        version: row.get("version"),
        name: row.get("name"),
        description: row.get("description"),
        category: row.get("category"),
        status: enum_column(&status, FormStatus::parse, "form status")?,
        json_schema: row.get("json_schema"),
        ui_schema: row.get("ui_schema"),
        default_values: row.get("default_values"),
        created_at: row.get("created_at"),
    })
}
