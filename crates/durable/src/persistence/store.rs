//! WorkflowStore trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::forms::{FormDefinition, FormStatus};
use crate::inbox::{TaskDefinition, TaskFilter, TaskHistoryEntry, TaskStatus, WorkflowTask};
use crate::workflow::{EventRange, ExecutionStatus, WorkflowDefinition, WorkflowEvent};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Execution not found
    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    /// Any other record not found
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    /// Unique constraint violated
    #[error("{entity} already exists: {key}")]
    Duplicate { entity: &'static str, key: String },

    /// Concurrency conflict (optimistic locking failed)
    #[error("concurrency conflict: expected sequence {expected}, got {actual}")]
    ConcurrencyConflict { expected: i64, actual: i64 },

    /// Record changed status underneath the caller
    #[error("{entity} {key} is {actual}, expected {expected}")]
    StatusConflict {
        entity: &'static str,
        key: String,
        expected: String,
        actual: String,
    },

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ExecutionNotFound(_) | Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Duplicate { .. }
            | Self::ConcurrencyConflict { .. }
            | Self::StatusConflict { .. } => ErrorKind::Conflict,
            Self::Database(_) | Self::Serialization(_) => ErrorKind::Storage,
        }
    }

    pub(crate) fn not_found(entity: &'static str, key: impl ToString) -> Self {
        Self::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    pub(crate) fn duplicate(entity: &'static str, key: impl ToString) -> Self {
        Self::Duplicate {
            entity,
            key: key.to_string(),
        }
    }
}

// =============================================================================
// Workflow registry records
// =============================================================================

/// A named workflow within a tenant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRegistration {
    pub registration_id: Uuid,
    pub tenant: String,
    pub name: String,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// One version of a registration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowVersion {
    pub version_id: Uuid,
    pub registration_id: Uuid,
    pub version: String,
    pub is_current: bool,
    pub definition: WorkflowDefinition,
    pub parameters: Value,
    pub created_at: DateTime<Utc>,
}

/// Reusable starting point for new registrations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub template_id: Uuid,
    pub tenant: String,
    pub name: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub definition: WorkflowDefinition,
    pub parameters: Value,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Execution records
// =============================================================================

/// A running or finished instance of a workflow version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub execution_id: Uuid,
    pub tenant: String,
    pub workflow_name: String,
    pub workflow_version_id: Uuid,
    pub current_state: String,
    pub status: ExecutionStatus,
    pub context_data: Value,
    /// Number of events appended; also the sequence of the next event
    pub sequence: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Execution fields written together with an event append
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionUpdate {
    pub current_state: String,
    pub status: ExecutionStatus,
    pub context_data: Value,
}

/// Filter for listing executions
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub workflow_name: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub limit: Option<u32>,
}

/// Folded state at a point in the log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    pub execution_id: Uuid,
    pub tenant: String,
    /// Sequence of the last event folded into this snapshot
    pub sequence: i64,
    pub state: String,
    pub status: ExecutionStatus,
    pub context_data: Value,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Action log records
// =============================================================================

/// One recorded attempt to run an action under an idempotency key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub result_id: Uuid,
    pub tenant: String,
    pub execution_id: Uuid,
    pub action_name: String,
    pub event_id: Option<Uuid>,
    pub idempotency_key: String,
    pub parameters: Value,
    pub result: Option<Value>,
    /// Most recent failure; kept across retries and a later success
    pub error_message: Option<String>,
    pub success: bool,
    pub attempt: i32,
    pub started_at: DateTime<Utc>,
    /// `None` while the claim is in flight
    pub completed_at: Option<DateTime<Utc>>,
}

/// Request to claim an idempotency key
#[derive(Debug, Clone)]
pub struct NewActionClaim {
    pub tenant: String,
    pub execution_id: Uuid,
    pub action_name: String,
    pub event_id: Option<Uuid>,
    pub idempotency_key: String,
    pub parameters: Value,
}

/// Outcome of claiming an idempotency key
#[derive(Debug, Clone, PartialEq)]
pub enum ActionClaim {
    /// Caller owns the record and must complete it
    Acquired(ActionResult),

    /// A successful result already exists
    AlreadyCompleted(ActionResult),

    /// Another writer holds a fresh claim
    InFlight(ActionResult),
}

/// How a claimed action finished
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    Succeeded(Value),
    Failed(String),
}

/// Store for every durable record the engine owns
///
/// All lookups are tenant-scoped. Implementations must be thread-safe and
/// make each method atomic.
#[async_trait]
pub trait WorkflowStore: Send + Sync + 'static {
    // =========================================================================
    // Workflow Registry Operations
    // =========================================================================

    /// Insert a registration with its first (current) version
    ///
    /// Fails with `Duplicate` when `(tenant, name)` exists.
    async fn insert_registration(
        &self,
        registration: &WorkflowRegistration,
        version: &WorkflowVersion,
    ) -> Result<(), StoreError>;

    /// Add a version and make it current in one step
    ///
    /// Fails with `Duplicate` when the version string exists.
    async fn insert_version(
        &self,
        tenant: &str,
        version: &WorkflowVersion,
    ) -> Result<(), StoreError>;

    async fn find_registration(
        &self,
        tenant: &str,
        registration_id: Uuid,
    ) -> Result<Option<WorkflowRegistration>, StoreError>;

    async fn find_registration_by_name(
        &self,
        tenant: &str,
        name: &str,
    ) -> Result<Option<WorkflowRegistration>, StoreError>;

    async fn list_registrations(&self, tenant: &str)
        -> Result<Vec<WorkflowRegistration>, StoreError>;

    /// Versions of a registration, oldest first
    async fn list_versions(
        &self,
        tenant: &str,
        registration_id: Uuid,
    ) -> Result<Vec<WorkflowVersion>, StoreError>;

    async fn find_version(
        &self,
        tenant: &str,
        version_id: Uuid,
    ) -> Result<Option<WorkflowVersion>, StoreError>;

    /// Flip `is_current` to the named version, clearing it everywhere else
    async fn set_current_version(
        &self,
        tenant: &str,
        registration_id: Uuid,
        version: &str,
    ) -> Result<(), StoreError>;

    async fn insert_template(&self, template: &WorkflowTemplate) -> Result<(), StoreError>;

    async fn find_template(
        &self,
        tenant: &str,
        template_id: Uuid,
    ) -> Result<Option<WorkflowTemplate>, StoreError>;

    // =========================================================================
    // Execution Operations
    // =========================================================================

    /// Create an execution together with its first event
    async fn create_execution(
        &self,
        execution: &WorkflowExecution,
        first_event: &WorkflowEvent,
    ) -> Result<(), StoreError>;

    async fn get_execution(
        &self,
        tenant: &str,
        execution_id: Uuid,
    ) -> Result<Option<WorkflowExecution>, StoreError>;

    async fn list_executions(
        &self,
        tenant: &str,
        filter: &ExecutionFilter,
    ) -> Result<Vec<WorkflowExecution>, StoreError>;

    /// Append one event and update the execution atomically
    ///
    /// `event.sequence` must equal the execution's current `sequence`
    /// (optimistic concurrency); a duplicate `event_id` fails with `Duplicate`.
    async fn append_event(
        &self,
        event: &WorkflowEvent,
        update: &ExecutionUpdate,
    ) -> Result<(), StoreError>;

    /// Events in `range`, ordered by sequence
    async fn load_events(
        &self,
        tenant: &str,
        execution_id: Uuid,
        range: EventRange,
    ) -> Result<Vec<WorkflowEvent>, StoreError>;

    async fn find_event(
        &self,
        tenant: &str,
        execution_id: Uuid,
        event_id: Uuid,
    ) -> Result<Option<WorkflowEvent>, StoreError>;

    async fn save_snapshot(&self, snapshot: &ExecutionSnapshot) -> Result<(), StoreError>;

    /// Latest snapshot with `sequence <= at_or_before` (or the latest overall)
    async fn latest_snapshot(
        &self,
        tenant: &str,
        execution_id: Uuid,
        at_or_before: Option<i64>,
    ) -> Result<Option<ExecutionSnapshot>, StoreError>;

    // =========================================================================
    // Action Log Operations
    // =========================================================================

    /// Claim an idempotency key
    ///
    /// Failed records and in-flight claims older than `stale_after` are
    /// re-acquired with `attempt + 1`.
    async fn claim_action(
        &self,
        claim: &NewActionClaim,
        stale_after: chrono::Duration,
    ) -> Result<ActionClaim, StoreError>;

    async fn complete_action(
        &self,
        result_id: Uuid,
        outcome: ActionOutcome,
    ) -> Result<ActionResult, StoreError>;

    async fn list_action_results(
        &self,
        tenant: &str,
        execution_id: Uuid,
    ) -> Result<Vec<ActionResult>, StoreError>;

    // =========================================================================
    // Task Inbox Operations
    // =========================================================================

    async fn find_task_definition(
        &self,
        tenant: &str,
        task_type: &str,
    ) -> Result<Option<TaskDefinition>, StoreError>;

    /// Fails with `Duplicate` when `(tenant, task_type)` exists
    async fn insert_task_definition(&self, definition: &TaskDefinition) -> Result<(), StoreError>;

    /// Insert a task with its first history entry
    async fn insert_task(
        &self,
        task: &WorkflowTask,
        history: &TaskHistoryEntry,
    ) -> Result<(), StoreError>;

    async fn get_task(&self, tenant: &str, task_id: Uuid)
        -> Result<Option<WorkflowTask>, StoreError>;

    async fn list_tasks(
        &self,
        tenant: &str,
        filter: &TaskFilter,
    ) -> Result<Vec<WorkflowTask>, StoreError>;

    /// Persist the task's mutable fields if its stored status is `expected`
    ///
    /// Appends `history` in the same step. Fails with `StatusConflict` when
    /// another writer moved the task first.
    async fn update_task(
        &self,
        task: &WorkflowTask,
        expected: TaskStatus,
        history: Option<&TaskHistoryEntry>,
    ) -> Result<(), StoreError>;

    /// Remove a task and its history
    ///
    /// Used to withdraw a task whose creation never reached its execution.
    /// Returns false when no such task exists.
    async fn delete_task(&self, tenant: &str, task_id: Uuid) -> Result<bool, StoreError>;

    /// History entries, oldest first
    async fn task_history(
        &self,
        tenant: &str,
        task_id: Uuid,
    ) -> Result<Vec<TaskHistoryEntry>, StoreError>;

    // =========================================================================
    // Form Registry Operations
    // =========================================================================

    /// Fails with `Duplicate` when `(tenant, form_id, version)` exists
    async fn insert_form(&self, form: &FormDefinition) -> Result<(), StoreError>;

    async fn find_form(
        &self,
        tenant: &str,
        form_id: &str,
        version: &str,
    ) -> Result<Option<FormDefinition>, StoreError>;

    /// Every version of a form, oldest first
    async fn list_form_versions(
        &self,
        tenant: &str,
        form_id: &str,
    ) -> Result<Vec<FormDefinition>, StoreError>;

    async fn list_forms(
        &self,
        tenant: &str,
        category: Option<&str>,
    ) -> Result<Vec<FormDefinition>, StoreError>;

    async fn update_form_status(
        &self,
        tenant: &str,
        form_id: &str,
        version: &str,
        status: FormStatus,
    ) -> Result<(), StoreError>;
}
