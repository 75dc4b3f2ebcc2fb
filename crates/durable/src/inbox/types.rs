//! Task inbox records and requests

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Task status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Claimed,
    Completed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Claimed => "CLAIMED",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "CLAIMED" => Some(Self::Claimed),
            "COMPLETED" => Some(Self::Completed),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::Claimed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared defaults for every task of one type within a tenant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub task_definition_id: Uuid,
    pub tenant: String,
    pub task_type: String,
    pub name: String,
    pub form_id: String,
    pub default_priority: String,
    pub default_sla_days: i32,
    pub created_at: DateTime<Utc>,
}

/// Normalized assignment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub roles: Vec<String>,
    pub users: Vec<String>,
}

impl Assignment {
    /// Normalize a raw `assignTo` value
    ///
    /// Accepts `{roles, users}` where each entry is a string (one-element
    /// list), an array (string elements kept), or anything else (empty).
    /// Never fails.
    pub fn from_value(raw: Option<&Value>) -> Self {
        let Some(Value::Object(raw)) = raw else {
            return Self::default();
        };
        Self {
            roles: string_list(raw.get("roles")),
            users: string_list(raw.get("users")),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty() && self.users.is_empty()
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

/// A human-actionable work item bound to an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTask {
    pub task_id: Uuid,
    pub tenant: String,
    pub execution_id: Uuid,
    pub task_definition_id: Uuid,
    pub task_type: String,
    pub form_id: String,
    pub title: String,
    pub description: Option<String>,
    pub status: TaskStatus,
    pub priority: String,
    pub due_date: Option<DateTime<Utc>>,
    pub context_data: Value,
    pub assigned_roles: Vec<String>,
    pub assigned_users: Vec<String>,
    pub claimed_by: Option<String>,
    pub response_data: Option<Value>,
    pub draft_data: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Audit entry for a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskHistoryEntry {
    pub history_id: Uuid,
    pub task_id: Uuid,
    pub tenant: String,
    pub action: String,
    pub from_status: Option<TaskStatus>,
    pub to_status: TaskStatus,
    pub user_id: Option<String>,
    pub details: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl TaskHistoryEntry {
    pub(crate) fn record(
        task: &WorkflowTask,
        action: &str,
        from_status: Option<TaskStatus>,
        user_id: Option<&str>,
        details: Option<Value>,
    ) -> Self {
        Self {
            history_id: Uuid::now_v7(),
            task_id: task.task_id,
            tenant: task.tenant.clone(),
            action: action.to_string(),
            from_status,
            to_status: task.status,
            user_id: user_id.map(str::to_string),
            details,
            created_at: Utc::now(),
        }
    }
}

/// Input for [`TaskInboxService::create_task`](super::TaskInboxService::create_task)
///
/// Field names accept the camelCase spelling used by workflow definitions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskRequest {
    pub task_type: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub due_date: Option<DateTime<Utc>>,
    /// Raw `{roles, users}` value; see [`Assignment::from_value`]
    #[serde(default)]
    pub assign_to: Option<Value>,
    #[serde(default)]
    pub context_data: Option<Value>,
    #[serde(default)]
    pub form_id: Option<String>,
}

impl CreateTaskRequest {
    pub fn new(task_type: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn with_form(mut self, form_id: impl Into<String>) -> Self {
        self.form_id = Some(form_id.into());
        self
    }

    pub fn with_assign_to(mut self, assign_to: Value) -> Self {
        self.assign_to = Some(assign_to);
        self
    }

    pub fn with_due_date(mut self, due_date: DateTime<Utc>) -> Self {
        self.due_date = Some(due_date);
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context_data = Some(context);
        self
    }

    pub fn with_priority(mut self, priority: impl Into<String>) -> Self {
        self.priority = Some(priority.into());
        self
    }
}

/// Filter for listing tasks
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub execution_id: Option<Uuid>,
    pub status: Option<TaskStatus>,
    /// Tasks assigned to this role
    pub role: Option<String>,
    /// Tasks assigned to or claimed by this user
    pub user: Option<String>,
}

impl TaskFilter {
    pub fn matches(&self, task: &WorkflowTask) -> bool {
        self.execution_id.map_or(true, |id| task.execution_id == id)
            && self.status.map_or(true, |s| task.status == s)
            && self
                .role
                .as_ref()
                .map_or(true, |r| task.assigned_roles.contains(r))
            && self.user.as_ref().map_or(true, |u| {
                task.assigned_users.contains(u) || task.claimed_by.as_ref() == Some(u)
            })
    }
}
