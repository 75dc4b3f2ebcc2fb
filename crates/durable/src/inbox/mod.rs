//! Task inbox
//!
//! Tasks are human work items owned by an execution. Creating, claiming,
//! releasing, completing and cancelling a task each append a `task_*`
//! event to that execution.

mod action;
mod service;
mod types;

pub use action::{register_inbox_actions, CREATE_HUMAN_TASK};
pub use service::{InboxError, TaskInboxService};
pub use types::{
    Assignment, CreateTaskRequest, TaskDefinition, TaskFilter, TaskHistoryEntry, TaskStatus,
    WorkflowTask,
};
