//! # Opsflow Workflow Engine
//!
//! An event-sourced workflow engine for business processes that mix
//! automated steps with human decisions.
//!
//! ## Features
//!
//! - **Versioned definitions**: workflows are registered by name and version, with templates
//! - **Event-sourced executions**: every change is an appended event; state is rebuilt by replay
//! - **Idempotent actions**: side effects run at most once per idempotency key
//! - **Task inbox**: human work items bound to executions, validated against versioned forms
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     TaskInboxService                         │
//! │  (human tasks; emits task_* events into executions)         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ExecutionEngine                         │
//! │  (replays history, applies workflow logic, dispatches       │
//! │   actions through the ActionRegistry)                       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkflowStore                          │
//! │  (PostgreSQL or in-memory: registry, events, actions,       │
//! │   tasks, forms)                                              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use opsflow_durable::prelude::*;
//!
//! let store = Arc::new(InMemoryWorkflowStore::new());
//! let registry = Arc::new(WorkflowRegistry::new(Arc::clone(&store)));
//! let actions = Arc::new(ActionRegistry::new(Arc::clone(&store)));
//! let engine = ExecutionEngine::new(Arc::clone(&store), registry.clone(), actions, EngineConfig::default());
//!
//! registry
//!     .register("acme", NewRegistration::new(
//!         "invoice_approval",
//!         "1.0.0",
//!         WorkflowDefinition::new("state_machine", json!({
//!             "initial_state": "draft",
//!             "states": {
//!                 "draft": { "on": { "submit": { "target": "approved" } } },
//!                 "approved": { "status": "completed" }
//!             }
//!         })),
//!     ))
//!     .await?;
//!
//! let id = engine
//!     .create_execution("acme", CreateExecution::new("invoice_approval", json!({"amount": 120})))
//!     .await?;
//! let outcome = engine
//!     .deliver_event("acme", DeliverEvent::external(id, "submit", json!({})))
//!     .await?;
//! assert_eq!(outcome.status, ExecutionStatus::Completed);
//! ```

pub mod action;
pub mod config;
pub mod engine;
pub mod error;
pub mod forms;
pub mod inbox;
pub mod persistence;
pub mod telemetry;
pub mod workflow;

/// Prelude for convenient imports
pub mod prelude {
    pub use std::sync::Arc;

    pub use serde_json::json;

    pub use crate::action::{
        handler_fn, ActionContext, ActionError, ActionHandler, ActionRegistry, HandlerError,
        ParamSpec, ParamType,
    };
    pub use crate::config::{DatabaseConfig, EngineConfig};
    pub use crate::engine::{
        CreateExecution, DeliverEvent, DeliveryOutcome, ExecutionEngine, ExecutorError,
        LogicCatalog, NewRegistration, NewTemplate, WorkflowRegistry,
    };
    pub use crate::error::ErrorKind;
    pub use crate::forms::{FormError, FormRegistry, FormStatus, NewForm};
    pub use crate::inbox::{
        register_inbox_actions, CreateTaskRequest, InboxError, TaskFilter, TaskInboxService,
        TaskStatus,
    };
    pub use crate::persistence::{
        InMemoryWorkflowStore, PostgresWorkflowStore, StoreError, WorkflowStore,
    };
    pub use crate::workflow::{
        EventRange, EventType, ExecutionStatus, InboundEvent, StateView, Transition, Workflow,
        WorkflowDefinition, WorkflowError,
    };
}

// Re-export key types at crate root
pub use action::{ActionContext, ActionError, ActionRegistry};
pub use config::{DatabaseConfig, EngineConfig};
pub use engine::{ExecutionEngine, ExecutorError, WorkflowRegistry};
pub use error::ErrorKind;
pub use forms::{FormError, FormRegistry};
pub use inbox::{InboxError, TaskInboxService};
pub use persistence::{InMemoryWorkflowStore, PostgresWorkflowStore, StoreError, WorkflowStore};
pub use telemetry::{init_telemetry, TelemetryConfig};
pub use workflow::{ExecutionStatus, Workflow, WorkflowError, WorkflowEvent};
