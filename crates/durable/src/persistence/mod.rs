//! Persistence layer for the workflow engine
//!
//! This module provides:
//! - [`WorkflowStore`] trait for every durable record the engine owns
//! - [`InMemoryWorkflowStore`] for testing and single-process use
//! - [`PostgresWorkflowStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryWorkflowStore;
pub use postgres::PostgresWorkflowStore;
pub use store::{
    ActionClaim, ActionOutcome, ActionResult, ExecutionFilter, ExecutionSnapshot, ExecutionUpdate,
    NewActionClaim, StoreError, WorkflowExecution, WorkflowRegistration, WorkflowStore,
    WorkflowTemplate, WorkflowVersion,
};
