//! Workflow execution engine
//!
//! The engine module provides the [`ExecutionEngine`], which drives
//! executions through event replay and action dispatch, and the
//! [`WorkflowRegistry`] holding versioned definitions.

mod catalog;
mod executor;
mod registry;
mod replay;

pub use catalog::{AnyWorkflow, CatalogError, LogicCatalog, WorkflowFactory};
pub use executor::{
    CreateExecution, DeliverEvent, DeliveryOutcome, DispatchedAction, ExecutionEngine,
    ExecutorError,
};
pub use registry::{
    NewRegistration, NewTemplate, Registration, RegistryError, WorkflowRegistry,
    TEMPLATE_INITIAL_VERSION,
};
pub use replay::{fold, resolve_status, ReplayError, ReplayedState};
