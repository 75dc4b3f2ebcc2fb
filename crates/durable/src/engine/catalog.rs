//! Catalog of workflow logic for type-erased construction
//!
//! The catalog maps a definition's `workflow_type` to a factory that builds
//! the logic from the definition's JSON config without knowing the concrete
//! type at runtime.

use std::collections::HashMap;
use std::fmt;

use serde_json::Value;

use crate::workflow::{
    InboundEvent, StateMachine, StateView, Transition, Workflow, WorkflowDefinition, WorkflowError,
};

/// Type-erased workflow interface
///
/// This trait allows the engine to work with workflows without knowing
/// their concrete types.
pub trait AnyWorkflow: Send + Sync {
    /// Get the workflow type identifier
    fn workflow_type(&self) -> &'static str;

    /// State a new execution starts in
    fn initial_state(&self) -> String;

    /// Handle an event
    fn on_event(
        &self,
        view: &StateView<'_>,
        event: &InboundEvent,
    ) -> Result<Option<Transition>, WorkflowError>;
}

/// Wrapper to implement AnyWorkflow for any Workflow
struct WorkflowWrapper<W: Workflow> {
    inner: W,
}

impl<W: Workflow> AnyWorkflow for WorkflowWrapper<W> {
    fn workflow_type(&self) -> &'static str {
        W::TYPE
    }

    fn initial_state(&self) -> String {
        self.inner.initial_state()
    }

    fn on_event(
        &self,
        view: &StateView<'_>,
        event: &InboundEvent,
    ) -> Result<Option<Transition>, WorkflowError> {
        self.inner.on_event(view, event)
    }
}

/// Factory function type for building logic from a JSON config
pub type WorkflowFactory =
    Box<dyn Fn(Value) -> Result<Box<dyn AnyWorkflow>, CatalogError> + Send + Sync>;

/// Catalog of workflow factories
///
/// [`StateMachine`] is registered by default.
pub struct LogicCatalog {
    factories: HashMap<String, WorkflowFactory>,
}

impl Default for LogicCatalog {
    fn default() -> Self {
        let mut catalog = Self::empty();
        catalog.register::<StateMachine>();
        catalog
    }
}

impl LogicCatalog {
    /// Catalog with the built-in logic registered
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with nothing registered
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a workflow type
    ///
    /// # Example
    ///
    /// ```ignore
    /// let mut catalog = LogicCatalog::new();
    /// catalog.register::<InvoiceApproval>();
    /// ```
    pub fn register<W: Workflow>(&mut self) {
        let factory: WorkflowFactory = Box::new(|config: Value| {
            let typed: W::Config =
                serde_json::from_value(config).map_err(CatalogError::Deserialization)?;
            let workflow = W::new(typed).map_err(CatalogError::InvalidConfig)?;
            Ok(Box::new(WorkflowWrapper { inner: workflow }) as Box<dyn AnyWorkflow>)
        });

        self.factories.insert(W::TYPE.to_string(), factory);
    }

    /// Check if a workflow type is registered
    pub fn contains(&self, workflow_type: &str) -> bool {
        self.factories.contains_key(workflow_type)
    }

    /// Build logic for a definition
    pub fn build(&self, definition: &WorkflowDefinition) -> Result<Box<dyn AnyWorkflow>, CatalogError> {
        let factory = self
            .factories
            .get(&definition.workflow_type)
            .ok_or_else(|| CatalogError::UnknownWorkflowType(definition.workflow_type.clone()))?;

        factory(definition.config.clone())
    }

    /// Get the number of registered workflow types
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Check if catalog is empty
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Get all registered workflow type names
    pub fn workflow_types(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(|s| s.as_str())
    }
}

impl fmt::Debug for LogicCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogicCatalog")
            .field("workflow_types", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Errors from catalog operations
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// Workflow type not registered
    #[error("unknown workflow type: {0}")]
    UnknownWorkflowType(String),

    /// Failed to deserialize the definition config
    #[error("failed to deserialize workflow config: {0}")]
    Deserialization(#[source] serde_json::Error),

    /// Config parsed but the logic rejected it
    #[error("invalid workflow config: {0}")]
    InvalidConfig(#[source] WorkflowError),
}
