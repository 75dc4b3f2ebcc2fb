//! Workflow trait definition

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use super::{InboundEvent, Transition};

/// Error raised by workflow logic
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkflowError {
    /// Error message
    pub message: String,

    /// Error code for programmatic handling
    pub code: Option<String>,
}

impl WorkflowError {
    /// Create a new workflow error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    /// Set the error code
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} ({})", self.message, code),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for WorkflowError {}

/// Execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Waiting for or processing events
    Active,

    /// Finished successfully
    Completed,

    /// Logic or an action failed; corrective events are still accepted
    Failed,

    /// Finished with a negative outcome
    Rejected,
}

impl ExecutionStatus {
    /// Terminal executions accept no further events
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Rejected)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a registered workflow version stores as its logic
///
/// `workflow_type` selects logic from the engine's catalog; `config` is
/// handed to that logic's constructor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowDefinition {
    pub workflow_type: String,
    #[serde(default)]
    pub config: Value,
}

impl WorkflowDefinition {
    pub fn new(workflow_type: impl Into<String>, config: Value) -> Self {
        Self {
            workflow_type: workflow_type.into(),
            config,
        }
    }
}

/// Read-only view of an execution handed to the logic
#[derive(Debug, Clone, Copy)]
pub struct StateView<'a> {
    pub state: &'a str,
    pub status: ExecutionStatus,
    pub context: &'a Value,
}

/// A workflow is a deterministic state machine driven by events
///
/// Given the same state and event, `on_event` must return the same
/// transition. Replay relies on this: the engine re-runs the logic over the
/// recorded history and checks every recomputed `to_state` against the log.
///
/// # Example
///
/// ```ignore
/// use opsflow_durable::prelude::*;
///
/// struct Approval { threshold: f64 }
///
/// impl Workflow for Approval {
///     const TYPE: &'static str = "approval";
///     type Config = ApprovalConfig;
///
///     fn new(config: Self::Config) -> Result<Self, WorkflowError> {
///         Ok(Self { threshold: config.threshold })
///     }
///
///     fn initial_state(&self) -> String {
///         "draft".into()
///     }
///
///     fn on_event(
///         &self,
///         view: &StateView<'_>,
///         event: &InboundEvent,
///     ) -> Result<Option<Transition>, WorkflowError> {
///         match (view.state, event.name.as_str()) {
///             ("draft", "submit") => Ok(Some(Transition::to("submitted"))),
///             _ => Ok(None),
///         }
///     }
/// }
/// ```
pub trait Workflow: Send + Sync + 'static {
    /// Unique type identifier
    ///
    /// Stored in every [`WorkflowDefinition`] that uses this logic.
    const TYPE: &'static str;

    /// Configuration deserialized from the definition's `config`
    type Config: DeserializeOwned + Send;

    /// Build the logic; reject invalid configuration here
    fn new(config: Self::Config) -> Result<Self, WorkflowError>
    where
        Self: Sized;

    /// State a new execution starts in
    fn initial_state(&self) -> String;

    /// Handle an event
    ///
    /// `Ok(None)` means the event is not handled in the current state.
    fn on_event(
        &self,
        view: &StateView<'_>,
        event: &InboundEvent,
    ) -> Result<Option<Transition>, WorkflowError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Rejected.is_terminal());
        assert!(!ExecutionStatus::Failed.is_terminal());
        assert!(!ExecutionStatus::Active.is_terminal());
    }

    #[test]
    fn test_error_display() {
        let err = WorkflowError::new("amount missing").with_code("missing_field");
        assert_eq!(err.to_string(), "amount missing (missing_field)");
    }
}
