//! Error taxonomy shared by every component
//!
//! Each component has its own `thiserror` enum. They all map onto
//! [`ErrorKind`] so callers can branch on the category without matching
//! every variant.

use serde::{Deserialize, Serialize};

/// Category of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad input: missing or mistyped parameters, schema violations, unhandled events
    Validation,

    /// Unknown workflow, execution, version, action, task, or form
    NotFound,

    /// Duplicate key, illegal status transition, or a lost optimistic race
    Conflict,

    /// An action handler or workflow logic failed
    ExecutionFailure,

    /// The backing store failed
    Storage,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::NotFound => write!(f, "not_found"),
            Self::Conflict => write!(f, "conflict"),
            Self::ExecutionFailure => write!(f, "execution_failure"),
            Self::Storage => write!(f, "storage"),
        }
    }
}
