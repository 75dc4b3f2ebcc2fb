//! Form registry and JSON Schema validation
//!
//! Forms describe the data a human submits when resolving a task. Each
//! version is immutable once stored; only its status moves forward.

mod definition;
mod registry;
pub mod schema;

pub use definition::{FormDefinition, FormOverrides, FormStatus, NewForm};
pub use registry::{FormError, FormRegistry};
pub use schema::{validate, validate_partial, FieldError, ValidationReport};
