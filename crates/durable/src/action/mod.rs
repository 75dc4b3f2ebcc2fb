//! Action abstractions
//!
//! Actions are the side effects workflows request. They:
//! - Are registered by name with declared parameters
//! - Run at most once per idempotency key to a successful outcome
//! - Leave a recorded result for every attempt

mod context;
mod definition;
mod registry;

pub use context::{idempotency_key, ActionContext};
pub use definition::{
    handler_fn, ActionDescriptor, ActionHandler, FnHandler, HandlerError, ParamSpec, ParamType,
};
pub use registry::{ActionError, ActionRegistry};
