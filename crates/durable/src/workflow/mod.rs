//! Workflow abstractions and types
//!
//! This module contains the core workflow primitives:
//! - [`Workflow`] trait for defining workflow state machines
//! - [`Transition`] and [`ActionRequest`] returned by the logic
//! - [`WorkflowEvent`] records persisted per execution
//! - [`StateMachine`], the declarative built-in logic

mod action;
mod definition;
mod event;
pub mod state_machine;

pub use action::{merge_objects, ActionRequest, ContextUpdate, Transition};
pub use definition::{ExecutionStatus, StateView, Workflow, WorkflowDefinition, WorkflowError};
pub use event::{names, EventRange, EventType, InboundEvent, WorkflowEvent};
pub use state_machine::{StateMachine, StateMachineConfig};
