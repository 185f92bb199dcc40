//! # cirrina-core
//!
//! Core types for cirrina collaborative state machines.
//!
//! This crate provides:
//! - Descriptions of collaborative state machines (JSON/YAML)
//! - A small expression language used by guards and variable values
//! - Layered contexts and extents for variable resolution
//! - Events, actions and action graphs
//! - Class builders with state machine inheritance and event routing

pub mod action;
pub mod class;
pub mod context;
pub mod description;
pub mod error;
pub mod event;
pub mod expression;
pub mod extent;
pub mod guard;

pub use action::{Action, ActionGraph, ActionKind, ActionStep, NamedAction};
pub use class::{
    CollaborativeStateMachineClass, CollaborativeStateMachineClassBuilder, RoutingEdge,
    StateClass, StateId, StateMachineClass, StateMachineClassBuilder, TransitionClass,
    TransitionId,
};
pub use context::{Context, ContextVariable, InMemoryContext, VariableValue};
pub use description::CollaborativeStateMachineDescription;
pub use error::CoreError;
pub use event::{Event, EventChannel};
pub use expression::{EmptyScope, Expression, Scope};
pub use extent::Extent;
pub use guard::{Guard, GuardEvaluator};
