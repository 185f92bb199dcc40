//! State machine and collaborative state machine classes.
//!
//! Classes are built once from descriptions and shared immutably between all
//! instances created from them.

mod builder;
mod collaborative;
mod machine;
mod state;
mod transition;

pub use builder::StateMachineClassBuilder;
pub use collaborative::{
    CollaborativeStateMachineClass, CollaborativeStateMachineClassBuilder, RoutingEdge,
};
pub use machine::StateMachineClass;
pub use state::{StateClass, StateId};
pub use transition::{TransitionClass, TransitionId};
