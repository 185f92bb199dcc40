//! Transition classes.

use super::state::StateId;
use crate::action::{ActionGraph, NamedAction};
use crate::guard::Guard;

/// Index of a transition within its state machine class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransitionId(pub(crate) usize);

impl TransitionId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// An edge between two states.
///
/// Transitions with an event are taken when that event is handled; those
/// without are "always" transitions evaluated after entering the source.
/// A transition without a target is internal: taking it runs its actions
/// and leaves the source state active without exiting it.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionClass {
    pub(crate) event: Option<String>,
    pub(crate) source: StateId,
    pub(crate) target: Option<StateId>,
    pub(crate) guards: Vec<Guard>,
    pub(crate) actions: ActionGraph,
    pub(crate) else_target: Option<StateId>,
}

impl TransitionClass {
    pub fn event(&self) -> Option<&str> {
        self.event.as_deref()
    }

    pub fn is_event_triggered(&self) -> bool {
        self.event.is_some()
    }

    pub fn source(&self) -> StateId {
        self.source
    }

    pub fn target(&self) -> Option<StateId> {
        self.target
    }

    pub fn is_internal(&self) -> bool {
        self.target.is_none()
    }

    pub fn guards(&self) -> &[Guard] {
        &self.guards
    }

    pub fn actions(&self) -> &ActionGraph {
        &self.actions
    }

    /// State entered instead when the guards do not pass.
    pub fn else_target(&self) -> Option<StateId> {
        self.else_target
    }

    /// Copies the transition with named guards and actions re-resolved and
    /// endpoints replaced.
    pub(crate) fn rebind(
        &self,
        source: StateId,
        target: Option<StateId>,
        else_target: Option<StateId>,
        named_guards: &[Guard],
        named_actions: &[NamedAction],
    ) -> TransitionClass {
        TransitionClass {
            event: self.event.clone(),
            source,
            target,
            guards: self
                .guards
                .iter()
                .map(|guard| guard.rebind(named_guards))
                .collect(),
            actions: self.actions.rebind(named_actions),
            else_target,
        }
    }
}
