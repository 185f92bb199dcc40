//! State machine classes.
//!
//! A state machine class is a directed multigraph of states over
//! transitions, stored as arenas indexed by [`StateId`] and
//! [`TransitionId`] with an outgoing adjacency list per state.

use super::state::{StateClass, StateId};
use super::transition::{TransitionClass, TransitionId};
use crate::action::{Action, NamedAction};
use crate::context::ContextVariable;
use crate::error::CoreError;
use crate::event::EventChannel;
use crate::guard::Guard;
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::Arc;

/// An immutable, validated state machine class.
#[derive(Debug, Clone)]
pub struct StateMachineClass {
    pub(crate) name: String,
    pub(crate) is_abstract: bool,
    pub(crate) base: Option<String>,
    pub(crate) states: Vec<StateClass>,
    pub(crate) transitions: Vec<TransitionClass>,
    pub(crate) outgoing: Vec<Vec<TransitionId>>,
    pub(crate) named_actions: Vec<NamedAction>,
    pub(crate) named_guards: Vec<Guard>,
    pub(crate) local_context: Vec<ContextVariable>,
    pub(crate) persistent_context: Vec<ContextVariable>,
    pub(crate) nested: Vec<Arc<StateMachineClass>>,
}

impl StateMachineClass {
    pub(crate) fn empty(name: &str, is_abstract: bool, base: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            is_abstract,
            base,
            states: Vec::new(),
            transitions: Vec::new(),
            outgoing: Vec::new(),
            named_actions: Vec::new(),
            named_guards: Vec::new(),
            local_context: Vec::new(),
            persistent_context: Vec::new(),
            nested: Vec::new(),
        }
    }

    // =========================================================================
    // Graph Construction
    // =========================================================================

    pub(crate) fn add_state(&mut self, state: StateClass) -> Result<StateId, CoreError> {
        if self.find_state(&state.name).is_some() {
            return Err(CoreError::InvalidDefinition {
                reason: format!("duplicate state '{}' in '{}'", state.name, self.name),
            });
        }
        self.states.push(state);
        self.outgoing.push(Vec::new());
        Ok(StateId(self.states.len() - 1))
    }

    pub(crate) fn add_transition(&mut self, transition: TransitionClass) -> TransitionId {
        let id = TransitionId(self.transitions.len());
        self.outgoing[transition.source.0].push(id);
        self.transitions.push(transition);
        id
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this class is abstract. Never inherited from the base.
    pub fn is_abstract(&self) -> bool {
        self.is_abstract
    }

    pub fn base_name(&self) -> Option<&str> {
        self.base.as_deref()
    }

    pub fn states(&self) -> impl Iterator<Item = (StateId, &StateClass)> {
        self.states
            .iter()
            .enumerate()
            .map(|(index, state)| (StateId(index), state))
    }

    pub fn state_count(&self) -> usize {
        self.states.len()
    }

    /// Returns a state by id. Ids always come from this class.
    pub fn state(&self, id: StateId) -> &StateClass {
        &self.states[id.0]
    }

    pub fn find_state(&self, name: &str) -> Option<StateId> {
        self.states
            .iter()
            .position(|state| state.name == name)
            .map(StateId)
    }

    pub fn find_state_class_by_name(&self, name: &str) -> Option<&StateClass> {
        self.find_state(name).map(|id| self.state(id))
    }

    /// Returns the initial state.
    pub fn initial_state(&self) -> Option<StateId> {
        self.states
            .iter()
            .position(|state| state.initial)
            .map(StateId)
    }

    pub fn transitions(&self) -> impl Iterator<Item = (TransitionId, &TransitionClass)> {
        self.transitions
            .iter()
            .enumerate()
            .map(|(index, transition)| (TransitionId(index), transition))
    }

    pub fn transition(&self, id: TransitionId) -> &TransitionClass {
        &self.transitions[id.0]
    }

    /// Outgoing transitions of a state, in declaration order.
    pub fn outgoing(&self, state: StateId) -> impl Iterator<Item = (TransitionId, &TransitionClass)> {
        self.outgoing[state.0]
            .iter()
            .map(move |id| (*id, &self.transitions[id.0]))
    }

    /// Event-triggered transitions of a state for an event name.
    pub fn find_on_transitions(
        &self,
        state: StateId,
        event: &str,
    ) -> impl Iterator<Item = (TransitionId, &TransitionClass)> {
        let event = event.to_string();
        self.outgoing(state)
            .filter(move |(_, transition)| transition.event.as_deref() == Some(event.as_str()))
    }

    /// Transitions of a state taken without an event.
    pub fn find_always_transitions(
        &self,
        state: StateId,
    ) -> impl Iterator<Item = (TransitionId, &TransitionClass)> {
        self.outgoing(state)
            .filter(|(_, transition)| transition.event.is_none())
    }

    /// Names of events this class handles.
    pub fn input_events(&self) -> BTreeSet<String> {
        self.transitions
            .iter()
            .filter_map(|transition| transition.event.clone())
            .collect()
    }

    /// Events this class may raise, including invoke completion events.
    pub fn output_events(&self) -> Vec<(String, EventChannel)> {
        let mut raised = Vec::new();
        let state_actions = self.states.iter().flat_map(|state| {
            state
                .entry
                .actions()
                .chain(state.exit.actions())
                .chain(state.while_actions.actions())
                .chain(state.after.actions())
        });
        let transition_actions = self
            .transitions
            .iter()
            .flat_map(|transition| transition.actions.actions());
        for action in state_actions.chain(transition_actions) {
            action.collect_raised_events(&mut raised);
        }

        let mut seen = HashSet::new();
        raised.retain(|entry| seen.insert(entry.clone()));
        raised
    }

    pub fn named_actions(&self) -> &[NamedAction] {
        &self.named_actions
    }

    pub fn named_guards(&self) -> &[Guard] {
        &self.named_guards
    }

    pub fn find_action_by_name(&self, name: &str) -> Option<&Arc<Action>> {
        self.named_actions
            .iter()
            .find(|named| named.name == name)
            .map(|named| &named.action)
    }

    pub fn find_guard_by_name(&self, name: &str) -> Option<&Guard> {
        self.named_guards
            .iter()
            .find(|guard| guard.name() == Some(name))
    }

    /// Local variable declarations, derived entries first.
    pub fn local_context(&self) -> &[ContextVariable] {
        &self.local_context
    }

    pub fn persistent_context(&self) -> &[ContextVariable] {
        &self.persistent_context
    }

    pub fn nested(&self) -> &[Arc<StateMachineClass>] {
        &self.nested
    }

    /// States not reachable from the initial state.
    pub fn unreachable_states(&self) -> Vec<StateId> {
        let Some(initial) = self.initial_state() else {
            return Vec::new();
        };

        let mut visited = vec![false; self.states.len()];
        let mut queue = VecDeque::from([initial]);
        visited[initial.0] = true;

        while let Some(state) = queue.pop_front() {
            for (_, transition) in self.outgoing(state) {
                for next in transition.target.into_iter().chain(transition.else_target) {
                    if !visited[next.0] {
                        visited[next.0] = true;
                        queue.push_back(next);
                    }
                }
            }
        }

        visited
            .iter()
            .enumerate()
            .filter(|(_, seen)| !**seen)
            .map(|(index, _)| StateId(index))
            .collect()
    }
}
