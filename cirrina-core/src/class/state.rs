//! State classes.

use crate::action::{ActionGraph, NamedAction, TimeoutAction};
use std::fmt;

/// Index of a state within its state machine class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateId(pub(crate) usize);

impl StateId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Immutable description of a state: flags plus four action graphs.
#[derive(Debug, Clone, PartialEq)]
pub struct StateClass {
    pub(crate) name: String,
    pub(crate) initial: bool,
    pub(crate) terminal: bool,
    pub(crate) is_virtual: bool,
    pub(crate) is_abstract: bool,
    pub(crate) entry: ActionGraph,
    pub(crate) exit: ActionGraph,
    pub(crate) while_actions: ActionGraph,
    pub(crate) after: ActionGraph,
}

impl StateClass {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_initial(&self) -> bool {
        self.initial
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    pub fn is_virtual(&self) -> bool {
        self.is_virtual
    }

    pub fn is_abstract(&self) -> bool {
        self.is_abstract
    }

    pub fn entry_actions(&self) -> &ActionGraph {
        &self.entry
    }

    pub fn exit_actions(&self) -> &ActionGraph {
        &self.exit
    }

    pub fn while_actions(&self) -> &ActionGraph {
        &self.while_actions
    }

    pub fn after_actions(&self) -> &ActionGraph {
        &self.after
    }

    /// Iterates the timeouts started when entering this state.
    pub fn timeouts(&self) -> impl Iterator<Item = &TimeoutAction> {
        self.after.actions().filter_map(|action| action.as_timeout())
    }

    /// Builds the state overriding `base` with `child`.
    ///
    /// Flags: initial and terminal are inherited if set on either side, the
    /// abstract flag comes from the child, and an override of an abstract
    /// state that is no longer abstract becomes virtual. Action graphs are
    /// the base sequence followed by the child sequence.
    pub(crate) fn derive(base: &StateClass, child: StateClass) -> StateClass {
        StateClass {
            name: child.name,
            initial: child.initial || base.initial,
            terminal: child.terminal || base.terminal,
            is_virtual: (base.is_abstract && !child.is_abstract) || base.is_virtual,
            is_abstract: child.is_abstract,
            entry: ActionGraph::inherit(&base.entry, &child.entry),
            exit: ActionGraph::inherit(&base.exit, &child.exit),
            while_actions: ActionGraph::inherit(&base.while_actions, &child.while_actions),
            after: ActionGraph::inherit(&base.after, &child.after),
        }
    }

    /// Copies the state with named action references re-resolved.
    pub(crate) fn rebind(&self, named: &[NamedAction]) -> StateClass {
        StateClass {
            name: self.name.clone(),
            initial: self.initial,
            terminal: self.terminal,
            is_virtual: self.is_virtual,
            is_abstract: self.is_abstract,
            entry: self.entry.rebind(named),
            exit: self.exit.rebind(named),
            while_actions: self.while_actions.rebind(named),
            after: self.after.rebind(named),
        }
    }
}
