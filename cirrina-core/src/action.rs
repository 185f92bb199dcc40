//! Actions and action graphs.
//!
//! Actions form a closed set of variants. Each state owns four action graphs
//! (entry, exit, while, after) and each transition owns one. An action graph
//! is an ordered sequence; inheritance appends the derived sequence after the
//! base sequence.

use crate::context::ContextVariable;
use crate::event::{Event, EventChannel};
use crate::expression::Expression;
use std::fmt;
use std::sync::Arc;

/// Assigns a new value to an existing variable.
#[derive(Debug, Clone, PartialEq)]
pub struct AssignAction {
    pub variable: ContextVariable,
}

/// Creates a variable in the local or persistent layer.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateAction {
    pub variable: ContextVariable,
    pub persistent: bool,
}

/// Invokes a service implementation asynchronously.
#[derive(Debug, Clone, PartialEq)]
pub struct InvokeAction {
    /// Logical service name used for implementation selection.
    pub service_type: String,
    /// Whether only local implementations may be selected.
    pub local: bool,
    pub input: Vec<ContextVariable>,
    /// Names of variables assigned from the service output.
    pub output: Vec<String>,
    /// Events raised to the invoking instance on completion.
    pub done: Vec<Event>,
}

/// Raises an event.
#[derive(Debug, Clone, PartialEq)]
pub struct RaiseAction {
    pub event: Event,
}

/// Executes the actions of every case equal to the value.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchAction {
    pub value: Expression,
    pub cases: Vec<MatchCase>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchCase {
    pub case: Expression,
    pub action: ActionStep,
}

/// Periodically executes an action.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeoutAction {
    pub name: String,
    /// Delay in milliseconds, evaluated once when the timeout starts.
    pub delay: Expression,
    pub action: ActionStep,
}

/// Cancels a running timeout by name.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeoutResetAction {
    pub action: String,
}

/// A side-effecting action.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Assign(AssignAction),
    Create(CreateAction),
    Invoke(InvokeAction),
    Raise(RaiseAction),
    Match(MatchAction),
    Timeout(TimeoutAction),
    TimeoutReset(TimeoutResetAction),
}

/// Discriminant of an [`Action`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Assign,
    Create,
    Invoke,
    Raise,
    Match,
    Timeout,
    TimeoutReset,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActionKind::Assign => "assign",
            ActionKind::Create => "create",
            ActionKind::Invoke => "invoke",
            ActionKind::Raise => "raise",
            ActionKind::Match => "match",
            ActionKind::Timeout => "timeout",
            ActionKind::TimeoutReset => "timeout_reset",
        };
        f.write_str(name)
    }
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Assign(_) => ActionKind::Assign,
            Action::Create(_) => ActionKind::Create,
            Action::Invoke(_) => ActionKind::Invoke,
            Action::Raise(_) => ActionKind::Raise,
            Action::Match(_) => ActionKind::Match,
            Action::Timeout(_) => ActionKind::Timeout,
            Action::TimeoutReset(_) => ActionKind::TimeoutReset,
        }
    }

    pub fn as_timeout(&self) -> Option<&TimeoutAction> {
        match self {
            Action::Timeout(timeout) => Some(timeout),
            _ => None,
        }
    }

    /// Collects events this action can emit, including nested actions.
    ///
    /// Raised events keep their channel; invoke completion events are
    /// reported with their declared channel as well.
    pub fn collect_raised_events(&self, out: &mut Vec<(String, EventChannel)>) {
        match self {
            Action::Raise(raise) => {
                out.push((raise.event.name().to_string(), raise.event.channel()));
            }
            Action::Invoke(invoke) => {
                out.extend(
                    invoke
                        .done
                        .iter()
                        .map(|event| (event.name().to_string(), event.channel())),
                );
            }
            Action::Match(matched) => {
                for case in &matched.cases {
                    case.action.action().collect_raised_events(out);
                }
            }
            Action::Timeout(timeout) => timeout.action.action().collect_raised_events(out),
            Action::Assign(_) | Action::Create(_) | Action::TimeoutReset(_) => {}
        }
    }

    /// Copies the action with nested references re-resolved against `named`.
    pub fn rebind(&self, named: &[NamedAction]) -> Action {
        match self {
            Action::Match(matching) => Action::Match(MatchAction {
                value: matching.value.clone(),
                cases: matching
                    .cases
                    .iter()
                    .map(|case| MatchCase {
                        case: case.case.clone(),
                        action: case.action.rebind(named),
                    })
                    .collect(),
            }),
            Action::Timeout(timeout) => Action::Timeout(TimeoutAction {
                name: timeout.name.clone(),
                delay: timeout.delay.clone(),
                action: timeout.action.rebind(named),
            }),
            other => other.clone(),
        }
    }
}

/// A named action declared on a state machine.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedAction {
    pub name: String,
    pub action: Arc<Action>,
}

/// An entry in an action graph.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionStep {
    action: Arc<Action>,
    /// Name of the named action this step was resolved from.
    reference: Option<String>,
}

impl ActionStep {
    pub fn inline(action: Action) -> Self {
        Self {
            action: Arc::new(action),
            reference: None,
        }
    }

    pub fn reference(name: impl Into<String>, action: Arc<Action>) -> Self {
        Self {
            action,
            reference: Some(name.into()),
        }
    }

    pub fn action(&self) -> &Arc<Action> {
        &self.action
    }

    pub fn reference_name(&self) -> Option<&str> {
        self.reference.as_deref()
    }

    /// Re-resolves this step and every reference nested in it.
    ///
    /// A reference missing from `named` keeps its action. Named actions only
    /// refer to names declared before them, so the recursion terminates.
    pub fn rebind(&self, named: &[NamedAction]) -> ActionStep {
        let found = self
            .reference
            .as_ref()
            .and_then(|name| named.iter().find(|candidate| &candidate.name == name));
        let action = match found {
            Some(found) => found.action.rebind(named),
            None => self.action.rebind(named),
        };
        ActionStep {
            action: Arc::new(action),
            reference: self.reference.clone(),
        }
    }
}

/// Ordered sequence of actions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionGraph {
    steps: Vec<ActionStep>,
}

impl ActionGraph {
    pub fn new(steps: Vec<ActionStep>) -> Self {
        Self { steps }
    }

    /// Returns `base` followed by `derived`.
    pub fn inherit(base: &ActionGraph, derived: &ActionGraph) -> Self {
        let mut steps = base.steps.clone();
        steps.extend(derived.steps.iter().cloned());
        Self { steps }
    }

    /// Re-resolves referenced steps against `named`, nested ones included.
    pub fn rebind(&self, named: &[NamedAction]) -> Self {
        Self {
            steps: self.steps.iter().map(|step| step.rebind(named)).collect(),
        }
    }

    pub fn steps(&self) -> &[ActionStep] {
        &self.steps
    }

    /// Iterates the actions in order.
    pub fn actions(&self) -> impl Iterator<Item = &Arc<Action>> {
        self.steps.iter().map(|step| &step.action)
    }

    /// Iterates the actions of one kind in order.
    pub fn of_kind(&self, kind: ActionKind) -> impl Iterator<Item = &Arc<Action>> {
        self.actions().filter(move |action| action.kind() == kind)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
