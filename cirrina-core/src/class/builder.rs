//! State machine class builder.
//!
//! Builds a [`StateMachineClass`] from its description. Machines that extend
//! a base are merged with the already-built base class:
//!
//! 1. named actions and guards of the derived machine replace same-named
//!    base entries, the rest are inherited;
//! 2. context declarations list derived variables first, then base variables
//!    not redeclared;
//! 3. derived states override base states of the same name (allowed only for
//!    virtual or abstract base states), base-only states are copied;
//! 4. base transitions are recreated between the (possibly overridden)
//!    states, except event-triggered ones redeclared on the derived state;
//! 5. the derived machine's own transitions are added last.

use super::machine::StateMachineClass;
use super::state::{StateClass, StateId};
use super::transition::TransitionClass;
use crate::action::{
    Action, ActionGraph, ActionKind, ActionStep, AssignAction, CreateAction, InvokeAction,
    MatchAction, MatchCase, NamedAction, RaiseAction, TimeoutAction, TimeoutResetAction,
};
use crate::context::ContextVariable;
use crate::description::{
    ActionDescription, ActionOrReference, ContextDescription, EventDescription, GuardOrReference,
    StateDescription, StateMachineDescription, TransitionDescription, VariableDescription,
};
use crate::error::CoreError;
use crate::event::Event;
use crate::guard::Guard;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Builds one state machine class (and its nested machines).
pub struct StateMachineClassBuilder<'a> {
    description: &'a StateMachineDescription,
    known: &'a HashMap<String, Arc<StateMachineClass>>,
}

impl<'a> StateMachineClassBuilder<'a> {
    /// Creates a builder; `known` holds the classes available as bases.
    pub fn new(
        description: &'a StateMachineDescription,
        known: &'a HashMap<String, Arc<StateMachineClass>>,
    ) -> Self {
        Self { description, known }
    }

    /// Builds and validates the class.
    pub fn build(&self) -> Result<StateMachineClass, CoreError> {
        let name = &self.description.name;
        if name.is_empty() {
            return Err(CoreError::InvalidDefinition {
                reason: "state machine name must not be empty".to_string(),
            });
        }

        let guards = self.build_guards()?;
        let actions = self.build_actions(&guards)?;
        let nested = self.build_nested()?;

        let mut class = match &self.description.extends {
            None => self.build_base(guards, actions)?,
            Some(base_name) => {
                let base = self
                    .known
                    .get(base_name)
                    .ok_or_else(|| CoreError::InvalidBase {
                        machine: name.clone(),
                        base: base_name.clone(),
                    })?;
                self.build_extended(base, guards, actions)?
            }
        };
        class.nested = nested;

        self.add_described_transitions(&mut class)?;
        self.validate(&class)?;

        let unreachable = class.unreachable_states();
        if !unreachable.is_empty() {
            tracing::debug!(
                "State machine '{}' has {} state(s) unreachable from its initial state",
                name,
                unreachable.len()
            );
        }

        Ok(class)
    }

    fn build_guards(&self) -> Result<Vec<Guard>, CoreError> {
        let mut seen = HashSet::new();
        let mut guards = Vec::with_capacity(self.description.guards.len());
        for guard in &self.description.guards {
            if !seen.insert(guard.name.as_str()) {
                return Err(CoreError::DuplicateName {
                    machine: self.description.name.clone(),
                    kind: "guard",
                    name: guard.name.clone(),
                });
            }
            guards.push(Guard::named(guard.name.clone(), guard.expression.clone()));
        }
        Ok(guards)
    }

    /// Named actions may reference named actions declared before them.
    fn build_actions(&self, guards: &[Guard]) -> Result<Vec<NamedAction>, CoreError> {
        let mut actions: Vec<NamedAction> = Vec::with_capacity(self.description.actions.len());
        for named in &self.description.actions {
            if actions.iter().any(|existing| existing.name == named.name) {
                return Err(CoreError::DuplicateName {
                    machine: self.description.name.clone(),
                    kind: "action",
                    name: named.name.clone(),
                });
            }
            let resolver = Resolver {
                machine: &self.description.name,
                actions: &actions,
                guards,
            };
            let action = resolver.action(&named.action)?;
            actions.push(NamedAction {
                name: named.name.clone(),
                action: Arc::new(action),
            });
        }
        Ok(actions)
    }

    fn build_nested(&self) -> Result<Vec<Arc<StateMachineClass>>, CoreError> {
        self.description
            .machines
            .iter()
            .map(|nested| StateMachineClassBuilder::new(nested, self.known).build().map(Arc::new))
            .collect()
    }

    fn build_base(
        &self,
        guards: Vec<Guard>,
        actions: Vec<NamedAction>,
    ) -> Result<StateMachineClass, CoreError> {
        let mut class =
            StateMachineClass::empty(&self.description.name, self.description.is_abstract, None);
        class.local_context = declarations(&self.description.local_context);
        class.persistent_context = declarations(&self.description.persistent_context);

        for state in &self.description.states {
            let resolver = Resolver {
                machine: &self.description.name,
                actions: &actions,
                guards: &guards,
            };
            class.add_state(resolver.state(state)?)?;
        }

        class.named_guards = guards;
        class.named_actions = actions;
        Ok(class)
    }

    fn build_extended(
        &self,
        base: &StateMachineClass,
        guards: Vec<Guard>,
        actions: Vec<NamedAction>,
    ) -> Result<StateMachineClass, CoreError> {
        let name = &self.description.name;
        let mut class = StateMachineClass::empty(
            name,
            self.description.is_abstract,
            Some(base.name.clone()),
        );

        class.named_guards = merge_named(guards, &base.named_guards, |g| g.name());
        let merged = merge_named(actions, &base.named_actions, |a| Some(a.name.as_str()));
        // Inherited named actions may refer to overridden ones
        class.named_actions = merged
            .iter()
            .map(|named| NamedAction {
                name: named.name.clone(),
                action: Arc::new(named.action.rebind(&merged)),
            })
            .collect();
        class.local_context = merge_declarations(
            declarations(&self.description.local_context),
            &base.local_context,
        );
        class.persistent_context = merge_declarations(
            declarations(&self.description.persistent_context),
            &base.persistent_context,
        );

        // Overridden and new states
        for state in &self.description.states {
            let resolver = Resolver {
                machine: name,
                actions: &class.named_actions,
                guards: &class.named_guards,
            };
            let built = resolver.state(state)?;
            let merged = match base.find_state_class_by_name(&state.name) {
                Some(base_state) => {
                    if !base_state.is_virtual() && !base_state.is_abstract() {
                        return Err(CoreError::IllegalOverride {
                            machine: name.clone(),
                            state: state.name.clone(),
                        });
                    }
                    StateClass::derive(&base_state.rebind(&class.named_actions), built)
                }
                None => built,
            };
            class.add_state(merged)?;
        }

        // States only declared in the base
        for (_, base_state) in base.states() {
            if class.find_state(base_state.name()).is_some() {
                continue;
            }
            if base_state.is_abstract() && !self.description.is_abstract {
                return Err(CoreError::MissingOverride {
                    machine: name.clone(),
                    state: base_state.name().to_string(),
                });
            }
            class.add_state(base_state.rebind(&class.named_actions))?;
        }

        // Base transitions, remapped onto this class
        for (_, transition) in base.transitions() {
            let source_name = base.state(transition.source).name();
            if let Some(event) = transition.event() {
                let redeclared = self
                    .description
                    .states
                    .iter()
                    .find(|state| state.name == source_name)
                    .map(|state| state.on.iter().any(|on| on.event == event))
                    .unwrap_or(false);
                if redeclared {
                    continue;
                }
            }

            let source = remap(&class, base, transition.source)?;
            let target = transition
                .target
                .map(|state| remap(&class, base, state))
                .transpose()?;
            let else_target = transition
                .else_target
                .map(|state| remap(&class, base, state))
                .transpose()?;
            let rebound = transition.rebind(
                source,
                target,
                else_target,
                &class.named_guards,
                &class.named_actions,
            );
            class.add_transition(rebound);
        }

        Ok(class)
    }

    fn add_described_transitions(&self, class: &mut StateMachineClass) -> Result<(), CoreError> {
        let name = &self.description.name;
        for state in &self.description.states {
            let source = class.find_state(&state.name).ok_or_else(|| {
                CoreError::InvalidDefinition {
                    reason: format!("state '{}' missing from '{}'", state.name, name),
                }
            })?;

            let described = state
                .on
                .iter()
                .map(|on| (Some(on.event.clone()), &on.transition))
                .chain(state.always.iter().map(|always| (None, always)));

            for (event, transition) in described {
                let resolver = Resolver {
                    machine: name,
                    actions: &class.named_actions,
                    guards: &class.named_guards,
                };
                let built = resolver.transition(class, source, event, transition)?;
                class.add_transition(built);
            }
        }
        Ok(())
    }

    fn validate(&self, class: &StateMachineClass) -> Result<(), CoreError> {
        let initial_count = class.states.iter().filter(|state| state.initial).count();
        if initial_count > 1 || (initial_count == 0 && !class.is_abstract) {
            return Err(CoreError::InvalidDefinition {
                reason: format!(
                    "state machine '{}' must have exactly one initial state, found {}",
                    class.name, initial_count
                ),
            });
        }

        if !class.is_abstract {
            if let Some(state) = class.states.iter().find(|state| state.is_abstract) {
                return Err(CoreError::StrayAbstractState {
                    machine: class.name.clone(),
                    state: state.name.clone(),
                });
            }
        }

        Ok(())
    }
}

fn remap(
    class: &StateMachineClass,
    base: &StateMachineClass,
    state: StateId,
) -> Result<StateId, CoreError> {
    let name = base.state(state).name();
    class
        .find_state(name)
        .ok_or_else(|| CoreError::InvalidDefinition {
            reason: format!("state '{}' missing from '{}'", name, class.name),
        })
}

/// Derived entries first, then base entries whose name is not redeclared.
fn merge_named<T: Clone>(
    mut derived: Vec<T>,
    base: &[T],
    name: impl Fn(&T) -> Option<&str>,
) -> Vec<T> {
    let inherited: Vec<T> = base
        .iter()
        .filter(|candidate| {
            !derived
                .iter()
                .any(|existing| name(existing) == name(candidate))
        })
        .cloned()
        .collect();
    derived.extend(inherited);
    derived
}

fn merge_declarations(
    derived: Vec<ContextVariable>,
    base: &[ContextVariable],
) -> Vec<ContextVariable> {
    merge_named(derived, base, |variable| Some(variable.name()))
}

pub(crate) fn declarations(description: &ContextDescription) -> Vec<ContextVariable> {
    description.variables.iter().map(variable).collect()
}

fn variable(description: &VariableDescription) -> ContextVariable {
    ContextVariable::lazy(description.name.clone(), description.value.clone())
}

fn event(description: &EventDescription) -> Event {
    Event::new(
        description.name.clone(),
        description.channel,
        description.data.iter().map(variable).collect(),
    )
}

/// Resolves descriptions against a machine's named actions and guards.
struct Resolver<'r> {
    machine: &'r str,
    actions: &'r [NamedAction],
    guards: &'r [Guard],
}

impl Resolver<'_> {
    fn named_action(&self, name: &str) -> Result<Arc<Action>, CoreError> {
        self.actions
            .iter()
            .find(|named| named.name == name)
            .map(|named| named.action.clone())
            .ok_or_else(|| CoreError::UnresolvedAction {
                machine: self.machine.to_string(),
                name: name.to_string(),
            })
    }

    fn step(&self, entry: &ActionOrReference) -> Result<ActionStep, CoreError> {
        match entry {
            ActionOrReference::Reference { reference } => Ok(ActionStep::reference(
                reference.clone(),
                self.named_action(reference)?,
            )),
            ActionOrReference::Action(description) => {
                Ok(ActionStep::inline(self.action(description)?))
            }
        }
    }

    fn graph(&self, entries: &[ActionOrReference]) -> Result<ActionGraph, CoreError> {
        entries
            .iter()
            .map(|entry| self.step(entry))
            .collect::<Result<Vec<_>, _>>()
            .map(ActionGraph::new)
    }

    fn action(&self, description: &ActionDescription) -> Result<Action, CoreError> {
        Ok(match description {
            ActionDescription::Assign { variable: v } => Action::Assign(AssignAction {
                variable: variable(v),
            }),
            ActionDescription::Create {
                variable: v,
                persistent,
            } => Action::Create(CreateAction {
                variable: variable(v),
                persistent: *persistent,
            }),
            ActionDescription::Invoke {
                service_type,
                local,
                input,
                output,
                done,
            } => Action::Invoke(InvokeAction {
                service_type: service_type.clone(),
                local: *local,
                input: input.iter().map(variable).collect(),
                output: output.clone(),
                done: done.iter().map(event).collect(),
            }),
            ActionDescription::Raise { event: e } => Action::Raise(RaiseAction { event: event(e) }),
            ActionDescription::Match { value, cases } => Action::Match(MatchAction {
                value: value.clone(),
                cases: cases
                    .iter()
                    .map(|case| {
                        Ok(MatchCase {
                            case: case.case.clone(),
                            action: self.step(&case.action)?,
                        })
                    })
                    .collect::<Result<Vec<_>, CoreError>>()?,
            }),
            ActionDescription::Timeout {
                name,
                delay,
                action,
            } => Action::Timeout(TimeoutAction {
                name: name.clone(),
                delay: delay.clone(),
                action: self.step(action)?,
            }),
            ActionDescription::TimeoutReset { action } => {
                Action::TimeoutReset(TimeoutResetAction {
                    action: action.clone(),
                })
            }
        })
    }

    fn guard(&self, entry: &GuardOrReference) -> Result<Guard, CoreError> {
        match entry {
            GuardOrReference::Inline { expression } => Ok(Guard::new(expression.clone())),
            GuardOrReference::Reference { reference } => self
                .guards
                .iter()
                .find(|guard| guard.name() == Some(reference.as_str()))
                .cloned()
                .ok_or_else(|| CoreError::UnresolvedGuard {
                    machine: self.machine.to_string(),
                    name: reference.clone(),
                }),
        }
    }

    fn state(&self, description: &StateDescription) -> Result<StateClass, CoreError> {
        let after = self.graph(&description.after)?;
        if after
            .actions()
            .any(|action| action.kind() != ActionKind::Timeout)
        {
            return Err(CoreError::InvalidAfterAction {
                machine: self.machine.to_string(),
                state: description.name.clone(),
            });
        }

        Ok(StateClass {
            name: description.name.clone(),
            initial: description.initial,
            terminal: description.terminal,
            is_virtual: description.is_virtual,
            is_abstract: description.is_abstract,
            entry: self.graph(&description.entry)?,
            exit: self.graph(&description.exit)?,
            while_actions: self.graph(&description.while_actions)?,
            after,
        })
    }

    fn transition(
        &self,
        class: &StateMachineClass,
        source: StateId,
        event: Option<String>,
        description: &TransitionDescription,
    ) -> Result<TransitionClass, CoreError> {
        let lookup = |name: &str| {
            class
                .find_state(name)
                .ok_or_else(|| CoreError::InvalidDefinition {
                    reason: format!(
                        "target state '{}' does not exist in '{}'",
                        name, self.machine
                    ),
                })
        };

        // No target makes the transition internal
        let target = description.target.as_deref().map(lookup).transpose()?;
        let else_target = description
            .else_target
            .as_deref()
            .map(lookup)
            .transpose()?;

        Ok(TransitionClass {
            event,
            source,
            target,
            guards: description
                .guards
                .iter()
                .map(|guard| self.guard(guard))
                .collect::<Result<Vec<_>, _>>()?,
            actions: self.graph(&description.actions)?,
            else_target,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{InMemoryContext, VariableValue};
    use crate::expression::EmptyScope;
    use crate::extent::Extent;
    use serde_json::json;

    fn describe(value: serde_json::Value) -> StateMachineDescription {
        serde_json::from_value(value).unwrap()
    }

    fn build(description: &StateMachineDescription) -> Result<StateMachineClass, CoreError> {
        let known = HashMap::new();
        StateMachineClassBuilder::new(description, &known).build()
    }

    fn build_with_base(
        base: &StateMachineDescription,
        derived: &StateMachineDescription,
    ) -> Result<StateMachineClass, CoreError> {
        let mut known = HashMap::new();
        known.insert(base.name.clone(), Arc::new(build(base).unwrap()));
        StateMachineClassBuilder::new(derived, &known).build()
    }

    fn sample_base() -> StateMachineDescription {
        describe(json!({
            "name": "stateMachine1",
            "abstract": true,
            "local_context": {"variables": [{"name": "v1", "value": "0"}, {"name": "v2", "value": "0"}]},
            "actions": [
                {"name": "action1", "action": {"type": "assign", "variable": {"name": "v1", "value": "0"}}},
                {"name": "action2", "action": {"type": "assign", "variable": {"name": "v1", "value": "1"}}}
            ],
            "guards": [
                {"name": "guard1", "expression": "true"},
                {"name": "guard2", "expression": "false"}
            ],
            "states": [
                {"name": "state1", "initial": true, "virtual": true,
                 "entry": [{"reference": "action2"}],
                 "on": [{"event": "e1", "target": "state2", "guards": [{"reference": "guard2"}]}]},
                {"name": "state2", "abstract": true},
                {"name": "state3", "always": [{"target": "state1"}]}
            ]
        }))
    }

    fn sample_derived() -> StateMachineDescription {
        describe(json!({
            "name": "stateMachine2",
            "extends": "stateMachine1",
            "local_context": {"variables": [{"name": "v1", "value": "1"}, {"name": "v3", "value": "1"}]},
            "actions": [
                {"name": "action2", "action": {"type": "assign", "variable": {"name": "v1", "value": "2"}}}
            ],
            "guards": [{"name": "guard2", "expression": "true"}],
            "states": [
                {"name": "state1",
                 "entry": [{"reference": "action1"}],
                 "on": [{"event": "e1", "target": "state3"}, {"event": "e2", "target": "state4"}]},
                {"name": "state2", "on": [{"event": "e3", "target": "state1"}]},
                {"name": "state4", "terminal": true, "on": [{"event": "e4", "target": "state1"}]}
            ]
        }))
    }

    fn assigned_value(action: &Action) -> serde_json::Value {
        let extent = Extent::new(Arc::new(InMemoryContext::new()));
        match action {
            Action::Assign(assign) => match assign.variable.value() {
                VariableValue::Lazy(expression) => expression.evaluate(&extent).unwrap(),
                VariableValue::Value(value) => value.clone(),
            },
            other => panic!("expected assign action, got {:?}", other.kind()),
        }
    }

    #[test]
    fn test_build_base_machine() {
        let class = build(&sample_base()).unwrap();
        assert_eq!(class.state_count(), 3);
        assert!(class.is_abstract());
        assert_eq!(class.initial_state(), class.find_state("state1"));
        assert_eq!(
            class.input_events().into_iter().collect::<Vec<_>>(),
            vec!["e1"]
        );

        let state1 = class.find_state("state1").unwrap();
        assert_eq!(class.outgoing(state1).count(), 1);
        let state3 = class.find_state("state3").unwrap();
        let (_, always) = class.find_always_transitions(state3).next().unwrap();
        assert_eq!(class.state(always.target().unwrap()).name(), "state1");
    }

    #[test]
    fn test_abstract_flag_not_inherited() {
        let derived = build_with_base(&sample_base(), &sample_derived()).unwrap();
        assert!(!derived.is_abstract());
        assert_eq!(derived.base_name(), Some("stateMachine1"));
    }

    #[test]
    fn test_merge_and_override_states() {
        let derived = build_with_base(&sample_base(), &sample_derived()).unwrap();
        assert_eq!(derived.state_count(), 4);

        let state1 = derived.find_state("state1").unwrap();
        assert_eq!(derived.outgoing(state1).count(), 2);

        let e1: Vec<_> = derived.find_on_transitions(state1, "e1").collect();
        assert_eq!(e1.len(), 1);
        assert_eq!(derived.state(e1[0].1.target().unwrap()).name(), "state3");

        // base transition from state3 now targets the overriding state1
        let state3 = derived.find_state("state3").unwrap();
        let (_, always) = derived.find_always_transitions(state3).next().unwrap();
        assert_eq!(always.target(), Some(state1));
    }

    #[test]
    fn test_virtual_and_abstract_flags() {
        let base = build(&sample_base()).unwrap();
        let state1 = base.find_state_class_by_name("state1").unwrap();
        assert!(state1.is_virtual() && !state1.is_abstract());
        let state2 = base.find_state_class_by_name("state2").unwrap();
        assert!(!state2.is_virtual() && state2.is_abstract());

        let derived = build_with_base(&sample_base(), &sample_derived()).unwrap();
        let state1 = derived.find_state_class_by_name("state1").unwrap();
        assert!(state1.is_virtual() && !state1.is_abstract());
        let state2 = derived.find_state_class_by_name("state2").unwrap();
        assert!(state2.is_virtual() && !state2.is_abstract());
    }

    #[test]
    fn test_override_concatenates_entry_actions() {
        let derived = build_with_base(&sample_base(), &sample_derived()).unwrap();
        let state1 = derived.find_state_class_by_name("state1").unwrap();
        let values: Vec<_> = state1
            .entry_actions()
            .actions()
            .map(|action| assigned_value(action))
            .collect();
        // base reference to action2 is rebound to the derived override
        assert_eq!(values, vec![json!(2), json!(0)]);
    }

    #[test]
    fn test_merge_and_override_context() {
        let base = build(&sample_base()).unwrap();
        let names: Vec<_> = base.local_context().iter().map(|v| v.name()).collect();
        assert_eq!(names, vec!["v1", "v2"]);

        let derived = build_with_base(&sample_base(), &sample_derived()).unwrap();
        let merged: Vec<_> = derived
            .local_context()
            .iter()
            .map(|v| {
                let value = match v.value() {
                    VariableValue::Lazy(expression) => expression.source().to_string(),
                    VariableValue::Value(value) => value.to_string(),
                };
                (v.name().to_string(), value)
            })
            .collect();
        assert_eq!(
            merged,
            vec![
                ("v1".to_string(), "1".to_string()),
                ("v3".to_string(), "1".to_string()),
                ("v2".to_string(), "0".to_string()),
            ]
        );
    }

    #[test]
    fn test_merge_handled_events() {
        let derived = build_with_base(&sample_base(), &sample_derived()).unwrap();
        assert_eq!(
            derived.input_events().into_iter().collect::<Vec<_>>(),
            vec!["e1", "e2", "e3", "e4"]
        );
    }

    #[test]
    fn test_merge_and_override_actions() {
        let base = build(&sample_base()).unwrap();
        assert_eq!(assigned_value(base.find_action_by_name("action1").unwrap()), json!(0));
        assert_eq!(assigned_value(base.find_action_by_name("action2").unwrap()), json!(1));

        let derived = build_with_base(&sample_base(), &sample_derived()).unwrap();
        assert_eq!(assigned_value(derived.find_action_by_name("action1").unwrap()), json!(0));
        assert_eq!(assigned_value(derived.find_action_by_name("action2").unwrap()), json!(2));
    }

    #[test]
    fn test_merge_and_override_guards() {
        let base = build(&sample_base()).unwrap();
        assert_eq!(base.find_guard_by_name("guard1").unwrap().expression().source(), "true");
        assert_eq!(base.find_guard_by_name("guard2").unwrap().expression().source(), "false");

        let derived = build_with_base(&sample_base(), &sample_derived()).unwrap();
        assert_eq!(derived.find_guard_by_name("guard1").unwrap().expression().source(), "true");
        assert_eq!(derived.find_guard_by_name("guard2").unwrap().expression().source(), "true");
    }

    #[test]
    fn test_inherited_transition_uses_overridden_guard() {
        let mut derived = sample_derived();
        // keep the base e1 transition by not redeclaring it
        derived.states[0].on.retain(|on| on.event != "e1");

        let class = build_with_base(&sample_base(), &derived).unwrap();
        let state1 = class.find_state("state1").unwrap();
        let (_, e1) = class.find_on_transitions(state1, "e1").next().unwrap();
        assert!(e1.guards()[0].evaluate(&EmptyScope).unwrap());
    }

    #[test]
    fn test_inherited_timeout_uses_overridden_action() {
        let base = describe(json!({
            "name": "ticker", "abstract": true,
            "local_context": {"variables": [{"name": "v", "value": "0"}]},
            "actions": [
                {"name": "inc", "action": {"type": "assign", "variable": {"name": "v", "value": "1"}}},
                {"name": "pick", "action": {"type": "match", "value": "v",
                  "cases": [{"case": "0", "action": {"reference": "inc"}}]}}
            ],
            "states": [
                {"name": "a", "initial": true, "virtual": true,
                 "entry": [{"reference": "pick"}],
                 "after": [{"type": "timeout", "name": "t", "delay": "100",
                            "action": {"reference": "inc"}}]}
            ]
        }));
        let derived = describe(json!({
            "name": "fastTicker", "extends": "ticker",
            "actions": [
                {"name": "inc", "action": {"type": "assign", "variable": {"name": "v", "value": "2"}}}
            ],
            "states": []
        }));

        let class = build_with_base(&base, &derived).unwrap();
        let a = class.find_state_class_by_name("a").unwrap();

        let timeout = a.after_actions().actions().next().unwrap().as_timeout().unwrap();
        assert_eq!(timeout.action.reference_name(), Some("inc"));
        assert_eq!(assigned_value(timeout.action.action()), json!(2));

        // the inherited named action "pick" reaches the override too
        for matching in [
            a.entry_actions().actions().next().unwrap().as_ref(),
            class.find_action_by_name("pick").unwrap().as_ref(),
        ] {
            match matching {
                Action::Match(matching) => {
                    assert_eq!(assigned_value(matching.cases[0].action.action()), json!(2));
                }
                other => panic!("expected match action, got {:?}", other.kind()),
            }
        }
    }

    #[test]
    fn test_invalid_base() {
        let derived = describe(json!({
            "name": "child", "extends": "nope",
            "states": [{"name": "a", "initial": true}]
        }));
        assert!(matches!(build(&derived), Err(CoreError::InvalidBase { .. })));
    }

    #[test]
    fn test_illegal_override() {
        let derived = describe(json!({
            "name": "child", "extends": "stateMachine1",
            "states": [{"name": "state2"}, {"name": "state3"}]
        }));
        assert!(matches!(
            build_with_base(&sample_base(), &derived),
            Err(CoreError::IllegalOverride { ref state, .. }) if state == "state3"
        ));
    }

    #[test]
    fn test_missing_override() {
        let derived = describe(json!({
            "name": "child", "extends": "stateMachine1",
            "states": [{"name": "state1"}]
        }));
        assert!(matches!(
            build_with_base(&sample_base(), &derived),
            Err(CoreError::MissingOverride { ref state, .. }) if state == "state2"
        ));
    }

    #[test]
    fn test_abstract_child_may_skip_override() {
        let derived = describe(json!({
            "name": "child", "extends": "stateMachine1", "abstract": true,
            "states": [{"name": "state1"}]
        }));
        let class = build_with_base(&sample_base(), &derived).unwrap();
        assert!(class.find_state_class_by_name("state2").unwrap().is_abstract());
    }

    #[test]
    fn test_stray_abstract_state() {
        let description = describe(json!({
            "name": "sm",
            "states": [{"name": "a", "initial": true}, {"name": "b", "abstract": true}]
        }));
        assert!(matches!(
            build(&description),
            Err(CoreError::StrayAbstractState { .. })
        ));
    }

    #[test]
    fn test_unresolved_references() {
        let description = describe(json!({
            "name": "sm",
            "states": [{"name": "a", "initial": true, "entry": [{"reference": "nope"}]}]
        }));
        assert!(matches!(
            build(&description),
            Err(CoreError::UnresolvedAction { .. })
        ));

        let description = describe(json!({
            "name": "sm",
            "states": [{"name": "a", "initial": true,
                        "on": [{"event": "e", "guards": [{"reference": "nope"}]}]}]
        }));
        assert!(matches!(
            build(&description),
            Err(CoreError::UnresolvedGuard { .. })
        ));
    }

    #[test]
    fn test_after_action_must_be_timeout() {
        let description = describe(json!({
            "name": "sm",
            "states": [{"name": "a", "initial": true,
                        "after": [{"type": "assign", "variable": {"name": "v", "value": "1"}}]}]
        }));
        assert!(matches!(
            build(&description),
            Err(CoreError::InvalidAfterAction { .. })
        ));
    }

    #[test]
    fn test_duplicate_names() {
        let description = describe(json!({
            "name": "sm",
            "guards": [{"name": "g", "expression": "true"}, {"name": "g", "expression": "false"}],
            "states": [{"name": "a", "initial": true}]
        }));
        assert!(matches!(
            build(&description),
            Err(CoreError::DuplicateName { kind: "guard", .. })
        ));

        let description = describe(json!({
            "name": "sm",
            "states": [{"name": "a", "initial": true}, {"name": "a"}]
        }));
        assert!(matches!(
            build(&description),
            Err(CoreError::InvalidDefinition { .. })
        ));
    }

    #[test]
    fn test_initial_state_count() {
        let none = describe(json!({"name": "sm", "states": [{"name": "a"}]}));
        assert!(build(&none).is_err());

        let two = describe(json!({
            "name": "sm",
            "states": [{"name": "a", "initial": true}, {"name": "b", "initial": true}]
        }));
        assert!(build(&two).is_err());
    }

    #[test]
    fn test_internal_transition_and_duplicate_events() {
        let description = describe(json!({
            "name": "sm",
            "states": [{"name": "a", "initial": true,
                        "on": [{"event": "e", "guards": [{"expression": "false"}]},
                               {"event": "e", "else": "b"}]},
                       {"name": "b"}]
        }));
        let class = build(&description).unwrap();
        let a = class.find_state("a").unwrap();
        let on: Vec<_> = class.find_on_transitions(a, "e").collect();
        assert_eq!(on.len(), 2);
        assert_eq!(on[0].1.target(), None);
        assert!(on[0].1.is_internal());
        assert!(!on[1].1.is_internal());
        assert_eq!(on[1].1.else_target(), class.find_state("b"));
    }

    #[test]
    fn test_unknown_target() {
        let description = describe(json!({
            "name": "sm",
            "states": [{"name": "a", "initial": true, "on": [{"event": "e", "target": "zzz"}]}]
        }));
        assert!(matches!(
            build(&description),
            Err(CoreError::InvalidDefinition { .. })
        ));
    }

    #[test]
    fn test_nested_machines_are_built() {
        let description = describe(json!({
            "name": "outer",
            "states": [{"name": "a", "initial": true}],
            "machines": [{"name": "inner", "states": [{"name": "x", "initial": true, "terminal": true}]}]
        }));
        let class = build(&description).unwrap();
        assert_eq!(class.nested().len(), 1);
        assert_eq!(class.nested()[0].name(), "inner");
    }
}
