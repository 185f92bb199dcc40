//! Commands executed by state machine instances.
//!
//! Every queued unit of work is a [`Command`]. Executing a command may yield
//! follow-up commands, which the instance runs before older queued work.
//! Actions are dispatched from one exhaustive match in [`execute_action`].

use crate::error::RuntimeError;
use crate::instance::{StateMachineInstance, EVENT_DATA_VARIABLE};
use cirrina_core::action::{
    Action, CreateAction, InvokeAction, MatchAction, TimeoutAction,
};
use cirrina_core::expression::{as_f64, values_equal};
use cirrina_core::{
    ActionGraph, Context, ContextVariable, CoreError, Event, EventChannel, Extent, GuardEvaluator,
    InMemoryContext, StateId, TransitionId,
};
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// A unit of execution of one instance.
#[derive(Debug, Clone)]
pub enum Command {
    /// Enters the initial state.
    InitialTransition,
    /// Runs the entering sequence of a state.
    StateEnter(StateId),
    /// Runs the exit actions of a state.
    StateExit(StateId),
    /// Makes a state active.
    StateChange(StateId),
    /// Takes an always transition of a state, if one applies.
    EvaluateAlways(StateId),
    /// Takes a transition, towards its else-target if `is_else`.
    ///
    /// Internal transitions only run their actions.
    Transition {
        transition: TransitionId,
        is_else: bool,
    },
    /// Handles an event in the active state.
    Event(Event),
    /// Executes an action.
    Action(Arc<Action>),
    /// Cancels the timeouts of the state being left.
    StopTimeouts,
    /// Assigns service output and raises completion events.
    InvokeCompleted {
        output: Vec<ContextVariable>,
        assign: Vec<String>,
        done: Vec<Event>,
    },
    /// Terminates the instance.
    Terminate,
}

impl Command {
    /// Whether a failure of this command fails the instance.
    pub fn evaluates_transitions(&self) -> bool {
        matches!(self, Command::Event(_) | Command::EvaluateAlways(_))
    }

    /// Short name for logging.
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::InitialTransition => CommandKind::InitialTransition,
            Command::StateEnter(_) => CommandKind::StateEnter,
            Command::StateExit(_) => CommandKind::StateExit,
            Command::StateChange(_) => CommandKind::StateChange,
            Command::EvaluateAlways(_) => CommandKind::EvaluateAlways,
            Command::Transition { .. } => CommandKind::Transition,
            Command::Event(_) => CommandKind::Event,
            Command::Action(_) => CommandKind::Action,
            Command::StopTimeouts => CommandKind::StopTimeouts,
            Command::InvokeCompleted { .. } => CommandKind::InvokeCompleted,
            Command::Terminate => CommandKind::Terminate,
        }
    }

    pub(crate) fn execute(
        self,
        instance: &Arc<StateMachineInstance>,
    ) -> Result<Vec<Command>, RuntimeError> {
        let class = instance.class().clone();
        match self {
            Command::InitialTransition => {
                let initial = class.initial_state().ok_or_else(|| {
                    CoreError::InvalidDefinition {
                        reason: format!("'{}' has no initial state", class.name()),
                    }
                })?;
                Ok(vec![Command::StateChange(initial), Command::StateEnter(initial)])
            }

            Command::StateEnter(state) => {
                let state_class = class.state(state);
                let mut commands = actions(state_class.entry_actions());
                if state_class.is_terminal() {
                    commands.push(Command::Terminate);
                } else {
                    commands.extend(actions(state_class.while_actions()));
                    commands.extend(actions(state_class.after_actions()));
                    commands.push(Command::EvaluateAlways(state));
                }
                Ok(commands)
            }

            Command::StateExit(state) => {
                let mut commands = actions(class.state(state).exit_actions());
                commands.push(Command::StopTimeouts);
                Ok(commands)
            }

            Command::StateChange(state) => {
                instance.set_active_state(state);
                tracing::trace!(
                    "Instance {} entered '{}'",
                    instance.id(),
                    class.state(state).name()
                );
                Ok(Vec::new())
            }

            Command::EvaluateAlways(state) => {
                // A queued transition may have left the state already
                if instance.active_state() != Some(state) {
                    return Ok(Vec::new());
                }
                let candidates: Vec<_> = class.find_always_transitions(state).collect();
                Ok(select_transition(instance.extent(), &candidates)?
                    .into_iter()
                    .collect())
            }

            Command::Transition {
                transition,
                is_else,
            } => {
                let transition_class = class.transition(transition);
                let target = if is_else {
                    transition_class.else_target()
                } else {
                    transition_class.target()
                };
                let Some(target) = target else {
                    if is_else {
                        return Ok(Vec::new());
                    }
                    return Ok(actions(transition_class.actions()));
                };

                let mut commands = vec![Command::StateExit(transition_class.source())];
                if !is_else {
                    commands.extend(actions(transition_class.actions()));
                }
                commands.push(Command::StateChange(target));
                commands.push(Command::StateEnter(target));
                Ok(commands)
            }

            Command::Event(event) => {
                let Some(state) = instance.active_state() else {
                    return Ok(Vec::new());
                };
                let candidates: Vec<_> = class.find_on_transitions(state, event.name()).collect();
                if candidates.is_empty() {
                    tracing::trace!(
                        "Instance {} ignores '{}' in '{}'",
                        instance.id(),
                        event.name(),
                        class.state(state).name()
                    );
                    return Ok(Vec::new());
                }
                // Guards see the event data before it is written
                let scoped = event_extent(instance.extent(), &event)?;
                let selected = select_transition(&scoped, &candidates)?;
                if selected.is_some() {
                    write_event_data(instance.extent(), &event)?;
                } else {
                    tracing::trace!(
                        "Instance {}: no transition for '{}' passed its guards",
                        instance.id(),
                        event.name()
                    );
                }
                Ok(selected.into_iter().collect())
            }

            Command::Action(action) => execute_action(&action, instance),

            Command::StopTimeouts => {
                instance.timeouts().stop_all();
                Ok(Vec::new())
            }

            Command::InvokeCompleted {
                output,
                assign,
                done,
            } => {
                for name in &assign {
                    match output.iter().find(|variable| variable.name() == name.as_str()) {
                        Some(variable) => {
                            let value = variable.evaluated_value()?.clone();
                            instance.extent().try_set(name, value)?;
                        }
                        None => tracing::warn!(
                            "Instance {}: service output has no variable '{}'",
                            instance.id(),
                            name
                        ),
                    }
                }
                Ok(done
                    .iter()
                    .map(|event| Command::Event(event.with_data(output.clone())))
                    .collect())
            }

            Command::Terminate => {
                instance.terminate();
                Ok(Vec::new())
            }
        }
    }
}

/// Command names for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    InitialTransition,
    StateEnter,
    StateExit,
    StateChange,
    EvaluateAlways,
    Transition,
    Event,
    Action,
    StopTimeouts,
    InvokeCompleted,
    Terminate,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandKind::InitialTransition => "initial_transition",
            CommandKind::StateEnter => "state_enter",
            CommandKind::StateExit => "state_exit",
            CommandKind::StateChange => "state_change",
            CommandKind::EvaluateAlways => "evaluate_always",
            CommandKind::Transition => "transition",
            CommandKind::Event => "event",
            CommandKind::Action => "action",
            CommandKind::StopTimeouts => "stop_timeouts",
            CommandKind::InvokeCompleted => "invoke_completed",
            CommandKind::Terminate => "terminate",
        };
        write!(f, "{}", name)
    }
}

fn actions(graph: &ActionGraph) -> Vec<Command> {
    graph
        .actions()
        .map(|action| Command::Action(action.clone()))
        .collect()
}

/// Picks the first candidate whose guards pass, else the first candidate
/// declaring an else-target.
fn select_transition(
    extent: &Extent,
    candidates: &[(TransitionId, &cirrina_core::TransitionClass)],
) -> Result<Option<Command>, RuntimeError> {
    for (id, transition) in candidates {
        if GuardEvaluator::evaluate_all(transition.guards(), extent)? {
            return Ok(Some(Command::Transition {
                transition: *id,
                is_else: false,
            }));
        }
    }
    Ok(candidates
        .iter()
        .find(|(_, transition)| transition.else_target().is_some())
        .map(|(id, _)| Command::Transition {
            transition: *id,
            is_else: true,
        }))
}

/// Extends `extent` with a layer holding the event's data and the event data
/// variable. Writes to the result never reach `extent`.
fn event_extent(extent: &Extent, event: &Event) -> Result<Extent, RuntimeError> {
    let scoped = extent.extend(Arc::new(InMemoryContext::new()));
    for variable in event.data() {
        scoped.set_or_create(variable.name(), variable.evaluated_value()?.clone())?;
    }
    scoped.set_or_create(EVENT_DATA_VARIABLE, Value::Object(event.data_object()?))?;
    Ok(scoped)
}

/// Writes event data into the extent where the names exist and records all
/// of it in the event data variable.
fn write_event_data(extent: &Extent, event: &Event) -> Result<(), RuntimeError> {
    for variable in event.data() {
        let value = variable.evaluated_value()?.clone();
        match extent.try_set(variable.name(), value) {
            Ok(()) | Err(CoreError::VariableMissing { .. }) => {}
            Err(e) => return Err(e.into()),
        }
    }
    extent.set_or_create(EVENT_DATA_VARIABLE, Value::Object(event.data_object()?))?;
    Ok(())
}

/// Executes one action, returning follow-up commands.
pub(crate) fn execute_action(
    action: &Action,
    instance: &Arc<StateMachineInstance>,
) -> Result<Vec<Command>, RuntimeError> {
    let extent = instance.extent();
    match action {
        Action::Assign(assign) => {
            let (name, value) = assign.variable.evaluate(extent)?.into_pair()?;
            extent.try_set(&name, value)?;
            Ok(Vec::new())
        }

        Action::Create(create) => {
            execute_create(create, instance)?;
            Ok(Vec::new())
        }

        Action::Invoke(invoke) => {
            execute_invoke(invoke, instance)?;
            Ok(Vec::new())
        }

        Action::Raise(raise) => {
            let event = raise.event.evaluate(extent)?;
            match event.channel() {
                EventChannel::Internal => instance.receive(event),
                EventChannel::External | EventChannel::Global => {
                    instance.environment().broker.send(event, instance.id())?
                }
            }
            Ok(Vec::new())
        }

        Action::Match(matching) => execute_match(matching, instance),

        Action::Timeout(timeout) => {
            execute_timeout(timeout, instance)?;
            Ok(Vec::new())
        }

        Action::TimeoutReset(reset) => {
            instance.timeouts().stop(&reset.action)?;
            Ok(Vec::new())
        }
    }
}

fn execute_create(
    create: &CreateAction,
    instance: &StateMachineInstance,
) -> Result<(), RuntimeError> {
    let extent = instance.extent();
    let (name, value) = create.variable.evaluate(extent)?.into_pair()?;
    let layer = if create.persistent {
        extent.low()
    } else {
        extent.high()
    };
    layer.create(&name, value)?;
    Ok(())
}

fn execute_match(
    matching: &MatchAction,
    instance: &StateMachineInstance,
) -> Result<Vec<Command>, RuntimeError> {
    let extent = instance.extent();
    let value = matching.value.evaluate(extent)?;
    let mut commands = Vec::new();
    for case in &matching.cases {
        if values_equal(&value, &case.case.evaluate(extent)?) {
            commands.push(Command::Action(case.action.action().clone()));
        }
    }
    Ok(commands)
}

fn execute_invoke(
    invoke: &InvokeAction,
    instance: &Arc<StateMachineInstance>,
) -> Result<(), RuntimeError> {
    let service = instance
        .environment()
        .services
        .select(&invoke.service_type, invoke.local)
        .ok_or_else(|| RuntimeError::ServiceNotFound {
            name: invoke.service_type.clone(),
            local: invoke.local,
        })?;
    let input = invoke
        .input
        .iter()
        .map(|variable| variable.evaluate(instance.extent()))
        .collect::<Result<Vec<_>, _>>()?;
    let handle = tokio::runtime::Handle::try_current()
        .map_err(|e| RuntimeError::Executor(e.to_string()))?;

    let instance = Arc::downgrade(instance);
    let assign = invoke.output.clone();
    let done = invoke.done.clone();
    let name = invoke.service_type.clone();
    handle.spawn(async move {
        let result = service.invoke(input).await;
        let Some(instance) = instance.upgrade() else {
            return;
        };
        match result {
            Ok(output) => instance.enqueue(Command::InvokeCompleted {
                output,
                assign,
                done,
            }),
            Err(e) => tracing::warn!(
                "Instance {}: invocation of '{}' failed: {}",
                instance.id(),
                name,
                e
            ),
        }
    });
    Ok(())
}

fn execute_timeout(
    timeout: &TimeoutAction,
    instance: &Arc<StateMachineInstance>,
) -> Result<(), RuntimeError> {
    let delay = timeout.delay.evaluate(instance.extent())?;
    let period = delay_to_duration(&delay).ok_or_else(|| RuntimeError::InvalidDelay {
        name: timeout.name.clone(),
        value: delay.to_string(),
    })?;

    let weak: Weak<StateMachineInstance> = Arc::downgrade(instance);
    let action = timeout.action.action().clone();
    instance.timeouts().start(&timeout.name, period, move || {
        match weak.upgrade() {
            Some(instance) if instance.is_running() => {
                instance.enqueue(Command::Action(action.clone()));
                true
            }
            _ => false,
        }
    })
}

/// Converts a delay in milliseconds to a duration.
fn delay_to_duration(delay: &Value) -> Option<Duration> {
    if let Some(millis) = delay.as_u64() {
        return (millis > 0).then(|| Duration::from_millis(millis));
    }
    let millis = as_f64(delay)?;
    if millis.is_finite() && millis > 0.0 {
        Some(Duration::from_secs_f64(millis / 1000.0))
    } else {
        None
    }
}
