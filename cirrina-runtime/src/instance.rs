//! State machine instances.
//!
//! An instance owns a command queue and an execution lock. The scheduler
//! acquires the lock with [`StateMachineInstance::try_acquire`]; the returned
//! [`ExecutionGuard`] executes exactly one command and releases the lock when
//! dropped, after the command's follow-ups are queued ahead of older work.

use crate::broker::{EventHandler, EventListener};
use crate::command::Command;
use crate::error::RuntimeError;
use crate::service::ServiceImplementationSelector;
use crate::timeout::TimeoutActionManager;
use cirrina_core::{
    Context, Event, EventChannel, Extent, InMemoryContext, StateId, StateMachineClass,
};
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use uuid::Uuid;

/// Name of the local variable holding the data of the last handled event.
pub const EVENT_DATA_VARIABLE: &str = "event_data";

/// Lifecycle status of an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceStatus {
    Running,
    /// Reached a terminal state.
    Terminated,
    /// Transition evaluation failed.
    Failed(String),
}

/// Facilities shared by all instances of a runtime.
pub struct InstanceEnvironment {
    pub(crate) broker: Arc<dyn EventHandler>,
    pub(crate) services: Arc<ServiceImplementationSelector>,
    pub(crate) wake: Arc<Notify>,
}

impl InstanceEnvironment {
    pub fn new(broker: Arc<dyn EventHandler>, services: ServiceImplementationSelector) -> Self {
        Self {
            broker,
            services: Arc::new(services),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Signalled whenever an instance gains work.
    pub fn wake(&self) -> &Arc<Notify> {
        &self.wake
    }
}

/// A running state machine.
pub struct StateMachineInstance {
    id: Uuid,
    parent: Option<Uuid>,
    class: Arc<StateMachineClass>,
    extent: Extent,
    handled_events: BTreeSet<String>,
    active_state: Mutex<Option<StateId>>,
    status: Mutex<InstanceStatus>,
    queue: Mutex<VecDeque<Command>>,
    executing: AtomicBool,
    timeouts: TimeoutActionManager,
    bound_sources: RwLock<HashSet<Uuid>>,
    environment: Arc<InstanceEnvironment>,
}

impl StateMachineInstance {
    /// Creates an instance whose extent is `parent_extent` extended with a
    /// fresh local context. Local declarations are evaluated against the
    /// parent extent. The initial transition is queued.
    pub fn new(
        class: Arc<StateMachineClass>,
        parent_extent: &Extent,
        parent: Option<Uuid>,
        environment: Arc<InstanceEnvironment>,
    ) -> Result<Arc<Self>, RuntimeError> {
        if class.is_abstract() {
            return Err(RuntimeError::AbstractMachine(class.name().to_string()));
        }

        let local = InMemoryContext::with_variables(class.local_context(), parent_extent)?;
        if local.get(EVENT_DATA_VARIABLE).is_err() {
            local.create(EVENT_DATA_VARIABLE, Value::Object(Map::new()))?;
        }

        let instance = Arc::new(Self {
            id: Uuid::new_v4(),
            parent,
            handled_events: class.input_events(),
            extent: parent_extent.extend(Arc::new(local)),
            class,
            active_state: Mutex::new(None),
            status: Mutex::new(InstanceStatus::Running),
            queue: Mutex::new(VecDeque::from([Command::InitialTransition])),
            executing: AtomicBool::new(false),
            timeouts: TimeoutActionManager::new(),
            bound_sources: RwLock::new(HashSet::new()),
            environment,
        });

        tracing::debug!(
            "Created instance {} of '{}'",
            instance.id,
            instance.class.name()
        );
        Ok(instance)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Id of the instance this one is nested in.
    pub fn parent(&self) -> Option<Uuid> {
        self.parent
    }

    pub fn class(&self) -> &Arc<StateMachineClass> {
        &self.class
    }

    pub fn extent(&self) -> &Extent {
        &self.extent
    }

    /// Returns the active state, if the initial transition has run.
    pub fn active_state(&self) -> Option<StateId> {
        *self.active_state.lock()
    }

    /// Returns the name of the active state.
    pub fn active_state_name(&self) -> Option<String> {
        self.active_state()
            .map(|state| self.class.state(state).name().to_string())
    }

    pub fn status(&self) -> InstanceStatus {
        self.status.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        *self.status.lock() == InstanceStatus::Running
    }

    /// Terminated or failed.
    pub fn is_finished(&self) -> bool {
        !self.is_running()
    }

    pub fn timeouts(&self) -> &TimeoutActionManager {
        &self.timeouts
    }

    pub(crate) fn environment(&self) -> &Arc<InstanceEnvironment> {
        &self.environment
    }

    /// Accepts external events sent by `source`.
    pub fn bind_source(&self, source: Uuid) {
        self.bound_sources.write().insert(source);
    }

    pub fn is_bound_to(&self, source: Uuid) -> bool {
        self.bound_sources.read().contains(&source)
    }

    /// Whether this instance has a transition for the event name.
    pub fn handles(&self, event: &str) -> bool {
        self.handled_events.contains(event)
    }

    /// Returns the number of queued commands.
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn has_pending_work(&self) -> bool {
        self.is_running() && !self.queue.lock().is_empty()
    }

    // =========================================================================
    // Queue
    // =========================================================================

    /// Appends a command and wakes the scheduler. Dropped once finished.
    pub(crate) fn enqueue(&self, command: Command) {
        if !self.is_running() {
            tracing::debug!("Instance {} is finished, dropping command", self.id);
            return;
        }
        self.queue.lock().push_back(command);
        self.environment.wake.notify_one();
    }

    /// Queues an incoming event at the tail.
    pub fn receive(&self, event: Event) {
        self.enqueue(Command::Event(event));
    }

    /// Acquires the execution lock if work is queued and the lock is free.
    pub fn try_acquire(self: &Arc<Self>) -> Option<ExecutionGuard> {
        if !self.has_pending_work() {
            return None;
        }
        self.executing
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()?;
        Some(ExecutionGuard {
            instance: self.clone(),
        })
    }

    fn execute_next(self: &Arc<Self>) {
        let Some(command) = self.queue.lock().pop_front() else {
            return;
        };
        if !self.is_running() {
            self.queue.lock().clear();
            return;
        }

        let evaluates_transitions = command.evaluates_transitions();
        let kind = command.kind();
        match command.execute(self) {
            Ok(follow_ups) => {
                if follow_ups.is_empty() || !self.is_running() {
                    return;
                }
                let mut queue = self.queue.lock();
                for follow_up in follow_ups.into_iter().rev() {
                    queue.push_front(follow_up);
                }
            }
            Err(e) if evaluates_transitions => {
                tracing::error!(
                    "Instance {} failed while evaluating transitions ({}): {}",
                    self.id,
                    kind,
                    e
                );
                self.finish(InstanceStatus::Failed(e.to_string()));
            }
            Err(e) => {
                tracing::warn!("Instance {} command {} failed: {}", self.id, kind, e);
            }
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub(crate) fn set_active_state(&self, state: StateId) {
        *self.active_state.lock() = Some(state);
    }

    pub(crate) fn terminate(&self) {
        self.finish(InstanceStatus::Terminated);
    }

    fn finish(&self, status: InstanceStatus) {
        {
            let mut current = self.status.lock();
            if *current != InstanceStatus::Running {
                return;
            }
            *current = status;
        }
        self.timeouts.stop_all();
        self.queue.lock().clear();
        tracing::info!(
            "Instance {} of '{}' finished: {:?}",
            self.id,
            self.class.name(),
            self.status()
        );
        // Let the runtime observe completion
        self.environment.wake.notify_one();
    }

    /// Stops the instance without reaching a terminal state.
    pub fn stop(&self) {
        self.timeouts.stop_all();
        self.queue.lock().clear();
    }
}

impl EventListener for StateMachineInstance {
    fn listener_id(&self) -> Uuid {
        self.id
    }

    fn on_receive_event(&self, event: &Event, source: Uuid) -> bool {
        if !self.is_running() {
            tracing::debug!(
                "Instance {} is finished, dropping event '{}'",
                self.id,
                event.name()
            );
            return false;
        }
        if !self.handles(event.name()) {
            return false;
        }
        let accepted = match event.channel() {
            EventChannel::Internal => false,
            EventChannel::External => self.is_bound_to(source),
            EventChannel::Global => true,
        };
        if accepted {
            self.receive(event.clone());
        }
        accepted
    }
}

impl fmt::Debug for StateMachineInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachineInstance")
            .field("id", &self.id)
            .field("class", &self.class.name())
            .field("active_state", &self.active_state_name())
            .field("status", &self.status())
            .finish()
    }
}

/// Exclusive right to execute the next command of an instance.
pub struct ExecutionGuard {
    instance: Arc<StateMachineInstance>,
}

impl ExecutionGuard {
    pub fn instance(&self) -> &Arc<StateMachineInstance> {
        &self.instance
    }

    /// Executes the next queued command, then releases the lock.
    pub fn execute(self) {
        self.instance.execute_next();
    }
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        self.instance.executing.store(false, Ordering::Release);
        if self.instance.has_pending_work() {
            self.instance.environment.wake.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::LocalEventBroker;
    use cirrina_core::description::StateMachineDescription;
    use cirrina_core::StateMachineClassBuilder;
    use serde_json::json;
    use std::collections::HashMap;

    fn sample_class(value: serde_json::Value) -> Arc<StateMachineClass> {
        let description: StateMachineDescription = serde_json::from_value(value).unwrap();
        let known = HashMap::new();
        Arc::new(
            StateMachineClassBuilder::new(&description, &known)
                .build()
                .unwrap(),
        )
    }

    fn sample_environment() -> (Arc<LocalEventBroker>, Arc<InstanceEnvironment>) {
        let broker = Arc::new(LocalEventBroker::default());
        let environment = Arc::new(InstanceEnvironment::new(
            broker.clone(),
            ServiceImplementationSelector::new(),
        ));
        (broker, environment)
    }

    fn persistent(variables: &[(&str, serde_json::Value)]) -> Extent {
        let context = InMemoryContext::new();
        for (name, value) in variables {
            context.create(name, value.clone()).unwrap();
        }
        Extent::new(Arc::new(context))
    }

    /// Runs queued commands until the instance is idle.
    fn drain(instance: &Arc<StateMachineInstance>) {
        while let Some(guard) = instance.try_acquire() {
            guard.execute();
        }
    }

    fn counter_class() -> Arc<StateMachineClass> {
        sample_class(json!({
            "name": "counter",
            "local_context": {"variables": [{"name": "n", "value": "start * 10"}]},
            "states": [
                {"name": "idle", "initial": true,
                 "on": [{"event": "inc", "target": "counting",
                         "guards": [{"expression": "n < 12"}],
                         "actions": [{"type": "assign", "variable": {"name": "n", "value": "n + 1"}}],
                         "else": "full"},
                        {"event": "stop", "target": "done"}]},
                {"name": "counting",
                 "entry": [{"type": "assign", "variable": {"name": "total", "value": "total + n"}}],
                 "always": [{"target": "idle"}]},
                {"name": "full"},
                {"name": "done", "terminal": true,
                 "entry": [{"type": "assign", "variable": {"name": "total", "value": "-1"}}]}
            ]
        }))
    }

    #[test]
    fn test_initial_state_and_local_context() {
        let (_, environment) = sample_environment();
        let parent = persistent(&[("start", json!(1)), ("total", json!(0))]);
        let instance =
            StateMachineInstance::new(counter_class(), &parent, None, environment).unwrap();

        assert_eq!(instance.pending(), 1);
        drain(&instance);

        assert_eq!(instance.active_state_name().as_deref(), Some("idle"));
        assert_eq!(instance.extent().try_resolve("n").unwrap(), Some(json!(10)));
        assert_eq!(
            instance.extent().try_resolve(EVENT_DATA_VARIABLE).unwrap(),
            Some(json!({}))
        );
        // local variables never leak into the parent extent
        assert_eq!(parent.try_resolve("n").unwrap(), None);
    }

    #[test]
    fn test_event_transition_and_always() {
        let (_, environment) = sample_environment();
        let parent = persistent(&[("start", json!(1)), ("total", json!(0))]);
        let instance =
            StateMachineInstance::new(counter_class(), &parent, None, environment).unwrap();
        drain(&instance);

        instance.receive(Event::new("inc", EventChannel::Internal, vec![]));
        drain(&instance);

        assert_eq!(instance.active_state_name().as_deref(), Some("idle"));
        assert_eq!(instance.extent().try_resolve("n").unwrap(), Some(json!(11)));
        assert_eq!(parent.try_resolve("total").unwrap(), Some(json!(11)));
    }

    #[test]
    fn test_else_target() {
        let (_, environment) = sample_environment();
        let parent = persistent(&[("start", json!(2)), ("total", json!(0))]);
        let instance =
            StateMachineInstance::new(counter_class(), &parent, None, environment).unwrap();
        drain(&instance);

        instance.receive(Event::new("inc", EventChannel::Internal, vec![]));
        drain(&instance);

        assert_eq!(instance.active_state_name().as_deref(), Some("full"));
        // transition actions are skipped for else-targets
        assert_eq!(instance.extent().try_resolve("n").unwrap(), Some(json!(20)));
    }

    #[test]
    fn test_terminal_state_terminates() {
        let (_, environment) = sample_environment();
        let parent = persistent(&[("start", json!(1)), ("total", json!(0))]);
        let instance =
            StateMachineInstance::new(counter_class(), &parent, None, environment).unwrap();
        drain(&instance);

        instance.receive(Event::new("stop", EventChannel::Internal, vec![]));
        instance.receive(Event::new("inc", EventChannel::Internal, vec![]));
        drain(&instance);

        assert_eq!(instance.status(), InstanceStatus::Terminated);
        assert_eq!(parent.try_resolve("total").unwrap(), Some(json!(-1)));
        assert_eq!(instance.pending(), 0);

        // events after termination are dropped
        instance.receive(Event::new("inc", EventChannel::Internal, vec![]));
        assert_eq!(instance.pending(), 0);
        assert!(instance.try_acquire().is_none());
    }

    #[test]
    fn test_event_data_is_written() {
        let class = sample_class(json!({
            "name": "receiver",
            "local_context": {"variables": [{"name": "payload", "value": "0"}]},
            "states": [
                {"name": "a", "initial": true,
                 "on": [{"event": "data", "target": "b", "guards": [{"expression": "payload > 1"}]}]},
                {"name": "b"}
            ]
        }));
        let (_, environment) = sample_environment();
        let instance =
            StateMachineInstance::new(class, &persistent(&[]), None, environment).unwrap();
        drain(&instance);

        let event = Event::new(
            "data",
            EventChannel::Global,
            vec![
                cirrina_core::ContextVariable::new("payload", json!(5)),
                cirrina_core::ContextVariable::new("unknown", json!(true)),
            ],
        );
        instance.receive(event);
        drain(&instance);

        assert_eq!(instance.active_state_name().as_deref(), Some("b"));
        assert_eq!(
            instance.extent().try_resolve(EVENT_DATA_VARIABLE).unwrap(),
            Some(json!({"payload": 5, "unknown": true}))
        );
        assert_eq!(instance.extent().try_resolve("unknown").unwrap(), None);
    }

    #[tokio::test]
    async fn test_internal_transition_keeps_state_active() {
        let class = sample_class(json!({
            "name": "internal",
            "states": [
                {"name": "a", "initial": true,
                 "entry": [{"type": "assign", "variable": {"name": "entries", "value": "entries + 1"}}],
                 "exit": [{"type": "assign", "variable": {"name": "exits", "value": "exits + 1"}}],
                 "after": [{"type": "timeout", "name": "slow", "delay": "60000",
                            "action": {"type": "assign", "variable": {"name": "ticks", "value": "ticks + 1"}}}],
                 "on": [{"event": "e",
                         "actions": [{"type": "assign", "variable": {"name": "acts", "value": "acts + 1"}}]}]}
            ]
        }));
        let (_, environment) = sample_environment();
        let parent = persistent(&[
            ("entries", json!(0)),
            ("exits", json!(0)),
            ("acts", json!(0)),
            ("ticks", json!(0)),
        ]);
        let instance = StateMachineInstance::new(class, &parent, None, environment).unwrap();
        drain(&instance);
        assert!(instance.timeouts().is_active("slow"));

        instance.receive(Event::new("e", EventChannel::Internal, vec![]));
        drain(&instance);

        assert_eq!(instance.active_state_name().as_deref(), Some("a"));
        assert_eq!(parent.try_resolve("entries").unwrap(), Some(json!(1)));
        assert_eq!(parent.try_resolve("exits").unwrap(), Some(json!(0)));
        assert_eq!(parent.try_resolve("acts").unwrap(), Some(json!(1)));
        // timeouts of the active state keep running
        assert!(instance.timeouts().is_active("slow"));
        instance.stop();
    }

    #[test]
    fn test_event_without_passing_guard_has_no_effect() {
        let class = sample_class(json!({
            "name": "guarded",
            "local_context": {"variables": [{"name": "x", "value": "0"}]},
            "states": [
                {"name": "a", "initial": true,
                 "on": [{"event": "e", "target": "b", "guards": [{"expression": "x > 10"}]}]},
                {"name": "b"}
            ]
        }));
        let (_, environment) = sample_environment();
        let instance =
            StateMachineInstance::new(class, &persistent(&[]), None, environment).unwrap();
        drain(&instance);

        let event = Event::new(
            "e",
            EventChannel::Internal,
            vec![cirrina_core::ContextVariable::new("x", json!(5))],
        );
        instance.receive(event);
        drain(&instance);

        assert!(instance.is_running());
        assert_eq!(instance.active_state_name().as_deref(), Some("a"));
        assert_eq!(instance.extent().try_resolve("x").unwrap(), Some(json!(0)));
        assert_eq!(
            instance.extent().try_resolve(EVENT_DATA_VARIABLE).unwrap(),
            Some(json!({}))
        );

        // the same data passes once it satisfies the guard
        let event = Event::new(
            "e",
            EventChannel::Internal,
            vec![cirrina_core::ContextVariable::new("x", json!(11))],
        );
        instance.receive(event);
        drain(&instance);

        assert_eq!(instance.active_state_name().as_deref(), Some("b"));
        assert_eq!(instance.extent().try_resolve("x").unwrap(), Some(json!(11)));
    }

    #[test]
    fn test_guard_error_fails_instance() {
        let class = sample_class(json!({
            "name": "broken",
            "states": [
                {"name": "a", "initial": true,
                 "on": [{"event": "go", "target": "a", "guards": [{"expression": "missing + 1"}]}]}
            ]
        }));
        let (_, environment) = sample_environment();
        let instance =
            StateMachineInstance::new(class, &persistent(&[]), None, environment).unwrap();
        drain(&instance);

        instance.receive(Event::new("go", EventChannel::Internal, vec![]));
        drain(&instance);
        assert!(matches!(instance.status(), InstanceStatus::Failed(_)));
    }

    #[test]
    fn test_action_error_is_local() {
        let class = sample_class(json!({
            "name": "tolerant",
            "states": [
                {"name": "a", "initial": true,
                 "entry": [{"type": "assign", "variable": {"name": "nope", "value": "1"}},
                           {"type": "create", "variable": {"name": "made", "value": "2"}}]}
            ]
        }));
        let (_, environment) = sample_environment();
        let instance =
            StateMachineInstance::new(class, &persistent(&[]), None, environment).unwrap();
        drain(&instance);

        assert!(instance.is_running());
        assert_eq!(instance.extent().try_resolve("made").unwrap(), Some(json!(2)));
    }

    #[test]
    fn test_receive_filters_channels() {
        let class = sample_class(json!({
            "name": "listener",
            "states": [{"name": "a", "initial": true, "on": [{"event": "e", "target": "a"}]}]
        }));
        let (_, environment) = sample_environment();
        let instance =
            StateMachineInstance::new(class, &persistent(&[]), None, environment).unwrap();
        drain(&instance);

        let sender = Uuid::new_v4();
        let external = Event::new("e", EventChannel::External, vec![]);
        assert!(!instance.on_receive_event(&external, sender));
        instance.bind_source(sender);
        assert!(instance.on_receive_event(&external, sender));

        let internal = Event::new("e", EventChannel::Internal, vec![]);
        assert!(!instance.on_receive_event(&internal, sender));

        let unhandled = Event::new("other", EventChannel::Global, vec![]);
        assert!(!instance.on_receive_event(&unhandled, sender));

        let global = Event::new("e", EventChannel::Global, vec![]);
        assert!(instance.on_receive_event(&global, Uuid::new_v4()));
        assert_eq!(instance.pending(), 2);
    }

    #[test]
    fn test_execution_lock_is_exclusive() {
        let class = sample_class(json!({
            "name": "single",
            "states": [{"name": "a", "initial": true}]
        }));
        let (_, environment) = sample_environment();
        let instance =
            StateMachineInstance::new(class, &persistent(&[]), None, environment).unwrap();

        let guard = instance.try_acquire().unwrap();
        assert!(instance.try_acquire().is_none());
        drop(guard);
        assert!(instance.try_acquire().is_some());
    }

    #[test]
    fn test_abstract_class_rejected() {
        let class = sample_class(json!({
            "name": "abstract", "abstract": true,
            "states": [{"name": "a", "initial": true}]
        }));
        let (_, environment) = sample_environment();
        assert!(matches!(
            StateMachineInstance::new(class, &persistent(&[]), None, environment),
            Err(RuntimeError::AbstractMachine(_))
        ));
    }
}
