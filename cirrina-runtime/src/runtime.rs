//! The runtime: live instances and the scheduling loop.
//!
//! A single loop decides which instance runs next. Each selected command is
//! executed on the blocking pool, so a slow command only occupies its own
//! instance's execution lock. The loop sleeps on the shared wake signal
//! whenever no instance has both queued work and a free lock.

use crate::broker::EventHandler;
use crate::config::RuntimeConfig;
use crate::error::RuntimeError;
use crate::instance::{ExecutionGuard, InstanceEnvironment, StateMachineInstance};
use crate::scheduler::{create_scheduler, RuntimeScheduler};
use crate::service::ServiceImplementationSelector;
use cirrina_core::{
    CollaborativeStateMachineClass, Context, ContextVariable, CoreError, Extent,
    InMemoryContext, StateMachineClass,
};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Runs the instances of collaborative state machines.
///
/// Cloning is cheap; clones share the same instances and loop.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
    config: RuntimeConfig,
    persistent: Arc<dyn Context>,
    extent: Extent,
    environment: Arc<InstanceEnvironment>,
    instances: RwLock<Vec<Arc<StateMachineInstance>>>,
    scheduler: Mutex<Box<dyn RuntimeScheduler>>,
    shutting_down: AtomicBool,
    shutdown_notify: Notify,
    in_flight: AtomicUsize,
    idle: Notify,
}

impl Runtime {
    /// Creates a runtime. `persistent_context` is the lowest layer of every
    /// instance's extent.
    pub fn new(
        config: RuntimeConfig,
        persistent_context: Arc<dyn Context>,
        broker: Arc<dyn EventHandler>,
        services: ServiceImplementationSelector,
    ) -> Self {
        let scheduler = create_scheduler(config.scheduler);
        Self {
            inner: Arc::new(RuntimeInner {
                extent: Extent::new(persistent_context.clone()),
                persistent: persistent_context,
                environment: Arc::new(InstanceEnvironment::new(broker, services)),
                instances: RwLock::new(Vec::new()),
                scheduler: Mutex::new(scheduler),
                shutting_down: AtomicBool::new(false),
                shutdown_notify: Notify::new(),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
                config,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// The shared persistent context.
    pub fn persistent_context(&self) -> &Arc<dyn Context> {
        &self.inner.persistent
    }

    /// Extent holding only the persistent context.
    pub fn extent(&self) -> &Extent {
        &self.inner.extent
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Spawns the scheduling loop. It exits on shutdown.
    pub fn run(&self) -> JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.schedule().await })
    }

    // =========================================================================
    // Instantiation
    // =========================================================================

    /// Creates the persistent variables declared by a collaborative state
    /// machine. Variables that already exist keep their value.
    pub fn create_persistent_variables(
        &self,
        csm: &CollaborativeStateMachineClass,
    ) -> Result<(), RuntimeError> {
        for variable in csm.persistent_context() {
            let (name, value) = variable.evaluate(&self.inner.extent)?.into_pair()?;
            match self.inner.persistent.create(&name, value) {
                Ok(()) => tracing::debug!("Created persistent variable '{}'", name),
                Err(CoreError::VariableExists { .. }) => {
                    tracing::info!("Persistent variable '{}' already exists, keeping it", name)
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Instantiates the named state machines of `csm`, nested machines
    /// included, and schedules them.
    ///
    /// Returns the ids of all created instances, each parent before its
    /// nested instances. Nothing is scheduled if any name fails to resolve.
    pub fn new_instances(
        &self,
        csm: &CollaborativeStateMachineClass,
        names: &[&str],
    ) -> Result<Vec<Uuid>, RuntimeError> {
        self.ensure_accepting()?;
        let classes = names
            .iter()
            .map(|name| resolve_class(csm, name))
            .collect::<Result<Vec<_>, _>>()?;

        self.create_persistent_variables(csm)?;
        let extent = self.collaborative_extent(csm)?;

        let mut created = Vec::new();
        for class in classes {
            self.inner.instantiate(class, &extent, None, &mut created)?;
        }
        Ok(self.inner.register(created))
    }

    /// Instantiates one state machine with initial data and event bindings.
    ///
    /// `data` is evaluated against the new instance's extent and written
    /// (set or create) before the instance is scheduled. External events
    /// sent by any of `bindings` are accepted by the instance.
    pub fn new_instance_with_data(
        &self,
        csm: &CollaborativeStateMachineClass,
        name: &str,
        data: &[ContextVariable],
        bindings: &[Uuid],
    ) -> Result<Uuid, RuntimeError> {
        self.ensure_accepting()?;
        let class = resolve_class(csm, name)?;

        self.create_persistent_variables(csm)?;
        let extent = self.collaborative_extent(csm)?;

        let mut created = Vec::new();
        self.inner.instantiate(class, &extent, None, &mut created)?;

        let instance = &created[0];
        for variable in data {
            let (variable_name, value) = variable.evaluate(instance.extent())?.into_pair()?;
            instance.extent().set_or_create(&variable_name, value)?;
        }
        for source in bindings {
            instance.bind_source(*source);
        }

        let id = instance.id();
        self.inner.register(created);
        Ok(id)
    }

    fn ensure_accepting(&self) -> Result<(), RuntimeError> {
        if self.is_shutting_down() {
            return Err(RuntimeError::ShuttingDown);
        }
        Ok(())
    }

    /// Persistent extent extended with the collaborative local context.
    fn collaborative_extent(
        &self,
        csm: &CollaborativeStateMachineClass,
    ) -> Result<Extent, RuntimeError> {
        let local = InMemoryContext::with_variables(csm.local_context(), &self.inner.extent)?;
        Ok(self.inner.extent.extend(Arc::new(local)))
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Finds a live instance.
    pub fn find_instance(&self, id: Uuid) -> Option<Arc<StateMachineInstance>> {
        self.inner
            .instances
            .read()
            .iter()
            .find(|instance| instance.id() == id)
            .cloned()
    }

    /// Ids of all live instances.
    pub fn instance_ids(&self) -> Vec<Uuid> {
        self.inner
            .instances
            .read()
            .iter()
            .map(|instance| instance.id())
            .collect()
    }

    pub fn instance_count(&self) -> usize {
        self.inner.instances.read().len()
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Stops accepting work and waits up to `timeout` for in-flight commands.
    ///
    /// Returns true if every in-flight command finished in time.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let inner = &self.inner;
        if !inner.shutting_down.swap(true, Ordering::SeqCst) {
            tracing::info!("Shutting down runtime '{}'", inner.config.name);
        }
        inner.shutdown_notify.notify_one();

        for instance in inner.instances.read().iter() {
            instance.stop();
            inner.environment.broker.unsubscribe(instance.id());
        }

        let drained = async {
            loop {
                let notified = inner.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if inner.in_flight.load(Ordering::SeqCst) == 0 {
                    return;
                }
                notified.await;
            }
        };

        match tokio::time::timeout(timeout, drained).await {
            Ok(()) => {
                tracing::info!("Runtime '{}' stopped", inner.config.name);
                true
            }
            Err(_) => {
                tracing::warn!(
                    "Runtime '{}' shutdown timed out with {} command(s) in flight",
                    inner.config.name,
                    inner.in_flight.load(Ordering::SeqCst)
                );
                false
            }
        }
    }
}

impl RuntimeInner {
    async fn schedule(self: Arc<Self>) {
        tracing::info!("Runtime '{}' started", self.config.name);
        let wake = self.environment.wake().clone();

        while !self.shutting_down.load(Ordering::SeqCst) {
            let selected = {
                let instances = self.instances.read();
                self.scheduler.lock().select(&instances)
            };

            match selected {
                Some(guard) => {
                    self.dispatch(guard);
                    // Timer and invoke tasks may share this thread
                    tokio::task::yield_now().await;
                }
                None => {
                    tokio::select! {
                        _ = wake.notified() => {}
                        _ = self.shutdown_notify.notified() => {}
                    }
                }
            }
        }

        tracing::debug!("Scheduling loop of '{}' exited", self.config.name);
    }

    /// Executes one command on the blocking pool.
    fn dispatch(self: &Arc<Self>, guard: ExecutionGuard) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.shutting_down.load(Ordering::SeqCst) {
            drop(guard);
            self.complete();
            return;
        }

        let inner = self.clone();
        tokio::task::spawn_blocking(move || {
            let instance = guard.instance().clone();
            guard.execute();
            if instance.is_finished() {
                inner.remove(&instance);
            }
            inner.complete();
        });
    }

    fn complete(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    fn instantiate(
        &self,
        class: &Arc<StateMachineClass>,
        parent_extent: &Extent,
        parent: Option<Uuid>,
        created: &mut Vec<Arc<StateMachineInstance>>,
    ) -> Result<(), RuntimeError> {
        let instance = StateMachineInstance::new(
            class.clone(),
            parent_extent,
            parent,
            self.environment.clone(),
        )?;
        created.push(instance.clone());

        for nested in class.nested() {
            self.instantiate(nested, instance.extent(), Some(instance.id()), created)?;
        }
        Ok(())
    }

    /// Subscribes the instances and adds them to the table under the table
    /// lock, so no instance is visible in one without the other.
    fn register(&self, created: Vec<Arc<StateMachineInstance>>) -> Vec<Uuid> {
        let ids: Vec<Uuid> = created.iter().map(|instance| instance.id()).collect();
        {
            let mut instances = self.instances.write();
            for instance in &created {
                self.environment.broker.subscribe(instance.clone());
            }
            instances.extend(created);
        }

        tracing::info!(
            "Runtime '{}' scheduled {} new instance(s)",
            self.config.name,
            ids.len()
        );
        self.environment.wake().notify_one();
        ids
    }

    fn remove(&self, instance: &StateMachineInstance) {
        let id = instance.id();
        let removed = {
            let mut instances = self.instances.write();
            let before = instances.len();
            instances.retain(|live| live.id() != id);
            before != instances.len()
        };
        if removed {
            self.environment.broker.unsubscribe(id);
            tracing::debug!("Removed instance {} ({:?})", id, instance.status());
        }
    }
}

fn resolve_class<'c>(
    csm: &'c CollaborativeStateMachineClass,
    name: &str,
) -> Result<&'c Arc<StateMachineClass>, RuntimeError> {
    let class = csm
        .find_state_machine_class_by_name(name)
        .ok_or_else(|| RuntimeError::MachineNotFound(name.to_string()))?;
    if class.is_abstract() {
        return Err(RuntimeError::AbstractMachine(name.to_string()));
    }
    Ok(class)
}
