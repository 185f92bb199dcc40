//! Fleet-wide instantiation through a coordination service.
//!
//! Jobs are nodes under the configured jobs path (`/jobs/job<N>`) holding a
//! JSON [`JobDescription`]. Every runtime watches that path; a runtime whose
//! name matches the job claims it under `<locks_path>/<job>`, instantiates
//! the machine and deletes the node, so each job is consumed exactly once.

use crate::config::CoordinationConfig;
use crate::error::RuntimeError;
use crate::runtime::Runtime;
use async_trait::async_trait;
use cirrina_core::description::VariableDescription;
use cirrina_core::{
    CollaborativeStateMachineClassBuilder, CollaborativeStateMachineDescription,
    ContextVariable,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Change of a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Created(String),
    Deleted(String),
}

/// Hierarchical nodes with change notifications and named locks.
#[async_trait]
pub trait CoordinationService: Send + Sync {
    /// Creates a node. Fails if it exists.
    async fn create(&self, path: &str, data: Vec<u8>) -> Result<(), RuntimeError>;

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, RuntimeError>;

    /// Deletes a node. Returns false if it was absent.
    async fn delete(&self, path: &str) -> Result<bool, RuntimeError>;

    /// Full paths of the direct children of `path`, sorted.
    async fn children(&self, path: &str) -> Result<Vec<String>, RuntimeError>;

    /// Subscribes to node changes.
    fn watch(&self) -> broadcast::Receiver<WatchEvent>;

    /// Acquires a named lock without waiting.
    ///
    /// Fails with [`RuntimeError::LockContended`] if another owner holds it.
    async fn try_lock(&self, path: &str, owner: &str) -> Result<(), RuntimeError>;

    /// Releases a lock held by `owner`.
    async fn unlock(&self, path: &str, owner: &str) -> Result<(), RuntimeError>;
}

/// In-process coordination service.
pub struct InMemoryCoordination {
    nodes: DashMap<String, Vec<u8>>,
    locks: DashMap<String, String>,
    events: broadcast::Sender<WatchEvent>,
}

impl InMemoryCoordination {
    pub fn new(channel_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(channel_capacity.max(1));
        Self {
            nodes: DashMap::new(),
            locks: DashMap::new(),
            events,
        }
    }
}

impl Default for InMemoryCoordination {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl CoordinationService for InMemoryCoordination {
    async fn create(&self, path: &str, data: Vec<u8>) -> Result<(), RuntimeError> {
        match self.nodes.entry(path.to_string()) {
            Entry::Occupied(_) => {
                return Err(RuntimeError::Coordination(format!(
                    "node '{}' already exists",
                    path
                )))
            }
            Entry::Vacant(entry) => {
                entry.insert(data);
            }
        }
        // Ignore send errors (no watchers)
        let _ = self.events.send(WatchEvent::Created(path.to_string()));
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, RuntimeError> {
        Ok(self.nodes.get(path).map(|node| node.value().clone()))
    }

    async fn delete(&self, path: &str) -> Result<bool, RuntimeError> {
        if self.nodes.remove(path).is_none() {
            return Ok(false);
        }
        let _ = self.events.send(WatchEvent::Deleted(path.to_string()));
        Ok(true)
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, RuntimeError> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let mut children: Vec<String> = self
            .nodes
            .iter()
            .map(|node| node.key().clone())
            .filter(|key| {
                key.strip_prefix(&prefix)
                    .is_some_and(|rest| !rest.is_empty() && !rest.contains('/'))
            })
            .collect();
        children.sort();
        Ok(children)
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }

    async fn try_lock(&self, path: &str, owner: &str) -> Result<(), RuntimeError> {
        match self.locks.entry(path.to_string()) {
            Entry::Occupied(entry) if entry.get() == owner => Ok(()),
            Entry::Occupied(_) => Err(RuntimeError::LockContended(path.to_string())),
            Entry::Vacant(entry) => {
                entry.insert(owner.to_string());
                Ok(())
            }
        }
    }

    async fn unlock(&self, path: &str, owner: &str) -> Result<(), RuntimeError> {
        match self.locks.entry(path.to_string()) {
            Entry::Occupied(entry) if entry.get() == owner => {
                entry.remove();
                Ok(())
            }
            Entry::Occupied(_) => Err(RuntimeError::Coordination(format!(
                "lock '{}' is not held by '{}'",
                path, owner
            ))),
            Entry::Vacant(_) => Err(RuntimeError::Coordination(format!(
                "lock '{}' is not held",
                path
            ))),
        }
    }
}

// =============================================================================
// Jobs
// =============================================================================

/// Request to instantiate one state machine on a named runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDescription {
    /// The collaborative state machine containing the machine.
    pub collaborative_state_machine: CollaborativeStateMachineDescription,
    /// The machine to instantiate.
    pub state_machine_name: String,
    /// Variables written into the new instance before it runs.
    #[serde(default)]
    pub local_data: Vec<VariableDescription>,
    /// Instances whose external events the new instance accepts.
    #[serde(default)]
    pub bind_event_instance_ids: Vec<Uuid>,
    /// Runtime expected to take the job.
    pub runtime_name: String,
}

/// Watches for jobs and instantiates those addressed to its runtime.
pub struct JobMonitor {
    runtime: Runtime,
    coordination: Arc<dyn CoordinationService>,
    config: CoordinationConfig,
    pattern: Regex,
    owner: String,
    shutdown: AtomicBool,
    shutdown_notify: Notify,
}

impl JobMonitor {
    pub fn new(
        runtime: Runtime,
        coordination: Arc<dyn CoordinationService>,
        config: CoordinationConfig,
    ) -> Result<Self, RuntimeError> {
        let pattern = Regex::new(&format!(r"^{}/(job\d+)$", regex::escape(&config.jobs_path)))
            .map_err(|e| RuntimeError::Coordination(e.to_string()))?;
        let owner = format!("{}-{}", runtime.name(), Uuid::new_v4());
        Ok(Self {
            runtime,
            coordination,
            config,
            pattern,
            owner,
            shutdown: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
        })
    }

    /// Returns the job name if `path` is a job node.
    pub fn job_name<'p>(&self, path: &'p str) -> Option<&'p str> {
        self.pattern
            .captures(path)
            .and_then(|captures| captures.get(1))
            .map(|name| name.as_str())
    }

    /// Spawns the watch loop. Jobs published before the loop starts are
    /// picked up by an initial scan.
    pub fn run(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut events = self.coordination.watch();
            self.scan().await;

            loop {
                if self.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                tokio::select! {
                    _ = self.shutdown_notify.notified() => {}
                    event = events.recv() => match event {
                        Ok(WatchEvent::Created(path)) => self.process(&path).await,
                        Ok(WatchEvent::Deleted(_)) => {}
                        Err(RecvError::Lagged(n)) => {
                            tracing::warn!("Job monitor lagged by {} events, rescanning", n);
                            self.scan().await;
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }

            tracing::debug!("Job monitor of '{}' stopped", self.runtime.name());
        })
    }

    /// Stops the watch loop.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.shutdown_notify.notify_one();
    }

    async fn scan(&self) {
        match self.coordination.children(&self.config.jobs_path).await {
            Ok(paths) => {
                for path in paths {
                    self.process(&path).await;
                }
            }
            Err(e) => tracing::error!("Failed to list jobs: {}", e),
        }
    }

    async fn process(&self, path: &str) {
        if let Err(e) = self.handle_job(path).await {
            tracing::error!("Job '{}' failed: {}", path, e);
        }
    }

    /// Handles one job node.
    ///
    /// Returns the new instance id, or None if the job was not taken here
    /// (not a job node, another runtime's job, claimed elsewhere, or gone).
    pub async fn handle_job(&self, path: &str) -> Result<Option<Uuid>, RuntimeError> {
        let Some(name) = self.job_name(path) else {
            return Ok(None);
        };
        let Some(data) = self.coordination.get(path).await? else {
            return Ok(None);
        };

        let job: JobDescription = match serde_json::from_slice(&data) {
            Ok(job) => job,
            Err(e) => {
                self.coordination.delete(path).await?;
                tracing::warn!("Deleted malformed job '{}'", name);
                return Err(RuntimeError::MalformedJob {
                    path: path.to_string(),
                    reason: e.to_string(),
                });
            }
        };

        if job.runtime_name != self.runtime.name() {
            tracing::debug!(
                "Ignoring job '{}' for runtime '{}'",
                name,
                job.runtime_name
            );
            return Ok(None);
        }

        let lock = format!("{}/{}", self.config.locks_path, name);
        match self.coordination.try_lock(&lock, &self.owner).await {
            Ok(()) => {}
            Err(e) if e.is_retryable() => {
                tracing::debug!("Job '{}' is claimed by another runtime", name);
                return Ok(None);
            }
            Err(e) => return Err(e),
        }

        let result = self.take_job(path, name, &job).await;

        if let Err(e) = self.coordination.unlock(&lock, &self.owner).await {
            tracing::error!("Failed to release lock '{}': {}", lock, e);
        }
        result
    }

    async fn take_job(
        &self,
        path: &str,
        name: &str,
        job: &JobDescription,
    ) -> Result<Option<Uuid>, RuntimeError> {
        // Consumed while we were waiting for the lock
        if self.coordination.get(path).await?.is_none() {
            return Ok(None);
        }

        let data: Vec<ContextVariable> = job
            .local_data
            .iter()
            .map(|variable| ContextVariable::lazy(variable.name.clone(), variable.value.clone()))
            .collect();

        let created = CollaborativeStateMachineClassBuilder::new(&job.collaborative_state_machine)
            .build()
            .map_err(RuntimeError::from)
            .and_then(|csm| {
                self.runtime.new_instance_with_data(
                    &csm,
                    &job.state_machine_name,
                    &data,
                    &job.bind_event_instance_ids,
                )
            });

        match created {
            Ok(id) => {
                self.coordination.delete(path).await?;
                tracing::info!(
                    "Job '{}' instantiated '{}' as {}",
                    name,
                    job.state_machine_name,
                    id
                );
                Ok(Some(id))
            }
            // Leave the job to the remaining runtimes
            Err(RuntimeError::ShuttingDown) => Err(RuntimeError::ShuttingDown),
            Err(e) => {
                self.coordination.delete(path).await?;
                tracing::warn!("Deleted job '{}' that cannot be instantiated", name);
                Err(e)
            }
        }
    }
}
