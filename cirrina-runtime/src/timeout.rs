//! Named, periodically repeating timeout tasks.

use crate::error::RuntimeError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Manages the active timeouts of one instance.
///
/// Each timeout fires first after one period and then every period until it
/// is stopped. Stopping races with an occurrence that already fired; that
/// occurrence still runs once.
#[derive(Default)]
pub struct TimeoutActionManager {
    timeouts: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TimeoutActionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a timeout. `on_fire` runs on every occurrence; returning false
    /// ends the timeout.
    pub fn start<F>(&self, name: &str, period: Duration, on_fire: F) -> Result<(), RuntimeError>
    where
        F: Fn() -> bool + Send + 'static,
    {
        if period.is_zero() {
            return Err(RuntimeError::InvalidDelay {
                name: name.to_string(),
                value: "0".to_string(),
            });
        }
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| RuntimeError::Executor(e.to_string()))?;

        let mut timeouts = self.timeouts.lock();
        if timeouts
            .get(name)
            .map(|task| !task.is_finished())
            .unwrap_or(false)
        {
            return Err(RuntimeError::TimeoutExists(name.to_string()));
        }

        let task = handle.spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if !on_fire() {
                    break;
                }
            }
        });
        timeouts.insert(name.to_string(), task);

        tracing::debug!("Timeout '{}' started with period {:?}", name, period);
        Ok(())
    }

    /// Stops a timeout by name.
    pub fn stop(&self, name: &str) -> Result<(), RuntimeError> {
        match self.timeouts.lock().remove(name) {
            Some(task) if !task.is_finished() => {
                task.abort();
                tracing::debug!("Timeout '{}' stopped", name);
                Ok(())
            }
            _ => Err(RuntimeError::TimeoutNotFound(name.to_string())),
        }
    }

    /// Stops every timeout.
    pub fn stop_all(&self) {
        let mut timeouts = self.timeouts.lock();
        for (name, task) in timeouts.drain() {
            task.abort();
            tracing::debug!("Timeout '{}' stopped", name);
        }
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.timeouts
            .lock()
            .get(name)
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    /// Returns the number of running timeouts.
    pub fn active_count(&self) -> usize {
        self.timeouts
            .lock()
            .values()
            .filter(|task| !task.is_finished())
            .count()
    }
}

impl Drop for TimeoutActionManager {
    fn drop(&mut self) {
        for task in self.timeouts.get_mut().values() {
            task.abort();
        }
    }
}
