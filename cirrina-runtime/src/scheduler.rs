//! Instance scheduling policies.

use crate::config::SchedulerPolicy;
use crate::instance::{ExecutionGuard, StateMachineInstance};
use std::sync::Arc;

/// Decides which instance runs its next command.
pub trait RuntimeScheduler: Send {
    /// Selects an instance with queued work and a free execution lock,
    /// returning its acquired lock. None means no instance is ready.
    fn select(&mut self, instances: &[Arc<StateMachineInstance>]) -> Option<ExecutionGuard>;
}

/// Cycles through instances, resuming after the last selected one.
#[derive(Debug, Default)]
pub struct RoundRobinScheduler {
    next: usize,
}

impl RoundRobinScheduler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RuntimeScheduler for RoundRobinScheduler {
    fn select(&mut self, instances: &[Arc<StateMachineInstance>]) -> Option<ExecutionGuard> {
        let count = instances.len();
        if count == 0 {
            return None;
        }
        let start = self.next % count;
        for offset in 0..count {
            let index = (start + offset) % count;
            if let Some(guard) = instances[index].try_acquire() {
                self.next = index + 1;
                return Some(guard);
            }
        }
        None
    }
}

/// Creates the scheduler for a policy.
pub fn create_scheduler(policy: SchedulerPolicy) -> Box<dyn RuntimeScheduler> {
    match policy {
        SchedulerPolicy::RoundRobin => Box::new(RoundRobinScheduler::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::LocalEventBroker;
    use crate::instance::InstanceEnvironment;
    use crate::service::ServiceImplementationSelector;
    use cirrina_core::description::StateMachineDescription;
    use cirrina_core::{Extent, InMemoryContext, StateMachineClassBuilder};
    use serde_json::json;
    use std::collections::HashMap;

    fn sample_instances(count: usize) -> Vec<Arc<StateMachineInstance>> {
        let description: StateMachineDescription = serde_json::from_value(json!({
            "name": "idle",
            "states": [{"name": "a", "initial": true}]
        }))
        .unwrap();
        let known = HashMap::new();
        let class = Arc::new(
            StateMachineClassBuilder::new(&description, &known)
                .build()
                .unwrap(),
        );
        let environment = Arc::new(InstanceEnvironment::new(
            Arc::new(LocalEventBroker::default()),
            ServiceImplementationSelector::new(),
        ));
        let extent = Extent::new(Arc::new(InMemoryContext::new()));
        (0..count)
            .map(|_| {
                StateMachineInstance::new(class.clone(), &extent, None, environment.clone())
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn test_round_robin_order() {
        let instances = sample_instances(3);
        let mut scheduler = RoundRobinScheduler::new();

        let mut order = Vec::new();
        let mut guards = Vec::new();
        for _ in 0..3 {
            let guard = scheduler.select(&instances).unwrap();
            order.push(guard.instance().id());
            // keep locks held so the next pass must move on
            guards.push(guard);
        }
        let expected: Vec<_> = instances.iter().map(|i| i.id()).collect();
        assert_eq!(order, expected);

        // all locked
        assert!(scheduler.select(&instances).is_none());
    }

    #[test]
    fn test_skips_idle_instances() {
        let instances = sample_instances(2);
        let mut scheduler = RoundRobinScheduler::new();

        // run the first instance dry
        while let Some(guard) = instances[0].try_acquire() {
            guard.execute();
        }

        let guard = scheduler.select(&instances).unwrap();
        assert_eq!(guard.instance().id(), instances[1].id());
        guard.execute();

        while let Some(guard) = scheduler.select(&instances) {
            guard.execute();
        }
        assert!(instances.iter().all(|i| i.pending() == 0));
    }

    #[test]
    fn test_empty() {
        let mut scheduler = create_scheduler(SchedulerPolicy::RoundRobin);
        assert!(scheduler.select(&[]).is_none());
    }
}
