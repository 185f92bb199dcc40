//! Event delivery between state machine instances.
//!
//! [`EventHandler`] is the broker seen by the runtime: listeners subscribe by
//! id and every sent event is offered once to each subscribed listener, which
//! decides whether it accepts the event (channel rules and handled names are
//! the listener's concern). [`LocalEventBroker`] is the in-process broker and
//! additionally publishes every delivery to observers.

use crate::error::RuntimeError;
use cirrina_core::Event;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Receives events from a broker.
pub trait EventListener: Send + Sync {
    /// Identity used for subscription and as event source.
    fn listener_id(&self) -> Uuid;

    /// Offers an event sent by `source`. Returns whether it was accepted.
    fn on_receive_event(&self, event: &Event, source: Uuid) -> bool;
}

/// An event broker.
pub trait EventHandler: Send + Sync {
    /// Subscribes a listener. A listener subscribed twice receives once.
    fn subscribe(&self, listener: Arc<dyn EventListener>);

    /// Unsubscribes a listener. Returns true if it was subscribed.
    fn unsubscribe(&self, listener_id: Uuid) -> bool;

    /// Sends a fully evaluated event on behalf of `source`.
    fn send(&self, event: Event, source: Uuid) -> Result<(), RuntimeError>;
}

/// A delivery observed on the local broker.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub event: Event,
    pub source: Uuid,
    /// Number of listeners that accepted the event.
    pub accepted: usize,
}

/// Filter for delivery observers.
#[derive(Debug, Clone, Default)]
pub struct DeliveryFilter {
    /// Only these event names (empty = all).
    pub events: Vec<String>,
    /// Only events from these sources (empty = all).
    pub sources: Vec<Uuid>,
}

impl DeliveryFilter {
    /// Returns true if the delivery matches this filter.
    pub fn matches(&self, delivery: &Delivery) -> bool {
        (self.events.is_empty() || self.events.iter().any(|name| name == delivery.event.name()))
            && (self.sources.is_empty() || self.sources.contains(&delivery.source))
    }
}

/// In-process event broker.
pub struct LocalEventBroker {
    /// Subscribed listeners by id.
    listeners: DashMap<Uuid, Arc<dyn EventListener>>,

    /// Observation channel.
    observers: broadcast::Sender<Delivery>,
}

impl LocalEventBroker {
    /// Creates a broker with the given observation channel capacity.
    pub fn new(channel_capacity: usize) -> Self {
        let (observers, _) = broadcast::channel(channel_capacity.max(1));
        Self {
            listeners: DashMap::new(),
            observers,
        }
    }

    /// Subscribes to every delivery.
    pub fn observe(&self) -> broadcast::Receiver<Delivery> {
        self.observers.subscribe()
    }

    /// Returns the number of subscribed listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

impl Default for LocalEventBroker {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventHandler for LocalEventBroker {
    fn subscribe(&self, listener: Arc<dyn EventListener>) {
        self.listeners.insert(listener.listener_id(), listener);
    }

    fn unsubscribe(&self, listener_id: Uuid) -> bool {
        self.listeners.remove(&listener_id).is_some()
    }

    fn send(&self, event: Event, source: Uuid) -> Result<(), RuntimeError> {
        event.ensure_has_evaluated_data()?;

        // Deliver outside the map's shard locks
        let listeners: Vec<Arc<dyn EventListener>> = self
            .listeners
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let accepted = listeners
            .iter()
            .filter(|listener| listener.on_receive_event(&event, source))
            .count();

        tracing::trace!(
            "Event '{}' from {} accepted by {} listener(s)",
            event.name(),
            source,
            accepted
        );

        // Ignore send errors (no observers)
        let _ = self.observers.send(Delivery {
            event,
            source,
            accepted,
        });
        Ok(())
    }
}

/// Creates a shared LocalEventBroker.
pub fn create_broker(channel_capacity: usize) -> Arc<LocalEventBroker> {
    Arc::new(LocalEventBroker::new(channel_capacity))
}
