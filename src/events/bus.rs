//! Two independent multicast topics: structured lifecycle envelopes and
//! human-readable operator notifications.
//!
//! Delivery contract per topic: subscribers are created lazily and see
//! only events published after subscription; each subscriber observes
//! one publication order; a lagging subscriber loses its oldest
//! buffered entries (`RecvError::Lagged`) and publication never blocks
//! on it.

use crate::core::config::EventBusConfig;
use crate::events::EventEnvelope;
use tokio::sync::broadcast;
use tracing::debug;

/// Fan-out bus shared by the registry, responders, and operator
/// surfaces. Cloning is cheap; clones publish to the same topics.
#[derive(Clone)]
pub struct EventBus {
    lifecycle_tx: broadcast::Sender<EventEnvelope>,
    notification_tx: broadcast::Sender<String>,
}

impl EventBus {
    pub fn new(cfg: &EventBusConfig) -> Self {
        let (lifecycle_tx, _) = broadcast::channel(cfg.lifecycle_capacity);
        let (notification_tx, _) = broadcast::channel(cfg.notification_capacity);
        Self {
            lifecycle_tx,
            notification_tx,
        }
    }

    /// Publish a lifecycle envelope. Publication failures are swallowed:
    /// observability must not block or fail registry mutations.
    pub fn publish(&self, event: EventEnvelope) {
        if self.lifecycle_tx.send(event).is_err() {
            debug!("lifecycle event dropped: no subscribers");
        }
    }

    /// Publish an operator notification string.
    pub fn notify(&self, message: impl Into<String>) {
        if self.notification_tx.send(message.into()).is_err() {
            debug!("notification dropped: no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.lifecycle_tx.subscribe()
    }

    pub fn subscribe_notifications(&self) -> broadcast::Receiver<String> {
        self.notification_tx.subscribe()
    }

    pub fn lifecycle_subscriber_count(&self) -> usize {
        self.lifecycle_tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(&EventBusConfig::default())
    }
}
