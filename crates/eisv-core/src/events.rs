//! Lifecycle event fan-out to connected clients

use crate::protocol::EventMessage;
use crate::types::LifecycleEventKind;
use tokio::sync::broadcast;

/// Broadcast bus; publishing with no subscribers is not an error.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<EventMessage>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventMessage> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: EventMessage) {
        let _ = self.tx.send(event);
    }

    pub fn lifecycle(&self, agent: &str, kind: LifecycleEventKind, detail: Option<&str>) {
        tracing::info!("lifecycle: {} {} {}", agent, kind.as_str(), detail.unwrap_or(""));
        self.publish(EventMessage::lifecycle(agent, kind.as_str(), detail));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
