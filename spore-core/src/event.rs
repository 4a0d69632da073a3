//! Typed event bus owned by a [`Replica`](crate::replica::Replica).
//!
//! Publishing never runs a handler: events are queued on a tokio broadcast
//! channel and consumed by whichever tasks hold a receiver, so every reaction
//! runs after the `commit`/`apply` that caused it has returned.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::oplog::Op;

/// Events published on a replica's bus.
#[derive(Debug, Clone)]
pub enum LogEvent {
    /// Local commit; carries every op the commit produced.
    Update(Arc<Vec<Op>>),
    /// Remote ops were merged into the log.
    Apply,
    /// A store re-derived its index.
    Change,
}

impl LogEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            LogEvent::Update(_) => "update",
            LogEvent::Apply => "apply",
            LogEvent::Change => "change",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<LogEvent>,
    capacity: usize,
}

impl EventBus {
    /// `capacity` bounds how far a slow subscriber may lag before it starts
    /// seeing `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    /// Queue an event. Returns the number of subscribers it reached.
    pub fn publish(&self, event: LogEvent) -> usize {
        log::trace!("Publishing {} event", event.topic());
        self.sender.send(event).unwrap_or(0)
    }

    /// Subscribe to all topics. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(8);
        assert_eq!(bus.publish(LogEvent::Apply), 0);
    }

    #[tokio::test]
    async fn test_fan_out_to_subscribers() {
        let bus = EventBus::new(8);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        assert_eq!(bus.publish(LogEvent::Change), 2);
        assert!(matches!(rx1.recv().await.unwrap(), LogEvent::Change));
        assert!(matches!(rx2.recv().await.unwrap(), LogEvent::Change));
    }

    #[test]
    fn test_drop_unsubscribes() {
        let bus = EventBus::new(8);
        let rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        drop(rx);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_topics() {
        assert_eq!(LogEvent::Update(Arc::new(Vec::new())).topic(), "update");
        assert_eq!(LogEvent::Apply.topic(), "apply");
        assert_eq!(LogEvent::Change.topic(), "change");
    }
}
