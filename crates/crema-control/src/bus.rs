//! Broadcast event bus for mode-change and machine-state events.
//!
//! Uses [`tokio::sync::broadcast`] under the hood so that every subscriber
//! (e.g. the external real-time push layer) receives every event without
//! any single subscriber blocking the others.

use tokio::sync::broadcast;

use crema_types::Event;

/// Buffered events per subscriber before old ones are dropped for slow
/// consumers.
const DEFAULT_CAPACITY: usize = 256;

/// Shared event bus. Clone it cheaply – all clones share the same
/// underlying broadcast channel.
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all active subscribers.
    ///
    /// Having no subscribers is not a fault – the control core publishes
    /// unconditionally and the push layer attaches when it pleases.
    pub fn publish(&self, event: Event) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Subscribe to all events on the bus.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crema_types::{EventPayload, MachineState, ModeChangeReason, ModeKind};

    fn mode_event() -> Event {
        Event::new(
            "crema-control::mode",
            EventPayload::ModeChange {
                mode: ModeKind::Steam,
                reason: ModeChangeReason::Manual,
            },
        )
    }

    #[tokio::test]
    async fn publish_and_receive() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        let event = mode_event();
        assert_eq!(bus.publish(event.clone()), 1);
        assert_eq!(rx.recv().await.unwrap().id, event.id);
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_event() {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        let event = Event::new(
            "crema-control::classifier",
            EventPayload::MachineState {
                state: MachineState::Ready,
                updated_at: chrono::Utc::now(),
            },
        );
        bus.publish(event.clone());

        assert_eq!(rx1.recv().await.unwrap().id, event.id);
        assert_eq!(rx2.recv().await.unwrap().id, event.id);
    }

    #[test]
    fn publish_without_subscribers_is_not_a_fault() {
        let bus = EventBus::default();
        assert_eq!(bus.publish(mode_event()), 0);
    }
}
