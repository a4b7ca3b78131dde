//! Event bus (C12): single-topic publish/subscribe of `TaskUpdateEvent` to N
//! subscribers. Delivery is at-least-once to live subscribers and best-effort
//! — a subscriber whose buffer is full may drop messages; the only contract
//! is that terminal-state events are eventually consistent with the store, so
//! a dropped event never corrupts the system (subscribers refetch on
//! reconnect).

use tokio::sync::broadcast;

use crate::types::TaskUpdateEvent;

const CHANNEL_CAPACITY: usize = 1024;

pub struct EventBus {
    tx: broadcast::Sender<TaskUpdateEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish to every live subscriber. Returns the number of subscribers
    /// the event was handed to (0 is not an error — nobody is listening).
    pub fn publish(&self, event: TaskUpdateEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskUpdateEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
