//! Event bus for negotiation engine notifications
//!
//! Subscribers see connection, session and track events as they happen.
//! Publishing never blocks; a slow subscriber gets `Lagged` and misses events.

pub mod types;

pub use types::ClientEvent;

use tokio::sync::broadcast;
use tracing::trace;

/// Event channel capacity (ring buffer size)
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Broadcast bus for [`ClientEvent`]s
///
/// ```no_run
/// use calls_client::events::{ClientEvent, EventBus};
///
/// let bus = EventBus::new();
/// let mut rx = bus.subscribe();
///
/// bus.publish(ClientEvent::SessionLost {
///     session_id: "abc".to_string(),
/// });
///
/// tokio::spawn(async move {
///     while let Ok(event) = rx.recv().await {
///         println!("{}", event.event_name());
///     }
/// });
/// ```
pub struct EventBus {
    tx: broadcast::Sender<ClientEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event to all current subscribers
    pub fn publish(&self, event: ClientEvent) {
        trace!("Event: {}", event.event_name());
        // No subscribers is fine
        let _ = self.tx.send(event);
    }

    /// Receive every event published after this call
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
