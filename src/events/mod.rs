//! Event system for call notifications
//!
//! Each participant owns one bus; the negotiation engine and the call
//! manager publish to it and the UI layer subscribes.

pub mod types;

pub use types::{CallEvent, EndReason, NoticeLevel};

use tokio::sync::broadcast;
use tracing::trace;

/// Event channel capacity (ring buffer size)
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Broadcast bus for [`CallEvent`]s
///
/// Events are delivered to every subscriber that exists at publish time.
///
/// # Example
///
/// ```no_run
/// use voxa_call::events::{CallEvent, EventBus, NoticeLevel};
///
/// let bus = EventBus::new();
/// let mut rx = bus.subscribe();
///
/// bus.publish(CallEvent::notice(NoticeLevel::Info, "ringing"));
///
/// tokio::spawn(async move {
///     while let Ok(event) = rx.recv().await {
///         println!("{}", event.name());
///     }
/// });
/// ```
pub struct EventBus {
    tx: broadcast::Sender<CallEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event to all subscribers
    ///
    /// With no subscribers the event is dropped.
    pub fn publish(&self, event: CallEvent) {
        trace!("Publishing event {}", event.name());
        let _ = self.tx.send(event);
    }

    /// Subscribe to events
    ///
    /// A subscriber that falls more than the channel capacity behind gets a
    /// `Lagged` error and misses events.
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
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
