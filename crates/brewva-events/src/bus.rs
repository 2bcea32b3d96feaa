//! Broadcast bus delivering [`ChannelEvent`]s to subscribers.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{trace, warn};

use crate::event::ChannelEvent;

/// Default channel capacity for the event bus.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Broadcast bus for channel events.
///
/// Publishing never blocks and never fails: with no subscribers the event is
/// dropped, and a slow subscriber loses old events rather than stalling
/// publishers.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Arc<ChannelEvent>>,
}

impl EventBus {
    /// Create a bus with default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a bus with an explicit capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event. Returns the number of receivers that saw it.
    pub fn publish(&self, event: ChannelEvent) -> usize {
        trace!(event_type = %event.event_type(), "publishing channel event");
        self.sender.send(Arc::new(event)).unwrap_or(0)
    }

    /// Subscribe to all events published after this call.
    #[must_use]
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving half of the bus.
pub struct EventReceiver {
    receiver: broadcast::Receiver<Arc<ChannelEvent>>,
}

impl EventReceiver {
    /// Receive the next event; `None` when the bus is closed.
    ///
    /// Lagged receivers skip the dropped window and keep receiving.
    pub async fn recv(&mut self) -> Option<Arc<ChannelEvent>> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    warn!(skipped = count, "event receiver lagged, events dropped");
                },
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking receive; `None` when empty or closed.
    pub fn try_recv(&mut self) -> Option<Arc<ChannelEvent>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(count)) => {
                    warn!(skipped = count, "event receiver lagged, events dropped");
                },
                Err(
                    broadcast::error::TryRecvError::Empty | broadcast::error::TryRecvError::Closed,
                ) => return None,
            }
        }
    }
}
