//! Event bus for relay notifications
//!
//! Uses tokio::sync::broadcast for pub/sub pattern.
//! The store and the data-plane loop publish; the `/events` stream and tests subscribe.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Events that can be published on the bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum RelayEvent {
    /// The active station index moved
    StationChanged { index: usize, station: String },
    /// A downstream client was accepted and a pipeline is starting for it
    ClientAttached {
        peer: String,
        index: usize,
        station: String,
    },
    /// The pipeline for a client ended and the connection was closed
    ClientDetached {
        peer: String,
        bytes_copied: u64,
        outcome: String,
    },
}

/// Event bus handle for publishing and subscribing
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RelayEvent>,
}

impl EventBus {
    /// Create a new event bus with specified capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: RelayEvent) {
        // Ignore send errors (no subscribers)
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    /// Default capacity of 64 events
    fn default() -> Self {
        Self::new(64)
    }
}

/// Shared event bus wrapped in Arc for thread-safe sharing
pub type SharedBus = Arc<EventBus>;

pub fn create_bus() -> SharedBus {
    Arc::new(EventBus::default())
}
