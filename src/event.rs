//! Event types shared by the worker, the stores, and state machines.
//!
//! A state machine proposes an event without an id; the event store assigns
//! the id on append and hands back a [`RecordedEvent`] on every read.

use serde::{Deserialize, Serialize};

/// An event produced by a successful `apply`, not yet persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposedEvent {
    /// Event type tag (e.g. `"Deposited"`).
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event payload, opaque to the core.
    #[serde(default)]
    pub body: String,
}

impl ProposedEvent {
    /// Create a proposed event from its type and body.
    pub fn new(event_type: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            body: body.into(),
        }
    }

    /// Stamp the store-assigned id on this event.
    ///
    /// # Arguments
    ///
    /// * `id` - Sequence id assigned by the event store (starts at 1).
    ///
    /// # Returns
    ///
    /// The immutable [`RecordedEvent`].
    pub fn record(self, id: u64) -> RecordedEvent {
        RecordedEvent {
            id,
            event_type: self.event_type,
            body: self.body,
        }
    }
}

/// An event as stored in the log.
///
/// Serialized as one JSON object per event: `{"id": 1, "type": "...", "body": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedEvent {
    /// Monotonic sequence id assigned by the store.
    pub id: u64,
    /// Event type tag.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event payload.
    #[serde(default)]
    pub body: String,
}
