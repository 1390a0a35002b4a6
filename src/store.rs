//! Event store and state store contracts, plus in-memory reference stores.
//!
//! The worker only ever talks to stores through these traits. The event
//! store is the source of truth; the state store caches the latest fold of
//! the log and may lag behind it after a crash.

use std::io;
use std::pin::Pin;

use tokio::sync::RwLock;
use tokio_stream::Stream;

use crate::event::{ProposedEvent, RecordedEvent};

/// Forward sequence of recorded events, in ascending id order.
pub type EventStream = Pin<Box<dyn Stream<Item = io::Result<RecordedEvent>> + Send>>;

/// Append-only, ordered log of events.
///
/// # Contract
///
/// - [`append`](EventStore::append) assigns ids 1, 2, 3 … in append order
///   and returns only once the event is durable for this store.
/// - [`read_from`](EventStore::read_from) yields every event whose id is
///   at least `offset`, ascending. Offset 0 reads the whole log.
#[async_trait::async_trait]
pub trait EventStore: Send + Sync {
    /// Append one event.
    ///
    /// # Returns
    ///
    /// The id assigned to the event.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if the event could not be recorded. The event
    /// must then be treated as not written.
    async fn append(&self, event: ProposedEvent) -> io::Result<u64>;

    /// Read the log forward from `offset`.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if the log cannot be opened. Errors while
    /// reading individual events are yielded as stream items.
    async fn read_from(&self, offset: u64) -> io::Result<EventStream>;
}

/// Holder of the latest materialized state.
///
/// Last write wins; no history is kept.
#[async_trait::async_trait]
pub trait StateStore<S>: Send + Sync {
    /// Return the stored state.
    async fn get(&self) -> io::Result<S>;

    /// Replace the stored state.
    async fn set(&self, state: &S) -> io::Result<()>;
}

/// Event store backed by a `Vec` in process memory.
///
/// Nothing survives the process. Intended for tests and wiring examples.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    events: RwLock<Vec<RecordedEvent>>,
}

impl InMemoryEventStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that already holds `events`, re-numbered from 1.
    pub fn with_events(events: impl IntoIterator<Item = ProposedEvent>) -> Self {
        let events = events
            .into_iter()
            .zip(1..)
            .map(|(event, id)| event.record(id))
            .collect();
        Self {
            events: RwLock::new(events),
        }
    }

    /// Clone of every stored event.
    pub async fn events(&self) -> Vec<RecordedEvent> {
        self.events.read().await.clone()
    }

    /// Number of stored events.
    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    /// Returns `true` if no event has been appended.
    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, event: ProposedEvent) -> io::Result<u64> {
        let mut events = self.events.write().await;
        let id = events.len() as u64 + 1;
        events.push(event.record(id));
        Ok(id)
    }

    async fn read_from(&self, offset: u64) -> io::Result<EventStream> {
        // Snapshot under the lock; later appends are not part of this read.
        let snapshot: Vec<_> = self
            .events
            .read()
            .await
            .iter()
            .filter(|event| event.id >= offset)
            .cloned()
            .map(Ok)
            .collect();
        Ok(Box::pin(tokio_stream::iter(snapshot)))
    }
}

/// State store holding the latest state in process memory.
#[derive(Debug, Default)]
pub struct InMemoryStateStore<S> {
    state: RwLock<S>,
}

impl<S> InMemoryStateStore<S> {
    /// Create a store holding `initial`.
    pub fn new(initial: S) -> Self {
        Self {
            state: RwLock::new(initial),
        }
    }
}

#[async_trait::async_trait]
impl<S> StateStore<S> for InMemoryStateStore<S>
where
    S: Clone + Send + Sync,
{
    async fn get(&self) -> io::Result<S> {
        Ok(self.state.read().await.clone())
    }

    async fn set(&self, state: &S) -> io::Result<()> {
        *self.state.write().await = state.clone();
        Ok(())
    }
}
