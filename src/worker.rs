//! Single-writer worker loop that applies commands against the state.
//!
//! The worker runs as one tokio task and exclusively owns the in-memory
//! state. On startup it replays the whole event log through
//! [`StateMachine::reduce`], then drains its [`Inbox`] one command at a time:
//!
//! 1. `apply` the command to the current state,
//! 2. append the event to the [`EventStore`],
//! 3. write the new state to the [`StateStore`],
//! 4. advance the in-memory state,
//! 5. resolve the producer's reply.
//!
//! A reply is never sent before the event is durable, and the in-memory
//! state never runs ahead of the event log.
//!
//! Public API: [`WorkerBuilder`] (configuration and spawn), [`WorkerHandle`]
//! (phase inspection and shutdown) and [`replay`].

use std::any::Any;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::Instrument;

use crate::command::Command;
use crate::error::{CommandError, WorkerError};
use crate::file::{FileEventStore, FileStateStore};
use crate::mailbox::{self, Delivery, Inbox, Postbox};
use crate::state_machine::StateMachine;
use crate::storage::StoreLayout;
use crate::store::{EventStore, StateStore};

/// Reply sent for any command that failed for a reason other than a domain
/// rejection (persistence fault, panic in the state machine or a store).
pub const FAILURE_REPLY: &str = "command failed";

/// Lifecycle of a worker. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WorkerPhase {
    /// Folding the event log into the initial state. Posted commands wait
    /// in the mailbox.
    Replaying,
    /// Draining the mailbox.
    Serving,
    /// No further commands will be processed.
    Stopped,
}

/// Counters reported when the worker stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Events folded during startup replay.
    pub replayed: u64,
    /// Commands whose event and state were persisted.
    pub accepted: u64,
    /// Commands rejected by the state machine.
    pub rejected: u64,
    /// Commands that failed on a persistence fault or a panic.
    pub failed: u64,
    /// Buffered commands resolved with a shutdown error.
    pub abandoned: u64,
}

/// Configures and starts a worker for state machine `M`.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
///
/// use command_postbox::{
///     Command, InMemoryEventStore, InMemoryStateStore, ProposedEvent, RecordedEvent,
///     StateMachine, WorkerBuilder,
/// };
///
/// #[derive(Debug, Clone, Default)]
/// struct Echo(u64);
///
/// impl StateMachine for Echo {
///     type Error = std::convert::Infallible;
///
///     fn apply(&self, cmd: &Command) -> Result<(Self, ProposedEvent), Self::Error> {
///         Ok((Echo(self.0 + 1), ProposedEvent::new(cmd.command_type.clone(), "")))
///     }
///
///     fn reduce(self, _event: &RecordedEvent) -> Self {
///         Echo(self.0 + 1)
///     }
/// }
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let (postbox, worker) = WorkerBuilder::<Echo>::new(
///     Arc::new(InMemoryEventStore::new()),
///     Arc::new(InMemoryStateStore::<Echo>::default()),
/// )
/// .spawn();
///
/// let reply = postbox.post(Command::new("hello", "")).await;
/// assert_eq!(reply.as_deref(), Ok("1"));
///
/// let stats = worker.shutdown().await.expect("worker stops cleanly");
/// assert_eq!(stats.accepted, 1);
/// # }
/// ```
pub struct WorkerBuilder<M: StateMachine> {
    name: String,
    event_store: Arc<dyn EventStore>,
    state_store: Arc<dyn StateStore<M>>,
}

impl<M: StateMachine> WorkerBuilder<M> {
    /// Create a builder over the given stores.
    ///
    /// # Arguments
    ///
    /// * `event_store` - The authoritative event log, replayed at startup.
    /// * `state_store` - Receives the new state after every accepted command.
    pub fn new(event_store: Arc<dyn EventStore>, state_store: Arc<dyn StateStore<M>>) -> Self {
        Self {
            name: "worker".to_string(),
            event_store,
            state_store,
        }
    }

    /// Create a builder over file-backed stores in `layout`.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if either store cannot be opened.
    pub fn open_files(layout: &StoreLayout) -> io::Result<Self>
    where
        M: Serialize + DeserializeOwned,
    {
        let events = FileEventStore::open(layout)?;
        let states = FileStateStore::<M>::open(layout)?;
        Ok(Self::new(Arc::new(events), Arc::new(states)))
    }

    /// Set the name recorded on the worker's tracing spans.
    ///
    /// Defaults to `"worker"`.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Create a mailbox and start the worker on it.
    ///
    /// # Returns
    ///
    /// The [`Postbox`] producers submit through, and the [`WorkerHandle`].
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn spawn(self) -> (Postbox, WorkerHandle) {
        let (postbox, inbox) = mailbox::channel();
        (postbox, self.spawn_with(inbox))
    }

    /// Start the worker on an existing inbox.
    ///
    /// Commands posted before this call are processed after replay, in
    /// order.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn spawn_with(self, inbox: Inbox) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (phase_tx, phase_rx) = watch::channel(WorkerPhase::Replaying);

        let span = tracing::info_span!("worker", name = %self.name);
        let worker = Worker {
            state: M::default(),
            event_store: self.event_store,
            state_store: self.state_store,
            stats: WorkerStats::default(),
        };
        let task = tokio::spawn(worker.run(inbox, shutdown_rx, phase_tx).instrument(span));

        WorkerHandle {
            shutdown_tx,
            phase_rx,
            task,
        }
    }
}

/// Handle to a running worker.
///
/// Dropping the handle does **not** stop the worker: it keeps serving until
/// every [`Postbox`] is dropped. Call [`shutdown`](WorkerHandle::shutdown)
/// to stop it explicitly.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown_tx: watch::Sender<bool>,
    phase_rx: watch::Receiver<WorkerPhase>,
    task: JoinHandle<Result<WorkerStats, WorkerError>>,
}

impl WorkerHandle {
    /// The worker's current phase.
    pub fn phase(&self) -> WorkerPhase {
        *self.phase_rx.borrow()
    }

    /// Wait until the worker has reached `target` (or a later phase).
    ///
    /// # Returns
    ///
    /// The phase observed when waiting ended. This is earlier than
    /// `target` only if the worker task died without publishing it.
    pub async fn wait_for_phase(&self, target: WorkerPhase) -> WorkerPhase {
        let mut phase_rx = self.phase_rx.clone();
        let reached = phase_rx
            .wait_for(|phase| *phase >= target)
            .await
            .map(|phase| *phase);
        reached.unwrap_or_else(|_| *phase_rx.borrow())
    }

    /// Ask the worker to stop without waiting for it.
    ///
    /// The command in flight (if any) completes and is answered. Commands
    /// still buffered are resolved with [`PostError::Shutdown`](crate::PostError::Shutdown).
    pub fn request_shutdown(&self) {
        // The worker may already have exited and dropped its receiver.
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for the worker to exit on its own.
    ///
    /// # Errors
    ///
    /// * [`WorkerError::Replay`] -- the event log could not be replayed.
    /// * [`WorkerError::Join`] -- the worker task panicked.
    pub async fn join(self) -> Result<WorkerStats, WorkerError> {
        self.task
            .await
            .map_err(|e| WorkerError::Join(e.to_string()))?
    }

    /// Signal shutdown and wait for the worker to exit.
    ///
    /// # Errors
    ///
    /// Same as [`join`](WorkerHandle::join).
    pub async fn shutdown(self) -> Result<WorkerStats, WorkerError> {
        self.request_shutdown();
        self.join().await
    }
}

/// Fold the entire event log into a fresh state.
///
/// This is the same fold the worker performs at startup; the result must
/// equal the state the worker holds after the last logged event.
///
/// # Returns
///
/// The folded state and the number of events read.
///
/// # Errors
///
/// Returns `io::Error` if the log cannot be opened or an event cannot be
/// read.
pub async fn replay<M: StateMachine>(events: &dyn EventStore) -> io::Result<(M, u64)> {
    let folded = fold_log::<M>(events, || false).await?;
    Ok(folded.unwrap_or_default())
}

/// Fold the log from offset 0, checking `stop` between events.
///
/// Returns `Ok(None)` if `stop` fired before the log was exhausted.
async fn fold_log<M: StateMachine>(
    events: &dyn EventStore,
    stop: impl Fn() -> bool,
) -> io::Result<Option<(M, u64)>> {
    let mut stream = events.read_from(0).await?;
    let mut state = M::default();
    let mut count = 0;

    while let Some(event) = stream.next().await {
        if stop() {
            return Ok(None);
        }
        state = state.reduce(&event?);
        count += 1;
    }
    Ok(Some((state, count)))
}

/// Extract a readable message from a panic payload.
fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// State exclusively owned by the worker task.
struct Worker<M: StateMachine> {
    state: M,
    event_store: Arc<dyn EventStore>,
    state_store: Arc<dyn StateStore<M>>,
    stats: WorkerStats,
}

impl<M: StateMachine> Worker<M> {
    async fn run(
        mut self,
        mut inbox: Inbox,
        shutdown: watch::Receiver<bool>,
        phase: watch::Sender<WorkerPhase>,
    ) -> Result<WorkerStats, WorkerError> {
        tracing::info!("replaying event log");

        let replayed = fold_log::<M>(self.event_store.as_ref(), || *shutdown.borrow()).await;
        match replayed {
            Ok(Some((state, count))) => {
                self.state = state;
                self.stats.replayed = count;
                tracing::info!(events = count, "replay complete");
            }
            Ok(None) => {
                tracing::info!("shutdown requested during replay");
                self.stop(&mut inbox, &phase);
                return Ok(self.stats);
            }
            Err(e) => {
                tracing::error!(error = %e, "event replay failed");
                self.stop(&mut inbox, &phase);
                return Err(WorkerError::Replay(e));
            }
        }

        phase.send_replace(WorkerPhase::Serving);

        let mut reader = inbox.read(shutdown);
        while let Some(delivery) = reader.recv().await {
            let Delivery {
                entry_id,
                command,
                resolver,
            } = delivery;

            let span = tracing::info_span!(
                "command",
                entry = %entry_id,
                command_type = %command.command_type,
            );
            let reply = self.handle(&command).instrument(span).await;

            // Only this loop resolves slots, and each exactly once.
            if resolver.resolve(reply).is_err() {
                tracing::warn!(entry = %entry_id, "reply slot was already resolved");
            }
        }
        drop(reader);

        self.stop(&mut inbox, &phase);
        Ok(self.stats)
    }

    /// Abandon everything still buffered and publish `Stopped`.
    fn stop(&mut self, inbox: &mut Inbox, phase: &watch::Sender<WorkerPhase>) {
        self.stats.abandoned = inbox.abandon_pending() as u64;
        phase.send_replace(WorkerPhase::Stopped);
        tracing::info!(
            accepted = self.stats.accepted,
            rejected = self.stats.rejected,
            failed = self.stats.failed,
            abandoned = self.stats.abandoned,
            "worker stopped"
        );
    }

    /// Process one command and produce its reply text.
    ///
    /// A panic anywhere in `execute` (the state machine or either store) is
    /// contained here and reported as a fault.
    async fn handle(&mut self, command: &Command) -> String {
        let outcome = AssertUnwindSafe(self.execute(command))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(CommandError::Fault(panic_message(payload.as_ref()))));

        match outcome {
            Ok(event_id) => {
                self.stats.accepted += 1;
                tracing::info!(event_id, "command accepted");
                event_id.to_string()
            }
            Err(CommandError::Rejected(reason)) => {
                self.stats.rejected += 1;
                tracing::info!(reason = %reason, "command rejected");
                reason.to_string()
            }
            Err(e) => {
                self.stats.failed += 1;
                tracing::error!(error = %e, "command failed");
                FAILURE_REPLY.to_string()
            }
        }
    }

    /// Decide, persist, then advance the in-memory state.
    ///
    /// The state only advances once both the event and the new state are
    /// persisted.
    async fn execute(&mut self, command: &Command) -> Result<u64, CommandError<M::Error>> {
        let (next, event) = self.state.apply(command).map_err(CommandError::Rejected)?;

        let event_id = self.event_store.append(event).await?;

        if let Err(e) = self.state_store.set(&next).await {
            tracing::warn!(event_id, "event recorded but state write failed; state not advanced");
            return Err(CommandError::Persistence(e));
        }

        self.state = next;
        Ok(event_id)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use tokio::sync::{Notify, Semaphore};

    use super::*;
    use crate::error::PostError;
    use crate::event::ProposedEvent;
    use crate::state_machine::test_fixtures::{Ledger, fold};
    use crate::store::{EventStream, InMemoryEventStore, InMemoryStateStore};

    /// Event store whose appends can be switched to fail.
    #[derive(Default)]
    struct FlakyEventStore {
        inner: InMemoryEventStore,
        fail_appends: AtomicBool,
        fail_reads: AtomicBool,
    }

    #[async_trait::async_trait]
    impl EventStore for FlakyEventStore {
        async fn append(&self, event: ProposedEvent) -> io::Result<u64> {
            if self.fail_appends.load(Ordering::SeqCst) {
                return Err(io::Error::other("event log unavailable"));
            }
            self.inner.append(event).await
        }

        async fn read_from(&self, offset: u64) -> io::Result<EventStream> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(io::Error::other("event log unreadable"));
            }
            self.inner.read_from(offset).await
        }
    }

    /// State store whose writes can be switched to fail.
    #[derive(Default)]
    struct FlakyStateStore {
        inner: InMemoryStateStore<Ledger>,
        fail_sets: AtomicBool,
    }

    #[async_trait::async_trait]
    impl StateStore<Ledger> for FlakyStateStore {
        async fn get(&self) -> io::Result<Ledger> {
            self.inner.get().await
        }

        async fn set(&self, state: &Ledger) -> io::Result<()> {
            if self.fail_sets.load(Ordering::SeqCst) {
                return Err(io::Error::other("snapshot disk full"));
            }
            self.inner.set(state).await
        }
    }

    /// Event store whose appends block until a permit is released.
    struct GatedEventStore {
        inner: InMemoryEventStore,
        gate: Semaphore,
        entered: Notify,
    }

    impl GatedEventStore {
        fn new() -> Self {
            Self {
                inner: InMemoryEventStore::new(),
                gate: Semaphore::new(0),
                entered: Notify::new(),
            }
        }
    }

    #[async_trait::async_trait]
    impl EventStore for GatedEventStore {
        async fn append(&self, event: ProposedEvent) -> io::Result<u64> {
            self.entered.notify_one();
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|_| io::Error::other("gate closed"))?;
            permit.forget();
            self.inner.append(event).await
        }

        async fn read_from(&self, offset: u64) -> io::Result<EventStream> {
            self.inner.read_from(offset).await
        }
    }

    /// Event store whose first append panics.
    #[derive(Default)]
    struct PanicOnceEventStore {
        inner: InMemoryEventStore,
        panicked: AtomicBool,
    }

    #[async_trait::async_trait]
    impl EventStore for PanicOnceEventStore {
        async fn append(&self, event: ProposedEvent) -> io::Result<u64> {
            if !self.panicked.swap(true, Ordering::SeqCst) {
                panic!("event log driver crashed");
            }
            self.inner.append(event).await
        }

        async fn read_from(&self, offset: u64) -> io::Result<EventStream> {
            self.inner.read_from(offset).await
        }
    }

    /// State store whose first write panics.
    #[derive(Default)]
    struct PanicOnceStateStore {
        inner: InMemoryStateStore<Ledger>,
        panicked: AtomicBool,
    }

    #[async_trait::async_trait]
    impl StateStore<Ledger> for PanicOnceStateStore {
        async fn get(&self) -> io::Result<Ledger> {
            self.inner.get().await
        }

        async fn set(&self, state: &Ledger) -> io::Result<()> {
            if !self.panicked.swap(true, Ordering::SeqCst) {
                panic!("snapshot writer crashed");
            }
            self.inner.set(state).await
        }
    }

    fn add(n: u64) -> Command {
        Command::new("add", n.to_string())
    }

    fn in_memory() -> (Arc<InMemoryEventStore>, Arc<InMemoryStateStore<Ledger>>) {
        (
            Arc::new(InMemoryEventStore::new()),
            Arc::new(InMemoryStateStore::default()),
        )
    }

    #[tokio::test]
    async fn accepted_command_replies_with_event_id() {
        let (events, states) = in_memory();
        let (postbox, worker) = WorkerBuilder::<Ledger>::new(events.clone(), states.clone()).spawn();

        assert_eq!(postbox.post(add(5)).await, Ok("1".to_string()));
        assert_eq!(postbox.post(add(2)).await, Ok("2".to_string()));

        let stored = states.get().await.expect("get should succeed");
        assert_eq!(stored.balance, 7);
        assert_eq!(events.len().await, 2);

        let stats = worker.shutdown().await.expect("worker should stop cleanly");
        assert_eq!(stats.accepted, 2);
    }

    #[tokio::test]
    async fn rejection_replies_reason_and_persists_nothing() {
        let (events, states) = in_memory();
        let (postbox, worker) = WorkerBuilder::<Ledger>::new(events.clone(), states.clone()).spawn();

        let reply = postbox.post(Command::new("sub", "1")).await;
        assert_eq!(reply, Ok("insufficient balance".to_string()));

        assert!(events.is_empty().await);
        assert_eq!(states.get().await.expect("get should succeed"), Ledger::default());

        let stats = worker.shutdown().await.expect("worker should stop cleanly");
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.accepted, 0);
    }

    #[tokio::test]
    async fn empty_body_is_passed_through() {
        let (events, states) = in_memory();
        let (postbox, worker) = WorkerBuilder::<Ledger>::new(events.clone(), states).spawn();

        assert_eq!(postbox.post(Command::new("noop", "")).await, Ok("1".to_string()));
        assert_eq!(events.events().await[0].body, "");

        worker.shutdown().await.expect("worker should stop cleanly");
    }

    #[tokio::test]
    async fn append_failure_replies_failure_and_keeps_state() {
        let events = Arc::new(FlakyEventStore::default());
        let states = Arc::new(InMemoryStateStore::<Ledger>::default());
        let (postbox, worker) = WorkerBuilder::<Ledger>::new(events.clone(), states.clone()).spawn();

        events.fail_appends.store(true, Ordering::SeqCst);
        assert_eq!(postbox.post(add(5)).await, Ok(FAILURE_REPLY.to_string()));
        assert_eq!(states.get().await.expect("get should succeed"), Ledger::default());
        assert!(events.inner.is_empty().await);

        // The failed command left no trace in memory either.
        events.fail_appends.store(false, Ordering::SeqCst);
        assert_eq!(postbox.post(add(1)).await, Ok("1".to_string()));
        assert_eq!(states.get().await.expect("get should succeed").balance, 1);

        let stats = worker.shutdown().await.expect("worker should stop cleanly");
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.accepted, 1);
    }

    #[tokio::test]
    async fn state_write_failure_replies_failure_and_keeps_memory() {
        let events = Arc::new(InMemoryEventStore::new());
        let states = Arc::new(FlakyStateStore::default());
        let (postbox, worker) = WorkerBuilder::<Ledger>::new(events.clone(), states.clone()).spawn();

        states.fail_sets.store(true, Ordering::SeqCst);
        assert_eq!(postbox.post(add(5)).await, Ok(FAILURE_REPLY.to_string()));
        assert_eq!(states.get().await.expect("get should succeed"), Ledger::default());
        assert_eq!(events.len().await, 1, "the append had already succeeded");

        // The unpersisted +5 never reached memory.
        states.fail_sets.store(false, Ordering::SeqCst);
        assert_eq!(
            postbox.post(Command::new("sub", "5")).await,
            Ok("insufficient balance".to_string())
        );
        assert_eq!(postbox.post(add(1)).await, Ok("2".to_string()));
        assert_eq!(states.get().await.expect("get should succeed").balance, 1);

        let stats = worker.shutdown().await.expect("worker should stop cleanly");
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.accepted, 1);
    }

    #[tokio::test]
    async fn panic_in_apply_replies_failure_and_worker_continues() {
        let (events, states) = in_memory();
        let (postbox, worker) = WorkerBuilder::<Ledger>::new(events.clone(), states.clone()).spawn();

        let exploded = postbox.post(Command::new("explode", ""));
        let after = postbox.post(add(3));

        assert_eq!(exploded.await, Ok(FAILURE_REPLY.to_string()));
        assert_eq!(after.await, Ok("1".to_string()));
        assert_eq!(states.get().await.expect("get should succeed").balance, 3);

        let stats = worker.shutdown().await.expect("worker should stop cleanly");
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.accepted, 1);
    }

    #[tokio::test]
    async fn panic_in_event_store_replies_failure_and_worker_continues() {
        let events = Arc::new(PanicOnceEventStore::default());
        let states = Arc::new(InMemoryStateStore::<Ledger>::default());
        let (postbox, worker) = WorkerBuilder::<Ledger>::new(events.clone(), states.clone()).spawn();

        let first = postbox.post(add(1));
        let second = postbox.post(add(2));
        let third = postbox.post(add(3));

        assert_eq!(first.await, Ok(FAILURE_REPLY.to_string()));
        assert_eq!(second.await, Ok("1".to_string()));
        assert_eq!(third.await, Ok("2".to_string()));
        assert_eq!(states.get().await.expect("get should succeed").balance, 5);
        assert_eq!(fold(&events.inner.events().await).balance, 5);

        let stats = worker.shutdown().await.expect("worker should stop cleanly");
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.accepted, 2);
    }

    #[tokio::test]
    async fn panic_in_state_store_keeps_memory_and_worker_continues() {
        let events = Arc::new(InMemoryEventStore::new());
        let states = Arc::new(PanicOnceStateStore::default());
        let (postbox, worker) = WorkerBuilder::<Ledger>::new(events.clone(), states.clone()).spawn();

        assert_eq!(postbox.post(add(4)).await, Ok(FAILURE_REPLY.to_string()));
        assert_eq!(
            postbox.post(Command::new("sub", "4")).await,
            Ok("insufficient balance".to_string())
        );
        assert_eq!(postbox.post(add(1)).await, Ok("2".to_string()));
        assert_eq!(states.get().await.expect("get should succeed").balance, 1);

        let stats = worker.shutdown().await.expect("worker should stop cleanly");
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.accepted, 1);
    }

    #[tokio::test]
    async fn replays_existing_log_before_serving() {
        let events = Arc::new(InMemoryEventStore::with_events([
            ProposedEvent::new("Added", "10"),
            ProposedEvent::new("Subtracted", "3"),
        ]));
        let states = Arc::new(InMemoryStateStore::<Ledger>::default());
        let (postbox, worker) = WorkerBuilder::<Ledger>::new(events.clone(), states.clone()).spawn();

        // 7 available: 8 is rejected, 7 is accepted.
        assert_eq!(
            postbox.post(Command::new("sub", "8")).await,
            Ok("insufficient balance".to_string())
        );
        assert_eq!(postbox.post(Command::new("sub", "7")).await, Ok("3".to_string()));
        assert_eq!(states.get().await.expect("get should succeed").balance, 0);

        let stats = worker.shutdown().await.expect("worker should stop cleanly");
        assert_eq!(stats.replayed, 2);
    }

    #[tokio::test]
    async fn reply_waits_for_durable_append() {
        let events = Arc::new(GatedEventStore::new());
        let states = Arc::new(InMemoryStateStore::<Ledger>::default());
        let (postbox, worker) = WorkerBuilder::<Ledger>::new(events.clone(), states.clone()).spawn();

        let mut reply = postbox.post(add(4));
        events.entered.notified().await;

        let early = tokio::time::timeout(Duration::from_millis(50), &mut reply).await;
        assert!(early.is_err(), "reply must not arrive before the append returns");
        assert_eq!(states.get().await.expect("get should succeed"), Ledger::default());

        events.gate.add_permits(1);
        assert_eq!(reply.await, Ok("1".to_string()));
        assert_eq!(states.get().await.expect("get should succeed").balance, 4);

        worker.shutdown().await.expect("worker should stop cleanly");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_producers_are_linearized() {
        let (events, states) = in_memory();
        let (postbox, worker) = WorkerBuilder::<Ledger>::new(events.clone(), states.clone()).spawn();

        let mut producers = Vec::new();
        for _ in 0..10 {
            let postbox = postbox.clone();
            producers.push(tokio::spawn(async move {
                for _ in 0..10 {
                    let reply = postbox.post(add(1)).await.expect("reply should arrive");
                    reply.parse::<u64>().expect("accepted reply is an event id");
                }
            }));
        }
        for producer in producers {
            producer.await.expect("producer should finish");
        }

        let logged = events.events().await;
        let ids: Vec<u64> = logged.iter().map(|e| e.id).collect();
        assert_eq!(ids, (1..=100).collect::<Vec<_>>());

        let stored = states.get().await.expect("get should succeed");
        assert_eq!(
            stored,
            Ledger {
                balance: 100,
                entries: 100
            }
        );

        let (replayed, count) = replay::<Ledger>(&*events)
            .await
            .expect("replay should succeed");
        assert_eq!(count, 100);
        assert_eq!(replayed, stored);

        worker.shutdown().await.expect("worker should stop cleanly");
    }

    #[tokio::test]
    async fn replay_matches_state_after_every_command() {
        let (events, states) = in_memory();
        let (postbox, worker) = WorkerBuilder::<Ledger>::new(events.clone(), states.clone()).spawn();

        let script = [
            add(9),
            Command::new("sub", "4"),
            Command::new("sub", "40"),
            Command::new("noop", "memo"),
            Command::new("explode", ""),
            add(1),
        ];
        for command in script {
            postbox.post(command).await.expect("reply should arrive");
            let (replayed, _) = replay::<Ledger>(&*events)
                .await
                .expect("replay should succeed");
            assert_eq!(replayed, states.get().await.expect("get should succeed"));
        }

        worker.shutdown().await.expect("worker should stop cleanly");
    }

    #[tokio::test]
    async fn shutdown_answers_in_flight_and_abandons_buffered() {
        let events = Arc::new(GatedEventStore::new());
        let states = Arc::new(InMemoryStateStore::<Ledger>::default());
        let (postbox, worker) = WorkerBuilder::<Ledger>::new(events.clone(), states).spawn();

        let in_flight = postbox.post(add(1));
        events.entered.notified().await;
        let second = postbox.post(add(2));
        let third = postbox.post(add(3));

        worker.request_shutdown();
        events.gate.add_permits(1);

        assert_eq!(in_flight.await, Ok("1".to_string()));
        assert_eq!(second.await, Err(PostError::Shutdown));
        assert_eq!(third.await, Err(PostError::Shutdown));

        assert_eq!(
            worker.wait_for_phase(WorkerPhase::Stopped).await,
            WorkerPhase::Stopped
        );
        assert_eq!(postbox.post(add(4)).await, Err(PostError::Closed));
        let stats = worker.join().await.expect("worker should stop cleanly");
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.abandoned, 2);
    }

    #[tokio::test]
    async fn phases_move_forward() {
        let (events, states) = in_memory();
        let (_postbox, worker) = WorkerBuilder::<Ledger>::new(events, states)
            .name("ledger")
            .spawn();

        assert_eq!(
            worker.wait_for_phase(WorkerPhase::Serving).await,
            WorkerPhase::Serving
        );
        worker.request_shutdown();
        assert_eq!(
            worker.wait_for_phase(WorkerPhase::Stopped).await,
            WorkerPhase::Stopped
        );
        worker.join().await.expect("worker should stop cleanly");
    }

    #[tokio::test]
    async fn replay_failure_abandons_posted_commands() {
        let events = Arc::new(FlakyEventStore::default());
        events.fail_reads.store(true, Ordering::SeqCst);
        let states = Arc::new(InMemoryStateStore::<Ledger>::default());

        let (postbox, inbox) = mailbox::channel();
        let reply = postbox.post(add(1));
        let worker = WorkerBuilder::<Ledger>::new(events, states).spawn_with(inbox);

        assert_eq!(reply.await, Err(PostError::Shutdown));
        let result = worker.join().await;
        assert!(
            matches!(result, Err(WorkerError::Replay(_))),
            "expected Replay error, got: {result:?}"
        );
    }

    #[tokio::test]
    async fn commands_posted_before_spawn_run_after_replay() {
        let events = Arc::new(InMemoryEventStore::with_events([ProposedEvent::new(
            "Added", "2",
        )]));
        let states = Arc::new(InMemoryStateStore::<Ledger>::default());

        let (postbox, inbox) = mailbox::channel();
        let reply = postbox.post(Command::new("sub", "2"));
        let worker = WorkerBuilder::<Ledger>::new(events, states.clone()).spawn_with(inbox);

        assert_eq!(reply.await, Ok("2".to_string()));
        assert_eq!(states.get().await.expect("get should succeed").balance, 0);
        worker.shutdown().await.expect("worker should stop cleanly");
    }

    #[tokio::test]
    async fn worker_stops_when_all_postboxes_dropped() {
        let (events, states) = in_memory();
        let (postbox, worker) = WorkerBuilder::<Ledger>::new(events, states).spawn();

        assert_eq!(postbox.post(add(1)).await, Ok("1".to_string()));
        drop(postbox);

        let stats = worker.join().await.expect("worker should stop cleanly");
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.abandoned, 0);
    }

    #[tokio::test]
    async fn replay_of_empty_log_is_default_state() {
        let events = InMemoryEventStore::new();
        let (state, count) = replay::<Ledger>(&events).await.expect("replay should succeed");
        assert_eq!(state, Ledger::default());
        assert_eq!(count, 0);
    }
}
