//! Unbounded FIFO mailbox between any number of producers and one consumer.
//!
//! [`channel`] returns the two halves. [`Postbox`] is the cloneable producer
//! side: [`post`](Postbox::post) hands the command off and returns a
//! [`PendingReply`] immediately. [`Inbox`] is the single consumer side:
//! [`read`](Inbox::read) opens a [`Reader`] that yields one [`Delivery`] per
//! posted command, in enqueue order, until a shutdown is signalled.
//!
//! Entries still buffered when the reader stops are never delivered. The
//! consumer is expected to call [`Inbox::abandon_pending`] so their producers
//! observe [`PostError::Shutdown`] instead of waiting forever.

use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::command::Command;
use crate::error::PostError;
use crate::reply::{PendingReply, Resolver, reply_slot};

/// A posted command together with its reply slot.
///
/// Owned by the mailbox between hand-off and dequeue.
#[derive(Debug)]
struct PendingEntry {
    id: Uuid,
    command: Command,
    resolver: Resolver,
}

/// Create a connected mailbox.
///
/// # Returns
///
/// The producer half ([`Postbox`]) and the consumer half ([`Inbox`]).
///
/// # Examples
///
/// ```
/// use command_postbox::{Command, mailbox};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let (postbox, mut inbox) = mailbox::channel();
/// let (_stop_tx, stop_rx) = tokio::sync::watch::channel(false);
///
/// let reply = postbox.post(Command::new("ping", ""));
///
/// let mut reader = inbox.read(stop_rx);
/// let delivery = reader.recv().await.expect("one command was posted");
/// delivery.resolver.resolve("pong").expect("first resolution");
///
/// assert_eq!(reply.await.as_deref(), Ok("pong"));
/// # }
/// ```
pub fn channel() -> (Postbox, Inbox) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (Postbox { sender }, Inbox { receiver })
}

/// Producer handle for submitting commands.
///
/// Cheap to clone; every clone feeds the same inbox.
#[derive(Debug, Clone)]
pub struct Postbox {
    sender: mpsc::UnboundedSender<PendingEntry>,
}

impl Postbox {
    /// Enqueue a command and return a future for its reply.
    ///
    /// Never waits on the consumer: the mailbox is unbounded. The returned
    /// future resolves once the consumer resolves this command's slot.
    ///
    /// # Arguments
    ///
    /// * `command` - The command to submit. Ownership moves into the mailbox.
    ///
    /// # Returns
    ///
    /// A [`PendingReply`] that yields the reply text, or
    /// [`PostError::Closed`] right away if the inbox no longer accepts
    /// commands.
    pub fn post(&self, command: Command) -> PendingReply {
        let (resolver, pending) = reply_slot();
        let entry = PendingEntry {
            id: Uuid::new_v4(),
            command,
            resolver,
        };

        match self.sender.send(entry) {
            Ok(()) => pending,
            Err(mpsc::error::SendError(rejected)) => {
                tracing::debug!(
                    entry = %rejected.id,
                    command_type = %rejected.command.command_type,
                    "post rejected: mailbox closed"
                );
                PendingReply::failed(PostError::Closed)
            }
        }
    }

    /// Returns `true` if the inbox has been closed or dropped.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Consumer half of the mailbox.
#[derive(Debug)]
pub struct Inbox {
    receiver: mpsc::UnboundedReceiver<PendingEntry>,
}

impl Inbox {
    /// Open a read context over entries not yet delivered.
    ///
    /// The reader stops once `shutdown` holds `true`. A sender that is
    /// dropped without ever sending `true` is not treated as a shutdown.
    ///
    /// # Arguments
    ///
    /// * `shutdown` - Watch receiver signalling the consumer to stop.
    pub fn read(&mut self, shutdown: watch::Receiver<bool>) -> Reader<'_> {
        Reader {
            receiver: &mut self.receiver,
            shutdown,
        }
    }

    /// Stop accepting new commands.
    ///
    /// Entries already buffered stay readable.
    pub fn close(&mut self) {
        self.receiver.close();
    }

    /// Close the inbox and resolve every buffered entry with
    /// [`PostError::Shutdown`].
    ///
    /// # Returns
    ///
    /// The number of entries abandoned.
    pub fn abandon_pending(&mut self) -> usize {
        self.receiver.close();

        let mut abandoned = 0;
        while let Ok(entry) = self.receiver.try_recv() {
            tracing::warn!(
                entry = %entry.id,
                command_type = %entry.command.command_type,
                "abandoning buffered command"
            );
            if entry.resolver.abandon().is_ok() {
                abandoned += 1;
            }
        }
        abandoned
    }
}

/// A single-pass read context over an [`Inbox`].
///
/// Borrowing the inbox mutably keeps the consumer single: only one reader
/// can exist at a time, and dropping it leaves undelivered entries in place
/// for the next one.
#[derive(Debug)]
pub struct Reader<'a> {
    receiver: &'a mut mpsc::UnboundedReceiver<PendingEntry>,
    shutdown: watch::Receiver<bool>,
}

impl Reader<'_> {
    /// Wait for the next command.
    ///
    /// A pending shutdown wins over a buffered entry, so no entry is handed
    /// out after the signal has been observed.
    ///
    /// # Returns
    ///
    /// `Some(delivery)` for the next entry in enqueue order, or `None` once
    /// shutdown is signalled or every [`Postbox`] has been dropped.
    pub async fn recv(&mut self) -> Option<Delivery> {
        let entry = tokio::select! {
            biased;
            () = shutdown_requested(&mut self.shutdown) => return None,
            entry = self.receiver.recv() => entry?,
        };

        Some(Delivery {
            entry_id: entry.id,
            command: entry.command,
            resolver: entry.resolver,
        })
    }
}

/// Completes once `shutdown` holds `true`; pends forever if the sender is
/// dropped first.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// A command handed to the consumer, with the means to answer it.
#[derive(Debug)]
pub struct Delivery {
    /// Id assigned at post time, for log correlation only.
    pub entry_id: Uuid,
    /// The posted command.
    pub command: Command,
    /// Resolves the producer's [`PendingReply`] exactly once.
    pub resolver: Resolver,
}
