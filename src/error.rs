//! Crate-level error types for posting, resolving, and running the worker.

/// Error returned to a producer awaiting a [`PendingReply`](crate::PendingReply).
///
/// Domain rejections and processing faults are *not* errors at this level:
/// they arrive as the reply text. A `PostError` means the command never got
/// an answer from the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PostError {
    /// The mailbox was closed before the command could be handed off.
    ///
    /// The command was not enqueued and will never be processed.
    #[error("mailbox is closed")]
    Closed,

    /// The worker stopped before processing the command.
    ///
    /// Delivered for every entry left buffered at shutdown, and whenever the
    /// reply slot is dropped without being resolved.
    #[error("worker shut down before the command was processed")]
    Shutdown,
}

/// Error returned when a reply slot is resolved more than once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    /// The slot already holds a result; the new one was discarded.
    #[error("reply slot already resolved")]
    AlreadyResolved,
}

/// Failure of a single command inside the worker loop.
///
/// Never surfaces to producers directly: the worker turns each variant into
/// reply text. Kept as a type so the loop can log and count outcomes.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CommandError<E: std::error::Error + Send + Sync + 'static> {
    /// Command rejected by the state machine.
    #[error(transparent)]
    Rejected(E),

    /// Event append or state write failed after a successful `apply`.
    #[error("persistence failed: {0}")]
    Persistence(#[from] std::io::Error),

    /// The state machine panicked while handling the command.
    #[error("state machine panicked: {0}")]
    Fault(String),
}

/// Error returned when the worker task itself fails.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Reading the event log at startup failed.
    ///
    /// No command was processed; every buffered entry was abandoned.
    #[error("event replay failed: {0}")]
    Replay(#[source] std::io::Error),

    /// The worker task panicked or was aborted.
    #[error("worker task failed: {0}")]
    Join(String),
}

/// Error returned when a console line cannot be turned into a command.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// The line was blank.
    #[error("missing command type")]
    MissingType,
}
