//! Write-once reply slot connecting one posted command to its producer.
//!
//! The worker holds the [`Resolver`] half, the producer awaits the
//! [`PendingReply`] half. A slot is resolved at most once: the sender is
//! taken out of the resolver on first use, so a second attempt finds it
//! empty and is reported as [`ResolveError::AlreadyResolved`] instead of
//! overwriting the first result.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::{PostError, ResolveError};

/// Value carried through a reply slot.
type ReplyResult = Result<String, PostError>;

/// Create a connected resolver / pending-reply pair.
pub(crate) fn reply_slot() -> (Resolver, PendingReply) {
    let (tx, rx) = oneshot::channel();
    let resolver = Resolver {
        slot: Mutex::new(Some(tx)),
    };
    let pending = PendingReply {
        inner: Inner::Waiting(rx),
    };
    (resolver, pending)
}

/// Consumer-side handle that resolves exactly one [`PendingReply`].
///
/// Dropping a resolver that was never used resolves the reply with
/// [`PostError::Shutdown`], so a producer is never left waiting on a slot
/// nobody can complete.
#[derive(Debug)]
pub struct Resolver {
    slot: Mutex<Option<oneshot::Sender<ReplyResult>>>,
}

impl Resolver {
    /// Resolve the reply with the command's result text.
    ///
    /// # Arguments
    ///
    /// * `result` - Success token, rejection reason, or failure text.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::AlreadyResolved`] if the slot was already
    /// resolved or abandoned. The earlier result is kept.
    pub fn resolve(&self, result: impl Into<String>) -> Result<(), ResolveError> {
        self.complete(Ok(result.into()))
    }

    /// Resolve the reply with [`PostError::Shutdown`].
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::AlreadyResolved`] if the slot was already
    /// resolved or abandoned.
    pub fn abandon(&self) -> Result<(), ResolveError> {
        self.complete(Err(PostError::Shutdown))
    }

    /// Returns `true` once the slot has been resolved or abandoned.
    pub fn is_resolved(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    fn complete(&self, value: ReplyResult) -> Result<(), ResolveError> {
        let sender = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(ResolveError::AlreadyResolved)?;

        // The producer may have stopped waiting; the slot still counts as resolved.
        if sender.send(value).is_err() {
            tracing::debug!("reply dropped by producer before resolution");
        }
        Ok(())
    }
}

/// Future returned by [`Postbox::post`](crate::Postbox::post).
///
/// Resolves to the reply text once the worker has processed the command,
/// or to a [`PostError`] if the command was never processed.
#[derive(Debug)]
pub struct PendingReply {
    inner: Inner,
}

#[derive(Debug)]
enum Inner {
    Waiting(oneshot::Receiver<ReplyResult>),
    Failed(PostError),
}

impl PendingReply {
    /// A reply that is already failed, used when the hand-off itself fails.
    pub(crate) fn failed(err: PostError) -> Self {
        Self {
            inner: Inner::Failed(err),
        }
    }
}

impl Future for PendingReply {
    type Output = Result<String, PostError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.inner {
            // A dropped sender means the resolver went away unresolved.
            Inner::Waiting(rx) => Pin::new(rx)
                .poll(cx)
                .map(|received| received.unwrap_or(Err(PostError::Shutdown))),
            Inner::Failed(err) => Poll::Ready(Err(*err)),
        }
    }
}
