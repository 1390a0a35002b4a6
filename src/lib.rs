//! Single-writer command processing over an event log.
//!
//! Producers submit [`Command`]s through a [`Postbox`]; one worker task
//! applies them to its state one at a time, records each accepted command as
//! an event, and answers every producer through a write-once reply.

mod command;
pub mod console;
mod error;
mod event;
mod file;
pub mod mailbox;
mod reply;
mod state_machine;
mod storage;
mod store;
mod worker;

pub use command::Command;
pub use error::{ParseError, PostError, ResolveError, WorkerError};
pub use event::{ProposedEvent, RecordedEvent};
pub use file::{FileEventStore, FileStateStore};
pub use mailbox::{Delivery, Inbox, Postbox, Reader};
pub use reply::{PendingReply, Resolver};
pub use state_machine::StateMachine;
pub use storage::StoreLayout;
pub use store::{EventStore, EventStream, InMemoryEventStore, InMemoryStateStore, StateStore};
pub use worker::{FAILURE_REPLY, WorkerBuilder, WorkerHandle, WorkerPhase, WorkerStats, replay};

/// Attribute for implementing [`EventStore`] and [`StateStore`].
pub use async_trait::async_trait;
