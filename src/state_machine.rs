//! State machine contract supplied by the domain.

use crate::command::Command;
use crate::event::{ProposedEvent, RecordedEvent};

/// A domain state whose history is the event log.
///
/// The implementing type itself is the state, and [`Default`] is the empty
/// state that replay starts from.
///
/// # Contract
///
/// - [`apply`](StateMachine::apply) is a pure decision function: no I/O,
///   no side effects. It validates `command` against `self` and returns
///   the next state together with the event that records the transition.
/// - [`reduce`](StateMachine::reduce) is a pure, total fold of one event.
///   For every `(next, event)` returned by `apply`, reducing the recorded
///   `event` into `self` must yield `next`. Unknown event types should
///   leave the state unchanged.
pub trait StateMachine: Default + Clone + Send + Sync + 'static {
    /// Rejection reason; its `Display` text is the reply producers receive.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Decide whether `command` is valid in the current state.
    ///
    /// # Returns
    ///
    /// The next state and the event to persist, or the rejection reason.
    fn apply(&self, command: &Command) -> Result<(Self, ProposedEvent), Self::Error>;

    /// Fold one persisted event into the state.
    fn reduce(self, event: &RecordedEvent) -> Self;
}
