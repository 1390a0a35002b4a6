//! Interactive counter served over stdin/stdout.
//!
//! Run with: `cargo run --example counter [data-dir]`
//!
//! Each input line is `<command> [body]`:
//!
//! ```text
//! increment
//! add 10
//! decrement
//! reset
//! ```
//!
//! Accepted commands print their event id; rejected ones print the reason.
//! Events and the latest state land in `data-dir` (default: a temp dir), so
//! running again with the same directory resumes the counter.
//! Set `RUST_LOG=command_postbox=debug` for worker logs on stderr.

use command_postbox::{
    Command, ProposedEvent, RecordedEvent, StateMachine, StoreLayout, WorkerBuilder, console,
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// Counter state machine
// ---------------------------------------------------------------------------

/// A counter that never goes below zero.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Counter {
    value: i64,
}

#[derive(Debug, thiserror::Error)]
enum CounterError {
    #[error("counter is already zero, cannot decrement")]
    AlreadyZero,
    #[error("counter is already zero, nothing to reset")]
    NothingToReset,
    #[error("not a positive number: {0:?}")]
    BadAmount(String),
    #[error("unknown command: {0}")]
    Unknown(String),
}

impl StateMachine for Counter {
    type Error = CounterError;

    fn apply(&self, cmd: &Command) -> Result<(Self, ProposedEvent), CounterError> {
        let event = match cmd.command_type.as_str() {
            "increment" => ProposedEvent::new("Incremented", "1"),
            "add" => match cmd.body.trim().parse::<i64>() {
                Ok(n) if n > 0 => ProposedEvent::new("Incremented", n.to_string()),
                _ => return Err(CounterError::BadAmount(cmd.body.clone())),
            },
            "decrement" if self.value <= 0 => return Err(CounterError::AlreadyZero),
            "decrement" => ProposedEvent::new("Decremented", "1"),
            "reset" if self.value == 0 => return Err(CounterError::NothingToReset),
            "reset" => ProposedEvent::new("WasReset", self.value.to_string()),
            other => return Err(CounterError::Unknown(other.to_string())),
        };
        let next = self.clone().reduce(&event.clone().record(0));
        Ok((next, event))
    }

    fn reduce(mut self, event: &RecordedEvent) -> Self {
        let n: i64 = event.body.parse().unwrap_or(0);
        match event.event_type.as_str() {
            "Incremented" => self.value += n,
            "Decremented" => self.value -= n,
            "WasReset" => self.value = 0,
            _ => {}
        }
        self
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    // Keep the temp dir alive until the worker has stopped.
    let tmp = tempfile::tempdir()?;
    let base_dir = std::env::args_os()
        .nth(1)
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| tmp.path().to_path_buf());
    let layout = StoreLayout::new(base_dir);

    let (postbox, worker) = WorkerBuilder::<Counter>::open_files(&layout)?
        .name("counter")
        .spawn();

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let answered = console::serve_lines(&postbox, stdin, tokio::io::stdout()).await?;

    let stats = worker.shutdown().await?;
    eprintln!(
        "answered {answered} commands ({} accepted, {} rejected, {} failed); data in {}",
        stats.accepted,
        stats.rejected,
        stats.failed,
        layout.base_dir().display()
    );

    Ok(())
}
