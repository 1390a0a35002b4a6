//! File-backed event and state stores.
//!
//! Events are appended to `events.jsonl`, one JSON object per line, and
//! flushed to disk before their id is returned. An append that fails leaves
//! the file exactly as it was. The state snapshot lives in `state.json` and
//! is replaced atomically via a temp-rename, so readers never see a
//! partially-written file. See [`StoreLayout`] for paths.

use std::fs::OpenOptions;
use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::LinesStream;

use crate::event::{ProposedEvent, RecordedEvent};
use crate::storage::StoreLayout;
use crate::store::{EventStream, EventStore, StateStore};

fn invalid_data(e: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

/// Decode one line of the event log.
fn decode_line(line: &str) -> io::Result<RecordedEvent> {
    serde_json::from_str(line).map_err(invalid_data)
}

/// Committed prefix of an existing log.
#[derive(Debug, Default, PartialEq, Eq)]
struct LogTail {
    /// Id of the last complete event, 0 if there is none.
    last_id: u64,
    /// Byte length up to and including the last newline.
    committed_len: u64,
}

/// Scan an existing log for its last id and committed length.
///
/// A trailing line without its newline was never acknowledged and is left
/// out of `committed_len`. Any malformed complete line is an error.
fn scan_log(path: &Path) -> io::Result<LogTail> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(LogTail::default()),
        Err(e) => return Err(e),
    };

    let mut tail = LogTail::default();
    for line in bytes.split_inclusive(|b| *b == b'\n') {
        if line.last() != Some(&b'\n') {
            break;
        }
        tail.committed_len += line.len() as u64;

        let text = std::str::from_utf8(line).map_err(invalid_data)?.trim();
        if !text.is_empty() {
            tail.last_id = decode_line(text)?.id;
        }
    }
    Ok(tail)
}

/// Append handle plus the committed state of the file behind it.
#[derive(Debug)]
struct LogWriter {
    file: File,
    last_id: u64,
    len: u64,
}

impl LogWriter {
    /// Append one complete line and sync it, or roll the file back to its
    /// previous length.
    async fn write_line(&mut self, line: &[u8]) -> io::Result<()> {
        match self.write_synced(line).await {
            Ok(()) => {
                self.len += line.len() as u64;
                Ok(())
            }
            Err(e) => {
                if let Err(rollback) = self.file.set_len(self.len).await {
                    tracing::error!(
                        error = %rollback,
                        len = self.len,
                        "failed to truncate partial event line"
                    );
                }
                Err(e)
            }
        }
    }

    async fn write_synced(&mut self, line: &[u8]) -> io::Result<()> {
        self.file.write_all(line).await?;
        self.file.flush().await?;
        self.file.sync_data().await
    }
}

/// Event store persisted as a JSON-lines file.
///
/// Appends are serialized through an internal lock and run on tokio's
/// blocking pool. Reopening a log resumes id assignment after the last
/// stored event and drops a torn trailing line left by a crash.
#[derive(Debug)]
pub struct FileEventStore {
    path: PathBuf,
    writer: Mutex<LogWriter>,
}

impl FileEventStore {
    /// Open (or create) the event log described by `layout`.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if the directory or file cannot be created, or
    /// if an existing log contains a complete line that is not a valid
    /// event.
    pub fn open(layout: &StoreLayout) -> io::Result<Self> {
        layout.ensure()?;
        let path = layout.events_path();
        let tail = scan_log(&path)?;
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        let len = file.metadata()?.len();
        if len > tail.committed_len {
            tracing::warn!(
                path = %path.display(),
                dropped_bytes = len - tail.committed_len,
                "truncating torn trailing line in event log"
            );
            file.set_len(tail.committed_len)?;
        }

        tracing::debug!(path = %path.display(), last_id = tail.last_id, "opened event log");

        Ok(Self {
            path,
            writer: Mutex::new(LogWriter {
                file: File::from_std(file),
                last_id: tail.last_id,
                len: tail.committed_len,
            }),
        })
    }

    /// Path of the underlying JSON-lines file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait::async_trait]
impl EventStore for FileEventStore {
    async fn append(&self, event: ProposedEvent) -> io::Result<u64> {
        let mut writer = self.writer.lock().await;
        let id = writer.last_id + 1;
        let mut line = serde_json::to_vec(&event.record(id)).map_err(invalid_data)?;
        line.push(b'\n');

        writer.write_line(&line).await?;
        writer.last_id = id;
        Ok(id)
    }

    async fn read_from(&self, offset: u64) -> io::Result<EventStream> {
        let file = match File::open(&self.path).await {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(Box::pin(tokio_stream::empty::<io::Result<RecordedEvent>>()));
            }
            Err(e) => return Err(e),
        };

        let lines = LinesStream::new(tokio::io::BufReader::new(file).lines());
        let events = lines.filter_map(move |line| match line {
            Ok(line) if line.trim().is_empty() => None,
            Ok(line) => match decode_line(&line) {
                Ok(event) if event.id < offset => None,
                decoded => Some(decoded),
            },
            Err(e) => Some(Err(e)),
        });
        Ok(Box::pin(events))
    }
}

/// State store persisted as a single JSON file.
///
/// A missing file reads as `S::default()`. An undecodable file is logged and
/// also read as `S::default()`: the snapshot is only a cache of the event
/// log, which replay treats as authoritative.
#[derive(Debug)]
pub struct FileStateStore<S> {
    path: PathBuf,
    _marker: PhantomData<fn() -> S>,
}

impl<S> FileStateStore<S> {
    /// Open the state snapshot described by `layout`, creating its directory.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if the directory cannot be created.
    pub fn open(layout: &StoreLayout) -> io::Result<Self> {
        layout.ensure()?;
        Ok(Self {
            path: layout.state_path(),
            _marker: PhantomData,
        })
    }

    /// Path of the snapshot file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait::async_trait]
impl<S> StateStore<S> for FileStateStore<S>
where
    S: Serialize + DeserializeOwned + Default + Send + Sync,
{
    async fn get(&self) -> io::Result<S> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(S::default()),
            Err(e) => return Err(e),
        };

        match serde_json::from_slice(&bytes) {
            Ok(state) => Ok(state),
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "failed to deserialize state snapshot; treating as empty"
                );
                Ok(S::default())
            }
        }
    }

    async fn set(&self, state: &S) -> io::Result<()> {
        let json = serde_json::to_vec_pretty(state).map_err(invalid_data)?;
        let tmp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &json).await?;
        tokio::fs::rename(&tmp_path, &self.path).await
    }
}
