//! On-disk directory layout for the file-backed stores.

use std::fs;
use std::path::{Path, PathBuf};

/// Manages the on-disk layout of one command processor's data.
///
/// ```text
/// <base_dir>/
///     events.jsonl    -- one recorded event per line
///     state.json      -- latest state snapshot
/// ```
///
/// Cheap to clone (wraps a single `PathBuf`).
#[derive(Debug, Clone)]
pub struct StoreLayout {
    base_dir: PathBuf,
}

impl StoreLayout {
    /// Create a layout rooted at `base_dir`.
    ///
    /// The directory does not need to exist yet; [`ensure`](StoreLayout::ensure)
    /// creates it.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Directory holding both files.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// `<base_dir>/events.jsonl`
    pub fn events_path(&self) -> PathBuf {
        self.base_dir.join("events.jsonl")
    }

    /// `<base_dir>/state.json`
    pub fn state_path(&self) -> PathBuf {
        self.base_dir.join("state.json")
    }

    /// Create the base directory if it is missing. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns `std::io::Error` if directory creation fails.
    pub fn ensure(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.base_dir)
    }
}
