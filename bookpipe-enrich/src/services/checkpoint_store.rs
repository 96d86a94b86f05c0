//! Append-only checkpoint store
//!
//! One JSON object per line, each line a full [`EnrichmentResult`]. A line is
//! valid only once its terminating newline is on disk; anything after the
//! last newline is a torn write from an interrupted append and is discarded
//! on load (and truncated away when the store is opened for writing, so the
//! next append starts on a clean line boundary).
//!
//! A key may appear on several lines (re-fetch after `retry_errors`); the
//! last line wins.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::error::EnrichError;
use crate::models::{EnrichmentResult, FetchStatus};
use crate::utils::RunLock;

/// Checkpoint read errors
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint {path} unreadable: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("checkpoint {path} line {line} is corrupt: {reason}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        reason: String,
    },
}

/// Everything recovered from a checkpoint file
#[derive(Debug, Clone, Default)]
pub struct CheckpointSnapshot {
    /// Latest entry per key
    pub entries: BTreeMap<String, EnrichmentResult>,
    /// Complete lines parsed
    pub lines: usize,
    /// Lines replaced by a later line with the same key
    pub superseded: usize,
    /// Bytes after the last newline (torn final write)
    pub torn_tail_bytes: u64,
    /// Length of the valid prefix of the file
    pub valid_len: u64,
}

impl CheckpointSnapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn count(&self, status: FetchStatus) -> usize {
        self.entries
            .values()
            .filter(|e| e.fetch_status == status)
            .count()
    }
}

/// Read a checkpoint file without taking the write lock
///
/// A missing file is an empty checkpoint.
pub fn load(path: &Path) -> Result<CheckpointSnapshot, CheckpointError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(CheckpointSnapshot::default());
        }
        Err(source) => {
            return Err(CheckpointError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let mut snapshot = CheckpointSnapshot::default();
    let mut offset = 0usize;
    let mut line_no = 0usize;

    while offset < bytes.len() {
        let Some(rel) = bytes[offset..].iter().position(|&b| b == b'\n') else {
            snapshot.torn_tail_bytes = (bytes.len() - offset) as u64;
            break;
        };

        let line = &bytes[offset..offset + rel];
        line_no += 1;
        offset += rel + 1;

        if line.iter().all(u8::is_ascii_whitespace) {
            snapshot.valid_len = offset as u64;
            continue;
        }

        let entry: EnrichmentResult =
            serde_json::from_slice(line).map_err(|e| CheckpointError::Corrupt {
                path: path.to_path_buf(),
                line: line_no,
                reason: e.to_string(),
            })?;

        if snapshot.entries.insert(entry.key.clone(), entry).is_some() {
            snapshot.superseded += 1;
        }
        snapshot.lines += 1;
        snapshot.valid_len = offset as u64;
    }

    Ok(snapshot)
}

/// Destination of checkpoint lines
///
/// `append_line` returns only once the whole line is durable.
pub trait CheckpointSink: Send {
    fn append_line(&mut self, line: &[u8]) -> std::io::Result<()>;
}

impl CheckpointSink for File {
    fn append_line(&mut self, line: &[u8]) -> std::io::Result<()> {
        self.write_all(line)?;
        self.sync_data()
    }
}

/// Writable checkpoint, exclusively owned by one run
pub struct CheckpointStore {
    path: PathBuf,
    sink: Box<dyn CheckpointSink>,
    appended: usize,
    _lock: RunLock,
}

impl fmt::Debug for CheckpointStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckpointStore")
            .field("path", &self.path)
            .field("appended", &self.appended)
            .finish_non_exhaustive()
    }
}

impl CheckpointStore {
    /// Lock, load and prepare the checkpoint for appending
    pub fn open(path: &Path) -> Result<(Self, CheckpointSnapshot), EnrichError> {
        Self::open_with(path, |file| Box::new(file) as Box<dyn CheckpointSink>)
    }

    /// Like [`open`](Self::open), with the append handle wrapped by `wrap`
    pub fn open_with<F>(path: &Path, wrap: F) -> Result<(Self, CheckpointSnapshot), EnrichError>
    where
        F: FnOnce(File) -> Box<dyn CheckpointSink>,
    {
        let lock = RunLock::acquire(path)?;
        let snapshot = load(path)?;

        let read_err = |source| CheckpointError::Read {
            path: path.to_path_buf(),
            source,
        };

        if snapshot.torn_tail_bytes > 0 {
            tracing::warn!(
                checkpoint = %path.display(),
                discarded_bytes = snapshot.torn_tail_bytes,
                "Discarding torn final checkpoint entry"
            );
            OpenOptions::new()
                .write(true)
                .open(path)
                .and_then(|f| f.set_len(snapshot.valid_len).and_then(|_| f.sync_all()))
                .map_err(read_err)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(read_err)?;

        tracing::info!(
            checkpoint = %path.display(),
            entries = snapshot.len(),
            superseded = snapshot.superseded,
            "Checkpoint loaded"
        );

        Ok((
            Self {
                path: path.to_path_buf(),
                sink: wrap(file),
                appended: 0,
                _lock: lock,
            },
            snapshot,
        ))
    }

    /// Durably append one entry
    ///
    /// On `Ok` the line, including its newline, has been handed to the disk
    /// with `sync_data`.
    pub fn append(&mut self, entry: &EnrichmentResult) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(entry).map_err(std::io::Error::other)?;
        line.push(b'\n');
        self.sink.append_line(&line)?;
        self.appended += 1;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entries appended through this handle
    pub fn appended(&self) -> usize {
        self.appended
    }
}
