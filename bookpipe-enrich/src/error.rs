//! Error types for bookpipe-enrich
//!
//! Item-level fetch failures never appear here: the fetch client folds them
//! into an `error` / `not_found` status on the result. Everything in
//! [`EnrichError`] aborts the run, because continuing past it risks losing
//! completed work or writing a wrong-sized dataset.

use std::path::PathBuf;
use thiserror::Error;

use crate::services::checkpoint_store::CheckpointError;
use crate::utils::run_lock::LockError;

/// Run-level error
#[derive(Debug, Error)]
pub enum EnrichError {
    /// A checkpoint append did not reach disk
    #[error("Checkpoint write failed for key {key}: {source}")]
    CheckpointWrite {
        key: String,
        #[source]
        source: std::io::Error,
    },

    /// Checkpoint file unreadable or corrupt
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    /// Another run holds the checkpoint
    #[error(transparent)]
    Locked(#[from] LockError),

    /// Merge produced a different number of rows than there are items
    #[error("Row count mismatch: {items} items but {joined} joined rows")]
    RowCountMismatch { items: usize, joined: usize },

    /// Reading or writing a table file failed
    #[error("Table I/O failed for {path}: {source}")]
    Table {
        path: PathBuf,
        #[source]
        source: bookpipe_common::Error,
    },

    /// Run summary could not be written
    #[error("Failed to write run summary {path}: {source}")]
    Summary {
        path: PathBuf,
        #[source]
        source: bookpipe_common::Error,
    },

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP client could not be constructed
    #[error("HTTP client error: {0}")]
    HttpClient(String),
}

/// Result type for the enrichment stage
pub type Result<T> = std::result::Result<T, EnrichError>;
