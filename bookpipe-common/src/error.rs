//! Common error types for bookpipe

use thiserror::Error;

/// Common result type for bookpipe operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across bookpipe stages
#[derive(Error, Debug)]
pub enum Error {
    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Parquet encode/decode error
    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    /// Arrow array construction or cast error
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Table does not have the expected shape
    #[error("Schema error: {0}")]
    Schema(String),

    /// Invalid user input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
