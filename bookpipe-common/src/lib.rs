//! # bookpipe common library
//!
//! Shared code for the bookpipe pipeline stages including:
//! - Error and result types
//! - TOML configuration loading and logging setup
//! - Item Record / Joined Dataset tables and their Parquet I/O
//! - Silver-layer quality gates
//! - Timestamp helpers

pub mod config;
pub mod error;
pub mod quality;
pub mod table;
pub mod time;

pub use error::{Error, Result};
pub use table::{ItemRecord, JoinedRow};
