//! bookpipe-enrich library interface
//!
//! Resumable, checkpointed description enrichment for cleaned Item Records.
//! Exposes the driver and its collaborators for the binary and for
//! integration tests.

pub mod config;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;
pub mod workflow;

pub use crate::error::{EnrichError, Result};
pub use crate::models::{EnrichmentResult, FetchStatus, RunOutcome};
pub use crate::workflow::{DriverConfig, EnrichmentDriver, RunSummary};
