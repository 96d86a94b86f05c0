//! Enrichment workflow: driver state machine, result merge, run summary

pub mod driver;
pub mod merger;
pub mod summary;

pub use driver::{join_from_checkpoint, DriverConfig, EnrichmentDriver, JoinReport};
pub use merger::merge;
pub use summary::{RunSummary, StatusCounts};
