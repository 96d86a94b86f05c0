//! Data models for the enrichment stage

pub mod enrichment;
pub mod run_state;

pub use enrichment::{EnrichmentResult, FetchStatus};
pub use run_state::{DriverState, RunOutcome, RunSession, StateTransition};
