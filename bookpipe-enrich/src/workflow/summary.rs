//! Run summary
//!
//! Display: "N candidates: X ok, Y not found, Z error (F fetched this run,
//! R recovered from checkpoint), <outcome>"

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::{EnrichError, Result};
use crate::models::{DriverState, EnrichmentResult, FetchStatus, RunOutcome};

/// Result counts by status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub ok: usize,
    pub not_found: usize,
    pub error: usize,
}

impl StatusCounts {
    pub fn from_results<'a, I>(results: I) -> Self
    where
        I: IntoIterator<Item = &'a EnrichmentResult>,
    {
        let mut counts = Self::default();
        for result in results {
            counts.record(result.fetch_status);
        }
        counts
    }

    pub fn record(&mut self, status: FetchStatus) {
        match status {
            FetchStatus::Ok => self.ok += 1,
            FetchStatus::NotFound => self.not_found += 1,
            FetchStatus::Error => self.error += 1,
        }
    }

    /// Undo [`record`](Self::record) for a result that was replaced
    pub fn forget(&mut self, status: FetchStatus) {
        let slot = match status {
            FetchStatus::Ok => &mut self.ok,
            FetchStatus::NotFound => &mut self.not_found,
            FetchStatus::Error => &mut self.error,
        };
        *slot = slot.saturating_sub(1);
    }

    pub fn total(&self) -> usize {
        self.ok + self.not_found + self.error
    }

    /// Share of `error` results; 0 when nothing has been counted
    pub fn error_rate(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            total => self.error as f64 / total as f64,
        }
    }

    pub fn display_string(&self) -> String {
        format!(
            "{} ok, {} not found, {} error",
            self.ok, self.not_found, self.error
        )
    }
}

/// What one run did
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    #[serde(flatten)]
    pub outcome: RunOutcome,
    /// Candidate keys considered this run (after `limit`)
    pub candidates: usize,
    /// Candidate keys whose result came from the checkpoint
    pub recovered: usize,
    /// Logical fetches performed this run
    pub fetched_this_run: usize,
    /// Candidate keys still without a result
    pub pending_remaining: usize,
    pub counts: StatusCounts,
    /// Joined Dataset path, when one was written
    pub output: Option<PathBuf>,
    /// Driver states visited, self-loops collapsed
    pub states: Vec<DriverState>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

impl RunSummary {
    pub fn exit_code(&self) -> u8 {
        self.outcome.exit_code()
    }

    pub fn display_string(&self) -> String {
        format!(
            "{} candidates: {} ({} fetched this run, {} recovered from checkpoint), {}",
            self.candidates,
            self.counts.display_string(),
            self.fetched_this_run,
            self.recovered,
            self.outcome.display_string()
        )
    }

    /// Write the summary as pretty JSON
    pub fn write_json(&self, path: &Path) -> Result<()> {
        bookpipe_common::quality::write_report(path, self).map_err(|source| {
            EnrichError::Summary {
                path: path.to_path_buf(),
                source,
            }
        })
    }
}
