//! Enrichment results
//!
//! One [`EnrichmentResult`] exists per item key. The same struct is the
//! checkpoint line format, so a restarted run rebuilds its accumulated result
//! set from the checkpoint file without touching the network.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Terminal outcome of one logical fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    /// Payload retrieved (description may still be empty)
    Ok,
    /// The catalog has no record for this key
    NotFound,
    /// Retries exhausted or a non-retryable failure
    Error,
}

impl FetchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchStatus::Ok => "ok",
            FetchStatus::NotFound => "not_found",
            FetchStatus::Error => "error",
        }
    }
}

impl fmt::Display for FetchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Description fetched for one item key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentResult {
    pub key: String,
    pub fetch_status: FetchStatus,
    /// Empty when the source had no description or the fetch did not succeed
    #[serde(default)]
    pub description: String,
    pub fetched_at: DateTime<Utc>,
    /// HTTP attempts consumed by this logical fetch
    #[serde(default = "default_attempts")]
    pub attempts: u32,
}

fn default_attempts() -> u32 {
    1
}

impl EnrichmentResult {
    pub fn ok(key: impl Into<String>, description: impl Into<String>, attempts: u32) -> Self {
        Self {
            key: key.into(),
            fetch_status: FetchStatus::Ok,
            description: description.into(),
            fetched_at: bookpipe_common::time::now(),
            attempts,
        }
    }

    pub fn not_found(key: impl Into<String>, attempts: u32) -> Self {
        Self {
            key: key.into(),
            fetch_status: FetchStatus::NotFound,
            description: String::new(),
            fetched_at: bookpipe_common::time::now(),
            attempts,
        }
    }

    pub fn error(key: impl Into<String>, attempts: u32) -> Self {
        Self {
            key: key.into(),
            fetch_status: FetchStatus::Error,
            description: String::new(),
            fetched_at: bookpipe_common::time::now(),
            attempts,
        }
    }

    /// Description text that belongs in the Joined Dataset
    ///
    /// Only `ok` results contribute text.
    pub fn joined_description(&self) -> &str {
        match self.fetch_status {
            FetchStatus::Ok => &self.description,
            FetchStatus::NotFound | FetchStatus::Error => "",
        }
    }
}
