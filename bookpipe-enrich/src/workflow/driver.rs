//! Enrichment driver
//!
//! Orchestrates one pass over the pending keys:
//! INIT → LOADING_CHECKPOINT → FETCHING → FINALIZING → DONE
//!
//! **Commit point:** a key counts as done once its checkpoint line is on
//! disk. The accumulated result set is updated only after the append
//! succeeds, so a crash between the two re-fetches that key on restart and
//! nothing else.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Instant;

use bookpipe_common::{table, ItemRecord};
use tokio_util::sync::CancellationToken;

use super::merger;
use super::summary::{RunSummary, StatusCounts};
use crate::error::{EnrichError, Result};
use crate::models::{DriverState, EnrichmentResult, FetchStatus, RunOutcome, RunSession};
use crate::services::checkpoint_store::{self, CheckpointSnapshot, CheckpointStore};
use crate::services::fetch_client::{DescriptionApi, FetchClient};

/// Driver tuning
#[derive(Debug, Clone, PartialEq)]
pub struct DriverConfig {
    /// Abort when the `error` share of accumulated results is above this
    pub failure_rate_threshold: f64,
    /// Results required before the rate is checked mid-run
    pub failure_check_min_samples: usize,
    /// Log a progress line every N fetches (0 disables)
    pub progress_interval: usize,
    /// Treat checkpointed `error` entries as pending again
    pub retry_errors_on_resume: bool,
    /// Restrict the candidates to the first N items
    pub limit: Option<usize>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 0.5,
            failure_check_min_samples: 50,
            progress_interval: 50,
            retry_errors_on_resume: false,
            limit: None,
        }
    }
}

/// Mutable state of one run
struct RunContext {
    session: RunSession,
    store: CheckpointStore,
    accumulated: BTreeMap<String, EnrichmentResult>,
    counts: StatusCounts,
    fetched: usize,
}

impl RunContext {
    /// Fold a committed result into the accumulated set
    fn accept(&mut self, result: EnrichmentResult) {
        self.counts.record(result.fetch_status);
        if let Some(previous) = self.accumulated.insert(result.key.clone(), result) {
            self.counts.forget(previous.fetch_status);
        }
    }
}

/// Enrichment driver
///
/// Owns the fetch client and the cancellation token; the checkpoint store is
/// opened (and locked) per run.
pub struct EnrichmentDriver<A> {
    client: FetchClient<A>,
    config: DriverConfig,
    cancel: CancellationToken,
}

impl<A: DescriptionApi> EnrichmentDriver<A> {
    pub fn new(client: FetchClient<A>, config: DriverConfig, cancel: CancellationToken) -> Self {
        Self {
            client,
            config,
            cancel,
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Enrich `items`, resuming from `checkpoint`, and write the Joined
    /// Dataset to `output`
    ///
    /// Item-level failures and the failure-rate abort are reported through
    /// the returned summary's outcome. `Err` means a storage or integrity
    /// fault.
    pub async fn run(
        &self,
        items: &[ItemRecord],
        checkpoint: &Path,
        output: &Path,
    ) -> Result<RunSummary> {
        self.run_with_store(items, output, || CheckpointStore::open(checkpoint))
            .await
    }

    /// [`run`](Self::run) with the checkpoint store produced by `open_store`
    pub async fn run_with_store<F>(
        &self,
        items: &[ItemRecord],
        output: &Path,
        open_store: F,
    ) -> Result<RunSummary>
    where
        F: FnOnce() -> Result<(CheckpointStore, CheckpointSnapshot)>,
    {
        let started = Instant::now();
        let mut session = RunSession::new();

        tracing::info!(
            run_id = %session.run_id,
            items = items.len(),
            "Starting enrichment run"
        );

        // **LOADING_CHECKPOINT**
        session.transition_to(DriverState::LoadingCheckpoint);

        let candidates = match self.config.limit {
            Some(limit) => &items[..limit.min(items.len())],
            None => items,
        };
        let candidate_keys: BTreeSet<&str> = candidates.iter().map(|i| i.key.as_str()).collect();

        let (store, snapshot) = open_store()?;
        let accumulated: BTreeMap<String, EnrichmentResult> = snapshot
            .entries
            .into_iter()
            .filter(|(key, _)| candidate_keys.contains(key.as_str()))
            .collect();

        let pending: Vec<String> = candidate_keys
            .iter()
            .filter(|key| match accumulated.get(**key) {
                None => true,
                Some(entry) => {
                    self.config.retry_errors_on_resume && entry.fetch_status == FetchStatus::Error
                }
            })
            .map(|key| key.to_string())
            .collect();
        let recovered = candidate_keys.len() - pending.len();

        tracing::info!(
            candidates = candidate_keys.len(),
            recovered,
            pending = pending.len(),
            "Pending work computed"
        );

        let mut ctx = RunContext {
            counts: StatusCounts::from_results(accumulated.values()),
            session,
            store,
            accumulated,
            fetched: 0,
        };

        // **FETCHING**
        let mut interrupted = false;
        for key in &pending {
            if self.cancel.is_cancelled() {
                tracing::info!(
                    remaining = pending.len() - ctx.fetched,
                    "Interrupt received, stopping before next key"
                );
                interrupted = true;
                break;
            }
            ctx.session.transition_to(DriverState::Fetching);

            let result = self.client.fetch(key).await;
            if let Err(source) = ctx.store.append(&result) {
                tracing::error!(key = %key, error = %source, "Checkpoint append failed, aborting run");
                ctx.session.transition_to(DriverState::Done);
                return Err(EnrichError::CheckpointWrite {
                    key: key.clone(),
                    source,
                });
            }
            ctx.accept(result);
            ctx.fetched += 1;

            if self.config.progress_interval > 0 && ctx.fetched % self.config.progress_interval == 0 {
                tracing::info!(
                    fetched = ctx.fetched,
                    pending = pending.len(),
                    ok = ctx.counts.ok,
                    not_found = ctx.counts.not_found,
                    error = ctx.counts.error,
                    "Enrichment progress"
                );
            }

            if ctx.counts.total() >= self.config.failure_check_min_samples {
                if let Some(outcome) = self.failure_rate_outcome(&ctx.counts) {
                    return Ok(self.abort(ctx, outcome, candidates.len(), recovered, &pending, started));
                }
            }
        }

        // Final check covers every path, including nothing pending
        if let Some(outcome) = self.failure_rate_outcome(&ctx.counts) {
            return Ok(self.abort(ctx, outcome, candidates.len(), recovered, &pending, started));
        }

        // **FINALIZING**
        ctx.session.transition_to(DriverState::Finalizing);
        let joined = merger::merge(candidates, ctx.accumulated.values())?;
        table::write_joined(output, &joined).map_err(|source| EnrichError::Table {
            path: output.to_path_buf(),
            source,
        })?;
        tracing::info!(output = %output.display(), rows = joined.len(), "Joined dataset written");

        let outcome = if interrupted {
            RunOutcome::Interrupted
        } else if ctx.counts.ok == candidates.len() {
            RunOutcome::Complete
        } else {
            RunOutcome::Degraded
        };

        ctx.session.transition_to(DriverState::Done);
        let summary = self.summarize(
            ctx,
            outcome,
            candidates.len(),
            recovered,
            &pending,
            Some(output.to_path_buf()),
            started,
        );
        tracing::info!(run_id = %summary.run_id, "{}", summary.display_string());
        Ok(summary)
    }

    fn failure_rate_outcome(&self, counts: &StatusCounts) -> Option<RunOutcome> {
        let error_rate = counts.error_rate();
        (error_rate > self.config.failure_rate_threshold).then(|| RunOutcome::FailureRateExceeded {
            error_rate,
            threshold: self.config.failure_rate_threshold,
        })
    }

    fn abort(
        &self,
        mut ctx: RunContext,
        outcome: RunOutcome,
        candidates: usize,
        recovered: usize,
        pending: &[String],
        started: Instant,
    ) -> RunSummary {
        tracing::error!(
            ok = ctx.counts.ok,
            not_found = ctx.counts.not_found,
            error = ctx.counts.error,
            "{}; no dataset written, checkpoint kept for resume",
            outcome.display_string()
        );
        ctx.session.transition_to(DriverState::Done);
        self.summarize(ctx, outcome, candidates, recovered, pending, None, started)
    }

    #[allow(clippy::too_many_arguments)]
    fn summarize(
        &self,
        ctx: RunContext,
        outcome: RunOutcome,
        candidates: usize,
        recovered: usize,
        pending: &[String],
        output: Option<PathBuf>,
        started: Instant,
    ) -> RunSummary {
        RunSummary {
            run_id: ctx.session.run_id,
            outcome,
            candidates,
            recovered,
            fetched_this_run: ctx.fetched,
            pending_remaining: pending.len() - ctx.fetched,
            counts: ctx.counts,
            output,
            states: ctx.session.visited_states(),
            started_at: ctx.session.started_at,
            ended_at: ctx.session.ended_at.unwrap_or_else(bookpipe_common::time::now),
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// Counts reported by [`join_from_checkpoint`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinReport {
    pub rows: usize,
    pub counts: StatusCounts,
    /// Items with no checkpoint entry
    pub unattempted: usize,
}

/// Rebuild the Joined Dataset from an existing checkpoint, no network
///
/// Reads the checkpoint without taking the run lock; a torn tail written by
/// a concurrent run is ignored like on any other load.
pub fn join_from_checkpoint(
    items: &[ItemRecord],
    checkpoint: &Path,
    output: &Path,
) -> Result<JoinReport> {
    let snapshot = checkpoint_store::load(checkpoint)?;
    let item_keys: BTreeSet<&str> = items.iter().map(|i| i.key.as_str()).collect();
    let matched: Vec<&EnrichmentResult> = snapshot
        .entries
        .values()
        .filter(|e| item_keys.contains(e.key.as_str()))
        .collect();

    let joined = merger::merge(items, matched.iter().copied())?;
    table::write_joined(output, &joined).map_err(|source| EnrichError::Table {
        path: output.to_path_buf(),
        source,
    })?;

    let counts = StatusCounts::from_results(matched.iter().copied());
    let report = JoinReport {
        rows: joined.len(),
        counts,
        unattempted: items.len().saturating_sub(counts.total()),
    };
    tracing::info!(
        output = %output.display(),
        rows = report.rows,
        unattempted = report.unattempted,
        "{}",
        counts.display_string()
    );
    Ok(report)
}
