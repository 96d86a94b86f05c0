//! Integration tests for the enrichment driver
//!
//! Runs the full LOADING_CHECKPOINT → FETCHING → FINALIZING pass against a
//! scripted description API and real checkpoint / Parquet files.

mod helpers;

use helpers::*;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use bookpipe_common::table;
use bookpipe_enrich::models::{DriverState, EnrichmentResult, FetchStatus, RunOutcome};
use bookpipe_enrich::services::{CheckpointStore, FetchError};
use bookpipe_enrich::workflow::{join_from_checkpoint, DriverConfig};
use bookpipe_enrich::EnrichError;

fn descriptions(path: &std::path::Path) -> Vec<String> {
    table::read_joined(path)
        .unwrap()
        .into_iter()
        .map(|r| r.description)
        .collect()
}

// ============================================================================
// Worked example
// ============================================================================

#[tokio::test]
async fn test_three_key_example() {
    // Given: B1 has a description, B2 is unknown, B3 succeeds after two 503s
    let dir = TempDir::new().unwrap();
    let files = RunFiles::in_dir(dir.path());
    let api = ScriptedApi::new();
    api.ok("/works/B1", "desc1");
    api.not_found("/works/B2");
    api.script(
        "/works/B3",
        vec![
            Err(FetchError::transient("HTTP 503")),
            Err(FetchError::transient("HTTP 503")),
            Ok("desc3".to_string()),
        ],
    );
    let items = items(&["/works/B1", "/works/B2", "/works/B3"]);

    // When: the driver runs with an empty checkpoint
    let summary = default_driver(api.clone())
        .run(&items, &files.checkpoint, &files.output)
        .await
        .unwrap();

    // Then: three checkpoint entries, three joined rows, degraded outcome
    let lines = checkpoint_lines(&files.checkpoint);
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[1].fetch_status, FetchStatus::NotFound);
    assert_eq!(lines[2].attempts, 3);

    assert_eq!(descriptions(&files.output), vec!["desc1", "", "desc3"]);
    assert_eq!(summary.outcome, RunOutcome::Degraded);
    assert_eq!(summary.exit_code(), 2);
    assert_eq!(summary.fetched_this_run, 3);
    assert_eq!((summary.counts.ok, summary.counts.not_found), (2, 1));
    assert_eq!(api.calls(), 5);
    assert_eq!(
        summary.states,
        vec![
            DriverState::Init,
            DriverState::LoadingCheckpoint,
            DriverState::Fetching,
            DriverState::Finalizing,
            DriverState::Done,
        ]
    );
}

#[tokio::test]
async fn test_all_ok_is_complete() {
    let dir = TempDir::new().unwrap();
    let files = RunFiles::in_dir(dir.path());
    let keys = keys(4);
    let items = items(&key_refs(&keys));

    let summary = default_driver(ScriptedApi::new())
        .run(&items, &files.checkpoint, &files.output)
        .await
        .unwrap();

    assert_eq!(summary.outcome, RunOutcome::Complete);
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(summary.output.as_deref(), Some(files.output.as_path()));
}

// ============================================================================
// Idempotence and resume
// ============================================================================

#[tokio::test]
async fn test_second_run_is_idempotent() {
    // Given: a completed run
    let dir = TempDir::new().unwrap();
    let files = RunFiles::in_dir(dir.path());
    let keys = keys(5);
    let items = items(&key_refs(&keys));
    let first_api = ScriptedApi::new();
    first_api.not_found("/works/B4");
    default_driver(first_api)
        .run(&items, &files.checkpoint, &files.output)
        .await
        .unwrap();
    let first_bytes = std::fs::read(&files.output).unwrap();
    let first_checkpoint = std::fs::read(&files.checkpoint).unwrap();

    // When: the same candidates run again
    let second_api = ScriptedApi::new();
    let summary = default_driver(second_api.clone())
        .run(&items, &files.checkpoint, &files.output)
        .await
        .unwrap();

    // Then: no network calls, identical output, checkpoint untouched
    assert_eq!(second_api.calls(), 0);
    assert_eq!(summary.recovered, 5);
    assert_eq!(summary.fetched_this_run, 0);
    assert_eq!(std::fs::read(&files.output).unwrap(), first_bytes);
    assert_eq!(std::fs::read(&files.checkpoint).unwrap(), first_checkpoint);
    assert_eq!(
        summary.states,
        vec![
            DriverState::Init,
            DriverState::LoadingCheckpoint,
            DriverState::Finalizing,
            DriverState::Done,
        ]
    );
}

#[tokio::test]
async fn test_interrupt_then_resume_fetches_each_key_once() {
    // Given: an operator interrupt arrives during the third fetch
    let dir = TempDir::new().unwrap();
    let files = RunFiles::in_dir(dir.path());
    let keys = keys(6);
    let items = items(&key_refs(&keys));

    let cancel = CancellationToken::new();
    let first_api = ScriptedApi::new();
    first_api.cancel_during_call(3, cancel.clone());
    let interrupted = driver(first_api.clone(), DriverConfig::default(), cancel)
        .run(&items, &files.checkpoint, &files.output)
        .await
        .unwrap();

    // Then: the in-flight key was committed and a partial dataset written
    assert_eq!(interrupted.outcome, RunOutcome::Interrupted);
    assert_eq!(interrupted.exit_code(), 130);
    assert_eq!(interrupted.fetched_this_run, 3);
    assert_eq!(interrupted.pending_remaining, 3);
    assert_eq!(checkpoint_lines(&files.checkpoint).len(), 3);
    let partial = table::read_joined(&files.output).unwrap();
    assert_eq!(partial.len(), 6);
    assert_eq!(partial[3].fetch_status, None);

    // When: the run is resumed
    let second_api = ScriptedApi::new();
    let resumed = default_driver(second_api.clone())
        .run(&items, &files.checkpoint, &files.output)
        .await
        .unwrap();

    // Then: only the remaining keys are fetched and the result matches an
    // uninterrupted run
    assert_eq!(second_api.calls(), 3);
    assert_eq!(first_api.calls() + second_api.calls(), keys.len());
    assert_eq!(resumed.recovered, 3);
    assert_eq!(resumed.outcome, RunOutcome::Complete);

    let fresh_dir = TempDir::new().unwrap();
    let fresh = RunFiles::in_dir(fresh_dir.path());
    default_driver(ScriptedApi::new())
        .run(&items, &fresh.checkpoint, &fresh.output)
        .await
        .unwrap();
    assert_eq!(
        table::read_joined(&files.output).unwrap(),
        table::read_joined(&fresh.output).unwrap()
    );
    assert_eq!(
        std::fs::read(&files.output).unwrap(),
        std::fs::read(&fresh.output).unwrap()
    );
}

#[tokio::test]
async fn test_torn_checkpoint_tail_refetches_only_that_key() {
    // Given: a crash left B2's line half written
    let dir = TempDir::new().unwrap();
    let files = RunFiles::in_dir(dir.path());
    let good = serde_json::to_string(&EnrichmentResult::ok("/works/B1", "desc1", 1)).unwrap();
    std::fs::write(
        &files.checkpoint,
        format!("{}\n{{\"key\":\"/works/B2\",\"fetch_sta", good),
    )
    .unwrap();
    let items = items(&["/works/B1", "/works/B2"]);

    // When
    let api = ScriptedApi::new();
    let summary = default_driver(api.clone())
        .run(&items, &files.checkpoint, &files.output)
        .await
        .unwrap();

    // Then
    assert_eq!(api.calls_for("/works/B1"), 0);
    assert_eq!(api.calls_for("/works/B2"), 1);
    assert_eq!(summary.recovered, 1);
    let lines = checkpoint_lines(&files.checkpoint);
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[1].key, "/works/B2");
}

#[tokio::test]
async fn test_error_entries_completed_unless_retry_requested() {
    let dir = TempDir::new().unwrap();
    let files = RunFiles::in_dir(dir.path());
    write_checkpoint(
        &files.checkpoint,
        &[
            EnrichmentResult::ok("/works/B1", "desc1", 1),
            EnrichmentResult::error("/works/B2", 3),
        ],
    );
    let items = items(&["/works/B1", "/works/B2"]);
    let lenient = DriverConfig {
        failure_rate_threshold: 1.0,
        ..DriverConfig::default()
    };

    // Default: the error entry is final
    let api = ScriptedApi::new();
    let summary = driver(api.clone(), lenient.clone(), CancellationToken::new())
        .run(&items, &files.checkpoint, &files.output)
        .await
        .unwrap();
    assert_eq!(api.calls(), 0);
    assert_eq!(summary.outcome, RunOutcome::Degraded);

    // retry_errors_on_resume: B2 becomes pending again
    let api = ScriptedApi::new();
    api.ok("/works/B2", "desc2");
    let config = DriverConfig {
        retry_errors_on_resume: true,
        ..lenient
    };
    let summary = driver(api.clone(), config, CancellationToken::new())
        .run(&items, &files.checkpoint, &files.output)
        .await
        .unwrap();
    assert_eq!(api.calls_for("/works/B2"), 1);
    assert_eq!(summary.recovered, 1);
    assert_eq!(summary.outcome, RunOutcome::Complete);
    assert_eq!(descriptions(&files.output), vec!["desc1", "desc2"]);
    // Both B2 lines remain; the later one wins on load
    assert_eq!(checkpoint_lines(&files.checkpoint).len(), 3);
}

// ============================================================================
// Failure-rate abort
// ============================================================================

#[tokio::test]
async fn test_failure_rate_abort_writes_no_output() {
    // Given: every key fails permanently
    let dir = TempDir::new().unwrap();
    let files = RunFiles::in_dir(dir.path());
    let keys = keys(10);
    let api = ScriptedApi::new();
    for key in &keys {
        api.permanent(key);
    }
    let config = DriverConfig {
        failure_rate_threshold: 0.5,
        failure_check_min_samples: 3,
        ..DriverConfig::default()
    };

    // When
    let summary = driver(api.clone(), config, CancellationToken::new())
        .run(&items(&key_refs(&keys)), &files.checkpoint, &files.output)
        .await
        .unwrap();

    // Then: stopped at the first check, nothing written downstream
    assert!(matches!(
        summary.outcome,
        RunOutcome::FailureRateExceeded { .. }
    ));
    assert_eq!(summary.exit_code(), 3);
    assert_eq!(api.calls(), 3);
    assert!(summary.output.is_none());
    assert!(!files.output.exists());
    assert_eq!(checkpoint_lines(&files.checkpoint).len(), 3);
    assert!(!summary.states.contains(&DriverState::Finalizing));
    assert_eq!(summary.states.last(), Some(&DriverState::Done));
}

#[tokio::test]
async fn test_failure_rate_checked_when_nothing_pending() {
    // Given: a checkpoint that is mostly errors and nothing left to fetch
    let dir = TempDir::new().unwrap();
    let files = RunFiles::in_dir(dir.path());
    write_checkpoint(
        &files.checkpoint,
        &[
            EnrichmentResult::error("/works/B1", 3),
            EnrichmentResult::error("/works/B2", 3),
            EnrichmentResult::ok("/works/B3", "desc3", 1),
        ],
    );

    let summary = default_driver(ScriptedApi::new())
        .run(
            &items(&["/works/B1", "/works/B2", "/works/B3"]),
            &files.checkpoint,
            &files.output,
        )
        .await
        .unwrap();

    assert!(matches!(
        summary.outcome,
        RunOutcome::FailureRateExceeded { .. }
    ));
    assert!(!files.output.exists());
}

#[tokio::test]
async fn test_rate_at_threshold_does_not_abort() {
    let dir = TempDir::new().unwrap();
    let files = RunFiles::in_dir(dir.path());
    let api = ScriptedApi::new();
    api.permanent("/works/B1");
    let config = DriverConfig {
        failure_rate_threshold: 0.5,
        failure_check_min_samples: 1,
        ..DriverConfig::default()
    };

    // B0 is fetched first, so the rate peaks at exactly 0.5
    let summary = driver(api, config, CancellationToken::new())
        .run(
            &items(&["/works/B0", "/works/B1"]),
            &files.checkpoint,
            &files.output,
        )
        .await
        .unwrap();

    assert_eq!(summary.counts.error, 1);
    assert_eq!(summary.outcome, RunOutcome::Degraded);
    assert!(files.output.exists());
}

// ============================================================================
// Candidates and ownership
// ============================================================================

#[tokio::test]
async fn test_pending_keys_fetched_in_ascending_order() {
    let dir = TempDir::new().unwrap();
    let files = RunFiles::in_dir(dir.path());
    let items = items(&["/works/B3", "/works/B1", "/works/B2"]);

    default_driver(ScriptedApi::new())
        .run(&items, &files.checkpoint, &files.output)
        .await
        .unwrap();

    let order: Vec<String> = checkpoint_lines(&files.checkpoint)
        .into_iter()
        .map(|e| e.key)
        .collect();
    assert_eq!(order, vec!["/works/B1", "/works/B2", "/works/B3"]);

    // Output keeps item order
    let joined: Vec<String> = table::read_joined(&files.output)
        .unwrap()
        .into_iter()
        .map(|r| r.key)
        .collect();
    assert_eq!(joined, vec!["/works/B3", "/works/B1", "/works/B2"]);
}

#[tokio::test]
async fn test_limit_restricts_candidates() {
    let dir = TempDir::new().unwrap();
    let files = RunFiles::in_dir(dir.path());
    let keys = keys(5);
    let api = ScriptedApi::new();
    let config = DriverConfig {
        limit: Some(2),
        ..DriverConfig::default()
    };

    let summary = driver(api.clone(), config, CancellationToken::new())
        .run(&items(&key_refs(&keys)), &files.checkpoint, &files.output)
        .await
        .unwrap();

    assert_eq!(api.calls(), 2);
    assert_eq!(summary.candidates, 2);
    assert_eq!(table::read_joined(&files.output).unwrap().len(), 2);
}

#[tokio::test]
async fn test_run_refused_while_checkpoint_locked() {
    let dir = TempDir::new().unwrap();
    let files = RunFiles::in_dir(dir.path());
    let (_held, _) = CheckpointStore::open(&files.checkpoint).unwrap();

    let api = ScriptedApi::new();
    let result = default_driver(api.clone())
        .run(&items(&["/works/B1"]), &files.checkpoint, &files.output)
        .await;

    assert!(matches!(result, Err(EnrichError::Locked(_))));
    assert_eq!(api.calls(), 0);
}

#[tokio::test]
async fn test_checkpoint_write_failure_aborts_without_output() {
    // Given: the checkpoint accepts one line, then the disk fills up
    let dir = TempDir::new().unwrap();
    let files = RunFiles::in_dir(dir.path());
    let api = ScriptedApi::new();
    let keys = keys(4);
    let items = items(&key_refs(&keys));

    // When
    let result = default_driver(api.clone())
        .run_with_store(&items, &files.output, || {
            CheckpointStore::open_with(&files.checkpoint, |file| FailingSink::boxed(file, 1))
        })
        .await;

    // Then: the run stops at B2 and no dataset exists
    match result {
        Err(EnrichError::CheckpointWrite { key, .. }) => assert_eq!(key, "/works/B2"),
        other => panic!("expected CheckpointWrite, got {:?}", other),
    }
    assert_eq!(api.calls(), 2);
    assert!(!files.output.exists());

    // B1 is committed, and the lock is released for the next run
    let lines = checkpoint_lines(&files.checkpoint);
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].key, "/works/B1");
    assert!(CheckpointStore::open(&files.checkpoint).is_ok());
}

#[tokio::test]
async fn test_corrupt_checkpoint_aborts_before_fetching() {
    let dir = TempDir::new().unwrap();
    let files = RunFiles::in_dir(dir.path());
    std::fs::write(&files.checkpoint, "not json\n").unwrap();

    let api = ScriptedApi::new();
    let result = default_driver(api.clone())
        .run(&items(&["/works/B1"]), &files.checkpoint, &files.output)
        .await;

    assert!(matches!(result, Err(EnrichError::Checkpoint(_))));
    assert_eq!(api.calls(), 0);
}

// ============================================================================
// Standalone join
// ============================================================================

#[test]
fn test_join_from_checkpoint_without_network() {
    let dir = TempDir::new().unwrap();
    let files = RunFiles::in_dir(dir.path());
    write_checkpoint(
        &files.checkpoint,
        &[
            EnrichmentResult::ok("/works/B1", "desc1", 1),
            EnrichmentResult::not_found("/works/B2", 1),
            EnrichmentResult::ok("/works/ZZ", "not an item", 1),
        ],
    );
    let items = items(&["/works/B1", "/works/B2", "/works/B3"]);

    let report = join_from_checkpoint(&items, &files.checkpoint, &files.output).unwrap();

    assert_eq!(report.rows, 3);
    assert_eq!(report.unattempted, 1);
    assert_eq!(report.counts.ok, 1);
    assert_eq!(descriptions(&files.output), vec!["desc1", "", ""]);
}
