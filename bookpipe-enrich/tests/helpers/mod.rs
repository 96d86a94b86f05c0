//! Test Helper Utilities
//!
//! Shared utilities for testing bookpipe-enrich: a scripted description API
//! that counts calls, and table/checkpoint fixtures.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use bookpipe_common::{table, ItemRecord};
use bookpipe_enrich::models::EnrichmentResult;
use bookpipe_enrich::services::{CheckpointSink, DescriptionApi, FetchClient, FetchError, Throttle};
use bookpipe_enrich::utils::BackoffPolicy;
use bookpipe_enrich::workflow::{DriverConfig, EnrichmentDriver};

/// Description API replaying per-key scripts
///
/// Keys without a script (or whose script ran out) answer
/// `Ok("desc for <key>")`.
#[derive(Default)]
pub struct ScriptedApi {
    scripts: Mutex<HashMap<String, VecDeque<Result<String, FetchError>>>>,
    calls: AtomicUsize,
    calls_per_key: Mutex<HashMap<String, usize>>,
    cancel_after: Mutex<Option<(usize, CancellationToken)>>,
}

impl ScriptedApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue attempt outcomes for `key`
    pub fn script(&self, key: &str, outcomes: Vec<Result<String, FetchError>>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .extend(outcomes);
    }

    pub fn ok(&self, key: &str, description: &str) {
        self.script(key, vec![Ok(description.to_string())]);
    }

    pub fn not_found(&self, key: &str) {
        self.script(
            key,
            vec![Err(FetchError::NotFound {
                key: key.to_string(),
            })],
        );
    }

    pub fn permanent(&self, key: &str) {
        self.script(
            key,
            vec![Err(FetchError::Permanent {
                reason: "HTTP 400".to_string(),
            })],
        );
    }

    /// Simulate an operator interrupt during the `n`-th call
    pub fn cancel_during_call(&self, n: usize, token: CancellationToken) {
        *self.cancel_after.lock().unwrap() = Some((n, token));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, key: &str) -> usize {
        self.calls_per_key
            .lock()
            .unwrap()
            .get(key)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl DescriptionApi for ScriptedApi {
    async fn get_description(&self, key: &str) -> Result<String, FetchError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        *self
            .calls_per_key
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default() += 1;

        if let Some((at, token)) = self.cancel_after.lock().unwrap().as_ref() {
            if n == *at {
                token.cancel();
            }
        }

        self.scripts
            .lock()
            .unwrap()
            .get_mut(key)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Ok(format!("desc for {}", key)))
    }
}

/// Checkpoint sink that stops accepting lines after `good_appends`
pub struct FailingSink {
    file: File,
    good_appends: usize,
}

impl FailingSink {
    pub fn boxed(file: File, good_appends: usize) -> Box<dyn CheckpointSink> {
        Box::new(Self { file, good_appends })
    }
}

impl CheckpointSink for FailingSink {
    fn append_line(&mut self, line: &[u8]) -> std::io::Result<()> {
        if self.good_appends == 0 {
            return Err(std::io::Error::other("no space left on device"));
        }
        self.good_appends -= 1;
        self.file.append_line(line)
    }
}

/// Fetch client with no throttle and millisecond backoff
pub fn fast_client(api: Arc<ScriptedApi>, max_attempts: u32) -> FetchClient<Arc<ScriptedApi>> {
    FetchClient::new(
        api,
        Throttle::new(Duration::ZERO),
        BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(5)),
        max_attempts,
    )
}

pub fn driver(
    api: Arc<ScriptedApi>,
    config: DriverConfig,
    cancel: CancellationToken,
) -> EnrichmentDriver<Arc<ScriptedApi>> {
    EnrichmentDriver::new(fast_client(api, 3), config, cancel)
}

pub fn default_driver(api: Arc<ScriptedApi>) -> EnrichmentDriver<Arc<ScriptedApi>> {
    driver(api, DriverConfig::default(), CancellationToken::new())
}

/// Item Records with the given keys, titled by key
pub fn items(keys: &[&str]) -> Vec<ItemRecord> {
    keys.iter()
        .enumerate()
        .map(|(i, key)| ItemRecord {
            key: key.to_string(),
            title: Some(format!("Title {}", key)),
            author: Some("Anon".to_string()),
            first_publish_year: Some(1900 + i as i64),
            language: Some("eng".to_string()),
        })
        .collect()
}

/// Keys `/works/B1` .. `/works/B{n}`
pub fn keys(n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("/works/B{}", i)).collect()
}

pub fn key_refs(keys: &[String]) -> Vec<&str> {
    keys.iter().map(String::as_str).collect()
}

/// Paths used by one run inside a temp directory
pub struct RunFiles {
    pub checkpoint: PathBuf,
    pub output: PathBuf,
}

impl RunFiles {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            checkpoint: dir.join("checkpoint.jsonl"),
            output: dir.join("joined.parquet"),
        }
    }
}

/// Write checkpoint lines directly, bypassing the store
pub fn write_checkpoint(path: &Path, entries: &[EnrichmentResult]) {
    let mut text = String::new();
    for entry in entries {
        text.push_str(&serde_json::to_string(entry).unwrap());
        text.push('\n');
    }
    std::fs::write(path, text).unwrap();
}

pub fn checkpoint_lines(path: &Path) -> Vec<EnrichmentResult> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

pub fn write_item_table(path: &Path, items: &[ItemRecord]) {
    table::write_items(path, items).unwrap();
}
