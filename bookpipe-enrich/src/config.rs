//! Configuration for bookpipe-enrich
//!
//! `enrich.toml` layout:
//!
//! ```toml
//! [logging]
//! level = "info"
//!
//! [fetch]
//! base_url = "https://openlibrary.org"
//! max_attempts = 5
//! backoff_base_ms = 1000
//! backoff_cap_ms = 30000
//! requests_per_second = 5.0
//! request_timeout_secs = 20
//!
//! [run]
//! failure_rate_threshold = 0.5
//! failure_check_min_samples = 50
//! progress_interval = 50
//! retry_errors_on_resume = false
//!
//! [gate.items]
//! min_rows = 1000
//!
//! [gate.text]
//! min_description_len = 30
//! ```
//!
//! Every value is optional. Command-line/environment values override the
//! file, the file overrides compiled defaults.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use bookpipe_common::config::{load_toml_config, ConfigSource, LoggingConfig};
use bookpipe_common::quality::{ItemGateConfig, TextGateConfig};
use bookpipe_common::time::millis_to_duration;

use crate::error::{EnrichError, Result};
use crate::services::fetch_client::{FetchClient, OpenLibraryApi, OPEN_LIBRARY_BASE_URL};
use crate::services::throttle::Throttle;
use crate::utils::BackoffPolicy;
use crate::workflow::DriverConfig;

/// Environment variable naming the config file
pub const CONFIG_ENV_VAR: &str = "BOOKPIPE_CONFIG";
/// Config file name under `<config_dir>/bookpipe/`
pub const CONFIG_FILE_NAME: &str = "enrich.toml";

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 1000;
pub const DEFAULT_BACKOFF_CAP_MS: u64 = 30_000;
pub const DEFAULT_REQUESTS_PER_SECOND: f64 = 5.0;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 20;

/// Parsed `enrich.toml`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EnrichToml {
    pub logging: LoggingConfig,
    pub fetch: FetchSection,
    pub run: RunSection,
    pub gate: GateSection,
}

/// `[gate.items]` / `[gate.text]` quality gate thresholds
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GateSection {
    pub items: ItemGateConfig,
    pub text: TextGateConfig,
}

/// `[fetch]` section
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct FetchSection {
    pub base_url: Option<String>,
    pub max_attempts: Option<u32>,
    pub backoff_base_ms: Option<u64>,
    pub backoff_cap_ms: Option<u64>,
    pub requests_per_second: Option<f64>,
    pub request_timeout_secs: Option<u64>,
}

/// `[run]` section
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunSection {
    pub failure_rate_threshold: Option<f64>,
    pub failure_check_min_samples: Option<usize>,
    pub progress_interval: Option<usize>,
    pub retry_errors_on_resume: Option<bool>,
    pub limit: Option<usize>,
}

/// Values supplied on the command line or through the environment
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub fetch: FetchSection,
    pub run: RunSection,
}

/// Locate and parse the config file
pub fn load(explicit: Option<&Path>) -> Result<(EnrichToml, ConfigSource)> {
    load_toml_config(explicit, CONFIG_ENV_VAR, CONFIG_FILE_NAME)
        .map_err(|e| EnrichError::Config(e.to_string()))
}

/// Fully resolved settings for one run
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichSettings {
    pub base_url: String,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub requests_per_second: f64,
    pub request_timeout: Duration,
    pub driver: DriverConfig,
}

impl Default for EnrichSettings {
    fn default() -> Self {
        Self {
            base_url: OPEN_LIBRARY_BASE_URL.to_string(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: BackoffPolicy::new(
                millis_to_duration(DEFAULT_BACKOFF_BASE_MS),
                millis_to_duration(DEFAULT_BACKOFF_CAP_MS),
            ),
            requests_per_second: DEFAULT_REQUESTS_PER_SECOND,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            driver: DriverConfig::default(),
        }
    }
}

impl EnrichSettings {
    /// Merge overrides over the file over defaults, then validate
    pub fn resolve(file: &EnrichToml, overrides: &Overrides) -> Result<Self> {
        let defaults = Self::default();
        let fetch = (&overrides.fetch, &file.fetch);
        let run = (&overrides.run, &file.run);

        let base_url = fetch
            .0
            .base_url
            .clone()
            .or_else(|| fetch.1.base_url.clone())
            .unwrap_or(defaults.base_url);
        let max_attempts = fetch
            .0
            .max_attempts
            .or(fetch.1.max_attempts)
            .unwrap_or(defaults.max_attempts);
        let backoff_base_ms = fetch
            .0
            .backoff_base_ms
            .or(fetch.1.backoff_base_ms)
            .unwrap_or(DEFAULT_BACKOFF_BASE_MS);
        let backoff_cap_ms = fetch
            .0
            .backoff_cap_ms
            .or(fetch.1.backoff_cap_ms)
            .unwrap_or(DEFAULT_BACKOFF_CAP_MS);
        let requests_per_second = fetch
            .0
            .requests_per_second
            .or(fetch.1.requests_per_second)
            .unwrap_or(defaults.requests_per_second);
        let request_timeout_secs = fetch
            .0
            .request_timeout_secs
            .or(fetch.1.request_timeout_secs)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS);

        let driver = DriverConfig {
            failure_rate_threshold: run
                .0
                .failure_rate_threshold
                .or(run.1.failure_rate_threshold)
                .unwrap_or(defaults.driver.failure_rate_threshold),
            failure_check_min_samples: run
                .0
                .failure_check_min_samples
                .or(run.1.failure_check_min_samples)
                .unwrap_or(defaults.driver.failure_check_min_samples),
            progress_interval: run
                .0
                .progress_interval
                .or(run.1.progress_interval)
                .unwrap_or(defaults.driver.progress_interval),
            retry_errors_on_resume: run
                .0
                .retry_errors_on_resume
                .or(run.1.retry_errors_on_resume)
                .unwrap_or(defaults.driver.retry_errors_on_resume),
            limit: run.0.limit.or(run.1.limit),
        };

        let settings = Self {
            base_url,
            max_attempts,
            backoff: BackoffPolicy::new(
                millis_to_duration(backoff_base_ms),
                millis_to_duration(backoff_cap_ms),
            ),
            requests_per_second,
            request_timeout: Duration::from_secs(request_timeout_secs),
            driver,
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts < 1 {
            return Err(EnrichError::Config("max_attempts must be at least 1".into()));
        }
        if !(self.requests_per_second.is_finite() && self.requests_per_second > 0.0) {
            return Err(EnrichError::Config(format!(
                "requests_per_second must be positive, got {}",
                self.requests_per_second
            )));
        }
        self.throttle()?;
        let threshold = self.driver.failure_rate_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(EnrichError::Config(format!(
                "failure_rate_threshold must be within [0, 1], got {}",
                threshold
            )));
        }
        if self.backoff.base > self.backoff.cap {
            return Err(EnrichError::Config(format!(
                "backoff base {:?} exceeds cap {:?}",
                self.backoff.base, self.backoff.cap
            )));
        }
        if self.request_timeout.is_zero() {
            return Err(EnrichError::Config("request_timeout_secs must be positive".into()));
        }
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(EnrichError::Config(format!(
                "base_url must be an http(s) URL, got {}",
                self.base_url
            )));
        }
        Ok(())
    }

    fn throttle(&self) -> Result<Throttle> {
        Throttle::per_second(self.requests_per_second).map_err(|_| {
            EnrichError::Config(format!(
                "requests_per_second {} is too small to schedule",
                self.requests_per_second
            ))
        })
    }

    /// Fetch client against the configured Open Library endpoint
    pub fn build_client(&self) -> Result<FetchClient<OpenLibraryApi>> {
        let api = OpenLibraryApi::new(&self.base_url, self.request_timeout)?;
        Ok(FetchClient::new(
            api,
            self.throttle()?,
            self.backoff,
            self.max_attempts,
        ))
    }
}
