//! Rate-limited description fetch client
//!
//! Two layers:
//! - [`DescriptionApi`]: one HTTP attempt for one key, classified into
//!   success / not found / transient / permanent. [`OpenLibraryApi`] is the
//!   real implementation; tests substitute scripted ones.
//! - [`FetchClient`]: one *logical* fetch. Applies the throttle before every
//!   attempt, retries transient failures with exponential backoff, and always
//!   returns an [`EnrichmentResult`], never an error, so one bad key cannot
//!   stop the run.

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::description::description_from_payload;
use super::throttle::Throttle;
use crate::error::EnrichError;
use crate::models::EnrichmentResult;
use crate::utils::BackoffPolicy;

pub const OPEN_LIBRARY_BASE_URL: &str = "https://openlibrary.org";
pub const USER_AGENT: &str = concat!("bookpipe-enrich/", env!("CARGO_PKG_VERSION"));

/// Item-level fetch failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// Timeout, connection failure, 5xx or 429; worth retrying
    #[error("transient failure: {reason}")]
    Transient {
        reason: String,
        retry_after: Option<Duration>,
    },

    /// The catalog has no such record (404/410); never retried
    #[error("not found: {key}")]
    NotFound { key: String },

    /// Any other client error or an undecodable payload; never retried
    #[error("non-retryable failure: {reason}")]
    Permanent { reason: String },

    /// Transient failures used up every attempt
    #[error("gave up on {key} after {attempts} attempts: {last}")]
    Exhausted {
        key: String,
        attempts: u32,
        last: String,
    },
}

impl FetchError {
    pub fn transient(reason: impl Into<String>) -> Self {
        FetchError::Transient {
            reason: reason.into(),
            retry_after: None,
        }
    }
}

/// One HTTP attempt against the description source
#[async_trait]
pub trait DescriptionApi: Send + Sync {
    /// Fetch the normalised description for `key`
    async fn get_description(&self, key: &str) -> Result<String, FetchError>;
}

#[async_trait]
impl<T: DescriptionApi + ?Sized> DescriptionApi for Arc<T> {
    async fn get_description(&self, key: &str) -> Result<String, FetchError> {
        (**self).get_description(key).await
    }
}

/// Classify a non-success HTTP status
pub fn classify_status(
    key: &str,
    status: StatusCode,
    retry_after: Option<Duration>,
) -> FetchError {
    if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
        FetchError::NotFound {
            key: key.to_string(),
        }
    } else if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        FetchError::Transient {
            reason: format!("HTTP {}", status.as_u16()),
            retry_after,
        }
    } else {
        FetchError::Permanent {
            reason: format!("HTTP {}", status.as_u16()),
        }
    }
}

fn classify_send_error(err: &reqwest::Error) -> FetchError {
    if err.is_builder() {
        FetchError::Permanent {
            reason: err.to_string(),
        }
    } else if err.is_timeout() {
        FetchError::transient(format!("timeout: {}", err))
    } else if err.is_connect() {
        FetchError::transient(format!("connection failed: {}", err))
    } else {
        FetchError::transient(err.to_string())
    }
}

/// Open Library works API (`GET {base}/works/OL…W.json`)
#[derive(Debug, Clone)]
pub struct OpenLibraryApi {
    http_client: reqwest::Client,
    base_url: String,
}

impl OpenLibraryApi {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, EnrichError> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| EnrichError::HttpClient(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Payload URL for a catalog key
    pub fn work_url(&self, key: &str) -> String {
        if key.starts_with('/') {
            format!("{}{}.json", self.base_url, key)
        } else {
            format!("{}/{}.json", self.base_url, key)
        }
    }
}

#[async_trait]
impl DescriptionApi for OpenLibraryApi {
    async fn get_description(&self, key: &str) -> Result<String, FetchError> {
        let url = self.work_url(key);
        tracing::trace!(key = %key, url = %url, "Requesting description");

        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| classify_send_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(classify_status(key, status, retry_after));
        }

        // Body read failures are network trouble; parse failures are not
        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::transient(format!("body read failed: {}", e)))?;
        let payload: Value = serde_json::from_slice(&body).map_err(|e| FetchError::Permanent {
            reason: format!("invalid JSON payload: {}", e),
        })?;

        Ok(description_from_payload(&payload))
    }
}

/// Logical fetch with throttle and bounded retry
#[derive(Debug)]
pub struct FetchClient<A> {
    api: A,
    throttle: Throttle,
    backoff: BackoffPolicy,
    max_attempts: u32,
}

impl<A: DescriptionApi> FetchClient<A> {
    pub fn new(api: A, throttle: Throttle, backoff: BackoffPolicy, max_attempts: u32) -> Self {
        Self {
            api,
            throttle,
            backoff,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Fetch one key's description
    ///
    /// **Algorithm:**
    /// 1. Wait for the throttle, then attempt
    /// 2. Success → `ok`
    /// 3. Not found → `not_found` immediately (no retry)
    /// 4. Permanent failure → `error` immediately (no retry)
    /// 5. Transient failure:
    ///    a. attempts < max_attempts: backoff, go to 1
    ///    b. attempts == max_attempts: `error`
    pub async fn fetch(&self, key: &str) -> EnrichmentResult {
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            self.throttle.wait().await;

            match self.api.get_description(key).await {
                Ok(description) => {
                    if attempt > 1 {
                        tracing::debug!(key = %key, attempt, "Fetch succeeded after retry");
                    }
                    return EnrichmentResult::ok(key, description, attempt);
                }
                Err(FetchError::NotFound { .. }) => {
                    tracing::debug!(key = %key, "Description source has no record");
                    return EnrichmentResult::not_found(key, attempt);
                }
                Err(FetchError::Transient {
                    reason,
                    retry_after,
                }) => {
                    if attempt >= self.max_attempts {
                        let exhausted = FetchError::Exhausted {
                            key: key.to_string(),
                            attempts: attempt,
                            last: reason,
                        };
                        tracing::warn!(key = %key, "{}", exhausted);
                        return EnrichmentResult::error(key, attempt);
                    }

                    let delay = self.backoff.delay_with_hint(attempt, retry_after);
                    tracing::warn!(
                        key = %key,
                        attempt,
                        max_attempts = self.max_attempts,
                        backoff_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "Transient fetch failure, will retry after backoff"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(other) => {
                    tracing::warn!(key = %key, attempt, error = %other, "Fetch failed permanently");
                    return EnrichmentResult::error(key, attempt);
                }
            }
        }
    }
}
