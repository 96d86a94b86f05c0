//! Utility modules for bookpipe-enrich

pub mod backoff;
pub mod run_lock;

pub use backoff::BackoffPolicy;
pub use run_lock::{LockError, RunLock};
