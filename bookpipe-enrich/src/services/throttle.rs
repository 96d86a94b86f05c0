//! Minimum-interval request throttle
//!
//! Every HTTP attempt, including retries, calls [`Throttle::wait`] first, so
//! the request rate seen by the catalog API never exceeds the configured
//! limit no matter how many retries a single key consumes.

use std::time::{Duration, TryFromFloatSecsError};
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Throttle enforcing a minimum spacing between request starts
#[derive(Debug)]
pub struct Throttle {
    last_request: Mutex<Option<Instant>>,
    min_interval: Duration,
}

impl Throttle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            last_request: Mutex::new(None),
            min_interval,
        }
    }

    /// Throttle admitting at most `requests_per_second`
    ///
    /// Fails when the rate is not positive or its interval overflows a
    /// `Duration`.
    pub fn per_second(requests_per_second: f64) -> Result<Self, TryFromFloatSecsError> {
        Duration::try_from_secs_f64(1.0 / requests_per_second).map(Self::new)
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Wait if necessary to comply with the rate limit
    pub async fn wait(&self) {
        let mut last = self.last_request.lock().await;

        if let Some(last_time) = *last {
            let elapsed = last_time.elapsed();
            if elapsed < self.min_interval {
                let wait_time = self.min_interval - elapsed;
                tracing::trace!("Rate limiting: waiting {:?}", wait_time);
                tokio::time::sleep(wait_time).await;
            }
        }

        *last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_second_interval() {
        assert_eq!(
            Throttle::per_second(5.0).unwrap().min_interval(),
            Duration::from_millis(200)
        );
        assert_eq!(
            Throttle::per_second(0.5).unwrap().min_interval(),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn test_per_second_rejects_unrepresentable_rates() {
        assert!(Throttle::per_second(1e-20).is_err());
        assert!(Throttle::per_second(0.0).is_err());
        assert!(Throttle::per_second(-2.0).is_err());
    }

    #[tokio::test]
    async fn test_throttle_timing() {
        let throttle = Throttle::new(Duration::from_millis(100));

        let start = Instant::now();

        // First request - no wait
        throttle.wait().await;
        let first_elapsed = start.elapsed();

        throttle.wait().await;
        let second_elapsed = start.elapsed();

        throttle.wait().await;
        let third_elapsed = start.elapsed();

        assert!(first_elapsed < Duration::from_millis(50));
        assert!(second_elapsed >= Duration::from_millis(100));
        assert!(third_elapsed >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_no_wait_after_idle_gap() {
        let throttle = Throttle::new(Duration::from_millis(50));
        throttle.wait().await;
        tokio::time::sleep(Duration::from_millis(80)).await;

        let before = Instant::now();
        throttle.wait().await;
        assert!(before.elapsed() < Duration::from_millis(30));
    }
}
