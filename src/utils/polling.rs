/// Polling utilities for waiting on conditions with backoff and a deadline
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::robot::error::{Result, RobotError};

/// Configuration for polling operations
#[derive(Debug, Clone)]
pub struct PollingConfig {
    pub timeout: Duration,
    pub interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
    pub max_attempts: Option<u32>,
    pub description: String,
}

impl PollingConfig {
    /// Create a new polling configuration with a fixed interval
    pub fn from_durations(
        timeout: Duration,
        interval: Duration,
        description: impl Into<String>,
    ) -> Self {
        Self {
            timeout,
            interval,
            max_interval: interval,
            multiplier: 1.0,
            max_attempts: None,
            description: description.into(),
        }
    }

    /// Grow the interval by `multiplier` after every attempt, up to `max_interval`
    pub fn with_backoff(mut self, multiplier: f64, max_interval: Duration) -> Self {
        self.multiplier = multiplier.max(1.0);
        self.max_interval = max_interval.max(self.interval);
        self
    }

    /// Give up after this many evaluations of the condition
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    fn next_interval(&self, current: Duration) -> Duration {
        current.mul_f64(self.multiplier).min(self.max_interval)
    }

    /// Poll until condition is met, the deadline passes or attempts run out
    ///
    /// The condition function should return:
    /// - Ok(Some(T)) when condition is met (returns T)
    /// - Ok(None) when condition is not yet met (continues polling)
    /// - Err(e) when an error occurs (stops polling and returns error)
    pub async fn poll<F, Fut, T>(&self, mut condition: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        info!("{}...", self.description);

        let start = Instant::now();
        let mut interval = self.interval;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            if let Some(value) = condition().await? {
                info!("✓ {}", self.description);
                return Ok(value);
            }

            if self.max_attempts.is_some_and(|max| attempt >= max) {
                return Err(RobotError::Timeout {
                    secs: start.elapsed().as_secs(),
                    what: format!("{} (gave up after {} attempts)", self.description, attempt),
                });
            }

            let elapsed = start.elapsed();
            if elapsed >= self.timeout {
                return Err(RobotError::Timeout {
                    secs: self.timeout.as_secs(),
                    what: self.description.clone(),
                });
            }

            let remaining = self.timeout - elapsed;
            let wait = interval.min(remaining);
            debug!(attempt, wait_ms = wait.as_millis() as u64, "{}: not yet", self.description);
            tokio::time::sleep(wait).await;
            interval = self.next_interval(interval);
        }
    }

    /// Poll until condition returns Ok(true)
    ///
    /// Simplified version for boolean conditions
    pub async fn poll_until<F, Fut>(&self, mut condition: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        self.poll(|| {
            let fut = condition();
            async move { Ok(fut.await?.then_some(())) }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(description: &str) -> PollingConfig {
        PollingConfig::from_durations(
            Duration::from_secs(5),
            Duration::from_millis(5),
            description,
        )
    }

    #[tokio::test]
    async fn test_polling_success() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = fast("test polling")
            .poll(|| {
                let c = counter_clone.clone();
                async move {
                    let val = c.fetch_add(1, Ordering::SeqCst);
                    if val >= 2 {
                        Ok(Some(val))
                    } else {
                        Ok(None)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_polling_timeout() {
        let config = PollingConfig::from_durations(
            Duration::from_millis(50),
            Duration::from_millis(10),
            "test timeout",
        );

        let result = config.poll(|| async { Ok::<Option<()>, _>(None) }).await;

        assert!(matches!(result, Err(RobotError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_polling_stops_after_max_attempts() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = fast("bounded")
            .with_max_attempts(3)
            .poll_until(|| {
                let c = counter_clone.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(false)
                }
            })
            .await;

        let err = result.unwrap_err();
        assert!(err.to_string().contains("3 attempts"));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_condition_error_stops_polling() {
        let result = fast("failing")
            .poll_until(|| async { Err(RobotError::NotFound("gone".into())) })
            .await;

        assert!(result.unwrap_err().is_not_found());
    }

    #[test]
    fn test_backoff_interval_is_capped() {
        let config = PollingConfig::from_durations(
            Duration::from_secs(60),
            Duration::from_secs(1),
            "backoff",
        )
        .with_backoff(2.0, Duration::from_secs(5));

        let mut interval = config.interval;
        let mut seen = Vec::new();
        for _ in 0..5 {
            interval = config.next_interval(interval);
            seen.push(interval.as_secs());
        }
        assert_eq!(seen, vec![2, 4, 5, 5, 5]);
    }
}
