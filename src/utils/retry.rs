//! Retry policy shared by discovery sources and the provider chain.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::{sleep, timeout};

use crate::sources::SourceError;

/// How the delay between attempts grows
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Backoff {
    /// Same delay before every retry
    Fixed,
    /// Delay multiplied by `multiplier` after every retry
    Exponential { multiplier: f64 },
}

/// Configuration for retry behavior
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    pub backoff: Backoff,
    /// Maximum time a single attempt may take
    pub attempt_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            backoff: Backoff::Exponential { multiplier: 2.0 },
            attempt_timeout: Duration::from_secs(120),
        }
    }
}

impl RetryConfig {
    /// Set maximum attempts
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Set the initial delay
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the backoff strategy
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// No delay between attempts
    pub fn immediate(mut self) -> Self {
        self.initial_delay = Duration::ZERO;
        self.max_delay = Duration::ZERO;
        self
    }

    /// Delay to wait after the given failed attempt (1-based) before the next one
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.initial_delay.min(self.max_delay),
            Backoff::Exponential { multiplier } => {
                let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
                let secs = self.initial_delay.as_secs_f64() * multiplier.max(1.0).powi(exponent);
                Duration::try_from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
                    .unwrap_or(self.max_delay)
            }
        }
    }
}

/// Transient errors that should trigger a retry
#[derive(Debug, Clone, PartialEq)]
pub enum TransientError {
    /// Network connectivity issues
    Network,
    /// Rate limit exceeded (with optional retry-after seconds)
    RateLimit(Option<u64>),
    /// Server error (5xx)
    ServerError,
    /// Request timeout
    Timeout,
}

impl TransientError {
    /// Check if a SourceError represents a transient error
    pub fn from_source_error(err: &SourceError) -> Option<Self> {
        match err {
            SourceError::RateLimit(retry_after) => Some(TransientError::RateLimit(*retry_after)),
            SourceError::Network(_) => Some(TransientError::Network),
            SourceError::Timeout(_) => Some(TransientError::Timeout),
            SourceError::Api { status, .. } if *status >= 500 => Some(TransientError::ServerError),
            _ => None,
        }
    }

    /// Minimum delay this kind of error asks for
    pub fn recommended_delay(&self) -> Duration {
        match self {
            TransientError::RateLimit(Some(seconds)) => Duration::from_secs(*seconds),
            TransientError::RateLimit(None) => Duration::from_secs(2),
            TransientError::Network | TransientError::ServerError | TransientError::Timeout => {
                Duration::ZERO
            }
        }
    }
}

/// Execute an async source operation, retrying transient failures.
///
/// Permanent errors (parse errors, 4xx responses, not found) return immediately.
pub async fn with_retry<T, F, Fut>(config: RetryConfig, mut operation: F) -> Result<T, SourceError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, SourceError>>,
{
    let mut attempts = 0;

    loop {
        attempts += 1;

        let error = match timeout(config.attempt_timeout, operation()).await {
            Ok(Ok(result)) => {
                if attempts > 1 {
                    tracing::debug!(attempts, "operation succeeded after transient failures");
                }
                return Ok(result);
            }
            Ok(Err(error)) => error,
            Err(_) => SourceError::Timeout(config.attempt_timeout),
        };

        let Some(transient) = TransientError::from_source_error(&error) else {
            return Err(error);
        };

        if attempts >= config.max_attempts {
            tracing::warn!(attempts, error = %error, "operation failed after retries");
            return Err(error);
        }

        let delay = config
            .delay_after(attempts)
            .max(transient.recommended_delay().min(config.max_delay));
        tracing::debug!(attempts, ?transient, ?delay, "transient error, retrying");
        sleep(delay).await;
    }
}

/// Retry configuration for public literature APIs
pub fn api_retry_config() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        initial_delay: Duration::from_millis(500),
        max_delay: Duration::from_secs(10),
        backoff: Backoff::Exponential { multiplier: 2.0 },
        attempt_timeout: Duration::from_secs(30),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig::default().max_attempts(max_attempts).immediate()
    }

    #[tokio::test]
    async fn test_retry_success_first_try() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = with_retry(fast_config(3), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, SourceError>("success")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "success");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_success_after_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = with_retry(fast_config(4), move || {
            let counter = counter.clone();
            async move {
                let count = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if count < 3 {
                    Err(SourceError::Network("temporary error".to_string()))
                } else {
                    Ok("success")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "success");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_returns_permanent_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<&str, SourceError> = with_retry(fast_config(5), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(SourceError::NotFound("not found".to_string()))
            }
        })
        .await;

        assert!(matches!(result, Err(SourceError::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_transient_error_detection() {
        assert!(TransientError::from_source_error(&SourceError::RateLimit(None)).is_some());
        assert!(
            TransientError::from_source_error(&SourceError::Network("refused".to_string()))
                .is_some()
        );
        assert!(TransientError::from_source_error(&SourceError::Api {
            status: 503,
            message: "unavailable".to_string()
        })
        .is_some());
        assert!(TransientError::from_source_error(&SourceError::Api {
            status: 404,
            message: "missing".to_string()
        })
        .is_none());
        assert!(
            TransientError::from_source_error(&SourceError::Parse("bad json".to_string()))
                .is_none()
        );
    }

    #[test]
    fn test_delay_schedules() {
        let fixed = RetryConfig::default()
            .initial_delay(Duration::from_millis(100))
            .backoff(Backoff::Fixed);
        assert_eq!(fixed.delay_after(1), Duration::from_millis(100));
        assert_eq!(fixed.delay_after(3), Duration::from_millis(100));

        let exponential = RetryConfig::default().initial_delay(Duration::from_millis(100));
        assert_eq!(exponential.delay_after(1), Duration::from_millis(100));
        assert_eq!(exponential.delay_after(2), Duration::from_millis(200));
        assert_eq!(exponential.delay_after(3), Duration::from_millis(400));
        assert_eq!(exponential.delay_after(20), Duration::from_secs(5));
    }

    #[test]
    fn test_late_attempts_stay_at_max_delay() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_after(100), config.max_delay);
        assert_eq!(config.delay_after(u32::MAX), config.max_delay);

        let steep = config.backoff(Backoff::Exponential { multiplier: 1e300 });
        assert_eq!(steep.delay_after(3), config.max_delay);
    }
}
