//! Per-source circuit breakers for discovery calls.
//!
//! A breaker has three states:
//!
//! - **Closed**: normal operation, calls pass through
//! - **Open**: the source kept failing, calls are rejected without being made
//! - **Half-Open**: the open period elapsed, a single trial call is let through
//!   and other callers are rejected until it reports back
//!
//! # Usage
//!
//! ```rust
//! use paperflow::utils::{CircuitBreaker, CircuitState};
//!
//! let breaker = CircuitBreaker::new("semantic_scholar", 5, std::time::Duration::from_secs(60));
//! assert_eq!(breaker.state(), CircuitState::Closed);
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerState {
    consecutive_failures: usize,
    opened_at: Option<Instant>,
    /// When the current half-open trial call was let through
    trial_started: Option<Instant>,
}

/// Thread-safe circuit breaker
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: usize,
    open_duration: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a breaker that opens after `failure_threshold` consecutive failures
    /// and probes again after `open_duration`
    pub fn new(name: &str, failure_threshold: usize, open_duration: Duration) -> Self {
        Self {
            name: name.to_string(),
            failure_threshold: failure_threshold.max(1),
            open_duration,
            state: Mutex::new(BreakerState {
                consecutive_failures: 0,
                opened_at: None,
                trial_started: None,
            }),
        }
    }

    /// Create with default settings (5 failures, 60 s)
    pub fn default_for(name: &str) -> Self {
        Self::new(name, 5, Duration::from_secs(60))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.state_of(&state)
    }

    fn state_of(&self, state: &BreakerState) -> CircuitState {
        match state.opened_at {
            None => CircuitState::Closed,
            Some(opened) if opened.elapsed() >= self.open_duration => CircuitState::HalfOpen,
            Some(_) => CircuitState::Open,
        }
    }

    /// Check if a call should be made.
    ///
    /// While half-open only the first caller gets `true`; the caller must then
    /// report the outcome. A trial that never reports back expires after the
    /// open duration.
    pub fn can_request(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match self.state_of(&state) {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                let trial_pending = state
                    .trial_started
                    .is_some_and(|started| started.elapsed() < self.open_duration);
                if trial_pending {
                    false
                } else {
                    state.trial_started = Some(Instant::now());
                    true
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.opened_at.take().is_some() {
            tracing::info!(source = %self.name, "circuit closed (recovered)");
        }
        state.trial_started = None;
        state.consecutive_failures = 0;
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.consecutive_failures += 1;
        state.trial_started = None;

        let half_open = state
            .opened_at
            .is_some_and(|opened| opened.elapsed() >= self.open_duration);

        if half_open || (state.opened_at.is_none() && state.consecutive_failures >= self.failure_threshold) {
            state.opened_at = Some(Instant::now());
            tracing::warn!(
                source = %self.name,
                failures = state.consecutive_failures,
                "circuit opened"
            );
        }
    }

    /// Run `operation` unless the circuit is open, recording its outcome.
    ///
    /// Returns `None` when the call was rejected.
    pub async fn execute<F, T, E>(&self, operation: F) -> Option<Result<T, E>>
    where
        F: std::future::Future<Output = Result<T, E>>,
    {
        if !self.can_request() {
            return None;
        }

        let result = operation.await;
        match &result {
            Ok(_) => self.record_success(),
            Err(_) => self.record_failure(),
        }
        Some(result)
    }

    /// Reset the circuit breaker to closed state
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.consecutive_failures = 0;
        state.opened_at = None;
        state.trial_started = None;
    }
}

/// One circuit breaker per source id, created on first use
#[derive(Debug)]
pub struct CircuitBreakerManager {
    failure_threshold: usize,
    open_duration: Duration,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl Default for CircuitBreakerManager {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(60))
    }
}

impl CircuitBreakerManager {
    pub fn new(failure_threshold: usize, open_duration: Duration) -> Self {
        Self {
            failure_threshold,
            open_duration,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Get or create the breaker for a source
    pub fn get(&self, source_id: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(breakers.entry(source_id.to_string()).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(
                source_id,
                self.failure_threshold,
                self.open_duration,
            ))
        }))
    }

    pub fn reset_all(&self) {
        let breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        for breaker in breakers.values() {
            breaker.reset();
        }
    }

    /// (source id, state) for every breaker created so far
    pub fn status(&self) -> Vec<(String, CircuitState)> {
        let breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut status: Vec<_> = breakers
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.state()))
            .collect();
        status.sort_by(|a, b| a.0.cmp(&b.0));
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_by_default() {
        let breaker = CircuitBreaker::default_for("test");
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.can_request());
    }

    #[test]
    fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::new("test", 3, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_request());
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let breaker = CircuitBreaker::new("test", 2, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_after_open_duration() {
        let breaker = CircuitBreaker::new("test", 1, Duration::ZERO);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_lets_one_trial_through() {
        let breaker = CircuitBreaker::new("test", 1, Duration::from_millis(200));
        breaker.record_failure();
        assert!(!breaker.can_request());

        std::thread::sleep(Duration::from_millis(250));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.can_request());
        assert!(!breaker.can_request());

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.can_request());
        assert!(breaker.can_request());
    }

    #[test]
    fn test_failed_trial_reopens() {
        let breaker = CircuitBreaker::new("test", 3, Duration::from_millis(200));
        for _ in 0..3 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(250));
        assert!(breaker.can_request());

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_request());
    }

    #[test]
    fn test_execute_rejected_when_open() {
        let breaker = CircuitBreaker::new("test", 1, Duration::from_secs(60));
        let first = tokio_test::block_on(breaker.execute(async { Err::<i32, &str>("down") }));
        assert_eq!(first, Some(Err("down")));

        let second = tokio_test::block_on(breaker.execute(async { Ok::<i32, &str>(42) }));
        assert!(second.is_none());
    }

    #[test]
    fn test_manager_reuses_breakers() {
        let manager = CircuitBreakerManager::default();
        let first = manager.get("crossref");
        let again = manager.get("crossref");
        let other = manager.get("openalex");

        assert!(Arc::ptr_eq(&first, &again));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(manager.status().len(), 2);
    }
}
