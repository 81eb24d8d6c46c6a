//! Per-agent, per-provider and retry counters.
//!
//! A [`MetricsRegistry`] is owned by whoever builds the pipeline and shared with
//! `Arc`; nothing here is process-global. Counters only grow until one of the
//! `reset_*` methods is called.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::models::AgentType;

/// `numerator / denominator`, or 0.0 when nothing was counted
fn rate(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Execution counters for one agent type
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub execution_count: u64,
    pub success_count: u64,
    pub total_duration_ms: u64,
    /// `None` until the first execution
    pub min_duration_ms: Option<u64>,
    pub max_duration_ms: u64,
}

impl AgentMetrics {
    pub fn record(&mut self, duration: Duration, success: bool) {
        let ms = duration.as_millis() as u64;
        self.execution_count += 1;
        if success {
            self.success_count += 1;
        }
        self.total_duration_ms += ms;
        self.min_duration_ms = Some(self.min_duration_ms.map_or(ms, |min| min.min(ms)));
        self.max_duration_ms = self.max_duration_ms.max(ms);
    }

    pub fn success_rate(&self) -> f64 {
        rate(self.success_count, self.execution_count)
    }

    pub fn average_duration_ms(&self) -> f64 {
        if self.execution_count == 0 {
            0.0
        } else {
            self.total_duration_ms as f64 / self.execution_count as f64
        }
    }
}

/// API call counters for one provider
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderMetrics {
    pub api_calls: u64,
    pub success_count: u64,
    pub tokens_used: u64,
    pub total_response_ms: u64,
    pub min_response_ms: Option<u64>,
    pub max_response_ms: u64,
}

impl ProviderMetrics {
    pub fn record(&mut self, response_time: Duration, success: bool, tokens: u64) {
        let ms = response_time.as_millis() as u64;
        self.api_calls += 1;
        if success {
            self.success_count += 1;
        }
        self.tokens_used += tokens;
        self.total_response_ms += ms;
        self.min_response_ms = Some(self.min_response_ms.map_or(ms, |min| min.min(ms)));
        self.max_response_ms = self.max_response_ms.max(ms);
    }

    pub fn success_rate(&self) -> f64 {
        rate(self.success_count, self.api_calls)
    }
}

/// Retry counters across every logical provider call
#[derive(Debug, Default)]
pub struct RetryMetrics {
    attempts: AtomicU64,
    retries: AtomicU64,
    successful_retries: AtomicU64,
    failed_operations: AtomicU64,
}

impl RetryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Any provider attempt
    pub fn record_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// An attempt that followed a failed one within the same call
    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// A call that succeeded after at least one retry
    pub fn record_successful_retry(&self) {
        self.successful_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// A call that failed on every provider, fallback included
    pub fn record_failed_operation(&self) {
        self.failed_operations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    pub fn successful_retries(&self) -> u64 {
        self.successful_retries.load(Ordering::Relaxed)
    }

    pub fn failed_operations(&self) -> u64 {
        self.failed_operations.load(Ordering::Relaxed)
    }

    /// Share of retried calls that eventually succeeded
    pub fn retry_success_rate(&self) -> f64 {
        let succeeded = self.successful_retries();
        rate(succeeded, succeeded + self.failed_operations())
    }

    pub fn snapshot(&self) -> RetryMetricsSnapshot {
        RetryMetricsSnapshot {
            attempts: self.attempts(),
            retries: self.retries(),
            successful_retries: self.successful_retries(),
            failed_operations: self.failed_operations(),
            retry_success_rate: self.retry_success_rate(),
        }
    }

    pub fn reset(&self) {
        self.attempts.store(0, Ordering::Relaxed);
        self.retries.store(0, Ordering::Relaxed);
        self.successful_retries.store(0, Ordering::Relaxed);
        self.failed_operations.store(0, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryMetricsSnapshot {
    pub attempts: u64,
    pub retries: u64,
    pub successful_retries: u64,
    pub failed_operations: u64,
    pub retry_success_rate: f64,
}

/// Rollup over every tracked agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub total_executions: u64,
    pub total_successes: u64,
    pub overall_success_rate: f64,
    pub uptime_secs: u64,
    pub agents_tracked: usize,
    pub providers_tracked: usize,
}

/// Point-in-time copy of every counter, for dashboards and run reports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub agents: BTreeMap<AgentType, AgentMetrics>,
    pub providers: BTreeMap<String, ProviderMetrics>,
    pub retry: RetryMetricsSnapshot,
    pub system: SystemMetrics,
    pub taken_at: DateTime<Utc>,
}

/// Owner of all metric counters
#[derive(Debug)]
pub struct MetricsRegistry {
    agents: Mutex<HashMap<AgentType, AgentMetrics>>,
    providers: Mutex<HashMap<String, ProviderMetrics>>,
    retry: RetryMetrics,
    started: Instant,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            agents: Mutex::new(HashMap::new()),
            providers: Mutex::new(HashMap::new()),
            retry: RetryMetrics::new(),
            started: Instant::now(),
        }
    }

    pub fn record_agent(&self, agent: AgentType, duration: Duration, success: bool) {
        self.agents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(agent)
            .or_default()
            .record(duration, success);
    }

    pub fn record_provider(&self, provider: &str, response_time: Duration, success: bool, tokens: u64) {
        self.providers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(provider.to_string())
            .or_default()
            .record(response_time, success, tokens);
    }

    pub fn agent(&self, agent: AgentType) -> AgentMetrics {
        self.agents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&agent)
            .cloned()
            .unwrap_or_default()
    }

    pub fn provider(&self, provider: &str) -> ProviderMetrics {
        self.providers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(provider)
            .cloned()
            .unwrap_or_default()
    }

    pub fn retry(&self) -> &RetryMetrics {
        &self.retry
    }

    pub fn system(&self) -> SystemMetrics {
        let agents = self.agents.lock().unwrap_or_else(PoisonError::into_inner);
        let total_executions = agents.values().map(|m| m.execution_count).sum();
        let total_successes = agents.values().map(|m| m.success_count).sum();
        let agents_tracked = agents.len();
        drop(agents);

        SystemMetrics {
            total_executions,
            total_successes,
            overall_success_rate: rate(total_successes, total_executions),
            uptime_secs: self.started.elapsed().as_secs(),
            agents_tracked,
            providers_tracked: self
                .providers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let agents = self
            .agents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(agent, metrics)| (*agent, metrics.clone()))
            .collect();
        let providers = self
            .providers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, metrics)| (id.clone(), metrics.clone()))
            .collect();

        MetricsSnapshot {
            agents,
            providers,
            retry: self.retry.snapshot(),
            system: self.system(),
            taken_at: Utc::now(),
        }
    }

    pub fn reset_agents(&self) {
        self.agents.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn reset_providers(&self) {
        self.providers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn reset_retry(&self) {
        self.retry.reset();
    }

    pub fn reset_all(&self) {
        self.reset_agents();
        self.reset_providers();
        self.reset_retry();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rates_are_zero_without_data() {
        let registry = MetricsRegistry::new();
        assert_eq!(registry.agent(AgentType::QualityChecker).success_rate(), 0.0);
        assert_eq!(registry.agent(AgentType::QualityChecker).average_duration_ms(), 0.0);
        assert_eq!(registry.provider("none").success_rate(), 0.0);
        assert_eq!(registry.retry().retry_success_rate(), 0.0);
        assert_eq!(registry.system().overall_success_rate, 0.0);
    }

    #[test]
    fn test_agent_metrics_bounds() {
        let registry = MetricsRegistry::new();
        registry.record_agent(AgentType::ContentSummarizer, Duration::from_millis(40), true);
        registry.record_agent(AgentType::ContentSummarizer, Duration::from_millis(10), false);
        registry.record_agent(AgentType::ContentSummarizer, Duration::from_millis(25), true);

        let metrics = registry.agent(AgentType::ContentSummarizer);
        assert_eq!(metrics.execution_count, 3);
        assert_eq!(metrics.success_count, 2);
        assert_eq!(metrics.min_duration_ms, Some(10));
        assert_eq!(metrics.max_duration_ms, 40);
        assert_eq!(metrics.total_duration_ms, 75);
        assert!((metrics.success_rate() - 2.0 / 3.0).abs() < 1e-9);

        let system = registry.system();
        assert_eq!(system.total_executions, 3);
        assert_eq!(system.agents_tracked, 1);
    }

    #[test]
    fn test_provider_metrics() {
        let registry = MetricsRegistry::new();
        registry.record_provider("primary", Duration::from_millis(5), false, 0);
        registry.record_provider("primary", Duration::from_millis(15), true, 120);

        let metrics = registry.provider("primary");
        assert_eq!(metrics.api_calls, 2);
        assert_eq!(metrics.success_count, 1);
        assert_eq!(metrics.tokens_used, 120);
        assert_eq!(metrics.min_response_ms, Some(5));
        assert_eq!(metrics.max_response_ms, 15);
    }

    #[test]
    fn test_retry_metrics_reset() {
        let retry = RetryMetrics::new();
        for _ in 0..4 {
            retry.record_attempt();
        }
        retry.record_retry();
        retry.record_retry();
        retry.record_successful_retry();
        retry.record_failed_operation();

        let before = retry.snapshot();
        assert_eq!(before.attempts, 4);
        assert_eq!(before.retries, 2);
        assert_eq!(before.retry_success_rate, 0.5);

        retry.reset();
        assert_eq!(retry.snapshot(), RetryMetricsSnapshot::default());

        // Resetting twice is harmless
        retry.reset();
        assert_eq!(retry.attempts(), 0);
    }

    #[test]
    fn test_snapshot_serializes_and_reset_all() {
        let registry = MetricsRegistry::new();
        registry.record_agent(AgentType::PaperProcessor, Duration::from_millis(3), true);
        registry.record_provider("local", Duration::from_millis(3), true, 10);
        registry.retry().record_attempt();

        let snapshot = registry.snapshot();
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["agents"]["PAPER_PROCESSOR"]["execution_count"], 1);
        assert_eq!(json["providers"]["local"]["tokens_used"], 10);
        assert_eq!(json["retry"]["attempts"], 1);

        registry.reset_all();
        let snapshot = registry.snapshot();
        assert!(snapshot.agents.is_empty());
        assert!(snapshot.providers.is_empty());
        assert_eq!(snapshot.retry.attempts, 0);
    }
}
