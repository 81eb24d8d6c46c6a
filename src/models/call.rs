//! Outcome of one logical agent call through the provider chain.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use super::pipeline::AgentType;

/// Timing, token and cache figures attached to a call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallMetrics {
    /// Wall time across every attempt, including backoff delays
    pub duration_ms: u64,
    pub tokens_used: u64,
    pub cache_hit: bool,
    /// Provider that produced the final answer (or the last one tried)
    pub provider: Option<String>,
    /// Provider attempts made, across all providers
    pub attempts: u32,
}

/// Success or failure of an agent call.
///
/// A failed call always carries an error message and a successful one never does;
/// the constructors are the only way to build one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallResult {
    task_id: Uuid,
    agent: AgentType,
    success: bool,
    error_message: Option<String>,
    result_data: HashMap<String, serde_json::Value>,
    metrics: CallMetrics,
    used_fallback: bool,
    primary_failure_reason: Option<String>,
}

impl CallResult {
    pub fn success(
        task_id: Uuid,
        agent: AgentType,
        result_data: HashMap<String, serde_json::Value>,
        metrics: CallMetrics,
    ) -> Self {
        Self {
            task_id,
            agent,
            success: true,
            error_message: None,
            result_data,
            metrics,
            used_fallback: false,
            primary_failure_reason: None,
        }
    }

    pub fn failure(
        task_id: Uuid,
        agent: AgentType,
        error_message: impl Into<String>,
        metrics: CallMetrics,
    ) -> Self {
        Self {
            task_id,
            agent,
            success: false,
            error_message: Some(error_message.into()),
            result_data: HashMap::new(),
            metrics,
            used_fallback: false,
            primary_failure_reason: None,
        }
    }

    /// Mark the result as produced (or attempted) by the local fallback after
    /// every cloud provider failed with `primary_failure_reason` last
    pub fn with_fallback(mut self, primary_failure_reason: impl Into<String>) -> Self {
        self.used_fallback = true;
        self.primary_failure_reason = Some(primary_failure_reason.into());
        self
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    pub fn agent(&self) -> AgentType {
        self.agent
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn result_data(&self) -> &HashMap<String, serde_json::Value> {
        &self.result_data
    }

    pub fn into_result_data(self) -> HashMap<String, serde_json::Value> {
        self.result_data
    }

    pub fn metrics(&self) -> &CallMetrics {
        &self.metrics
    }

    pub fn used_fallback(&self) -> bool {
        self.used_fallback
    }

    pub fn primary_failure_reason(&self) -> Option<&str> {
        self.primary_failure_reason.as_deref()
    }

    /// The `content` entry as text, when the provider produced one
    pub fn content(&self) -> Option<&str> {
        self.result_data.get("content").and_then(|v| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_and_error_are_exclusive() {
        let ok = CallResult::success(
            Uuid::new_v4(),
            AgentType::ContentSummarizer,
            HashMap::new(),
            CallMetrics::default(),
        );
        assert!(ok.is_success());
        assert!(ok.error_message().is_none());

        let failed = CallResult::failure(
            Uuid::new_v4(),
            AgentType::ContentSummarizer,
            "boom",
            CallMetrics::default(),
        );
        assert!(!failed.is_success());
        assert_eq!(failed.error_message(), Some("boom"));
    }

    #[test]
    fn test_with_fallback_records_reason() {
        let result = CallResult::success(
            Uuid::new_v4(),
            AgentType::PaperProcessor,
            HashMap::new(),
            CallMetrics::default(),
        )
        .with_fallback("rate limited");
        assert!(result.used_fallback());
        assert_eq!(result.primary_failure_reason(), Some("rate limited"));
    }
}
