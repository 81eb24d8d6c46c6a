//! Cross-provider retry with local-model escalation.
//!
//! One logical call walks the state machine
//! `attempt(provider) -> success | retry | next provider | local fallback`:
//! each cloud provider gets up to `retry.max_attempts` tries (permanent errors
//! end its turn early), then the local model is tried exactly once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use super::{AgentRequest, MetricsRegistry, Provider, ProviderError, ProviderRegistry, ProviderResponse};
use crate::config::ProvidersConfig;
use crate::models::{AgentType, CallMetrics, CallResult};
use crate::utils::RetryConfig;

/// Turns a flaky multi-provider call into one [`CallResult`]
#[derive(Debug, Clone)]
pub struct FallbackChain {
    providers: Arc<ProviderRegistry>,
    retry: RetryConfig,
    metrics: Arc<MetricsRegistry>,
}

/// Bookkeeping for one logical call
struct CallState {
    started: Instant,
    attempts: u32,
    last_error: Option<String>,
}

impl FallbackChain {
    pub fn new(providers: Arc<ProviderRegistry>, retry: RetryConfig, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            providers,
            retry,
            metrics,
        }
    }

    /// Apply the `[providers]` config section (order, local fallback, retry policy) to `providers`
    pub fn from_config(
        providers: ProviderRegistry,
        config: &ProvidersConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self::new(
            Arc::new(providers.configure(config)),
            config.retry.to_retry_config(),
            metrics,
        )
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Run `request` for `agent` across `provider_order` (empty for the registry default).
    ///
    /// Never returns an error: every provider failure ends up in the result.
    pub async fn call(&self, agent: AgentType, provider_order: &[String], request: &AgentRequest) -> CallResult {
        let cloud = self.providers.resolve(provider_order);
        let mut state = CallState {
            started: Instant::now(),
            attempts: 0,
            last_error: None,
        };

        for provider in &cloud {
            for attempt in 1..=self.retry.max_attempts {
                if attempt > 1 {
                    let delay = self.retry.delay_after(attempt - 1);
                    if !delay.is_zero() {
                        sleep(delay).await;
                    }
                }

                match self.attempt(provider.as_ref(), request, &mut state).await {
                    Ok(response) => {
                        return self.succeed(agent, request, provider.id(), response, &state);
                    }
                    Err(error) => {
                        warn!(
                            agent = %agent,
                            provider = provider.id(),
                            attempt,
                            error = %error,
                            "provider attempt failed"
                        );
                        let transient = error.is_transient();
                        state.last_error = Some(error.to_string());
                        if !transient {
                            break;
                        }
                    }
                }
            }
        }

        let Some(local) = self.providers.local_fallback() else {
            let message = state
                .last_error
                .clone()
                .unwrap_or_else(|| "no providers configured".to_string());
            return self.fail(agent, request, None, message, &state);
        };

        // Without any cloud failure the local model is simply the primary provider
        let primary_failure = state.last_error.clone();
        if let Some(reason) = &primary_failure {
            info!(agent = %agent, provider = local.id(), reason = %reason, "escalating to local fallback");
        }

        match self.attempt(local.as_ref(), request, &mut state).await {
            Ok(response) => {
                let result = self.succeed(agent, request, local.id(), response, &state);
                match primary_failure {
                    Some(reason) => result.with_fallback(reason),
                    None => result,
                }
            }
            Err(error) => {
                warn!(agent = %agent, provider = local.id(), error = %error, "local fallback failed");
                let result = self.fail(agent, request, Some(local.id()), error.to_string(), &state);
                match primary_failure {
                    Some(reason) => result.with_fallback(reason),
                    None => result,
                }
            }
        }
    }

    /// One provider attempt under the per-attempt timeout, recorded in the metrics
    async fn attempt(
        &self,
        provider: &dyn Provider,
        request: &AgentRequest,
        state: &mut CallState,
    ) -> Result<ProviderResponse, ProviderError> {
        state.attempts += 1;
        let retry_metrics = self.metrics.retry();
        retry_metrics.record_attempt();
        if state.attempts > 1 {
            retry_metrics.record_retry();
        }

        debug!(provider = provider.id(), attempt = state.attempts, "calling provider");
        let started = Instant::now();
        let outcome = match timeout(self.retry.attempt_timeout, provider.complete(request)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ProviderError::Timeout(self.retry.attempt_timeout)),
        };

        let tokens = outcome.as_ref().map_or(0, |r| r.tokens_used);
        self.metrics
            .record_provider(provider.id(), started.elapsed(), outcome.is_ok(), tokens);
        outcome
    }

    fn succeed(
        &self,
        agent: AgentType,
        request: &AgentRequest,
        provider: &str,
        response: ProviderResponse,
        state: &CallState,
    ) -> CallResult {
        if state.attempts > 1 {
            self.metrics.retry().record_successful_retry();
        }

        let mut data: HashMap<String, serde_json::Value> = response.data;
        data.insert("content".to_string(), serde_json::Value::String(response.content));
        data.insert(
            "provider".to_string(),
            serde_json::Value::String(provider.to_string()),
        );

        let metrics = CallMetrics {
            duration_ms: state.started.elapsed().as_millis() as u64,
            tokens_used: response.tokens_used,
            cache_hit: response.cache_hit,
            provider: Some(provider.to_string()),
            attempts: state.attempts,
        };
        CallResult::success(request.task_id, agent, data, metrics)
    }

    fn fail(
        &self,
        agent: AgentType,
        request: &AgentRequest,
        provider: Option<&str>,
        message: String,
        state: &CallState,
    ) -> CallResult {
        self.metrics.retry().record_failed_operation();

        let metrics = CallMetrics {
            duration_ms: state.started.elapsed().as_millis() as u64,
            provider: provider.map(str::to_string),
            attempts: state.attempts,
            ..CallMetrics::default()
        };
        CallResult::failure(request.task_id, agent, message, metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::mock::ScriptedProvider;
    use crate::config::RetrySettings;

    fn chain(providers: Vec<ScriptedProvider>) -> (FallbackChain, Arc<MetricsRegistry>) {
        let mut registry = ProviderRegistry::new();
        for provider in providers {
            registry.register(Arc::new(provider));
        }
        let metrics = Arc::new(MetricsRegistry::new());
        let chain = FallbackChain::new(
            Arc::new(registry),
            RetryConfig::default().immediate(),
            metrics.clone(),
        );
        (chain, metrics)
    }

    fn request() -> AgentRequest {
        AgentRequest::new(AgentType::ContentSummarizer, "paper text")
    }

    #[tokio::test]
    async fn test_first_provider_success() {
        let (chain, metrics) = chain(vec![ScriptedProvider::succeeding("primary", "summary")]);

        let result = chain.call(AgentType::ContentSummarizer, &[], &request()).await;

        assert!(result.is_success());
        assert!(!result.used_fallback());
        assert_eq!(result.content(), Some("summary"));
        assert_eq!(result.metrics().attempts, 1);
        assert_eq!(result.metrics().provider.as_deref(), Some("primary"));
        assert_eq!(metrics.retry().retries(), 0);
        assert_eq!(metrics.provider("primary").api_calls, 1);
    }

    #[tokio::test]
    async fn test_retry_same_provider_then_succeed() {
        let flaky = ScriptedProvider::succeeding("primary", "ok")
            .with_script(vec![Err(ProviderError::Network("reset".into()))]);
        let (chain, metrics) = chain(vec![flaky]);

        let result = chain.call(AgentType::ContentSummarizer, &[], &request()).await;

        assert!(result.is_success());
        assert!(!result.used_fallback());
        assert_eq!(result.metrics().attempts, 2);
        assert_eq!(metrics.retry().retries(), 1);
        assert_eq!(metrics.retry().successful_retries(), 1);
        assert_eq!(metrics.provider("primary").success_count, 1);
    }

    #[tokio::test]
    async fn test_permanent_error_moves_to_next_provider() {
        let (chain, _) = chain(vec![
            ScriptedProvider::failing("primary", ProviderError::InvalidResponse("garbled".into())),
            ScriptedProvider::succeeding("secondary", "ok"),
        ]);

        let result = chain.call(AgentType::ContentSummarizer, &[], &request()).await;

        assert!(result.is_success());
        assert_eq!(result.metrics().attempts, 2);
        assert_eq!(result.metrics().provider.as_deref(), Some("secondary"));
    }

    #[tokio::test]
    async fn test_local_fallback_failure_keeps_primary_reason() {
        let (chain, metrics) = chain(vec![
            ScriptedProvider::failing("primary", ProviderError::Unavailable("down".into())),
            ScriptedProvider::failing("local", ProviderError::Unavailable("no model".into())).local(),
        ]);

        let result = chain.call(AgentType::ContentSummarizer, &[], &request()).await;

        assert!(!result.is_success());
        assert!(result.used_fallback());
        assert_eq!(result.primary_failure_reason(), Some("Provider unavailable: down"));
        assert_eq!(result.error_message(), Some("Provider unavailable: no model"));
        assert_eq!(result.metrics().attempts, 4);
        assert_eq!(metrics.retry().failed_operations(), 1);
    }

    #[tokio::test]
    async fn test_only_local_provider_is_not_a_fallback() {
        let (chain, _) = chain(vec![ScriptedProvider::succeeding("local", "ok").local()]);

        let result = chain.call(AgentType::ContentSummarizer, &[], &request()).await;

        assert!(result.is_success());
        assert!(!result.used_fallback());
        assert_eq!(result.primary_failure_reason(), None);
    }

    #[tokio::test]
    async fn test_no_providers() {
        let (chain, _) = chain(vec![]);
        let result = chain.call(AgentType::ContentSummarizer, &[], &request()).await;
        assert_eq!(result.error_message(), Some("no providers configured"));
    }

    #[tokio::test]
    async fn test_chain_from_providers_section() {
        let primary = Arc::new(ScriptedProvider::failing("primary", ProviderError::Network("reset".into())));
        let small = Arc::new(ScriptedProvider::succeeding("local-small", "small").local());
        let large = Arc::new(ScriptedProvider::succeeding("local-large", "large").local());
        let mut registry = ProviderRegistry::new();
        registry.register(primary.clone());
        registry.register(small.clone());
        registry.register(large.clone());

        let config = ProvidersConfig {
            local_fallback: Some("local-small".to_string()),
            retry: RetrySettings {
                max_attempts: 2,
                initial_delay_ms: 0,
                max_delay_ms: 0,
                ..RetrySettings::default()
            },
            ..ProvidersConfig::default()
        };
        let chain = FallbackChain::from_config(registry, &config, Arc::new(MetricsRegistry::new()));
        assert_eq!(chain.retry_config().max_attempts, 2);

        let result = chain.call(AgentType::ContentSummarizer, &[], &request()).await;

        assert!(result.used_fallback());
        assert_eq!(result.content(), Some("small"));
        assert_eq!(primary.calls(), 2);
        assert_eq!(large.calls(), 0);
    }

    #[tokio::test]
    async fn test_attempt_timeout_counts_as_failure() {
        let slow = ScriptedProvider::succeeding("primary", "late")
            .with_delay(std::time::Duration::from_millis(200));
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(slow));
        let retry = RetryConfig {
            attempt_timeout: std::time::Duration::from_millis(20),
            ..RetryConfig::default().immediate().max_attempts(1)
        };
        let chain = FallbackChain::new(Arc::new(registry), retry, Arc::new(MetricsRegistry::new()));

        let result = chain.call(AgentType::ContentSummarizer, &[], &request()).await;

        assert!(!result.is_success());
        assert!(result.error_message().unwrap().starts_with("Timed out"));
    }
}
