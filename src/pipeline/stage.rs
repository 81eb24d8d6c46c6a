//! Execution of a single stage: handler lookup, per-attempt timeout and stage-level retries.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::agents::{AgentRequest, FallbackChain, MetricsRegistry};
use crate::discovery::DiscoveryAggregator;
use crate::models::{DiscoveryConfiguration, DocumentContext, StageDefinition, StageResult, StageType};

/// Why one stage attempt failed
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StageError {
    #[error("Agent call failed: {0}")]
    AgentFailed(String),

    #[error("Stage timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Handler(String),
}

/// What a stage sees when it starts
#[derive(Debug, Clone)]
pub struct StageInput {
    pub document: Arc<DocumentContext>,
    /// Results of the stage's prerequisites, in prerequisite order
    pub prerequisite_results: Vec<StageResult>,
}

impl StageInput {
    pub fn new(document: Arc<DocumentContext>) -> Self {
        Self {
            document,
            prerequisite_results: Vec::new(),
        }
    }

    pub fn with_prerequisites(mut self, results: Vec<StageResult>) -> Self {
        self.prerequisite_results = results;
        self
    }
}

/// Data and metrics produced by one successful attempt
#[derive(Debug, Clone, Default)]
pub struct StageOutput {
    pub data: HashMap<String, Value>,
    pub metrics: HashMap<String, f64>,
}

/// The work behind a stage
#[async_trait]
pub trait StageHandler: Send + Sync + Debug {
    async fn run(&self, definition: &StageDefinition, input: &StageInput) -> Result<StageOutput, StageError>;
}

/// Runs the stage's bound agent through the provider fallback chain
#[derive(Debug, Clone)]
pub struct AgentStageHandler {
    chain: Arc<FallbackChain>,
    provider_order: Vec<String>,
}

impl AgentStageHandler {
    pub fn new(chain: Arc<FallbackChain>) -> Self {
        Self {
            chain,
            provider_order: Vec::new(),
        }
    }

    /// Cloud providers to try, in order; empty uses the registry default
    pub fn with_provider_order(mut self, order: Vec<String>) -> Self {
        self.provider_order = order;
        self
    }

    fn request(definition: &StageDefinition, input: &StageInput) -> AgentRequest {
        let document = &input.document;
        let text = if document.text.is_empty() {
            let mut text = document.title.clone();
            if let Some(summary) = &document.r#abstract {
                text.push_str("\n\n");
                text.push_str(summary);
            }
            text
        } else {
            document.text.clone()
        };

        let prerequisites: serde_json::Map<String, Value> = input
            .prerequisite_results
            .iter()
            .filter(|r| !r.skipped)
            .map(|r| {
                let output = r
                    .result_data
                    .get("content")
                    .cloned()
                    .unwrap_or_else(|| Value::Object(r.result_data.clone().into_iter().collect()));
                (r.stage.id().to_string(), output)
            })
            .collect();

        let mut request = AgentRequest::new(definition.agent, text)
            .with_context("document_id", Value::String(document.document_id.clone()))
            .with_context("title", Value::String(document.title.clone()))
            .with_context("stage", Value::String(definition.stage.id().to_string()));
        if let Some(doi) = &document.doi {
            request = request.with_context("doi", Value::String(doi.clone()));
        }
        if !prerequisites.is_empty() {
            request = request.with_context("prerequisites", Value::Object(prerequisites));
        }
        request
    }
}

#[async_trait]
impl StageHandler for AgentStageHandler {
    async fn run(&self, definition: &StageDefinition, input: &StageInput) -> Result<StageOutput, StageError> {
        let request = Self::request(definition, input);
        let result = self
            .chain
            .call(definition.agent, &self.provider_order, &request)
            .await;

        if !result.is_success() {
            let message = result.error_message().unwrap_or("agent call failed").to_string();
            return Err(StageError::AgentFailed(message));
        }

        let call_metrics = result.metrics().clone();
        let used_fallback = result.used_fallback();
        let primary_failure = result.primary_failure_reason().map(str::to_string);

        let mut data = result.into_result_data();
        if used_fallback {
            data.insert("used_fallback".to_string(), Value::Bool(true));
            if let Some(reason) = primary_failure {
                data.insert("primary_failure_reason".to_string(), Value::String(reason));
            }
        }

        let mut metrics = HashMap::new();
        metrics.insert("tokens_used".to_string(), call_metrics.tokens_used as f64);
        metrics.insert("provider_attempts".to_string(), f64::from(call_metrics.attempts));
        metrics.insert("call_duration_ms".to_string(), call_metrics.duration_ms as f64);
        metrics.insert("used_fallback".to_string(), if used_fallback { 1.0 } else { 0.0 });

        Ok(StageOutput { data, metrics })
    }
}

/// Runs related paper discovery for the document
#[derive(Debug, Clone)]
pub struct DiscoveryStageHandler {
    aggregator: Arc<DiscoveryAggregator>,
    configuration: DiscoveryConfiguration,
}

impl DiscoveryStageHandler {
    pub fn new(aggregator: Arc<DiscoveryAggregator>, configuration: DiscoveryConfiguration) -> Self {
        Self {
            aggregator,
            configuration,
        }
    }
}

#[async_trait]
impl StageHandler for DiscoveryStageHandler {
    async fn run(&self, _definition: &StageDefinition, input: &StageInput) -> Result<StageOutput, StageError> {
        let source_paper = input.document.source_paper();
        let result = self
            .aggregator
            .discover(&source_paper, &self.configuration)
            .await
            .map_err(|e| StageError::Handler(e.to_string()))?;

        let mut metrics = HashMap::new();
        metrics.insert("papers_found".to_string(), result.discovered_papers.len() as f64);
        metrics.insert("confidence".to_string(), result.overall_confidence_score);
        metrics.insert("source_errors".to_string(), result.errors.len() as f64);

        let value = serde_json::to_value(&result).map_err(|e| StageError::Handler(e.to_string()))?;
        let mut data = HashMap::new();
        data.insert("discovery".to_string(), value);

        Ok(StageOutput { data, metrics })
    }
}

/// Executes stage definitions through their handlers
#[derive(Debug, Clone)]
pub struct StageExecutor {
    default_handler: Arc<dyn StageHandler>,
    handlers: HashMap<StageType, Arc<dyn StageHandler>>,
    metrics: Arc<MetricsRegistry>,
}

impl StageExecutor {
    pub fn new(default_handler: Arc<dyn StageHandler>, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            default_handler,
            handlers: HashMap::new(),
            metrics,
        }
    }

    /// Every stage runs its agent through `chain`, sharing the chain's metrics
    pub fn for_chain(chain: Arc<FallbackChain>) -> Self {
        let metrics = chain.metrics().clone();
        Self::new(Arc::new(AgentStageHandler::new(chain)), metrics)
    }

    /// Route one stage type to a dedicated handler
    pub fn with_handler(mut self, stage: StageType, handler: Arc<dyn StageHandler>) -> Self {
        self.handlers.insert(stage, handler);
        self
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    fn handler(&self, stage: StageType) -> &Arc<dyn StageHandler> {
        self.handlers.get(&stage).unwrap_or(&self.default_handler)
    }

    /// Run `definition` until an attempt succeeds or its attempts are used up.
    ///
    /// The stage's maximum duration bounds all attempts together: a retry only
    /// gets the time left over by earlier attempts. Failures are reported in the
    /// returned result, never as an error.
    pub async fn execute(&self, definition: &StageDefinition, input: StageInput) -> StageResult {
        let started_at = Utc::now();
        let handler = self.handler(definition.stage);
        let max_attempts = definition.max_attempts();
        let deadline = Instant::now().checked_add(definition.max_duration());
        let mut last_error = StageError::Handler("stage was not attempted".to_string());
        let mut attempts = 0;

        for attempt in 1..=max_attempts {
            let remaining = deadline
                .map(|deadline| deadline.saturating_duration_since(Instant::now()))
                .unwrap_or_else(|| definition.max_duration());
            if remaining.is_zero() {
                last_error = StageError::Timeout(definition.max_duration());
                break;
            }

            debug!(stage = %definition.stage, agent = %definition.agent, attempt, "running stage");
            attempts = attempt;
            let attempt_started = Instant::now();
            let outcome = match timeout(remaining, handler.run(definition, &input)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(StageError::Timeout(definition.max_duration())),
            };
            self.metrics
                .record_agent(definition.agent, attempt_started.elapsed(), outcome.is_ok());

            match outcome {
                Ok(output) => {
                    info!(stage = %definition.stage, attempt, "stage completed");
                    return StageResult::success(
                        definition.stage,
                        definition.agent,
                        started_at,
                        attempt,
                        output.data,
                        output.metrics,
                    );
                }
                Err(error) => {
                    warn!(stage = %definition.stage, attempt, max_attempts, error = %error, "stage attempt failed");
                    let out_of_time = matches!(error, StageError::Timeout(_));
                    last_error = error;
                    if out_of_time {
                        break;
                    }
                }
            }
        }

        let mut result = StageResult::failure(
            definition.stage,
            definition.agent,
            started_at,
            attempts,
            last_error.to_string(),
        );
        if matches!(last_error, StageError::Timeout(_)) {
            result.result_data.insert("timed_out".to_string(), Value::Bool(true));
        }
        result
    }

    /// A result for a stage the configuration does not need
    pub fn skip(&self, definition: &StageDefinition, reason: &str) -> StageResult {
        info!(stage = %definition.stage, reason, "skipping stage");
        StageResult::skipped(definition.stage, definition.agent, reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::mock::ScriptedProvider;
    use crate::agents::{ProviderError, ProviderRegistry};
    use crate::models::{AgentType, RelationshipType};
    use crate::sources::mock::make_paper;
    use crate::sources::{MockSource, SourceRegistry};
    use crate::utils::RetryConfig;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails a fixed number of times, then succeeds
    #[derive(Debug)]
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
        delay: Duration,
    }

    impl Flaky {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl StageHandler for Flaky {
        async fn run(&self, _: &StageDefinition, _: &StageInput) -> Result<StageOutput, StageError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if call <= self.failures {
                Err(StageError::Handler(format!("failure {}", call)))
            } else {
                Ok(StageOutput::default())
            }
        }
    }

    fn input() -> StageInput {
        StageInput::new(Arc::new(
            DocumentContext::new("doc-1", "Attention Is All You Need").with_text("full text"),
        ))
    }

    fn executor(handler: Arc<dyn StageHandler>) -> (StageExecutor, Arc<MetricsRegistry>) {
        let metrics = Arc::new(MetricsRegistry::new());
        (StageExecutor::new(handler, metrics.clone()), metrics)
    }

    #[tokio::test]
    async fn test_stage_retries_until_success() {
        let handler = Arc::new(Flaky::new(2));
        let (executor, metrics) = executor(handler.clone());
        let definition = StageDefinition::for_stage(StageType::PaperProcessing);

        let result = executor.execute(&definition, input()).await;

        assert!(result.success);
        assert_eq!(result.attempts, 3);
        let agent = metrics.agent(AgentType::PaperProcessor);
        assert_eq!(agent.execution_count, 3);
        assert_eq!(agent.success_count, 1);
    }

    #[tokio::test]
    async fn test_non_retryable_stage_runs_once() {
        let handler = Arc::new(Flaky::new(1));
        let (executor, _) = executor(handler.clone());
        let definition = StageDefinition::for_stage(StageType::QualityCheck);

        let result = executor.execute(&definition, input()).await;

        assert!(!result.success);
        assert!(!result.skipped);
        assert_eq!(result.error_message.as_deref(), Some("failure 1"));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stage_timeout_is_a_failure() {
        let handler = Arc::new(Flaky {
            delay: Duration::from_secs(5),
            ..Flaky::new(0)
        });
        let (executor, _) = executor(handler);
        let definition = StageDefinition::for_stage(StageType::QualityCheck)
            .with_max_duration(Duration::from_secs(1));

        let result = executor.execute(&definition, input()).await;

        assert!(!result.success);
        assert_eq!(result.result_data.get("timed_out"), Some(&Value::Bool(true)));
        assert!(result.error_message.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_max_duration_bounds_all_attempts() {
        let handler = Arc::new(Flaky {
            delay: Duration::from_millis(600),
            ..Flaky::new(5)
        });
        let (executor, _) = executor(handler.clone());
        let definition = StageDefinition::for_stage(StageType::PaperProcessing)
            .with_max_duration(Duration::from_secs(1));

        let started = Instant::now();
        let result = executor.execute(&definition, input()).await;

        // the second attempt only gets what the first one left over
        assert!(started.elapsed() < Duration::from_millis(1500));
        assert!(!result.success);
        assert_eq!(result.attempts, 2);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        assert_eq!(result.result_data.get("timed_out"), Some(&Value::Bool(true)));
    }

    #[tokio::test]
    async fn test_agent_handler_reports_call_metrics() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(ScriptedProvider::failing(
            "cloud",
            ProviderError::Unavailable("down".into()),
        )));
        let local = Arc::new(ScriptedProvider::succeeding("local", "cleaned text").local());
        registry.register(local.clone());
        let chain = Arc::new(FallbackChain::new(
            Arc::new(registry),
            RetryConfig::default().immediate(),
            Arc::new(MetricsRegistry::new()),
        ));
        let executor = StageExecutor::for_chain(chain);
        let definition = StageDefinition::for_stage(StageType::PaperProcessing);

        let result = executor.execute(&definition, input()).await;

        assert!(result.success);
        assert_eq!(result.result_data["content"], Value::String("cleaned text".into()));
        assert_eq!(result.result_data["used_fallback"], Value::Bool(true));
        assert_eq!(result.metrics["provider_attempts"], 4.0);
        assert_eq!(result.metrics["used_fallback"], 1.0);

        let request = &local.requests()[0];
        assert_eq!(request.agent, AgentType::PaperProcessor);
        assert_eq!(request.input, "full text");
        assert_eq!(request.context["title"], Value::String("Attention Is All You Need".into()));
    }

    #[tokio::test]
    async fn test_agent_handler_passes_prerequisite_output() {
        let mut registry = ProviderRegistry::new();
        let provider = Arc::new(ScriptedProvider::succeeding("cloud", "summary"));
        registry.register(provider.clone());
        let chain = Arc::new(FallbackChain::new(
            Arc::new(registry),
            RetryConfig::default().immediate(),
            Arc::new(MetricsRegistry::new()),
        ));
        let executor = StageExecutor::for_chain(chain);

        let mut data = HashMap::new();
        data.insert("content".to_string(), Value::String("sections".into()));
        let processed = StageResult::success(
            StageType::PaperProcessing,
            AgentType::PaperProcessor,
            Utc::now(),
            1,
            data,
            HashMap::new(),
        );
        let definition = StageDefinition::for_stage(StageType::ContentAnalysis);
        executor
            .execute(&definition, input().with_prerequisites(vec![processed]))
            .await;

        let context = &provider.requests()[0].context;
        assert_eq!(
            context["prerequisites"]["paper_processing"],
            Value::String("sections".into())
        );
    }

    #[tokio::test]
    async fn test_discovery_handler_stores_result() {
        let mut sources = SourceRegistry::new();
        sources.register(Arc::new(
            MockSource::new("crossref").with_papers(vec![make_paper("1", "Related work", "crossref", Some(0.8))]),
        ));
        let aggregator = Arc::new(DiscoveryAggregator::new(sources));
        let mut configuration = DiscoveryConfiguration::fast_config();
        configuration.relationship_types = [RelationshipType::Cites].into_iter().collect();
        let handler = Arc::new(DiscoveryStageHandler::new(aggregator, configuration));

        let metrics = Arc::new(MetricsRegistry::new());
        let executor = StageExecutor::new(Arc::new(Flaky::new(0)), metrics)
            .with_handler(StageType::RelatedPaperDiscovery, handler);
        let definition = StageDefinition::for_stage(StageType::RelatedPaperDiscovery);

        let result = executor.execute(&definition, input()).await;

        assert!(result.success, "{:?}", result.error_message);
        assert_eq!(result.metrics["papers_found"], 1.0);
        assert!(result.result_data.contains_key("discovery"));
    }

    #[test]
    fn test_skip_produces_skipped_result() {
        let (executor, _) = executor(Arc::new(Flaky::new(0)));
        let definition = StageDefinition::for_stage(StageType::CitationProcessing);
        let result = executor.skip(&definition, "citation processing disabled");
        assert!(result.skipped);
        assert!(result.unblocks_dependents());
        assert_eq!(result.skip_reason(), Some("citation processing disabled"));
    }
}
