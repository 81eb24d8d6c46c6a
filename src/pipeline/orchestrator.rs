//! Pipeline orchestrator: graph construction, bounded dispatch and run status.

use async_trait::async_trait;
use chrono::Utc;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Debug;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::events::{EventBus, EventKind, PipelineEvent};
use super::graph::{default_definitions, StageGraph};
use super::stage::{StageExecutor, StageInput};
use super::{PipelineError, PipelineRun};
use crate::models::{
    DocumentContext, PipelineConfiguration, PipelineStatus, StageDefinition, StageResult, StageType,
};

/// The user a run is started for, as known to the billing collaborator
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserContext {
    pub user_id: String,
    pub credits: Option<i64>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl UserContext {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Self::default()
        }
    }

    pub fn with_credits(mut self, credits: i64) -> Self {
        self.credits = Some(credits);
        self
    }
}

/// Decides whether a user may start a run; debiting is the gate owner's business
#[async_trait]
pub trait CreditGate: Send + Sync + Debug {
    async fn check(&self, user: &UserContext, configuration: &PipelineConfiguration) -> Result<(), String>;
}

/// How the dispatch loop ended
enum Outcome {
    Completed,
    Failed(String),
    TimedOut,
    Cancelled,
}

/// Mutable bookkeeping of one run, owned by the dispatch loop
struct RunState {
    run_id: Uuid,
    status: PipelineStatus,
    results: Vec<StageResult>,
    completed: HashSet<StageType>,
    started: HashSet<StageType>,
    /// In-flight stages and whether each may share the pool
    in_flight: BTreeMap<StageType, bool>,
    skipped: Vec<StageType>,
}

impl RunState {
    fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            status: PipelineStatus::Initializing,
            results: Vec::new(),
            completed: HashSet::new(),
            started: HashSet::new(),
            in_flight: BTreeMap::new(),
            skipped: Vec::new(),
        }
    }

    fn prerequisite_results(&self, definition: &StageDefinition) -> Vec<StageResult> {
        definition
            .prerequisites
            .iter()
            .filter_map(|p| self.results.iter().find(|r| r.stage == *p).cloned())
            .collect()
    }

    fn exclusive_in_flight(&self) -> bool {
        self.in_flight.values().any(|parallel| !parallel)
    }
}

/// Runs pipeline configurations against documents
#[derive(Debug, Clone)]
pub struct PipelineOrchestrator {
    executor: Arc<StageExecutor>,
    events: EventBus,
    definitions: BTreeMap<StageType, StageDefinition>,
    gate: Option<Arc<dyn CreditGate>>,
    timeout_override: Option<Duration>,
}

impl PipelineOrchestrator {
    pub fn new(executor: StageExecutor) -> Self {
        Self {
            executor: Arc::new(executor),
            events: EventBus::default(),
            definitions: default_definitions(),
            gate: None,
            timeout_override: None,
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Replace the built-in definition of `definition.stage`
    pub fn with_definition(mut self, definition: StageDefinition) -> Self {
        self.definitions.insert(definition.stage, definition);
        self
    }

    pub fn with_credit_gate(mut self, gate: Arc<dyn CreditGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Bound every run by `timeout` instead of the configuration's own timeout
    pub fn with_timeout_override(mut self, timeout: Duration) -> Self {
        self.timeout_override = Some(timeout);
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn executor(&self) -> &StageExecutor {
        &self.executor
    }

    /// Validate `configuration` and build its stage graph without running anything
    pub fn plan(&self, configuration: &PipelineConfiguration) -> Result<StageGraph, PipelineError> {
        let violations = configuration.validate_with_definitions(&self.definitions);
        if !violations.is_empty() {
            return Err(PipelineError::InvalidConfiguration(violations));
        }
        StageGraph::build(&configuration.required_stages, &self.definitions)
    }

    pub async fn run(
        &self,
        configuration: &PipelineConfiguration,
        document: DocumentContext,
    ) -> Result<PipelineRun, PipelineError> {
        self.run_with_cancellation(configuration, document, CancellationToken::new())
            .await
    }

    /// Consult the credit gate, then run
    pub async fn run_for_user(
        &self,
        user: &UserContext,
        configuration: &PipelineConfiguration,
        document: DocumentContext,
    ) -> Result<PipelineRun, PipelineError> {
        if let Some(gate) = &self.gate {
            if let Err(reason) = gate.check(user, configuration).await {
                warn!(user = %user.user_id, reason = %reason, "run rejected by credit gate");
                return Err(PipelineError::Rejected(reason));
            }
        }
        self.run(configuration, document).await
    }

    /// Run `configuration` until every stage finished, a required stage failed,
    /// the run timed out or `cancel` fired.
    ///
    /// Only configuration errors are returned as `Err`; everything that goes
    /// wrong once stages run ends up in the returned [`PipelineRun`].
    pub async fn run_with_cancellation(
        &self,
        configuration: &PipelineConfiguration,
        document: DocumentContext,
        cancel: CancellationToken,
    ) -> Result<PipelineRun, PipelineError> {
        let graph = self.plan(configuration)?;
        let started_at = Utc::now();
        let document = Arc::new(document);
        let mut state = RunState::new(Uuid::new_v4());
        let run_timeout = self.timeout_override.unwrap_or_else(|| configuration.timeout());

        info!(
            run_id = %state.run_id,
            preset = %configuration.name,
            document = %document.document_id,
            stages = graph.len(),
            "starting pipeline run"
        );
        self.publish(&state, EventKind::TaskCreated, None, None);

        self.apply_explicit_skips(configuration, &graph, &mut state);

        let mut tasks: JoinSet<StageResult> = JoinSet::new();
        let deadline = tokio::time::sleep(run_timeout);
        tokio::pin!(deadline);

        let outcome = loop {
            self.dispatch(configuration, &graph, &document, &mut state, &mut tasks);
            if tasks.is_empty() {
                break if state.completed.len() == graph.len() {
                    Outcome::Completed
                } else {
                    let mut stranded: Vec<&str> = graph
                        .stages()
                        .filter(|d| !state.completed.contains(&d.stage))
                        .map(|d| d.stage.id())
                        .collect();
                    stranded.sort_unstable();
                    Outcome::Failed(format!("stages never ran: {}", stranded.join(", ")))
                };
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tasks.abort_all();
                    break Outcome::Cancelled;
                }
                _ = &mut deadline => {
                    tasks.abort_all();
                    break Outcome::TimedOut;
                }
                joined = tasks.join_next() => {
                    let Some(joined) = joined else {
                        continue;
                    };
                    let result = match joined {
                        Ok(result) => result,
                        Err(join_error) => {
                            error!(run_id = %state.run_id, error = %join_error, "stage task ended abnormally");
                            continue;
                        }
                    };
                    if let Some(failure) = self.complete_stage(&graph, &mut state, result) {
                        tasks.abort_all();
                        break Outcome::Failed(failure);
                    }
                }
            }
        };

        let cancelled_stages: Vec<StageType> = state.in_flight.keys().copied().collect();
        let (status, failure, run_event) = match outcome {
            Outcome::Completed => (PipelineStatus::Completed, None, EventKind::TaskCompleted),
            Outcome::Failed(reason) => (PipelineStatus::Failed, Some(reason), EventKind::TaskFailed),
            Outcome::TimedOut => (
                PipelineStatus::Failed,
                Some(format!("pipeline timed out after {}s", run_timeout.as_secs())),
                EventKind::TaskTimeout,
            ),
            Outcome::Cancelled => (PipelineStatus::Cancelled, None, EventKind::TaskCancelled),
        };
        state.status = status;

        for stage in &cancelled_stages {
            self.publish(&state, EventKind::TaskCancelled, Some(*stage), None);
        }
        self.publish(&state, run_event, None, failure.clone());

        match &failure {
            Some(reason) => warn!(run_id = %state.run_id, status = %status, reason = %reason, "pipeline run ended"),
            None => info!(run_id = %state.run_id, status = %status, "pipeline run ended"),
        }

        Ok(PipelineRun {
            run_id: state.run_id,
            configuration: configuration.clone(),
            status,
            progress: status.progress(),
            document_status: status.document_status(),
            failure,
            stage_results: state.results,
            skipped_stages: state.skipped,
            cancelled_stages,
            started_at,
            completed_at: Utc::now(),
            metrics: self.executor.metrics().snapshot(),
        })
    }

    fn apply_explicit_skips(
        &self,
        configuration: &PipelineConfiguration,
        graph: &StageGraph,
        state: &mut RunState,
    ) {
        for definition in graph.stages() {
            let reason = if configuration.stage_toggled_off(definition.stage) {
                format!("{} disabled", definition.stage.id().replace('_', " "))
            } else if !definition.required && !configuration.enabled_agents.contains(&definition.agent) {
                format!("agent {} not enabled", definition.agent)
            } else {
                continue;
            };

            let result = self.executor.skip(definition, &reason);
            state.started.insert(definition.stage);
            state.completed.insert(definition.stage);
            state.skipped.push(definition.stage);
            state.results.push(result);
        }
    }

    /// Start ready stages, highest priority first, within the concurrency limit.
    ///
    /// A stage that may not share the pool waits for in-flight stages to drain
    /// and holds back lower-priority ready stages until it has finished.
    fn dispatch(
        &self,
        configuration: &PipelineConfiguration,
        graph: &StageGraph,
        document: &Arc<DocumentContext>,
        state: &mut RunState,
        tasks: &mut JoinSet<StageResult>,
    ) {
        let ready: Vec<StageDefinition> = graph
            .ready(&state.completed, &state.started)
            .into_iter()
            .cloned()
            .collect();

        for definition in ready {
            if state.in_flight.len() >= configuration.max_concurrent_agents || state.exclusive_in_flight() {
                break;
            }
            if !definition.parallel && !state.in_flight.is_empty() {
                break;
            }

            let input = StageInput::new(document.clone())
                .with_prerequisites(state.prerequisite_results(&definition));
            state.started.insert(definition.stage);
            state.in_flight.insert(definition.stage, definition.parallel);
            state.status = definition.stage.running_status();

            debug!(
                run_id = %state.run_id,
                stage = %definition.stage,
                priority = definition.priority,
                in_flight = state.in_flight.len(),
                "dispatching stage"
            );
            self.publish(state, EventKind::TaskStarted, Some(definition.stage), None);

            let executor = self.executor.clone();
            tasks.spawn(async move {
                let (stage, agent) = (definition.stage, definition.agent);
                let started_at = Utc::now();
                match AssertUnwindSafe(executor.execute(&definition, input))
                    .catch_unwind()
                    .await
                {
                    Ok(result) => result,
                    Err(panic) => {
                        let message = panic
                            .downcast_ref::<&str>()
                            .map(|s| s.to_string())
                            .or_else(|| panic.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "unknown panic".to_string());
                        StageResult::failure(stage, agent, started_at, 1, format!("stage panicked: {}", message))
                    }
                }
            });
        }
    }

    /// Merge a finished stage into the run; returns the failure that ends the run, if any
    fn complete_stage(&self, graph: &StageGraph, state: &mut RunState, result: StageResult) -> Option<String> {
        let stage = result.stage;
        state.in_flight.remove(&stage);
        let required = graph.definition(stage).map_or(true, |d| d.required);

        if result.success {
            state.completed.insert(stage);
            self.publish(state, EventKind::TaskCompleted, Some(stage), None);
            state.results.push(result);
            return None;
        }

        let message = result
            .error_message
            .clone()
            .unwrap_or_else(|| "stage failed".to_string());
        let kind = if result.result_data.contains_key("timed_out") {
            EventKind::TaskTimeout
        } else {
            EventKind::TaskFailed
        };
        self.publish(state, kind, Some(stage), Some(message.clone()));

        if required {
            error!(run_id = %state.run_id, stage = %stage, error = %message, "required stage failed");
            state.results.push(result);
            return Some(format!("required stage {} failed: {}", stage, message));
        }

        warn!(run_id = %state.run_id, stage = %stage, error = %message, "optional stage failed, continuing without it");
        state.completed.insert(stage);
        state.skipped.push(stage);
        state.results.push(result.into_skipped());
        None
    }

    fn publish(&self, state: &RunState, kind: EventKind, stage: Option<StageType>, message: Option<String>) {
        let mut event = PipelineEvent::new(state.run_id, kind, stage, state.status);
        if let Some(message) = message {
            event = event.with_message(message);
        }
        self.events.publish(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::MetricsRegistry;
    use crate::models::AgentType;
    use crate::pipeline::{StageError, StageHandler, StageOutput};
    use std::sync::Mutex;

    /// Records start order and fails the listed stages
    #[derive(Debug, Default)]
    struct Recording {
        failing: HashSet<StageType>,
        started: Mutex<Vec<StageType>>,
        delay: Duration,
    }

    #[async_trait]
    impl StageHandler for Recording {
        async fn run(&self, definition: &StageDefinition, _: &StageInput) -> Result<StageOutput, StageError> {
            self.started
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(definition.stage);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.failing.contains(&definition.stage) {
                Err(StageError::Handler(format!("{} broke", definition.stage)))
            } else {
                Ok(StageOutput::default())
            }
        }
    }

    fn orchestrator(handler: Arc<Recording>) -> PipelineOrchestrator {
        PipelineOrchestrator::new(StageExecutor::new(handler, Arc::new(MetricsRegistry::new())))
    }

    fn document() -> DocumentContext {
        DocumentContext::new("doc-1", "A paper").with_text("text")
    }

    #[tokio::test]
    async fn test_quick_preset_completes() {
        let handler = Arc::new(Recording::default());
        let run = orchestrator(handler.clone())
            .run(&PipelineConfiguration::quick_analysis(), document())
            .await
            .unwrap();

        assert_eq!(run.status, PipelineStatus::Completed);
        assert_eq!(run.progress, 100);
        assert_eq!(run.stage_results.len(), 3);
        assert!(run.failure.is_none());

        let started = handler.started.lock().unwrap().clone();
        assert_eq!(started[0], StageType::PaperProcessing);
        // Concurrency 2 lets both dependents start, higher priority first
        assert_eq!(&started[1..], &[StageType::MetadataEnhancement, StageType::ContentAnalysis]);
    }

    #[tokio::test]
    async fn test_optional_failure_is_skipped() {
        let handler = Arc::new(Recording {
            failing: [StageType::MetadataEnhancement].into_iter().collect(),
            ..Recording::default()
        });
        let run = orchestrator(handler)
            .run(&PipelineConfiguration::quick_analysis(), document())
            .await
            .unwrap();

        assert_eq!(run.status, PipelineStatus::Completed);
        assert_eq!(run.skipped_stages, vec![StageType::MetadataEnhancement]);
        let metadata = run.result(StageType::MetadataEnhancement).unwrap();
        assert!(metadata.skipped);
        assert!(!metadata.success);
        // Optional stages get one retry
        assert_eq!(metadata.attempts, 2);
    }

    #[tokio::test]
    async fn test_required_failure_fails_run() {
        let handler = Arc::new(Recording {
            failing: [StageType::PaperProcessing].into_iter().collect(),
            ..Recording::default()
        });
        let run = orchestrator(handler.clone())
            .run(&PipelineConfiguration::quick_analysis(), document())
            .await
            .unwrap();

        assert_eq!(run.status, PipelineStatus::Failed);
        assert_eq!(run.progress, 0);
        assert!(run.failure.unwrap().contains("paper_processing"));
        // Dependents never start
        assert!(handler
            .started
            .lock()
            .unwrap()
            .iter()
            .all(|s| *s == StageType::PaperProcessing));
    }

    #[tokio::test]
    async fn test_toggled_off_stage_is_skipped_not_run() {
        let handler = Arc::new(Recording::default());
        let mut configuration = PipelineConfiguration::comprehensive_analysis();
        configuration.enable_quality_checking = false;

        let run = orchestrator(handler.clone())
            .run(&configuration, document())
            .await
            .unwrap();

        assert_eq!(run.status, PipelineStatus::Completed);
        let quality = run.result(StageType::QualityCheck).unwrap();
        assert_eq!(quality.skip_reason(), Some("quality check disabled"));
        assert!(!handler.started.lock().unwrap().contains(&StageType::QualityCheck));
    }

    #[tokio::test]
    async fn test_invalid_configuration_fails_fast() {
        let handler = Arc::new(Recording::default());
        let configuration = PipelineConfiguration {
            max_concurrent_agents: 0,
            ..PipelineConfiguration::fast_processing()
        };
        let result = orchestrator(handler.clone()).run(&configuration, document()).await;

        assert!(matches!(result, Err(PipelineError::InvalidConfiguration(_))));
        assert!(handler.started.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_required_override_with_disabled_agent_is_rejected() {
        let handler = Arc::new(Recording::default());
        let mut configuration = PipelineConfiguration::quick_analysis();
        configuration.enabled_agents.remove(&AgentType::MetadataEnhancer);
        let mut metadata = StageDefinition::for_stage(StageType::MetadataEnhancement);
        metadata.required = true;

        let orchestrator = orchestrator(handler.clone()).with_definition(metadata);
        assert!(matches!(
            orchestrator.plan(&configuration),
            Err(PipelineError::InvalidConfiguration(_))
        ));
        let result = orchestrator.run(&configuration, document()).await;

        assert!(matches!(result, Err(PipelineError::InvalidConfiguration(_))));
        assert!(handler.started.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_huge_configured_timeout_still_runs() {
        let handler = Arc::new(Recording::default());
        let configuration = PipelineConfiguration {
            timeout_minutes: u64::MAX,
            ..PipelineConfiguration::fast_processing()
        };
        let run = orchestrator(handler).run(&configuration, document()).await.unwrap();

        assert_eq!(run.status, PipelineStatus::Completed);
    }

    #[tokio::test]
    async fn test_events_follow_run_lifecycle() {
        let handler = Arc::new(Recording::default());
        let orchestrator = orchestrator(handler);
        let mut events = orchestrator.events().subscribe();

        let run = orchestrator
            .run(&PipelineConfiguration::fast_processing(), document())
            .await
            .unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            assert_eq!(event.run_id, run.run_id);
            kinds.push(event.kind);
        }
        assert_eq!(kinds.first(), Some(&EventKind::TaskCreated));
        assert_eq!(kinds.last(), Some(&EventKind::TaskCompleted));
        assert_eq!(kinds.iter().filter(|k| **k == EventKind::TaskStarted).count(), 2);
    }

    #[derive(Debug)]
    struct DenyAll;

    #[async_trait]
    impl CreditGate for DenyAll {
        async fn check(&self, user: &UserContext, _: &PipelineConfiguration) -> Result<(), String> {
            Err(format!("{} has no credits", user.user_id))
        }
    }

    #[tokio::test]
    async fn test_credit_gate_rejection_runs_nothing() {
        let handler = Arc::new(Recording::default());
        let result = orchestrator(handler.clone())
            .with_credit_gate(Arc::new(DenyAll))
            .run_for_user(
                &UserContext::new("alice").with_credits(0),
                &PipelineConfiguration::fast_processing(),
                document(),
            )
            .await;

        assert_eq!(result.unwrap_err(), PipelineError::Rejected("alice has no credits".into()));
        assert!(handler.started.lock().unwrap().is_empty());
    }
}
