//! Multi-source discovery aggregator.

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use super::DiscoveryError;
use crate::agents::{AgentRequest, FallbackChain};
use crate::models::{
    overall_confidence, AgentType, DiscoveredPaper, DiscoveryConfiguration,
    RelatedPaperDiscoveryResult, SourcePaper, SourceType,
};
use crate::sources::{DiscoveryQuery, Source, SourceError, SourceRegistry};
use crate::utils::{deduplicate_papers, CircuitBreaker, CircuitBreakerManager, CircuitState};

/// Papers listed in the synthesis prompt
const SYNTHESIS_PAPER_LIMIT: usize = 20;

/// Stand-in deadline for timeouts too large to add to the current instant
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// What one source contributed to a run
#[derive(Debug, Default)]
struct SourceOutcome {
    papers: Vec<DiscoveredPaper>,
    warnings: Vec<String>,
    errors: Vec<String>,
}

impl SourceOutcome {
    fn error(message: String) -> Self {
        Self {
            errors: vec![message],
            ..Self::default()
        }
    }
}

/// Fans a source paper out to the registered sources and aggregates the answers
#[derive(Debug)]
pub struct DiscoveryAggregator {
    sources: Arc<SourceRegistry>,
    breakers: Arc<CircuitBreakerManager>,
    synthesis: Option<Arc<FallbackChain>>,
}

impl DiscoveryAggregator {
    pub fn new(sources: SourceRegistry) -> Self {
        Self {
            sources: Arc::new(sources),
            breakers: Arc::new(CircuitBreakerManager::default()),
            synthesis: None,
        }
    }

    /// Replace the default breakers (5 failures, 60 s open)
    pub fn with_circuit_breakers(mut self, breakers: CircuitBreakerManager) -> Self {
        self.breakers = Arc::new(breakers);
        self
    }

    /// Provider chain used when a configuration enables AI synthesis
    pub fn with_synthesis(mut self, chain: Arc<FallbackChain>) -> Self {
        self.synthesis = Some(chain);
        self
    }

    pub fn sources(&self) -> &SourceRegistry {
        &self.sources
    }

    pub fn circuit_status(&self) -> Vec<(String, CircuitState)> {
        self.breakers.status()
    }

    /// Discover papers related to `paper`.
    ///
    /// Only an invalid configuration is an error; failing sources are reported in
    /// the result's `errors` and force `requires_user_review`.
    pub async fn discover(
        &self,
        paper: &SourcePaper,
        config: &DiscoveryConfiguration,
    ) -> Result<RelatedPaperDiscoveryResult, DiscoveryError> {
        let violations = config.validate();
        if !violations.is_empty() {
            return Err(DiscoveryError::InvalidConfiguration(violations));
        }

        let started_at = Utc::now();
        info!(
            title = %paper.title,
            sources = config.enabled_sources.len(),
            parallel = config.parallel_execution,
            "starting related paper discovery"
        );

        let mut warnings = Vec::new();
        let mut errors = Vec::new();
        let mut targets = Vec::new();
        for source_type in &config.enabled_sources {
            match self.sources.get_by_type(source_type) {
                Some(source) => targets.push(Arc::clone(source)),
                None => errors.push(format!("Source '{}' is not registered", source_type.id())),
            }
        }

        // One deadline for the whole run, in either mode
        let deadline = deadline_after(config.timeout());
        let outcomes = if config.parallel_execution {
            self.query_parallel(targets, paper, config, deadline).await
        } else {
            let mut outcomes = Vec::with_capacity(targets.len());
            for source in targets {
                let breaker = self.breakers.get(source.id());
                outcomes.push(query_source(source, breaker, paper.clone(), config.clone(), deadline).await);
            }
            outcomes
        };

        let mut papers = Vec::new();
        for outcome in outcomes {
            papers.extend(outcome.papers);
            warnings.extend(outcome.warnings);
            errors.extend(outcome.errors);
        }

        // Filter before truncating so the most relevant papers survive the cut
        let found = papers.len();
        papers.retain(|p| p.relevance_score >= config.minimum_relevance_score);
        debug!(
            found,
            kept = papers.len(),
            threshold = config.minimum_relevance_score,
            "applied relevance threshold"
        );

        if config.deduplicate {
            let before = papers.len();
            papers = deduplicate_papers(papers);
            debug!(merged = before - papers.len(), "merged cross-source duplicates");
        }

        papers.sort_by(|a, b| b.relevance_score.total_cmp(&a.relevance_score));
        papers.truncate(config.max_total_papers);

        let synthesis = if config.enable_ai_synthesis {
            self.synthesize(paper, &papers, &mut warnings).await
        } else {
            None
        };

        let mut papers_by_source = BTreeMap::new();
        let mut papers_by_relationship = BTreeMap::new();
        for discovered in &papers {
            *papers_by_source
                .entry(discovered.source.id().to_string())
                .or_insert(0) += 1;
            *papers_by_relationship
                .entry(discovered.relationship)
                .or_insert(0) += 1;
        }

        let requires_user_review =
            !errors.is_empty() || papers.iter().any(DiscoveredPaper::requires_review);

        let result = RelatedPaperDiscoveryResult {
            source_title: paper.title.clone(),
            source_doi: paper.doi.clone(),
            overall_confidence_score: overall_confidence(&papers),
            discovered_papers: papers,
            papers_by_source,
            papers_by_relationship,
            warnings,
            errors,
            requires_user_review,
            synthesis,
            started_at,
            completed_at: Utc::now(),
        };

        info!(
            papers = result.total_papers(),
            errors = result.errors.len(),
            confidence = result.overall_confidence_score,
            "related paper discovery finished"
        );
        Ok(result)
    }

    async fn query_parallel(
        &self,
        targets: Vec<Arc<dyn Source>>,
        paper: &SourcePaper,
        config: &DiscoveryConfiguration,
        deadline: Instant,
    ) -> Vec<SourceOutcome> {
        let names: Vec<String> = targets.iter().map(|s| s.name().to_string()).collect();
        let mut tasks = JoinSet::new();
        for (index, source) in targets.into_iter().enumerate() {
            let breaker = self.breakers.get(source.id());
            let paper = paper.clone();
            let config = config.clone();
            tasks.spawn(async move {
                (index, query_source(source, breaker, paper, config, deadline).await)
            });
        }

        let mut slots: Vec<Option<SourceOutcome>> = names.iter().map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => slots[index] = Some(outcome),
                Err(error) => warn!(error = %error, "discovery task did not finish"),
            }
        }

        // Keep enabled-source order regardless of completion order
        slots
            .into_iter()
            .zip(names)
            .map(|(slot, name)| {
                slot.unwrap_or_else(|| SourceOutcome::error(format!("{}: query task aborted", name)))
            })
            .collect()
    }

    async fn synthesize(
        &self,
        paper: &SourcePaper,
        papers: &[DiscoveredPaper],
        warnings: &mut Vec<String>,
    ) -> Option<String> {
        let Some(chain) = &self.synthesis else {
            warnings.push("AI synthesis requested but no provider chain is configured".to_string());
            return None;
        };
        if papers.is_empty() {
            return None;
        }

        let listing = papers
            .iter()
            .take(SYNTHESIS_PAPER_LIMIT)
            .map(|p| format!("- {} [{}]", p.title, p.relationship))
            .collect::<Vec<_>>()
            .join("\n");
        let request = AgentRequest::new(
            AgentType::RelatedPaperDiscovery,
            format!("Source paper: {}\n\nRelated papers:\n{}", paper.query_text(), listing),
        )
        .with_context("paper_count", serde_json::json!(papers.len()));

        let result = chain
            .call(AgentType::RelatedPaperDiscovery, &[], &request)
            .await;
        if result.is_success() {
            result.content().map(str::to_string)
        } else {
            let reason = result.error_message().unwrap_or("unknown error");
            warn!(reason, "discovery synthesis failed");
            warnings.push(format!("AI synthesis failed: {}", reason));
            None
        }
    }
}

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or(now + FAR_FUTURE)
}

/// Every configured relationship against one source.
///
/// Each lookup is bounded by the time left until `deadline`; a timeout keeps
/// whatever earlier lookups already produced.
async fn query_source(
    source: Arc<dyn Source>,
    breaker: Arc<CircuitBreaker>,
    paper: SourcePaper,
    config: DiscoveryConfiguration,
    deadline: Instant,
) -> SourceOutcome {
    let source = source.as_ref();
    let mut outcome = SourceOutcome::default();
    let mut remaining = config.max_papers_per_source;
    let source_type = SourceType::from_id(source.id());

    for &relationship in &config.relationship_types {
        if remaining == 0 {
            break;
        }
        if !source.supports(relationship) {
            outcome.warnings.push(format!(
                "{} does not support {} lookups",
                source.name(),
                relationship
            ));
            continue;
        }
        if Instant::now() >= deadline {
            outcome.errors.push(format!(
                "{}: no time left after {}s, {} not queried",
                source.name(),
                config.timeout_seconds,
                relationship
            ));
            break;
        }
        if !breaker.can_request() {
            outcome
                .errors
                .push(format!("{}: circuit open, source skipped", source.name()));
            break;
        }

        let query = DiscoveryQuery::new(paper.clone(), relationship, remaining);
        let Ok(answer) = timeout_at(deadline, source.discover(&query)).await else {
            breaker.record_failure();
            warn!(source = source.id(), relationship = %relationship, "discovery source timed out");
            outcome.errors.push(format!(
                "{} timed out after {}s",
                source.name(),
                config.timeout_seconds
            ));
            break;
        };
        match answer {
            Ok(response) => {
                breaker.record_success();
                let default_relevance = source.default_relevance(relationship);
                let reliability = source.reliability_score();
                let papers: Vec<DiscoveredPaper> = response
                    .papers
                    .into_iter()
                    .take(remaining)
                    .enumerate()
                    .map(|(rank, mut record)| {
                        record.source = source_type.clone();
                        DiscoveredPaper::from_source_record(
                            record,
                            relationship,
                            &response.query,
                            rank + 1,
                            default_relevance,
                            reliability,
                        )
                    })
                    .collect();
                debug!(
                    source = source.id(),
                    relationship = %relationship,
                    count = papers.len(),
                    "source answered"
                );
                remaining -= papers.len();
                outcome.papers.extend(papers);
            }
            // The source answered but could not look this paper up
            Err(
                error @ (SourceError::UnsupportedRelationship(_)
                | SourceError::InvalidRequest(_)
                | SourceError::NotFound(_)),
            ) => {
                breaker.record_success();
                outcome.warnings.push(format!(
                    "{} skipped {}: {}",
                    source.name(),
                    relationship,
                    error
                ));
            }
            Err(error) => {
                breaker.record_failure();
                warn!(
                    source = source.id(),
                    relationship = %relationship,
                    error = %error,
                    "discovery source failed"
                );
                outcome
                    .errors
                    .push(format!("{} ({}): {}", source.name(), relationship, error));
            }
        }
    }

    outcome
}
