//! Mock source for testing purposes.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::models::{Paper, PaperBuilder, RelationshipType, SourceType};
use crate::sources::{DiscoveryQuery, Source, SourceCapabilities, SourceError, SourceResponse};

/// A source that returns predefined papers or a predefined failure.
#[derive(Debug)]
pub struct MockSource {
    id: String,
    capabilities: SourceCapabilities,
    reliability: f64,
    default_relevance: f64,
    papers: Mutex<Vec<Paper>>,
    failure: Mutex<Option<String>>,
    delay: Duration,
    relationship_delays: BTreeMap<RelationshipType, Duration>,
    calls: AtomicUsize,
}

impl MockSource {
    /// A source answering every relationship type with no papers.
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            capabilities: SourceCapabilities::all(),
            reliability: 0.9,
            default_relevance: 0.6,
            papers: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
            delay: Duration::ZERO,
            relationship_delays: BTreeMap::new(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_papers(self, papers: Vec<Paper>) -> Self {
        *self.papers.lock().unwrap_or_else(PoisonError::into_inner) = papers;
        self
    }

    pub fn with_capabilities(mut self, capabilities: SourceCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_reliability(mut self, reliability: f64) -> Self {
        self.reliability = reliability;
        self
    }

    pub fn with_default_relevance(mut self, relevance: f64) -> Self {
        self.default_relevance = relevance;
        self
    }

    /// Sleep before answering every query
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Sleep before answering queries for `relationship` only
    pub fn with_relationship_delay(mut self, relationship: RelationshipType, delay: Duration) -> Self {
        self.relationship_delays.insert(relationship, delay);
        self
    }

    /// Fail every query with an API error carrying `message`
    pub fn failing(self, message: &str) -> Self {
        self.set_failure(Some(message));
        self
    }

    pub fn set_failure(&self, message: Option<&str>) {
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = message.map(str::to_string);
    }

    /// Number of `discover` calls received
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Source for MockSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        "Mock Source"
    }

    fn capabilities(&self) -> SourceCapabilities {
        self.capabilities
    }

    fn reliability_score(&self) -> f64 {
        self.reliability
    }

    fn default_relevance(&self, _relationship: RelationshipType) -> f64 {
        self.default_relevance
    }

    async fn discover(&self, query: &DiscoveryQuery) -> Result<SourceResponse, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = self
            .relationship_delays
            .get(&query.relationship)
            .copied()
            .unwrap_or(self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let failure = self
            .failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(message) = failure {
            return Err(SourceError::Api {
                status: 500,
                message,
            });
        }

        let papers: Vec<Paper> = self
            .papers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .take(query.max_results)
            .cloned()
            .collect();
        Ok(SourceResponse::new(papers, query.paper.query_text()))
    }
}

/// Helper function to create a mock paper record for testing.
pub fn make_paper(paper_id: &str, title: &str, source_id: &str, relevance: Option<f64>) -> Paper {
    let builder = PaperBuilder::new(paper_id, title, SourceType::from_id(source_id))
        .authors(["Test Author"])
        .year(Some(2020));
    match relevance {
        Some(relevance) => builder.relevance(relevance).build(),
        None => builder.build(),
    }
}
