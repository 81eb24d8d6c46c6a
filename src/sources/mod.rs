//! Discovery source plugins with extensible trait-based architecture.
//!
//! This module defines the [`Source`] trait that every literature API implements.
//! New sources can be added by implementing this trait and registering them with
//! the [`SourceRegistry`]; the discovery aggregator only ever talks to the trait.
//!
//! # Built-in Sources
//!
//! - `crossref` - CrossRef REST API (references, bibliographic similarity)
//! - `semantic_scholar` - Semantic Scholar Graph and Recommendations APIs
//!   (references, citations, recommendations)
//! - `openalex` - OpenAlex works API (references, citations, related works)
//!
//! # Environment
//!
//! - `SEMANTIC_SCHOLAR_API_KEY` - optional key for higher Semantic Scholar rate limits
//! - `OPENALEX_EMAIL` - optional contact address for the OpenAlex polite pool
//! - `CROSSREF_MAILTO` - optional contact address for the CrossRef polite pool

mod crossref;
mod openalex;
mod registry;
mod semantic;

pub mod mock;

pub use crossref::CrossRefSource;
pub use mock::MockSource;
pub use openalex::OpenAlexSource;
pub use registry::{SourceCapabilities, SourceRegistry};
pub use semantic::SemanticScholarSource;

use crate::models::{Paper, RelationshipType, SourcePaper};
use async_trait::async_trait;
use std::time::Duration;

/// One bounded lookup against a source
#[derive(Debug, Clone)]
pub struct DiscoveryQuery {
    pub paper: SourcePaper,
    pub relationship: RelationshipType,
    pub max_results: usize,
}

impl DiscoveryQuery {
    pub fn new(paper: SourcePaper, relationship: RelationshipType, max_results: usize) -> Self {
        Self {
            paper,
            relationship,
            max_results,
        }
    }
}

/// Records a source returned for one query
#[derive(Debug, Clone)]
pub struct SourceResponse {
    pub papers: Vec<Paper>,
    /// The query string or lookup key actually sent
    pub query: String,
    /// Total matches reported by the API, when it reports one
    pub total_results: Option<usize>,
}

impl SourceResponse {
    pub fn new(papers: Vec<Paper>, query: impl Into<String>) -> Self {
        Self {
            papers,
            query: query.into(),
            total_results: None,
        }
    }

    pub fn total_results(mut self, total: usize) -> Self {
        self.total_results = Some(total);
        self
    }
}

/// The Source trait defines the interface for all discovery source plugins.
///
/// # Implementing a New Source
///
/// 1. Create a struct that implements `Source`
/// 2. Declare the relationship types it can answer in `capabilities`
/// 3. Implement `discover`, leaving scores unset when the API has none
/// 4. Register it with [`SourceRegistry::register`]
#[async_trait]
pub trait Source: Send + Sync + std::fmt::Debug {
    /// Unique identifier used as registry key (e.g. "crossref")
    fn id(&self) -> &str;

    /// Human-readable name of this source
    fn name(&self) -> &str;

    /// Relationship types this source can answer
    fn capabilities(&self) -> SourceCapabilities;

    fn supports(&self, relationship: RelationshipType) -> bool {
        self.capabilities()
            .contains(SourceCapabilities::for_relationship(relationship))
    }

    /// Confidence assigned to records that carry no confidence of their own
    fn reliability_score(&self) -> f64 {
        0.7
    }

    /// Relevance assigned to records that carry no relevance of their own
    fn default_relevance(&self, _relationship: RelationshipType) -> f64 {
        0.5
    }

    /// Fetch papers related to `query.paper` by `query.relationship`
    async fn discover(&self, query: &DiscoveryQuery) -> Result<SourceResponse, SourceError>;
}

/// Errors that can occur when interacting with a source
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The source cannot answer this relationship type
    #[error("Relationship {0} is not supported by this source")]
    UnsupportedRelationship(RelationshipType),

    /// Network or HTTP transport error
    #[error("Network error: {0}")]
    Network(String),

    /// Response body could not be decoded
    #[error("Parse error: {0}")]
    Parse(String),

    /// Invalid request parameters
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Rate limit exceeded (with optional retry-after seconds)
    #[error("Rate limit exceeded")]
    RateLimit(Option<u64>),

    /// Paper not found
    #[error("Paper not found: {0}")]
    NotFound(String),

    /// Non-success response from the API
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Other error
    #[error("Error: {0}")]
    Other(String),
}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SourceError::Network(format!("request timed out: {}", err))
        } else {
            SourceError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for SourceError {
    fn from(err: serde_json::Error) -> Self {
        SourceError::Parse(format!("JSON: {}", err))
    }
}

/// Join a base URL and a path without doubling slashes
pub(crate) fn endpoint(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}
