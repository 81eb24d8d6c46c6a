//! Paper records as returned by discovery sources, and the paper being processed.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The literature service a record came from
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SourceType {
    #[serde(rename = "crossref")]
    CrossRef,
    #[serde(rename = "semantic_scholar")]
    SemanticScholar,
    #[serde(rename = "openalex")]
    OpenAlex,
    #[serde(untagged)]
    Other(String),
}

impl SourceType {
    /// Returns the display name of the source
    pub fn name(&self) -> &str {
        match self {
            SourceType::CrossRef => "CrossRef",
            SourceType::SemanticScholar => "Semantic Scholar",
            SourceType::OpenAlex => "OpenAlex",
            SourceType::Other(s) => s,
        }
    }

    /// Returns the registry identifier of the source
    pub fn id(&self) -> &str {
        match self {
            SourceType::CrossRef => "crossref",
            SourceType::SemanticScholar => "semantic_scholar",
            SourceType::OpenAlex => "openalex",
            SourceType::Other(s) => s,
        }
    }

    /// Resolve a registry identifier back into a source type
    pub fn from_id(id: &str) -> Self {
        match id.to_lowercase().as_str() {
            "crossref" => SourceType::CrossRef,
            "semantic_scholar" | "semantic" => SourceType::SemanticScholar,
            "openalex" => SourceType::OpenAlex,
            _ => SourceType::Other(id.to_string()),
        }
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A paper record in the shape a source parsed it into.
///
/// Sources fill in whatever their API exposes; scores are left as `None` when the
/// API does not provide one so the aggregator can apply the source default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Paper {
    /// Source-specific identifier (DOI, S2 paper id, OpenAlex work id, ...)
    pub paper_id: String,

    /// Paper title
    pub title: String,

    /// Author display names
    pub authors: Vec<String>,

    /// Abstract text, when the source returns one
    pub r#abstract: Option<String>,

    /// Digital Object Identifier
    pub doi: Option<String>,

    /// Publication year
    pub year: Option<i32>,

    /// Journal, conference or repository name
    pub venue: Option<String>,

    /// Landing page URL
    pub url: Option<String>,

    /// Source where the paper was found
    pub source: SourceType,

    /// Citation count
    pub citations: Option<u32>,

    /// Influential citation count (Semantic Scholar only)
    pub influential_citations: Option<u32>,

    /// Source-supplied relevance in [0, 1]
    pub relevance: Option<f64>,

    /// Source-supplied identification confidence in [0, 1]
    pub confidence: Option<f64>,

    /// Source-specific metadata (flexible JSON)
    pub extra: Option<HashMap<String, serde_json::Value>>,
}

impl Paper {
    /// Create a new paper with required fields
    pub fn new(paper_id: String, title: String, source: SourceType) -> Self {
        Self {
            paper_id,
            title,
            authors: Vec::new(),
            r#abstract: None,
            doi: None,
            year: None,
            venue: None,
            url: None,
            source,
            citations: None,
            influential_citations: None,
            relevance: None,
            confidence: None,
            extra: None,
        }
    }

    /// Returns the primary identifier for this paper (DOI if available, else paper_id)
    pub fn primary_id(&self) -> &str {
        self.doi.as_deref().unwrap_or(&self.paper_id)
    }
}

/// Builder for constructing Paper objects
#[derive(Debug, Clone)]
pub struct PaperBuilder {
    paper: Paper,
}

impl PaperBuilder {
    /// Create a new builder with required fields
    pub fn new(paper_id: impl Into<String>, title: impl Into<String>, source: SourceType) -> Self {
        Self {
            paper: Paper::new(paper_id.into(), title.into(), source),
        }
    }

    /// Set authors
    pub fn authors<I, S>(mut self, authors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.paper.authors = authors
            .into_iter()
            .map(Into::into)
            .filter(|a: &String| !a.trim().is_empty())
            .collect();
        self
    }

    /// Set abstract
    pub fn abstract_text(mut self, abstract_text: Option<String>) -> Self {
        self.paper.r#abstract = abstract_text.filter(|a| !a.is_empty());
        self
    }

    /// Set DOI; empty strings are ignored
    pub fn doi(mut self, doi: Option<String>) -> Self {
        self.paper.doi = doi.map(|d| normalize_doi(&d)).filter(|d| !d.is_empty());
        self
    }

    /// Set publication year
    pub fn year(mut self, year: Option<i32>) -> Self {
        self.paper.year = year;
        self
    }

    /// Set venue
    pub fn venue(mut self, venue: Option<String>) -> Self {
        self.paper.venue = venue.filter(|v| !v.is_empty());
        self
    }

    /// Set landing page URL
    pub fn url(mut self, url: Option<String>) -> Self {
        self.paper.url = url.filter(|u| !u.is_empty());
        self
    }

    /// Set citation count
    pub fn citations(mut self, count: Option<u32>) -> Self {
        self.paper.citations = count;
        self
    }

    /// Set influential citation count
    pub fn influential_citations(mut self, count: Option<u32>) -> Self {
        self.paper.influential_citations = count;
        self
    }

    /// Set the source-supplied relevance
    pub fn relevance(mut self, relevance: f64) -> Self {
        self.paper.relevance = Some(relevance.clamp(0.0, 1.0));
        self
    }

    /// Set the source-supplied confidence
    pub fn confidence(mut self, confidence: f64) -> Self {
        self.paper.confidence = Some(confidence.clamp(0.0, 1.0));
        self
    }

    /// Add extra metadata
    pub fn extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.paper
            .extra
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value);
        self
    }

    /// Build the Paper
    pub fn build(self) -> Paper {
        self.paper
    }
}

/// Strip resolver prefixes and lowercase a DOI
pub fn normalize_doi(doi: &str) -> String {
    let doi = doi.trim();
    let doi = doi
        .strip_prefix("https://doi.org/")
        .or_else(|| doi.strip_prefix("http://doi.org/"))
        .or_else(|| doi.strip_prefix("doi:"))
        .unwrap_or(doi);
    doi.to_lowercase()
}

/// The paper a discovery run starts from
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourcePaper {
    pub title: String,
    pub authors: Vec<String>,
    pub doi: Option<String>,
    pub year: Option<i32>,
    pub venue: Option<String>,
    pub r#abstract: Option<String>,
}

impl SourcePaper {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn with_doi(mut self, doi: impl Into<String>) -> Self {
        let doi = normalize_doi(&doi.into());
        self.doi = (!doi.is_empty()).then_some(doi);
        self
    }

    pub fn with_authors<I, S>(mut self, authors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.authors = authors.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_year(mut self, year: i32) -> Self {
        self.year = Some(year);
        self
    }

    /// Text used as the query string when a source has to search by content
    pub fn query_text(&self) -> String {
        match &self.doi {
            Some(doi) if self.title.is_empty() => doi.clone(),
            _ => self.title.clone(),
        }
    }
}
