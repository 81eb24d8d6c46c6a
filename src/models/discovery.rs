//! Related paper discovery models: configuration, normalized papers and run results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use uuid::Uuid;

use super::paper::{Paper, SourceType};

/// API confidence below which a discovered paper is flagged for manual review
pub const LOW_CONFIDENCE_THRESHOLD: f64 = 0.5;

/// How a discovered paper relates to the paper discovery started from
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationshipType {
    /// The source paper cites it (a reference)
    Cites,
    /// It cites the source paper
    CitedBy,
    /// Similar content according to the source's similarity index
    SemanticSimilarity,
    /// Shares at least one author
    SameAuthor,
    /// Published in the same venue
    SameVenue,
}

impl RelationshipType {
    pub const ALL: [RelationshipType; 5] = [
        RelationshipType::Cites,
        RelationshipType::CitedBy,
        RelationshipType::SemanticSimilarity,
        RelationshipType::SameAuthor,
        RelationshipType::SameVenue,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            RelationshipType::Cites => "cites",
            RelationshipType::CitedBy => "cited_by",
            RelationshipType::SemanticSimilarity => "semantic_similarity",
            RelationshipType::SameAuthor => "same_author",
            RelationshipType::SameVenue => "same_venue",
        }
    }
}

impl std::fmt::Display for RelationshipType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

/// Parameters for one discovery run.
///
/// Built with struct literals or one of the presets; [`DiscoveryConfiguration::validate`]
/// reports every violation at once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryConfiguration {
    pub enabled_sources: BTreeSet<SourceType>,
    pub relationship_types: BTreeSet<RelationshipType>,
    pub max_papers_per_source: usize,
    pub max_total_papers: usize,
    pub minimum_relevance_score: f64,
    pub enable_ai_synthesis: bool,
    pub timeout_seconds: u64,
    pub parallel_execution: bool,
    /// Merge copies of the same paper found by different sources
    #[serde(default)]
    pub deduplicate: bool,
}

impl Default for DiscoveryConfiguration {
    fn default() -> Self {
        Self::default_config()
    }
}

impl DiscoveryConfiguration {
    /// Balanced preset: CrossRef and Semantic Scholar, citation and similarity links
    pub fn default_config() -> Self {
        Self {
            enabled_sources: [SourceType::CrossRef, SourceType::SemanticScholar]
                .into_iter()
                .collect(),
            relationship_types: [
                RelationshipType::Cites,
                RelationshipType::CitedBy,
                RelationshipType::SemanticSimilarity,
            ]
            .into_iter()
            .collect(),
            max_papers_per_source: 25,
            max_total_papers: 100,
            minimum_relevance_score: 0.3,
            enable_ai_synthesis: false,
            timeout_seconds: 300,
            parallel_execution: true,
            deduplicate: false,
        }
    }

    /// Single-source sequential preset for interactive use
    pub fn fast_config() -> Self {
        Self {
            enabled_sources: [SourceType::CrossRef].into_iter().collect(),
            relationship_types: [RelationshipType::Cites, RelationshipType::SemanticSimilarity]
                .into_iter()
                .collect(),
            max_papers_per_source: 10,
            max_total_papers: 25,
            minimum_relevance_score: 0.4,
            enable_ai_synthesis: false,
            timeout_seconds: 60,
            parallel_execution: false,
            deduplicate: false,
        }
    }

    /// Every built-in source and relationship type, with synthesis
    pub fn comprehensive_config() -> Self {
        Self {
            enabled_sources: [
                SourceType::CrossRef,
                SourceType::SemanticScholar,
                SourceType::OpenAlex,
            ]
            .into_iter()
            .collect(),
            relationship_types: RelationshipType::ALL.into_iter().collect(),
            max_papers_per_source: 50,
            max_total_papers: 200,
            minimum_relevance_score: 0.2,
            enable_ai_synthesis: true,
            timeout_seconds: 600,
            parallel_execution: true,
            deduplicate: false,
        }
    }

    /// Look up a preset by name
    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "default" => Some(Self::default_config()),
            "fast" => Some(Self::fast_config()),
            "comprehensive" => Some(Self::comprehensive_config()),
            _ => None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Returns every violated constraint; an empty list means the configuration is usable
    pub fn validate(&self) -> Vec<String> {
        let mut violations = Vec::new();

        if self.enabled_sources.is_empty() {
            violations.push("at least one discovery source must be enabled".to_string());
        }
        if self.relationship_types.is_empty() {
            violations.push("at least one relationship type must be enabled".to_string());
        }
        if !(0.0..=1.0).contains(&self.minimum_relevance_score) {
            violations.push(format!(
                "minimum relevance score must be within [0, 1], got {}",
                self.minimum_relevance_score
            ));
        }
        if self.max_papers_per_source == 0 {
            violations.push("max papers per source must be positive".to_string());
        }
        if self.max_total_papers == 0 {
            violations.push("max total papers must be positive".to_string());
        }
        if self.timeout_seconds == 0 {
            violations.push("timeout must be positive".to_string());
        }

        violations
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_empty()
    }
}

/// Provenance of a discovered paper
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryMetadata {
    /// Query or lookup key the source was called with
    pub query: String,
    /// How reliably the source identified this paper, in [0, 1]
    pub api_confidence: f64,
    /// 1-based position in the source's response
    pub rank_position: usize,
    pub requires_manual_review: bool,
    pub discovered_at: DateTime<Utc>,
}

/// A related paper normalized from any discovery source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredPaper {
    pub id: Uuid,
    pub title: String,
    pub authors: Vec<String>,
    pub venue: Option<String>,
    pub year: Option<i32>,
    pub doi: Option<String>,
    pub url: Option<String>,
    pub r#abstract: Option<String>,
    pub source: SourceType,
    pub relationship: RelationshipType,
    pub relevance_score: f64,
    pub citation_count: Option<u32>,
    pub influential_citation_count: Option<u32>,
    pub metadata: DiscoveryMetadata,
    pub last_accessed_at: Option<DateTime<Utc>>,
}

impl DiscoveredPaper {
    /// Normalize a source record.
    ///
    /// Scores the source did not supply fall back to `default_relevance` and
    /// `default_confidence`. Records with low confidence or without a title or
    /// authors are flagged for manual review.
    pub fn from_source_record(
        record: Paper,
        relationship: RelationshipType,
        query: &str,
        rank_position: usize,
        default_relevance: f64,
        default_confidence: f64,
    ) -> Self {
        let relevance_score = record.relevance.unwrap_or(default_relevance).clamp(0.0, 1.0);
        let api_confidence = record
            .confidence
            .unwrap_or(default_confidence)
            .clamp(0.0, 1.0);
        let requires_manual_review = api_confidence < LOW_CONFIDENCE_THRESHOLD
            || record.title.trim().is_empty()
            || record.authors.is_empty();

        Self {
            id: Uuid::new_v4(),
            title: record.title,
            authors: record.authors,
            venue: record.venue,
            year: record.year,
            doi: record.doi,
            url: record.url,
            r#abstract: record.r#abstract,
            source: record.source,
            relationship,
            relevance_score,
            citation_count: record.citations,
            influential_citation_count: record.influential_citations,
            metadata: DiscoveryMetadata {
                query: query.to_string(),
                api_confidence,
                rank_position,
                requires_manual_review,
                discovered_at: Utc::now(),
            },
            last_accessed_at: None,
        }
    }

    /// Record that the paper was shown to a user
    pub fn touch(&mut self) {
        self.last_accessed_at = Some(Utc::now());
    }

    pub fn requires_review(&self) -> bool {
        self.metadata.requires_manual_review
    }
}

/// Aggregate outcome of one discovery run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelatedPaperDiscoveryResult {
    pub source_title: String,
    pub source_doi: Option<String>,
    pub discovered_papers: Vec<DiscoveredPaper>,
    pub papers_by_source: BTreeMap<String, usize>,
    pub papers_by_relationship: BTreeMap<RelationshipType, usize>,
    pub overall_confidence_score: f64,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub requires_user_review: bool,
    /// Narrative summary produced by the synthesis agent, when enabled
    pub synthesis: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl RelatedPaperDiscoveryResult {
    pub fn total_papers(&self) -> usize {
        self.discovered_papers.len()
    }

    /// True when at least one source failed
    pub fn is_partial(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn duration(&self) -> chrono::Duration {
        self.completed_at - self.started_at
    }
}

/// Mean relevance across papers, clamped to [0, 1]; 0.0 when there are none
pub fn overall_confidence(papers: &[DiscoveredPaper]) -> f64 {
    if papers.is_empty() {
        return 0.0;
    }
    let total: f64 = papers.iter().map(|p| p.relevance_score).sum();
    (total / papers.len() as f64).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PaperBuilder;

    fn record(relevance: Option<f64>) -> Paper {
        let builder = PaperBuilder::new("p1", "A Paper", SourceType::CrossRef).authors(["A. Author"]);
        match relevance {
            Some(r) => builder.relevance(r).build(),
            None => builder.build(),
        }
    }

    #[test]
    fn test_default_config_values() {
        let config = DiscoveryConfiguration::default_config();
        assert_eq!(
            config.enabled_sources,
            [SourceType::CrossRef, SourceType::SemanticScholar]
                .into_iter()
                .collect()
        );
        assert_eq!(
            config.relationship_types,
            [
                RelationshipType::Cites,
                RelationshipType::CitedBy,
                RelationshipType::SemanticSimilarity
            ]
            .into_iter()
            .collect()
        );
        assert_eq!(config.max_papers_per_source, 25);
        assert_eq!(config.max_total_papers, 100);
        assert_eq!(config.minimum_relevance_score, 0.3);
        assert_eq!(config.timeout_seconds, 300);
        assert!(config.is_valid());
    }

    #[test]
    fn test_fast_config_values() {
        let config = DiscoveryConfiguration::fast_config();
        assert_eq!(config.enabled_sources.len(), 1);
        assert!(config.enabled_sources.contains(&SourceType::CrossRef));
        assert_eq!(config.max_total_papers, 25);
        assert_eq!(config.timeout_seconds, 60);
        assert!(!config.parallel_execution);
    }

    #[test]
    fn test_validate_reports_every_violation() {
        let config = DiscoveryConfiguration {
            enabled_sources: BTreeSet::new(),
            relationship_types: BTreeSet::new(),
            max_papers_per_source: 0,
            max_total_papers: 0,
            minimum_relevance_score: 1.5,
            timeout_seconds: 0,
            ..DiscoveryConfiguration::default_config()
        };
        assert_eq!(config.validate().len(), 6);
    }

    #[test]
    fn test_normalization_applies_defaults_and_review_flag() {
        let paper = DiscoveredPaper::from_source_record(
            record(None),
            RelationshipType::Cites,
            "10.1/x",
            3,
            0.7,
            0.4,
        );
        assert_eq!(paper.relevance_score, 0.7);
        assert_eq!(paper.metadata.rank_position, 3);
        assert!(paper.requires_review());

        let confident = DiscoveredPaper::from_source_record(
            record(Some(0.9)),
            RelationshipType::Cites,
            "10.1/x",
            1,
            0.7,
            0.9,
        );
        assert_eq!(confident.relevance_score, 0.9);
        assert!(!confident.requires_review());
    }

    #[test]
    fn test_touch_sets_last_accessed() {
        let mut paper = DiscoveredPaper::from_source_record(
            record(None),
            RelationshipType::CitedBy,
            "q",
            1,
            0.5,
            0.9,
        );
        assert!(paper.last_accessed_at.is_none());
        paper.touch();
        assert!(paper.last_accessed_at.is_some());
    }

    #[test]
    fn test_overall_confidence_mean_and_empty() {
        assert_eq!(overall_confidence(&[]), 0.0);

        let papers: Vec<_> = [0.2, 0.4, 0.9]
            .into_iter()
            .map(|r| {
                DiscoveredPaper::from_source_record(
                    record(Some(r)),
                    RelationshipType::Cites,
                    "q",
                    1,
                    0.5,
                    0.9,
                )
            })
            .collect();
        assert!((overall_confidence(&papers) - 0.5).abs() < 1e-9);
    }
}
