//! Pipeline models: stages, agents, configurations, statuses and stage results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::Duration;

use super::paper::SourcePaper;

/// A logical capability invoked through the provider chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentType {
    PaperProcessor,
    MetadataEnhancer,
    ContentSummarizer,
    ConceptExplainer,
    CitationFormatter,
    QualityChecker,
    RelatedPaperDiscovery,
}

impl AgentType {
    pub fn id(&self) -> &'static str {
        match self {
            AgentType::PaperProcessor => "paper_processor",
            AgentType::MetadataEnhancer => "metadata_enhancer",
            AgentType::ContentSummarizer => "content_summarizer",
            AgentType::ConceptExplainer => "concept_explainer",
            AgentType::CitationFormatter => "citation_formatter",
            AgentType::QualityChecker => "quality_checker",
            AgentType::RelatedPaperDiscovery => "related_paper_discovery",
        }
    }

    /// Task description sent to providers for this agent
    pub fn instructions(&self) -> &'static str {
        match self {
            AgentType::PaperProcessor => {
                "Clean the extracted text of the paper and split it into its logical sections."
            }
            AgentType::MetadataEnhancer => {
                "Complete the bibliographic metadata of the paper: title, authors, venue, year and DOI."
            }
            AgentType::ContentSummarizer => {
                "Summarize the paper: research question, methods, key findings and limitations."
            }
            AgentType::ConceptExplainer => {
                "Identify the key technical concepts of the paper and explain each one briefly."
            }
            AgentType::CitationFormatter => {
                "Extract the reference list of the paper and format each entry consistently."
            }
            AgentType::QualityChecker => {
                "Review the generated analysis for accuracy, completeness and consistency with the paper."
            }
            AgentType::RelatedPaperDiscovery => {
                "Synthesize how the listed related papers connect to the source paper."
            }
        }
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

/// A phase of document processing
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageType {
    PaperProcessing,
    MetadataEnhancement,
    ContentAnalysis,
    ConceptExtraction,
    CitationProcessing,
    QualityCheck,
    RelatedPaperDiscovery,
}

impl StageType {
    pub const ALL: [StageType; 7] = [
        StageType::PaperProcessing,
        StageType::MetadataEnhancement,
        StageType::ContentAnalysis,
        StageType::ConceptExtraction,
        StageType::CitationProcessing,
        StageType::QualityCheck,
        StageType::RelatedPaperDiscovery,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            StageType::PaperProcessing => "paper_processing",
            StageType::MetadataEnhancement => "metadata_enhancement",
            StageType::ContentAnalysis => "content_analysis",
            StageType::ConceptExtraction => "concept_extraction",
            StageType::CitationProcessing => "citation_processing",
            StageType::QualityCheck => "quality_check",
            StageType::RelatedPaperDiscovery => "related_paper_discovery",
        }
    }

    /// The agent a stage is bound to by default
    pub fn default_agent(&self) -> AgentType {
        match self {
            StageType::PaperProcessing => AgentType::PaperProcessor,
            StageType::MetadataEnhancement => AgentType::MetadataEnhancer,
            StageType::ContentAnalysis => AgentType::ContentSummarizer,
            StageType::ConceptExtraction => AgentType::ConceptExplainer,
            StageType::CitationProcessing => AgentType::CitationFormatter,
            StageType::QualityCheck => AgentType::QualityChecker,
            StageType::RelatedPaperDiscovery => AgentType::RelatedPaperDiscovery,
        }
    }

    /// Pipeline status reported while this stage runs
    pub fn running_status(&self) -> PipelineStatus {
        match self {
            StageType::PaperProcessing => PipelineStatus::ProcessingPaper,
            StageType::MetadataEnhancement => PipelineStatus::EnhancingMetadata,
            StageType::ContentAnalysis => PipelineStatus::AnalyzingContent,
            StageType::ConceptExtraction => PipelineStatus::ExtractingConcepts,
            StageType::CitationProcessing => PipelineStatus::ProcessingCitations,
            StageType::QualityCheck => PipelineStatus::CheckingQuality,
            StageType::RelatedPaperDiscovery => PipelineStatus::DiscoveringPapers,
        }
    }
}

impl std::fmt::Display for StageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

/// How one stage is scheduled and executed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDefinition {
    pub stage: StageType,
    pub agent: AgentType,
    pub prerequisites: Vec<StageType>,
    pub parallel: bool,
    pub required: bool,
    pub retryable: bool,
    /// Higher runs first among ready stages
    pub priority: i32,
    pub estimated_duration_secs: u64,
    /// Budget for the whole stage, retries included
    pub max_duration_secs: u64,
    pub max_retries: u32,
}

impl StageDefinition {
    /// Built-in definition for a stage type
    pub fn for_stage(stage: StageType) -> Self {
        use StageType::*;

        let (prerequisites, parallel, required, retryable, priority, estimated, max, retries) =
            match stage {
                PaperProcessing => (vec![], false, true, true, 100, 30, 120, 2),
                MetadataEnhancement => (vec![PaperProcessing], true, false, true, 90, 20, 90, 1),
                ContentAnalysis => (vec![PaperProcessing], true, true, true, 80, 60, 240, 2),
                ConceptExtraction => (vec![ContentAnalysis], true, false, true, 70, 45, 180, 1),
                CitationProcessing => (vec![PaperProcessing], true, false, true, 60, 40, 180, 1),
                QualityCheck => (vec![ContentAnalysis], true, false, false, 50, 30, 120, 0),
                RelatedPaperDiscovery => {
                    (vec![MetadataEnhancement], true, false, true, 40, 90, 300, 1)
                }
            };

        Self {
            stage,
            agent: stage.default_agent(),
            prerequisites,
            parallel,
            required,
            retryable,
            priority,
            estimated_duration_secs: estimated,
            max_duration_secs: max,
            max_retries: retries,
        }
    }

    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_secs)
    }

    pub fn estimated_duration(&self) -> Duration {
        Duration::from_secs(self.estimated_duration_secs)
    }

    /// Total attempts the stage executor may make
    pub fn max_attempts(&self) -> u32 {
        if self.retryable {
            self.max_retries + 1
        } else {
            1
        }
    }

    pub fn with_prerequisites(mut self, prerequisites: Vec<StageType>) -> Self {
        self.prerequisites = prerequisites;
        self
    }

    pub fn with_max_duration(mut self, duration: Duration) -> Self {
        self.max_duration_secs = duration.as_secs().max(1);
        self
    }
}

/// Named bundle of stages, agents and limits for one pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfiguration {
    pub name: String,
    pub required_stages: Vec<StageType>,
    pub enabled_agents: BTreeSet<AgentType>,
    pub enable_citation_processing: bool,
    pub enable_quality_checking: bool,
    pub enable_paper_discovery: bool,
    pub max_concurrent_agents: usize,
    pub timeout_minutes: u64,
}

impl PipelineConfiguration {
    fn from_stages(
        name: &str,
        stages: &[StageType],
        max_concurrent_agents: usize,
        timeout_minutes: u64,
    ) -> Self {
        Self {
            name: name.to_string(),
            required_stages: stages.to_vec(),
            enabled_agents: stages.iter().map(StageType::default_agent).collect(),
            enable_citation_processing: stages.contains(&StageType::CitationProcessing),
            enable_quality_checking: stages.contains(&StageType::QualityCheck),
            enable_paper_discovery: stages.contains(&StageType::RelatedPaperDiscovery),
            max_concurrent_agents,
            timeout_minutes,
        }
    }

    /// Text cleanup and summary only
    pub fn fast_processing() -> Self {
        Self::from_stages(
            "fast",
            &[StageType::PaperProcessing, StageType::ContentAnalysis],
            1,
            3,
        )
    }

    pub fn quick_analysis() -> Self {
        Self::from_stages(
            "quick",
            &[
                StageType::PaperProcessing,
                StageType::MetadataEnhancement,
                StageType::ContentAnalysis,
            ],
            2,
            5,
        )
    }

    pub fn comprehensive_analysis() -> Self {
        Self::from_stages(
            "comprehensive",
            &[
                StageType::PaperProcessing,
                StageType::MetadataEnhancement,
                StageType::ContentAnalysis,
                StageType::ConceptExtraction,
                StageType::CitationProcessing,
                StageType::QualityCheck,
            ],
            4,
            15,
        )
    }

    pub fn research_grade_analysis() -> Self {
        Self::from_stages("research-grade", &StageType::ALL, 6, 20)
    }

    /// Look up a preset by name
    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "fast" => Some(Self::fast_processing()),
            "quick" => Some(Self::quick_analysis()),
            "comprehensive" => Some(Self::comprehensive_analysis()),
            "research-grade" | "research_grade" | "research" => {
                Some(Self::research_grade_analysis())
            }
            _ => None,
        }
    }

    pub fn presets() -> Vec<Self> {
        vec![
            Self::fast_processing(),
            Self::quick_analysis(),
            Self::comprehensive_analysis(),
            Self::research_grade_analysis(),
        ]
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_minutes.saturating_mul(60))
    }

    /// Whether a feature toggle switches this stage off
    pub fn stage_toggled_off(&self, stage: StageType) -> bool {
        match stage {
            StageType::CitationProcessing => !self.enable_citation_processing,
            StageType::QualityCheck => !self.enable_quality_checking,
            StageType::RelatedPaperDiscovery => !self.enable_paper_discovery,
            _ => false,
        }
    }

    /// Returns every violated constraint; an empty list means the configuration is usable
    pub fn validate(&self) -> Vec<String> {
        self.validate_with_definitions(&BTreeMap::new())
    }

    /// Like [`validate`](Self::validate), with `definitions` replacing the
    /// built-in definitions of the stages they name
    pub fn validate_with_definitions(
        &self,
        definitions: &BTreeMap<StageType, StageDefinition>,
    ) -> Vec<String> {
        let mut violations = Vec::new();

        if self.required_stages.is_empty() {
            violations.push("at least one stage must be configured".to_string());
        }

        let mut seen = HashSet::new();
        for stage in &self.required_stages {
            if !seen.insert(*stage) {
                violations.push(format!("stage {} is listed more than once", stage));
            }
            let definition = definitions
                .get(stage)
                .cloned()
                .unwrap_or_else(|| StageDefinition::for_stage(*stage));
            if definition.required && !self.enabled_agents.contains(&definition.agent) {
                violations.push(format!(
                    "required stage {} is bound to disabled agent {}",
                    stage, definition.agent
                ));
            }
        }

        if self.max_concurrent_agents == 0 {
            violations.push("max concurrent agents must be positive".to_string());
        }
        if self.timeout_minutes == 0 {
            violations.push("timeout must be positive".to_string());
        }

        violations
    }
}

/// Lifecycle of a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStatus {
    Pending,
    Initializing,
    ProcessingPaper,
    EnhancingMetadata,
    AnalyzingContent,
    ExtractingConcepts,
    ProcessingCitations,
    CheckingQuality,
    DiscoveringPapers,
    Completed,
    Failed,
    Cancelled,
}

impl PipelineStatus {
    pub fn progress(&self) -> u8 {
        match self {
            PipelineStatus::Pending => 0,
            PipelineStatus::Initializing => 5,
            PipelineStatus::ProcessingPaper => 15,
            PipelineStatus::EnhancingMetadata => 30,
            PipelineStatus::AnalyzingContent => 45,
            PipelineStatus::ExtractingConcepts => 60,
            PipelineStatus::ProcessingCitations => 70,
            PipelineStatus::CheckingQuality => 80,
            PipelineStatus::DiscoveringPapers => 90,
            PipelineStatus::Completed => 100,
            PipelineStatus::Failed | PipelineStatus::Cancelled => 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineStatus::Completed | PipelineStatus::Failed | PipelineStatus::Cancelled
        )
    }

    /// Status shown for the document by storage and UI collaborators
    pub fn document_status(&self) -> DocumentStatus {
        match self {
            PipelineStatus::Pending => DocumentStatus::Pending,
            PipelineStatus::Completed => DocumentStatus::Processed,
            PipelineStatus::Failed => DocumentStatus::Failed,
            PipelineStatus::Cancelled => DocumentStatus::Cancelled,
            _ => DocumentStatus::Processing,
        }
    }
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} ({}%)", self, self.progress())
    }
}

/// Externally visible processing state of a document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Processed,
    Failed,
    Cancelled,
}

/// The document a pipeline run processes, as handed over by storage
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentContext {
    pub document_id: String,
    pub title: String,
    pub authors: Vec<String>,
    pub doi: Option<String>,
    pub year: Option<i32>,
    pub venue: Option<String>,
    pub r#abstract: Option<String>,
    /// Extracted full text
    pub text: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl DocumentContext {
    pub fn new(document_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_doi(mut self, doi: impl Into<String>) -> Self {
        self.doi = Some(doi.into());
        self
    }

    /// The paper discovery starts from
    pub fn source_paper(&self) -> SourcePaper {
        let mut paper = SourcePaper::new(self.title.clone()).with_authors(self.authors.clone());
        if let Some(doi) = &self.doi {
            paper = paper.with_doi(doi.clone());
        }
        paper.year = self.year;
        paper.venue = self.venue.clone();
        paper.r#abstract = self.r#abstract.clone();
        paper
    }
}

/// Output of one stage; never mutated after creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: StageType,
    pub agent: AgentType,
    pub success: bool,
    /// Set for explicit skips and for failed stages the pipeline carried on without
    pub skipped: bool,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub attempts: u32,
    pub result_data: HashMap<String, serde_json::Value>,
    pub metrics: HashMap<String, f64>,
}

impl StageResult {
    pub fn success(
        stage: StageType,
        agent: AgentType,
        started_at: DateTime<Utc>,
        attempts: u32,
        result_data: HashMap<String, serde_json::Value>,
        metrics: HashMap<String, f64>,
    ) -> Self {
        Self {
            stage,
            agent,
            success: true,
            skipped: false,
            error_message: None,
            started_at,
            completed_at: Utc::now(),
            attempts,
            result_data,
            metrics,
        }
    }

    pub fn failure(
        stage: StageType,
        agent: AgentType,
        started_at: DateTime<Utc>,
        attempts: u32,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            stage,
            agent,
            success: false,
            skipped: false,
            error_message: Some(error_message.into()),
            started_at,
            completed_at: Utc::now(),
            attempts,
            result_data: HashMap::new(),
            metrics: HashMap::new(),
        }
    }

    /// A stage the configuration does not need; counts as success for scheduling
    pub fn skipped(stage: StageType, agent: AgentType, reason: &str) -> Self {
        let now = Utc::now();
        let mut result_data = HashMap::new();
        result_data.insert(
            "status".to_string(),
            serde_json::Value::String(format!("Skipped: {}", reason)),
        );
        Self {
            stage,
            agent,
            success: true,
            skipped: true,
            error_message: None,
            started_at: now,
            completed_at: now,
            attempts: 0,
            result_data,
            metrics: HashMap::new(),
        }
    }

    /// A failed optional stage the pipeline carries on without
    pub fn into_skipped(self) -> Self {
        Self {
            skipped: true,
            ..self
        }
    }

    /// Whether dependents of this stage may run
    pub fn unblocks_dependents(&self) -> bool {
        self.success || self.skipped
    }

    pub fn duration(&self) -> chrono::Duration {
        self.completed_at - self.started_at
    }

    pub fn skip_reason(&self) -> Option<&str> {
        self.result_data
            .get("status")
            .and_then(|v| v.as_str())
            .and_then(|s| s.strip_prefix("Skipped: "))
    }
}
