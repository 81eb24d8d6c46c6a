//! Core data models for pipeline runs, agent calls and paper discovery.

mod call;
mod discovery;
mod paper;
mod pipeline;

pub use call::{CallMetrics, CallResult};
pub use discovery::{
    overall_confidence, DiscoveredPaper, DiscoveryConfiguration, DiscoveryMetadata,
    RelatedPaperDiscoveryResult, RelationshipType, LOW_CONFIDENCE_THRESHOLD,
};
pub use paper::{normalize_doi, Paper, PaperBuilder, SourcePaper, SourceType};
pub use pipeline::{
    AgentType, DocumentContext, DocumentStatus, PipelineConfiguration, PipelineStatus,
    StageDefinition, StageResult, StageType,
};
