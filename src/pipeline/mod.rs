//! Dependency-ordered stage pipeline.
//!
//! [`PipelineOrchestrator`] turns a [`PipelineConfiguration`] into a
//! [`StageGraph`], dispatches ready stages onto a bounded set of tasks and
//! rolls their [`StageResult`]s up into a [`PipelineRun`].

mod events;
mod graph;
mod orchestrator;
mod stage;

pub use events::{EventBus, EventKind, PipelineEvent};
pub use graph::{default_definitions, StageGraph};
pub use orchestrator::{CreditGate, PipelineOrchestrator, UserContext};
pub use stage::{
    AgentStageHandler, DiscoveryStageHandler, StageError, StageExecutor, StageHandler, StageInput,
    StageOutput,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agents::MetricsSnapshot;
use crate::models::{
    DocumentStatus, PipelineConfiguration, PipelineStatus, RelatedPaperDiscoveryResult, StageResult,
    StageType,
};

/// Errors returned before any stage runs
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PipelineError {
    #[error("Invalid pipeline configuration: {}", .0.join("; "))]
    InvalidConfiguration(Vec<String>),

    #[error("No definition for stage {0}")]
    UnknownStage(StageType),

    #[error("Stage {stage} requires {prerequisite}, which is not part of the configuration")]
    MissingPrerequisite {
        stage: StageType,
        prerequisite: StageType,
    },

    #[error("Cyclic stage dependencies between {}", join_stages(.0))]
    CyclicDependency(Vec<StageType>),

    #[error("Run rejected: {0}")]
    Rejected(String),
}

fn join_stages(stages: &[StageType]) -> String {
    stages
        .iter()
        .map(StageType::id)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Everything one pipeline run produced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: Uuid,
    pub configuration: PipelineConfiguration,
    pub status: PipelineStatus,
    pub progress: u8,
    pub document_status: DocumentStatus,
    /// Why the run failed, for `Failed` runs
    pub failure: Option<String>,
    /// Results in completion order, explicit skips first
    pub stage_results: Vec<StageResult>,
    /// Stages skipped by configuration or carried on without after failing
    pub skipped_stages: Vec<StageType>,
    /// Stages aborted while in flight
    pub cancelled_stages: Vec<StageType>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub metrics: MetricsSnapshot,
}

impl PipelineRun {
    pub fn result(&self, stage: StageType) -> Option<&StageResult> {
        self.stage_results.iter().find(|r| r.stage == stage)
    }

    pub fn is_success(&self) -> bool {
        self.status == PipelineStatus::Completed
    }

    /// The discovery stage's result, when it ran and succeeded
    pub fn discovery_result(&self) -> Option<RelatedPaperDiscoveryResult> {
        let result = self.result(StageType::RelatedPaperDiscovery)?;
        if !result.success || result.skipped {
            return None;
        }
        result
            .result_data
            .get("discovery")
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    pub fn duration(&self) -> chrono::Duration {
        self.completed_at - self.started_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let cycle = PipelineError::CyclicDependency(vec![
            StageType::PaperProcessing,
            StageType::QualityCheck,
        ]);
        assert_eq!(
            cycle.to_string(),
            "Cyclic stage dependencies between paper_processing, quality_check"
        );

        let invalid = PipelineError::InvalidConfiguration(vec!["a".into(), "b".into()]);
        assert_eq!(invalid.to_string(), "Invalid pipeline configuration: a; b");
    }
}
