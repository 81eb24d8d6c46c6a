//! Stage dependency graph.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use super::PipelineError;
use crate::models::{StageDefinition, StageType};

/// The validated, acyclic set of stages of one configuration
#[derive(Debug, Clone)]
pub struct StageGraph {
    definitions: BTreeMap<StageType, StageDefinition>,
}

impl StageGraph {
    /// Build the graph for `stages`, looking each one up in `definitions`.
    ///
    /// Fails when a stage has no definition, when a prerequisite is not one of
    /// `stages`, or when the prerequisites form a cycle.
    pub fn build(
        stages: &[StageType],
        definitions: &BTreeMap<StageType, StageDefinition>,
    ) -> Result<Self, PipelineError> {
        let mut selected = BTreeMap::new();
        for stage in stages {
            let definition = definitions
                .get(stage)
                .cloned()
                .ok_or(PipelineError::UnknownStage(*stage))?;
            selected.insert(*stage, definition);
        }

        for definition in selected.values() {
            if let Some(missing) = definition
                .prerequisites
                .iter()
                .find(|p| !selected.contains_key(*p))
            {
                return Err(PipelineError::MissingPrerequisite {
                    stage: definition.stage,
                    prerequisite: *missing,
                });
            }
        }

        let graph = Self {
            definitions: selected,
        };
        graph.check_acyclic()?;
        Ok(graph)
    }

    /// Build the graph from the built-in stage definitions
    pub fn with_defaults(stages: &[StageType]) -> Result<Self, PipelineError> {
        Self::build(stages, &default_definitions())
    }

    /// Kahn's algorithm; whatever never reaches in-degree zero sits on a cycle
    fn check_acyclic(&self) -> Result<(), PipelineError> {
        let mut in_degree = self.in_degrees();
        let dependents = self.dependents();

        let mut queue: VecDeque<StageType> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(stage, _)| *stage)
            .collect();
        let mut visited = 0;

        while let Some(stage) = queue.pop_front() {
            visited += 1;
            for dependent in dependents.get(&stage).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(*dependent);
                    }
                }
            }
        }

        if visited == self.definitions.len() {
            Ok(())
        } else {
            Err(PipelineError::CyclicDependency(
                in_degree
                    .into_iter()
                    .filter(|(_, degree)| *degree > 0)
                    .map(|(stage, _)| stage)
                    .collect(),
            ))
        }
    }

    /// Distinct prerequisite count per stage
    fn in_degrees(&self) -> BTreeMap<StageType, usize> {
        self.definitions
            .iter()
            .map(|(stage, definition)| {
                let distinct: BTreeSet<_> = definition.prerequisites.iter().collect();
                (*stage, distinct.len())
            })
            .collect()
    }

    fn dependents(&self) -> BTreeMap<StageType, BTreeSet<StageType>> {
        let mut dependents: BTreeMap<StageType, BTreeSet<StageType>> = BTreeMap::new();
        for (stage, definition) in &self.definitions {
            for prerequisite in &definition.prerequisites {
                dependents.entry(*prerequisite).or_default().insert(*stage);
            }
        }
        dependents
    }

    /// Stages not yet started whose prerequisites have all completed, highest priority first
    pub fn ready(
        &self,
        completed: &HashSet<StageType>,
        started: &HashSet<StageType>,
    ) -> Vec<&StageDefinition> {
        let mut ready: Vec<&StageDefinition> = self
            .definitions
            .values()
            .filter(|d| !started.contains(&d.stage))
            .filter(|d| d.prerequisites.iter().all(|p| completed.contains(p)))
            .collect();
        ready.sort_by(|a, b| b.priority.cmp(&a.priority));
        ready
    }

    /// Dispatch waves ignoring concurrency limits: every stage of a wave only
    /// depends on stages of earlier waves
    pub fn waves(&self) -> Vec<Vec<StageType>> {
        let mut completed = HashSet::new();
        let mut waves = Vec::new();

        while completed.len() < self.definitions.len() {
            let wave: Vec<StageType> = self
                .ready(&completed, &completed)
                .into_iter()
                .map(|d| d.stage)
                .collect();
            if wave.is_empty() {
                break;
            }
            completed.extend(wave.iter().copied());
            waves.push(wave);
        }

        waves
    }

    pub fn definition(&self, stage: StageType) -> Option<&StageDefinition> {
        self.definitions.get(&stage)
    }

    pub fn stages(&self) -> impl Iterator<Item = &StageDefinition> {
        self.definitions.values()
    }

    pub fn contains(&self, stage: StageType) -> bool {
        self.definitions.contains_key(&stage)
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

/// Built-in definition of every stage type
pub fn default_definitions() -> BTreeMap<StageType, StageDefinition> {
    StageType::ALL
        .iter()
        .map(|stage| (*stage, StageDefinition::for_stage(*stage)))
        .collect()
}
