use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::cycle::CycleDetector;
use crate::error::GraphError;
use crate::models::{BranchTriggers, CreateRoadmapInput, Phase, RoadmapStep, StepStatus};

/// The authoritative document describing one roadmap tree.
///
/// A manifest only ever holds a validated graph: steps reference existing
/// steps and declared phases and nobody depends on itself. The step
/// dependency relation, the parent hierarchy and the phase prerequisite
/// relation are all acyclic.
/// Structural changes go through [`RoadmapManifest::replace_graph`], which
/// installs a complete new snapshot or leaves the manifest untouched.
///
/// Status changes are not structural and use the narrower
/// [`set_status`](Self::set_status) / [`triggers_mut`](Self::triggers_mut)
/// entry points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoadmapManifest {
    tree_id: Uuid,
    user_id: Uuid,
    goal: String,
    version: u64,
    phases: Vec<Phase>,
    steps: Vec<RoadmapStep>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl RoadmapManifest {
    /// Build a new manifest at version 0. The repository assigns version 1 on create.
    pub fn new(
        user_id: Uuid,
        goal: impl Into<String>,
        phases: Vec<Phase>,
        steps: Vec<RoadmapStep>,
    ) -> Result<Self, GraphError> {
        validate_snapshot(&phases, &steps)?;
        let now = Utc::now();
        Ok(Self {
            tree_id: Uuid::new_v4(),
            user_id,
            goal: goal.into(),
            version: 0,
            phases,
            steps,
            created_at: now,
            updated_at: now,
        })
    }

    /// Build a manifest from keyed step drafts, assigning a fresh UUID per key.
    pub fn from_input(
        user_id: Uuid,
        input: CreateRoadmapInput,
        expansion_trigger: u32,
    ) -> Result<Self, InputError> {
        let mut ids: HashMap<String, Uuid> = HashMap::new();
        for draft in &input.steps {
            if ids.insert(draft.key.clone(), Uuid::new_v4()).is_some() {
                return Err(InputError::DuplicateKey(draft.key.clone()));
            }
        }
        let resolve = |key: &str| {
            ids.get(key)
                .copied()
                .ok_or_else(|| InputError::UnknownKey(key.to_string()))
        };

        let mut steps = Vec::with_capacity(input.steps.len());
        for draft in input.steps.iter() {
            let id = resolve(draft.key.as_str())?;
            let dependencies = draft
                .depends_on
                .iter()
                .map(|key| resolve(key.as_str()))
                .collect::<Result<BTreeSet<_>, _>>()?;
            let parent_id = draft.parent.as_deref().map(resolve).transpose()?;
            steps.push(RoadmapStep {
                id,
                parent_id,
                title: draft.title.clone(),
                description: draft.description.clone(),
                dependencies,
                status: StepStatus::Pending,
                phase: draft.phase.clone(),
                is_major_phase: draft.is_major_phase,
                branch_triggers: BranchTriggers::with_threshold(expansion_trigger),
                metadata: draft.metadata.clone(),
                completed_at: None,
            });
        }

        Ok(Self::new(user_id, input.goal, input.phases, steps)?)
    }

    pub fn tree_id(&self) -> Uuid {
        self.tree_id
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn goal(&self) -> &str {
        &self.goal
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn steps(&self) -> &[RoadmapStep] {
        &self.steps
    }

    pub fn step(&self, id: Uuid) -> Option<&RoadmapStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn phase(&self, id: &str) -> Option<&Phase> {
        self.phases.iter().find(|p| p.id == id)
    }

    pub fn contains_step(&self, id: Uuid) -> bool {
        self.step(id).is_some()
    }

    pub fn step_ids(&self) -> BTreeSet<Uuid> {
        self.steps.iter().map(|s| s.id).collect()
    }

    /// Dependency edges as `(dependent, dependency)` pairs.
    pub fn edges(&self) -> impl Iterator<Item = (Uuid, Uuid)> + '_ {
        self.steps
            .iter()
            .flat_map(|s| s.dependencies.iter().map(move |d| (s.id, *d)))
    }

    /// Direct children of `parent_id` in the step hierarchy.
    pub fn children(&self, parent_id: Uuid) -> impl Iterator<Item = &RoadmapStep> + '_ {
        self.steps
            .iter()
            .filter(move |s| s.parent_id == Some(parent_id))
    }

    /// Steps sharing `step_id`'s parent, including the step itself.
    ///
    /// Top-level steps have no siblings for branch bookkeeping and yield only
    /// themselves.
    pub fn siblings(&self, step_id: Uuid) -> Vec<&RoadmapStep> {
        match self.step(step_id) {
            Some(RoadmapStep {
                parent_id: Some(parent),
                ..
            }) => self.children(*parent).collect(),
            Some(step) => vec![step],
            None => Vec::new(),
        }
    }

    pub fn steps_in_phase<'a>(
        &'a self,
        phase_id: &'a str,
    ) -> impl Iterator<Item = &'a RoadmapStep> + 'a {
        self.steps.iter().filter(move |s| s.phase == phase_id)
    }

    /// Unfinished steps whose dependencies have all finished.
    pub fn ready_steps(&self) -> Vec<&RoadmapStep> {
        self.steps
            .iter()
            .filter(|s| !s.is_finished())
            .filter(|s| self.unfinished_dependencies(s.id).is_empty())
            .collect()
    }

    /// Dependencies of `step_id` that are neither completed nor skipped.
    pub fn unfinished_dependencies(&self, step_id: Uuid) -> Vec<Uuid> {
        let Some(step) = self.step(step_id) else {
            return Vec::new();
        };
        step.dependencies
            .iter()
            .filter(|dep| self.step(**dep).map_or(true, |d| !d.is_finished()))
            .copied()
            .collect()
    }

    /// Steps whose expansion trigger is raised.
    pub fn expansion_ready(&self) -> Vec<&RoadmapStep> {
        self.steps
            .iter()
            .filter(|s| s.branch_triggers.expand_now)
            .collect()
    }

    /// A detector loaded with the current dependency graph.
    pub fn cycle_detector(&self) -> CycleDetector<Uuid> {
        CycleDetector::from_edges(self.steps.iter().map(|s| s.id), self.edges())
    }

    /// Re-check every invariant of the current snapshot.
    pub fn validate(&self) -> Result<(), GraphError> {
        validate_snapshot(&self.phases, &self.steps)
    }

    /// Replace the whole step and phase set, provided the result is valid.
    ///
    /// On error the manifest is unchanged.
    pub fn replace_graph(
        &mut self,
        phases: Vec<Phase>,
        steps: Vec<RoadmapStep>,
    ) -> Result<(), GraphError> {
        validate_snapshot(&phases, &steps)?;
        self.phases = phases;
        self.steps = steps;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Set a step's status, returning the previous one.
    pub fn set_status(
        &mut self,
        step_id: Uuid,
        status: StepStatus,
        at: DateTime<Utc>,
    ) -> Result<StepStatus, GraphError> {
        let step = self
            .steps
            .iter_mut()
            .find(|s| s.id == step_id)
            .ok_or(GraphError::StepNotFound(step_id))?;
        let previous = step.status;
        step.status = status;
        step.completed_at = match status {
            StepStatus::Completed => Some(at),
            _ => None,
        };
        self.updated_at = at;
        Ok(previous)
    }

    pub fn triggers_mut(&mut self, step_id: Uuid) -> Result<&mut BranchTriggers, GraphError> {
        self.steps
            .iter_mut()
            .find(|s| s.id == step_id)
            .map(|s| &mut s.branch_triggers)
            .ok_or(GraphError::StepNotFound(step_id))
    }

    /// Stamp the version a repository accepted this manifest at.
    pub fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

/// Errors turning a [`CreateRoadmapInput`] into a manifest.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InputError {
    #[error("duplicate step key '{0}'")]
    DuplicateKey(String),

    #[error("unknown step key '{0}'")]
    UnknownKey(String),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Check every manifest invariant over a prospective snapshot.
fn validate_snapshot(phases: &[Phase], steps: &[RoadmapStep]) -> Result<(), GraphError> {
    let mut phase_ids: BTreeMap<&str, &Phase> = BTreeMap::new();
    for phase in phases {
        if phase_ids.insert(phase.id.as_str(), phase).is_some() {
            return Err(GraphError::DuplicatePhase(phase.id.clone()));
        }
    }
    for phase in phases {
        for prerequisite in &phase.prerequisites {
            if !phase_ids.contains_key(prerequisite.as_str()) {
                return Err(GraphError::UnknownPrerequisite {
                    phase: phase.id.clone(),
                    prerequisite: prerequisite.clone(),
                });
            }
        }
    }
    let phase_graph = CycleDetector::from_edges(
        phase_ids.keys().copied(),
        phases.iter().flat_map(|p| {
            p.prerequisites
                .iter()
                .map(move |pre| (p.id.as_str(), pre.as_str()))
        }),
    );
    if let Some(cycle) = phase_graph.find_cycles().into_iter().next() {
        return Err(GraphError::PhaseCycle(cycle.map(str::to_string)));
    }

    let mut step_ids: HashSet<Uuid> = HashSet::with_capacity(steps.len());
    for step in steps {
        if !step_ids.insert(step.id) {
            return Err(GraphError::DuplicateStep(step.id));
        }
    }
    for step in steps {
        if !phase_ids.contains_key(step.phase.as_str()) {
            return Err(GraphError::UnknownPhase {
                step: step.id,
                phase: step.phase.clone(),
            });
        }
        if let Some(parent) = step.parent_id {
            if !step_ids.contains(&parent) {
                return Err(GraphError::UnknownParent {
                    step: step.id,
                    parent,
                });
            }
        }
        for dependency in &step.dependencies {
            if *dependency == step.id {
                return Err(GraphError::SelfDependency { step: step.id });
            }
            if !step_ids.contains(dependency) {
                return Err(GraphError::UnknownDependency {
                    step: step.id,
                    dependency: *dependency,
                });
            }
        }
    }

    let hierarchy = CycleDetector::from_edges(
        steps.iter().map(|s| s.id),
        steps
            .iter()
            .filter_map(|s| s.parent_id.map(|parent| (s.id, parent))),
    );
    if let Some(cycle) = hierarchy.find_cycles().into_iter().next() {
        return Err(GraphError::ParentCycle(cycle));
    }

    let detector = CycleDetector::from_edges(
        steps.iter().map(|s| s.id),
        steps
            .iter()
            .flat_map(|s| s.dependencies.iter().map(move |d| (s.id, *d))),
    );
    match detector.find_cycles().into_iter().next() {
        Some(cycle) => Err(GraphError::Cycle(cycle)),
        None => Ok(()),
    }
}
