use thiserror::Error;
use uuid::Uuid;

use crate::graph::Cycle;

/// Structural violations of the roadmap graph invariants.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GraphError {
    #[error("step {step} depends on itself")]
    SelfDependency { step: Uuid },

    #[error("step {step} depends on unknown step {dependency}")]
    UnknownDependency { step: Uuid, dependency: Uuid },

    #[error("step {step} has unknown parent {parent}")]
    UnknownParent { step: Uuid, parent: Uuid },

    #[error("step hierarchy loops back on itself: {0}")]
    ParentCycle(Cycle<Uuid>),

    #[error("step {step} belongs to undeclared phase '{phase}'")]
    UnknownPhase { step: Uuid, phase: String },

    #[error("duplicate step id {0}")]
    DuplicateStep(Uuid),

    #[error("duplicate phase id '{0}'")]
    DuplicatePhase(String),

    #[error("phase '{phase}' requires unknown phase '{prerequisite}'")]
    UnknownPrerequisite { phase: String, prerequisite: String },

    #[error("phase prerequisites form a cycle: {0}")]
    PhaseCycle(Cycle<String>),

    #[error("dependency cycle: {0}")]
    Cycle(Cycle<Uuid>),

    #[error("step {0} not found")]
    StepNotFound(Uuid),
}

/// Repository failures.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("manifest for tree {tree_id} diverges from the persisted tree: {details}")]
    Consistency { tree_id: Uuid, details: String },

    #[error("corrupt {what}")]
    Corrupt { what: String },

    #[error("tree {0} already exists")]
    TreeExists(Uuid),

    #[error(transparent)]
    Migration(#[from] anyhow::Error),
}

impl RepositoryError {
    /// Divergence between stored representations, never repaired automatically.
    pub fn is_consistency(&self) -> bool {
        matches!(self, Self::Consistency { .. } | Self::Corrupt { .. } | Self::Json(_))
    }
}
