use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// A named grouping of steps representing a milestone of the roadmap.
///
/// Steps join a phase by carrying its `id` in their `phase` field. Phases are
/// partially ordered through `prerequisites`, which must stay acyclic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub id: String,
    pub name: String,
    /// Declared position; lower comes first. Used as a ranking tie-break.
    pub order: u32,
    /// Relative weight when ranking next-phase candidates.
    #[serde(default)]
    pub priority: f64,
    #[serde(default)]
    pub prerequisites: BTreeSet<String>,
}

impl Phase {
    pub fn new(id: impl Into<String>, order: u32) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            order,
            priority: 0.0,
            prerequisites: BTreeSet::new(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_priority(mut self, priority: f64) -> Self {
        self.priority = priority;
        self
    }

    pub fn requires(mut self, phase_id: impl Into<String>) -> Self {
        self.prerequisites.insert(phase_id.into());
        self
    }
}
