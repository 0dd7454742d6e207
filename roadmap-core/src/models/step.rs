use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default number of completed branches below a step before it is flagged for
/// expansion.
pub const DEFAULT_EXPANSION_TRIGGER: u32 = 3;

/// A single node of the roadmap graph.
///
/// Steps are arranged in two overlapping structures: a dependency DAG
/// (`dependencies` must all be finished before the step is ready) and a
/// parent/child hierarchy (`parent_id`) used for branch bookkeeping. Every step
/// belongs to exactly one [`Phase`](super::Phase) through its `phase` id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoadmapStep {
    pub id: Uuid,
    /// Parent step in the hierarchy. `None` for top-level steps.
    pub parent_id: Option<Uuid>,
    pub title: String,
    pub description: Option<String>,
    /// Steps that must be completed or skipped before this one.
    #[serde(default)]
    pub dependencies: BTreeSet<Uuid>,
    pub status: StepStatus,
    pub phase: String,
    /// Marks this step as a milestone boundary of its phase.
    #[serde(default)]
    pub is_major_phase: bool,
    #[serde(default)]
    pub branch_triggers: BranchTriggers,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RoadmapStep {
    /// Create a pending step in the given phase with no dependencies.
    pub fn new(title: impl Into<String>, phase: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_id: None,
            title: title.into(),
            description: None,
            dependencies: BTreeSet::new(),
            status: StepStatus::Pending,
            phase: phase.into(),
            is_major_phase: false,
            branch_triggers: BranchTriggers::default(),
            metadata: serde_json::Map::new(),
            completed_at: None,
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn with_parent(mut self, parent_id: Uuid) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn depends_on(mut self, dependency: Uuid) -> Self {
        self.dependencies.insert(dependency);
        self
    }

    pub fn major(mut self) -> Self {
        self.is_major_phase = true;
        self
    }

    pub fn with_status(mut self, status: StepStatus) -> Self {
        self.status = status;
        self
    }

    /// Completed or skipped.
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}

/// The lifecycle state of a step.
///
/// - `Pending`: Not yet started
/// - `InProgress`: Work has begun
/// - `Completed`: Done
/// - `Skipped`: Deliberately not done; counts as finished for dependencies and phases
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Skipped => "skipped",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

/// Counters deciding when a step becomes eligible for branch expansion.
///
/// `current_completion_count` is bumped each time every child of the step has
/// finished. Once it reaches `completion_count_for_expansion_trigger`,
/// `expand_now` is raised and stays up until an expansion under the step
/// consumes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchTriggers {
    pub expand_now: bool,
    pub completion_count_for_expansion_trigger: u32,
    pub current_completion_count: u32,
}

impl Default for BranchTriggers {
    fn default() -> Self {
        Self::with_threshold(DEFAULT_EXPANSION_TRIGGER)
    }
}

impl BranchTriggers {
    pub fn with_threshold(threshold: u32) -> Self {
        Self {
            expand_now: false,
            completion_count_for_expansion_trigger: threshold,
            current_completion_count: 0,
        }
    }

    /// Count one more finished branch. Returns `true` when this raised `expand_now`.
    pub fn record_branch_completion(&mut self) -> bool {
        self.current_completion_count += 1;
        let reached =
            self.current_completion_count >= self.completion_count_for_expansion_trigger;
        let raised = reached && !self.expand_now;
        if reached {
            self.expand_now = true;
        }
        raised
    }

    /// Clear the flag and counter after an expansion has been applied.
    pub fn consume(&mut self) {
        self.expand_now = false;
        self.current_completion_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            StepStatus::Pending,
            StepStatus::InProgress,
            StepStatus::Completed,
            StepStatus::Skipped,
        ] {
            assert_eq!(StepStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(StepStatus::from_str("done"), None);
    }

    #[test]
    fn triggers_raise_flag_at_threshold() {
        let mut triggers = BranchTriggers::with_threshold(2);
        assert!(!triggers.record_branch_completion());
        assert!(triggers.record_branch_completion());
        assert!(triggers.expand_now);
        // Already raised: further completions do not report a new transition.
        assert!(!triggers.record_branch_completion());
        assert_eq!(triggers.current_completion_count, 3);

        triggers.consume();
        assert!(!triggers.expand_now);
        assert_eq!(triggers.current_completion_count, 0);
    }

    #[test]
    fn step_serializes_with_snake_case_status() {
        let step = RoadmapStep::new("Read the docs", "p1").with_status(StepStatus::InProgress);
        let json = serde_json::to_value(&step).unwrap();
        assert_eq!(json["status"], "in_progress");
        assert_eq!(json["branch_triggers"]["completion_count_for_expansion_trigger"], 3);
    }
}
