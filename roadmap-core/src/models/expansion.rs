use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A proposed new step for branch expansion.
///
/// Candidates are usually produced by the text generator and arrive with only
/// a title. The optional fields let a caller wire the new step into the graph
/// beyond the implicit dependency on the expanded step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateStep {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Extra dependencies besides the expanded step.
    #[serde(default)]
    pub depends_on: Vec<StepRef>,
    /// Existing steps that must now wait for this new step.
    #[serde(default)]
    pub blocks: Vec<Uuid>,
    /// Phase override. An undeclared id promotes the step into a new phase.
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub is_major_phase: bool,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl CandidateStep {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: None,
            depends_on: Vec::new(),
            blocks: Vec::new(),
            phase: None,
            is_major_phase: false,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn depends_on(mut self, target: StepRef) -> Self {
        self.depends_on.push(target);
        self
    }

    pub fn blocks(mut self, step_id: Uuid) -> Self {
        self.blocks.push(step_id);
        self
    }

    pub fn in_phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = Some(phase.into());
        self
    }
}

impl From<String> for CandidateStep {
    fn from(title: String) -> Self {
        Self::new(title)
    }
}

impl From<&str> for CandidateStep {
    fn from(title: &str) -> Self {
        Self::new(title)
    }
}

/// Reference to a dependency target from inside an expansion request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "target")]
pub enum StepRef {
    /// A step already in the manifest.
    Existing(Uuid),
    /// Another candidate of the same request, by position.
    Sibling(usize),
}

/// A committed expansion, kept so replays of the same request collapse into
/// the original result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpansionRecord {
    pub tree_id: Uuid,
    pub fingerprint: String,
    /// Digest of the candidate payload, used to spot divergent replays.
    pub payload_digest: String,
    pub trigger_step_id: Uuid,
    pub new_step_ids: Vec<Uuid>,
    pub trace_id: Uuid,
    pub version: u64,
    pub created_at: DateTime<Utc>,
}

/// Input for creating a new roadmap.
///
/// Steps reference each other through caller-chosen `key`s; the engine
/// assigns UUIDs when the manifest is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRoadmapInput {
    /// The user's goal this roadmap works towards.
    pub goal: String,
    pub phases: Vec<super::Phase>,
    pub steps: Vec<StepDraft>,
}

/// A step inside [`CreateRoadmapInput`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDraft {
    pub key: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Keys of the steps this one depends on.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Key of the parent step.
    #[serde(default)]
    pub parent: Option<String>,
    pub phase: String,
    #[serde(default)]
    pub is_major_phase: bool,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}
