#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use roadmap_engine::collaborators::{
    CollaboratorError, CompletionContext, ExpansionContext, Notifier, ProgressEvent,
    ProgressRecorder, TextGenerator,
};
use roadmap_engine::roadmap_core::models::{
    CandidateStep, CreateRoadmapInput, Phase, RoadmapStep, StepDraft,
};
use roadmap_engine::roadmap_core::{MemoryRepository, RoadmapManifest};
use roadmap_engine::{Engine, EngineBuilder, EngineConfig};
use uuid::Uuid;

pub fn draft(key: &str, phase: &str, depends_on: &[&str], parent: Option<&str>) -> StepDraft {
    StepDraft {
        key: key.to_string(),
        title: key.to_string(),
        description: None,
        depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
        parent: parent.map(str::to_string),
        phase: phase.to_string(),
        is_major_phase: false,
        metadata: serde_json::Map::new(),
    }
}

/// P1 = {A, B -> A}, P2 = {C -> B}, P2 requiring P1.
pub fn two_phase_input() -> CreateRoadmapInput {
    CreateRoadmapInput {
        goal: "Learn Rust".to_string(),
        phases: vec![Phase::new("P1", 1), Phase::new("P2", 2).requires("P1")],
        steps: vec![
            draft("A", "P1", &[], None),
            draft("B", "P1", &["A"], None),
            draft("C", "P2", &["B"], None),
        ],
    }
}

pub fn step_id(manifest: &RoadmapManifest, title: &str) -> Uuid {
    manifest
        .steps()
        .iter()
        .find(|s| s.title == title)
        .map(|s| s.id)
        .unwrap_or_else(|| panic!("no step titled {title}"))
}

pub fn test_config() -> EngineConfig {
    EngineConfig::without_backoff()
}

pub fn builder() -> (EngineBuilder, Arc<MemoryRepository>) {
    let repo = Arc::new(MemoryRepository::new());
    (
        Engine::builder(repo.clone()).config(test_config()),
        repo,
    )
}

/// Records every phase announcement.
#[derive(Default)]
pub struct RecordingNotifier {
    pub announced: Mutex<Vec<(String, Uuid)>>,
}

impl RecordingNotifier {
    pub fn phases(&self) -> Vec<String> {
        self.announced
            .lock()
            .unwrap()
            .iter()
            .map(|(phase, _)| phase.clone())
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify_phase_complete(
        &self,
        phase_id: &str,
        tree_id: Uuid,
    ) -> Result<(), CollaboratorError> {
        self.announced
            .lock()
            .unwrap()
            .push((phase_id.to_string(), tree_id));
        Ok(())
    }
}

/// A text generator that is always down.
pub struct BrokenGenerator;

#[async_trait]
impl TextGenerator for BrokenGenerator {
    async fn propose_steps(
        &self,
        _context: &ExpansionContext,
    ) -> Result<Vec<CandidateStep>, CollaboratorError> {
        Err(CollaboratorError::recoverable("text_generator", "service unavailable"))
    }

    async fn summarize_completion(
        &self,
        _step: &RoadmapStep,
        _context: &CompletionContext,
    ) -> Result<String, CollaboratorError> {
        Err(CollaboratorError::recoverable("text_generator", "service unavailable"))
    }
}

/// A progress recorder failing every call, critically or not.
pub struct FailingRecorder {
    pub critical: bool,
}

#[async_trait]
impl ProgressRecorder for FailingRecorder {
    async fn record_completion(&self, _event: &ProgressEvent) -> Result<(), CollaboratorError> {
        if self.critical {
            Err(CollaboratorError::critical("progress_recorder", "store rejected the update"))
        } else {
            Err(CollaboratorError::recoverable("progress_recorder", "store is slow"))
        }
    }
}
