//! The engine facade wiring repository, collaborators and processors together.

use std::sync::Arc;

use roadmap_core::models::{
    AuditAction, AuditDraft, AuditRecord, CandidateStep, CreateRoadmapInput, RoadmapStep,
};
use roadmap_core::{RoadmapManifest, RoadmapRepository};
use serde_json::json;
use uuid::Uuid;

use crate::collaborators::{
    LogNotifier, NoopProgressRecorder, Notifier, ProgressRecorder, TemplateTextGenerator,
    TextGenerator,
};
use crate::completion::{CompletionProcessor, CompletionResult};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult, ErrorKind};
use crate::expansion::{ExpansionCoordinator, ExpansionResult};
use crate::phase::{PhaseManager, PhaseStatus};
use crate::transaction::TransactionCoordinator;

pub struct EngineBuilder {
    repo: Arc<dyn RoadmapRepository>,
    config: EngineConfig,
    generator: Arc<dyn TextGenerator>,
    notifier: Arc<dyn Notifier>,
    recorder: Arc<dyn ProgressRecorder>,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn text_generator(mut self, generator: Arc<dyn TextGenerator>) -> Self {
        self.generator = generator;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn progress_recorder(mut self, recorder: Arc<dyn ProgressRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn build(self) -> Engine {
        let tx = TransactionCoordinator::new(self.repo, self.config.clone());
        let phases = Arc::new(PhaseManager::new(
            tx.repository().clone(),
            self.notifier,
            self.config.clone(),
        ));
        Engine {
            completion: CompletionProcessor::new(
                tx.clone(),
                phases.clone(),
                self.generator.clone(),
                self.recorder,
            ),
            expansion: ExpansionCoordinator::new(tx.clone(), phases.clone(), self.generator),
            phases,
            tx,
        }
    }
}

pub struct Engine {
    tx: TransactionCoordinator,
    phases: Arc<PhaseManager>,
    completion: CompletionProcessor,
    expansion: ExpansionCoordinator,
}

impl Engine {
    /// Start from the offline collaborators and default configuration.
    pub fn builder(repo: Arc<dyn RoadmapRepository>) -> EngineBuilder {
        EngineBuilder {
            repo,
            config: EngineConfig::default(),
            generator: Arc::new(TemplateTextGenerator),
            notifier: Arc::new(LogNotifier),
            recorder: Arc::new(NoopProgressRecorder),
        }
    }

    pub fn new(repo: Arc<dyn RoadmapRepository>, config: EngineConfig) -> Self {
        Self::builder(repo).config(config).build()
    }

    pub fn config(&self) -> &EngineConfig {
        self.tx.config()
    }

    /// Validate and persist a new roadmap at version 1.
    pub fn create_roadmap(
        &self,
        user_id: Uuid,
        input: CreateRoadmapInput,
    ) -> EngineResult<RoadmapManifest> {
        let trace_id = Uuid::new_v4();
        let manifest =
            RoadmapManifest::from_input(user_id, input, self.config().expansion_trigger_threshold)
                .map_err(|err| EngineError::new(trace_id, err))?;
        let audit = AuditDraft::new(
            AuditAction::Created,
            None,
            json!({
                "goal": manifest.goal(),
                "steps": manifest.steps().len(),
                "phases": manifest.phases().len(),
            }),
        )
        .into_record(manifest.tree_id(), trace_id, &user_id.to_string(), 1);

        let stored = self
            .tx
            .repository()
            .create_manifest(manifest, audit)
            .map_err(|err| EngineError::new(trace_id, err))?;
        tracing::info!(%trace_id, tree_id = %stored.tree_id(), %user_id, "Roadmap created");
        Ok(stored)
    }

    pub async fn complete(
        &self,
        step_id: Uuid,
        user_id: Uuid,
        reflection: Option<String>,
    ) -> EngineResult<CompletionResult> {
        self.completion.complete(step_id, user_id, reflection).await
    }

    pub async fn expand(
        &self,
        step_id: Uuid,
        candidates: Vec<CandidateStep>,
        fingerprint: &str,
    ) -> EngineResult<ExpansionResult> {
        self.expansion.expand(step_id, candidates, fingerprint).await
    }

    pub async fn expand_from_context(
        &self,
        step_id: Uuid,
        context: &str,
    ) -> EngineResult<Option<ExpansionResult>> {
        self.expansion.expand_from_context(step_id, context).await
    }

    /// Current phase status of a tree, announcing any phase not yet announced.
    ///
    /// Announcements are recorded in the audit log, so a new engine over the
    /// same repository does not repeat them.
    pub async fn evaluate_phases(&self, tree_id: Uuid) -> EngineResult<PhaseStatus> {
        let manifest = self.manifest(tree_id)?;
        Ok(self.phases.evaluate(&manifest).await)
    }

    pub fn manifest(&self, tree_id: Uuid) -> EngineResult<RoadmapManifest> {
        let trace_id = Uuid::new_v4();
        self.tx
            .repository()
            .get_manifest(tree_id)
            .map_err(|err| EngineError::new(trace_id, err))?
            .ok_or_else(|| {
                EngineError::new(
                    trace_id,
                    ErrorKind::Validation(format!("tree {tree_id} not found")),
                )
            })
    }

    pub fn ready_steps(&self, tree_id: Uuid) -> EngineResult<Vec<RoadmapStep>> {
        let manifest = self.manifest(tree_id)?;
        Ok(manifest.ready_steps().into_iter().cloned().collect())
    }

    pub fn eligible_for_expansion(&self, tree_id: Uuid) -> EngineResult<Vec<RoadmapStep>> {
        self.expansion.eligible_for_expansion(tree_id)
    }

    pub fn audit_log(&self, tree_id: Uuid) -> EngineResult<Vec<AuditRecord>> {
        self.tx
            .repository()
            .audit_log(tree_id)
            .map_err(|err| EngineError::new(Uuid::new_v4(), err))
    }
}
