//! Branch expansion: growing the roadmap beneath an existing step.
//!
//! New steps always depend on the step they expand and may add dependencies on
//! existing steps or on each other, or make existing steps wait for them. The
//! whole batch is checked for cycles before anything is installed. Requests are
//! keyed by a fingerprint; replaying one inside the retention window returns
//! the steps it created the first time.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use roadmap_core::models::{
    AuditAction, AuditDraft, BranchTriggers, CandidateStep, ExpansionRecord, Phase, RoadmapStep,
    StepRef, StepStatus,
};
use roadmap_core::{RoadmapManifest, RoadmapRepository};
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::collaborators::{bounded, ExpansionContext, TextGenerator};
use crate::error::{EngineError, EngineResult, ErrorKind};
use crate::phase::PhaseManager;
use crate::transaction::{Outcome, TransactionCoordinator, TxContext, UnitOfWork};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExpansionResult {
    pub trace_id: Uuid,
    pub tree_id: Uuid,
    pub trigger_step_id: Uuid,
    pub fingerprint: String,
    /// In candidate order.
    pub new_step_ids: Vec<Uuid>,
    /// Phases declared by this expansion.
    pub promoted_phases: Vec<String>,
    /// The fingerprint had already been applied; nothing changed.
    pub duplicate: bool,
    pub version: u64,
}

/// Deterministic fingerprint for a context-driven expansion request.
pub fn request_fingerprint(step_id: Uuid, context: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(step_id.as_bytes());
    hasher.update(b"\n");
    hasher.update(context.trim().as_bytes());
    hex::encode(hasher.finalize())
}

fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub struct ExpansionCoordinator {
    tx: TransactionCoordinator,
    phases: Arc<PhaseManager>,
    generator: Arc<dyn TextGenerator>,
}

impl ExpansionCoordinator {
    pub fn new(
        tx: TransactionCoordinator,
        phases: Arc<PhaseManager>,
        generator: Arc<dyn TextGenerator>,
    ) -> Self {
        Self {
            tx,
            phases,
            generator,
        }
    }

    /// Add `candidates` as new steps beneath `step_id`.
    pub async fn expand(
        &self,
        step_id: Uuid,
        candidates: Vec<CandidateStep>,
        fingerprint: &str,
    ) -> EngineResult<ExpansionResult> {
        let trace_id = Uuid::new_v4();
        if candidates.is_empty() {
            return Err(EngineError::new(
                trace_id,
                ErrorKind::Validation("expansion needs at least one candidate step".to_string()),
            ));
        }
        let payload = serde_json::to_vec(&candidates).map_err(|err| {
            EngineError::new(trace_id, ErrorKind::Validation(err.to_string()))
        })?;
        self.run(trace_id, step_id, candidates, fingerprint, digest(&payload))
            .await
    }

    /// Ask the text generator for candidates and expand with them.
    ///
    /// Returns `Ok(None)` without touching the roadmap when the generator
    /// fails or proposes nothing.
    pub async fn expand_from_context(
        &self,
        step_id: Uuid,
        context: &str,
    ) -> EngineResult<Option<ExpansionResult>> {
        let trace_id = Uuid::new_v4();
        let fail = |kind: ErrorKind| EngineError::new(trace_id, kind);
        let repo = self.tx.repository();

        let record = repo
            .get_node(step_id)
            .map_err(|err| fail(err.into()))?
            .ok_or_else(|| fail(ErrorKind::Validation(format!("step {step_id} not found"))))?;
        let fingerprint = request_fingerprint(step_id, context);
        let payload_digest = digest(context.trim().as_bytes());

        // A fresh replay collapses inside the transaction without needing candidates.
        let replay = repo
            .find_expansion(record.tree_id, &fingerprint)
            .map_err(|err| fail(err.into()))?
            .is_some_and(|previous| self.is_fresh(&previous));
        if replay {
            return self
                .run(trace_id, step_id, Vec::new(), &fingerprint, payload_digest)
                .await
                .map(Some);
        }

        let manifest = repo
            .get_manifest(record.tree_id)
            .map_err(|err| fail(err.into()))?
            .ok_or_else(|| {
                fail(ErrorKind::Validation(format!(
                    "tree {} not found",
                    record.tree_id
                )))
            })?;
        let expansion_context = ExpansionContext {
            tree_id: record.tree_id,
            goal: manifest.goal().to_string(),
            step: record.step,
            context: context.to_string(),
        };
        let config = self.tx.config();
        let proposed = bounded(
            "text_generator",
            config.collaborator_timeout,
            config.collaborator_retries,
            || self.generator.propose_steps(&expansion_context),
        )
        .await;

        let candidates = match proposed {
            Ok(candidates) if !candidates.is_empty() => candidates,
            Ok(_) => {
                tracing::info!(%trace_id, %step_id, "Text generator proposed no steps");
                return Ok(None);
            }
            Err(err) => {
                tracing::warn!(%trace_id, %step_id, error = %err, "Step proposal failed, skipping expansion");
                return Ok(None);
            }
        };

        self.run(trace_id, step_id, candidates, &fingerprint, payload_digest)
            .await
            .map(Some)
    }

    /// Steps whose branch trigger is raised.
    pub fn eligible_for_expansion(&self, tree_id: Uuid) -> EngineResult<Vec<RoadmapStep>> {
        let trace_id = Uuid::new_v4();
        let manifest = self
            .tx
            .repository()
            .get_manifest(tree_id)
            .map_err(|err| EngineError::new(trace_id, err))?
            .ok_or_else(|| {
                EngineError::new(
                    trace_id,
                    ErrorKind::Validation(format!("tree {tree_id} not found")),
                )
            })?;
        Ok(manifest.expansion_ready().into_iter().cloned().collect())
    }

    fn is_fresh(&self, record: &ExpansionRecord) -> bool {
        is_fresh(record, self.tx.config().fingerprint_ttl)
    }

    async fn run(
        &self,
        trace_id: Uuid,
        step_id: Uuid,
        candidates: Vec<CandidateStep>,
        fingerprint: &str,
        payload_digest: String,
    ) -> EngineResult<ExpansionResult> {
        let config = self.tx.config();
        if !config.dynamic_expansion {
            return Err(EngineError::new(
                trace_id,
                ErrorKind::Validation("dynamic expansion is disabled".to_string()),
            ));
        }
        let fingerprint = fingerprint.trim();
        if fingerprint.is_empty() {
            return Err(EngineError::new(
                trace_id,
                ErrorKind::Validation("expansion fingerprint is empty".to_string()),
            ));
        }

        let record = self
            .tx
            .repository()
            .get_node(step_id)
            .map_err(|err| EngineError::new(trace_id, err))?
            .ok_or_else(|| {
                EngineError::new(
                    trace_id,
                    ErrorKind::Validation(format!("step {step_id} not found")),
                )
            })?;

        let work = ExpandStep {
            trigger: step_id,
            candidates,
            fingerprint: fingerprint.to_string(),
            payload_digest,
            repo: self.tx.repository().clone(),
            fingerprint_ttl: config.fingerprint_ttl,
            expansion_trigger: config.expansion_trigger_threshold,
        };
        let committed = self
            .tx
            .run(record.tree_id, trace_id, &record.user_id.to_string(), &work)
            .await?;

        if !committed.noop {
            // New pending steps can reopen a phase; the ledger must see that.
            self.phases.evaluate(&committed.manifest).await;
        }

        let applied = committed.value;
        Ok(ExpansionResult {
            trace_id,
            tree_id: record.tree_id,
            trigger_step_id: step_id,
            fingerprint: fingerprint.to_string(),
            new_step_ids: applied.new_step_ids,
            promoted_phases: applied.promoted_phases,
            duplicate: committed.noop,
            version: committed.manifest.version(),
        })
    }
}

fn is_fresh(record: &ExpansionRecord, ttl: Duration) -> bool {
    match (Utc::now() - record.created_at).to_std() {
        Ok(age) => age <= ttl,
        // Recorded "in the future" by a skewed clock.
        Err(_) => true,
    }
}

struct Applied {
    new_step_ids: Vec<Uuid>,
    promoted_phases: Vec<String>,
}

struct ExpandStep {
    trigger: Uuid,
    candidates: Vec<CandidateStep>,
    fingerprint: String,
    payload_digest: String,
    repo: Arc<dyn RoadmapRepository>,
    fingerprint_ttl: Duration,
    expansion_trigger: u32,
}

impl ExpandStep {
    fn validate_candidates(&self, manifest: &RoadmapManifest) -> Result<(), ErrorKind> {
        if self.candidates.is_empty() {
            return Err(ErrorKind::Validation(
                "expansion needs at least one candidate step".to_string(),
            ));
        }

        for (index, candidate) in self.candidates.iter().enumerate() {
            if candidate.title.trim().is_empty() {
                return Err(ErrorKind::Validation(format!(
                    "candidate {index} has an empty title"
                )));
            }
            for target in &candidate.depends_on {
                match *target {
                    StepRef::Sibling(other) if other == index => {
                        return Err(ErrorKind::Validation(format!(
                            "candidate {index} depends on itself"
                        )))
                    }
                    StepRef::Sibling(other) if other >= self.candidates.len() => {
                        return Err(ErrorKind::Validation(format!(
                            "candidate {index} depends on missing candidate {other}"
                        )))
                    }
                    StepRef::Existing(id) if !manifest.contains_step(id) => {
                        return Err(ErrorKind::Validation(format!(
                            "candidate {index} depends on unknown step {id}"
                        )))
                    }
                    _ => {}
                }
            }
            for blocked in &candidate.blocks {
                match manifest.step(*blocked) {
                    None => {
                        return Err(ErrorKind::Validation(format!(
                            "candidate {index} blocks unknown step {blocked}"
                        )))
                    }
                    Some(step) if step.is_finished() => {
                        return Err(ErrorKind::Validation(format!(
                            "candidate {index} blocks step {blocked}, which is already {}",
                            step.status.as_str()
                        )))
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl UnitOfWork for ExpandStep {
    type Output = Applied;

    fn name(&self) -> &'static str {
        "expand_step"
    }

    async fn apply(
        &self,
        manifest: &mut RoadmapManifest,
        ctx: &TxContext,
    ) -> Result<Outcome<Applied>, ErrorKind> {
        let tree_id = manifest.tree_id();
        let trigger = manifest.step(self.trigger).cloned().ok_or_else(|| {
            ErrorKind::DataConsistency(format!(
                "step {} is in the persisted tree but not in manifest {tree_id}",
                self.trigger
            ))
        })?;

        if let Some(previous) = self.repo.find_expansion(tree_id, &self.fingerprint)? {
            if is_fresh(&previous, self.fingerprint_ttl) {
                if previous.trigger_step_id != trigger.id {
                    tracing::warn!(
                        trace_id = %ctx.trace_id, fingerprint = %self.fingerprint,
                        original_trigger = %previous.trigger_step_id, trigger = %trigger.id,
                        "Fingerprint replayed against a different step"
                    );
                    return Err(ErrorKind::ExpansionConflict {
                        fingerprint: self.fingerprint.clone(),
                    });
                }
                if previous.payload_digest != self.payload_digest {
                    tracing::warn!(
                        trace_id = %ctx.trace_id, fingerprint = %self.fingerprint,
                        "Fingerprint replayed with a different payload"
                    );
                    return Err(ErrorKind::ExpansionConflict {
                        fingerprint: self.fingerprint.clone(),
                    });
                }
                if let Some(missing) = previous
                    .new_step_ids
                    .iter()
                    .find(|id| !manifest.contains_step(**id))
                {
                    return Err(ErrorKind::DataConsistency(format!(
                        "expansion {} created step {missing}, which is not in the manifest",
                        self.fingerprint
                    )));
                }
                tracing::info!(
                    trace_id = %ctx.trace_id, fingerprint = %self.fingerprint,
                    "Duplicate expansion request"
                );
                return Ok(Outcome::Noop {
                    value: Applied {
                        new_step_ids: previous.new_step_ids.clone(),
                        promoted_phases: Vec::new(),
                    },
                    audit: AuditDraft::new(
                        AuditAction::DuplicateExpansion,
                        Some(trigger.id),
                        json!({
                            "fingerprint": self.fingerprint,
                            "original_trace_id": previous.trace_id,
                            "new_step_ids": previous.new_step_ids,
                        }),
                    ),
                });
            }
            tracing::debug!(fingerprint = %self.fingerprint, "Expired fingerprint treated as new");
        }

        self.validate_candidates(manifest)?;

        let new_ids: Vec<Uuid> = self.candidates.iter().map(|_| Uuid::new_v4()).collect();
        let mut phases = manifest.phases().to_vec();
        let mut promoted_phases = Vec::new();
        let mut new_steps = Vec::with_capacity(self.candidates.len());

        for (index, candidate) in self.candidates.iter().enumerate() {
            let phase = match &candidate.phase {
                None => trigger.phase.clone(),
                Some(phase_id) => {
                    let phase_id = phase_id.trim().to_string();
                    if !phases.iter().any(|p| p.id == phase_id) {
                        let order = phases.iter().map(|p| p.order).max().map_or(0, |o| o + 1);
                        phases.push(
                            Phase::new(phase_id.clone(), order).requires(trigger.phase.clone()),
                        );
                        promoted_phases.push(phase_id.clone());
                    }
                    phase_id
                }
            };

            let mut dependencies = BTreeSet::from([trigger.id]);
            for target in &candidate.depends_on {
                dependencies.insert(match *target {
                    StepRef::Existing(id) => id,
                    StepRef::Sibling(other) => new_ids[other],
                });
            }

            new_steps.push(RoadmapStep {
                id: new_ids[index],
                parent_id: Some(trigger.id),
                title: candidate.title.trim().to_string(),
                description: candidate.description.clone(),
                dependencies,
                status: StepStatus::Pending,
                phase,
                is_major_phase: candidate.is_major_phase,
                branch_triggers: BranchTriggers::with_threshold(self.expansion_trigger),
                metadata: candidate.metadata.clone(),
                completed_at: None,
            });
        }

        // Rewired existing steps first, so a rejected batch names the new
        // step's dependency as the closing edge.
        let mut additions: Vec<(Uuid, Uuid)> = Vec::new();
        for (index, candidate) in self.candidates.iter().enumerate() {
            for blocked in &candidate.blocks {
                additions.push((*blocked, new_ids[index]));
            }
        }
        for step in &new_steps {
            for dependency in &step.dependencies {
                additions.push((step.id, *dependency));
            }
        }
        manifest
            .cycle_detector()
            .check_additions(&additions)
            .map_err(|cycle| {
                tracing::warn!(trace_id = %ctx.trace_id, %cycle, "Expansion rejected");
                ErrorKind::CircularDependency(cycle)
            })?;

        let mut steps = manifest.steps().to_vec();
        for step in steps.iter_mut() {
            for (index, candidate) in self.candidates.iter().enumerate() {
                if candidate.blocks.contains(&step.id) {
                    step.dependencies.insert(new_ids[index]);
                }
            }
        }
        steps.extend(new_steps);
        manifest.replace_graph(phases, steps)?;
        manifest.triggers_mut(trigger.id)?.consume();

        Ok(Outcome::Commit {
            value: Applied {
                new_step_ids: new_ids.clone(),
                promoted_phases: promoted_phases.clone(),
            },
            audit: AuditDraft::new(
                AuditAction::Expanded,
                Some(trigger.id),
                json!({
                    "fingerprint": self.fingerprint,
                    "new_step_ids": new_ids,
                    "promoted_phases": promoted_phases,
                }),
            ),
            expansion: Some(ExpansionRecord {
                tree_id,
                fingerprint: self.fingerprint.clone(),
                payload_digest: self.payload_digest.clone(),
                trigger_step_id: trigger.id,
                new_step_ids: new_ids,
                trace_id: ctx.trace_id,
                version: 0,
                created_at: Utc::now(),
            }),
        })
    }
}
