//! Step completion.
//!
//! Completing a step is one unit of work: status change, branch counter bump
//! on the parent and the audit record commit together or not at all. The phase
//! notifications and the reinforcement message come after the commit and can
//! only degrade, never undo it.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use roadmap_core::models::{AuditAction, AuditDraft, StepStatus};
use roadmap_core::{RepositoryError, RoadmapManifest};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::collaborators::{
    bounded, fallback_reinforcement, CompletionContext, ProgressEvent, ProgressRecorder,
    TextGenerator,
};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult, ErrorKind};
use crate::phase::{PhaseManager, PhaseStatus};
use crate::transaction::{Outcome, TransactionCoordinator, TxContext, UnitOfWork};

/// Branch bookkeeping on the parent of a completed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchProgress {
    pub parent_id: Uuid,
    pub current_completion_count: u32,
    pub completion_count_for_expansion_trigger: u32,
    pub expand_now: bool,
    /// This completion is the one that raised `expand_now`.
    pub triggered: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionResult {
    pub trace_id: Uuid,
    pub tree_id: Uuid,
    pub step_id: Uuid,
    pub status: StepStatus,
    /// The step was already completed; nothing changed.
    pub duplicate: bool,
    pub completed_at: Option<DateTime<Utc>>,
    /// Version the completion committed at. A duplicate reports the original.
    pub version: u64,
    /// Set when finishing this step finished every branch under its parent.
    /// A duplicate reports the original completion's value.
    pub branch: Option<BranchProgress>,
    pub phase_status: PhaseStatus,
    pub reinforcement: String,
}

pub struct CompletionProcessor {
    tx: TransactionCoordinator,
    phases: Arc<PhaseManager>,
    generator: Arc<dyn TextGenerator>,
    recorder: Arc<dyn ProgressRecorder>,
}

impl CompletionProcessor {
    pub fn new(
        tx: TransactionCoordinator,
        phases: Arc<PhaseManager>,
        generator: Arc<dyn TextGenerator>,
        recorder: Arc<dyn ProgressRecorder>,
    ) -> Self {
        Self {
            tx,
            phases,
            generator,
            recorder,
        }
    }

    /// Mark `step_id` completed on behalf of `user_id`.
    ///
    /// Completing an already completed step is not an error: it returns the
    /// original completion with a fresh reinforcement message and writes only
    /// a `duplicate_completion` audit record.
    pub async fn complete(
        &self,
        step_id: Uuid,
        user_id: Uuid,
        reflection: Option<String>,
    ) -> EngineResult<CompletionResult> {
        let trace_id = Uuid::new_v4();
        let fail = |kind: ErrorKind| EngineError::new(trace_id, kind);

        let record = self
            .tx
            .repository()
            .get_node(step_id)
            .map_err(|err| fail(err.into()))?
            .ok_or_else(|| fail(ErrorKind::Validation(format!("step {step_id} not found"))))?;
        if record.user_id != user_id {
            tracing::warn!(
                %trace_id, %step_id, %user_id,
                "Completion for a step owned by someone else"
            );
            return Err(fail(ErrorKind::Validation(format!(
                "step {step_id} does not belong to user {user_id}"
            ))));
        }

        let work = CompleteStep {
            step_id,
            user_id,
            reflection: reflection.clone(),
            recorder: self.recorder.clone(),
            config: self.tx.config().clone(),
        };
        let committed = self
            .tx
            .run(record.tree_id, trace_id, &user_id.to_string(), &work)
            .await?;
        let manifest = committed.manifest;
        let applied = committed.value;
        let (version, branch) = if committed.noop {
            self.original_completion(&manifest, step_id)
                .map_err(|err| fail(err.into()))?
        } else {
            (manifest.version(), applied.branch)
        };

        let phase_status = self.phases.evaluate(&manifest).await;
        let reinforcement = self
            .reinforce(&manifest, step_id, reflection, committed.noop)
            .await
            .map_err(fail)?;

        Ok(CompletionResult {
            trace_id,
            tree_id: manifest.tree_id(),
            step_id,
            status: StepStatus::Completed,
            duplicate: committed.noop,
            completed_at: applied.completed_at,
            version,
            branch,
            phase_status,
            reinforcement,
        })
    }

    /// Version and branch progress recorded by the step's `completed` audit
    /// record. Steps completed outside the engine have none and report the
    /// current version.
    fn original_completion(
        &self,
        manifest: &RoadmapManifest,
        step_id: Uuid,
    ) -> Result<(u64, Option<BranchProgress>), RepositoryError> {
        let records = self.tx.repository().audit_log(manifest.tree_id())?;
        let original = records
            .iter()
            .rev()
            .find(|r| r.action == AuditAction::Completed && r.step_id == Some(step_id));
        Ok(match original {
            Some(record) => {
                let branch = serde_json::from_value::<Option<BranchProgress>>(
                    record.details["branch"].clone(),
                )?;
                (record.version, branch)
            }
            None => (manifest.version(), None),
        })
    }

    async fn reinforce(
        &self,
        manifest: &RoadmapManifest,
        step_id: Uuid,
        reflection: Option<String>,
        duplicate: bool,
    ) -> Result<String, ErrorKind> {
        let step = manifest.step(step_id).ok_or_else(|| {
            ErrorKind::DataConsistency(format!(
                "step {step_id} vanished from tree {} after commit",
                manifest.tree_id()
            ))
        })?;
        let context = CompletionContext {
            goal: manifest.goal().to_string(),
            reflection,
            duplicate,
        };
        let config = self.tx.config();

        let message = bounded(
            "text_generator",
            config.collaborator_timeout,
            config.collaborator_retries,
            || self.generator.summarize_completion(step, &context),
        )
        .await;

        Ok(match message {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => fallback_reinforcement(step),
            Err(err) => {
                tracing::warn!(%step_id, error = %err, "Reinforcement message unavailable, using fallback");
                fallback_reinforcement(step)
            }
        })
    }
}

struct Applied {
    completed_at: Option<DateTime<Utc>>,
    branch: Option<BranchProgress>,
}

struct CompleteStep {
    step_id: Uuid,
    user_id: Uuid,
    reflection: Option<String>,
    recorder: Arc<dyn ProgressRecorder>,
    config: EngineConfig,
}

#[async_trait]
impl UnitOfWork for CompleteStep {
    type Output = Applied;

    fn name(&self) -> &'static str {
        "complete_step"
    }

    async fn apply(
        &self,
        manifest: &mut RoadmapManifest,
        ctx: &TxContext,
    ) -> Result<Outcome<Applied>, ErrorKind> {
        let step = manifest.step(self.step_id).cloned().ok_or_else(|| {
            ErrorKind::DataConsistency(format!(
                "step {} is in the persisted tree but not in manifest {}",
                self.step_id,
                manifest.tree_id()
            ))
        })?;

        if step.status == StepStatus::Completed {
            tracing::info!(trace_id = %ctx.trace_id, step_id = %step.id, "Duplicate completion");
            return Ok(Outcome::Noop {
                value: Applied {
                    completed_at: step.completed_at,
                    branch: None,
                },
                audit: AuditDraft::new(
                    AuditAction::DuplicateCompletion,
                    Some(step.id),
                    json!({ "reflection": self.reflection }),
                ),
            });
        }

        if self.config.require_dependencies {
            let blocking = manifest.unfinished_dependencies(step.id);
            if !blocking.is_empty() {
                let names: Vec<String> = blocking.iter().map(Uuid::to_string).collect();
                return Err(ErrorKind::Validation(format!(
                    "step {} is blocked by unfinished dependencies: {}",
                    step.id,
                    names.join(", ")
                )));
            }
        }

        let branch_was_finished = branch_finished(manifest, self.step_id);
        let now = Utc::now();
        manifest.set_status(step.id, StepStatus::Completed, now)?;

        let branch = match step.parent_id {
            Some(parent_id) if !branch_was_finished && branch_finished(manifest, step.id) => {
                let triggers = manifest.triggers_mut(parent_id)?;
                let triggered = triggers.record_branch_completion();
                Some(BranchProgress {
                    parent_id,
                    current_completion_count: triggers.current_completion_count,
                    completion_count_for_expansion_trigger: triggers
                        .completion_count_for_expansion_trigger,
                    expand_now: triggers.expand_now,
                    triggered,
                })
            }
            _ => None,
        };

        let event = ProgressEvent {
            trace_id: ctx.trace_id,
            tree_id: manifest.tree_id(),
            user_id: self.user_id,
            step_id: step.id,
            title: step.title.clone(),
            reflection: self.reflection.clone(),
            completed_at: now,
        };
        let recorded = bounded(
            "progress_recorder",
            self.config.collaborator_timeout,
            self.config.collaborator_retries,
            || self.recorder.record_completion(&event),
        )
        .await;
        match recorded {
            Ok(()) => {}
            Err(err) if err.critical => {
                return Err(ErrorKind::TransactionFailure(err.to_string()));
            }
            Err(err) => {
                tracing::warn!(trace_id = %ctx.trace_id, step_id = %step.id, error = %err, "Progress update failed");
            }
        }

        Ok(Outcome::Commit {
            value: Applied {
                completed_at: Some(now),
                branch: branch.clone(),
            },
            audit: AuditDraft::new(
                AuditAction::Completed,
                Some(step.id),
                json!({
                    "previous_status": step.status.as_str(),
                    "reflection": self.reflection,
                    "branch": branch,
                    "attempt": ctx.attempt,
                }),
            ),
            expansion: None,
        })
    }
}

/// Whether `step_id` has a parent and every child of that parent is finished.
fn branch_finished(manifest: &RoadmapManifest, step_id: Uuid) -> bool {
    match manifest.step(step_id).and_then(|s| s.parent_id) {
        Some(_) => manifest.siblings(step_id).iter().all(|s| s.is_finished()),
        None => false,
    }
}
