//! Phase completion and next-phase ranking.
//!
//! Completion is a pure predicate over the step set: a phase is complete when
//! every step carrying its id is completed or skipped, and a phase with no steps
//! is complete vacuously. Phase state itself is never stored. The notification
//! ledger is, as `phase_completed` / `phase_reopened` audit records, so each
//! phase is announced once per transition rather than once per evaluation or
//! once per process.
//!
//! Ledger marks carry the manifest version they were taken at. An evaluation
//! of an older version than the mark is stale and changes nothing, and only a
//! strictly newer version may re-arm an announced phase.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use roadmap_core::models::{AuditAction, AuditDraft, AuditRecord, Phase, StepStatus};
use roadmap_core::{RoadmapManifest, RoadmapRepository};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::collaborators::{bounded, Notifier};
use crate::config::EngineConfig;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseProgress {
    pub phase_id: String,
    pub name: String,
    pub order: u32,
    pub total: usize,
    /// Completed or skipped.
    pub finished: usize,
    pub completed: usize,
    pub complete: bool,
}

impl PhaseProgress {
    pub fn started(&self) -> bool {
        self.completed > 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedPhase {
    pub phase_id: String,
    /// 1 for the best candidates. Candidates tied on score and order share a rank.
    pub rank: usize,
    pub score: f64,
    /// Score relative to the best candidate, in `0.0..=1.0`.
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "candidates", rename_all = "snake_case")]
pub enum NextPhase {
    /// No phase is both unstarted and unblocked.
    NoneAvailable,
    /// Ranked best first. Never empty.
    Candidates(Vec<RankedPhase>),
}

impl NextPhase {
    pub fn candidates(&self) -> &[RankedPhase] {
        match self {
            Self::NoneAvailable => &[],
            Self::Candidates(candidates) => candidates,
        }
    }

    /// Every candidate sharing the best rank.
    pub fn top(&self) -> Vec<&RankedPhase> {
        self.candidates().iter().filter(|c| c.rank == 1).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseStatus {
    pub tree_id: Uuid,
    pub version: u64,
    pub phases: Vec<PhaseProgress>,
    pub next: NextPhase,
    /// Phases reported complete for the first time by this evaluation.
    pub newly_completed: Vec<String>,
}

impl PhaseStatus {
    pub fn phase(&self, phase_id: &str) -> Option<&PhaseProgress> {
        self.phases.iter().find(|p| p.phase_id == phase_id)
    }

    pub fn is_complete(&self, phase_id: &str) -> bool {
        self.phase(phase_id).is_some_and(|p| p.complete)
    }
}

/// Ledger state of one phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PhaseMark {
    version: u64,
    announced: bool,
}

/// What one evaluation did to a phase's mark.
enum Transition {
    Announced,
    Reopened,
    Unchanged,
}

/// Apply an observation of `phase_id` at `version` to the marks.
fn observe(
    marks: &mut BTreeMap<String, PhaseMark>,
    phase_id: &str,
    version: u64,
    complete: bool,
) -> Transition {
    let previous = marks.get(phase_id).copied();
    if previous.is_some_and(|mark| version < mark.version) {
        return Transition::Unchanged;
    }
    let was_announced = previous.is_some_and(|mark| mark.announced);
    let transition = match (was_announced, complete) {
        (false, true) => Transition::Announced,
        // Re-arming needs a strictly newer version than the announcement.
        (true, false) if previous.is_some_and(|mark| version > mark.version) => {
            Transition::Reopened
        }
        (true, false) => return Transition::Unchanged,
        _ => Transition::Unchanged,
    };
    marks.insert(
        phase_id.to_string(),
        PhaseMark {
            version,
            announced: complete,
        },
    );
    transition
}

pub struct PhaseManager {
    repo: Arc<dyn RoadmapRepository>,
    notifier: Arc<dyn Notifier>,
    config: EngineConfig,
    /// tree id -> phase id -> latest mark
    ledger: Mutex<HashMap<Uuid, BTreeMap<String, PhaseMark>>>,
}

impl PhaseManager {
    pub fn new(
        repo: Arc<dyn RoadmapRepository>,
        notifier: Arc<dyn Notifier>,
        config: EngineConfig,
    ) -> Self {
        Self {
            repo,
            notifier,
            config,
            ledger: Mutex::new(HashMap::new()),
        }
    }

    /// Derive phase progress and next-phase candidates without side effects.
    pub fn assess(&self, manifest: &RoadmapManifest) -> PhaseStatus {
        let phases: Vec<PhaseProgress> = manifest
            .phases()
            .iter()
            .map(|phase| progress(manifest, phase))
            .collect();
        let next = rank_candidates(manifest.phases(), &phases, self.config.prerequisite_weight);

        PhaseStatus {
            tree_id: manifest.tree_id(),
            version: manifest.version(),
            phases,
            next,
            newly_completed: Vec::new(),
        }
    }

    /// Assess `manifest`, then announce phases that have become complete since
    /// they were last seen incomplete.
    ///
    /// Phases without steps are complete from the start and are never announced.
    pub async fn evaluate(&self, manifest: &RoadmapManifest) -> PhaseStatus {
        let mut status = self.assess(manifest);
        status.newly_completed = self.record_transitions(&status);

        for phase_id in &status.newly_completed {
            let result = bounded(
                "notifier",
                self.config.collaborator_timeout,
                self.config.collaborator_retries,
                || self.notifier.notify_phase_complete(phase_id, status.tree_id),
            )
            .await;
            if let Err(err) = result {
                tracing::warn!(
                    tree_id = %status.tree_id, phase_id = %phase_id, error = %err,
                    "Phase completion notification failed"
                );
            }
        }

        status
    }

    fn record_transitions(&self, status: &PhaseStatus) -> Vec<String> {
        let mut ledger = self.ledger.lock().expect("phase ledger lock poisoned");
        if !ledger.contains_key(&status.tree_id) {
            let marks = self.load_marks(status.tree_id);
            ledger.insert(status.tree_id, marks);
        }
        let Some(marks) = ledger.get_mut(&status.tree_id) else {
            return Vec::new();
        };

        let trace_id = Uuid::new_v4();
        let mut newly = Vec::new();
        for phase in &status.phases {
            if phase.total == 0 {
                continue;
            }
            let action = match observe(marks, &phase.phase_id, status.version, phase.complete) {
                Transition::Unchanged => continue,
                Transition::Announced => {
                    newly.push(phase.phase_id.clone());
                    AuditAction::PhaseCompleted
                }
                Transition::Reopened => {
                    tracing::debug!(
                        tree_id = %status.tree_id, phase_id = %phase.phase_id,
                        "Phase reopened by new steps"
                    );
                    AuditAction::PhaseReopened
                }
            };
            let record = AuditDraft::new(action, None, json!({ "phase_id": phase.phase_id }))
                .into_record(status.tree_id, trace_id, "phase_manager", status.version);
            if let Err(err) = self.repo.append_audit(record) {
                tracing::warn!(
                    tree_id = %status.tree_id, phase_id = %phase.phase_id, error = %err,
                    "Failed to persist phase ledger entry"
                );
            }
        }
        newly
    }

    /// Rebuild a tree's marks from its audit log.
    fn load_marks(&self, tree_id: Uuid) -> BTreeMap<String, PhaseMark> {
        let mut marks = BTreeMap::new();
        let records = match self.repo.audit_log(tree_id) {
            Ok(records) => records,
            Err(err) => {
                tracing::warn!(%tree_id, error = %err, "Phase ledger unavailable, starting empty");
                return marks;
            }
        };
        for record in &records {
            if let Some((phase_id, announced)) = ledger_entry(record) {
                observe(&mut marks, phase_id, record.version, announced);
            }
        }
        marks
    }
}

fn ledger_entry(record: &AuditRecord) -> Option<(&str, bool)> {
    let announced = match record.action {
        AuditAction::PhaseCompleted => true,
        AuditAction::PhaseReopened => false,
        _ => return None,
    };
    record.details["phase_id"].as_str().map(|id| (id, announced))
}

fn progress(manifest: &RoadmapManifest, phase: &Phase) -> PhaseProgress {
    let mut total = 0;
    let mut finished = 0;
    let mut completed = 0;
    for step in manifest.steps_in_phase(&phase.id) {
        total += 1;
        if step.is_finished() {
            finished += 1;
        }
        if step.status == StepStatus::Completed {
            completed += 1;
        }
    }

    PhaseProgress {
        phase_id: phase.id.clone(),
        name: phase.name.clone(),
        order: phase.order,
        total,
        finished,
        completed,
        complete: finished == total,
    }
}

/// Rank unstarted phases whose prerequisites are all complete.
///
/// Score is `weight * satisfied prerequisites + priority`. Ordering is score
/// descending, then declared order, then phase id.
pub fn rank_candidates(
    phases: &[Phase],
    progress: &[PhaseProgress],
    prerequisite_weight: f64,
) -> NextPhase {
    let complete = |id: &str| progress.iter().any(|p| p.phase_id == id && p.complete);

    let mut scored: Vec<(&Phase, f64)> = phases
        .iter()
        .zip(progress)
        .filter(|(_, p)| !p.complete && !p.started())
        .filter(|(phase, _)| phase.prerequisites.iter().all(|pre| complete(pre.as_str())))
        .map(|(phase, _)| {
            let satisfied = phase.prerequisites.len() as f64;
            (phase, prerequisite_weight * satisfied + phase.priority)
        })
        .collect();

    if scored.is_empty() {
        return NextPhase::NoneAvailable;
    }

    scored.sort_by(|(a, a_score), (b, b_score)| {
        b_score
            .total_cmp(a_score)
            .then(a.order.cmp(&b.order))
            .then_with(|| a.id.cmp(&b.id))
    });

    let best = scored[0].1;
    let mut ranked: Vec<RankedPhase> = Vec::with_capacity(scored.len());
    for (index, (phase, score)) in scored.iter().enumerate() {
        let rank = match index.checked_sub(1).map(|prev| scored[prev]) {
            Some((prev, prev_score)) if prev_score == *score && prev.order == phase.order => {
                ranked[index - 1].rank
            }
            _ => index + 1,
        };
        let confidence = if best > 0.0 {
            (score / best).clamp(0.0, 1.0)
        } else {
            1.0
        };
        ranked.push(RankedPhase {
            phase_id: phase.id.clone(),
            rank,
            score: *score,
            confidence,
        });
    }

    NextPhase::Candidates(ranked)
}
