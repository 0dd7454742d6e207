//! The persistence contract shared by the SQLite [`Database`](crate::db::Database)
//! and the in-memory [`MemoryRepository`].
//!
//! A tree is stored twice: once as the authoritative manifest document and
//! once as one row per step (the "persisted tree"). Every commit rewrites both
//! in one atomic unit after a compare-and-swap on the manifest version, so a
//! reader that finds them disagreeing has found corruption, not a race.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use uuid::Uuid;

use crate::error::RepositoryError;
use crate::graph::RoadmapManifest;
use crate::models::{AuditRecord, ExpansionRecord, RoadmapStep, StepStatus};

/// A persisted step row together with the tree and owner it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct StepRecord {
    pub tree_id: Uuid,
    pub user_id: Uuid,
    pub step: RoadmapStep,
}

/// Everything written by one committed unit of work.
#[derive(Debug, Clone)]
pub struct ManifestCommit {
    /// The new manifest. Its version is set by the repository on success.
    pub manifest: RoadmapManifest,
    /// Version the manifest was loaded at.
    pub expected_version: u64,
    pub audit: AuditRecord,
    pub expansion: Option<ExpansionRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Committed { version: u64 },
    /// Someone else committed first; nothing was written.
    Conflict { current_version: u64 },
}

pub trait RoadmapRepository: Send + Sync {
    fn get_node(&self, step_id: Uuid) -> Result<Option<StepRecord>, RepositoryError>;

    /// Load a manifest, verifying it agrees with the persisted step rows.
    fn get_manifest(&self, tree_id: Uuid) -> Result<Option<RoadmapManifest>, RepositoryError>;

    /// Persist a new tree at version 1 and return the stored manifest.
    fn create_manifest(
        &self,
        manifest: RoadmapManifest,
        audit: AuditRecord,
    ) -> Result<RoadmapManifest, RepositoryError>;

    fn save(&self, commit: ManifestCommit) -> Result<SaveOutcome, RepositoryError>;

    /// Record an operation that did not change the manifest.
    fn append_audit(&self, record: AuditRecord) -> Result<(), RepositoryError>;

    fn find_expansion(
        &self,
        tree_id: Uuid,
        fingerprint: &str,
    ) -> Result<Option<ExpansionRecord>, RepositoryError>;

    /// Audit records of a tree, oldest first.
    fn audit_log(&self, tree_id: Uuid) -> Result<Vec<AuditRecord>, RepositoryError>;
}

/// Compare a manifest with the `(step id, status)` rows persisted for its tree.
pub fn verify_rows(
    manifest: &RoadmapManifest,
    rows: &BTreeMap<Uuid, StepStatus>,
) -> Result<(), RepositoryError> {
    let tree_id = manifest.tree_id();
    for step in manifest.steps() {
        match rows.get(&step.id) {
            None => {
                return Err(RepositoryError::Consistency {
                    tree_id,
                    details: format!("step {} has no persisted row", step.id),
                })
            }
            Some(status) if *status != step.status => {
                return Err(RepositoryError::Consistency {
                    tree_id,
                    details: format!(
                        "step {} is {} in the manifest but {} in the tree",
                        step.id,
                        step.status.as_str(),
                        status.as_str()
                    ),
                })
            }
            Some(_) => {}
        }
    }
    if rows.len() != manifest.steps().len() {
        let orphan = rows
            .keys()
            .find(|id| !manifest.contains_step(**id))
            .map(|id| id.to_string())
            .unwrap_or_default();
        return Err(RepositoryError::Consistency {
            tree_id,
            details: format!("persisted row {orphan} is not in the manifest"),
        });
    }
    Ok(())
}

#[derive(Default)]
struct MemoryState {
    manifests: HashMap<Uuid, RoadmapManifest>,
    rows: HashMap<Uuid, StepRecord>,
    audit: Vec<AuditRecord>,
    expansions: HashMap<(Uuid, String), ExpansionRecord>,
}

impl MemoryState {
    fn write_rows(&mut self, manifest: &RoadmapManifest) {
        let tree_id = manifest.tree_id();
        self.rows.retain(|_, row| row.tree_id != tree_id);
        for step in manifest.steps() {
            self.rows.insert(
                step.id,
                StepRecord {
                    tree_id,
                    user_id: manifest.user_id(),
                    step: step.clone(),
                },
            );
        }
    }
}

/// Mutex-guarded repository holding everything in process memory.
#[derive(Default)]
pub struct MemoryRepository {
    state: Mutex<MemoryState>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite one persisted step row without touching the manifest.
    ///
    /// Only useful for exercising the consistency check.
    pub fn overwrite_row(&self, step_id: Uuid, status: StepStatus) -> bool {
        let mut state = self.state.lock().expect("repository lock poisoned");
        match state.rows.get_mut(&step_id) {
            Some(row) => {
                row.step.status = status;
                true
            }
            None => false,
        }
    }
}

impl RoadmapRepository for MemoryRepository {
    fn get_node(&self, step_id: Uuid) -> Result<Option<StepRecord>, RepositoryError> {
        let state = self.state.lock().expect("repository lock poisoned");
        Ok(state.rows.get(&step_id).cloned())
    }

    fn get_manifest(&self, tree_id: Uuid) -> Result<Option<RoadmapManifest>, RepositoryError> {
        let state = self.state.lock().expect("repository lock poisoned");
        let Some(manifest) = state.manifests.get(&tree_id) else {
            return Ok(None);
        };
        let rows: BTreeMap<Uuid, StepStatus> = state
            .rows
            .values()
            .filter(|row| row.tree_id == tree_id)
            .map(|row| (row.step.id, row.step.status))
            .collect();
        verify_rows(manifest, &rows)?;
        Ok(Some(manifest.clone()))
    }

    fn create_manifest(
        &self,
        mut manifest: RoadmapManifest,
        audit: AuditRecord,
    ) -> Result<RoadmapManifest, RepositoryError> {
        let mut state = self.state.lock().expect("repository lock poisoned");
        if state.manifests.contains_key(&manifest.tree_id()) {
            return Err(RepositoryError::TreeExists(manifest.tree_id()));
        }
        manifest.set_version(1);
        state.write_rows(&manifest);
        state.manifests.insert(manifest.tree_id(), manifest.clone());
        state.audit.push(audit);
        Ok(manifest)
    }

    fn save(&self, commit: ManifestCommit) -> Result<SaveOutcome, RepositoryError> {
        let ManifestCommit {
            mut manifest,
            expected_version,
            audit,
            expansion,
        } = commit;
        let tree_id = manifest.tree_id();

        let mut state = self.state.lock().expect("repository lock poisoned");
        let current_version = match state.manifests.get(&tree_id) {
            Some(current) => current.version(),
            None => {
                return Err(RepositoryError::Consistency {
                    tree_id,
                    details: "tree has no persisted manifest".to_string(),
                })
            }
        };
        if current_version != expected_version {
            return Ok(SaveOutcome::Conflict { current_version });
        }

        let version = expected_version + 1;
        manifest.set_version(version);
        state.write_rows(&manifest);
        state.manifests.insert(tree_id, manifest);
        state.audit.push(audit);
        if let Some(record) = expansion {
            state
                .expansions
                .insert((record.tree_id, record.fingerprint.clone()), record);
        }
        Ok(SaveOutcome::Committed { version })
    }

    fn append_audit(&self, record: AuditRecord) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().expect("repository lock poisoned");
        state.audit.push(record);
        Ok(())
    }

    fn find_expansion(
        &self,
        tree_id: Uuid,
        fingerprint: &str,
    ) -> Result<Option<ExpansionRecord>, RepositoryError> {
        let state = self.state.lock().expect("repository lock poisoned");
        Ok(state
            .expansions
            .get(&(tree_id, fingerprint.to_string()))
            .cloned())
    }

    fn audit_log(&self, tree_id: Uuid) -> Result<Vec<AuditRecord>, RepositoryError> {
        let state = self.state.lock().expect("repository lock poisoned");
        let mut records: Vec<AuditRecord> = state
            .audit
            .iter()
            .filter(|r| r.tree_id == tree_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AuditAction, AuditDraft, Phase};

    fn manifest() -> RoadmapManifest {
        let a = RoadmapStep::new("A", "p1");
        let b = RoadmapStep::new("B", "p1").depends_on(a.id);
        RoadmapManifest::new(Uuid::new_v4(), "goal", vec![Phase::new("p1", 1)], vec![a, b]).unwrap()
    }

    fn audit(tree_id: Uuid, action: AuditAction, version: u64) -> AuditRecord {
        AuditDraft::new(action, None, serde_json::Value::Null).into_record(
            tree_id,
            Uuid::new_v4(),
            "test",
            version,
        )
    }

    #[test]
    fn create_then_load_round_trips() {
        let repo = MemoryRepository::new();
        let m = manifest();
        let stored = repo
            .create_manifest(m.clone(), audit(m.tree_id(), AuditAction::Created, 1))
            .unwrap();
        assert_eq!(stored.version(), 1);

        let loaded = repo.get_manifest(m.tree_id()).unwrap().unwrap();
        assert_eq!(loaded, stored);

        let node = repo.get_node(m.steps()[0].id).unwrap().unwrap();
        assert_eq!(node.tree_id, m.tree_id());
        assert_eq!(node.user_id, m.user_id());
    }

    #[test]
    fn save_rejects_stale_version() {
        let repo = MemoryRepository::new();
        let m = manifest();
        let tree_id = m.tree_id();
        let stored = repo
            .create_manifest(m, audit(tree_id, AuditAction::Created, 1))
            .unwrap();

        let first = repo
            .save(ManifestCommit {
                manifest: stored.clone(),
                expected_version: 1,
                audit: audit(tree_id, AuditAction::Completed, 2),
                expansion: None,
            })
            .unwrap();
        assert_eq!(first, SaveOutcome::Committed { version: 2 });

        let stale = repo
            .save(ManifestCommit {
                manifest: stored,
                expected_version: 1,
                audit: audit(tree_id, AuditAction::Completed, 2),
                expansion: None,
            })
            .unwrap();
        assert_eq!(stale, SaveOutcome::Conflict { current_version: 2 });
        assert_eq!(repo.audit_log(tree_id).unwrap().len(), 2);
    }

    #[test]
    fn diverging_row_is_a_consistency_error() {
        let repo = MemoryRepository::new();
        let m = manifest();
        let tree_id = m.tree_id();
        let step_id = m.steps()[0].id;
        repo.create_manifest(m, audit(tree_id, AuditAction::Created, 1))
            .unwrap();

        assert!(repo.overwrite_row(step_id, StepStatus::Completed));
        let err = repo.get_manifest(tree_id).unwrap_err();
        assert!(err.is_consistency());
    }

    #[test]
    fn duplicate_create_is_rejected() {
        let repo = MemoryRepository::new();
        let m = manifest();
        let tree_id = m.tree_id();
        repo.create_manifest(m.clone(), audit(tree_id, AuditAction::Created, 1))
            .unwrap();
        assert!(matches!(
            repo.create_manifest(m, audit(tree_id, AuditAction::Created, 1)),
            Err(RepositoryError::TreeExists(id)) if id == tree_id
        ));
    }
}
