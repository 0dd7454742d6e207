mod schema;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use uuid::Uuid;

use crate::error::RepositoryError;
use crate::graph::RoadmapManifest;
use crate::models::*;
use crate::repository::{
    verify_rows, ManifestCommit, RoadmapRepository, SaveOutcome, StepRecord,
};

/// SQLite-backed [`RoadmapRepository`].
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: PathBuf) -> Result<Self> {
        let parent = path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("Database path has no parent directory"))?;
        std::fs::create_dir_all(parent)?;
        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn default_path() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("", "", "roadmap")
            .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))?;
        Ok(dirs.data_dir().join("roadmap.db"))
    }

    pub fn open_default() -> Result<Self> {
        Self::open(Self::default_path()?)
    }

    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let applied = schema::run_migrations(&conn)?;
        if applied > 0 {
            tracing::info!(applied, "Database schema updated");
        }
        Ok(())
    }

    /// Trees owned by `user_id`, newest first.
    pub fn trees_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<(Uuid, String, u64)>, RepositoryError> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, goal, version FROM roadmap_trees
             WHERE user_id = ? ORDER BY created_at DESC",
        )?;
        let rows = stmt
            .query_map([user_id.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, goal, version)| {
                Ok((parse_uuid(&id, "tree id")?, goal, version as u64))
            })
            .collect()
    }
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Self {
            conn: self.conn.clone(),
        }
    }
}

impl RoadmapRepository for Database {
    fn get_node(&self, step_id: Uuid) -> Result<Option<StepRecord>, RepositoryError> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let row = conn
            .query_row(
                "SELECT tree_id, user_id, step FROM roadmap_steps WHERE id = ?",
                [step_id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        let Some((tree_id, user_id, step)) = row else {
            return Ok(None);
        };
        Ok(Some(StepRecord {
            tree_id: parse_uuid(&tree_id, "tree id")?,
            user_id: parse_uuid(&user_id, "user id")?,
            step: serde_json::from_str(&step)?,
        }))
    }

    fn get_manifest(&self, tree_id: Uuid) -> Result<Option<RoadmapManifest>, RepositoryError> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let row = conn
            .query_row(
                "SELECT version, manifest FROM roadmap_trees WHERE id = ?",
                [tree_id.to_string()],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;

        let Some((version, json)) = row else {
            return Ok(None);
        };
        let manifest: RoadmapManifest = serde_json::from_str(&json)?;
        if manifest.tree_id() != tree_id || manifest.version() != version as u64 {
            return Err(RepositoryError::Consistency {
                tree_id,
                details: format!(
                    "manifest document is at version {} but the tree row is at {}",
                    manifest.version(),
                    version
                ),
            });
        }

        let mut stmt = conn.prepare("SELECT id, status FROM roadmap_steps WHERE tree_id = ?")?;
        let rows = stmt
            .query_map([tree_id.to_string()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut statuses = BTreeMap::new();
        for (id, status) in rows {
            let status = StepStatus::from_str(&status).ok_or_else(|| RepositoryError::Corrupt {
                what: format!("status '{status}' of step {id}"),
            })?;
            statuses.insert(parse_uuid(&id, "step id")?, status);
        }
        verify_rows(&manifest, &statuses)?;

        Ok(Some(manifest))
    }

    fn create_manifest(
        &self,
        mut manifest: RoadmapManifest,
        audit: AuditRecord,
    ) -> Result<RoadmapManifest, RepositoryError> {
        let mut conn = self.conn.lock().expect("database lock poisoned");
        let tx = conn.transaction()?;

        let exists: Option<i64> = tx
            .query_row(
                "SELECT version FROM roadmap_trees WHERE id = ?",
                [manifest.tree_id().to_string()],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(RepositoryError::TreeExists(manifest.tree_id()));
        }

        manifest.set_version(1);
        tx.execute(
            "INSERT INTO roadmap_trees (id, user_id, goal, version, manifest, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            (
                manifest.tree_id().to_string(),
                manifest.user_id().to_string(),
                manifest.goal(),
                manifest.version() as i64,
                serde_json::to_string(&manifest)?,
                manifest.created_at().to_rfc3339(),
                manifest.updated_at().to_rfc3339(),
            ),
        )?;
        write_steps(&tx, &manifest)?;
        insert_audit(&tx, &audit)?;
        tx.commit()?;

        tracing::debug!(tree_id = %manifest.tree_id(), "Created roadmap tree");
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

        let mut conn = self.conn.lock().expect("database lock poisoned");
        let tx = conn.transaction()?;

        let current: Option<i64> = tx
            .query_row(
                "SELECT version FROM roadmap_trees WHERE id = ?",
                [tree_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        let Some(current) = current else {
            return Err(RepositoryError::Consistency {
                tree_id,
                details: "tree has no persisted manifest".to_string(),
            });
        };
        if current as u64 != expected_version {
            return Ok(SaveOutcome::Conflict {
                current_version: current as u64,
            });
        }

        let version = expected_version + 1;
        manifest.set_version(version);
        let updated = tx.execute(
            "UPDATE roadmap_trees SET version = ?, manifest = ?, updated_at = ?
             WHERE id = ? AND version = ?",
            (
                version as i64,
                serde_json::to_string(&manifest)?,
                manifest.updated_at().to_rfc3339(),
                tree_id.to_string(),
                expected_version as i64,
            ),
        )?;
        if updated != 1 {
            return Ok(SaveOutcome::Conflict {
                current_version: current as u64,
            });
        }

        write_steps(&tx, &manifest)?;
        insert_audit(&tx, &audit)?;
        if let Some(record) = &expansion {
            tx.execute(
                "INSERT OR REPLACE INTO expansion_log
                 (tree_id, fingerprint, payload_digest, trigger_step_id, new_step_ids, trace_id, version, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                (
                    record.tree_id.to_string(),
                    &record.fingerprint,
                    &record.payload_digest,
                    record.trigger_step_id.to_string(),
                    serde_json::to_string(&record.new_step_ids)?,
                    record.trace_id.to_string(),
                    record.version as i64,
                    record.created_at.to_rfc3339(),
                ),
            )?;
        }
        tx.commit()?;

        Ok(SaveOutcome::Committed { version })
    }

    fn append_audit(&self, record: AuditRecord) -> Result<(), RepositoryError> {
        let conn = self.conn.lock().expect("database lock poisoned");
        insert_audit(&conn, &record)
    }

    fn find_expansion(
        &self,
        tree_id: Uuid,
        fingerprint: &str,
    ) -> Result<Option<ExpansionRecord>, RepositoryError> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let row = conn
            .query_row(
                "SELECT payload_digest, trigger_step_id, new_step_ids, trace_id, version, created_at
                 FROM expansion_log WHERE tree_id = ? AND fingerprint = ?",
                (tree_id.to_string(), fingerprint),
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((payload_digest, trigger, new_ids, trace_id, version, created_at)) = row else {
            return Ok(None);
        };
        Ok(Some(ExpansionRecord {
            tree_id,
            fingerprint: fingerprint.to_string(),
            payload_digest,
            trigger_step_id: parse_uuid(&trigger, "trigger step id")?,
            new_step_ids: serde_json::from_str(&new_ids)?,
            trace_id: parse_uuid(&trace_id, "trace id")?,
            version: version as u64,
            created_at: parse_datetime(&created_at)?,
        }))
    }

    fn audit_log(&self, tree_id: Uuid) -> Result<Vec<AuditRecord>, RepositoryError> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, trace_id, actor, action, step_id, version, details, created_at
             FROM audit_log WHERE tree_id = ? ORDER BY created_at, rowid",
        )?;
        let rows = stmt
            .query_map([tree_id.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(
                |(id, trace_id, actor, action, step_id, version, details, created_at)| {
                    Ok(AuditRecord {
                        id: parse_uuid(&id, "audit id")?,
                        tree_id,
                        trace_id: parse_uuid(&trace_id, "trace id")?,
                        actor,
                        action: AuditAction::from_str(&action).ok_or_else(|| {
                            RepositoryError::Corrupt {
                                what: format!("audit action '{action}'"),
                            }
                        })?,
                        step_id: step_id
                            .as_deref()
                            .map(|s| parse_uuid(s, "step id"))
                            .transpose()?,
                        version: version as u64,
                        details: serde_json::from_str(&details)?,
                        created_at: parse_datetime(&created_at)?,
                    })
                },
            )
            .collect()
    }
}

/// Rewrite the persisted step rows of a tree from its manifest.
fn write_steps(conn: &Connection, manifest: &RoadmapManifest) -> Result<(), RepositoryError> {
    let tree_id = manifest.tree_id().to_string();
    let user_id = manifest.user_id().to_string();
    let now = Utc::now().to_rfc3339();

    conn.execute("DELETE FROM roadmap_steps WHERE tree_id = ?", [&tree_id])?;
    let mut stmt = conn.prepare(
        "INSERT INTO roadmap_steps
         (id, tree_id, user_id, parent_id, title, status, phase, is_major_phase, step, completed_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )?;
    for step in manifest.steps() {
        stmt.execute((
            step.id.to_string(),
            &tree_id,
            &user_id,
            step.parent_id.map(|id| id.to_string()),
            &step.title,
            step.status.as_str(),
            &step.phase,
            step.is_major_phase as i32,
            serde_json::to_string(step)?,
            step.completed_at.map(|at| at.to_rfc3339()),
            &now,
        ))?;
    }
    Ok(())
}

fn insert_audit(conn: &Connection, record: &AuditRecord) -> Result<(), RepositoryError> {
    conn.execute(
        "INSERT INTO audit_log (id, tree_id, trace_id, actor, action, step_id, version, details, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            record.id.to_string(),
            record.tree_id.to_string(),
            record.trace_id.to_string(),
            &record.actor,
            record.action.as_str(),
            record.step_id.map(|id| id.to_string()),
            record.version as i64,
            serde_json::to_string(&record.details)?,
            record.created_at.to_rfc3339(),
        ),
    )?;
    Ok(())
}

fn parse_uuid(s: &str, what: &str) -> Result<Uuid, RepositoryError> {
    Uuid::parse_str(s).map_err(|_| RepositoryError::Corrupt {
        what: format!("{what} '{s}'"),
    })
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| RepositoryError::Corrupt {
            what: format!("timestamp '{s}'"),
        })
}
