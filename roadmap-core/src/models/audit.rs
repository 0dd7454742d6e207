use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An append-only log entry recording one engine operation against a tree.
///
/// Every committed mutation writes exactly one record in the same database
/// transaction as the manifest. Idempotent no-ops (a repeated completion or a
/// replayed expansion) are recorded too, so the log answers "who asked for
/// what, and when" even when nothing changed. Phase announcements are logged
/// too; they are the durable half of the phase notification ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub tree_id: Uuid,
    /// Correlates the record with the result or error returned to the caller.
    pub trace_id: Uuid,
    /// Who triggered the operation (user id or a component name).
    pub actor: String,
    pub action: AuditAction,
    pub step_id: Option<Uuid>,
    /// Manifest version after the operation.
    pub version: u64,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// What kind of operation an audit record describes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Created,
    Completed,
    DuplicateCompletion,
    Expanded,
    DuplicateExpansion,
    /// A phase was announced complete. Details carry `phase_id`.
    PhaseCompleted,
    /// New steps reopened a phase that had been announced.
    PhaseReopened,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Completed => "completed",
            Self::DuplicateCompletion => "duplicate_completion",
            Self::Expanded => "expanded",
            Self::DuplicateExpansion => "duplicate_expansion",
            Self::PhaseCompleted => "phase_completed",
            Self::PhaseReopened => "phase_reopened",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "completed" => Some(Self::Completed),
            "duplicate_completion" => Some(Self::DuplicateCompletion),
            "expanded" => Some(Self::Expanded),
            "duplicate_expansion" => Some(Self::DuplicateExpansion),
            "phase_completed" => Some(Self::PhaseCompleted),
            "phase_reopened" => Some(Self::PhaseReopened),
            _ => None,
        }
    }
}

/// Audit content produced by a unit of work, before the coordinator stamps it
/// with tree, trace, actor and version.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditDraft {
    pub action: AuditAction,
    pub step_id: Option<Uuid>,
    pub details: serde_json::Value,
}

impl AuditDraft {
    pub fn new(action: AuditAction, step_id: Option<Uuid>, details: serde_json::Value) -> Self {
        Self {
            action,
            step_id,
            details,
        }
    }

    pub fn into_record(
        self,
        tree_id: Uuid,
        trace_id: Uuid,
        actor: &str,
        version: u64,
    ) -> AuditRecord {
        AuditRecord {
            id: Uuid::new_v4(),
            tree_id,
            trace_id,
            actor: actor.to_string(),
            action: self.action,
            step_id: self.step_id,
            version,
            details: self.details,
            created_at: Utc::now(),
        }
    }
}
