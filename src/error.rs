use roadmap_core::{Cycle, GraphError, InputError, RepositoryError};
use thiserror::Error;
use uuid::Uuid;

/// The closed set of failures an engine operation can report.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ErrorKind {
    /// Malformed or unauthorized input. Never retried by the engine.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("circular dependency: {0}")]
    CircularDependency(Cycle<Uuid>),

    /// The manifest and the persisted tree disagree. Never repaired automatically.
    #[error("data consistency violation: {0}")]
    DataConsistency(String),

    #[error("version conflict persisted after {attempts} attempts")]
    ConcurrencyConflict { attempts: u32 },

    #[error("transaction failed: {0}")]
    TransactionFailure(String),

    /// A fingerprint was replayed with a different candidate payload.
    #[error("expansion {fingerprint} was already applied with a different payload")]
    ExpansionConflict { fingerprint: String },
}

impl ErrorKind {
    /// Stable identifier for boundary layers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::CircularDependency(_) => "circular_dependency",
            Self::DataConsistency(_) => "data_consistency",
            Self::ConcurrencyConflict { .. } => "concurrency_conflict",
            Self::TransactionFailure(_) => "transaction_failure",
            Self::ExpansionConflict { .. } => "expansion_conflict",
        }
    }

    /// Whether a caller may reasonably resubmit the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConcurrencyConflict { .. } | Self::TransactionFailure(_)
        )
    }
}

impl From<GraphError> for ErrorKind {
    fn from(err: GraphError) -> Self {
        match err {
            GraphError::Cycle(cycle) => Self::CircularDependency(cycle),
            other => Self::Validation(other.to_string()),
        }
    }
}

impl From<InputError> for ErrorKind {
    fn from(err: InputError) -> Self {
        match err {
            InputError::Graph(graph) => graph.into(),
            other => Self::Validation(other.to_string()),
        }
    }
}

impl From<RepositoryError> for ErrorKind {
    fn from(err: RepositoryError) -> Self {
        if err.is_consistency() {
            Self::DataConsistency(err.to_string())
        } else {
            Self::TransactionFailure(err.to_string())
        }
    }
}

/// An [`ErrorKind`] tagged with the trace id of the operation that failed.
///
/// The same trace id appears on the audit record of the attempt, when one was
/// written.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind} (trace {trace_id})")]
pub struct EngineError {
    pub trace_id: Uuid,
    pub kind: ErrorKind,
}

impl EngineError {
    pub fn new(trace_id: Uuid, kind: impl Into<ErrorKind>) -> Self {
        Self {
            trace_id,
            kind: kind.into(),
        }
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn trace_id(&self) -> Uuid {
        self.trace_id
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graph_cycle_maps_to_circular_dependency() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let cycle = Cycle {
            path: vec![a, b, a],
            closing_edge: (b, a),
        };
        let kind: ErrorKind = GraphError::Cycle(cycle.clone()).into();
        assert_eq!(kind, ErrorKind::CircularDependency(cycle));
        assert!(!kind.is_retryable());
    }

    #[test]
    fn other_graph_errors_are_validation() {
        let kind: ErrorKind = GraphError::StepNotFound(Uuid::nil()).into();
        assert_eq!(kind.code(), "validation");
    }

    #[test]
    fn consistency_errors_are_not_transaction_failures() {
        let kind: ErrorKind = RepositoryError::Consistency {
            tree_id: Uuid::nil(),
            details: "row missing".to_string(),
        }
        .into();
        assert_eq!(kind.code(), "data_consistency");

        let kind: ErrorKind = RepositoryError::Migration(anyhow::anyhow!("disk full")).into();
        assert_eq!(kind.code(), "transaction_failure");
        assert!(kind.is_retryable());
    }

    #[test]
    fn display_carries_trace_id() {
        let trace_id = Uuid::new_v4();
        let err = EngineError::new(trace_id, ErrorKind::ConcurrencyConflict { attempts: 3 });
        assert!(err.to_string().contains(&trace_id.to_string()));
    }
}
