//! Optimistic units of work against a [`RoadmapRepository`].
//!
//! A unit of work runs as load, mutate a private copy, validate, then
//! compare-and-swap on the manifest version. A version conflict discards the
//! copy and starts over from a fresh load, up to `max_attempts` times. Nothing
//! is visible to other readers until the repository accepts the commit, so a
//! failure or timeout at any earlier point leaves no trace except the error.

use std::sync::Arc;

use async_trait::async_trait;
use roadmap_core::models::{AuditDraft, ExpansionRecord};
use roadmap_core::{ManifestCommit, RoadmapManifest, RoadmapRepository, SaveOutcome};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{EngineError, ErrorKind};

/// Identity of one request, stable across its retries.
#[derive(Debug, Clone)]
pub struct TxContext {
    pub trace_id: Uuid,
    pub actor: String,
    pub attempt: u32,
}

/// What a unit of work decided to do with the manifest it was given.
#[derive(Debug)]
pub enum Outcome<T> {
    /// Persist the mutated manifest together with this audit record.
    Commit {
        value: T,
        audit: AuditDraft,
        expansion: Option<ExpansionRecord>,
    },
    /// Nothing changed. Only the audit record is written.
    Noop { value: T, audit: AuditDraft },
}

#[async_trait]
pub trait UnitOfWork: Send + Sync {
    type Output: Send;

    fn name(&self) -> &'static str;

    /// Mutate `manifest` in place. Called again with a fresh copy after a
    /// version conflict, so it must not have effects outside the manifest that
    /// cannot be repeated.
    async fn apply(
        &self,
        manifest: &mut RoadmapManifest,
        ctx: &TxContext,
    ) -> Result<Outcome<Self::Output>, ErrorKind>;
}

/// Result of a unit of work that reached the store.
#[derive(Debug)]
pub struct Committed<T> {
    pub value: T,
    /// The manifest as it now stands in the repository.
    pub manifest: RoadmapManifest,
    pub noop: bool,
    pub attempts: u32,
}

#[derive(Clone)]
pub struct TransactionCoordinator {
    repo: Arc<dyn RoadmapRepository>,
    config: EngineConfig,
}

impl TransactionCoordinator {
    pub fn new(repo: Arc<dyn RoadmapRepository>, config: EngineConfig) -> Self {
        Self { repo, config }
    }

    pub fn repository(&self) -> &Arc<dyn RoadmapRepository> {
        &self.repo
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run `work` against tree `tree_id` within the configured timeout.
    pub async fn run<W: UnitOfWork>(
        &self,
        tree_id: Uuid,
        trace_id: Uuid,
        actor: &str,
        work: &W,
    ) -> Result<Committed<W::Output>, EngineError> {
        let timeout = self.config.transaction_timeout;
        match tokio::time::timeout(timeout, self.attempts(tree_id, trace_id, actor, work)).await {
            Ok(result) => result.map_err(|kind| EngineError::new(trace_id, kind)),
            Err(_) => {
                tracing::error!(%trace_id, %tree_id, work = work.name(), "Transaction timed out");
                Err(EngineError::new(
                    trace_id,
                    ErrorKind::TransactionFailure(format!(
                        "{} did not finish within {}ms",
                        work.name(),
                        timeout.as_millis()
                    )),
                ))
            }
        }
    }

    async fn attempts<W: UnitOfWork>(
        &self,
        tree_id: Uuid,
        trace_id: Uuid,
        actor: &str,
        work: &W,
    ) -> Result<Committed<W::Output>, ErrorKind> {
        let max_attempts = self.config.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            let mut manifest = self
                .repo
                .get_manifest(tree_id)?
                .ok_or_else(|| ErrorKind::Validation(format!("tree {tree_id} not found")))?;
            let expected_version = manifest.version();
            let ctx = TxContext {
                trace_id,
                actor: actor.to_string(),
                attempt,
            };

            match work.apply(&mut manifest, &ctx).await? {
                Outcome::Noop { value, audit } => {
                    let record = audit.into_record(tree_id, trace_id, actor, expected_version);
                    self.repo.append_audit(record)?;
                    tracing::info!(
                        %trace_id, %tree_id, version = expected_version,
                        "{} had nothing to change", work.name()
                    );
                    return Ok(Committed {
                        value,
                        manifest,
                        noop: true,
                        attempts: attempt,
                    });
                }
                Outcome::Commit {
                    value,
                    audit,
                    expansion,
                } => {
                    manifest.validate()?;
                    let version = expected_version + 1;
                    let expansion = expansion.map(|record| ExpansionRecord {
                        version,
                        trace_id,
                        ..record
                    });
                    let commit = ManifestCommit {
                        manifest: manifest.clone(),
                        expected_version,
                        audit: audit.into_record(tree_id, trace_id, actor, version),
                        expansion,
                    };

                    match self.repo.save(commit)? {
                        SaveOutcome::Committed { version } => {
                            manifest.set_version(version);
                            tracing::info!(
                                %trace_id, %tree_id, version, attempt,
                                "{} committed", work.name()
                            );
                            return Ok(Committed {
                                value,
                                manifest,
                                noop: false,
                                attempts: attempt,
                            });
                        }
                        SaveOutcome::Conflict { current_version } => {
                            tracing::warn!(
                                %trace_id, %tree_id, attempt, expected_version, current_version,
                                "{} lost a version race", work.name()
                            );
                            if attempt < max_attempts {
                                tokio::time::sleep(self.config.retry_backoff * attempt).await;
                            }
                        }
                    }
                }
            }
        }

        Err(ErrorKind::ConcurrencyConflict {
            attempts: max_attempts,
        })
    }
}
